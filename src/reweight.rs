//! MBAR reweighting of replica-exchange data onto a temperature ladder.

use crate::energies::{ProductionData, ProductionWindow, ReplicaEnergies, StateLabels};
use crate::errors::*;
use crate::ladder::TemperatureLadder;
use crate::mbar::{MBar, MultipleExpectations, UncertaintyMethod};
use crate::units::{kb, Temperature};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use tracing::{debug, instrument};

/// Settings shared by every reweighting calculation
#[derive(Builder, Debug, Clone, PartialEq)]
#[builder(
    pattern = "owned",
    build_fn(
        validate = "Self::validate",
        name = "build_inner",
        private,
        error = "ThermoError"
    )
)]
pub struct ReweightingSettings {
    /// Temperatures of the replicas, in replica order
    temperatures: Vec<Temperature>,

    /// Evenly spaced temperatures inserted between each pair of sampled temperatures
    #[builder(default = "0")]
    num_intermediate_states: usize,

    /// First production frame
    #[builder(default = "0")]
    frame_begin: usize,

    /// One past the last production frame; the production period runs to the end if unset
    #[builder(default, setter(strip_option))]
    frame_end: Option<usize>,

    /// Stride between decorrelated frames
    #[builder(default = "1")]
    sample_spacing: usize,

    /// Relative tolerance for the MBAR free energies
    #[builder(default = "1.0e-12")]
    relative_tolerance: f64,

    /// Iteration budget for the MBAR solver
    #[builder(default = "10_000")]
    maximum_iterations: usize,

    /// How the MBAR asymptotic covariance is computed
    #[builder(default)]
    uncertainty_method: UncertaintyMethod,
}

impl ReweightingSettingsBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(temperatures) = &self.temperatures {
            if temperatures.is_empty() {
                return Err("the temperature list is empty".to_string());
            }
        }
        if self.sample_spacing == Some(0) {
            return Err("sample_spacing must be at least 1".to_string());
        }
        if let Some(Some(end)) = self.frame_end {
            let begin = self.frame_begin.unwrap_or(0);
            if end <= begin {
                return Err(format!("frame_end {} must come after frame_begin {}", end, begin));
            }
        }
        Ok(())
    }

    /// Build and check the settings
    pub fn build(self) -> Result<ReweightingSettings> {
        let settings = self.build_inner()?;
        // ladder construction checks the temperatures
        settings.ladder()?;
        Ok(settings)
    }
}

impl ReweightingSettings {
    /// Get a new builder for the `ReweightingSettings` struct.
    pub fn builder() -> ReweightingSettingsBuilder {
        ReweightingSettingsBuilder::default()
    }

    /// Replica temperatures
    pub fn temperatures(&self) -> &[Temperature] {
        &self.temperatures
    }

    /// Intermediate states per gap
    pub fn num_intermediate_states(&self) -> usize {
        self.num_intermediate_states
    }

    /// The production window
    pub fn window(&self) -> ProductionWindow {
        let window = ProductionWindow::new(self.frame_begin, self.sample_spacing);
        match self.frame_end {
            Some(end) => window.ending_at(end),
            None => window,
        }
    }

    /// The temperature ladder, without probe states
    pub fn ladder(&self) -> Result<TemperatureLadder> {
        TemperatureLadder::new(&self.temperatures, self.num_intermediate_states)
    }

    /// Restrict raw replica data to the production window and line the labels up with it
    pub fn align(&self, energies: &ReplicaEnergies, labels: &StateLabels) -> Result<ProductionData> {
        let (data, _) = ProductionData::align(energies, labels, self.window())?;
        Ok(data)
    }
}

/// Which potential energy function a state or energy refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameters {
    /// The force field the replicas were simulated with
    Simulated,
    /// A second force field the production frames were re-evaluated with after the run
    Reevaluated,
}

/// Replica-exchange samples reweighted to every state of a temperature ladder
#[derive(Debug)]
pub struct Reweighting {
    ladder: TemperatureLadder,
    mbar: MBar,
    /// Potential energy of each sample in kJ/mol
    potential_n: Array1<f64>,
    /// Potential energy of each sample under re-evaluated parameters, in kJ/mol
    reevaluated_n: Option<Array1<f64>>,
    /// Configurational state of each sample
    labels_n: Array1<usize>,
    n_frames: usize,
    n_replicas: usize,
}

impl Reweighting {
    /// Solve MBAR for every state of `ladder`.
    ///
    /// Reduced energies at each ladder temperature are the energies evaluated at the first
    /// sampled temperature rescaled by $\beta_k / \beta_0$. Only the sampled ladder positions
    /// carry samples.
    #[instrument(level = "debug", skip_all, fields(states = ladder.n_states()))]
    pub fn new(
        data: &ProductionData,
        ladder: TemperatureLadder,
        settings: &ReweightingSettings,
    ) -> Result<Self> {
        Self::solve(data, ladder, settings, None)
    }

    /// Solve MBAR for every state of `ladder` under the simulated parameters, and again under
    /// parameters that were never simulated.
    ///
    /// `potential` is the potential energy in kJ/mol of every production frame re-evaluated
    /// with the new parameters, shaped `[frame, replica]` like the aligned labels. The
    /// re-evaluated states carry no samples; ladder state `k` under the new parameters is MBAR
    /// state `ladder.n_states() + k`.
    #[instrument(level = "debug", skip_all, fields(states = 2 * ladder.n_states()))]
    pub fn with_reevaluated(
        data: &ProductionData,
        ladder: TemperatureLadder,
        settings: &ReweightingSettings,
        potential: ArrayView2<'_, f64>,
    ) -> Result<Self> {
        if potential.dim() != (data.n_frames(), data.n_replicas()) {
            return Err(ThermoError::InputShapeMismatch(format!(
                "re-evaluated energies have shape {:?}, expected ({}, {})",
                potential.dim(),
                data.n_frames(),
                data.n_replicas()
            )));
        }
        let potential_n = potential.t().iter().copied().collect();
        Self::solve(data, ladder, settings, Some(potential_n))
    }

    fn solve(
        data: &ProductionData,
        ladder: TemperatureLadder,
        settings: &ReweightingSettings,
        reevaluated_n: Option<Array1<f64>>,
    ) -> Result<Self> {
        if data.n_replicas() != ladder.n_sampled() {
            return Err(ThermoError::InputShapeMismatch(format!(
                "{} replicas but {} sampled temperatures",
                data.n_replicas(),
                ladder.n_sampled()
            )));
        }

        let u_ref = data.reference_row(0)?;
        let t_ref = ladder.kelvin()[0];
        let temperatures = ladder.all_kelvin();
        let n_states = temperatures.len();
        let blocks = if reevaluated_n.is_some() { 2 } else { 1 };

        let mut u_kn = Array2::zeros((blocks * n_states, u_ref.len()));
        for (k, &t) in temperatures.iter().enumerate() {
            u_kn.row_mut(k).assign(&(&u_ref * (t_ref / t)));
            if let Some(potential) = &reevaluated_n {
                u_kn.row_mut(n_states + k).assign(&(potential / (kb() * t)));
            }
        }

        let mut n_k = Array1::zeros(blocks * n_states);
        for &i in ladder.sampled_indices() {
            n_k[i] = data.n_frames();
        }

        let mbar = MBar::builder()
            .u_kn(u_kn)
            .n_k(n_k)
            .relative_tolerance(settings.relative_tolerance)
            .maximum_iterations(settings.maximum_iterations)
            .uncertainty_method(settings.uncertainty_method)
            .build()?;
        debug!(iterations = mbar.iterations(), blocks, "reweighted onto ladder");

        Ok(Self {
            potential_n: u_ref * (kb() * t_ref),
            reevaluated_n,
            labels_n: data.flat_labels(),
            n_frames: data.n_frames(),
            n_replicas: data.n_replicas(),
            ladder,
            mbar,
        })
    }

    /// Reweight aligned data onto the settings' ladder
    pub fn from_settings(data: &ProductionData, settings: &ReweightingSettings) -> Result<Self> {
        Self::new(data, settings.ladder()?, settings)
    }

    /// The ladder samples were reweighted onto
    pub fn ladder(&self) -> &TemperatureLadder {
        &self.ladder
    }

    /// The solved estimator
    pub fn mbar(&self) -> &MBar {
        &self.mbar
    }

    /// Reduced energies of every sample at ladder state `k`
    pub fn state_energies(&self, k: usize) -> ArrayView1<'_, f64> {
        self.mbar.u_kn().row(k)
    }

    /// Potential energy of every sample, in kJ/mol
    pub fn potential_energies(&self) -> &Array1<f64> {
        &self.potential_n
    }

    /// Whether a re-evaluated parameter set was reweighted alongside the simulated one
    pub fn has_reevaluated(&self) -> bool {
        self.reevaluated_n.is_some()
    }

    /// MBAR state index of ladder state `k` under `parameters`
    pub fn state_index(&self, parameters: Parameters, k: usize) -> Result<usize> {
        if k >= self.ladder.n_states() {
            return Err(ThermoError::ArrayLengthMismatch(k, self.ladder.n_states()));
        }
        match parameters {
            Parameters::Simulated => Ok(k),
            Parameters::Reevaluated if self.has_reevaluated() => Ok(self.ladder.n_states() + k),
            Parameters::Reevaluated => Err(ThermoError::InvalidConfiguration(
                "no re-evaluated energies were reweighted".to_string(),
            )),
        }
    }

    /// Potential energy of every sample under `parameters`, in kJ/mol
    pub fn potential_energies_at(&self, parameters: Parameters) -> Result<&Array1<f64>> {
        match parameters {
            Parameters::Simulated => Ok(&self.potential_n),
            Parameters::Reevaluated => self.reevaluated_n.as_ref().ok_or_else(|| {
                ThermoError::InvalidConfiguration(
                    "no re-evaluated energies were reweighted".to_string(),
                )
            }),
        }
    }

    /// Effective number of samples at every ladder temperature under `parameters`, probes
    /// excluded
    pub fn effective_samples(&self, parameters: Parameters) -> Result<Vec<f64>> {
        let offset = self.state_index(parameters, 0)?;
        let n_eff = self.mbar.n_eff();
        Ok((0..self.ladder.len()).map(|k| n_eff[offset + k]).collect())
    }

    /// Configurational state of every sample
    pub fn labels(&self) -> &Array1<usize> {
        &self.labels_n
    }

    /// Flatten a `[frame, replica]` per-frame quantity into sample order
    pub fn per_sample(&self, values: ArrayView2<'_, f64>) -> Result<Array1<f64>> {
        if values.dim() != (self.n_frames, self.n_replicas) {
            return Err(ThermoError::InputShapeMismatch(format!(
                "per-frame values have shape {:?}, expected ({}, {})",
                values.dim(),
                self.n_frames,
                self.n_replicas
            )));
        }
        Ok(values.t().iter().copied().collect())
    }

    /// Evaluate `observable` at every ladder temperature, excluding probe states.
    pub fn evaluate<O: StateObservable>(&self, observable: &O) -> Result<Vec<O::Output>> {
        self.evaluate_at(observable, Parameters::Simulated)
    }

    /// Evaluate `observable` at every ladder temperature under `parameters`
    pub fn evaluate_at<O: StateObservable>(
        &self,
        observable: &O,
        parameters: Parameters,
    ) -> Result<Vec<O::Output>> {
        let offset = self.state_index(parameters, 0)?;
        let a_in = observable.observables(self)?;
        self.ladder
            .kelvin()
            .iter()
            .enumerate()
            .map(|(k, &t)| {
                let expectations = self.mbar.compute_multiple_expectations(
                    a_in.view(),
                    self.state_energies(offset + k),
                    true,
                )?;
                observable.derive(t, &expectations)
            })
            .collect()
    }
}

/// A thermodynamic quantity computed from expectations of per-sample observables at one
/// temperature.
pub trait StateObservable {
    /// Value produced at each temperature
    type Output;

    /// `[observable, sample]` values fed to MBAR
    fn observables(&self, reweighting: &Reweighting) -> Result<Array2<f64>>;

    /// Combine the expectations at temperature `t` (kelvin), and their covariance, into the
    /// output
    fn derive(&self, t: f64, expectations: &MultipleExpectations) -> Result<Self::Output>;
}

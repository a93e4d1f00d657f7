//! Heat capacity across a temperature ladder, and the melting transition it reveals.

use crate::energies::ProductionData;
use crate::errors::*;
use crate::ladder::TemperatureLadder;
use crate::mbar::MultipleExpectations;
use crate::reweight::{Parameters, Reweighting, ReweightingSettings, StateObservable};
use crate::spline::NaturalSpline;
use crate::units::{kb, Entropy, EntropyUnit, ObservableSeries, Temperature};
use ndarray::{Array2, ArrayView2, Axis};
use tracing::{debug, instrument};

/// How the heat capacity is estimated from reweighted energies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeatCapacityMethod {
    /// Central difference of the mean energy between probe states at $T \pm dT$
    FiniteDifference,
    /// Energy fluctuations, $(\langle U^2 \rangle - \langle U \rangle^2) / k_B T^2$
    Fluctuation,
}

impl Default for HeatCapacityMethod {
    fn default() -> Self {
        Self::FiniteDifference
    }
}

/// Settings for heat capacity calculations
#[derive(Builder, Debug, Clone, Copy, PartialEq)]
#[builder(
    pattern = "owned",
    build_fn(
        validate = "Self::validate",
        name = "build_inner",
        private,
        error = "ThermoError"
    )
)]
pub struct HeatCapacitySettings {
    /// Probe offset as a fraction of the ladder spacing
    #[builder(default = "0.05")]
    frac_dt: f64,

    /// Estimator
    #[builder(default)]
    method: HeatCapacityMethod,

    /// Points in the spline grid used to locate the peak
    #[builder(default = "1000")]
    peak_grid_points: usize,
}

impl HeatCapacitySettingsBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(frac_dt) = self.frac_dt {
            if !(frac_dt > 0.0 && frac_dt < 1.0) {
                return Err(format!(
                    "frac_dT must lie strictly between 0 and 1, not {}",
                    frac_dt
                ));
            }
        }
        if let Some(points) = self.peak_grid_points {
            if points < 3 {
                return Err(format!("peak_grid_points must be at least 3, not {}", points));
            }
        }
        Ok(())
    }

    /// Build and check the settings
    pub fn build(self) -> Result<HeatCapacitySettings> {
        self.build_inner()
    }
}

impl Default for HeatCapacitySettings {
    fn default() -> Self {
        Self {
            frac_dt: 0.05,
            method: HeatCapacityMethod::default(),
            peak_grid_points: 1000,
        }
    }
}

impl HeatCapacitySettings {
    /// Get a new builder for the `HeatCapacitySettings` struct.
    pub fn builder() -> HeatCapacitySettingsBuilder {
        HeatCapacitySettingsBuilder::default()
    }

    /// Probe offset as a fraction of the ladder spacing
    pub fn frac_dt(&self) -> f64 {
        self.frac_dt
    }

    /// Estimator
    pub fn method(&self) -> HeatCapacityMethod {
        self.method
    }

    /// Points in the peak-finding grid
    pub fn peak_grid_points(&self) -> usize {
        self.peak_grid_points
    }

    fn ladder(&self, settings: &ReweightingSettings) -> Result<TemperatureLadder> {
        match self.method {
            HeatCapacityMethod::FiniteDifference => settings.ladder()?.with_probes(self.frac_dt),
            HeatCapacityMethod::Fluctuation => settings.ladder(),
        }
    }

    /// Reweight `data` onto the ladder this estimator needs
    pub fn reweight(
        &self,
        data: &ProductionData,
        settings: &ReweightingSettings,
    ) -> Result<Reweighting> {
        Reweighting::new(data, self.ladder(settings)?, settings)
    }

    /// Reweight `data` onto the ladder this estimator needs, under the simulated parameters
    /// and under the re-evaluated `potential` (kJ/mol, `[frame, replica]`)
    pub fn reweight_reevaluated(
        &self,
        data: &ProductionData,
        settings: &ReweightingSettings,
        potential: ArrayView2<'_, f64>,
    ) -> Result<Reweighting> {
        Reweighting::with_reevaluated(data, self.ladder(settings)?, settings, potential)
    }
}

/// First and second moments of the potential energy under one parameter set
#[derive(Debug, Clone, Copy)]
struct EnergyFluctuation(Parameters);

impl StateObservable for EnergyFluctuation {
    /// `(Cv, σ)` in kJ/(mol K)
    type Output = (f64, f64);

    fn observables(&self, reweighting: &Reweighting) -> Result<Array2<f64>> {
        let u = reweighting.potential_energies_at(self.0)?;
        let u2 = u.mapv(|u| u * u);
        ndarray::stack(Axis(0), &[u.view(), u2.view()])
            .map_err(|e| ThermoError::Numerical(e.to_string()))
    }

    fn derive(&self, t: f64, expectations: &MultipleExpectations) -> Result<(f64, f64)> {
        let cov = expectations.covariance.as_ref().ok_or_else(|| {
            ThermoError::Numerical("energy moment covariance was not computed".to_string())
        })?;
        let (u, u2) = (expectations.mu[0], expectations.mu[1]);
        let scale = (kb() * t * t).recip();
        let cv = (u2 - u * u) * scale;
        // gradient of Cv with respect to (<U>, <U^2>) is (-2<U>, 1) * scale
        let var = 4.0 * u * u * cov[[0, 0]] - 4.0 * u * cov[[0, 1]] + cov[[1, 1]];
        Ok((cv, scale * var.max(0.0).sqrt()))
    }
}

/// Heat capacity at every ladder temperature
#[derive(Debug, Clone, PartialEq)]
pub struct HeatCapacity {
    /// Ladder temperatures in kelvin
    temperatures: Vec<f64>,
    cv: ObservableSeries<EntropyUnit>,
    /// Effective number of samples behind each point
    n_eff: Vec<f64>,
    peak_grid_points: usize,
}

impl HeatCapacity {
    /// Reweight `data` and estimate the heat capacity at every ladder temperature.
    ///
    /// The potential energy of each sample is $U = k_B T_0 u_0$, its reduced energy at the
    /// first sampled temperature scaled back to kJ/mol.
    pub fn compute(
        data: &ProductionData,
        settings: &ReweightingSettings,
        cv_settings: &HeatCapacitySettings,
    ) -> Result<Self> {
        let reweighting = cv_settings.reweight(data, settings)?;
        Self::from_reweighting(&reweighting, cv_settings)
    }

    /// Estimate the heat capacity from an existing reweighting.
    ///
    /// `FiniteDifference` needs a ladder with probe states.
    pub fn from_reweighting(
        reweighting: &Reweighting,
        cv_settings: &HeatCapacitySettings,
    ) -> Result<Self> {
        Self::at_parameters(reweighting, cv_settings, Parameters::Simulated)
    }

    /// Estimate the heat capacity under `parameters` from an existing reweighting
    #[instrument(level = "debug", skip(reweighting, cv_settings))]
    pub fn at_parameters(
        reweighting: &Reweighting,
        cv_settings: &HeatCapacitySettings,
        parameters: Parameters,
    ) -> Result<Self> {
        let ladder = reweighting.ladder();
        let offset = reweighting.state_index(parameters, 0)?;
        let (values, uncertainties): (Vec<f64>, Vec<f64>) = match cv_settings.method {
            HeatCapacityMethod::Fluctuation => reweighting
                .evaluate_at(&EnergyFluctuation(parameters), parameters)?
                .into_iter()
                .unzip(),
            HeatCapacityMethod::FiniteDifference => {
                if !ladder.has_probes() {
                    return Err(ThermoError::InvalidConfiguration(
                        "finite difference heat capacity needs probe states".to_string(),
                    ));
                }
                let energies = reweighting
                    .mbar()
                    .compute_expectations(reweighting.potential_energies_at(parameters)?.view())?;
                let all = ladder.all_kelvin();
                let mut values = Vec::with_capacity(ladder.len());
                let mut uncertainties = Vec::with_capacity(ladder.len());
                for i in 0..ladder.len() {
                    let (lo, hi) = ladder.probe_indices(i).ok_or_else(|| {
                        ThermoError::InvalidConfiguration(format!("no probes for state {}", i))
                    })?;
                    let dt = all[hi] - all[lo];
                    let (lo, hi) = (offset + lo, offset + hi);
                    let c = &energies.covariance;
                    let var = c[[hi, hi]] + c[[lo, lo]] - 2.0 * c[[hi, lo]];
                    values.push((energies.mu[hi] - energies.mu[lo]) / dt);
                    uncertainties.push(var.max(0.0).sqrt() / dt);
                }
                (values, uncertainties)
            }
        };
        debug!(points = ladder.len(), "computed heat capacity");

        Ok(Self {
            temperatures: ladder.kelvin().to_vec(),
            cv: ObservableSeries::internal(values, uncertainties),
            n_eff: reweighting.effective_samples(parameters)?,
            peak_grid_points: cv_settings.peak_grid_points,
        })
    }

    pub(crate) fn from_parts(
        temperatures: Vec<f64>,
        cv: ObservableSeries<EntropyUnit>,
        n_eff: Vec<f64>,
        peak_grid_points: usize,
    ) -> Self {
        Self {
            temperatures,
            cv,
            n_eff,
            peak_grid_points,
        }
    }

    /// Ladder temperatures
    pub fn temperatures(&self) -> Vec<Temperature> {
        self.temperatures
            .iter()
            .map(|&t| Temperature::from_internal(t))
            .collect()
    }

    /// Ladder temperatures in kelvin
    pub fn kelvin(&self) -> &[f64] {
        &self.temperatures
    }

    /// Heat capacity and its uncertainty at each ladder temperature
    pub fn series(&self) -> &ObservableSeries<EntropyUnit> {
        &self.cv
    }

    /// Effective number of samples at each ladder temperature
    pub fn effective_samples(&self) -> &[f64] {
        &self.n_eff
    }

    /// Melting temperature, peak height and width of the heat capacity curve, located on the
    /// configured spline grid
    pub fn peak(&self) -> Result<CvPeak> {
        CvPeak::from_curve(&self.temperatures, &self.cv.values, self.peak_grid_points)
    }
}

/// Scalars describing the heat capacity peak
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CvPeak {
    /// Temperature of the maximum
    pub melting_temperature: Temperature,
    /// Maximum minus minimum of the curve
    pub height: Entropy,
    /// Full width at half of `height`; `None` if the curve does not fall that far on both
    /// sides
    pub fwhm: Option<Temperature>,
}

impl CvPeak {
    /// Locate the peak of a heat capacity curve given in kJ/(mol K) at temperatures in kelvin.
    ///
    /// The curve is interpolated with a natural cubic spline on `grid_points` evenly spaced
    /// temperatures; half-height crossings are interpolated linearly between grid points.
    pub fn from_curve(temperatures: &[f64], cv: &[f64], grid_points: usize) -> Result<Self> {
        if grid_points < 3 {
            return Err(ThermoError::InvalidConfiguration(format!(
                "peak grid needs at least 3 points, not {}",
                grid_points
            )));
        }
        let spline = NaturalSpline::fit(temperatures, cv)?;
        let (grid, values) = spline.sample_grid(grid_points);

        let (peak, max) = values
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best });
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let half = min + 0.5 * (max - min);

        let crossing = |a: usize, b: usize| {
            let (va, vb) = (values[a], values[b]);
            grid[a] + (half - va) / (vb - va) * (grid[b] - grid[a])
        };
        let left = (1..=peak)
            .rev()
            .find(|&i| values[i - 1] < half)
            .map(|i| crossing(i - 1, i));
        let right = (peak..grid.len() - 1)
            .find(|&i| values[i + 1] < half)
            .map(|i| crossing(i, i + 1));

        let fwhm = match (left, right) {
            (Some(l), Some(r)) => Some(Temperature::from_internal(r - l)),
            _ => None,
        };

        Ok(Self {
            melting_temperature: Temperature::from_internal(grid[peak]),
            height: Entropy::from_internal(max - min),
            fwhm,
        })
    }
}

/// Heat capacity at every ladder temperature
pub fn heat_capacity(
    data: &ProductionData,
    settings: &ReweightingSettings,
    cv_settings: &HeatCapacitySettings,
) -> Result<HeatCapacity> {
    HeatCapacity::compute(data, settings, cv_settings)
}

/// Heat capacity under the simulated parameters and under parameters that were only
/// re-evaluated on the production frames
#[derive(Debug, Clone, PartialEq)]
pub struct ReevaluatedHeatCapacity {
    /// Under the simulated parameters
    pub simulated: HeatCapacity,
    /// Under the re-evaluated parameters
    pub reevaluated: HeatCapacity,
}

/// Heat capacity at every ladder temperature for both the simulated parameters and the
/// re-evaluated `potential` (kJ/mol, `[frame, replica]`, aligned with the production frames)
pub fn heat_capacity_reevaluated(
    data: &ProductionData,
    settings: &ReweightingSettings,
    cv_settings: &HeatCapacitySettings,
    potential: ArrayView2<'_, f64>,
) -> Result<ReevaluatedHeatCapacity> {
    let reweighting = cv_settings.reweight_reevaluated(data, settings, potential)?;
    Ok(ReevaluatedHeatCapacity {
        simulated: HeatCapacity::at_parameters(&reweighting, cv_settings, Parameters::Simulated)?,
        reevaluated: HeatCapacity::at_parameters(&reweighting, cv_settings, Parameters::Reevaluated)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsystems::{GammaEnergyModel, TwoStateModel};
    use crate::units::{kelvin, TemperatureUnit};

    fn settings(temps: &[f64], m: usize) -> ReweightingSettings {
        ReweightingSettings::builder()
            .temperatures(temps.iter().copied().map(kelvin).collect())
            .num_intermediate_states(m)
            .build()
            .unwrap()
    }

    fn with_method(method: HeatCapacityMethod) -> HeatCapacitySettings {
        HeatCapacitySettings::builder().method(method).build().unwrap()
    }

    #[test]
    fn build_settings() {
        let cv = HeatCapacitySettings::builder().build().unwrap();
        assert_eq!(cv, HeatCapacitySettings::default());
        assert_eq!(cv.frac_dt(), 0.05);
        assert_eq!(cv.method(), HeatCapacityMethod::FiniteDifference);
        assert!(HeatCapacitySettings::builder().frac_dt(0.0).build().is_err());
        assert!(HeatCapacitySettings::builder().frac_dt(1.0).build().is_err());
    }

    #[test]
    fn two_state_heat_capacity() {
        let temps = [kelvin(300.0), kelvin(350.0)];
        let model = TwoStateModel::from_ratios(temps[0], 3.0, temps[1], 0.5).unwrap();
        let (energies, labels) = model.exact_replicas(&temps, &[450, 200], 600).unwrap();
        let data = ProductionData::new(energies, labels).unwrap();
        let settings = settings(&[300.0, 350.0], 4);

        let fluctuation =
            heat_capacity(&data, &settings, &with_method(HeatCapacityMethod::Fluctuation)).unwrap();
        let difference =
            heat_capacity(&data, &settings, &with_method(HeatCapacityMethod::FiniteDifference))
                .unwrap();
        assert_eq!(fluctuation.kelvin(), difference.kelvin());

        for (i, &t) in fluctuation.kelvin().iter().enumerate() {
            let exact = model.heat_capacity(kelvin(t));
            let f = fluctuation.series().values[i];
            let d = difference.series().values[i];
            assert!((f - exact).abs() < 1e-6 * exact, "{} K: {} vs {}", t, f, exact);
            assert!((d - exact).abs() < 5e-3 * exact, "{} K: {} vs {}", t, d, exact);
            assert!(fluctuation.series().uncertainties[i] > 0.0);
            assert!(difference.series().uncertainties[i] > 0.0);
        }
    }

    #[test]
    fn constant_heat_capacity_model() {
        let model = GammaEnergyModel::new(30.0).unwrap();
        let temps = [300.0, 320.0, 340.0];
        let (energies, labels) = model
            .sample_replicas(&temps.map(kelvin), 4000, 23)
            .unwrap();
        let data = ProductionData::new(energies, labels).unwrap();
        let settings = settings(&temps, 1);
        let exact = model.heat_capacity();

        for method in [HeatCapacityMethod::FiniteDifference, HeatCapacityMethod::Fluctuation] {
            let cv = heat_capacity(&data, &settings, &with_method(method)).unwrap();
            assert_eq!(cv.kelvin().len(), 5);
            for (value, sigma) in cv.series().values.iter().zip(&cv.series().uncertainties) {
                assert!(
                    (value - exact).abs() < 5.0 * sigma + 0.1 * exact,
                    "{:?}: {} vs {}",
                    method,
                    value,
                    exact
                );
            }
        }
    }

    #[test]
    fn finite_difference_needs_probes() {
        let model = GammaEnergyModel::new(10.0).unwrap();
        let (energies, labels) = model
            .sample_replicas(&[kelvin(300.0), kelvin(310.0)], 50, 1)
            .unwrap();
        let data = ProductionData::new(energies, labels).unwrap();
        let reweighting = Reweighting::from_settings(&data, &settings(&[300.0, 310.0], 0)).unwrap();
        assert!(matches!(
            HeatCapacity::from_reweighting(
                &reweighting,
                &with_method(HeatCapacityMethod::FiniteDifference)
            ),
            Err(ThermoError::InvalidConfiguration(_))
        ));
    }

    /// Potential energies in kJ/mol, `[frame, replica]`, scaled by `scale` and shifted by
    /// `shift`
    fn transformed_potential(data: &ProductionData, t0: f64, scale: f64, shift: f64) -> Array2<f64> {
        let u_ref = data.reference_row(0).unwrap();
        let n_frames = data.n_frames();
        Array2::from_shape_fn((n_frames, data.n_replicas()), |(n, k)| {
            scale * u_ref[k * n_frames + n] * kb() * t0 + shift
        })
    }

    #[test]
    fn shifted_parameters_keep_the_heat_capacity() {
        let temps = [kelvin(300.0), kelvin(350.0)];
        let model = TwoStateModel::from_ratios(temps[0], 3.0, temps[1], 0.5).unwrap();
        let (energies, labels) = model.exact_replicas(&temps, &[450, 200], 600).unwrap();
        let data = ProductionData::new(energies, labels).unwrap();
        let settings = settings(&[300.0, 350.0], 2);
        let potential = transformed_potential(&data, 300.0, 1.0, -4.0);

        for method in [HeatCapacityMethod::FiniteDifference, HeatCapacityMethod::Fluctuation] {
            let both =
                heat_capacity_reevaluated(&data, &settings, &with_method(method), potential.view())
                    .unwrap();
            let plain = heat_capacity(&data, &settings, &with_method(method)).unwrap();
            assert_eq!(both.simulated.kelvin(), plain.kelvin());
            for i in 0..4 {
                let (sim, new) = (both.simulated.series(), both.reevaluated.series());
                assert!((sim.values[i] - plain.series().values[i]).abs() < 1e-8);
                assert!((new.values[i] - sim.values[i]).abs() < 1e-8 * sim.values[i].abs());
                assert!((new.uncertainties[i] - sim.uncertainties[i]).abs() < 1e-6 * sim.uncertainties[i]);
                let n_eff = both.reevaluated.effective_samples()[i];
                assert!((n_eff - both.simulated.effective_samples()[i]).abs() < 1e-6 * n_eff);
            }
        }
    }

    #[test]
    fn scaled_parameters_with_constant_heat_capacity() {
        // U ~ Gamma(a, kT) has Cv = a kB; scaling U by a constant leaves that unchanged
        let model = GammaEnergyModel::new(30.0).unwrap();
        let temps = [300.0, 320.0];
        let (energies, labels) = model
            .sample_replicas(&temps.map(kelvin), 3000, 41)
            .unwrap();
        let data = ProductionData::new(energies, labels).unwrap();
        let settings = settings(&temps, 1);
        let potential = transformed_potential(&data, 300.0, 1.01, 0.0);
        let exact = model.heat_capacity();

        let both = heat_capacity_reevaluated(
            &data,
            &settings,
            &with_method(HeatCapacityMethod::Fluctuation),
            potential.view(),
        )
        .unwrap();
        let cv = both.reevaluated.series();
        assert_eq!(cv.len(), 3);
        for (i, (value, sigma)) in cv.values.iter().zip(&cv.uncertainties).enumerate() {
            assert!((value - exact).abs() < 5.0 * sigma + 0.1 * exact, "{} vs {}", value, exact);
            let n_eff = both.reevaluated.effective_samples()[i];
            assert!(n_eff > 1.0 && n_eff <= 6000.0 + 1e-9);
        }
    }

    #[test]
    fn peak_uses_the_configured_grid() {
        let model = GammaEnergyModel::new(30.0).unwrap();
        let temps = [300.0, 320.0];
        let (energies, labels) = model
            .sample_replicas(&temps.map(kelvin), 500, 3)
            .unwrap();
        let data = ProductionData::new(energies, labels).unwrap();
        let cv_settings = HeatCapacitySettings::builder()
            .method(HeatCapacityMethod::Fluctuation)
            .peak_grid_points(5)
            .build()
            .unwrap();
        let cv = heat_capacity(&data, &settings(&temps, 3), &cv_settings).unwrap();

        let peak = cv.peak().unwrap();
        assert_eq!(peak, CvPeak::from_curve(cv.kelvin(), &cv.series().values, 5).unwrap());
        let tm = peak.melting_temperature.value_in(TemperatureUnit::Kelvin);
        assert!([300.0, 305.0, 310.0, 315.0, 320.0]
            .iter()
            .any(|grid| (tm - grid).abs() < 1e-9));
    }

    #[test]
    fn gaussian_peak() {
        let sigma = 8.0;
        let temps: Vec<f64> = (0..41).map(|i| 280.0 + 2.0 * i as f64).collect();
        let cv: Vec<f64> = temps
            .iter()
            .map(|t| 1.0 + 5.0 * (-(t - 321.0_f64).powi(2) / (2.0 * sigma * sigma)).exp())
            .collect();
        let peak = CvPeak::from_curve(&temps, &cv, 1000).unwrap();

        assert!((peak.melting_temperature.value_in(TemperatureUnit::Kelvin) - 321.0).abs() < 0.2);
        assert!((peak.height.value_in(EntropyUnit::KilojoulePerMoleKelvin) - 5.0).abs() < 0.01);
        let fwhm = peak.fwhm.unwrap().value_in(TemperatureUnit::Kelvin);
        assert!((fwhm - 2.0 * (2.0 * 2.0_f64.ln()).sqrt() * sigma).abs() < 0.2);
    }

    #[test]
    fn peak_at_the_edge_has_no_width() {
        let temps = [300.0, 310.0, 320.0, 330.0];
        let cv = [1.0, 2.0, 3.0, 4.0];
        let peak = CvPeak::from_curve(&temps, &cv, 100).unwrap();
        assert_eq!(peak.melting_temperature.value(), 330.0);
        assert!(peak.fwhm.is_none());
        assert!(CvPeak::from_curve(&[300.0], &[1.0], 100).is_err());
    }
}

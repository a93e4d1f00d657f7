//! Synthetic systems with known thermodynamics, for testing the reweighting pipeline.

use crate::energies::{ReplicaEnergies, StateLabels};
use crate::errors::*;
use crate::units::{kb, Energy, Temperature, TemperatureUnit};
use ndarray::{array, Array1, Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gamma, Normal};

/// Test cases using harmonic oscillators.
///
/// State `k` has reduced potential $u_k(x) = \beta K_k (x - O_k)^2 / 2$, so its samples are
/// normally distributed and its free energy is known in closed form.
///
/// # Examples
///
/// Generate energy samples with default parameters.
///
/// ```
/// use remd_thermo::testsystems::*;
/// use ndarray::array;
///
/// let testcase = HarmonicOscillator::default();
/// let Sample {x_n, u_kn, n_k, s_n} = testcase.sample(array![10, 20, 30, 40, 50]).unwrap();
/// assert_eq!(u_kn.dim(), (5, 150));
/// ```
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(
    validate = "Self::validate",
    name = "build_inner",
    private,
    error = "ThermoError"
))]
pub struct HarmonicOscillator {
    /// Offset parameters for each state.
    #[builder(default = "array![0.0, 1.0, 2.0, 3.0, 4.0]")]
    o_k: Array1<f64>,

    /// Force constants for each state.
    #[builder(default = "array![1.0, 2.0, 4.0, 8.0, 16.0]")]
    k_k: Array1<f64>,

    /// Inverse temperature
    #[builder(default = "1.0")]
    beta: f64,
}

impl HarmonicOscillatorBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(k_k) = &self.k_k {
            if k_k.iter().any(|&k| !(k > 0.0)) {
                return Err("force constants must be positive".to_string());
            }
        }
        if let Some(beta) = self.beta {
            if !(beta > 0.0) {
                return Err(format!("beta must be positive, not {}", beta));
            }
        }

        Ok(())
    }

    /// Build the test case
    ///
    /// Offsets and force constants must have equal lengths once defaults are filled in.
    pub fn build(&self) -> Result<HarmonicOscillator> {
        let testcase = self.build_inner()?;
        if testcase.o_k.len() != testcase.k_k.len() {
            return Err(ThermoError::BuilderError(format!(
                "o_k and k_k must have equal lengths (not {} and {})",
                testcase.o_k.len(),
                testcase.k_k.len()
            )));
        }
        Ok(testcase)
    }
}

impl HarmonicOscillator {
    /// Get a new builder for the `HarmonicOscillator` struct.
    pub fn builder() -> HarmonicOscillatorBuilder {
        HarmonicOscillatorBuilder::default()
    }

    /// Number of states
    pub fn n_states(&self) -> usize {
        self.o_k.len()
    }

    /// Draw samples from the distribution with a random seed
    pub fn sample(&self, n_k: Array1<usize>) -> Result<Sample> {
        self.sample_inner(n_k, StdRng::from_entropy())
    }

    /// Draw samples from the distribution with a specified seed
    pub fn sample_with_seed(&self, n_k: Array1<usize>, seed: u64) -> Result<Sample> {
        self.sample_inner(n_k, StdRng::seed_from_u64(seed))
    }

    fn sample_inner(&self, n_k: Array1<usize>, mut rng: StdRng) -> Result<Sample> {
        if n_k.len() != self.n_states() {
            return Err(ThermoError::ArrayLengthMismatch(n_k.len(), self.n_states()));
        }
        let n_tot = n_k.sum();
        let mut x_n = Array1::zeros(n_tot);
        let mut s_n = Array1::zeros(n_tot);

        let mut n = 0;
        for (k, &count) in n_k.iter().enumerate() {
            let sigma = (self.beta * self.k_k[k]).recip().sqrt();
            let normal = Normal::new(self.o_k[k], sigma)
                .map_err(|e| ThermoError::InvalidConfiguration(e.to_string()))?;
            for _ in 0..count {
                x_n[n] = normal.sample(&mut rng);
                s_n[n] = k;
                n += 1;
            }
        }

        let u_kn = Array2::from_shape_fn((self.n_states(), n_tot), |(k, n)| {
            0.5 * self.beta * self.k_k[k] * (x_n[n] - self.o_k[k]).powi(2)
        });

        Ok(Sample { x_n, u_kn, n_k, s_n })
    }

    /// Dimensionless free energy of each state, $-\ln \sqrt{2\pi / \beta K_k}$
    pub fn analytical_free_energies(&self) -> Array1<f64> {
        self.k_k
            .mapv(|k| 0.5 * (self.beta * k / (2.0 * std::f64::consts::PI)).ln())
    }

    /// Mean position in each state
    pub fn analytical_means(&self) -> Array1<f64> {
        self.o_k.clone()
    }

    /// Variance of the position in each state
    pub fn analytical_variances(&self) -> Array1<f64> {
        self.k_k.mapv(|k| (self.beta * k).recip())
    }
}

impl Default for HarmonicOscillator {
    fn default() -> Self {
        Self {
            o_k: array![0.0, 1.0, 2.0, 3.0, 4.0],
            k_k: array![1.0, 2.0, 4.0, 8.0, 16.0],
            beta: 1.0,
        }
    }
}

/// A sample from a test case
#[derive(Debug)]
pub struct Sample {
    /// `x_n[n]` is sample n (in concatenated indexing)
    pub x_n: Array1<f64>,
    /// `u_kn[k,n]` is the reduced potential of sample n (in concatenated indexing) evaluated at state k.
    pub u_kn: Array2<f64>,
    /// `n_k[k]` is the number of samples generated from state k
    pub n_k: Array1<usize>,
    /// `s_n[k]` is the state of origin of `x_n[k]`
    pub s_n: Array1<usize>,
}

/// A two-level folding model.
///
/// The folded state (label 0) has energy $-\epsilon$ and the unfolded state (label 1) has
/// energy zero and `degeneracy_ratio` times as many microstates, so
///
/// $$
///     P_\mathrm{folded}(T) = \frac{e^{\epsilon / k_B T}}{e^{\epsilon / k_B T} + r}
/// $$
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TwoStateModel {
    /// Folding energy in kJ/mol
    epsilon: f64,
    /// Unfolded to folded microstate ratio
    degeneracy_ratio: f64,
}

impl TwoStateModel {
    /// Folded label
    pub const FOLDED: usize = 0;
    /// Unfolded label
    pub const UNFOLDED: usize = 1;

    /// A model with folding energy `epsilon` and degeneracy ratio `r`
    pub fn new(epsilon: Energy, degeneracy_ratio: f64) -> Result<Self> {
        if !(degeneracy_ratio > 0.0) || !epsilon.internal().is_finite() {
            return Err(ThermoError::InvalidConfiguration(format!(
                "invalid two-state model: epsilon {}, degeneracy ratio {}",
                epsilon, degeneracy_ratio
            )));
        }
        Ok(Self {
            epsilon: epsilon.internal(),
            degeneracy_ratio,
        })
    }

    /// The model whose folded to unfolded population ratios at `t1` and `t2` are exactly
    /// `ratio1` and `ratio2`
    pub fn from_ratios(t1: Temperature, ratio1: f64, t2: Temperature, ratio2: f64) -> Result<Self> {
        let beta1 = (kb() * t1.value_in(TemperatureUnit::Kelvin)).recip();
        let beta2 = (kb() * t2.value_in(TemperatureUnit::Kelvin)).recip();
        let epsilon = (ratio1 / ratio2).ln() / (beta1 - beta2);
        let degeneracy_ratio = (epsilon * beta1).exp() / ratio1;
        Self::new(Energy::from_internal(epsilon), degeneracy_ratio)
    }

    /// Probability of the folded state at `t`
    pub fn folded_fraction(&self, t: Temperature) -> f64 {
        let boltzmann = (self.epsilon / (kb() * t.internal())).exp();
        boltzmann / (boltzmann + self.degeneracy_ratio)
    }

    /// $\Delta F = F_\mathrm{folded} - F_\mathrm{unfolded}$ at `t`, in kJ/mol
    pub fn free_energy_of_folding(&self, t: Temperature) -> f64 {
        let p = self.folded_fraction(t);
        -kb() * t.internal() * (p / (1.0 - p)).ln()
    }

    /// Mean potential energy at `t`, in kJ/mol
    pub fn mean_energy(&self, t: Temperature) -> f64 {
        -self.epsilon * self.folded_fraction(t)
    }

    /// $\Delta U = U_\mathrm{folded} - U_\mathrm{unfolded}$, in kJ/mol
    pub fn energy_of_folding(&self) -> f64 {
        -self.epsilon
    }

    /// $\Delta S = S_\mathrm{folded} - S_\mathrm{unfolded}$, in kJ/(mol K)
    pub fn entropy_of_folding(&self) -> f64 {
        -kb() * self.degeneracy_ratio.ln()
    }

    /// Heat capacity at `t`, in kJ/(mol K)
    pub fn heat_capacity(&self, t: Temperature) -> f64 {
        let p = self.folded_fraction(t);
        let kt = kb() * t.internal();
        self.epsilon.powi(2) * p * (1.0 - p) / (kt * t.internal())
    }

    fn energy_of(&self, label: usize) -> f64 {
        if label == Self::FOLDED {
            -self.epsilon
        } else {
            0.0
        }
    }

    /// Replica data in which replica `k` spends exactly `folded[k]` of its `n_frames` frames
    /// folded.
    pub fn exact_replicas(
        &self,
        temperatures: &[Temperature],
        folded: &[usize],
        n_frames: usize,
    ) -> Result<(ReplicaEnergies, StateLabels)> {
        if folded.len() != temperatures.len() {
            return Err(ThermoError::ArrayLengthMismatch(folded.len(), temperatures.len()));
        }
        if let Some(&bad) = folded.iter().find(|&&f| f > n_frames) {
            return Err(ThermoError::InvalidConfiguration(format!(
                "{} folded frames out of {}",
                bad, n_frames
            )));
        }
        let labels = Array2::from_shape_fn((n_frames, temperatures.len()), |(n, k)| {
            if n < folded[k] {
                Self::FOLDED
            } else {
                Self::UNFOLDED
            }
        });
        self.replicas_from_labels(temperatures, labels)
    }

    /// Replica data with labels drawn from the Boltzmann distribution at each temperature
    pub fn sample_replicas(
        &self,
        temperatures: &[Temperature],
        n_frames: usize,
        seed: u64,
    ) -> Result<(ReplicaEnergies, StateLabels)> {
        let mut rng = StdRng::seed_from_u64(seed);
        let p: Vec<f64> = temperatures.iter().map(|&t| self.folded_fraction(t)).collect();
        let labels = Array2::from_shape_fn((n_frames, temperatures.len()), |(_, k)| {
            if rng.gen::<f64>() < p[k] {
                Self::FOLDED
            } else {
                Self::UNFOLDED
            }
        });
        self.replicas_from_labels(temperatures, labels)
    }

    fn replicas_from_labels(
        &self,
        temperatures: &[Temperature],
        labels: Array2<usize>,
    ) -> Result<(ReplicaEnergies, StateLabels)> {
        let k = temperatures.len();
        let n_frames = labels.nrows();
        let beta: Vec<f64> = temperatures
            .iter()
            .map(|t| (kb() * t.internal()).recip())
            .collect();
        let u_kln = Array3::from_shape_fn((k, k, n_frames), |(k, l, n)| {
            beta[l] * self.energy_of(labels[[n, k]])
        });
        Ok((ReplicaEnergies::new(u_kln)?, StateLabels::new(labels)))
    }
}

/// Potential energies drawn from a Gamma distribution.
///
/// A system whose density of states grows as $U^{D/2 - 1}$ has $U \sim
/// \mathrm{Gamma}(D/2, k_B T)$ at every temperature, and a constant heat capacity $D k_B / 2$.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GammaEnergyModel {
    degrees_of_freedom: f64,
}

impl GammaEnergyModel {
    /// A model with `degrees_of_freedom` quadratic degrees of freedom
    pub fn new(degrees_of_freedom: f64) -> Result<Self> {
        if !(degrees_of_freedom > 0.0) {
            return Err(ThermoError::InvalidConfiguration(format!(
                "degrees of freedom must be positive, not {}",
                degrees_of_freedom
            )));
        }
        Ok(Self { degrees_of_freedom })
    }

    /// Heat capacity in kJ/(mol K)
    pub fn heat_capacity(&self) -> f64 {
        0.5 * self.degrees_of_freedom * kb()
    }

    /// Mean potential energy at `t`, in kJ/mol
    pub fn mean_energy(&self, t: Temperature) -> f64 {
        0.5 * self.degrees_of_freedom * kb() * t.internal()
    }

    /// Replica data with `n_frames` energies per replica and every frame labelled 0
    pub fn sample_replicas(
        &self,
        temperatures: &[Temperature],
        n_frames: usize,
        seed: u64,
    ) -> Result<(ReplicaEnergies, StateLabels)> {
        let mut rng = StdRng::seed_from_u64(seed);
        let k = temperatures.len();
        let kt: Vec<f64> = temperatures.iter().map(|t| kb() * t.internal()).collect();

        let mut energies = Array2::zeros((k, n_frames));
        for (replica, mut row) in energies.outer_iter_mut().enumerate() {
            let gamma = Gamma::new(0.5 * self.degrees_of_freedom, kt[replica])
                .map_err(|e| ThermoError::InvalidConfiguration(e.to_string()))?;
            row.iter_mut().for_each(|u| *u = gamma.sample(&mut rng));
        }

        let u_kln = Array3::from_shape_fn((k, k, n_frames), |(k, l, n)| energies[[k, n]] / kt[l]);
        Ok((
            ReplicaEnergies::new(u_kln)?,
            StateLabels::new(Array2::zeros((n_frames, k))),
        ))
    }
}

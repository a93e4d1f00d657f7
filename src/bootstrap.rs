//! Bootstrap uncertainties: resample production frames with replacement, rerun the whole
//! reweighting calculation per trial, and report the spread across trials.

use crate::energies::ProductionData;
use crate::errors::*;
use crate::free_energy::{ConformationalOccupancy, EntropyEnthalpy, FreeEnergyProfile, TransitionKey};
use crate::heat_capacity::{HeatCapacity, HeatCapacitySettings, CvPeak};
use crate::reweight::{Reweighting, ReweightingSettings};
use crate::units::{Entropy, ObservableSeries, Temperature, Unit};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use tracing::{info, instrument};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Settings for bootstrap resampling
#[derive(Builder, Debug, Clone, Copy, PartialEq, Eq)]
#[builder(
    pattern = "owned",
    build_fn(
        validate = "Self::validate",
        name = "build_inner",
        private,
        error = "ThermoError"
    )
)]
pub struct BootstrapSettings {
    /// Frames drawn, with replacement, in each trial
    #[builder(default = "500")]
    n_sample_boot: usize,

    /// Number of trials
    #[builder(default = "100")]
    n_trial_boot: usize,

    /// Seed of the first trial; trial `i` uses `seed + i`. Drawn from entropy if unset.
    #[builder(default, setter(strip_option))]
    seed: Option<u64>,
}

impl BootstrapSettingsBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(n) = self.n_trial_boot {
            if n < 2 {
                return Err(format!("n_trial_boot must be at least 2, not {}", n));
            }
        }
        if self.n_sample_boot == Some(0) {
            return Err("n_sample_boot must be at least 1".to_string());
        }
        Ok(())
    }

    /// Build and check the settings
    pub fn build(self) -> Result<BootstrapSettings> {
        self.build_inner()
    }
}

impl BootstrapSettings {
    /// Get a new builder for the `BootstrapSettings` struct.
    pub fn builder() -> BootstrapSettingsBuilder {
        BootstrapSettingsBuilder::default()
    }

    /// Frames per trial
    pub fn n_sample_boot(&self) -> usize {
        self.n_sample_boot
    }

    /// Number of trials
    pub fn n_trial_boot(&self) -> usize {
        self.n_trial_boot
    }

    /// Run `trial` on `n_trial_boot` resamplings of `data`, in trial order.
    ///
    /// The same frame indices are applied to every replica's energies and labels. The first
    /// failing trial fails the whole run.
    pub fn run<T, F>(&self, data: &ProductionData, trial: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(&ProductionData) -> Result<T> + Sync,
    {
        let seed = self.seed.unwrap_or_else(rand::random);
        let n_frames = data.n_frames();
        if n_frames == 0 {
            return Err(ThermoError::InvalidConfiguration(
                "cannot resample an empty production window".to_string(),
            ));
        }
        let n_sample = self.n_sample_boot;
        let trials: Vec<u64> = (0..self.n_trial_boot as u64).collect();

        #[cfg(not(feature = "parallel"))]
        let iterator = trials.iter();

        #[cfg(feature = "parallel")]
        let iterator = trials.par_iter();

        iterator
            .map(|&i| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i));
                let frames: Vec<usize> = (0..n_sample).map(|_| rng.gen_range(0..n_frames)).collect();
                let resampled = data.resample(&frames)?;
                trial(&resampled)
            })
            .collect()
    }
}

/// Mean and sample standard deviation
fn mean_std<I: ExactSizeIterator<Item = f64> + Clone>(values: I) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.clone().sum::<f64>() / n;
    let var = values.map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}

/// Pointwise mean and standard deviation of equally long series
fn aggregate<U: Unit>(trials: &[&ObservableSeries<U>]) -> ObservableSeries<U> {
    let len = trials.first().map_or(0, |s| s.len());
    let (values, uncertainties): (Vec<f64>, Vec<f64>) = (0..len)
        .map(|i| mean_std(trials.iter().map(|s| s.values[i])))
        .unzip();
    ObservableSeries::internal(values, uncertainties)
}

/// Bootstrapped free energy differences
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapFreeEnergy {
    /// Trial means, with the trial standard deviation as uncertainty
    pub profile: FreeEnergyProfile,
    /// Entropy and enthalpy differences, when the ladder has at least two temperatures
    pub entropy_enthalpy: Option<BTreeMap<TransitionKey, EntropyEnthalpy>>,
}

/// Free energy differences between configurational states, with bootstrap uncertainties.
///
/// The states are those present in the full data set; a trial that misses one of them
/// fails the run.
#[instrument(level = "info", skip_all, fields(trials = boot.n_trial_boot))]
pub fn bootstrap_free_energy(
    data: &ProductionData,
    settings: &ReweightingSettings,
    boot: &BootstrapSettings,
) -> Result<BootstrapFreeEnergy> {
    let occupancy = ConformationalOccupancy::new(data.distinct_labels())?;
    let ladder = settings.ladder()?;
    let with_derivatives = ladder.len() > 1;

    let trials = boot.run(data, |resampled| {
        let reweighting = Reweighting::new(resampled, ladder.clone(), settings)?;
        let profile = FreeEnergyProfile::from_reweighting(&reweighting, &occupancy)?;
        let derived = if with_derivatives {
            Some(profile.entropy_enthalpy()?)
        } else {
            None
        };
        Ok((profile, derived))
    })?;

    let keys: Vec<TransitionKey> = trials[0].0.iter().map(|(k, _)| *k).collect();
    let mut series = BTreeMap::new();
    let mut derived = BTreeMap::new();
    for key in keys {
        let per_trial: Vec<&ObservableSeries<_>> = trials
            .iter()
            .filter_map(|(profile, _)| profile.iter().find(|(k, _)| **k == key).map(|(_, s)| s))
            .collect();
        series.insert(key, aggregate(&per_trial));

        let entropy: Vec<_> = trials
            .iter()
            .filter_map(|(_, d)| d.as_ref().and_then(|d| d.get(&key)))
            .collect();
        if entropy.len() == trials.len() {
            let s: Vec<_> = entropy.iter().map(|e| &e.entropy).collect();
            let u: Vec<_> = entropy.iter().map(|e| &e.enthalpy).collect();
            let c: Vec<_> = entropy.iter().map(|e| &e.heat_capacity).collect();
            derived.insert(
                key,
                EntropyEnthalpy {
                    entropy: aggregate(&s),
                    enthalpy: aggregate(&u),
                    heat_capacity: aggregate(&c),
                },
            );
        }
    }
    info!(transitions = series.len(), "bootstrapped free energy differences");

    Ok(BootstrapFreeEnergy {
        profile: FreeEnergyProfile::from_parts(ladder.kelvin().to_vec(), series),
        entropy_enthalpy: if with_derivatives { Some(derived) } else { None },
    })
}

/// Bootstrapped heat capacity peak scalars: trial mean and standard deviation of each
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakEstimate {
    /// Melting temperature
    pub melting_temperature: Temperature,
    /// Uncertainty in the melting temperature
    pub melting_temperature_uncertainty: Temperature,
    /// Peak height
    pub height: Entropy,
    /// Uncertainty in the peak height
    pub height_uncertainty: Entropy,
    /// Full width at half maximum, if every trial had one
    pub fwhm: Option<Temperature>,
    /// Uncertainty in the full width at half maximum
    pub fwhm_uncertainty: Option<Temperature>,
}

impl PeakEstimate {
    fn from_trials(peaks: &[CvPeak]) -> Self {
        let (tm, dtm) = mean_std(peaks.iter().map(|p| p.melting_temperature.internal()));
        let (h, dh) = mean_std(peaks.iter().map(|p| p.height.internal()));
        let widths: Vec<f64> = peaks
            .iter()
            .filter_map(|p| p.fwhm.map(|w| w.internal()))
            .collect();
        let (fwhm, fwhm_uncertainty) = if widths.len() == peaks.len() {
            let (w, dw) = mean_std(widths.iter().copied());
            (
                Some(Temperature::from_internal(w)),
                Some(Temperature::from_internal(dw)),
            )
        } else {
            (None, None)
        };
        Self {
            melting_temperature: Temperature::from_internal(tm),
            melting_temperature_uncertainty: Temperature::from_internal(dtm),
            height: Entropy::from_internal(h),
            height_uncertainty: Entropy::from_internal(dh),
            fwhm,
            fwhm_uncertainty,
        }
    }
}

/// Bootstrapped heat capacity
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapHeatCapacity {
    /// Trial means, with the trial standard deviation as uncertainty. The effective sample
    /// counts are trial means too.
    pub heat_capacity: HeatCapacity,
    /// Peak scalars, when the ladder has at least two temperatures
    pub peak: Option<PeakEstimate>,
}

/// Heat capacity and its peak scalars, with bootstrap uncertainties
#[instrument(level = "info", skip_all, fields(trials = boot.n_trial_boot))]
pub fn bootstrap_heat_capacity(
    data: &ProductionData,
    settings: &ReweightingSettings,
    cv_settings: &HeatCapacitySettings,
    boot: &BootstrapSettings,
) -> Result<BootstrapHeatCapacity> {
    let with_peak = settings.ladder()?.len() > 1;

    let trials = boot.run(data, |resampled| {
        let cv = HeatCapacity::compute(resampled, settings, cv_settings)?;
        let peak = if with_peak { Some(cv.peak()?) } else {
            None
        };
        Ok((cv, peak))
    })?;

    let series: Vec<_> = trials.iter().map(|(cv, _)| cv.series()).collect();
    let n_eff = (0..trials[0].0.kelvin().len())
        .map(|i| mean_std(trials.iter().map(|(cv, _)| cv.effective_samples()[i])).0)
        .collect();
    let heat_capacity = HeatCapacity::from_parts(
        trials[0].0.kelvin().to_vec(),
        aggregate(&series),
        n_eff,
        cv_settings.peak_grid_points(),
    );
    let peaks: Vec<CvPeak> = trials.iter().filter_map(|(_, p)| *p).collect();
    let peak = if with_peak {
        Some(PeakEstimate::from_trials(&peaks))
    } else {
        None
    };
    info!(points = heat_capacity.kelvin().len(), "bootstrapped heat capacity");

    Ok(BootstrapHeatCapacity {
        heat_capacity,
        peak,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energies::{ProductionData, StateLabels};
    use crate::free_energy::free_energy_profile;
    use crate::testsystems::{GammaEnergyModel, TwoStateModel};
    use crate::units::{kelvin, EntropyUnit, TemperatureUnit};

    fn two_state_data(n_frames: usize, seed: u64) -> ProductionData {
        let temps = [kelvin(300.0), kelvin(350.0)];
        let model = TwoStateModel::from_ratios(temps[0], 2.0, temps[1], 0.6).unwrap();
        let (energies, labels) = model.sample_replicas(&temps, n_frames, seed).unwrap();
        ProductionData::new(energies, labels).unwrap()
    }

    fn settings(m: usize) -> ReweightingSettings {
        ReweightingSettings::builder()
            .temperatures(vec![kelvin(300.0), kelvin(350.0)])
            .num_intermediate_states(m)
            .build()
            .unwrap()
    }

    #[test]
    fn build_settings() {
        let boot = BootstrapSettings::builder().build().unwrap();
        assert_eq!(boot.n_sample_boot(), 500);
        assert_eq!(boot.n_trial_boot(), 100);
        assert_eq!(boot.seed, None);

        let boot = BootstrapSettings::builder().seed(7).build().unwrap();
        assert_eq!(boot.seed, Some(7));

        assert!(BootstrapSettings::builder().n_trial_boot(1).build().is_err());
        assert!(BootstrapSettings::builder().n_sample_boot(0).build().is_err());
    }

    #[test]
    fn sample_standard_deviation() {
        let (mean, std) = mean_std([1.0, 2.0, 3.0, 4.0].iter().copied());
        assert_eq!(mean, 2.5);
        assert!((std - (5.0_f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn trials_are_reproducible() {
        let data = two_state_data(100, 3);
        let boot = BootstrapSettings::builder()
            .n_sample_boot(100)
            .n_trial_boot(6)
            .seed(11)
            .build()
            .unwrap();
        let counts = |resampled: &ProductionData| -> Result<usize> {
            Ok(resampled.flat_labels().iter().filter(|&&l| l == 0).count())
        };
        let a = boot.run(&data, counts).unwrap();
        let b = boot.run(&data, counts).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 6);
        assert!(a.iter().any(|&c| c != a[0]));
    }

    #[test]
    fn bootstrap_mean_tracks_single_estimate() {
        let data = two_state_data(400, 5);
        let single = free_energy_profile(&data, &settings(1)).unwrap();
        let boot = BootstrapSettings::builder()
            .n_sample_boot(400)
            .n_trial_boot(40)
            .seed(2024)
            .build()
            .unwrap();
        let result = bootstrap_free_energy(&data, &settings(1), &boot).unwrap();

        let analytic = single.get(0, 1).unwrap();
        let bootstrapped = result.profile.get(0, 1).unwrap();
        assert_eq!(result.profile.kelvin(), single.kelvin());
        for i in 0..3 {
            let std = bootstrapped.uncertainties[i];
            assert!((bootstrapped.values[i] - analytic.values[i]).abs() < std);
            assert!(std > 0.5 * analytic.uncertainties[i] && std < 2.0 * analytic.uncertainties[i]);
        }

        let derived = result.entropy_enthalpy.unwrap();
        let folding = &derived[&TransitionKey::new(0, 1)];
        assert_eq!(folding.entropy.len(), 3);
        assert!(folding.entropy.uncertainties.iter().all(|&s| s > 0.0));
        assert_eq!(folding.heat_capacity.len(), 3);
        assert!(folding.heat_capacity.uncertainties[1] > 0.0);
    }

    #[test]
    fn failing_trial_fails_the_run() {
        // state 1 appears in a single frame, so most resamplings miss it
        let data = two_state_data(50, 9);
        let mut labels = data.labels().to_owned();
        labels.fill(0);
        labels[[17, 0]] = 1;
        let energies = data.energies().to_owned();
        let data = ProductionData::new(
            crate::energies::ReplicaEnergies::new(energies).unwrap(),
            StateLabels::new(labels),
        )
        .unwrap();

        let boot = BootstrapSettings::builder()
            .n_sample_boot(50)
            .n_trial_boot(20)
            .seed(1)
            .build()
            .unwrap();
        assert!(matches!(
            bootstrap_free_energy(&data, &settings(0), &boot),
            Err(ThermoError::DegenerateObservable(_))
        ));
    }

    #[test]
    fn bootstrapped_heat_capacity() {
        let model = GammaEnergyModel::new(30.0).unwrap();
        let temps = [kelvin(300.0), kelvin(320.0)];
        let (energies, labels) = model.sample_replicas(&temps, 800, 31).unwrap();
        let data = ProductionData::new(energies, labels).unwrap();
        let settings = ReweightingSettings::builder()
            .temperatures(temps.to_vec())
            .num_intermediate_states(2)
            .build()
            .unwrap();
        let boot = BootstrapSettings::builder()
            .n_sample_boot(800)
            .n_trial_boot(10)
            .seed(5)
            .build()
            .unwrap();

        let result =
            bootstrap_heat_capacity(&data, &settings, &HeatCapacitySettings::default(), &boot)
                .unwrap();
        let cv = result.heat_capacity.series();
        assert_eq!(cv.len(), 4);
        let exact = model.heat_capacity();
        for (value, sigma) in cv.values.iter().zip(&cv.uncertainties) {
            assert!(*sigma > 0.0);
            assert!((value - exact).abs() < 5.0 * sigma + 0.1 * exact);
        }

        let n_eff = result.heat_capacity.effective_samples();
        assert_eq!(n_eff.len(), 4);
        // sampled temperatures see at least their own replica's frames
        assert!(n_eff[0] >= 400.0 && n_eff[3] >= 400.0);
        assert!(n_eff.iter().all(|&n| n <= 1600.0 + 1e-9));

        let peak = result.peak.unwrap();
        let tm = peak.melting_temperature.value_in(TemperatureUnit::Kelvin);
        assert!((300.0..=320.0).contains(&tm));
        assert!(peak.height.value_in(EntropyUnit::KilojoulePerMoleKelvin) >= 0.0);
    }
}

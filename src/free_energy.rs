//! Free energy differences between configurational states across a temperature ladder, and
//! the entropy and enthalpy differences that follow from their temperature dependence.

use crate::energies::ProductionData;
use crate::errors::*;
use crate::mbar::MultipleExpectations;
use crate::reweight::{Reweighting, ReweightingSettings, StateObservable};
use crate::spline::{derivative_sensitivity, second_derivative_sensitivity, NaturalSpline};
use crate::units::{kb, EnergyUnit, EntropyUnit, ObservableSeries, Temperature};
use ndarray::Array2;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, instrument};

/// An ordered pair of configurational states.
///
/// Series stored under `TransitionKey { from, to }` hold $F_\mathrm{from} - F_\mathrm{to}$.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransitionKey {
    /// State whose free energy is the minuend
    pub from: usize,
    /// State whose free energy is subtracted
    pub to: usize,
}

impl TransitionKey {
    /// The key for $F_\mathrm{from} - F_\mathrm{to}$
    pub fn new(from: usize, to: usize) -> Self {
        Self { from, to }
    }

    /// The same pair in increasing order, and whether it was flipped
    pub fn canonical(self) -> (Self, bool) {
        if self.from <= self.to {
            (self, false)
        } else {
            (Self::new(self.to, self.from), true)
        }
    }
}

impl fmt::Display for TransitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.from, self.to)
    }
}

/// Occupancy of each configurational state, as indicator observables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConformationalOccupancy {
    states: Vec<usize>,
}

impl ConformationalOccupancy {
    /// Occupancy of `states`; at least two distinct states are needed to form a difference
    pub fn new(mut states: Vec<usize>) -> Result<Self> {
        states.sort_unstable();
        states.dedup();
        if states.len() < 2 {
            return Err(ThermoError::DegenerateObservable(format!(
                "free energy differences need at least two configurational states, found {:?}",
                states
            )));
        }
        Ok(Self { states })
    }

    /// The states, in increasing order
    pub fn states(&self) -> &[usize] {
        &self.states
    }

    /// Index pairs `(i, j)`, `i < j`, into `states`
    fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let n = self.states.len();
        (0..n).flat_map(move |i| (i + 1..n).map(move |j| (i, j)))
    }
}

impl StateObservable for ConformationalOccupancy {
    /// `(ΔF, σ)` in kJ/mol for each pair of states
    type Output = Vec<(f64, f64)>;

    fn observables(&self, reweighting: &Reweighting) -> Result<Array2<f64>> {
        let labels = reweighting.labels();
        let mut indicators = Array2::zeros((self.states.len(), labels.len()));
        for (mut row, &state) in indicators.outer_iter_mut().zip(&self.states) {
            let mut population = 0usize;
            for (a, &label) in row.iter_mut().zip(labels.iter()) {
                if label == state {
                    *a = 1.0;
                    population += 1;
                }
            }
            if population == 0 {
                return Err(ThermoError::DegenerateObservable(format!(
                    "configurational state {} has no samples",
                    state
                )));
            }
        }
        Ok(indicators)
    }

    /// $\Delta F_{ij} = -k_B T \ln(P_i / P_j)$. Its variance is the first-order propagation of
    /// the occupancy covariance, $k_B^2 T^2 (C_{ii}/P_i^2 + C_{jj}/P_j^2 - 2 C_{ij}/(P_i P_j))$,
    /// read off the covariance of $\ln P$, whose entries are exactly $C_{ij} / (P_i P_j)$.
    fn derive(&self, t: f64, expectations: &MultipleExpectations) -> Result<Vec<(f64, f64)>> {
        let theta = expectations.log_covariance.as_ref().ok_or_else(|| {
            ThermoError::Numerical("occupancy covariance was not computed".to_string())
        })?;
        let p = &expectations.mu;
        let kt = kb() * t;
        Ok(self
            .pairs()
            .map(|(i, j)| {
                let delta_f = -kt * (p[i].ln() - p[j].ln());
                let var = theta[[i, i]] + theta[[j, j]] - theta[[i, j]] - theta[[j, i]];
                (delta_f, kt * var.max(0.0).sqrt())
            })
            .collect())
    }
}

/// Free energy differences between every pair of configurational states at every ladder
/// temperature
#[derive(Debug, Clone, PartialEq)]
pub struct FreeEnergyProfile {
    /// Ladder temperatures in kelvin
    temperatures: Vec<f64>,
    /// Keyed by increasing pairs only
    series: BTreeMap<TransitionKey, ObservableSeries<EnergyUnit>>,
}

impl FreeEnergyProfile {
    /// Free energy differences between `occupancy`'s states across `reweighting`'s ladder
    #[instrument(level = "debug", skip_all)]
    pub fn from_reweighting(
        reweighting: &Reweighting,
        occupancy: &ConformationalOccupancy,
    ) -> Result<Self> {
        let per_temperature = reweighting.evaluate(occupancy)?;
        let keys: Vec<TransitionKey> = occupancy
            .pairs()
            .map(|(i, j)| TransitionKey::new(occupancy.states[i], occupancy.states[j]))
            .collect();

        let mut series = BTreeMap::new();
        for (p, &key) in keys.iter().enumerate() {
            let (values, uncertainties) = per_temperature.iter().map(|pairs| pairs[p]).unzip();
            series.insert(key, ObservableSeries::internal(values, uncertainties));
        }
        debug!(transitions = keys.len(), "computed free energy differences");

        Ok(Self {
            temperatures: reweighting.ladder().kelvin().to_vec(),
            series,
        })
    }

    /// Assemble a profile from per-transition series
    pub(crate) fn from_parts(
        temperatures: Vec<f64>,
        series: BTreeMap<TransitionKey, ObservableSeries<EnergyUnit>>,
    ) -> Self {
        Self {
            temperatures,
            series,
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

    /// $F_\mathrm{from} - F_\mathrm{to}$ at every ladder temperature
    ///
    /// Either order may be requested; the reversed pair is the negated series.
    pub fn get(&self, from: usize, to: usize) -> Option<ObservableSeries<EnergyUnit>> {
        let (key, flipped) = TransitionKey::new(from, to).canonical();
        let series = self.series.get(&key)?;
        if flipped {
            Some(ObservableSeries {
                values: series.values.iter().map(|v| -v).collect(),
                uncertainties: series.uncertainties.clone(),
                unit: series.unit,
            })
        } else {
            Some(series.clone())
        }
    }

    /// Transitions in increasing order, each with `from < to`
    pub fn iter(&self) -> impl Iterator<Item = (&TransitionKey, &ObservableSeries<EnergyUnit>)> + '_ {
        self.series.iter()
    }

    /// Number of transitions
    pub fn len(&self) -> usize {
        self.series.len()
    }

    /// True if there are no transitions
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Entropy and enthalpy differences for every transition.
    ///
    /// Each free energy series is fitted with a natural cubic spline, and
    ///
    /// $$
    ///     \Delta S = -\frac{d \Delta F}{d T}, \qquad \Delta U = \Delta F + T \Delta S,
    ///     \qquad \Delta C_V = -T \frac{d^2 \Delta F}{d T^2}
    /// $$
    ///
    /// are evaluated at the ladder temperatures. Uncertainties are propagated linearly through
    /// the spline, treating the free energy uncertainties as independent.
    pub fn entropy_enthalpy(&self) -> Result<BTreeMap<TransitionKey, EntropyEnthalpy>> {
        let first = derivative_sensitivity(&self.temperatures)?;
        let second = second_derivative_sensitivity(&self.temperatures)?;
        self.series
            .iter()
            .map(|(&key, series)| {
                let spline = NaturalSpline::fit(&self.temperatures, &series.values)?;
                Ok((
                    key,
                    entropy_enthalpy_of(&self.temperatures, series, &spline, &first, &second),
                ))
            })
            .collect()
    }
}

fn entropy_enthalpy_of(
    temperatures: &[f64],
    series: &ObservableSeries<EnergyUnit>,
    spline: &NaturalSpline,
    first: &[Vec<f64>],
    second: &[Vec<f64>],
) -> EntropyEnthalpy {
    let n = temperatures.len();
    let mut s = Vec::with_capacity(n);
    let mut ds = Vec::with_capacity(n);
    let mut u = Vec::with_capacity(n);
    let mut du = Vec::with_capacity(n);
    let mut c = Vec::with_capacity(n);
    let mut dc = Vec::with_capacity(n);

    for (i, &t) in temperatures.iter().enumerate() {
        let entropy = -spline.derivative(t);
        s.push(entropy);
        u.push(series.values[i] + t * entropy);
        c.push(-t * spline.second_derivative(t));

        let mut var_s = 0.0;
        let mut var_u = 0.0;
        let mut var_c = 0.0;
        for (j, sigma) in series.uncertainties.iter().enumerate() {
            let d = first[i][j];
            let identity = if i == j { 1.0 } else { 0.0 };
            var_s += (d * sigma).powi(2);
            var_u += ((identity - t * d) * sigma).powi(2);
            var_c += (t * second[i][j] * sigma).powi(2);
        }
        ds.push(var_s.sqrt());
        du.push(var_u.sqrt());
        dc.push(var_c.sqrt());
    }

    EntropyEnthalpy {
        entropy: ObservableSeries::internal(s, ds),
        enthalpy: ObservableSeries::internal(u, du),
        heat_capacity: ObservableSeries::internal(c, dc),
    }
}

/// Entropy, enthalpy and heat capacity differences for one transition, aligned with the
/// ladder
#[derive(Debug, Clone, PartialEq)]
pub struct EntropyEnthalpy {
    /// $\Delta S = S_\mathrm{from} - S_\mathrm{to}$, minus the first temperature derivative
    /// of the free energy difference
    pub entropy: ObservableSeries<EntropyUnit>,
    /// $\Delta U = U_\mathrm{from} - U_\mathrm{to}$
    pub enthalpy: ObservableSeries<EnergyUnit>,
    /// $\Delta C_V = -T \, d^2 \Delta F / d T^2$; divide by $-T$ for the second derivative
    /// itself. Zero at the ends of the ladder, where the spline is natural.
    pub heat_capacity: ObservableSeries<EntropyUnit>,
}

/// Free energy differences between every pair of configurational states present in `data`
pub fn free_energy_profile(
    data: &ProductionData,
    settings: &ReweightingSettings,
) -> Result<FreeEnergyProfile> {
    let occupancy = ConformationalOccupancy::new(data.distinct_labels())?;
    let reweighting = Reweighting::from_settings(data, settings)?;
    FreeEnergyProfile::from_reweighting(&reweighting, &occupancy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energies::{ReplicaEnergies, StateLabels};
    use crate::testsystems::TwoStateModel;
    use crate::units::kelvin;
    use ndarray::{Array2, Array3};

    fn settings(m: usize) -> ReweightingSettings {
        ReweightingSettings::builder()
            .temperatures(vec![kelvin(300.0), kelvin(350.0)])
            .num_intermediate_states(m)
            .build()
            .unwrap()
    }

    fn exact_two_state() -> (TwoStateModel, ProductionData) {
        // 300 K: 450 folded of 600; 350 K: 200 folded of 600
        let temps = [kelvin(300.0), kelvin(350.0)];
        let model = TwoStateModel::from_ratios(temps[0], 3.0, temps[1], 0.5).unwrap();
        let (energies, labels) = model.exact_replicas(&temps, &[450, 200], 600).unwrap();
        (model, ProductionData::new(energies, labels).unwrap())
    }

    #[test]
    fn matches_count_ratio_at_sampled_temperature() {
        let (model, data) = exact_two_state();
        let profile = free_energy_profile(&data, &settings(1)).unwrap();
        assert_eq!(profile.kelvin(), &[300.0, 325.0, 350.0]);

        let series = profile.get(0, 1).unwrap();
        let direct = -kb() * 300.0 * (450.0_f64 / 150.0).ln();
        assert!((series.values[0] - direct).abs() < 1e-6 * direct.abs());

        let direct = -kb() * 350.0 * (200.0_f64 / 400.0).ln();
        assert!((series.values[2] - direct).abs() < 1e-6 * direct.abs());

        let analytic = model.free_energy_of_folding(kelvin(325.0));
        assert!((series.values[1] - analytic).abs() < 1e-6 * analytic.abs().max(1.0));
        assert!(series.uncertainties.iter().all(|&s| s > 0.0 && s.is_finite()));
    }

    #[test]
    fn uncertainty_propagates_occupancy_covariance() {
        let temps = [kelvin(300.0), kelvin(350.0)];
        let model = TwoStateModel::from_ratios(temps[0], 2.0, temps[1], 0.7).unwrap();
        let (energies, labels) = model.sample_replicas(&temps, 300, 8).unwrap();
        let data = ProductionData::new(energies, labels).unwrap();
        let reweighting = Reweighting::from_settings(&data, &settings(1)).unwrap();
        let occupancy = ConformationalOccupancy::new(data.distinct_labels()).unwrap();
        let profile = FreeEnergyProfile::from_reweighting(&reweighting, &occupancy).unwrap();
        let series = profile.get(0, 1).unwrap();

        let a_in = occupancy.observables(&reweighting).unwrap();
        for (k, &t) in reweighting.ladder().kelvin().iter().enumerate() {
            let e = reweighting
                .mbar()
                .compute_multiple_expectations(a_in.view(), reweighting.state_energies(k), true)
                .unwrap();
            let c = e.covariance.unwrap();
            let p = &e.mu;
            let var = c[[0, 0]] / (p[0] * p[0]) + c[[1, 1]] / (p[1] * p[1])
                - 2.0 * c[[0, 1]] / (p[0] * p[1]);
            let expected = kb() * t * var.sqrt();
            assert!((series.uncertainties[k] - expected).abs() < 1e-10 * expected);
        }
    }

    #[test]
    fn reversed_pairs_are_antisymmetric() {
        let (_, data) = exact_two_state();
        let profile = free_energy_profile(&data, &settings(3)).unwrap();
        let forward = profile.get(0, 1).unwrap();
        let backward = profile.get(1, 0).unwrap();
        for (f, b) in forward.values.iter().zip(&backward.values) {
            assert_eq!(*f, -*b);
        }
        assert_eq!(forward.uncertainties, backward.uncertainties);
        assert!(profile.get(0, 2).is_none());
        assert_eq!(profile.len(), 1);
    }

    #[test]
    fn intermediates_do_not_change_sampled_results() {
        let temps = [kelvin(300.0), kelvin(350.0)];
        let model = TwoStateModel::from_ratios(temps[0], 2.0, temps[1], 0.7).unwrap();
        let (energies, labels) = model.sample_replicas(&temps, 500, 17).unwrap();
        let data = ProductionData::new(energies, labels).unwrap();

        let direct = free_energy_profile(&data, &settings(0)).unwrap();
        let dense = free_energy_profile(&data, &settings(4)).unwrap();
        let (a, b) = (direct.get(0, 1).unwrap(), dense.get(0, 1).unwrap());
        assert_eq!(direct.kelvin(), &[300.0, 350.0]);
        assert!((a.values[0] - b.values[0]).abs() < 1e-8);
        assert!((a.values[1] - b.values[5]).abs() < 1e-8);
        assert!((a.uncertainties[0] - b.uncertainties[0]).abs() < 1e-6);
    }

    #[test]
    fn entropy_and_enthalpy_of_two_state_model() {
        let (model, data) = exact_two_state();
        let profile = free_energy_profile(&data, &settings(5)).unwrap();
        let derived = profile.entropy_enthalpy().unwrap();
        let folding = &derived[&TransitionKey::new(0, 1)];

        // ΔF is linear in T for a two-level system
        for (s, u) in folding.entropy.values.iter().zip(&folding.enthalpy.values) {
            assert!((s - model.entropy_of_folding()).abs() < 1e-6);
            assert!((u - model.energy_of_folding()).abs() < 1e-4);
        }
        assert!(folding.entropy.uncertainties.iter().all(|s| *s > 0.0));
        assert_eq!(folding.entropy.unit, EntropyUnit::KilojoulePerMoleKelvin);

        // and so its curvature, and the heat capacity of folding, vanish
        assert_eq!(folding.heat_capacity.len(), 7);
        assert!(folding.heat_capacity.values.iter().all(|c| c.abs() < 1e-3));
        assert!(folding.heat_capacity.uncertainties[3] > 0.0);
    }

    #[test]
    fn curvature_of_a_quadratic_free_energy() {
        // ΔF = a + b T + c T^2 has ΔCv = -2 c T
        let temperatures: Vec<f64> = (0..21).map(|i| 300.0 + 2.5 * i as f64).collect();
        let c = 1.0e-3;
        let values: Vec<f64> = temperatures
            .iter()
            .map(|t| 4.0 - 0.02 * t + c * (t - 300.0).powi(2))
            .collect();
        let uncertainties = vec![0.01; temperatures.len()];
        let mut series = BTreeMap::new();
        series.insert(
            TransitionKey::new(0, 1),
            ObservableSeries::internal(values, uncertainties),
        );
        let profile = FreeEnergyProfile::from_parts(temperatures.clone(), series);
        let derived = profile.entropy_enthalpy().unwrap();
        let folding = &derived[&TransitionKey::new(0, 1)];

        // away from the natural ends the spline recovers the curvature
        for i in 6..15 {
            let t = temperatures[i];
            let expected = -2.0 * c * t;
            let value = folding.heat_capacity.values[i];
            assert!((value - expected).abs() < 0.02 * expected.abs(), "{} K: {}", t, value);
            assert!(folding.heat_capacity.uncertainties[i] > 0.0);
        }
        assert_eq!(folding.heat_capacity.values[0], 0.0);
    }

    #[test]
    fn empty_state_is_degenerate() {
        let energies = ReplicaEnergies::new(Array3::zeros((2, 2, 4))).unwrap();
        let labels = StateLabels::new(Array2::zeros((4, 2)));
        let data = ProductionData::new(energies, labels).unwrap();

        assert!(matches!(
            free_energy_profile(&data, &settings(0)),
            Err(ThermoError::DegenerateObservable(_))
        ));

        let reweighting = Reweighting::from_settings(&data, &settings(0)).unwrap();
        let occupancy = ConformationalOccupancy::new(vec![0, 3]).unwrap();
        assert!(matches!(
            FreeEnergyProfile::from_reweighting(&reweighting, &occupancy),
            Err(ThermoError::DegenerateObservable(_))
        ));
    }

    #[test]
    fn transition_keys_are_ordered() {
        let (key, flipped) = TransitionKey::new(3, 1).canonical();
        assert_eq!(key, TransitionKey::new(1, 3));
        assert!(flipped);
        assert!(TransitionKey::new(0, 2) < TransitionKey::new(1, 0));
    }
}

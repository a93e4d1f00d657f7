//! Temperature ladders: sampled temperatures, interpolated states between them, and probe
//! states for finite differences.

use crate::errors::*;
use crate::units::{Temperature, TemperatureUnit};

/// An increasing sequence of temperatures built from the sampled ones.
///
/// The first `len()` entries are the ladder proper: every sampled temperature with
/// `num_intermediate_states` evenly spaced temperatures inserted into each gap. When built
/// with [`TemperatureLadder::with_probes`], two more blocks of the same length follow, holding
/// the states just below and just above each ladder entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureLadder {
    /// Temperatures in kelvin: ladder, then minus probes, then plus probes
    temperatures: Vec<f64>,
    /// Ladder positions that carry simulated samples
    sampled: Vec<usize>,
    /// Number of ladder entries, excluding probes
    n_ladder: usize,
    num_intermediate_states: usize,
}

impl TemperatureLadder {
    /// Build a ladder from sampled temperatures.
    ///
    /// The result has `n + (n - 1) * num_intermediate_states` entries for `n` sampled
    /// temperatures. Gap `i` is divided into `num_intermediate_states + 1` equal steps.
    pub fn new(sampled: &[Temperature], num_intermediate_states: usize) -> Result<Self> {
        let temps = validated_kelvin(sampled)?;
        let n = temps.len();
        let steps = num_intermediate_states + 1;

        let mut temperatures = Vec::with_capacity(n + (n - 1) * num_intermediate_states);
        let mut sampled_indices = Vec::with_capacity(n);
        for (lo, hi) in temps.iter().zip(temps.iter().skip(1)) {
            let delta = (hi - lo) / steps as f64;
            sampled_indices.push(temperatures.len());
            temperatures.extend((0..steps).map(|j| lo + delta * j as f64));
        }
        sampled_indices.push(temperatures.len());
        temperatures.push(temps[n - 1]);

        Ok(Self {
            n_ladder: temperatures.len(),
            temperatures,
            sampled: sampled_indices,
            num_intermediate_states,
        })
    }

    /// Append finite-difference probe states at `T - dT` and `T + dT` for every ladder entry.
    ///
    /// `dT` is `frac_dt` times the spacing of the gap to the right of the entry; the last
    /// entry uses the last gap. A single-temperature ladder uses `frac_dt * T`.
    pub fn with_probes(mut self, frac_dt: f64) -> Result<Self> {
        if !(frac_dt > 0.0 && frac_dt < 1.0) {
            return Err(ThermoError::InvalidConfiguration(format!(
                "frac_dT must lie strictly between 0 and 1, not {}",
                frac_dt
            )));
        }
        if self.has_probes() {
            return Ok(self);
        }

        let ladder = &self.temperatures[..self.n_ladder];
        let dt: Vec<f64> = (0..self.n_ladder)
            .map(|i| {
                let spacing = if self.n_ladder == 1 {
                    ladder[0]
                } else if i + 1 < self.n_ladder {
                    ladder[i + 1] - ladder[i]
                } else {
                    ladder[i] - ladder[i - 1]
                };
                frac_dt * spacing
            })
            .collect();

        let minus: Vec<f64> = ladder.iter().zip(&dt).map(|(t, d)| t - d).collect();
        let plus: Vec<f64> = ladder.iter().zip(&dt).map(|(t, d)| t + d).collect();
        self.temperatures.extend(minus);
        self.temperatures.extend(plus);
        Ok(self)
    }

    /// Number of ladder entries, excluding probe states
    pub fn len(&self) -> usize {
        self.n_ladder
    }

    /// True if the ladder holds no temperatures; never true for a constructed ladder
    pub fn is_empty(&self) -> bool {
        self.n_ladder == 0
    }

    /// Number of thermodynamic states including probes
    pub fn n_states(&self) -> usize {
        self.temperatures.len()
    }

    /// True if finite-difference probe states have been appended
    pub fn has_probes(&self) -> bool {
        self.temperatures.len() > self.n_ladder
    }

    /// Intermediate states inserted per gap
    pub fn num_intermediate_states(&self) -> usize {
        self.num_intermediate_states
    }

    /// Ladder temperatures in kelvin, excluding probes
    pub fn kelvin(&self) -> &[f64] {
        &self.temperatures[..self.n_ladder]
    }

    /// Every state temperature in kelvin, probes included
    pub fn all_kelvin(&self) -> &[f64] {
        &self.temperatures
    }

    /// Ladder temperatures as quantities
    pub fn temperatures(&self) -> Vec<Temperature> {
        self.kelvin()
            .iter()
            .map(|&t| Temperature::from_internal(t))
            .collect()
    }

    /// Ladder positions of the sampled temperatures
    pub fn sampled_indices(&self) -> &[usize] {
        &self.sampled
    }

    /// Number of sampled temperatures
    pub fn n_sampled(&self) -> usize {
        self.sampled.len()
    }

    /// Whether ladder entry `index` is a sampled temperature
    pub fn is_sampled(&self, index: usize) -> bool {
        self.sampled.binary_search(&index).is_ok()
    }

    /// State indices of the probes below and above ladder entry `index`
    pub fn probe_indices(&self, index: usize) -> Option<(usize, usize)> {
        if self.has_probes() && index < self.n_ladder {
            Some((self.n_ladder + index, 2 * self.n_ladder + index))
        } else {
            None
        }
    }
}

/// Replica temperatures with a constant ratio between neighbours.
///
/// Geometric spacing gives roughly uniform exchange acceptance for systems with a constant
/// heat capacity.
pub fn geometric_temperatures(
    min: Temperature,
    max: Temperature,
    count: usize,
) -> Result<Vec<Temperature>> {
    let (lo, hi) = (min.value_in(TemperatureUnit::Kelvin), max.value_in(TemperatureUnit::Kelvin));
    if count == 0 || !(lo > 0.0) || !(hi >= lo) || !hi.is_finite() {
        return Err(ThermoError::InvalidConfiguration(format!(
            "cannot space {} temperatures between {} K and {} K",
            count, lo, hi
        )));
    }
    if count == 1 {
        return Ok(vec![min]);
    }
    let ratio = (hi / lo).ln() / (count - 1) as f64;
    Ok((0..count)
        .map(|i| Temperature::from_internal(lo * (ratio * i as f64).exp()))
        .collect())
}

fn validated_kelvin(sampled: &[Temperature]) -> Result<Vec<f64>> {
    if sampled.is_empty() {
        return Err(ThermoError::InvalidConfiguration(
            "the temperature list is empty".to_string(),
        ));
    }
    let temps: Vec<f64> = sampled
        .iter()
        .map(|t| t.value_in(TemperatureUnit::Kelvin))
        .collect();
    if let Some(bad) = temps.iter().find(|t| !(t.is_finite() && **t > 0.0)) {
        return Err(ThermoError::InvalidConfiguration(format!(
            "temperatures must be positive and finite, found {} K",
            bad
        )));
    }
    if temps.windows(2).any(|w| w[1] <= w[0]) {
        return Err(ThermoError::InvalidConfiguration(
            "sampled temperatures must be strictly increasing".to_string(),
        ));
    }
    Ok(temps)
}

//! Fraction of native contacts, a folding progress coordinate, and its reweighted expectation.

use crate::errors::*;
use crate::reweight::Reweighting;
use crate::units::{Dimensionless, Length, ObservableSeries};
use ndarray::{Array1, ArrayView2, ArrayView3, Axis};
use tracing::{debug, instrument};

/// Particle pairs in contact in a reference structure, with their reference distances
#[derive(Debug, Clone, PartialEq)]
pub struct NativeContacts {
    pairs: Vec<(usize, usize)>,
    /// Native distance of each pair, in nm
    native_distances: Vec<f64>,
}

fn distance(positions: ArrayView2<'_, f64>, i: usize, j: usize) -> f64 {
    let (a, b) = (positions.row(i), positions.row(j));
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

fn check_pairs(pairs: &[(usize, usize)], n_particles: usize) -> Result<()> {
    match pairs.iter().find(|&&(i, j)| i.max(j) >= n_particles) {
        Some(&(i, j)) => Err(ThermoError::ArrayLengthMismatch(i.max(j), n_particles)),
        None => Ok(()),
    }
}

impl NativeContacts {
    /// The `candidates` closer than `cutoff` in the `native` structure.
    ///
    /// `native[particle, xyz]` holds positions in nm. Candidates are usually the nonbonded
    /// particle pairs of the model.
    pub fn select(
        candidates: &[(usize, usize)],
        native: ArrayView2<'_, f64>,
        cutoff: Length,
    ) -> Result<Self> {
        if native.ncols() != 3 {
            return Err(ThermoError::ArrayLengthMismatch(native.ncols(), 3));
        }
        check_pairs(candidates, native.nrows())?;

        let cutoff = cutoff.internal();
        let (pairs, native_distances): (Vec<_>, Vec<_>) = candidates
            .iter()
            .map(|&(i, j)| ((i, j), distance(native, i, j)))
            .filter(|&(_, d)| d < cutoff)
            .unzip();

        if pairs.is_empty() {
            return Err(ThermoError::DegenerateObservable(format!(
                "no native contacts among {} candidate pairs within {} nm",
                candidates.len(),
                cutoff
            )));
        }
        debug!(contacts = pairs.len(), candidates = candidates.len(), "selected native contacts");
        Ok(Self {
            pairs,
            native_distances,
        })
    }

    /// Pick the native contact cutoff that maximizes the mean fraction of native contacts over
    /// an ensemble.
    ///
    /// Each of `cutoffs` selects a contact set from `candidates` in the `native` structure,
    /// which is scored by its mean [`NativeContacts::fraction`] over `frames` at
    /// `cutoff_ratio`. Cutoffs that select nothing are skipped; ties go to the earliest cutoff.
    #[instrument(level = "debug", skip_all, fields(cutoffs = cutoffs.len()))]
    pub fn optimize_cutoff(
        candidates: &[(usize, usize)],
        native: ArrayView2<'_, f64>,
        frames: ArrayView3<'_, f64>,
        cutoffs: &[Length],
        cutoff_ratio: f64,
    ) -> Result<CutoffScan> {
        let mut scores = Vec::with_capacity(cutoffs.len());
        let mut best: Option<(usize, Self, f64)> = None;
        for (i, &cutoff) in cutoffs.iter().enumerate() {
            let contacts = match Self::select(candidates, native, cutoff) {
                Ok(contacts) => contacts,
                Err(ThermoError::DegenerateObservable(_)) => {
                    scores.push(None);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let q = contacts.fraction(frames, cutoff_ratio)?;
            let mean = q.mean().ok_or_else(|| {
                ThermoError::DegenerateObservable("no frames to score cutoffs on".to_string())
            })?;
            scores.push(Some(mean));
            if best.as_ref().map_or(true, |&(_, _, b)| mean > b) {
                best = Some((i, contacts, mean));
            }
        }

        let (index, contacts, mean_fraction) = best.ok_or_else(|| {
            ThermoError::DegenerateObservable(format!(
                "none of {} cutoffs selects a native contact",
                cutoffs.len()
            ))
        })?;
        debug!(cutoff = cutoffs[index].internal(), mean_fraction, "chose native contact cutoff");
        Ok(CutoffScan {
            cutoff: cutoffs[index],
            contacts,
            mean_fraction,
            cutoffs: cutoffs.to_vec(),
            scores,
        })
    }

    /// Number of native contacts
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// True if there are no contacts; never true for a selected set
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// The contacting particle pairs
    pub fn pairs(&self) -> &[(usize, usize)] {
        &self.pairs
    }

    /// Native distance of each pair, in nm
    pub fn native_distances(&self) -> &[f64] {
        &self.native_distances
    }

    /// Fraction of native contacts in each frame of `frames[frame, particle, xyz]` (nm).
    ///
    /// A contact is formed when its distance is below `cutoff_ratio` times its native
    /// distance.
    pub fn fraction(&self, frames: ArrayView3<'_, f64>, cutoff_ratio: f64) -> Result<Array1<f64>> {
        if self.pairs.is_empty() {
            return Err(ThermoError::DegenerateObservable(
                "the native contact set is empty".to_string(),
            ));
        }
        if frames.len_of(Axis(2)) != 3 {
            return Err(ThermoError::ArrayLengthMismatch(frames.len_of(Axis(2)), 3));
        }
        if !(cutoff_ratio > 0.0) {
            return Err(ThermoError::InvalidConfiguration(format!(
                "cutoff ratio must be positive, not {}",
                cutoff_ratio
            )));
        }
        check_pairs(&self.pairs, frames.len_of(Axis(1)))?;

        let total = self.pairs.len() as f64;
        Ok(frames
            .outer_iter()
            .map(|positions| {
                let formed = self
                    .pairs
                    .iter()
                    .zip(&self.native_distances)
                    .filter(|&(&(i, j), &native)| distance(positions, i, j) < cutoff_ratio * native)
                    .count();
                formed as f64 / total
            })
            .collect())
    }
}

/// Outcome of [`NativeContacts::optimize_cutoff`]
#[derive(Debug, Clone, PartialEq)]
pub struct CutoffScan {
    /// The winning cutoff
    pub cutoff: Length,
    /// Contacts selected by the winning cutoff
    pub contacts: NativeContacts,
    /// Mean fraction of native contacts at the winning cutoff
    pub mean_fraction: f64,
    /// Every cutoff scanned
    pub cutoffs: Vec<Length>,
    /// Mean fraction at each scanned cutoff; `None` where no contact was selected
    pub scores: Vec<Option<f64>>,
}

/// Cutoffs from `0.95 sigma` to `1.24 sigma` in steps of `0.01 sigma`, for particles of
/// diameter `sigma`
pub fn default_cutoffs(sigma: Length) -> Vec<Length> {
    let sigma = sigma.internal();
    (0..30)
        .map(|i| Length::from_internal((0.95 + 0.01 * i as f64) * sigma))
        .collect()
}

/// Expectation of the native contact fraction at every ladder temperature.
///
/// `q[frame, replica]` is the fraction in each production frame, laid out like the state
/// labels.
#[instrument(level = "debug", skip_all)]
pub fn native_contact_expectation(
    reweighting: &Reweighting,
    q: ArrayView2<'_, f64>,
) -> Result<ObservableSeries<Dimensionless>> {
    let q_n = reweighting.per_sample(q)?;
    let n = reweighting.ladder().len();
    let expectations = reweighting.mbar().compute_expectations(q_n.view())?;
    Ok(ObservableSeries::internal(
        expectations.mu.iter().take(n).copied().collect(),
        expectations.sigma.iter().take(n).copied().collect(),
    ))
}

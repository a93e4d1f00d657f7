//! Replica-exchange energies and configurational state labels, and the bookkeeping that
//! lines them up with each other and with the MBAR sample axis.

use crate::errors::*;
use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayView3, Axis};
use tracing::debug;

/// Reduced potential energies from a replica exchange simulation
///
/// `u_kln[k, l, n]` is the reduced potential energy of replica `k` at frame `n`, evaluated at
/// thermodynamic state `l`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaEnergies {
    u_kln: Array3<f64>,
}

/// Configurational state assignments
///
/// `labels[n, k]` is the configurational state of replica `k` at frame `n`.
#[derive(Debug, Clone, PartialEq)]
pub struct StateLabels {
    labels: Array2<usize>,
}

/// The production period of a trajectory: frames `frame_begin..frame_end` every
/// `sample_spacing`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductionWindow {
    /// Index of the first production frame
    pub frame_begin: usize,
    /// One past the last production frame; `None` runs to the end of the trajectory
    pub frame_end: Option<usize>,
    /// Stride between decorrelated frames
    pub sample_spacing: usize,
}

impl Default for ProductionWindow {
    fn default() -> Self {
        Self::full()
    }
}

impl ProductionWindow {
    /// Every frame
    pub fn full() -> Self {
        Self {
            frame_begin: 0,
            frame_end: None,
            sample_spacing: 1,
        }
    }

    /// Frames `frame_begin..` every `sample_spacing`
    pub fn new(frame_begin: usize, sample_spacing: usize) -> Self {
        Self {
            frame_begin,
            frame_end: None,
            sample_spacing,
        }
    }

    /// Stop the window before `frame_end`
    pub fn ending_at(mut self, frame_end: usize) -> Self {
        self.frame_end = Some(frame_end);
        self
    }

    /// Exclusive end of the window in a trajectory of `n_frames`
    pub fn end_of(&self, n_frames: usize) -> usize {
        self.frame_end.map_or(n_frames, |end| end.min(n_frames))
    }

    /// Number of frames this window keeps out of `n_frames`
    pub fn len_of(&self, n_frames: usize) -> usize {
        if self.sample_spacing == 0 {
            return 0;
        }
        strided_len(
            self.end_of(n_frames).saturating_sub(self.frame_begin),
            self.sample_spacing,
        )
    }

    /// The rows of a `[frame, ..]` array that fall in the window
    pub fn select_frames<'a, T>(&self, frames: ArrayView2<'a, T>) -> Result<ArrayView2<'a, T>> {
        let n_frames = frames.len_of(Axis(0));
        self.validate(n_frames)?;
        let end = self.end_of(n_frames);
        Ok(frames.slice_move(s![self.frame_begin..end;self.sample_spacing as isize, ..]))
    }

    fn validate(&self, n_frames: usize) -> Result<()> {
        if self.sample_spacing == 0 {
            return Err(ThermoError::InvalidConfiguration(
                "sample_spacing must be at least 1".to_string(),
            ));
        }
        if self.frame_begin >= self.end_of(n_frames) {
            return Err(ThermoError::InvalidConfiguration(format!(
                "frames {}..{} leave no frames out of {}",
                self.frame_begin,
                self.end_of(n_frames),
                n_frames
            )));
        }
        Ok(())
    }
}

fn strided_len(len: usize, stride: usize) -> usize {
    (len + stride - 1) / stride
}

impl ReplicaEnergies {
    /// Wrap a `[replica, evaluated state, frame]` tensor
    ///
    /// Replica exchange keeps one replica per thermodynamic state, so the first two axes must
    /// have equal length.
    pub fn new(u_kln: Array3<f64>) -> Result<Self> {
        let (k, l, _) = u_kln.dim();
        if k != l {
            return Err(ThermoError::InputShapeMismatch(format!(
                "energy tensor has {} replicas but {} evaluated states",
                k, l
            )));
        }
        if k == 0 {
            return Err(ThermoError::InputShapeMismatch(
                "energy tensor has no replicas".to_string(),
            ));
        }
        Ok(Self { u_kln })
    }

    /// Number of replicas, equal to the number of thermodynamic states
    pub fn n_replicas(&self) -> usize {
        self.u_kln.len_of(Axis(0))
    }

    /// Number of frames per replica
    pub fn n_frames(&self) -> usize {
        self.u_kln.len_of(Axis(2))
    }

    /// The underlying tensor
    pub fn u_kln(&self) -> ArrayView3<'_, f64> {
        self.u_kln.view()
    }

    /// A view of the frames in `window`
    pub fn production(&self, window: ProductionWindow) -> Result<ArrayView3<'_, f64>> {
        window.validate(self.n_frames())?;
        let end = window.end_of(self.n_frames());
        Ok(self.u_kln.slice(s![
            ..,
            ..,
            window.frame_begin..end;window.sample_spacing as isize
        ]))
    }

    /// Consume the tensor
    pub fn into_inner(self) -> Array3<f64> {
        self.u_kln
    }
}

impl StateLabels {
    /// Wrap a `[frame, replica]` label array
    pub fn new(labels: Array2<usize>) -> Self {
        Self { labels }
    }

    /// Number of frames
    pub fn n_frames(&self) -> usize {
        self.labels.len_of(Axis(0))
    }

    /// Number of replicas
    pub fn n_replicas(&self) -> usize {
        self.labels.len_of(Axis(1))
    }

    /// The underlying labels
    pub fn labels(&self) -> ArrayView2<'_, usize> {
        self.labels.view()
    }

    /// Labels in MBAR sample order: all frames of replica 0, then replica 1, and so on.
    pub fn flatten(&self) -> Array1<usize> {
        flatten_replica_major(self.labels.view())
    }
}

/// Column-major flatten of a `[frame, replica]` array
fn flatten_replica_major<T: Copy>(a: ArrayView2<'_, T>) -> Array1<T> {
    a.t().iter().copied().collect()
}

/// Energies and labels restricted to the production frames and aligned frame-for-frame
#[derive(Debug, Clone, PartialEq)]
pub struct ProductionData {
    /// `[replica, evaluated state, frame]`
    energies: Array3<f64>,
    /// `[frame, replica]`
    labels: Array2<usize>,
}

/// How the labels were reconciled with the production window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelAlignment {
    /// Labels already covered exactly the production frames
    AsIs,
    /// Labels started at the production window but still needed the sample stride
    Strided,
    /// Labels covered every frame and were cut to the production window
    Windowed,
}

impl ProductionData {
    /// Restrict `energies` to `window` and reconcile `labels` with it.
    ///
    /// The label frame count is matched against, in order: the production frames; the
    /// production frames after striding the labels by `sample_spacing`, the labels starting
    /// at `frame_begin` and possibly running past `frame_end`; all frames, in which case the
    /// labels are cut to the window too. Anything else is a misaligned production window.
    pub fn align(
        energies: &ReplicaEnergies,
        labels: &StateLabels,
        window: ProductionWindow,
    ) -> Result<(Self, LabelAlignment)> {
        let production = energies.production(window)?;
        if labels.n_replicas() != energies.n_replicas() {
            return Err(ThermoError::InputShapeMismatch(format!(
                "labels describe {} replicas but the energies have {}",
                labels.n_replicas(),
                energies.n_replicas()
            )));
        }

        let n_production = production.len_of(Axis(2));
        let n_labels = labels.n_frames();
        let stride = window.sample_spacing as isize;
        let end = window.end_of(energies.n_frames());
        let span = end - window.frame_begin;
        let head = n_labels.min(span);

        let (aligned_labels, alignment) = if n_labels == n_production {
            (labels.labels.clone(), LabelAlignment::AsIs)
        } else if strided_len(head, window.sample_spacing) == n_production
            && n_labels <= energies.n_frames() - window.frame_begin
        {
            (
                labels.labels.slice(s![..head;stride, ..]).to_owned(),
                LabelAlignment::Strided,
            )
        } else if n_labels == energies.n_frames() {
            (
                labels
                    .labels
                    .slice(s![window.frame_begin..end;stride, ..])
                    .to_owned(),
                LabelAlignment::Windowed,
            )
        } else {
            return Err(ThermoError::InputShapeMismatch(format!(
                "production window misalignment: {} label frames cannot be matched to {} \
                 production frames ({} total, frames {}..{}, spacing {})",
                n_labels,
                n_production,
                energies.n_frames(),
                window.frame_begin,
                end,
                window.sample_spacing
            )));
        };

        debug!(?alignment, n_production, n_labels, "aligned state labels");
        Ok((
            Self {
                energies: production.to_owned(),
                labels: aligned_labels,
            },
            alignment,
        ))
    }

    /// Pair already-aligned energies and labels
    pub fn new(energies: ReplicaEnergies, labels: StateLabels) -> Result<Self> {
        let (data, _) = Self::align(&energies, &labels, ProductionWindow::full())?;
        Ok(data)
    }

    /// Number of replicas, equal to the number of sampled temperatures
    pub fn n_replicas(&self) -> usize {
        self.energies.len_of(Axis(0))
    }

    /// Number of production frames per replica
    pub fn n_frames(&self) -> usize {
        self.energies.len_of(Axis(2))
    }

    /// Total number of samples, `n_replicas * n_frames`
    pub fn n_samples(&self) -> usize {
        self.n_replicas() * self.n_frames()
    }

    /// `[replica, evaluated state, frame]` energies
    pub fn energies(&self) -> ArrayView3<'_, f64> {
        self.energies.view()
    }

    /// `[frame, replica]` labels
    pub fn labels(&self) -> ArrayView2<'_, usize> {
        self.labels.view()
    }

    /// All evaluated states in `[state, sample]` form, samples in replica-major order
    pub fn kln_to_kn(&self) -> Array2<f64> {
        let (n_replicas, n_states, n_frames) = self.energies.dim();
        let mut u_kn = Array2::zeros((n_states, n_replicas * n_frames));
        for (k, replica) in self.energies.outer_iter().enumerate() {
            u_kn.slice_mut(s![.., k * n_frames..(k + 1) * n_frames])
                .assign(&replica);
        }
        u_kn
    }

    /// One row of [`ProductionData::kln_to_kn`], read straight from the tensor
    pub fn reference_row(&self, state: usize) -> Result<Array1<f64>> {
        let n_states = self.energies.len_of(Axis(1));
        if state >= n_states {
            return Err(ThermoError::ArrayLengthMismatch(state, n_states));
        }
        let row = self.energies.index_axis(Axis(1), state);
        Ok(row.iter().copied().collect())
    }

    /// Labels in MBAR sample order
    pub fn flat_labels(&self) -> Array1<usize> {
        flatten_replica_major(self.labels.view())
    }

    /// Sorted distinct configurational states present in the data
    pub fn distinct_labels(&self) -> Vec<usize> {
        let mut states: Vec<usize> = self.labels.iter().copied().collect();
        states.sort_unstable();
        states.dedup();
        states
    }

    /// Select frames by index, applying the same selection to energies and labels.
    ///
    /// Indices may repeat, as they do when resampling with replacement.
    pub fn resample(&self, frames: &[usize]) -> Result<Self> {
        let n_frames = self.n_frames();
        if let Some(&bad) = frames.iter().find(|&&i| i >= n_frames) {
            return Err(ThermoError::ArrayLengthMismatch(bad, n_frames));
        }
        Ok(Self {
            energies: self.energies.select(Axis(2), frames),
            labels: self.labels.select(Axis(0), frames),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};

    /// u_kln[k, l, n] = 100 k + 10 l + n
    fn tensor(n_replicas: usize, n_frames: usize) -> ReplicaEnergies {
        let u = Array::from_shape_fn((n_replicas, n_replicas, n_frames), |(k, l, n)| {
            (100 * k + 10 * l + n) as f64
        });
        ReplicaEnergies::new(u).unwrap()
    }

    /// labels[n, k] = 10 n + k
    fn labels(n_frames: usize, n_replicas: usize) -> StateLabels {
        StateLabels::new(Array::from_shape_fn((n_frames, n_replicas), |(n, k)| {
            10 * n + k
        }))
    }

    #[test]
    fn labels_already_aligned() {
        let window = ProductionWindow::new(2, 3);
        let (data, how) = ProductionData::align(&tensor(2, 10), &labels(3, 2), window).unwrap();
        assert_eq!(how, LabelAlignment::AsIs);
        assert_eq!(data.n_frames(), 3);
        assert_eq!(data.energies()[[0, 0, 1]], 5.0);
    }

    #[test]
    fn labels_need_stride() {
        // 12 frames, window 1..;4 keeps frames 1, 5, 9. Labels from frame 1 on: 11 frames.
        let window = ProductionWindow::new(1, 4);
        let (data, how) = ProductionData::align(&tensor(2, 12), &labels(11, 2), window).unwrap();
        assert_eq!(how, LabelAlignment::Strided);
        assert_eq!(data.labels().column(0).to_vec(), vec![0, 40, 80]);
    }

    #[test]
    fn labels_need_window() {
        let window = ProductionWindow::new(4, 2);
        let (data, how) = ProductionData::align(&tensor(2, 10), &labels(10, 2), window).unwrap();
        assert_eq!(how, LabelAlignment::Windowed);
        assert_eq!(data.labels().column(1).to_vec(), vec![41, 61, 81]);
        assert_eq!(data.energies()[[1, 0, 0]], 104.0);
    }

    #[test]
    fn misaligned_window_is_an_error() {
        let window = ProductionWindow::new(4, 2);
        let result = ProductionData::align(&tensor(2, 10), &labels(7, 2), window);
        assert!(matches!(result, Err(ThermoError::InputShapeMismatch(_))));

        let result = ProductionData::align(&tensor(2, 10), &labels(10, 3), window);
        assert!(matches!(result, Err(ThermoError::InputShapeMismatch(_))));
    }

    #[test]
    fn bad_windows() {
        let e = tensor(2, 10);
        assert!(e.production(ProductionWindow::new(0, 0)).is_err());
        assert!(e.production(ProductionWindow::new(10, 1)).is_err());
        assert!(e.production(ProductionWindow::new(5, 1).ending_at(5)).is_err());
        assert_eq!(ProductionWindow::new(3, 2).len_of(10), 4);
        assert_eq!(ProductionWindow::new(3, 2).ending_at(8).len_of(10), 3);
        assert_eq!(ProductionWindow::new(3, 2).ending_at(40).len_of(10), 4);
    }

    #[test]
    fn window_with_an_end() {
        // frames 2, 5 out of 2..7
        let window = ProductionWindow::new(2, 3).ending_at(7);
        let e = tensor(2, 12);
        let production = e.production(window).unwrap();
        assert_eq!(production.len_of(Axis(2)), 2);
        assert_eq!(production[[1, 0, 1]], 105.0);

        let (data, how) = ProductionData::align(&e, &labels(12, 2), window).unwrap();
        assert_eq!(how, LabelAlignment::Windowed);
        assert_eq!(data.labels().column(0).to_vec(), vec![20, 50]);

        // labels from frame 2 to the end of the trajectory
        let (data, how) = ProductionData::align(&e, &labels(10, 2), window).unwrap();
        assert_eq!(how, LabelAlignment::Strided);
        assert_eq!(data.labels().column(1).to_vec(), vec![1, 31]);

        let per_frame = Array::from_shape_fn((12, 2), |(n, k)| (10 * n + k) as f64);
        let selected = window.select_frames(per_frame.view()).unwrap();
        assert_eq!(selected, array![[20.0, 21.0], [50.0, 51.0]]);
        assert!(window.select_frames(per_frame.slice(s![..2, ..])).is_err());
    }

    #[test]
    fn reshape_is_replica_major() {
        let data = ProductionData::new(tensor(3, 4), labels(4, 3)).unwrap();
        let u_kn = data.kln_to_kn();
        assert_eq!(u_kn.dim(), (3, 12));
        // sample index k * n_frames + n
        assert_eq!(u_kn[[2, 5]], 100.0 + 20.0 + 1.0);
        assert_eq!(u_kn.row(1), data.reference_row(1).unwrap());

        let flat = data.flat_labels();
        assert_eq!(flat.to_vec(), vec![0, 10, 20, 30, 1, 11, 21, 31, 2, 12, 22, 32]);
    }

    #[test]
    fn resample_keeps_pairs() {
        let data = ProductionData::new(tensor(2, 5), labels(5, 2)).unwrap();
        let boot = data.resample(&[4, 4, 0]).unwrap();
        assert_eq!(boot.n_frames(), 3);
        assert_eq!(boot.labels(), array![[40usize, 41], [40, 41], [0, 1]]);
        assert_eq!(boot.energies()[[1, 1, 1]], 114.0);
        assert!(data.resample(&[5]).is_err());
    }

    #[test]
    fn non_square_tensor() {
        let u = Array3::<f64>::zeros((2, 3, 4));
        assert!(ReplicaEnergies::new(u).is_err());
        let data = ProductionData::new(tensor(2, 3), labels(3, 2)).unwrap();
        assert_eq!(data.resample(&[2, 0, 2]).unwrap().distinct_labels(), vec![0, 1, 20, 21]);
    }
}

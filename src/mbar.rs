use crate::errors::*;
use nalgebra::{DMatrix, DVector, SymmetricEigen, SVD};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use tracing::{debug, instrument, warn};

/// Define the initial guess for free energies
#[derive(Debug, Clone, PartialEq)]
pub enum InitialFreeEnergies {
    /// Use the specified free energy values, one per state
    Specified(Vec<f64>),
    /// Initialize all free energies to zero
    Zeros,
}

impl Default for InitialFreeEnergies {
    fn default() -> Self {
        Self::Zeros
    }
}

impl From<&[f64]> for InitialFreeEnergies {
    fn from(slice: &[f64]) -> Self {
        Self::Specified(Vec::from(slice))
    }
}

/// Method used to compute the asymptotic covariance matrix $\Theta$
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UncertaintyMethod {
    /// Use singular value decomposition of the weight matrix
    ///
    /// See Appendix D.1, Eq. D4 in [1].
    Svd,
    /// Use eigenvalue decomposition of $W^T W$ in place of the SVD
    ///
    /// Equivalent to `Svd` but only ever decomposes a matrix as large as the number of states.
    /// See Appendix D.1, Eqs. D4 and D5 of [1].
    SvdEw,
}

impl Default for UncertaintyMethod {
    fn default() -> Self {
        Self::SvdEw
    }
}

/// Multistate Bennett acceptance ratio method (MBAR) for the analysis of multiple equilibrium
/// samples.
///
/// Building an `MBar` solves the self-consistent equations for the dimensionless free
/// energies of every state; the solution is fixed from then on.
///
/// # Notes
///
/// Note that this method assumes the data are uncorrelated.
///
/// Correlated data must be subsampled to extract uncorrelated (effectively independent) samples.
///
/// # References
///
/// 1. Shirts MR and Chodera JD. Statistically optimal analysis of samples from multiple
/// equilibrium states. J. Chem. Phys. 129:124105, 2008 <http://dx.doi.org/10.1063/1.2978177>
#[derive(Builder, Debug)]
#[builder(
    pattern = "owned",
    build_fn(
        validate = "Self::validate",
        name = "build_inner",
        private,
        error = "ThermoError"
    )
)]
pub struct MBar {
    /// `u_kn[k][n]` is the reduced potential energy of configuration n evaluated at state `k`
    u_kn: Array2<f64>,

    /// `n_k[k]` is the number of uncorrelated snapshots sampled from state `k`
    ///
    /// States with `n_k[k] == 0` are unsampled; MBAR still estimates their free energies.
    n_k: Array1<usize>,

    /// Set to limit the maximum number of iterations performed
    #[builder(default = "10_000")]
    maximum_iterations: usize,

    /// Set to determine the relative tolerance convergence criteria
    #[builder(default = "1.0e-12")]
    relative_tolerance: f64,

    /// Set to the initial dimensionless free energies to use as a guess
    #[builder(default)]
    initial_free_energies: InitialFreeEnergies,

    /// How to compute the asymptotic covariance matrix
    #[builder(default)]
    uncertainty_method: UncertaintyMethod,

    /// Warn if squared-uncertainty is negative and larger in magnitude than this number
    #[builder(default = "1.0e-10")]
    warning_cutoff: f64,

    /// Dimensionless free energies, with `f_k[0] == 0`
    #[builder(setter(skip), default = "Array1::zeros(0)")]
    f_k: Array1<f64>,

    /// $\ln \sum_k N_k \exp(f_k - u_{kn})$ for each sample
    #[builder(setter(skip), default = "Array1::zeros(0)")]
    log_denominator_n: Array1<f64>,

    /// Iterations the solver needed
    #[builder(setter(skip), default)]
    iterations: usize,
}

impl MBarBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let (Some(u_kn), Some(n_k)) = (&self.u_kn, &self.n_k) {
            let k = u_kn.len_of(Axis(0));
            let n_tot = u_kn.len_of(Axis(1));

            if n_tot != n_k.iter().sum::<usize>() {
                return Err(format!(
                    "n_k.sum() must equal the total number of samples ({})",
                    n_tot
                ));
            }

            if k != n_k.len() {
                return Err(format!(
                    "n_k's length must equal the number of states ({})",
                    k
                ));
            }

            if n_tot == 0 {
                return Err("at least one state must have samples".to_string());
            }

            if u_kn.iter().any(|u| u.is_nan()) {
                return Err("u_kn contains NaN".to_string());
            }
        }

        if let Some(tol) = self.relative_tolerance {
            if !(tol > 0.0) {
                return Err(format!("relative_tolerance must be positive, not {}", tol));
            }
        }

        Ok(())
    }

    /// Build the estimator and solve for the free energies of every state
    pub fn build(self) -> Result<MBar> {
        self.build_inner()?.solve()
    }
}

/// The solver's view of the current free energy guess
struct Evaluation {
    log_denominator: Array1<f64>,
    /// $\sum_n W_{ni}$ for each sampled state; one at the solution
    weight_sums: Vec<f64>,
    gradient_norm: f64,
}

/// Sampled-state energies and counts, laid out for the solver
struct SampledStates {
    /// `[sample, sampled state]`
    u_ns: Array2<f64>,
    counts: Vec<f64>,
    log_counts: Vec<f64>,
}

impl SampledStates {
    fn evaluate(&self, f: &[f64]) -> Evaluation {
        let s = f.len();
        let mut weight_sums = vec![0.0; s];
        let mut log_denominator = Array1::zeros(self.u_ns.nrows());
        let mut terms = vec![0.0; s];

        for (n, row) in self.u_ns.outer_iter().enumerate() {
            for (i, term) in terms.iter_mut().enumerate() {
                *term = self.log_counts[i] + f[i] - row[i];
            }
            let ld = logsumexp(terms.iter().copied());
            log_denominator[n] = ld;
            for (i, sum) in weight_sums.iter_mut().enumerate() {
                *sum += (f[i] - row[i] - ld).exp();
            }
        }

        let gradient_norm = self
            .counts
            .iter()
            .zip(&weight_sums)
            .map(|(c, w)| (c * (w - 1.0)).powi(2))
            .sum::<f64>()
            .sqrt();

        Evaluation {
            log_denominator,
            weight_sums,
            gradient_norm,
        }
    }

    /// One self-consistent iteration, Eq. 11 of [1]
    fn self_consistent_update(&self, f: &[f64], eval: &Evaluation) -> Vec<f64> {
        let mut f_new: Vec<f64> = f
            .iter()
            .zip(&eval.weight_sums)
            .map(|(f, w)| f - w.ln())
            .collect();
        let f0 = f_new[0];
        f_new.iter_mut().for_each(|f| *f -= f0);
        f_new
    }

    /// One Newton-Raphson step on the MBAR likelihood, holding `f[0]` fixed
    fn newton_update(&self, f: &[f64], eval: &Evaluation) -> Option<Vec<f64>> {
        let s = f.len();
        if s < 2 {
            return None;
        }
        let m = s - 1;
        let mut hessian = DMatrix::<f64>::zeros(m, m);
        let mut w = vec![0.0; s];

        for (n, row) in self.u_ns.outer_iter().enumerate() {
            let ld = eval.log_denominator[n];
            for (i, w_i) in w.iter_mut().enumerate() {
                *w_i = self.counts[i] * (f[i] - row[i] - ld).exp();
            }
            for i in 1..s {
                for j in i..s {
                    hessian[(i - 1, j - 1)] -= w[i] * w[j];
                }
            }
        }
        for i in 1..s {
            hessian[(i - 1, i - 1)] += self.counts[i] * eval.weight_sums[i];
            for j in 1..i {
                hessian[(i - 1, j - 1)] = hessian[(j - 1, i - 1)];
            }
        }

        let gradient = DVector::from_fn(m, |i, _| {
            self.counts[i + 1] * (eval.weight_sums[i + 1] - 1.0)
        });
        let step = hessian.lu().solve(&gradient)?;

        let mut f_new = f.to_vec();
        for i in 1..s {
            f_new[i] -= step[i - 1];
        }
        if f_new.iter().all(|f| f.is_finite()) {
            Some(f_new)
        } else {
            None
        }
    }
}

impl MBar {
    /// Get a new builder for the `MBar` struct. `MBar` can only be constructed via the builder.
    pub fn builder() -> MBarBuilder {
        MBarBuilder::default()
    }

    /// Solve the MBAR equations; called by the build method
    ///
    /// Each iteration computes both a self-consistent update and a Newton-Raphson step and keeps
    /// whichever leaves the smaller gradient. Only sampled states enter the equations; the free
    /// energies of unsampled states follow in closed form once those have converged.
    #[instrument(level = "debug", skip_all, fields(k = self.k(), n = self.n_tot()))]
    fn solve(mut self) -> Result<Self> {
        let sampled: Vec<usize> = self
            .n_k
            .iter()
            .enumerate()
            .filter(|(_, &n)| n > 0)
            .map(|(k, _)| k)
            .collect();
        let counts: Vec<f64> = sampled.iter().map(|&k| self.n_k[k] as f64).collect();
        let states = SampledStates {
            u_ns: self
                .u_kn
                .select(Axis(0), &sampled)
                .reversed_axes()
                .as_standard_layout()
                .into_owned(),
            log_counts: counts.iter().map(|c| c.ln()).collect(),
            counts,
        };

        let mut f: Vec<f64> = match &self.initial_free_energies {
            InitialFreeEnergies::Specified(energies) => {
                if energies.len() != self.k() {
                    return Err(ThermoError::ArrayLengthMismatch(energies.len(), self.k()));
                }
                sampled.iter().map(|&k| energies[k] - energies[sampled[0]]).collect()
            }
            InitialFreeEnergies::Zeros => vec![0.0; sampled.len()],
        };

        let mut eval = states.evaluate(&f);
        let mut unconverged = Vec::new();
        let mut converged = false;

        for iteration in 1..=self.maximum_iterations {
            let sci = states.self_consistent_update(&f, &eval);
            let sci_eval = states.evaluate(&sci);

            let (f_new, eval_new) = match states.newton_update(&f, &eval) {
                Some(nr) => {
                    let nr_eval = states.evaluate(&nr);
                    if nr_eval.gradient_norm < sci_eval.gradient_norm {
                        (nr, nr_eval)
                    } else {
                        (sci, sci_eval)
                    }
                }
                None => (sci, sci_eval),
            };

            let scale = f_new.iter().fold(1.0_f64, |m, f| m.max(f.abs()));
            let threshold = self.relative_tolerance * scale;
            unconverged = f_new
                .iter()
                .zip(&f)
                .enumerate()
                .filter(|(_, (new, old))| !((*new - *old).abs() <= threshold))
                .map(|(i, _)| sampled[i])
                .collect();

            f = f_new;
            eval = eval_new;

            if unconverged.is_empty() {
                self.iterations = iteration;
                converged = true;
                break;
            }
        }

        if !converged {
            return Err(ThermoError::SolverNonConvergence {
                iterations: self.maximum_iterations,
                states: unconverged,
            });
        }

        let mut log_denominator = eval.log_denominator;
        let mut f_k: Array1<f64> = self
            .u_kn
            .outer_iter()
            .map(|u_n| {
                -logsumexp(
                    u_n.iter()
                        .zip(log_denominator.iter())
                        .map(|(u, ld)| -u - ld),
                )
            })
            .collect();
        let f0 = f_k[0];
        f_k -= f0;
        log_denominator -= f0;

        debug!(iterations = self.iterations, gradient_norm = eval.gradient_norm, "MBAR converged");

        self.f_k = f_k;
        self.log_denominator_n = log_denominator;
        Ok(self)
    }

    /// $N_{tot}$, the total number of snapshots from all states
    pub fn n_tot(&self) -> usize {
        self.u_kn.len_of(Axis(1))
    }

    /// $K$, the total number of thermodynamic states
    pub fn k(&self) -> usize {
        self.u_kn.len_of(Axis(0))
    }

    /// `u_kn[k][n]` is the reduced potential energy of configuration n evaluated at state `k`
    pub fn u_kn(&self) -> &Array2<f64> {
        &self.u_kn
    }

    /// `n_k[k]` is the number of uncorrelated snapshots sampled from state `k`
    pub fn n_k(&self) -> &Array1<usize> {
        &self.n_k
    }

    /// Dimensionless free energies $f_k$ of all states, relative to state 0
    pub fn f_k(&self) -> &Array1<f64> {
        &self.f_k
    }

    /// Number of iterations the solver needed
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// The log weight matrix $\ln W_{nk}$, `[sample, state]`
    pub fn log_w_nk(&self) -> Array2<f64> {
        let mut log_w = Array2::zeros((self.n_tot(), self.k()));
        for (k, mut column) in log_w.axis_iter_mut(Axis(1)).enumerate() {
            column.assign(&self.log_weights_of_state(k));
        }
        log_w
    }

    /// The weight matrix $W_{nk}$; each column sums to one
    pub fn w_nk(&self) -> Array2<f64> {
        self.log_w_nk().mapv(f64::exp)
    }

    fn log_weights_of_state(&self, k: usize) -> Array1<f64> {
        let f = self.f_k[k];
        let u_n = self.u_kn.row(k);
        u_n.iter()
            .zip(self.log_denominator_n.iter())
            .map(|(u, ld)| f - u - ld)
            .collect()
    }

    /// Free energy and log weights of an arbitrary state given its reduced energies
    fn log_weights_of_energies(&self, u_n: ArrayView1<'_, f64>) -> (f64, Array1<f64>) {
        let f = -logsumexp(
            u_n.iter()
                .zip(self.log_denominator_n.iter())
                .map(|(u, ld)| -u - ld),
        );
        let log_w = u_n
            .iter()
            .zip(self.log_denominator_n.iter())
            .map(|(u, ld)| f - u - ld)
            .collect();
        (f, log_w)
    }

    /// Compute the effective sample number of each state
    ///
    /// The effective sample number $n_\mathrm{eff}(k)$ is an estimate of how many samples are
    /// contributing to the average at a given state. Valid for both sampled states, in which
    /// the weight will be greater than `N_k[k]`, and unsampled states.
    ///
    /// # Notes
    ///
    /// Using Kish (1965) formula (Kish, Leslie (1965). Survey Sampling. New York: Wiley):
    ///
    /// $$
    ///     n_\mathrm{eff}(k) = \frac{(\sum_{n=1}^N W_{nk})^2}{\sum_{n=1}^N W_{nk}^2}
    ///                       = \frac{1}{\sum_{n=1}^N W_{nk}^2}
    /// $$
    pub fn n_eff(&self) -> Array1<f64> {
        (0..self.k())
            .map(|k| {
                let sum_sq: f64 = self
                    .log_weights_of_state(k)
                    .iter()
                    .map(|lw| (2.0 * lw).exp())
                    .sum();
                1.0 / sum_sq
            })
            .collect()
    }

    /// Dimensionless free energy differences between every pair of states and their
    /// uncertainties
    pub fn free_energy_differences(&self) -> Result<FreeEnergyDifferences> {
        let k = self.k();
        let mut w = DMatrix::zeros(self.n_tot(), k);
        for state in 0..k {
            fill_column(&mut w, state, &self.log_weights_of_state(state));
        }
        let theta = asymptotic_covariance(&w, &self.augmented_counts(k), self.uncertainty_method)?;

        let delta_f = Array2::from_shape_fn((k, k), |(i, j)| self.f_k[j] - self.f_k[i]);
        let d_delta_f = Array2::from_shape_fn((k, k), |(i, j)| {
            let var = theta[(i, i)] + theta[(j, j)] - 2.0 * theta[(i, j)];
            self.checked_sqrt(var)
        });
        Ok(FreeEnergyDifferences { delta_f, d_delta_f })
    }

    /// Compute the expectation of an observable of a phase space function.
    ///
    /// Compute the expectation of an observable of a single phase space function A(x) at all
    /// states where potentials are generated. `a_n[n]` is $A(x_n)$.
    ///
    /// # References
    ///
    /// See Section IV of [1].
    #[instrument(level = "debug", skip_all)]
    pub fn compute_expectations(&self, a_n: ArrayView1<'_, f64>) -> Result<Expectations> {
        let a_in = a_n.insert_axis(Axis(0));
        let pairs: Vec<(usize, usize)> = (0..self.k()).map(|k| (0, k)).collect();
        let inner = self.expectations_inner(a_in, None, &pairs)?;
        let sigma = inner.covariance.diag().mapv(|v| self.checked_sqrt(v));
        Ok(Expectations {
            mu: inner.mu,
            sigma,
            covariance: inner.covariance,
        })
    }

    /// Compute the expectations of several observables at one thermodynamic state.
    ///
    /// `a_in[i][n]` is observable `i` for sample `n`; `u_n[n]` is the reduced energy of sample
    /// `n` in the target state, which need not be one of the `K` states.
    #[instrument(level = "debug", skip_all)]
    pub fn compute_multiple_expectations(
        &self,
        a_in: ArrayView2<'_, f64>,
        u_n: ArrayView1<'_, f64>,
        compute_covariance: bool,
    ) -> Result<MultipleExpectations> {
        let u_ln = u_n.insert_axis(Axis(0));
        let pairs: Vec<(usize, usize)> = (0..a_in.nrows()).map(|i| (i, 0)).collect();
        let inner = self.expectations_inner(a_in, Some(u_ln), &pairs)?;
        let sigma = inner.covariance.diag().mapv(|v| self.checked_sqrt(v));

        let (covariance, log_covariance) = if compute_covariance {
            let mu = &inner.mu;
            let log_cov = Array2::from_shape_fn(inner.covariance.dim(), |(i, j)| {
                inner.covariance[[i, j]] / (mu[i] * mu[j])
            });
            (Some(inner.covariance), Some(log_cov))
        } else {
            (None, None)
        };

        Ok(MultipleExpectations {
            mu: inner.mu,
            sigma,
            covariance,
            log_covariance,
        })
    }

    /// Expectations of observables at states, with their joint covariance.
    ///
    /// `pairs[p] = (i, s)` requests observable `i` at target state `s`. Targets are the `K`
    /// states themselves when `u_ln` is `None`, otherwise the rows of `u_ln`.
    fn expectations_inner(
        &self,
        a_in: ArrayView2<'_, f64>,
        u_ln: Option<ArrayView2<'_, f64>>,
        pairs: &[(usize, usize)],
    ) -> Result<InnerExpectations> {
        let n_tot = self.n_tot();
        let k = self.k();
        if a_in.ncols() != n_tot {
            return Err(ThermoError::ArrayLengthMismatch(a_in.ncols(), n_tot));
        }
        if a_in.iter().any(|a| !a.is_finite()) {
            return Err(ThermoError::InvalidConfiguration(
                "observable values must be finite".to_string(),
            ));
        }
        if let Some(u_ln) = &u_ln {
            if u_ln.ncols() != n_tot {
                return Err(ThermoError::ArrayLengthMismatch(u_ln.ncols(), n_tot));
            }
        }

        // Shift each observable to be >= 1 so its log is defined; covariances are unaffected.
        let offsets: Vec<f64> = a_in
            .outer_iter()
            .map(|a| a.iter().fold(f64::INFINITY, |m, &v| m.min(v)) - 1.0)
            .collect();

        let n_targets = u_ln.as_ref().map_or(0, |u| u.nrows());
        let n_cols = k + n_targets + pairs.len();
        let mut w = DMatrix::zeros(n_tot, n_cols);

        let mut target_log_w: Vec<Array1<f64>> = Vec::new();
        for state in 0..k {
            let log_w = self.log_weights_of_state(state);
            fill_column(&mut w, state, &log_w);
            if u_ln.is_none() {
                target_log_w.push(log_w);
            }
        }
        if let Some(u_ln) = &u_ln {
            for (t, u_n) in u_ln.outer_iter().enumerate() {
                let (_, log_w) = self.log_weights_of_energies(u_n);
                fill_column(&mut w, k + t, &log_w);
                target_log_w.push(log_w);
            }
        }
        let target_column = |s: usize| if u_ln.is_some() { k + s } else { s };

        let mut shifted_mu = Vec::with_capacity(pairs.len());
        for (p, &(i, s)) in pairs.iter().enumerate() {
            let log_w = target_log_w.get(s).ok_or(ThermoError::ArrayLengthMismatch(
                s,
                target_log_w.len(),
            ))?;
            let a = a_in.row(i);
            let log_wa: Array1<f64> = log_w
                .iter()
                .zip(a.iter())
                .map(|(lw, a)| lw + (a - offsets[i]).ln())
                .collect();
            let log_mu = logsumexp(log_wa.iter().copied());
            fill_column(&mut w, k + n_targets + p, &log_wa.mapv(|v| v - log_mu));
            shifted_mu.push(log_mu.exp());
        }

        let theta = asymptotic_covariance(&w, &self.augmented_counts(n_cols), self.uncertainty_method)?;

        let n_pairs = pairs.len();
        let covariance = Array2::from_shape_fn((n_pairs, n_pairs), |(p, q)| {
            let (ap, aq) = (k + n_targets + p, k + n_targets + q);
            let (sp, sq) = (target_column(pairs[p].1), target_column(pairs[q].1));
            shifted_mu[p]
                * shifted_mu[q]
                * (theta[(ap, aq)] - theta[(ap, sq)] - theta[(sp, aq)] + theta[(sp, sq)])
        });
        let mu = pairs
            .iter()
            .zip(&shifted_mu)
            .map(|(&(i, _), m)| m + offsets[i])
            .collect();

        Ok(InnerExpectations { mu, covariance })
    }

    /// `N_k` padded with zeros to `n_cols` entries
    fn augmented_counts(&self, n_cols: usize) -> Vec<f64> {
        let mut counts: Vec<f64> = self.n_k.iter().map(|&n| n as f64).collect();
        counts.resize(n_cols, 0.0);
        counts
    }

    /// Square root of a variance, clamping small negative values from round-off
    fn checked_sqrt(&self, variance: f64) -> f64 {
        if variance < 0.0 {
            if -variance > self.warning_cutoff {
                warn!(variance, "squared uncertainty is negative; clamping to zero");
            }
            0.0
        } else {
            variance.sqrt()
        }
    }
}

fn fill_column(w: &mut DMatrix<f64>, column: usize, log_w: &Array1<f64>) {
    for (n, lw) in log_w.iter().enumerate() {
        w[(n, column)] = lw.exp();
    }
}

/// Asymptotic covariance $\Theta$ of the log normalisation constants of the states whose
/// normalised weights form the columns of `w`.
///
/// $$
///     \Theta = V \Sigma \left[ I - \Sigma V^T N V \Sigma \right]^+ \Sigma V^T
/// $$
///
/// where $W = U \Sigma V^T$ and $N$ holds the sample counts on its diagonal.
fn asymptotic_covariance(
    w: &DMatrix<f64>,
    counts: &[f64],
    method: UncertaintyMethod,
) -> Result<DMatrix<f64>> {
    let (v, sigma) = match method {
        UncertaintyMethod::SvdEw => {
            let eigen = SymmetricEigen::new(w.tr_mul(w));
            let sigma = eigen.eigenvalues.map(|l| l.max(0.0).sqrt());
            (eigen.eigenvectors, sigma)
        }
        UncertaintyMethod::Svd => {
            let svd = SVD::new(w.clone(), true, true);
            let v_t = svd.v_t.ok_or_else(|| {
                ThermoError::Numerical("SVD of the weight matrix produced no V".to_string())
            })?;
            let v = v_t.transpose();
            // singular values taken as |W v_i| so they pair with their own right vectors
            let sigma = DVector::from_iterator(v.ncols(), (w * &v).column_iter().map(|c| c.norm()));
            (v, sigma)
        }
    };

    let r = sigma.len();
    let m = counts.len();
    let mut inner = DMatrix::<f64>::identity(r, r);
    for i in 0..r {
        for j in 0..r {
            let vt_n_v: f64 = (0..m).map(|c| v[(c, i)] * counts[c] * v[(c, j)]).sum();
            inner[(i, j)] -= sigma[i] * vt_n_v * sigma[j];
        }
    }

    // W N 1 = 1 and W^T 1 = 1 make Sigma V^T N 1 an exact null vector of the inner matrix
    let mut null = DVector::from_fn(r, |i, _| {
        sigma[i] * (0..m).map(|c| v[(c, i)] * counts[c]).sum::<f64>()
    });
    let norm = null.norm();
    if !(norm > 0.0 && norm.is_finite()) {
        return Err(ThermoError::Numerical(
            "weight matrix has no sampled-state component".to_string(),
        ));
    }
    null /= norm;
    let projector = &null * null.transpose();
    let deflated = inner + &projector;
    let inverse = match deflated.clone().lu().try_inverse() {
        Some(inverse) => inverse - &projector,
        None => symmetric_pseudoinverse(deflated - &projector, 1.0e-10),
    };

    let mut v_sigma = v;
    for (i, mut column) in v_sigma.column_iter_mut().enumerate() {
        column.scale_mut(sigma[i]);
    }
    Ok(&v_sigma * inverse * v_sigma.transpose())
}

/// Pseudoinverse of a symmetric matrix, dropping eigenvalues below `rcond` times the largest
fn symmetric_pseudoinverse(a: DMatrix<f64>, rcond: f64) -> DMatrix<f64> {
    let eigen = SymmetricEigen::new(a);
    let largest = eigen.eigenvalues.iter().fold(0.0_f64, |m, l| m.max(l.abs()));
    let cutoff = rcond * largest;
    let mut scaled = eigen.eigenvectors.clone();
    for (i, mut column) in scaled.column_iter_mut().enumerate() {
        let l = eigen.eigenvalues[i];
        column.scale_mut(if l.abs() > cutoff { 1.0 / l } else { 0.0 });
    }
    scaled * eigen.eigenvectors.transpose()
}

/// $\ln \sum_i \exp(x_i)$ without overflow
pub(crate) fn logsumexp<I>(values: I) -> f64
where
    I: Iterator<Item = f64> + Clone,
{
    let max = values.clone().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.map(|v| (v - max).exp()).sum::<f64>().ln()
}

struct InnerExpectations {
    mu: Array1<f64>,
    covariance: Array2<f64>,
}

/// Expectations for a value at every state
#[derive(Debug, Clone)]
pub struct Expectations {
    /// `mu[i]` is the estimate for the expectation of $A(x)$ for thermodynamic state `i`.
    pub mu: Array1<f64>,
    /// `sigma[i]` is the uncertainty estimate at one standard deviation for mu[i]
    pub sigma: Array1<f64>,
    /// `covariance[i, j]` is the covariance of `mu[i]` and `mu[j]`
    pub covariance: Array2<f64>,
}

/// Expectations of several observables at one state
#[derive(Debug, Clone)]
pub struct MultipleExpectations {
    /// `mu[i]` is the expectation of observable `i`
    pub mu: Array1<f64>,
    /// `sigma[i]` is the uncertainty estimate at one standard deviation for mu[i]
    pub sigma: Array1<f64>,
    /// `covariance[i, j]` is the covariance of `mu[i]` and `mu[j]`
    pub covariance: Option<Array2<f64>>,
    /// `log_covariance[i, j]` is the covariance of `ln mu[i]` and `ln mu[j]`
    pub log_covariance: Option<Array2<f64>>,
}

/// Free energy differences between every pair of states
#[derive(Debug, Clone)]
pub struct FreeEnergyDifferences {
    /// `delta_f[i, j]` is the dimensionless free energy difference $f_j - f_i$
    pub delta_f: Array2<f64>,
    /// `d_delta_f[i, j]` is the uncertainty in the dimensionless free energy difference $f_j - f_i$
    pub d_delta_f: Array2<f64>,
}

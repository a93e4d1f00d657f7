use derive_builder::UninitializedFieldError;
use thiserror::Error;

/// Enum for errors in this crate
#[derive(Error, Debug)]
pub enum ThermoError {
    /// Error returned when a builder was missing a field or failed validation
    #[error("Could not build configuration: {0}")]
    BuilderError(String),

    /// Error returned when the energy tensor and the state labels cannot be aligned
    #[error("Input shape mismatch: {0}")]
    InputShapeMismatch(String),

    /// Error returned when MBAR does not reach its tolerance within the iteration budget
    #[error(
        "MBAR failed to converge after {iterations} iterations; states still changing: {states:?}"
    )]
    SolverNonConvergence {
        /// Number of iterations performed
        iterations: usize,
        /// Indices of the states whose free energies had not converged
        states: Vec<usize>,
    },

    /// Error returned when an observable is built over an empty reference set
    #[error("Degenerate observable: {0}")]
    DegenerateObservable(String),

    /// Error returned for settings that can never produce a meaningful calculation
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Error returned when a dense linear algebra step fails
    #[error("Numerical failure: {0}")]
    Numerical(String),

    /// Error returned when an array is the wrong length
    #[error("Array of length {0} is incorrect; length should be {1}")]
    ArrayLengthMismatch(usize, usize),

    /// Error returned when the replica exchange driver gives up
    #[error("Replica exchange simulation failed after {attempts} attempts (last time step {last_time_step} ps): {reason}")]
    SimulationFailed {
        /// Number of runs attempted
        attempts: usize,
        /// Time step of the final attempt, in picoseconds
        last_time_step: f64,
        /// Reason reported by the engine
        reason: String,
    },
}

impl From<String> for ThermoError {
    fn from(s: String) -> Self {
        Self::BuilderError(s)
    }
}

impl From<UninitializedFieldError> for ThermoError {
    fn from(e: UninitializedFieldError) -> Self {
        Self::BuilderError(e.to_string())
    }
}

/// Result type for the remd-thermo crate
pub type Result<T> = std::result::Result<T, ThermoError>;

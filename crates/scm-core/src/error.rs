//! Error types for synthstat

use thiserror::Error;

/// synthstat error type
#[derive(Error, Debug)]
pub enum Error {
    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),

    /// The panel cannot be pivoted unambiguously (fatal for the run).
    #[error("Malformed panel: {0}")]
    MalformedPanel(String),

    /// No feasible donor weights (no donors, non-finite data, solver breakdown).
    ///
    /// Recoverable inside placebo loops: the iteration is excluded.
    #[error("Infeasible weights: {0}")]
    InfeasibleWeights(String),

    /// Pre-period mean of the series being rescaled is zero or undefined.
    #[error("Undefined rescale: pre-period mean of series is {series_mean}")]
    UndefinedRescale {
        /// Pre-period mean of the series that would be the divisor.
        series_mean: f64,
    },
}

impl Error {
    /// Whether a placebo/sensitivity loop may skip the iteration that raised this.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::InfeasibleWeights(_) | Error::UndefinedRescale { .. })
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

//! # scm-core
//!
//! Shared foundation for synthstat: the error taxonomy, the monthly time axis,
//! raw panel rows and the donor-weight solver trait.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error taxonomy and `Result` alias.
pub mod error;
/// Solver abstraction.
pub mod traits;
/// Periods, ranges and raw observations.
pub mod types;

pub use error::{Error, Result};
pub use traits::WeightSolver;
pub use types::{Period, PeriodRange, RawObservation};

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

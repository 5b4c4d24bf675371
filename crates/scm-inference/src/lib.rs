//! # scm-inference
//!
//! Synthetic control estimation for monthly rate panels.
//!
//! This crate provides:
//! - the panel store and its wide `time × unit` projections,
//! - the simplex-constrained donor-weight solver,
//! - synthetic series construction with optional level rescaling,
//! - ATT and pre-period fit diagnostics,
//! - in-space and in-time placebo inference,
//! - donor-pool sensitivity runs and a DiD regression cross-check.
//!
//! ## Architecture
//!
//! Every loop goes through [`SyntheticControl::estimate`], which is generic
//! over the `WeightSolver` trait from `scm-core`. Loops derive new
//! [`RunDesign`]s and never share mutable state, so they run on `rayon`.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Regression cross-checks: DiD with cluster-robust SE.
pub mod econometrics;
/// ATT and fit diagnostics.
pub mod estimator;
/// Long panel and wide slices.
pub mod panel;
/// Run design and the single-fit pipeline.
pub mod pipeline;
/// Cross-sectional placebo and shared placebo statistics.
pub mod placebo;
/// Donor-pool sensitivity runs.
pub mod sensitivity;
/// Active-set QP for simplex-constrained donor weights.
pub mod solver;
/// Synthetic series and rescaling.
pub mod synthetic;
/// Temporal pseudo-treatment placebo.
pub mod temporal;

pub use econometrics::{DidCrossCheck, did_cross_check};
pub use estimator::AttResult;
pub use panel::{DropCounts, Panel, PanelObservation, WideSlice};
pub use pipeline::{DonorWeights, RunDesign, ScmFit, SyntheticControl};
pub use placebo::{
    CrossSectionalResult, MspeRatioTable, PlaceboOutcome, PlaceboStats, PlaceboStatus,
    SkipReason, cross_sectional_placebo,
};
pub use sensitivity::{DonorSubset, SubsetOutcome, leave_one_out, run_sensitivity};
pub use solver::ActiveSetSolver;
pub use temporal::{CutoffResult, TemporalConfig, TemporalResult, temporal_placebo};

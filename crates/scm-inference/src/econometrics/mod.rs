//! Regression diagnostics run alongside the synthetic control.
//!
//! - **DiD cross-check**: two-group, two-period OLS with an optional
//!   unit-level covariate.
//! - **Cluster-robust SE**: Liang–Zeger sandwich, clustered by unit.

pub mod cluster;
pub mod did;

pub use cluster::cluster_robust_se;
pub use did::{DidCrossCheck, did_cross_check};

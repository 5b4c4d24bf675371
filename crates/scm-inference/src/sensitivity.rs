//! Donor-pool sensitivity runs.
//!
//! Repeats the main fit and the in-space placebo for named donor subsets.
//! A subset whose fit fails is reported with its error; the batch goes on.

use rayon::prelude::*;
use scm_core::{Result, WeightSolver};
use serde::{Deserialize, Serialize};

use crate::panel::WideSlice;
use crate::pipeline::{DonorWeights, RunDesign, SyntheticControl};
use crate::placebo;

/// A named donor pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonorSubset {
    /// Label used in reports.
    pub name: String,
    /// Donor units.
    pub donors: Vec<String>,
}

impl DonorSubset {
    /// Named subset.
    pub fn new(name: impl Into<String>, donors: Vec<String>) -> Self {
        Self { name: name.into(), donors }
    }
}

/// One subset per donor, each dropping that donor (`"drop:<unit>"`).
pub fn leave_one_out(donors: &[String]) -> Vec<DonorSubset> {
    donors
        .iter()
        .map(|dropped| {
            let kept = donors.iter().filter(|d| *d != dropped).cloned().collect();
            DonorSubset::new(format!("drop:{dropped}"), kept)
        })
        .collect()
}

/// Estimates for one subset.
#[derive(Debug, Clone, Serialize)]
pub struct SubsetEstimate {
    /// ATT.
    pub att: f64,
    /// ATT minus mean placebo ATT.
    pub bias_corrected_att: Option<f64>,
    /// Placebo SD.
    pub se: Option<f64>,
    /// Permutation p-value.
    pub p_value: Option<f64>,
    /// Normal p-value.
    pub p_value_normal: Option<f64>,
    /// Placebos fitted.
    pub n_placebos: usize,
    /// Pre-period MSPE of the main fit.
    pub mspe_pre: f64,
    /// Donor weights.
    pub weights: DonorWeights,
}

/// Outcome of one subset run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubsetStatus {
    /// Fit and placebo ran.
    Estimated(SubsetEstimate),
    /// Main fit failed.
    Failed {
        /// Error message.
        error: String,
    },
}

/// Report row for one subset.
#[derive(Debug, Clone, Serialize)]
pub struct SubsetOutcome {
    /// Subset label.
    pub name: String,
    /// Donor pool used.
    pub donors: Vec<String>,
    /// Outcome.
    #[serde(flatten)]
    pub status: SubsetStatus,
}

impl SubsetOutcome {
    /// The estimate, if the subset ran.
    pub fn estimate(&self) -> Option<&SubsetEstimate> {
        match &self.status {
            SubsetStatus::Estimated(e) => Some(e),
            SubsetStatus::Failed { .. } => None,
        }
    }
}

fn run_subset<S: WeightSolver>(
    control: &SyntheticControl<S>,
    wide: &WideSlice,
    design: &RunDesign,
    subset: &DonorSubset,
) -> Result<SubsetEstimate> {
    let design = design.with_donors(subset.donors.clone())?;
    let fit = control.estimate(wide, &design)?.require_defined()?;
    let placebo = placebo::cross_sectional_placebo(control, wide, &design, &fit)?;
    Ok(SubsetEstimate {
        att: fit.effect.att,
        bias_corrected_att: placebo.bias_corrected_att,
        se: placebo.stats.se,
        p_value: placebo.stats.p_value_permutation,
        p_value_normal: placebo.stats.p_value_normal,
        n_placebos: placebo.stats.n_fitted,
        mspe_pre: fit.effect.mspe_pre,
        weights: fit.weights,
    })
}

/// Run every subset against `design` (treated unit, dates and rescale flag
/// are kept; only the donor pool changes). Results are in subset order.
pub fn run_sensitivity<S: WeightSolver>(
    control: &SyntheticControl<S>,
    wide: &WideSlice,
    design: &RunDesign,
    subsets: &[DonorSubset],
) -> Vec<SubsetOutcome> {
    subsets
        .par_iter()
        .map(|subset| {
            let status = match run_subset(control, wide, design, subset) {
                Ok(est) => SubsetStatus::Estimated(est),
                Err(e) => {
                    if e.is_recoverable() {
                        log::warn!("sensitivity subset '{}' not estimable: {e}", subset.name);
                    } else {
                        log::error!("sensitivity subset '{}' failed: {e}", subset.name);
                    }
                    SubsetStatus::Failed { error: e.to_string() }
                }
            };
            SubsetOutcome { name: subset.name.clone(), donors: subset.donors.clone(), status }
        })
        .collect()
}

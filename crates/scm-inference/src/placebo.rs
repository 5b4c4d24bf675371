//! Cross-sectional (in-space) placebo inference.
//!
//! Every donor is re-cast as the treated unit and fitted against the
//! remaining donors with the real run's cutoff and post mask. Failed fits
//! are tagged and excluded; every statistic is computed over the fitted
//! subset only.
//!
//! # Statistics
//!
//! - permutation p-value: `#{|ATT_placebo| ≥ |ATT|} / n_fitted` (two-sided),
//! - SE: sample standard deviation of the placebo ATTs,
//! - normal p-value: `2·(1 − Φ(|ATT| / SE))`,
//! - bias: mean placebo ATT; bias-corrected ATT = ATT − bias,
//! - MSPE-ratio rank of the treated unit among all post/pre ratios.

use rayon::prelude::*;
use scm_core::{Error, Result, WeightSolver};
use serde::Serialize;

use crate::panel::WideSlice;
use crate::pipeline::{RunDesign, ScmFit, SyntheticControl};

/// Why an iteration was excluded from a placebo distribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Weight fitting failed.
    InfeasibleWeights {
        /// Solver message.
        detail: String,
    },
    /// Rescale divisor was zero or undefined.
    UndefinedRescale,
    /// ATT undefined (no defined gap point on one side).
    UndefinedEffect,
    /// Too few usable pre-cutoff periods.
    InsufficientHistory {
        /// Usable periods found.
        available: usize,
        /// Periods required.
        required: usize,
    },
}

impl SkipReason {
    /// Map a recoverable error to a skip reason; other errors are returned.
    pub fn from_error(err: Error) -> Result<SkipReason> {
        match err {
            Error::InfeasibleWeights(detail) => Ok(SkipReason::InfeasibleWeights { detail }),
            Error::UndefinedRescale { .. } => Ok(SkipReason::UndefinedRescale),
            other => Err(other),
        }
    }
}

/// Summary of one fitted placebo.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlaceboFit {
    /// Placebo ATT.
    pub att: f64,
    /// Pre-period MSPE.
    pub mspe_pre: f64,
    /// Post-period MSPE.
    pub mspe_post: f64,
    /// Post/pre MSPE ratio.
    pub mspe_ratio: f64,
}

/// Tagged outcome of one placebo iteration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PlaceboStatus {
    /// Fitted successfully.
    Fitted(PlaceboFit),
    /// Excluded from the distribution.
    Skipped(SkipReason),
}

impl PlaceboStatus {
    /// The fit, if any.
    pub fn fitted(&self) -> Option<&PlaceboFit> {
        match self {
            PlaceboStatus::Fitted(f) => Some(f),
            PlaceboStatus::Skipped(_) => None,
        }
    }
}

/// Placebo outcome for one unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaceboOutcome {
    /// Unit re-cast as treated.
    pub unit: String,
    /// Outcome.
    #[serde(flatten)]
    pub status: PlaceboStatus,
}

/// Run one design and tag the result.
///
/// Recoverable failures become `Skipped`; anything else aborts.
pub fn evaluate<S: WeightSolver>(
    control: &SyntheticControl<S>,
    wide: &WideSlice,
    window: &WideSlice,
    design: &RunDesign,
) -> Result<PlaceboStatus> {
    match control.estimate_in_window(wide, window, design).and_then(ScmFit::require_defined) {
        Ok(fit) if fit.effect.att.is_finite() => Ok(PlaceboStatus::Fitted(PlaceboFit {
            att: fit.effect.att,
            mspe_pre: fit.effect.mspe_pre,
            mspe_post: fit.effect.mspe_post,
            mspe_ratio: fit.effect.mspe_ratio,
        })),
        Ok(_) => Ok(PlaceboStatus::Skipped(SkipReason::UndefinedEffect)),
        Err(e) => {
            let reason = SkipReason::from_error(e)?;
            log::debug!("placebo for '{}' skipped: {:?}", design.treated, reason);
            Ok(PlaceboStatus::Skipped(reason))
        }
    }
}

/// Statistics of a placebo distribution relative to a real ATT.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlaceboStats {
    /// Iterations attempted.
    pub n_attempted: usize,
    /// Iterations that produced a placebo ATT.
    pub n_fitted: usize,
    /// Iterations excluded.
    pub n_skipped: usize,
    /// Mean placebo ATT.
    pub bias: Option<f64>,
    /// Sample SD of placebo ATTs (None if < 2 fits or zero variance).
    pub se: Option<f64>,
    /// `ATT / SE`.
    pub z: Option<f64>,
    /// Two-sided normal p-value from `z`.
    pub p_value_normal: Option<f64>,
    /// Two-sided permutation p-value.
    pub p_value_permutation: Option<f64>,
}

/// Arithmetic mean, `None` for an empty slice.
pub fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() { None } else { Some(xs.iter().sum::<f64>() / xs.len() as f64) }
}

/// Sample standard deviation (n − 1), `None` for fewer than two values.
pub fn sample_sd(xs: &[f64]) -> Option<f64> {
    if xs.len() < 2 {
        return None;
    }
    let m = mean(xs)?;
    let ss: f64 = xs.iter().map(|x| (x - m).powi(2)).sum();
    Some((ss / (xs.len() - 1) as f64).sqrt())
}

/// Relative and absolute slack for counting a placebo ATT as tied with the real one.
const TIE_RTOL: f64 = 1e-9;
const TIE_ATOL: f64 = 1e-12;

/// `#{|p| ≥ |real|} / n`, `None` for an empty distribution or undefined ATT.
///
/// Values within round-off of `|real|` count as ties, so an exact fit whose
/// ATT carries float noise still ranks with zero placebo ATTs.
pub fn permutation_p_value(real: f64, placebo: &[f64]) -> Option<f64> {
    if placebo.is_empty() || !real.is_finite() {
        return None;
    }
    let threshold = real.abs() - (TIE_RTOL * real.abs() + TIE_ATOL);
    let extreme = placebo.iter().filter(|p| p.abs() >= threshold).count();
    Some(extreme as f64 / placebo.len() as f64)
}

/// Two-sided standard normal p-value.
pub fn normal_two_sided_p(z: f64) -> f64 {
    statrs::function::erf::erfc(z.abs() / std::f64::consts::SQRT_2)
}

/// SE, z and normal p-value from a draw distribution; all `None` when the
/// SE is degenerate.
pub fn normal_inference(att: f64, draws: &[f64]) -> (Option<f64>, Option<f64>, Option<f64>) {
    match sample_sd(draws) {
        Some(se) if se.is_finite() && se > 0.0 && att.is_finite() => {
            let z = att / se;
            (Some(se), Some(z), Some(normal_two_sided_p(z)))
        }
        _ => (None, None, None),
    }
}

impl PlaceboStats {
    /// Summarise `placebo_atts` (fitted values only) against `real_att`.
    pub fn compute(real_att: f64, placebo_atts: &[f64], n_attempted: usize) -> Self {
        let (se, z, p_value_normal) = normal_inference(real_att, placebo_atts);
        Self {
            n_attempted,
            n_fitted: placebo_atts.len(),
            n_skipped: n_attempted - placebo_atts.len(),
            bias: mean(placebo_atts),
            se,
            z,
            p_value_normal,
            p_value_permutation: permutation_p_value(real_att, placebo_atts),
        }
    }
}

/// One row of the MSPE-ratio table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MspeRatioRow {
    /// Unit.
    pub unit: String,
    /// Whether this row is the real treated unit.
    pub is_treated: bool,
    /// Pre-period MSPE.
    pub mspe_pre: f64,
    /// Post-period MSPE.
    pub mspe_post: f64,
    /// Post/pre ratio.
    pub ratio: f64,
}

/// Post/pre MSPE ratios of the treated unit and every fitted placebo,
/// sorted descending (undefined ratios last).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MspeRatioTable {
    /// Rows, most extreme first.
    pub rows: Vec<MspeRatioRow>,
    /// Rank of the treated unit (1 = largest ratio); ties count against it.
    pub treated_rank: Option<usize>,
    /// `treated_rank / rows.len()`.
    pub rank_p_value: Option<f64>,
}

impl MspeRatioTable {
    /// Build the table; `treated` is the real unit's row.
    pub fn build(treated: MspeRatioRow, placebos: Vec<MspeRatioRow>) -> Self {
        let treated_ratio = treated.ratio;
        let mut rows = Vec::with_capacity(placebos.len() + 1);
        rows.push(treated);
        rows.extend(placebos);

        let (treated_rank, rank_p_value) = if treated_ratio.is_nan() {
            (None, None)
        } else {
            let rank = rows.iter().filter(|r| r.ratio >= treated_ratio).count();
            (Some(rank), Some(rank as f64 / rows.len() as f64))
        };

        rows.sort_by(|a, b| match (a.ratio.is_nan(), b.ratio.is_nan()) {
            (true, true) => std::cmp::Ordering::Equal,
            (true, false) => std::cmp::Ordering::Greater,
            (false, true) => std::cmp::Ordering::Less,
            (false, false) => b.ratio.total_cmp(&a.ratio),
        });

        Self { rows, treated_rank, rank_p_value }
    }
}

/// Result of the in-space placebo test.
#[derive(Debug, Clone, Serialize)]
pub struct CrossSectionalResult {
    /// Real ATT.
    pub att: f64,
    /// `att − bias`; `None` when no placebo was fitted.
    pub bias_corrected_att: Option<f64>,
    /// Distribution statistics.
    pub stats: PlaceboStats,
    /// Per-donor outcomes in donor order.
    pub outcomes: Vec<PlaceboOutcome>,
    /// MSPE-ratio ranking.
    pub mspe_ratios: MspeRatioTable,
}

/// Run every donor as a placebo for `design`, comparing against `real`.
pub fn cross_sectional_placebo<S: WeightSolver>(
    control: &SyntheticControl<S>,
    wide: &WideSlice,
    design: &RunDesign,
    real: &ScmFit,
) -> Result<CrossSectionalResult> {
    let window = wide.before(design.pre_cutoff);

    let outcomes: Vec<PlaceboOutcome> = design
        .donors
        .par_iter()
        .map(|unit| {
            let placebo = design.with_treated(unit);
            let status = evaluate(control, wide, &window, &placebo)?;
            Ok(PlaceboOutcome { unit: unit.clone(), status })
        })
        .collect::<Result<Vec<_>>>()?;

    let atts: Vec<f64> =
        outcomes.iter().filter_map(|o| o.status.fitted()).map(|f| f.att).collect();
    let stats = PlaceboStats::compute(real.effect.att, &atts, outcomes.len());
    if stats.n_skipped > 0 {
        log::warn!(
            "{} of {} placebo units excluded (failed fits)",
            stats.n_skipped,
            stats.n_attempted
        );
    }

    let treated_row = MspeRatioRow {
        unit: design.treated.clone(),
        is_treated: true,
        mspe_pre: real.effect.mspe_pre,
        mspe_post: real.effect.mspe_post,
        ratio: real.effect.mspe_ratio,
    };
    let placebo_rows = outcomes
        .iter()
        .filter_map(|o| {
            o.status.fitted().map(|f| MspeRatioRow {
                unit: o.unit.clone(),
                is_treated: false,
                mspe_pre: f.mspe_pre,
                mspe_post: f.mspe_post,
                ratio: f.mspe_ratio,
            })
        })
        .collect();

    Ok(CrossSectionalResult {
        att: real.effect.att,
        bias_corrected_att: stats.bias.map(|b| real.effect.att - b),
        stats,
        outcomes,
        mspe_ratios: MspeRatioTable::build(treated_row, placebo_rows),
    })
}

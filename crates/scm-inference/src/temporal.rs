//! Temporal (in-time) pseudo-treatment placebo.
//!
//! For a monthly grid of candidate cutoffs, the treated unit is refitted on
//! data strictly before each cutoff, its full-span synthetic series is
//! rescaled to the pre-cutoff mean, and a pseudo-ATT is computed as if the
//! cutoff were the event date.
//!
//! Each cutoff also draws `n_draws` single-donor placebos (donors sampled
//! with replacement across draws, seeded per cutoff) fitted on the same
//! pre-cutoff window. Their standard deviation is the local SE behind the
//! cutoff's z-statistic and normal p-value. The in-space placebo enumerates
//! every donor instead.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use scm_core::{Period, Result, WeightSolver};
use serde::Serialize;

use crate::panel::WideSlice;
use crate::pipeline::{FitWindow, RunDesign, ScmFit, SyntheticControl};
use crate::placebo::{self, PlaceboStatus, SkipReason};

/// Temporal placebo settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalConfig {
    /// First candidate cutoff; defaults to the slice start plus the history requirement.
    pub first_cutoff: Option<Period>,
    /// Last candidate cutoff; defaults to the design's event date.
    pub last_cutoff: Option<Period>,
    /// Months of prior history a cutoff needs to be on the grid.
    pub min_history_months: u32,
    /// Usable pre-cutoff periods a cutoff needs to be estimated.
    pub min_pre_points: usize,
    /// Single-donor placebo draws per cutoff.
    pub n_draws: usize,
    /// Base seed; cutoff `k` uses `seed + k`.
    pub seed: u64,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            first_cutoff: None,
            last_cutoff: None,
            min_history_months: 24,
            min_pre_points: 3,
            n_draws: 20,
            seed: 42,
        }
    }
}

/// Pseudo-ATT and local inference at one cutoff.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CutoffEstimate {
    /// Pseudo-ATT with post mask `period >= cutoff`.
    pub pseudo_att: f64,
    /// Mean of the draw ATTs.
    pub bias: Option<f64>,
    /// `pseudo_att − bias`.
    pub bias_corrected_att: Option<f64>,
    /// Sample SD of the draw ATTs.
    pub se: Option<f64>,
    /// `pseudo_att / se`.
    pub z: Option<f64>,
    /// Two-sided normal p-value.
    pub p_value: Option<f64>,
    /// Pre-cutoff MSPE of the treated fit.
    pub mspe_pre: f64,
    /// Usable pre-cutoff periods.
    pub n_pre_points: usize,
    /// Draws that produced a placebo ATT.
    pub n_draws_fitted: usize,
    /// Draws excluded.
    pub n_draws_skipped: usize,
}

/// Tagged outcome of one cutoff.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CutoffStatus {
    /// Estimated (possibly with NA inference fields).
    Estimated(CutoffEstimate),
    /// Not estimated.
    Skipped(SkipReason),
}

/// One row of the per-cutoff table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CutoffResult {
    /// Candidate cutoff.
    pub cutoff: Period,
    /// Whether this is the real event date.
    pub is_actual_event: bool,
    /// Outcome.
    #[serde(flatten)]
    pub status: CutoffStatus,
}

impl CutoffResult {
    /// The estimate, if any.
    pub fn estimate(&self) -> Option<&CutoffEstimate> {
        match &self.status {
            CutoffStatus::Estimated(e) => Some(e),
            CutoffStatus::Skipped(_) => None,
        }
    }
}

/// Aggregate over cutoffs strictly before the real event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemporalSummary {
    /// Cutoffs on the grid.
    pub n_cutoffs: usize,
    /// Cutoffs estimated.
    pub n_estimated: usize,
    /// Cutoffs skipped.
    pub n_skipped: usize,
    /// Mean pseudo-ATT over pre-event cutoffs.
    pub bias: Option<f64>,
    /// Real ATT minus `bias`.
    pub bias_corrected_att: Option<f64>,
    /// Share of pre-event pseudo-ATTs at least as extreme as the real ATT.
    pub p_value_in_time: Option<f64>,
}

/// Per-cutoff table plus summary.
#[derive(Debug, Clone, Serialize)]
pub struct TemporalResult {
    /// Rows in cutoff order.
    pub cutoffs: Vec<CutoffResult>,
    /// Aggregate.
    pub summary: TemporalSummary,
}

/// Candidate cutoffs: every month from the first eligible one to the last,
/// inclusive, bounded by the slice.
pub fn cutoff_grid(wide: &WideSlice, event: Period, config: &TemporalConfig) -> Vec<Period> {
    let (Some(&first_period), Some(&last_period)) = (wide.periods().first(), wide.periods().last())
    else {
        return Vec::new();
    };
    let earliest = first_period.add_months(config.min_history_months as i64);
    let start = config.first_cutoff.map_or(earliest, |c| c.max(earliest));
    let end = config.last_cutoff.unwrap_or(event).min(last_period);
    if start > end {
        return Vec::new();
    }
    (0..=start.months_until(&end)).map(|k| start.add_months(k)).collect()
}

/// Run the temporal placebo for `design`; `real_att` is the main estimate
/// the summary's in-time p-value refers to.
pub fn temporal_placebo<S: WeightSolver>(
    control: &SyntheticControl<S>,
    wide: &WideSlice,
    design: &RunDesign,
    real_att: f64,
    config: &TemporalConfig,
) -> Result<TemporalResult> {
    let grid = cutoff_grid(wide, design.event, config);
    log::debug!("temporal placebo over {} cutoffs", grid.len());

    let cutoffs: Vec<CutoffResult> = grid
        .par_iter()
        .enumerate()
        .map(|(k, &cutoff)| {
            let status = evaluate_cutoff(control, wide, design, cutoff, k, config)?;
            Ok(CutoffResult { cutoff, is_actual_event: cutoff == design.event, status })
        })
        .collect::<Result<Vec<_>>>()?;

    let pre_event: Vec<f64> = cutoffs
        .iter()
        .filter(|c| c.cutoff < design.event)
        .filter_map(|c| c.estimate().map(|e| e.pseudo_att))
        .collect();
    let n_estimated = cutoffs.iter().filter(|c| c.estimate().is_some()).count();
    let bias = placebo::mean(&pre_event);

    let summary = TemporalSummary {
        n_cutoffs: cutoffs.len(),
        n_estimated,
        n_skipped: cutoffs.len() - n_estimated,
        bias,
        bias_corrected_att: bias.map(|b| real_att - b),
        p_value_in_time: placebo::permutation_p_value(real_att, &pre_event),
    };
    if summary.n_skipped > 0 {
        log::warn!("{} of {} temporal cutoffs skipped", summary.n_skipped, summary.n_cutoffs);
    }

    Ok(TemporalResult { cutoffs, summary })
}

fn evaluate_cutoff<S: WeightSolver>(
    control: &SyntheticControl<S>,
    wide: &WideSlice,
    design: &RunDesign,
    cutoff: Period,
    index: usize,
    config: &TemporalConfig,
) -> Result<CutoffStatus> {
    let pseudo = design.with_pre_cutoff(cutoff).with_event(cutoff).with_rescale(true);
    // Built once and shared by the treated fit and every draw.
    let window = wide.before(cutoff);

    let available = FitWindow::extract(&window, &pseudo)?.len();
    if available < config.min_pre_points {
        return Ok(CutoffStatus::Skipped(SkipReason::InsufficientHistory {
            available,
            required: config.min_pre_points,
        }));
    }

    let fit = match control
        .estimate_in_window(wide, &window, &pseudo)
        .and_then(ScmFit::require_defined)
    {
        Ok(fit) if fit.effect.att.is_finite() => fit,
        Ok(_) => return Ok(CutoffStatus::Skipped(SkipReason::UndefinedEffect)),
        Err(e) => return Ok(CutoffStatus::Skipped(SkipReason::from_error(e)?)),
    };
    let pseudo_att = fit.effect.att;

    let mut draws = Vec::with_capacity(config.n_draws);
    let mut n_draws_skipped = 0usize;
    if !pseudo.donors.is_empty() {
        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(index as u64));
        for _ in 0..config.n_draws {
            let unit = &pseudo.donors[rng.random_range(0..pseudo.donors.len())];
            match placebo::evaluate(control, wide, &window, &pseudo.with_treated(unit))? {
                PlaceboStatus::Fitted(f) => draws.push(f.att),
                PlaceboStatus::Skipped(_) => n_draws_skipped += 1,
            }
        }
    } else {
        n_draws_skipped = config.n_draws;
    }

    let (se, z, p_value) = placebo::normal_inference(pseudo_att, &draws);
    if se.is_none() {
        log::debug!("cutoff {cutoff}: local SE undefined ({} draws fitted)", draws.len());
    }
    let bias = placebo::mean(&draws);

    Ok(CutoffStatus::Estimated(CutoffEstimate {
        pseudo_att,
        bias,
        bias_corrected_att: bias.map(|b| pseudo_att - b),
        se,
        z,
        p_value,
        mspe_pre: fit.effect.mspe_pre,
        n_pre_points: available,
        n_draws_fitted: draws.len(),
        n_draws_skipped,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::ActiveSetSolver;

    fn p(s: &str) -> Period {
        s.parse().unwrap()
    }

    /// 48 months, 4 donors with distinct shapes; treated = mix of donors
    /// plus a +3 jump from the event onwards.
    fn panel(event_index: usize) -> WideSlice {
        let start = p("2018-01");
        let n = 48;
        let periods: Vec<Period> = (0..n as i64).map(|k| start.add_months(k)).collect();
        let d: Vec<Vec<f64>> = (0..4)
            .map(|j| {
                (0..n)
                    .map(|i| {
                        let t = i as f64;
                        10.0 + j as f64 * 2.0 + (t * (0.3 + 0.1 * j as f64)).sin() + 0.05 * t
                    })
                    .collect()
            })
            .collect();
        let treated: Vec<f64> = (0..n)
            .map(|i| {
                0.6 * d[0][i] + 0.4 * d[2][i] + if i >= event_index { 3.0 } else { 0.0 }
            })
            .collect();
        let mut cols = d;
        cols.push(treated);
        WideSlice::from_columns(
            periods,
            vec!["A".into(), "B".into(), "C".into(), "D".into(), "T".into()],
            cols,
        )
        .unwrap()
    }

    #[test]
    fn grid_respects_history_and_bounds() {
        let wide = panel(40);
        let cfg = TemporalConfig::default();
        let grid = cutoff_grid(&wide, p("2021-05"), &cfg);
        assert_eq!(grid.first().copied(), Some(p("2020-01")));
        assert_eq!(grid.last().copied(), Some(p("2021-05")));
        assert_eq!(grid.len(), 17);

        let cfg = TemporalConfig { first_cutoff: Some(p("2019-01")), ..TemporalConfig::default() };
        assert_eq!(cutoff_grid(&wide, p("2021-05"), &cfg)[0], p("2020-01"));

        let cfg = TemporalConfig { min_history_months: 60, ..TemporalConfig::default() };
        assert!(cutoff_grid(&wide, p("2021-05"), &cfg).is_empty());
    }

    #[test]
    fn pseudo_att_small_before_event_and_draws_reproducible() {
        let wide = panel(40);
        let event = p("2021-05");
        let design = RunDesign::new("T", RunDesign::all_donors(&wide, "T"), event).unwrap();
        let control = SyntheticControl::new(ActiveSetSolver::new());
        let cfg = TemporalConfig {
            first_cutoff: Some(p("2020-06")),
            last_cutoff: Some(p("2020-09")),
            n_draws: 6,
            ..TemporalConfig::default()
        };
        let a = temporal_placebo(&control, &wide, &design, 3.0, &cfg).unwrap();
        let b = temporal_placebo(&control, &wide, &design, 3.0, &cfg).unwrap();
        assert_eq!(a.cutoffs, b.cutoffs);
        assert_eq!(a.summary.n_cutoffs, 4);

        for row in &a.cutoffs {
            assert!(!row.is_actual_event);
            let est = row.estimate().expect("cutoff should be estimated");
            assert_eq!(est.n_draws_fitted + est.n_draws_skipped, 6);
            assert!(est.p_value.is_none_or(|p| (0.0..=1.0).contains(&p)));
        }
        assert!(a.summary.bias.is_some());
        assert!(a.summary.p_value_in_time.is_some());
    }

    #[test]
    fn too_little_history_is_skipped() {
        let wide = panel(40);
        let design = RunDesign::new("T", RunDesign::all_donors(&wide, "T"), p("2021-05")).unwrap();
        let control = SyntheticControl::new(ActiveSetSolver::new());
        let cfg = TemporalConfig {
            min_history_months: 1,
            min_pre_points: 3,
            first_cutoff: Some(p("2018-02")),
            last_cutoff: Some(p("2018-04")),
            n_draws: 2,
            ..TemporalConfig::default()
        };
        let res = temporal_placebo(&control, &wide, &design, 3.0, &cfg).unwrap();
        assert_eq!(res.cutoffs.len(), 3);
        assert!(matches!(
            res.cutoffs[0].status,
            CutoffStatus::Skipped(SkipReason::InsufficientHistory { available: 1, required: 3 })
        ));
        assert!(matches!(
            res.cutoffs[1].status,
            CutoffStatus::Skipped(SkipReason::InsufficientHistory { available: 2, .. })
        ));
        assert!(res.cutoffs[2].estimate().is_some());
        assert_eq!(res.summary.n_skipped, 2);
    }

    #[test]
    fn no_donors_gives_na_inference() {
        let wide = panel(40).select(&["A".into(), "T".into()]).unwrap();
        let design = RunDesign::new("T", vec!["A".into()], p("2021-05")).unwrap();
        let control = SyntheticControl::new(ActiveSetSolver::new());
        let cfg = TemporalConfig {
            first_cutoff: Some(p("2021-05")),
            n_draws: 3,
            ..TemporalConfig::default()
        };
        let res = temporal_placebo(&control, &wide, &design, 3.0, &cfg).unwrap();
        let row = &res.cutoffs[0];
        assert!(row.is_actual_event);
        let est = row.estimate().unwrap();
        assert_eq!(est.n_draws_fitted, 0);
        assert_eq!(est.se, None);
        assert_eq!(est.p_value, None);
        assert_eq!(est.bias_corrected_att, None);
        assert_eq!(res.summary.bias, None);
    }
}

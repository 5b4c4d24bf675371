//! JSON report assembly and the CSV table bundle.

use std::path::Path;

use anyhow::{Context, Result};
use scm_inference::placebo::PlaceboStatus;
use scm_inference::sensitivity::SubsetStatus;
use scm_inference::temporal::CutoffStatus;
use scm_inference::{
    AttResult, CrossSectionalResult, DidCrossCheck, DropCounts, RunDesign, ScmFit, SubsetOutcome,
    TemporalResult,
};
use serde::Serialize;

/// Pre-treatment fit quality of the treated unit against its synthetic.
#[derive(Debug, Clone, Serialize)]
pub struct FitQuality {
    pub treated_pre_mean: f64,
    pub synthetic_pre_mean: f64,
    pub mspe_pre: f64,
    pub rmse_pre: f64,
    pub mae_pre: f64,
    pub n_fit_periods: usize,
}

impl FitQuality {
    pub fn from_fit(fit: &ScmFit, design: &RunDesign) -> Self {
        let pre: Vec<bool> = fit.periods.iter().map(|p| *p < design.pre_cutoff).collect();
        Self {
            treated_pre_mean: scm_inference::synthetic::masked_mean(&fit.treated_series, &pre),
            synthetic_pre_mean: scm_inference::synthetic::masked_mean(&fit.synthetic, &pre),
            mspe_pre: fit.effect.mspe_pre,
            rmse_pre: fit.effect.rmse_pre,
            mae_pre: fit.effect.mae_pre,
            n_fit_periods: fit.n_fit_periods,
        }
    }
}

/// Everything the `run` subcommand produces.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub version: &'static str,
    pub design: RunDesign,
    pub dropped_rows: DropCounts,
    pub fit_quality: FitQuality,
    pub fit: ScmFit,
    pub placebo: CrossSectionalResult,
    pub temporal: TemporalResult,
    pub sensitivity: Vec<SubsetOutcome>,
    /// Re-estimate with the post window opened at the placebo event date.
    pub placebo_event: Option<AttResult>,
    pub did: Option<DidCrossCheck>,
}

fn num(v: f64) -> String {
    if v.is_finite() { format!("{v:.10}") } else { String::new() }
}

fn opt(v: Option<f64>) -> String {
    v.map(num).unwrap_or_default()
}

fn writer(dir: &Path, name: &str) -> Result<csv::Writer<std::fs::File>> {
    let path = dir.join(name);
    csv::Writer::from_path(&path).with_context(|| format!("failed to create {}", path.display()))
}

/// Write the report's tables as CSV files plus `report.json` into `dir`.
pub fn write_bundle(dir: &Path, report: &RunReport) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create bundle dir {}", dir.display()))?;

    std::fs::write(dir.join("report.json"), serde_json::to_string_pretty(report)?)?;

    let mut w = writer(dir, "weights.csv")?;
    w.write_record(["unit", "weight"])?;
    for (unit, weight) in report.fit.weights.iter() {
        w.write_record([unit.to_string(), num(weight)])?;
    }
    w.flush()?;

    let q = &report.fit_quality;
    let mut w = writer(dir, "fit_quality.csv")?;
    w.write_record(["metric", "value"])?;
    for (metric, value) in [
        ("treated_pre_mean", q.treated_pre_mean),
        ("synthetic_pre_mean", q.synthetic_pre_mean),
        ("mspe_pre", q.mspe_pre),
        ("rmse_pre", q.rmse_pre),
        ("mae_pre", q.mae_pre),
        ("n_fit_periods", q.n_fit_periods as f64),
    ] {
        w.write_record([metric.to_string(), num(value)])?;
    }
    w.flush()?;

    let f = &report.fit;
    let mut w = writer(dir, "series.csv")?;
    w.write_record(["period", "treated", "raw_synthetic", "synthetic", "gap"])?;
    for t in 0..f.periods.len() {
        w.write_record([
            f.periods[t].to_string(),
            num(f.treated_series[t]),
            num(f.raw_synthetic[t]),
            num(f.synthetic[t]),
            num(f.gap[t]),
        ])?;
    }
    w.flush()?;

    let mut w = writer(dir, "effect.csv")?;
    w.write_record([
        "att",
        "bias_corrected_att",
        "se",
        "z",
        "p_value_permutation",
        "p_value_normal",
        "n_placebos_fitted",
        "n_placebos_skipped",
    ])?;
    let s = &report.placebo.stats;
    w.write_record([
        num(report.placebo.att),
        opt(report.placebo.bias_corrected_att),
        opt(s.se),
        opt(s.z),
        opt(s.p_value_permutation),
        opt(s.p_value_normal),
        s.n_fitted.to_string(),
        s.n_skipped.to_string(),
    ])?;
    w.flush()?;

    let mut w = writer(dir, "placebo_units.csv")?;
    w.write_record(["unit", "status", "att", "mspe_pre", "mspe_ratio", "skip_reason"])?;
    for o in &report.placebo.outcomes {
        let row = match &o.status {
            PlaceboStatus::Fitted(fit) => [
                o.unit.clone(),
                "fitted".into(),
                num(fit.att),
                num(fit.mspe_pre),
                num(fit.mspe_ratio),
                String::new(),
            ],
            PlaceboStatus::Skipped(reason) => [
                o.unit.clone(),
                "skipped".into(),
                String::new(),
                String::new(),
                String::new(),
                format!("{reason:?}"),
            ],
        };
        w.write_record(row)?;
    }
    w.flush()?;

    let mut w = writer(dir, "mspe_ratios.csv")?;
    w.write_record(["rank", "unit", "is_treated", "mspe_pre", "mspe_post", "ratio"])?;
    for (i, r) in report.placebo.mspe_ratios.rows.iter().enumerate() {
        w.write_record([
            (i + 1).to_string(),
            r.unit.clone(),
            r.is_treated.to_string(),
            num(r.mspe_pre),
            num(r.mspe_post),
            num(r.ratio),
        ])?;
    }
    w.flush()?;

    let mut w = writer(dir, "temporal.csv")?;
    w.write_record([
        "cutoff",
        "is_actual_event",
        "status",
        "pseudo_att",
        "bias",
        "bias_corrected_att",
        "se",
        "z",
        "p_value",
        "n_draws_fitted",
    ])?;
    for c in &report.temporal.cutoffs {
        let head = [c.cutoff.to_string(), c.is_actual_event.to_string()];
        let tail = match &c.status {
            CutoffStatus::Estimated(e) => [
                "estimated".to_string(),
                num(e.pseudo_att),
                opt(e.bias),
                opt(e.bias_corrected_att),
                opt(e.se),
                opt(e.z),
                opt(e.p_value),
                e.n_draws_fitted.to_string(),
            ],
            CutoffStatus::Skipped(reason) => {
                let mut t: [String; 8] = Default::default();
                t[0] = format!("skipped: {reason:?}");
                t
            }
        };
        w.write_record(head.iter().chain(tail.iter()))?;
    }
    w.flush()?;

    let mut w = writer(dir, "sensitivity.csv")?;
    w.write_record([
        "subset",
        "n_donors",
        "att",
        "bias_corrected_att",
        "se",
        "p_value",
        "n_placebos",
        "error",
    ])?;
    for o in &report.sensitivity {
        let n_donors = o.donors.len().to_string();
        let row = match &o.status {
            SubsetStatus::Estimated(e) => [
                o.name.clone(),
                n_donors,
                num(e.att),
                opt(e.bias_corrected_att),
                opt(e.se),
                opt(e.p_value),
                e.n_placebos.to_string(),
                String::new(),
            ],
            SubsetStatus::Failed { error } => {
                let mut t: [String; 8] = Default::default();
                t[0] = o.name.clone();
                t[1] = n_donors;
                t[7] = error.clone();
                t
            }
        };
        w.write_record(row)?;
    }
    w.flush()?;

    tracing::info!(dir = %dir.display(), "bundle written");
    Ok(())
}

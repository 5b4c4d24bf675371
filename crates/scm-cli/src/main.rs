//! synthstat CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};

use scm_inference::{
    Panel, RunDesign, SyntheticControl, TemporalConfig, WideSlice, cross_sectional_placebo,
    did_cross_check, run_sensitivity, temporal_placebo,
};

mod config;
mod ingest;
mod report;

use config::RunConfig;
use report::{FitQuality, RunReport};

#[derive(Parser)]
#[command(name = "scm")]
#[command(about = "Synthetic control estimation with placebo inference")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by every estimation subcommand.
#[derive(clap::Args)]
struct RunArgs {
    /// Panel CSV (long format)
    #[arg(short, long)]
    input: PathBuf,

    /// Run configuration (YAML)
    #[arg(short, long)]
    config: PathBuf,

    /// Output file for results (pretty JSON). Defaults to stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Threads (0 = auto).
    #[arg(long, default_value = "0")]
    threads: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit donor weights and estimate the ATT
    Fit {
        #[command(flatten)]
        args: RunArgs,
    },

    /// In-space placebo: every donor re-cast as treated
    Placebo {
        #[command(flatten)]
        args: RunArgs,
    },

    /// In-time placebo over a grid of pseudo-treatment dates
    Temporal {
        #[command(flatten)]
        args: RunArgs,
    },

    /// Re-run fit and placebo over alternative donor pools
    Sensitivity {
        #[command(flatten)]
        args: RunArgs,
    },

    /// Full analysis: fit, both placebos, sensitivity and DiD cross-check
    Run {
        #[command(flatten)]
        args: RunArgs,

        /// Also write CSV tables and report.json into this directory
        #[arg(long)]
        bundle: Option<PathBuf>,
    },

    /// Print version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries the JSON result.
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Fit { args } => cmd_fit(&args),
        Commands::Placebo { args } => cmd_placebo(&args),
        Commands::Temporal { args } => cmd_temporal(&args),
        Commands::Sensitivity { args } => cmd_sensitivity(&args),
        Commands::Run { args, bundle } => cmd_run(&args, bundle.as_deref()),
        Commands::Version => {
            println!("scm {}", scm_core::VERSION);
            Ok(())
        }
    }
}

/// Loaded inputs for one invocation.
struct Session {
    cfg: RunConfig,
    panel: Panel,
    wide: WideSlice,
    design: RunDesign,
    control: SyntheticControl,
}

fn load_session(args: &RunArgs) -> Result<Session> {
    if args.threads > 0 {
        // Best-effort; if a global pool already exists, keep going.
        let _ = rayon::ThreadPoolBuilder::new().num_threads(args.threads).build_global();
    }

    let cfg = config::read_run_config(&args.config)?;
    let rows = ingest::read_csv(&args.input, &cfg.columns)?;
    let panel = Panel::load(rows);
    let dropped = panel.dropped();
    tracing::info!(
        kept = panel.observations().len(),
        dropped = dropped.total(),
        "panel validated"
    );

    let range = cfg.range_or(panel.span())?;
    let wide = panel.to_wide(range).context("failed to build the wide panel")?;
    let design = cfg.design(&wide)?;
    tracing::info!(
        treated = %design.treated,
        donors = design.donors.len(),
        event = %design.event,
        "run design ready"
    );

    Ok(Session { cfg, panel, wide, design, control: SyntheticControl::default() })
}

fn cmd_fit(args: &RunArgs) -> Result<()> {
    let s = load_session(args)?;
    let fit = s.control.estimate(&s.wide, &s.design)?;
    tracing::info!(att = fit.effect.att, mspe_pre = fit.effect.mspe_pre, "fit complete");

    let placebo_event = placebo_event_effect(&s)?;
    let output = serde_json::json!({
        "version": scm_core::VERSION,
        "design": s.design,
        "dropped_rows": s.panel.dropped(),
        "fit_quality": FitQuality::from_fit(&fit, &s.design),
        "fit": fit,
        "placebo_event": placebo_event,
    });
    write_json(args.output.as_deref(), &output)
}

fn cmd_placebo(args: &RunArgs) -> Result<()> {
    let s = load_session(args)?;
    let fit = s.control.estimate(&s.wide, &s.design)?;
    let placebo = cross_sectional_placebo(&s.control, &s.wide, &s.design, &fit)?;
    tracing::info!(
        att = placebo.att,
        fitted = placebo.stats.n_fitted,
        skipped = placebo.stats.n_skipped,
        "in-space placebo complete"
    );
    write_json(args.output.as_deref(), &placebo)
}

fn cmd_temporal(args: &RunArgs) -> Result<()> {
    let s = load_session(args)?;
    let fit = s.control.estimate(&s.wide, &s.design)?;
    let cfg = TemporalConfig::from(&s.cfg.temporal);
    let temporal = temporal_placebo(&s.control, &s.wide, &s.design, fit.effect.att, &cfg)?;
    tracing::info!(
        cutoffs = temporal.summary.n_cutoffs,
        skipped = temporal.summary.n_skipped,
        "in-time placebo complete"
    );
    write_json(args.output.as_deref(), &temporal)
}

fn cmd_sensitivity(args: &RunArgs) -> Result<()> {
    let s = load_session(args)?;
    let subsets = s.cfg.subsets(&s.design);
    let outcomes = run_sensitivity(&s.control, &s.wide, &s.design, &subsets);
    tracing::info!(subsets = outcomes.len(), "sensitivity runs complete");
    write_json(args.output.as_deref(), &outcomes)
}

fn cmd_run(args: &RunArgs, bundle: Option<&Path>) -> Result<()> {
    let s = load_session(args)?;
    let fit = s.control.estimate(&s.wide, &s.design)?;
    if !fit.effect.att.is_finite() {
        tracing::warn!("main ATT is undefined; inference fields will be empty");
    }

    let placebo = cross_sectional_placebo(&s.control, &s.wide, &s.design, &fit)?;
    let temporal_cfg = TemporalConfig::from(&s.cfg.temporal);
    let temporal =
        temporal_placebo(&s.control, &s.wide, &s.design, fit.effect.att, &temporal_cfg)?;
    let sensitivity = run_sensitivity(&s.control, &s.wide, &s.design, &s.cfg.subsets(&s.design));
    let placebo_event = placebo_event_effect(&s)?;

    let range = s.cfg.range_or(s.panel.span())?;
    let did = match did_cross_check(&s.panel, &s.design, range) {
        Ok(d) => Some(d),
        Err(e) => {
            tracing::warn!(error = %e, "DiD cross-check skipped");
            None
        }
    };

    tracing::info!(
        att = fit.effect.att,
        p_value = ?placebo.stats.p_value_permutation,
        cutoffs = temporal.summary.n_cutoffs,
        "analysis complete"
    );

    let report = RunReport {
        version: scm_core::VERSION,
        fit_quality: FitQuality::from_fit(&fit, &s.design),
        design: s.design,
        dropped_rows: s.panel.dropped(),
        fit,
        placebo,
        temporal,
        sensitivity,
        placebo_event,
        did,
    };

    if let Some(dir) = bundle {
        report::write_bundle(dir, &report)?;
    }
    write_json(args.output.as_deref(), &report)
}

/// Robustness re-estimate with the post window opened at `placebo_event_date`.
///
/// A recoverable failure (infeasible weights) is logged and reported as `None`.
fn placebo_event_effect(s: &Session) -> Result<Option<scm_inference::AttResult>> {
    let Some(date) = s.cfg.placebo_event_date else {
        return Ok(None);
    };
    let design = s.design.with_pre_cutoff(date).with_event(date);
    match s.control.estimate(&s.wide, &design) {
        Ok(fit) => {
            tracing::info!(placebo_event = %date, att = fit.effect.att, "placebo event refit");
            Ok(Some(fit.effect))
        }
        Err(e) if e.is_recoverable() => {
            tracing::warn!(placebo_event = %date, error = %e, "placebo event refit skipped");
            Ok(None)
        }
        Err(e) => Err(e).with_context(|| format!("placebo event re-estimate at {date} failed")),
    }
}

fn write_json<T: Serialize>(output: Option<&Path>, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    if let Some(path) = output {
        std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
    } else {
        println!("{text}");
    }
    Ok(())
}

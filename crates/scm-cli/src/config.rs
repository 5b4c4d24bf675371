//! Run configuration (YAML).
//!
//! ```yaml
//! treated: OR
//! event_date: 2021-02
//! exclude: [DC]
//! rescale: true
//! columns: { unit: state, numerator: crashes, denominator: population }
//! temporal: { n_draws: 20, seed: 42 }
//! sensitivity: { leave_one_out: true }
//! ```

use std::path::Path;

use anyhow::{Context, Result, bail};
use scm_core::{Period, PeriodRange};
use scm_inference::{DonorSubset, RunDesign, TemporalConfig, WideSlice};
use serde::Deserialize;

/// CSV column names.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColumnMap {
    pub unit: String,
    pub year: String,
    pub month: String,
    pub numerator: String,
    pub denominator: String,
    /// Optional unit-level covariate (population density in the reference data).
    pub covariate: Option<String>,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            unit: "unit".into(),
            year: "year".into(),
            month: "month".into(),
            numerator: "numerator".into(),
            denominator: "denominator".into(),
            covariate: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeConfig {
    pub start: Period,
    pub end: Period,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TemporalSection {
    pub n_draws: usize,
    pub seed: u64,
    pub min_history_months: u32,
    pub min_pre_points: usize,
    pub first_cutoff: Option<Period>,
    pub last_cutoff: Option<Period>,
}

impl Default for TemporalSection {
    fn default() -> Self {
        let d = TemporalConfig::default();
        Self {
            n_draws: d.n_draws,
            seed: d.seed,
            min_history_months: d.min_history_months,
            min_pre_points: d.min_pre_points,
            first_cutoff: d.first_cutoff,
            last_cutoff: d.last_cutoff,
        }
    }
}

impl From<&TemporalSection> for TemporalConfig {
    fn from(s: &TemporalSection) -> Self {
        TemporalConfig {
            first_cutoff: s.first_cutoff,
            last_cutoff: s.last_cutoff,
            min_history_months: s.min_history_months,
            min_pre_points: s.min_pre_points,
            n_draws: s.n_draws,
            seed: s.seed,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SensitivitySection {
    pub leave_one_out: bool,
    pub subsets: Vec<DonorSubset>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub treated: String,
    #[serde(default)]
    pub donors: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Vec<String>,
    pub event_date: Period,
    #[serde(default)]
    pub placebo_event_date: Option<Period>,
    #[serde(default)]
    pub pre_cutoff: Option<Period>,
    #[serde(default)]
    pub rescale: bool,
    #[serde(default)]
    pub range: Option<RangeConfig>,
    #[serde(default)]
    pub columns: ColumnMap,
    #[serde(default)]
    pub temporal: TemporalSection,
    #[serde(default)]
    pub sensitivity: SensitivitySection,
}

pub fn read_run_config(path: &Path) -> Result<RunConfig> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let cfg: RunConfig = serde_yaml_ng::from_slice(&bytes)
        .with_context(|| format!("invalid run config {}", path.display()))?;
    if let Some(pre) = cfg.pre_cutoff.filter(|p| *p > cfg.event_date) {
        bail!("pre_cutoff {pre} is after event_date {}", cfg.event_date);
    }
    Ok(cfg)
}

impl RunConfig {
    /// Analysis window: the configured range, else the panel span.
    pub fn range_or(&self, span: Option<PeriodRange>) -> Result<PeriodRange> {
        match (&self.range, span) {
            (Some(r), _) => Ok(PeriodRange::new(r.start, r.end)?),
            (None, Some(span)) => Ok(span),
            (None, None) => bail!("panel is empty after validation"),
        }
    }

    /// Donor pool on `wide`: the configured list (or every other unit), minus
    /// `exclude`.
    pub fn donor_pool(&self, wide: &WideSlice) -> Result<Vec<String>> {
        let base = match &self.donors {
            Some(list) => list.clone(),
            None => RunDesign::all_donors(wide, &self.treated),
        };
        let pool: Vec<String> = base.into_iter().filter(|d| !self.exclude.contains(d)).collect();
        for d in &pool {
            if wide.column(d).is_none() {
                bail!("donor '{d}' has no observations in the analysis window");
            }
        }
        if wide.column(&self.treated).is_none() {
            bail!("treated unit '{}' has no observations in the analysis window", self.treated);
        }
        Ok(pool)
    }

    /// Main run design.
    pub fn design(&self, wide: &WideSlice) -> Result<RunDesign> {
        let donors = self.donor_pool(wide)?;
        let design = RunDesign::new(self.treated.clone(), donors, self.event_date)?
            .with_pre_cutoff(self.pre_cutoff.unwrap_or(self.event_date))
            .with_rescale(self.rescale);
        Ok(design)
    }

    /// Donor subsets for the sensitivity runner.
    pub fn subsets(&self, design: &RunDesign) -> Vec<DonorSubset> {
        let mut out = vec![DonorSubset::new("baseline", design.donors.clone())];
        out.extend(self.sensitivity.subsets.iter().cloned());
        if self.sensitivity.leave_one_out {
            out.extend(scm_inference::leave_one_out(&design.donors));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> RunConfig {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = parse("treated: OR\nevent_date: 2021-02\n");
        assert_eq!(cfg.treated, "OR");
        assert_eq!(cfg.event_date.to_string(), "2021-02");
        assert_eq!(cfg.columns.unit, "unit");
        assert!(!cfg.rescale);
        assert_eq!(cfg.temporal.n_draws, 20);
        assert_eq!(cfg.temporal.min_history_months, 24);
        assert!(cfg.sensitivity.subsets.is_empty());
    }

    #[test]
    fn full_config_round_trips_into_library_types() {
        let cfg = parse(
            r#"
treated: OR
donors: [WA, ID, NV]
exclude: [NV]
event_date: "2021-02"
placebo_event_date: "2020-02"
rescale: true
range: { start: "2018-01", end: "2022-12" }
columns: { unit: state, year: yr, month: mo, numerator: crashes, denominator: pop, covariate: density }
temporal: { n_draws: 5, seed: 7, first_cutoff: "2020-06" }
sensitivity:
  leave_one_out: true
  subsets:
    - { name: west, donors: [WA, ID] }
"#,
        );
        assert_eq!(cfg.columns.covariate.as_deref(), Some("density"));
        assert_eq!(cfg.exclude, vec!["NV"]);
        let t = TemporalConfig::from(&cfg.temporal);
        assert_eq!(t.n_draws, 5);
        assert_eq!(t.seed, 7);
        assert_eq!(t.first_cutoff.map(|p| p.to_string()).as_deref(), Some("2020-06"));
        assert_eq!(cfg.sensitivity.subsets[0].name, "west");
        let r = cfg.range_or(None).unwrap();
        assert_eq!(r.len(), 60);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let res: Result<RunConfig, _> =
            serde_yaml_ng::from_str("treated: OR\nevent_date: 2021-02\nbogus: 1\n");
        assert!(res.is_err());
    }
}

//! Panel store: validated long-format observations and wide projections.
//!
//! The long panel holds one row per `(unit, month)` observation with a defined
//! rate. Wide slices pivot it to a `time × unit` table of rates and are the
//! immutable input every estimation loop reads from.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use scm_core::{Error, Period, PeriodRange, RawObservation, Result};
use serde::Serialize;

/// A validated observation. `denominator > 0` is guaranteed.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelObservation {
    /// Unit identifier (trimmed).
    pub unit: String,
    /// Month of the observation.
    pub period: Period,
    /// Event count.
    pub numerator: f64,
    /// Exposure.
    pub denominator: f64,
    /// Optional unit-level covariate.
    pub covariate: Option<f64>,
}

impl PanelObservation {
    /// `numerator / denominator`.
    pub fn rate(&self) -> f64 {
        self.numerator / self.denominator
    }
}

/// Rows dropped by [`Panel::load`], per reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropCounts {
    /// Empty or missing unit identifier.
    pub missing_unit: usize,
    /// Year or month missing or unresolvable.
    pub unresolvable_period: usize,
    /// Missing/non-finite numerator or denominator, or denominator <= 0.
    pub undefined_rate: usize,
}

impl DropCounts {
    /// Total dropped rows.
    pub fn total(&self) -> usize {
        self.missing_unit + self.unresolvable_period + self.undefined_rate
    }
}

/// Cleaned long-format panel.
#[derive(Debug, Clone)]
pub struct Panel {
    observations: Vec<PanelObservation>,
    dropped: DropCounts,
}

impl Panel {
    /// Validate raw rows. Failing rows are dropped and counted, never coerced.
    pub fn load<I>(rows: I) -> Panel
    where
        I: IntoIterator<Item = RawObservation>,
    {
        let mut observations = Vec::new();
        let mut dropped = DropCounts::default();

        for row in rows {
            let unit = match row.unit.as_deref().map(str::trim) {
                Some(u) if !u.is_empty() => u.to_string(),
                _ => {
                    dropped.missing_unit += 1;
                    continue;
                }
            };
            let period = match (row.year, row.month.as_deref()) {
                (Some(y), Some(m)) => Period::resolve(y, m),
                _ => None,
            };
            let Some(period) = period else {
                dropped.unresolvable_period += 1;
                continue;
            };
            match (row.numerator, row.denominator) {
                (Some(num), Some(den)) if num.is_finite() && den.is_finite() && den > 0.0 => {
                    observations.push(PanelObservation {
                        unit,
                        period,
                        numerator: num,
                        denominator: den,
                        covariate: row.covariate.filter(|c| c.is_finite()),
                    });
                }
                _ => dropped.undefined_rate += 1,
            }
        }

        if dropped.total() > 0 {
            log::warn!(
                "panel load dropped {} rows (no unit: {}, bad period: {}, undefined rate: {})",
                dropped.total(),
                dropped.missing_unit,
                dropped.unresolvable_period,
                dropped.undefined_rate
            );
        }

        Panel { observations, dropped }
    }

    /// Validated observations.
    pub fn observations(&self) -> &[PanelObservation] {
        &self.observations
    }

    /// Rows dropped at load time.
    pub fn dropped(&self) -> DropCounts {
        self.dropped
    }

    /// Sorted distinct unit identifiers.
    pub fn units(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self.observations.iter().map(|o| o.unit.as_str()).collect();
        set.into_iter().map(str::to_string).collect()
    }

    /// Sorted distinct months with at least one observation.
    pub fn periods(&self) -> Vec<Period> {
        let set: BTreeSet<Period> = self.observations.iter().map(|o| o.period).collect();
        set.into_iter().collect()
    }

    /// First and last observed month, `None` for an empty panel.
    pub fn span(&self) -> Option<PeriodRange> {
        let start = self.observations.iter().map(|o| o.period).min()?;
        let end = self.observations.iter().map(|o| o.period).max()?;
        Some(PeriodRange { start, end })
    }

    /// Mean covariate per unit (units without any covariate are absent).
    pub fn covariate_means(&self) -> HashMap<String, f64> {
        let mut acc: HashMap<&str, (f64, usize)> = HashMap::new();
        for o in &self.observations {
            if let Some(c) = o.covariate {
                let e = acc.entry(o.unit.as_str()).or_insert((0.0, 0));
                e.0 += c;
                e.1 += 1;
            }
        }
        acc.into_iter().map(|(u, (s, n))| (u.to_string(), s / n as f64)).collect()
    }

    /// Pivot to a `time × unit` slice over `range` (inclusive).
    ///
    /// Duplicate rows for one `(unit, month)` are aggregated by summing
    /// numerators and denominators. Every month of the range is a row; cells
    /// without data are `NaN`.
    pub fn to_wide(&self, range: PeriodRange) -> Result<WideSlice> {
        if range.start > range.end {
            return Err(Error::MalformedPanel(format!(
                "unresolvable range {} .. {}",
                range.start, range.end
            )));
        }

        // Identifiers that differ only in case would land in one cell.
        let mut spelling: HashMap<String, &str> = HashMap::new();
        let mut cells: BTreeMap<(&str, Period), (f64, f64)> = BTreeMap::new();
        for o in self.observations.iter().filter(|o| range.contains(&o.period)) {
            let key = o.unit.to_lowercase();
            match spelling.get(&key) {
                Some(&seen) if seen != o.unit => {
                    return Err(Error::MalformedPanel(format!(
                        "ambiguous unit identifiers '{}' and '{}'",
                        seen, o.unit
                    )));
                }
                Some(_) => {}
                None => {
                    spelling.insert(key, o.unit.as_str());
                }
            }
            let cell = cells.entry((o.unit.as_str(), o.period)).or_insert((0.0, 0.0));
            cell.0 += o.numerator;
            cell.1 += o.denominator;
        }

        let units: Vec<String> = {
            let set: BTreeSet<&str> = cells.keys().map(|(u, _)| *u).collect();
            set.into_iter().map(str::to_string).collect()
        };
        let unit_idx: HashMap<&str, usize> =
            units.iter().enumerate().map(|(j, u)| (u.as_str(), j)).collect();
        let periods = range.months();
        let t_len = periods.len();

        let mut columns = vec![vec![f64::NAN; t_len]; units.len()];
        for ((unit, period), (num, den)) in cells {
            let rate = num / den;
            if !rate.is_finite() {
                return Err(Error::MalformedPanel(format!(
                    "aggregated rate for ({unit}, {period}) is not finite"
                )));
            }
            let t = range.start.months_until(&period) as usize;
            columns[unit_idx[unit]][t] = rate;
        }

        WideSlice::from_columns(periods, units, columns)
    }
}

/// Immutable `time × unit` table of rates. `NaN` marks a missing cell.
#[derive(Debug, Clone, PartialEq)]
pub struct WideSlice {
    periods: Vec<Period>,
    units: Vec<String>,
    columns: Vec<Vec<f64>>,
}

impl WideSlice {
    /// Build from per-unit columns. Periods must be strictly increasing and
    /// unit identifiers unique.
    pub fn from_columns(
        periods: Vec<Period>,
        units: Vec<String>,
        columns: Vec<Vec<f64>>,
    ) -> Result<Self> {
        if units.len() != columns.len() {
            return Err(Error::Validation(format!(
                "{} units but {} columns",
                units.len(),
                columns.len()
            )));
        }
        if let Some((u, c)) = units.iter().zip(&columns).find(|(_, c)| c.len() != periods.len()) {
            return Err(Error::Validation(format!(
                "column '{}' has length {}, expected {}",
                u,
                c.len(),
                periods.len()
            )));
        }
        if periods.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::MalformedPanel("periods must be strictly increasing".into()));
        }
        let distinct: BTreeSet<&String> = units.iter().collect();
        if distinct.len() != units.len() {
            return Err(Error::MalformedPanel("duplicate unit columns".into()));
        }
        Ok(Self { periods, units, columns })
    }

    /// Row labels.
    pub fn periods(&self) -> &[Period] {
        &self.periods
    }

    /// Column labels.
    pub fn units(&self) -> &[String] {
        &self.units
    }

    /// Number of rows.
    pub fn n_periods(&self) -> usize {
        self.periods.len()
    }

    /// Number of columns.
    pub fn n_units(&self) -> usize {
        self.units.len()
    }

    /// Column for `unit`.
    pub fn column(&self, unit: &str) -> Option<&[f64]> {
        let j = self.units.iter().position(|u| u == unit)?;
        Some(&self.columns[j])
    }

    /// Column for `unit`, or a validation error naming it.
    pub fn require_column(&self, unit: &str) -> Result<&[f64]> {
        self.column(unit)
            .ok_or_else(|| Error::Validation(format!("unit '{unit}' is not in the panel")))
    }

    /// All columns in unit order.
    pub fn columns(&self) -> &[Vec<f64>] {
        &self.columns
    }

    /// Sub-slice with the given units, in the given order.
    pub fn select(&self, units: &[String]) -> Result<WideSlice> {
        let columns = units
            .iter()
            .map(|u| self.require_column(u).map(<[f64]>::to_vec))
            .collect::<Result<Vec<_>>>()?;
        WideSlice::from_columns(self.periods.clone(), units.to_vec(), columns)
    }

    /// Rows strictly before `cutoff`.
    pub fn before(&self, cutoff: Period) -> WideSlice {
        let n = self.periods.partition_point(|p| *p < cutoff);
        WideSlice {
            periods: self.periods[..n].to_vec(),
            units: self.units.clone(),
            columns: self.columns.iter().map(|c| c[..n].to_vec()).collect(),
        }
    }

    /// `true` for every row at or after `start` (post-period mask).
    pub fn mask_from(&self, start: Period) -> Vec<bool> {
        self.periods.iter().map(|p| *p >= start).collect()
    }

    /// `true` for every row strictly before `cutoff`.
    pub fn mask_before(&self, cutoff: Period) -> Vec<bool> {
        self.periods.iter().map(|p| *p < cutoff).collect()
    }

    /// Rows where every listed column is defined.
    pub fn complete_rows(&self, units: &[String]) -> Result<Vec<bool>> {
        let cols = units.iter().map(|u| self.require_column(u)).collect::<Result<Vec<_>>>()?;
        Ok((0..self.n_periods()).map(|t| cols.iter().all(|c| c[t].is_finite())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(unit: &str, year: i32, month: &str, num: f64, den: f64) -> RawObservation {
        RawObservation {
            unit: Some(unit.to_string()),
            year: Some(year),
            month: Some(month.to_string()),
            numerator: Some(num),
            denominator: Some(den),
            covariate: None,
        }
    }

    fn p(s: &str) -> Period {
        s.parse().unwrap()
    }

    #[test]
    fn load_drops_and_counts_invalid_rows() {
        let rows = vec![
            raw("Oregon", 2020, "January", 10.0, 100.0),
            raw("  ", 2020, "1", 1.0, 1.0),
            raw("Oregon", 2020, "Smarch", 1.0, 1.0),
            RawObservation { year: None, ..raw("Oregon", 2020, "1", 1.0, 1.0) },
            raw("Oregon", 2020, "2", 1.0, 0.0),
            RawObservation { numerator: None, ..raw("Oregon", 2020, "3", 1.0, 1.0) },
            raw("Idaho", 2020, "1", f64::NAN, 5.0),
        ];
        let panel = Panel::load(rows);
        assert_eq!(panel.observations().len(), 1);
        let d = panel.dropped();
        assert_eq!(d.missing_unit, 1);
        assert_eq!(d.unresolvable_period, 2);
        assert_eq!(d.undefined_rate, 3);
        assert_eq!(d.total(), 6);
        assert!((panel.observations()[0].rate() - 0.1).abs() < 1e-15);
    }

    #[test]
    fn to_wide_aggregates_duplicates_by_sum() {
        let panel = Panel::load(vec![
            raw("Oregon", 2020, "1", 10.0, 100.0),
            raw("Oregon", 2020, "1", 30.0, 100.0),
            raw("Idaho", 2020, "1", 5.0, 50.0),
            raw("Idaho", 2020, "2", 6.0, 50.0),
        ]);
        assert_eq!(panel.periods(), vec![p("2020-01"), p("2020-02")]);
        let wide = panel.to_wide(PeriodRange::new(p("2020-01"), p("2020-02")).unwrap()).unwrap();
        assert_eq!(wide.units(), &["Idaho".to_string(), "Oregon".to_string()]);
        assert_eq!(wide.n_periods(), 2);
        assert!((wide.column("Oregon").unwrap()[0] - 0.2).abs() < 1e-15);
        assert!(wide.column("Oregon").unwrap()[1].is_nan());
        assert!((wide.column("Idaho").unwrap()[1] - 0.12).abs() < 1e-15);
    }

    #[test]
    fn to_wide_rejects_case_ambiguous_units() {
        let panel = Panel::load(vec![
            raw("Oregon", 2020, "1", 1.0, 10.0),
            raw("oregon", 2020, "1", 2.0, 10.0),
        ]);
        let span = panel.span().unwrap();
        let err = panel.to_wide(span).unwrap_err();
        assert!(matches!(err, Error::MalformedPanel(_)), "{err}");
    }

    #[test]
    fn to_wide_rejects_inverted_range() {
        let panel = Panel::load(vec![raw("Oregon", 2020, "1", 1.0, 10.0)]);
        let bad = PeriodRange { start: p("2021-01"), end: p("2020-01") };
        assert!(matches!(panel.to_wide(bad), Err(Error::MalformedPanel(_))));
    }

    #[test]
    fn slice_views() {
        let periods = vec![p("2020-01"), p("2020-02"), p("2020-03")];
        let wide = WideSlice::from_columns(
            periods,
            vec!["A".into(), "B".into()],
            vec![vec![1.0, 2.0, 3.0], vec![4.0, f64::NAN, 6.0]],
        )
        .unwrap();

        let early = wide.before(p("2020-03"));
        assert_eq!(early.n_periods(), 2);
        assert_eq!(early.column("A").unwrap(), &[1.0, 2.0]);

        assert_eq!(wide.mask_from(p("2020-02")), vec![false, true, true]);
        assert_eq!(wide.mask_before(p("2020-02")), vec![true, false, false]);
        assert_eq!(wide.complete_rows(&["A".into(), "B".into()]).unwrap(), vec![true, false, true]);

        let b = wide.select(&["B".into()]).unwrap();
        assert_eq!(b.n_units(), 1);
        assert!(wide.select(&["C".into()]).is_err());
    }

    #[test]
    fn covariate_means_per_unit() {
        let mut a = raw("Oregon", 2020, "1", 1.0, 10.0);
        a.covariate = Some(40.0);
        let mut b = raw("Oregon", 2020, "2", 1.0, 10.0);
        b.covariate = Some(44.0);
        let panel = Panel::load(vec![a, b, raw("Idaho", 2020, "1", 1.0, 10.0)]);
        let means = panel.covariate_means();
        assert!((means["Oregon"] - 42.0).abs() < 1e-12);
        assert!(!means.contains_key("Idaho"));
    }
}

//! Common data types for synthstat

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Month, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A calendar month. The panel's time axis has monthly granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    /// Create a period; `month` is 1-based.
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(Error::Validation(format!("month must be in 1..=12, got {month}")));
        }
        Ok(Self { year, month })
    }

    /// Resolve a (year, month) pair where the month is either a number
    /// (`"2"`, `"02"`) or a name (`"February"`, `"feb"`).
    ///
    /// Returns `None` when either part is unresolvable.
    pub fn resolve(year: i32, month: &str) -> Option<Self> {
        let month = month.trim();
        if month.is_empty() {
            return None;
        }
        let number = match month.parse::<u32>() {
            Ok(n) => n,
            Err(_) => {
                // Spreadsheet exports sometimes carry "2.0" for numeric months.
                if let Ok(f) = month.parse::<f64>() {
                    if f.fract() != 0.0 || !f.is_finite() {
                        return None;
                    }
                    f as u32
                } else {
                    Month::from_str(month).ok()?.number_from_month()
                }
            }
        };
        Self::new(year, number).ok()
    }

    /// Period containing a calendar date.
    pub fn from_date(date: NaiveDate) -> Self {
        Self { year: date.year(), month: date.month() }
    }

    /// Year.
    pub fn year(&self) -> i32 {
        self.year
    }

    /// Month (1-based).
    pub fn month(&self) -> u32 {
        self.month
    }

    fn ordinal(&self) -> i64 {
        self.year as i64 * 12 + (self.month as i64 - 1)
    }

    fn from_ordinal(ord: i64) -> Self {
        Self { year: ord.div_euclid(12) as i32, month: (ord.rem_euclid(12) + 1) as u32 }
    }

    /// Shift by a (possibly negative) number of months.
    pub fn add_months(&self, months: i64) -> Self {
        Self::from_ordinal(self.ordinal() + months)
    }

    /// The following month.
    pub fn succ(&self) -> Self {
        self.add_months(1)
    }

    /// Signed number of months from `self` to `other`.
    pub fn months_until(&self, other: &Period) -> i64 {
        other.ordinal() - self.ordinal()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = Error;

    /// Accepts `YYYY-MM` or `YYYY-MM-DD`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Ok(Self::from_date(date));
        }
        let (y, m) = s
            .split_once('-')
            .ok_or_else(|| Error::Validation(format!("expected YYYY-MM, got '{s}'")))?;
        let year: i32 =
            y.parse().map_err(|_| Error::Validation(format!("invalid year in '{s}'")))?;
        Period::resolve(year, m).ok_or_else(|| Error::Validation(format!("invalid month in '{s}'")))
    }
}

impl TryFrom<String> for Period {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Period> for String {
    fn from(p: Period) -> Self {
        p.to_string()
    }
}

/// Inclusive range of months.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodRange {
    /// First month (inclusive).
    pub start: Period,
    /// Last month (inclusive).
    pub end: Period,
}

impl PeriodRange {
    /// Create a range; `start` must not be after `end`.
    pub fn new(start: Period, end: Period) -> Result<Self> {
        if start > end {
            return Err(Error::Validation(format!("range start {start} is after end {end}")));
        }
        Ok(Self { start, end })
    }

    /// Number of months in the range.
    pub fn len(&self) -> usize {
        (self.start.months_until(&self.end) + 1).max(0) as usize
    }

    /// Always false for a constructed range.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `p` lies inside the range.
    pub fn contains(&self, p: &Period) -> bool {
        *p >= self.start && *p <= self.end
    }

    /// Every month of the range in order.
    pub fn months(&self) -> Vec<Period> {
        (0..self.len() as i64).map(|k| self.start.add_months(k)).collect()
    }
}

/// One raw row as delivered by the ingestion layer; nothing is validated yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawObservation {
    /// Unit identifier (state name).
    pub unit: Option<String>,
    /// Calendar year.
    pub year: Option<i32>,
    /// Month as a number or a name.
    pub month: Option<String>,
    /// Event count (crashes).
    pub numerator: Option<f64>,
    /// Exposure (population, vehicle miles).
    pub denominator: Option<f64>,
    /// Optional unit-level covariate (population density).
    pub covariate: Option<f64>,
}

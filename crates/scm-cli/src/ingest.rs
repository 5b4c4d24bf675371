//! CSV ingestion into raw panel rows.
//!
//! Column names come from the run config. Unparseable numbers become missing
//! values; the panel store decides which rows survive.

use std::path::Path;

use anyhow::{Context, Result, bail};
use scm_core::RawObservation;

use crate::config::ColumnMap;

fn column_index(headers: &csv::StringRecord, name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .with_context(|| format!("CSV has no column '{name}'"))
}

fn parse_f64(field: Option<&str>) -> Option<f64> {
    let s = field?.trim().replace(',', "");
    if s.is_empty() { None } else { s.parse().ok() }
}

fn parse_year(field: Option<&str>) -> Option<i32> {
    let s = field?.trim();
    s.parse::<i32>().ok().or_else(|| {
        s.parse::<f64>().ok().filter(|v| v.fract() == 0.0).map(|v| v as i32)
    })
}

/// Read every data row of `path`.
pub fn read_csv(path: &Path, columns: &ColumnMap) -> Result<Vec<RawObservation>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let headers = rdr.headers().context("failed to read CSV headers")?.clone();
    let unit = column_index(&headers, &columns.unit)?;
    let year = column_index(&headers, &columns.year)?;
    let month = column_index(&headers, &columns.month)?;
    let numerator = column_index(&headers, &columns.numerator)?;
    let denominator = column_index(&headers, &columns.denominator)?;
    let covariate = columns.covariate.as_deref().map(|c| column_index(&headers, c)).transpose()?;

    let mut rows = Vec::new();
    for (i, record) in rdr.records().enumerate() {
        let record = record.with_context(|| format!("failed to read CSV row {}", i + 1))?;
        let text = |j: usize| record.get(j).map(str::trim).filter(|s| !s.is_empty());
        rows.push(RawObservation {
            unit: text(unit).map(str::to_string),
            year: parse_year(record.get(year)),
            month: text(month).map(str::to_string),
            numerator: parse_f64(record.get(numerator)),
            denominator: parse_f64(record.get(denominator)),
            covariate: covariate.and_then(|j| parse_f64(record.get(j))),
        });
    }
    if rows.is_empty() {
        bail!("{} contains no data rows", path.display());
    }
    tracing::info!(path = %path.display(), rows = rows.len(), "read panel CSV");
    Ok(rows)
}

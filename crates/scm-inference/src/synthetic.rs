//! Synthetic series construction and pre-period level rescaling.

use scm_core::{Error, Period, Result};
use serde::Serialize;

use crate::panel::WideSlice;

/// Weighted donor combination over a slice's periods.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyntheticSeries {
    /// Row labels (same as the donor slice).
    pub periods: Vec<Period>,
    /// Synthetic outcome; `NaN` where any donor cell is missing.
    pub values: Vec<f64>,
}

/// Build the raw synthetic series `Σ_j w_j · Y[:, j]` for every period of
/// `donors` (the full span, not only the fitting window).
pub fn build(weights: &[f64], donors: &WideSlice) -> Result<SyntheticSeries> {
    if weights.len() != donors.n_units() {
        return Err(Error::Validation(format!(
            "{} weights for {} donor columns",
            weights.len(),
            donors.n_units()
        )));
    }
    let values = (0..donors.n_periods())
        .map(|t| {
            let mut acc = 0.0;
            for (col, w) in donors.columns().iter().zip(weights) {
                let v = col[t];
                if !v.is_finite() {
                    return f64::NAN;
                }
                acc += w * v;
            }
            acc
        })
        .collect();
    Ok(SyntheticSeries { periods: donors.periods().to_vec(), values })
}

/// A rescaled copy of a series plus the scalar that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RescaledSeries {
    /// `mean(anchor[pre]) / mean(series[pre])`; `NaN` when undefined.
    pub scalar: f64,
    /// Pre-period mean of the input series (the divisor).
    pub series_mean: f64,
    /// `series · scalar`.
    pub values: Vec<f64>,
}

impl RescaledSeries {
    /// Whether the scalar is a finite number.
    pub fn is_defined(&self) -> bool {
        self.scalar.is_finite()
    }
}

/// Mean over `mask`, skipping undefined values. `NaN` if nothing qualifies.
pub fn masked_mean(values: &[f64], mask: &[bool]) -> f64 {
    let (sum, n) = values
        .iter()
        .zip(mask)
        .filter(|&(v, &m)| m && v.is_finite())
        .fold((0.0, 0usize), |(s, n), (v, _)| (s + v, n + 1));
    if n == 0 { f64::NAN } else { sum / n as f64 }
}

/// Scale `series` so its pre-period mean matches `anchor`'s.
///
/// A zero (or undefined) pre-period mean of `series` yields a `NaN` scalar
/// and an all-`NaN` series; nothing is clamped.
pub fn rescale(series: &[f64], anchor: &[f64], pre_mask: &[bool]) -> Result<RescaledSeries> {
    if series.len() != anchor.len() || series.len() != pre_mask.len() {
        return Err(Error::Validation(format!(
            "rescale length mismatch: series {}, anchor {}, mask {}",
            series.len(),
            anchor.len(),
            pre_mask.len()
        )));
    }
    let series_mean = masked_mean(series, pre_mask);
    let anchor_mean = masked_mean(anchor, pre_mask);
    let scalar = if series_mean == 0.0 { f64::NAN } else { anchor_mean / series_mean };
    if !scalar.is_finite() {
        log::debug!("rescale undefined: series pre-mean {series_mean}, anchor {anchor_mean}");
    }
    let values = series.iter().map(|v| v * scalar).collect();
    Ok(RescaledSeries { scalar, series_mean, values })
}

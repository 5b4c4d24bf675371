//! Treatment effect on the treated and pre-period fit diagnostics.
//!
//! All functions here are pure: a gap series and a post-period mask in, a
//! summary out. Undefined (`NaN`) gap points are ignored everywhere.

use scm_core::{Error, Result};
use serde::Serialize;

use crate::synthetic::masked_mean;

/// ATT estimate and fit diagnostics for one gap series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AttResult {
    /// `mean(gap | post) − mean(gap | ¬post)`.
    pub att: f64,
    /// Mean gap over the pre-period.
    pub mean_pre: f64,
    /// Mean gap over the post-period.
    pub mean_post: f64,
    /// Pre-period mean squared prediction error.
    pub mspe_pre: f64,
    /// Pre-period root mean squared error.
    pub rmse_pre: f64,
    /// Pre-period mean absolute error.
    pub mae_pre: f64,
    /// Post-period mean squared prediction error.
    pub mspe_post: f64,
    /// `mspe_post / mspe_pre` (∞ for a perfect pre-fit with post deviation,
    /// `NaN` when both are zero).
    pub mspe_ratio: f64,
    /// Defined pre-period points.
    pub n_pre: usize,
    /// Defined post-period points.
    pub n_post: usize,
}

/// Treated minus synthetic, pointwise.
pub fn gap(treated: &[f64], synthetic: &[f64]) -> Result<Vec<f64>> {
    if treated.len() != synthetic.len() {
        return Err(Error::Validation(format!(
            "treated series has {} points, synthetic {}",
            treated.len(),
            synthetic.len()
        )));
    }
    Ok(treated.iter().zip(synthetic).map(|(y, s)| y - s).collect())
}

fn mean_of<F: Fn(f64) -> f64>(gap: &[f64], mask: &[bool], f: F) -> (f64, usize) {
    let (sum, n) = gap
        .iter()
        .zip(mask)
        .filter(|&(g, &m)| m && g.is_finite())
        .fold((0.0, 0usize), |(s, n), (&g, _)| (s + f(g), n + 1));
    if n == 0 { (f64::NAN, 0) } else { (sum / n as f64, n) }
}

/// ATT and diagnostics. A side with no defined point makes `att` `NaN`.
pub fn att(gap: &[f64], post_mask: &[bool]) -> Result<AttResult> {
    if gap.len() != post_mask.len() {
        return Err(Error::Validation(format!(
            "gap has {} points, post mask {}",
            gap.len(),
            post_mask.len()
        )));
    }
    let pre_mask: Vec<bool> = post_mask.iter().map(|m| !m).collect();

    let mean_post = masked_mean(gap, post_mask);
    let mean_pre = masked_mean(gap, &pre_mask);
    let (mspe_pre, n_pre) = mean_of(gap, &pre_mask, |g| g * g);
    let (mae_pre, _) = mean_of(gap, &pre_mask, f64::abs);
    let (mspe_post, n_post) = mean_of(gap, post_mask, |g| g * g);

    Ok(AttResult {
        att: mean_post - mean_pre,
        mean_pre,
        mean_post,
        mspe_pre,
        rmse_pre: mspe_pre.sqrt(),
        mae_pre,
        mspe_post,
        mspe_ratio: mspe_ratio(mspe_post, mspe_pre),
        n_pre,
        n_post,
    })
}

/// Post/pre MSPE ratio.
pub fn mspe_ratio(mspe_post: f64, mspe_pre: f64) -> f64 {
    if mspe_pre > 0.0 {
        mspe_post / mspe_pre
    } else if mspe_pre == 0.0 && mspe_post > 0.0 {
        f64::INFINITY
    } else {
        f64::NAN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn att_is_post_mean_minus_pre_mean() {
        let g = vec![1.0, -1.0, 2.0, 5.0, 7.0];
        let post = vec![false, false, false, true, true];
        let r = att(&g, &post).unwrap();
        let expected = (5.0 + 7.0) / 2.0 - (1.0 - 1.0 + 2.0) / 3.0;
        assert_eq!(r.att, expected);
        assert_eq!(r.n_pre, 3);
        assert_eq!(r.n_post, 2);
        assert_relative_eq!(r.mspe_pre, 2.0, epsilon = 1e-15);
        assert_relative_eq!(r.rmse_pre, 2.0_f64.sqrt(), epsilon = 1e-15);
        assert_relative_eq!(r.mae_pre, 4.0 / 3.0, epsilon = 1e-15);
        assert_relative_eq!(r.mspe_post, 37.0, epsilon = 1e-12);
        assert_relative_eq!(r.mspe_ratio, 18.5, epsilon = 1e-12);
    }

    #[test]
    fn undefined_points_are_ignored() {
        let g = vec![1.0, f64::NAN, 3.0, f64::NAN, 10.0];
        let post = vec![false, false, false, true, true];
        let r = att(&g, &post).unwrap();
        assert_eq!(r.n_pre, 2);
        assert_eq!(r.n_post, 1);
        assert_eq!(r.att, 8.0);
    }

    #[test]
    fn empty_side_gives_nan_att() {
        let r = att(&[1.0, 2.0], &[false, false]).unwrap();
        assert!(r.att.is_nan());
        assert_eq!(r.n_post, 0);
        assert!(r.mspe_pre.is_finite());
    }

    #[test]
    fn all_zero_gap() {
        let r = att(&[0.0; 6], &[false, false, false, true, true, true]).unwrap();
        assert_eq!(r.att, 0.0);
        assert_eq!(r.mspe_pre, 0.0);
        assert!(r.mspe_ratio.is_nan());
    }

    #[test]
    fn mspe_zero_only_on_exact_fit() {
        let exact = att(&[0.0, 0.0, 3.0], &[false, false, true]).unwrap();
        assert_eq!(exact.mspe_pre, 0.0);
        assert_eq!(exact.mspe_ratio, f64::INFINITY);
        let off = att(&[0.0, 1e-6, 3.0], &[false, false, true]).unwrap();
        assert!(off.mspe_pre > 0.0);
    }

    #[test]
    fn gap_and_att_validate_lengths() {
        assert!(gap(&[1.0], &[1.0, 2.0]).is_err());
        assert!(att(&[1.0], &[true, false]).is_err());
        assert_eq!(gap(&[3.0, 1.0], &[1.0, 1.0]).unwrap(), vec![2.0, 0.0]);
    }
}

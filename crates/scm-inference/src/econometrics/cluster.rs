//! Cluster-robust (Liang–Zeger) sandwich standard errors.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use scm_core::{Error, Result};

/// Cluster-robust standard errors for OLS coefficients.
///
/// `V = (X'X)⁻¹ (Σ_g X_g' e_g e_g' X_g) (X'X)⁻¹ · G/(G−1) · (N−1)/(N−K)`,
/// with the small-sample factor applied only when `G > 1` and `N > K`.
pub fn cluster_robust_se<K: Ord>(
    x: &DMatrix<f64>,
    residuals: &DVector<f64>,
    xtx_inv: &DMatrix<f64>,
    cluster_ids: &[K],
) -> Result<Vec<f64>> {
    let n = x.nrows();
    let p = x.ncols();
    if residuals.len() != n || cluster_ids.len() != n {
        return Err(Error::Validation(format!(
            "cluster SE: {n} design rows, {} residuals, {} cluster ids",
            residuals.len(),
            cluster_ids.len()
        )));
    }

    let mut clusters: BTreeMap<&K, Vec<usize>> = BTreeMap::new();
    for (i, cid) in cluster_ids.iter().enumerate() {
        clusters.entry(cid).or_default().push(i);
    }
    let g = clusters.len() as f64;

    let mut meat = DMatrix::<f64>::zeros(p, p);
    for rows in clusters.values() {
        let mut score = DVector::<f64>::zeros(p);
        for &i in rows {
            score += x.row(i).transpose() * residuals[i];
        }
        meat += &score * score.transpose();
    }

    let (n_f, p_f) = (n as f64, p as f64);
    let correction =
        if g > 1.0 && n_f > p_f { (g / (g - 1.0)) * ((n_f - 1.0) / (n_f - p_f)) } else { 1.0 };
    let vcov = (xtx_inv * &meat) * xtx_inv * correction;

    Ok((0..p).map(|j| vcov[(j, j)].max(0.0).sqrt()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_regressor_matches_hand_computation() {
        // y on a constant: beta = mean, residuals = y - mean.
        let x = DMatrix::from_element(4, 1, 1.0);
        let resid = DVector::from_vec(vec![-1.5, -0.5, 0.5, 1.5]);
        let xtx_inv = DMatrix::from_element(1, 1, 0.25);
        let ids = ["a", "a", "b", "b"];
        let se = cluster_robust_se(&x, &resid, &xtx_inv, &ids).unwrap();
        // Scores: a = -2, b = 2; meat = 8; V = 8/16 · 2 · 3/3 = 1.
        assert!((se[0] - 1.0).abs() < 1e-12, "se={}", se[0]);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let x = DMatrix::from_element(2, 1, 1.0);
        let resid = DVector::from_vec(vec![0.0, 0.0]);
        let xtx_inv = DMatrix::from_element(1, 1, 0.5);
        assert!(cluster_robust_se(&x, &resid, &xtx_inv, &[1u32]).is_err());
    }
}

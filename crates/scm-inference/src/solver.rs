//! Donor-weight quadratic program.
//!
//! Solves
//!
//! ```text
//! minimize   ½ wᵀ H w − cᵀ w,   H = 2·(YᵀY + ρI),  c = 2·Yᵀy
//! subject to 1ᵀw = 1,  w ≥ 0
//! ```
//!
//! which is ‖y − Yw‖² up to a constant (ρ is a tiny relative ridge that keeps
//! H positive definite when donors are collinear or D > T; among equally good
//! fits it selects the minimum-norm one).
//!
//! The method is a primal active-set iteration started from the uniform weight
//! vector. Each step solves the equality-constrained subproblem on the free set
//! with a Cholesky factorisation of `H_FF`:
//!
//! ```text
//! p = −H_FF⁻¹ (g_F + λ·1),   λ = −(1ᵀH_FF⁻¹g_F) / (1ᵀH_FF⁻¹1)
//! ```
//!
//! and the multipliers of the bound constraints are `μ_i = g_i + λ`.

use nalgebra::{Cholesky, DMatrix, DVector};
use scm_core::{Error, Result, WeightSolver};

/// Active-set solver configuration.
#[derive(Debug, Clone)]
pub struct ActiveSetSolver {
    /// Ridge relative to the mean diagonal of YᵀY.
    pub ridge: f64,
    /// Iteration cap; `None` uses `50 + 10·D`.
    pub max_iter: Option<usize>,
    /// Step norm below which the free-set subproblem is considered solved.
    pub step_tol: f64,
    /// Relative tolerance on bound multipliers.
    pub multiplier_tol: f64,
}

impl Default for ActiveSetSolver {
    fn default() -> Self {
        Self { ridge: 1e-10, max_iter: None, step_tol: 1e-12, multiplier_tol: 1e-10 }
    }
}

impl ActiveSetSolver {
    /// Solver with default tolerances.
    pub fn new() -> Self {
        Self::default()
    }

    fn hessian_and_linear(
        &self,
        target: &[f64],
        donors: &[Vec<f64>],
    ) -> Result<(DMatrix<f64>, DVector<f64>)> {
        let d = donors.len();
        let t = target.len();
        if d == 0 {
            return Err(Error::InfeasibleWeights("donor set is empty".into()));
        }
        if t == 0 {
            return Err(Error::InfeasibleWeights("fitting window is empty".into()));
        }
        if let Some((j, c)) = donors.iter().enumerate().find(|(_, c)| c.len() != t) {
            return Err(Error::Validation(format!(
                "donor column {j} has length {}, expected {t}",
                c.len()
            )));
        }
        if target.iter().chain(donors.iter().flatten()).any(|v| !v.is_finite()) {
            return Err(Error::InfeasibleWeights("fitting data contains non-finite values".into()));
        }

        let y_mat = DMatrix::from_fn(t, d, |i, j| donors[j][i]);
        let y_vec = DVector::from_column_slice(target);

        let mut yty = y_mat.transpose() * &y_mat;
        let scale = (yty.trace() / d as f64).max(1e-300);
        for j in 0..d {
            yty[(j, j)] += self.ridge * scale;
        }
        let h = yty * 2.0;
        let c = (y_mat.transpose() * y_vec) * 2.0;
        Ok((h, c))
    }
}

impl WeightSolver for ActiveSetSolver {
    fn solve(&self, target: &[f64], donors: &[Vec<f64>]) -> Result<Vec<f64>> {
        let (h, c) = self.hessian_and_linear(target, donors)?;
        let d = c.len();
        if d == 1 {
            return Ok(vec![1.0]);
        }

        let max_iter = self.max_iter.unwrap_or(50 + 10 * d);
        let mut w = DVector::from_element(d, 1.0 / d as f64);
        let mut active = vec![false; d];
        // Set after an unblocked step: the free-set subproblem is solved, so the
        // next pass only inspects multipliers (p is round-off there).
        let mut on_subspace_minimum = false;

        for iter in 0..max_iter {
            let g = &h * &w - &c;
            let free: Vec<usize> = (0..d).filter(|&i| !active[i]).collect();
            let nf = free.len();

            let h_ff = DMatrix::from_fn(nf, nf, |a, b| h[(free[a], free[b])]);
            let chol = Cholesky::new(h_ff).ok_or_else(|| {
                Error::InfeasibleWeights("free-set Hessian is not positive definite".into())
            })?;
            let g_f = DVector::from_fn(nf, |a, _| g[free[a]]);
            let ones = DVector::from_element(nf, 1.0);
            let hinv_g = chol.solve(&g_f);
            let hinv_1 = chol.solve(&ones);
            let denom = hinv_1.sum();
            if !(denom.is_finite() && denom > 0.0) {
                return Err(Error::InfeasibleWeights("degenerate KKT system".into()));
            }
            let lambda = -hinv_g.sum() / denom;
            let p_f = -(hinv_g + hinv_1 * lambda);

            if on_subspace_minimum || p_f.norm() <= self.step_tol {
                // Stationary on the free set: check bound multipliers.
                let g_scale = 1.0 + g.amax();
                let worst = (0..d)
                    .filter(|&i| active[i])
                    .map(|i| (i, g[i] + lambda))
                    .min_by(|a, b| a.1.total_cmp(&b.1));
                match worst {
                    Some((i, mu)) if mu < -self.multiplier_tol * g_scale => {
                        active[i] = false;
                        on_subspace_minimum = false;
                    }
                    _ => {
                        log::debug!("active-set solver converged in {} iterations", iter + 1);
                        return finalize(w);
                    }
                }
                continue;
            }

            // Longest feasible step along p, capped at 1.
            let mut alpha = 1.0_f64;
            let mut blocking = None;
            for (a, &i) in free.iter().enumerate() {
                if p_f[a] < 0.0 {
                    let ratio = -w[i] / p_f[a];
                    if ratio < alpha {
                        alpha = ratio;
                        blocking = Some(i);
                    }
                }
            }
            for (a, &i) in free.iter().enumerate() {
                w[i] += alpha * p_f[a];
            }
            if let Some(i) = blocking {
                w[i] = 0.0;
                active[i] = true;
            }
            on_subspace_minimum = blocking.is_none();
        }

        Err(Error::InfeasibleWeights(format!(
            "active-set solver did not converge in {max_iter} iterations"
        )))
    }

    fn name(&self) -> &str {
        "active-set"
    }
}

/// Clamp round-off negatives and renormalise onto the simplex.
fn finalize(w: DVector<f64>) -> Result<Vec<f64>> {
    let mut out: Vec<f64> = w.iter().map(|&v| if v < 0.0 { 0.0 } else { v }).collect();
    let s: f64 = out.iter().sum();
    if !(s.is_finite() && s > 0.0) {
        return Err(Error::InfeasibleWeights(format!("weights sum to {s}")));
    }
    for v in &mut out {
        *v /= s;
    }
    Ok(out)
}

/// Squared reconstruction error ‖y − Yw‖².
pub fn reconstruction_error(target: &[f64], donors: &[Vec<f64>], weights: &[f64]) -> f64 {
    target
        .iter()
        .enumerate()
        .map(|(t, &y)| {
            let fit: f64 = donors.iter().zip(weights).map(|(col, w)| col[t] * w).sum();
            (y - fit).powi(2)
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn series(f: impl Fn(usize) -> f64, t: usize) -> Vec<f64> {
        (0..t).map(f).collect()
    }

    #[test]
    fn exact_match_gets_full_weight() {
        let t = 12;
        let d0 = series(|i| 10.0 + (i as f64 * 0.7).sin(), t);
        let d1 = series(|i| 12.0 + 0.3 * i as f64, t);
        let d2 = series(|i| 8.0 + (i as f64 * 1.3).cos() * 2.0, t);
        let y = d1.clone();

        let w = ActiveSetSolver::new().solve(&y, &[d0.clone(), d1.clone(), d2.clone()]).unwrap();
        assert!((w[1] - 1.0).abs() < 1e-6, "w={w:?}");
        assert!(w[0].abs() < 1e-6 && w[2].abs() < 1e-6, "w={w:?}");
        assert!(reconstruction_error(&y, &[d0, d1, d2], &w) < 1e-8);
    }

    #[test]
    fn identical_donors_split_evenly() {
        let d = series(|i| 5.0 + i as f64, 10);
        let w = ActiveSetSolver::new().solve(&d, &[d.clone(), d.clone()]).unwrap();
        assert!((w[0] - 0.5).abs() < 1e-6 && (w[1] - 0.5).abs() < 1e-6, "w={w:?}");
    }

    #[test]
    fn interior_convex_combination_recovered() {
        let t = 24;
        let d0 = series(|i| 1.0 + 0.1 * i as f64, t);
        let d1 = series(|i| 3.0 + (i as f64 * 0.5).sin(), t);
        let d2 = series(|i| 2.0 + (i as f64 * 0.9).cos(), t);
        let y: Vec<f64> = (0..t).map(|i| 0.2 * d0[i] + 0.5 * d1[i] + 0.3 * d2[i]).collect();
        let w = ActiveSetSolver::new().solve(&y, &[d0, d1, d2]).unwrap();
        assert!((w[0] - 0.2).abs() < 1e-6);
        assert!((w[1] - 0.5).abs() < 1e-6);
        assert!((w[2] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn target_outside_hull_hits_the_boundary() {
        // y is above every donor: the best simplex point is the top donor.
        let t = 8;
        let lo = series(|_| 1.0, t);
        let hi = series(|_| 2.0, t);
        let y = series(|_| 5.0, t);
        let w = ActiveSetSolver::new().solve(&y, &[lo, hi]).unwrap();
        assert!(w[0].abs() < 1e-9 && (w[1] - 1.0).abs() < 1e-9, "w={w:?}");
    }

    #[test]
    fn more_donors_than_periods_still_feasible() {
        let donors: Vec<Vec<f64>> =
            (0..6).map(|j| vec![j as f64, (j * j) as f64 * 0.1, 1.0 + j as f64 * 0.5]).collect();
        let y = vec![2.5, 0.9, 2.25];
        let w = ActiveSetSolver::new().solve(&y, &donors).unwrap();
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(w.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn empty_donor_set_is_infeasible() {
        let err = ActiveSetSolver::new().solve(&[1.0, 2.0], &[]).unwrap_err();
        assert!(matches!(err, Error::InfeasibleWeights(_)));
    }

    #[test]
    fn non_finite_data_is_infeasible() {
        let err = ActiveSetSolver::new().solve(&[1.0, f64::NAN], &[vec![1.0, 2.0]]).unwrap_err();
        assert!(matches!(err, Error::InfeasibleWeights(_)));
    }

    #[test]
    fn ragged_donor_column_is_validation_error() {
        let err = ActiveSetSolver::new().solve(&[1.0, 2.0], &[vec![1.0]]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn iteration_cap_reports_infeasible() {
        let solver = ActiveSetSolver { max_iter: Some(0), ..ActiveSetSolver::default() };
        let err = solver.solve(&[1.0, 2.0], &[vec![1.0, 2.0], vec![2.0, 1.0]]).unwrap_err();
        assert!(matches!(err, Error::InfeasibleWeights(_)));
    }

    proptest! {
        #[test]
        fn weights_on_simplex_and_deterministic(
            cols in prop::collection::vec(prop::collection::vec(-50.0f64..50.0, 15), 1..8),
            y in prop::collection::vec(-50.0f64..50.0, 15),
        ) {
            let solver = ActiveSetSolver::new();
            let w = solver.solve(&y, &cols).unwrap();
            prop_assert_eq!(w.len(), cols.len());
            prop_assert!(w.iter().all(|&v| v >= -1e-8));
            prop_assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-6);

            let again = solver.solve(&y, &cols).unwrap();
            for (a, b) in w.iter().zip(&again) {
                prop_assert!((a - b).abs() < 1e-12);
            }
        }

        #[test]
        fn no_vertex_beats_the_solution(
            cols in prop::collection::vec(prop::collection::vec(0.0f64..20.0, 12), 2..6),
            y in prop::collection::vec(0.0f64..20.0, 12),
        ) {
            let w = ActiveSetSolver::new().solve(&y, &cols).unwrap();
            let best = reconstruction_error(&y, &cols, &w);
            for j in 0..cols.len() {
                let mut e = vec![0.0; cols.len()];
                e[j] = 1.0;
                let vertex = reconstruction_error(&y, &cols, &e);
                prop_assert!(best <= vertex * (1.0 + 1e-6) + 1e-6);
            }
        }
    }
}

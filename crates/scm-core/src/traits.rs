//! Core traits for synthstat
//!
//! The estimation pipeline depends on the `WeightSolver` abstraction, not on a
//! concrete QP implementation, so alternative back ends can be swapped in
//! without touching the placebo or sensitivity loops.

use crate::Result;

/// Donor-weight solver: minimize ‖y − Yw‖² subject to w ≥ 0 and Σw = 1.
pub trait WeightSolver: Send + Sync {
    /// Solve for donor weights.
    ///
    /// - `target`: treated-unit outcomes over the fitting window (length T).
    /// - `donors`: one column per donor, each of length T.
    ///
    /// Returns one weight per donor, in column order. Must fail with
    /// [`crate::Error::InfeasibleWeights`] when no feasible minimizer can be
    /// produced.
    fn solve(&self, target: &[f64], donors: &[Vec<f64>]) -> Result<Vec<f64>>;

    /// Solver name, recorded in output artifacts.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    struct FirstDonor;

    impl WeightSolver for FirstDonor {
        fn solve(&self, _target: &[f64], donors: &[Vec<f64>]) -> Result<Vec<f64>> {
            if donors.is_empty() {
                return Err(Error::InfeasibleWeights("no donors".into()));
            }
            let mut w = vec![0.0; donors.len()];
            w[0] = 1.0;
            Ok(w)
        }

        fn name(&self) -> &str {
            "FirstDonor"
        }
    }

    #[test]
    fn test_trait_object() {
        let solver: &dyn WeightSolver = &FirstDonor;
        assert_eq!(solver.name(), "FirstDonor");
        assert_eq!(solver.solve(&[1.0], &[vec![1.0], vec![2.0]]).unwrap(), vec![1.0, 0.0]);
        assert!(solver.solve(&[1.0], &[]).is_err());
    }
}

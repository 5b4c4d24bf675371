//! Covariate-adjusted difference-in-differences cross-check.
//!
//! Fits `rate = α + β₁·treated + β₂·post + δ·(treated×post) [+ γ·covariate] + ε`
//! by OLS over the treated unit and its donors, on long-format rows. δ is a
//! regression counterpart of the synthetic control ATT.

use std::collections::BTreeSet;

use nalgebra::{DMatrix, DVector};
use scm_core::{Error, PeriodRange, Result};
use serde::Serialize;

use super::cluster::cluster_robust_se;
use crate::panel::Panel;
use crate::pipeline::RunDesign;
use crate::placebo::normal_two_sided_p;

/// DiD regression summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DidCrossCheck {
    /// Interaction coefficient δ.
    pub delta: f64,
    /// OLS standard error of δ.
    pub se: f64,
    /// Cluster-robust standard error of δ (clustered by unit).
    pub se_cluster: f64,
    /// `delta / se_cluster`.
    pub t_stat: f64,
    /// Two-sided normal p-value of `t_stat`.
    pub p_value: Option<f64>,
    /// Covariate coefficient γ, when the covariate was used.
    pub covariate_coef: Option<f64>,
    /// Whether the covariate column entered the regression.
    pub covariate_used: bool,
    /// Mean outcome: treated, post.
    pub mean_treated_post: f64,
    /// Mean outcome: treated, pre.
    pub mean_treated_pre: f64,
    /// Mean outcome: donors, post.
    pub mean_control_post: f64,
    /// Mean outcome: donors, pre.
    pub mean_control_pre: f64,
    /// Rows used.
    pub n_obs: usize,
    /// Distinct units (clusters).
    pub n_clusters: usize,
}

/// Run the DiD regression for `design` over `range`.
///
/// The covariate is used only when every selected row carries one.
pub fn did_cross_check(
    panel: &Panel,
    design: &RunDesign,
    range: PeriodRange,
) -> Result<DidCrossCheck> {
    let pool: BTreeSet<&str> = std::iter::once(design.treated.as_str())
        .chain(design.donors.iter().map(String::as_str))
        .collect();
    let rows: Vec<_> = panel
        .observations()
        .iter()
        .filter(|o| range.contains(&o.period) && pool.contains(o.unit.as_str()))
        .collect();
    if rows.is_empty() {
        return Err(Error::Validation("DiD: no observations for the design".into()));
    }

    let covariate_used = rows.iter().all(|o| o.covariate.is_some_and(f64::is_finite));
    let k = if covariate_used { 5 } else { 4 };
    let n = rows.len();

    let mut sums = [(0.0_f64, 0usize); 4];
    let mut x_data = Vec::with_capacity(n * k);
    let mut y = Vec::with_capacity(n);
    let mut clusters = Vec::with_capacity(n);
    for o in &rows {
        let treated = o.unit == design.treated;
        let post = o.period >= design.event;
        let rate = o.rate();
        let cell = &mut sums[usize::from(treated) * 2 + usize::from(post)];
        cell.0 += rate;
        cell.1 += 1;

        let (d, p) = (f64::from(u8::from(treated)), f64::from(u8::from(post)));
        x_data.extend_from_slice(&[1.0, d, p, d * p]);
        if covariate_used {
            x_data.push(o.covariate.unwrap_or_default());
        }
        y.push(rate);
        clusters.push(o.unit.as_str());
    }
    if sums.iter().any(|&(_, c)| c == 0) {
        return Err(Error::Validation(
            "DiD: all four treated×post cells must have observations".into(),
        ));
    }
    let cell_mean = |i: usize| sums[i].0 / sums[i].1 as f64;

    let x = DMatrix::from_row_slice(n, k, &x_data);
    let y = DVector::from_column_slice(&y);
    let xtx_inv = (x.transpose() * &x)
        .try_inverse()
        .ok_or_else(|| Error::Computation("X'X singular in DiD OLS".into()))?;
    let beta = &xtx_inv * (x.transpose() * &y);
    let resid = &y - &x * &beta;

    let dof = n as f64 - k as f64;
    let sigma2 = if dof > 0.0 { resid.norm_squared() / dof } else { f64::NAN };
    let se = (sigma2 * xtx_inv[(3, 3)]).sqrt();
    let se_cluster = cluster_robust_se(&x, &resid, &xtx_inv, &clusters)?[3];

    let delta = beta[3];
    let t_stat = if se_cluster > 0.0 { delta / se_cluster } else { f64::NAN };
    let n_clusters = clusters.iter().collect::<BTreeSet<_>>().len();
    log::debug!("DiD cross-check: delta={delta:.6}, se_cluster={se_cluster:.6}, n={n}");

    Ok(DidCrossCheck {
        delta,
        se,
        se_cluster,
        t_stat,
        p_value: t_stat.is_finite().then(|| normal_two_sided_p(t_stat)),
        covariate_coef: covariate_used.then(|| beta[4]),
        covariate_used,
        mean_treated_post: cell_mean(3),
        mean_treated_pre: cell_mean(2),
        mean_control_post: cell_mean(1),
        mean_control_pre: cell_mean(0),
        n_obs: n,
        n_clusters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use scm_core::{Period, RawObservation};

    fn raw(unit: &str, year: i32, month: u32, rate: f64, cov: Option<f64>) -> RawObservation {
        RawObservation {
            unit: Some(unit.into()),
            year: Some(year),
            month: Some(month.to_string()),
            numerator: Some(rate * 1000.0),
            denominator: Some(1000.0),
            covariate: cov,
        }
    }

    fn panel(with_cov: bool) -> Panel {
        let mut rows = Vec::new();
        let units = [("T", 5.0, 3.0), ("A", 4.0, 1.0), ("B", 6.0, 2.0), ("C", 5.5, 4.0)];
        for (u, base, dens) in units {
            for m in 1..=12u32 {
                let jump = if u == "T" && m >= 7 { 1.5 } else { 0.0 };
                let wiggle = if m % 2 == 0 { 0.1 } else { -0.1 };
                let cov = with_cov.then_some(dens);
                rows.push(raw(u, 2021, m, base + 0.2 * m as f64 + wiggle + jump, cov));
            }
        }
        Panel::load(rows)
    }

    fn design() -> RunDesign {
        let event: Period = "2021-07".parse().unwrap();
        RunDesign::new("T", vec!["A".into(), "B".into(), "C".into()], event).unwrap()
    }

    fn range() -> PeriodRange {
        PeriodRange::new("2021-01".parse().unwrap(), "2021-12".parse().unwrap()).unwrap()
    }

    #[test]
    fn delta_matches_difference_of_means() {
        let res = did_cross_check(&panel(false), &design(), range()).unwrap();
        let manual = (res.mean_treated_post - res.mean_treated_pre)
            - (res.mean_control_post - res.mean_control_pre);
        assert!((res.delta - manual).abs() < 1e-9);
        assert!((res.delta - 1.5).abs() < 1e-9, "delta={}", res.delta);
        assert!(!res.covariate_used);
        assert_eq!(res.n_obs, 48);
        assert_eq!(res.n_clusters, 4);
        assert!(res.se.is_finite() && res.se > 0.0);
    }

    #[test]
    fn unit_level_covariate_is_used_when_complete() {
        let res = did_cross_check(&panel(true), &design(), range()).unwrap();
        assert!(res.covariate_used);
        assert!(res.covariate_coef.is_some());
        assert!(res.delta.is_finite());
    }

    #[test]
    fn missing_cell_is_rejected() {
        let d = design().with_event("2022-06".parse().unwrap());
        assert!(did_cross_check(&panel(false), &d, range()).is_err());
    }
}

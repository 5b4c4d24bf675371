//! Run design and the single-fit pipeline.
//!
//! `SyntheticControl::estimate` is the one path every loop goes through:
//! fit donor weights on the pre-cutoff window, build the full-span synthetic
//! series, optionally rescale it, and summarise the gap. Placebo and
//! sensitivity loops only ever derive new [`RunDesign`]s; they never mutate a
//! shared one.

use std::collections::BTreeSet;

use scm_core::{Error, Period, Result, WeightSolver};
use serde::Serialize;

use crate::estimator::{self, AttResult};
use crate::panel::WideSlice;
use crate::solver::ActiveSetSolver;
use crate::synthetic;

/// Run-scoped configuration: who is treated, against whom, and when.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunDesign {
    /// Treated unit.
    pub treated: String,
    /// Donor pool (never contains `treated`).
    pub donors: Vec<String>,
    /// Weights are fitted on periods strictly before this month.
    pub pre_cutoff: Period,
    /// Post-period mask is `period >= event`.
    pub event: Period,
    /// Rescale the synthetic series to the treated pre-cutoff mean.
    pub rescale: bool,
}

impl RunDesign {
    /// Design with `pre_cutoff = event` and no rescaling.
    pub fn new(treated: impl Into<String>, donors: Vec<String>, event: Period) -> Result<Self> {
        let treated = treated.into();
        if donors.iter().any(|d| *d == treated) {
            return Err(Error::Validation(format!(
                "treated unit '{treated}' cannot be its own donor"
            )));
        }
        let distinct: BTreeSet<&String> = donors.iter().collect();
        if distinct.len() != donors.len() {
            return Err(Error::Validation("donor list contains duplicates".into()));
        }
        Ok(Self { treated, donors, pre_cutoff: event, event, rescale: false })
    }

    /// Every unit of `wide` except `treated`.
    pub fn all_donors(wide: &WideSlice, treated: &str) -> Vec<String> {
        wide.units().iter().filter(|u| *u != treated).cloned().collect()
    }

    /// Same design, different fitting cutoff.
    pub fn with_pre_cutoff(&self, pre_cutoff: Period) -> Self {
        Self { pre_cutoff, ..self.clone() }
    }

    /// Same design, different event date (post mask).
    pub fn with_event(&self, event: Period) -> Self {
        Self { event, ..self.clone() }
    }

    /// Same design, rescaling switched on or off.
    pub fn with_rescale(&self, rescale: bool) -> Self {
        Self { rescale, ..self.clone() }
    }

    /// Same dates, different donor pool.
    pub fn with_donors(&self, donors: Vec<String>) -> Result<Self> {
        let mut d = Self::new(self.treated.clone(), donors, self.event)?;
        d.pre_cutoff = self.pre_cutoff;
        d.rescale = self.rescale;
        Ok(d)
    }

    /// Placebo design: `unit` plays the treated role against the remaining
    /// donors. The real treated unit is never in a placebo donor pool.
    pub fn with_treated(&self, unit: &str) -> Self {
        let donors = self.donors.iter().filter(|d| *d != unit).cloned().collect();
        Self { treated: unit.to_string(), donors, ..self.clone() }
    }
}

/// Donor weight table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DonorWeights {
    /// Donor identifiers.
    pub units: Vec<String>,
    /// One non-negative weight per donor, summing to 1.
    pub weights: Vec<f64>,
}

impl DonorWeights {
    /// Weight of `unit`, if it is a donor.
    pub fn get(&self, unit: &str) -> Option<f64> {
        self.units.iter().position(|u| u == unit).map(|j| self.weights[j])
    }

    /// `(unit, weight)` pairs in donor order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.units.iter().map(String::as_str).zip(self.weights.iter().copied())
    }

    /// Donors with weight above `tol`, heaviest first.
    pub fn nonzero(&self, tol: f64) -> Vec<(&str, f64)> {
        let mut v: Vec<(&str, f64)> = self.iter().filter(|(_, w)| *w > tol).collect();
        v.sort_by(|a, b| b.1.total_cmp(&a.1));
        v
    }
}

/// Output of one synthetic control fit.
#[derive(Debug, Clone, Serialize)]
pub struct ScmFit {
    /// Treated unit of this fit.
    pub treated: String,
    /// Donor weights.
    pub weights: DonorWeights,
    /// Row labels for all series below.
    pub periods: Vec<Period>,
    /// Treated outcome.
    pub treated_series: Vec<f64>,
    /// Weighted donor combination before rescaling.
    pub raw_synthetic: Vec<f64>,
    /// Counterfactual used for the gap (rescaled when the design asks for it).
    pub synthetic: Vec<f64>,
    /// Rescale scalar, `None` when the design does not rescale.
    pub rescale_scalar: Option<f64>,
    /// Pre-cutoff mean of the raw synthetic series (the rescale divisor).
    pub raw_pre_mean: f64,
    /// Treated minus synthetic.
    pub gap: Vec<f64>,
    /// ATT and fit diagnostics.
    pub effect: AttResult,
    /// Number of periods the weights were fitted on.
    pub n_fit_periods: usize,
}

impl ScmFit {
    /// Error out when the rescale step produced an undefined series.
    pub fn require_defined(self) -> Result<Self> {
        match self.rescale_scalar {
            Some(s) if !s.is_finite() => {
                Err(Error::UndefinedRescale { series_mean: self.raw_pre_mean })
            }
            _ => Ok(self),
        }
    }
}

/// Fitting data for one window: target and donor columns restricted to rows
/// where every involved series is defined.
#[derive(Debug, Clone)]
pub struct FitWindow {
    /// Treated outcome on usable rows.
    pub target: Vec<f64>,
    /// Donor columns on usable rows.
    pub donors: Vec<Vec<f64>>,
}

impl FitWindow {
    /// Extract the usable rows of `window` for `design`.
    pub fn extract(window: &WideSlice, design: &RunDesign) -> Result<Self> {
        let mut involved = Vec::with_capacity(design.donors.len() + 1);
        involved.push(design.treated.clone());
        involved.extend(design.donors.iter().cloned());
        let usable = window.complete_rows(&involved)?;

        let keep = |col: &[f64]| -> Vec<f64> {
            col.iter().zip(&usable).filter(|&(_, &u)| u).map(|(v, _)| *v).collect()
        };
        let target = keep(window.require_column(&design.treated)?);
        let donors = design
            .donors
            .iter()
            .map(|d| window.require_column(d).map(keep))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { target, donors })
    }

    /// Usable row count.
    pub fn len(&self) -> usize {
        self.target.len()
    }

    /// No usable rows.
    pub fn is_empty(&self) -> bool {
        self.target.is_empty()
    }
}

/// Synthetic control estimator over a pluggable weight solver.
#[derive(Debug, Clone, Default)]
pub struct SyntheticControl<S: WeightSolver = ActiveSetSolver> {
    solver: S,
}

impl<S: WeightSolver> SyntheticControl<S> {
    /// Estimator using `solver` for donor weights.
    pub fn new(solver: S) -> Self {
        Self { solver }
    }

    /// The weight solver.
    pub fn solver(&self) -> &S {
        &self.solver
    }

    /// Fit `design` on `wide`.
    pub fn estimate(&self, wide: &WideSlice, design: &RunDesign) -> Result<ScmFit> {
        let window = wide.before(design.pre_cutoff);
        self.estimate_in_window(wide, &window, design)
    }

    /// Fit with a pre-built fitting slice; `window` must be `wide.before(design.pre_cutoff)`.
    ///
    /// Loops that fit many designs against one cutoff build the window once.
    pub fn estimate_in_window(
        &self,
        wide: &WideSlice,
        window: &WideSlice,
        design: &RunDesign,
    ) -> Result<ScmFit> {
        let fit = FitWindow::extract(window, design)?;
        let weights = self.solver.solve(&fit.target, &fit.donors)?;

        let treated_series = wide.require_column(&design.treated)?.to_vec();
        let donor_slice = wide.select(&design.donors)?;
        let raw = synthetic::build(&weights, &donor_slice)?;

        let pre_mask = wide.mask_before(design.pre_cutoff);
        let raw_pre_mean = synthetic::masked_mean(&raw.values, &pre_mask);
        let (synthetic, rescale_scalar) = if design.rescale {
            let r = synthetic::rescale(&raw.values, &treated_series, &pre_mask)?;
            (r.values, Some(r.scalar))
        } else {
            (raw.values.clone(), None)
        };

        let gap = estimator::gap(&treated_series, &synthetic)?;
        let effect = estimator::att(&gap, &wide.mask_from(design.event))?;

        Ok(ScmFit {
            treated: design.treated.clone(),
            weights: DonorWeights { units: design.donors.clone(), weights },
            periods: wide.periods().to_vec(),
            treated_series,
            raw_synthetic: raw.values,
            synthetic,
            rescale_scalar,
            raw_pre_mean,
            gap,
            effect,
            n_fit_periods: fit.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Period {
        s.parse().unwrap()
    }

    fn wide() -> WideSlice {
        let start = p("2020-01");
        let periods: Vec<Period> = (0..12).map(|k| start.add_months(k)).collect();
        let a: Vec<f64> = (0..12).map(|i| 10.0 + i as f64).collect();
        let b: Vec<f64> = (0..12).map(|i| 20.0 - 0.5 * i as f64).collect();
        let c: Vec<f64> = (0..12).map(|i| 5.0 + (i as f64).sin()).collect();
        // Treated follows A until the event, then jumps by +4.
        let t: Vec<f64> = (0..12).map(|i| a[i] + if i >= 8 { 4.0 } else { 0.0 }).collect();
        WideSlice::from_columns(
            periods,
            vec!["A".into(), "B".into(), "C".into(), "T".into()],
            vec![a, b, c, t],
        )
        .unwrap()
    }

    #[test]
    fn design_derivations_do_not_leak() {
        let w = wide();
        let donors = RunDesign::all_donors(&w, "T");
        assert_eq!(donors, vec!["A", "B", "C"]);
        let d = RunDesign::new("T", donors, p("2020-09")).unwrap();
        let placebo = d.with_treated("B");
        assert_eq!(placebo.treated, "B");
        assert_eq!(placebo.donors, vec!["A", "C"]);
        assert_eq!(d.donors.len(), 3);
        assert!(RunDesign::new("T", vec!["T".into()], p("2020-09")).is_err());
        assert!(RunDesign::new("T", vec!["A".into(), "A".into()], p("2020-09")).is_err());
    }

    #[test]
    fn estimate_recovers_step_effect() {
        let w = wide();
        let d = RunDesign::new("T", RunDesign::all_donors(&w, "T"), p("2020-09")).unwrap();
        let fit = SyntheticControl::<ActiveSetSolver>::default().estimate(&w, &d).unwrap();
        assert!((fit.weights.get("A").unwrap() - 1.0).abs() < 1e-6, "{:?}", fit.weights);
        assert_eq!(fit.n_fit_periods, 8);
        assert!(fit.effect.mspe_pre < 1e-10);
        assert!((fit.effect.att - 4.0).abs() < 1e-5, "att={}", fit.effect.att);
        assert!(fit.rescale_scalar.is_none());
        assert_eq!(fit.weights.nonzero(1e-6).len(), 1);
    }

    #[test]
    fn rescaled_fit_matches_pre_mean() {
        let w = wide();
        let d = RunDesign::new("T", vec!["B".into(), "C".into()], p("2020-09"))
            .unwrap()
            .with_rescale(true);
        let fit = SyntheticControl::<ActiveSetSolver>::default().estimate(&w, &d).unwrap();
        let pre = w.mask_before(p("2020-09"));
        let m_syn = synthetic::masked_mean(&fit.synthetic, &pre);
        let m_trt = synthetic::masked_mean(&fit.treated_series, &pre);
        assert!((m_syn - m_trt).abs() < 1e-9);
        assert!(fit.rescale_scalar.unwrap().is_finite());
        let fit = fit.require_defined().unwrap();
        assert!(fit.effect.att.is_finite());
    }

    #[test]
    fn empty_donor_pool_is_infeasible() {
        let w = wide();
        let d = RunDesign::new("T", vec!["A".into()], p("2020-09")).unwrap().with_treated("A");
        assert!(d.donors.is_empty());
        let err = SyntheticControl::<ActiveSetSolver>::default().estimate(&w, &d).unwrap_err();
        assert!(matches!(err, Error::InfeasibleWeights(_)));
    }

    #[test]
    fn unknown_unit_is_validation_error() {
        let w = wide();
        let d = RunDesign::new("Z", vec!["A".into()], p("2020-09")).unwrap();
        let err = SyntheticControl::<ActiveSetSolver>::default().estimate(&w, &d).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}

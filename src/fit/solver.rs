//! Bounded fitting of the spectrum model to a histogram.
//!
//! The staged fit talks to its solver through the `Minimizer` trait. Both
//! bundled solvers minimize the same statistic, written as a sum of squared
//! residuals so that Levenberg–Marquardt applies to either choice:
//!
//! - Poisson deviance: `r_i = sign(y_i - m_i)·sqrt(2(m_i - y_i + y_i ln(y_i/m_i)))`,
//!   every bin enters, empty bins contribute `2 m_i`
//! - χ²: `r_i = (y_i - m_i) / σ_i`, bins with `σ_i <= 0` are skipped
//!
//! `LevenbergMarquardt` is a projected method over the free parameters:
//!
//! - forward-difference Jacobian (columns in parallel)
//! - parameters on a bound whose gradient points outward leave the active set,
//!   as do parameters the data does not constrain (zero Jacobian column)
//! - converged once the estimated distance to the minimum `gᵀ(JᵀJ)⁻¹g` drops
//!   below `edm_tolerance`, or the step becomes negligible
//! - damped normal equations with Marquardt diagonal scaling, every trial point
//!   clamped into the box `[lower, upper]`
//!
//! Running out of damping (no trial point improves the statistic) and reaching
//! the iteration cap are both reported as non-convergence.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::data::Bin;
use crate::domain::{Bound, FitStatistic};
use crate::error::FitError;
use crate::math::{solve_symmetric, symmetric_inverse};
use crate::models::ModelFunction;

/// One bounded fitting problem.
pub struct FitProblem<'a> {
    pub model: &'a dyn ModelFunction,
    pub bins: &'a [Bin],
    pub start: Vec<f64>,
    pub bounds: Vec<Bound>,
    pub fixed: Vec<bool>,
}

impl FitProblem<'_> {
    fn is_free(&self, i: usize) -> bool {
        !self.fixed[i] && self.bounds[i].upper > self.bounds[i].lower
    }

    fn check_sizes(&self) -> Result<(), FitError> {
        let n = self.start.len();
        if self.bounds.len() != n || self.fixed.len() != n || n < self.model.param_count() {
            return Err(FitError::invalid(
                "problem",
                format!(
                    "inconsistent sizes: start={n} bounds={} fixed={} model={}",
                    self.bounds.len(),
                    self.fixed.len(),
                    self.model.param_count()
                ),
            ));
        }
        Ok(())
    }

    /// Free parameter positions and the start point clamped into the box.
    pub(crate) fn free_start(&self) -> (Vec<usize>, Vec<f64>) {
        let free: Vec<usize> = (0..self.start.len()).filter(|&i| self.is_free(i)).collect();
        let mut p = self.start.clone();
        for &i in &free {
            p[i] = p[i].clamp(self.bounds[i].lower, self.bounds[i].upper);
        }
        (free, p)
    }
}

/// What a minimizer reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverOutcome {
    pub parameters: Vec<f64>,
    /// `sqrt(diag((JᵀJ)⁻¹))` for free parameters, 0 for fixed ones.
    pub uncertainties: Vec<f64>,
    /// Minimized statistic (Poisson deviance or χ²).
    pub chi2: f64,
    pub ndf: usize,
    pub bins_used: usize,
    pub free_parameters: usize,
    pub iterations: usize,
    pub converged: bool,
    pub message: String,
}

/// Solver seam used by the staged fit.
pub trait Minimizer: Send + Sync {
    fn minimize(&self, problem: &FitProblem<'_>) -> Result<SolverOutcome, FitError>;
}

/// Projected Levenberg–Marquardt solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevenbergMarquardt {
    pub max_iterations: usize,
    pub statistic: FitStatistic,
    /// Converged when `gᵀ(JᵀJ)⁻¹g` falls to this value.
    pub edm_tolerance: f64,
    pub xtol: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            statistic: FitStatistic::Poisson,
            edm_tolerance: 1e-6,
            xtol: 1e-10,
        }
    }
}

const INITIAL_DAMPING: f64 = 1e-3;
const MIN_DAMPING: f64 = 1e-15;
const MAX_DAMPING: f64 = 1e16;
/// Smallest model value entering the deviance.
const MODEL_FLOOR: f64 = 1e-9;

/// Bins and model entering the statistic.
pub(crate) struct Objective<'a> {
    bins: Vec<Bin>,
    model: &'a dyn ModelFunction,
    statistic: FitStatistic,
}

impl<'a> Objective<'a> {
    pub(crate) fn new(problem: &FitProblem<'a>, statistic: FitStatistic) -> Result<Self, FitError> {
        problem.check_sizes()?;
        let bins: Vec<Bin> = match statistic {
            FitStatistic::Poisson => problem.bins.to_vec(),
            FitStatistic::Chi2 => problem.bins.iter().filter(|b| b.uncertainty > 0.0).copied().collect(),
        };
        if bins.is_empty() {
            return Err(FitError::DegenerateHistogram(match statistic {
                FitStatistic::Poisson => "no bins in the fit range".to_string(),
                FitStatistic::Chi2 => "no bins with positive uncertainty in the fit range".to_string(),
            }));
        }
        Ok(Self {
            bins,
            model: problem.model,
            statistic,
        })
    }

    pub(crate) fn bins_used(&self) -> usize {
        self.bins.len()
    }

    pub(crate) fn residuals(&self, p: &[f64]) -> Result<DVector<f64>, FitError> {
        let predicted = self.model.evaluate_bins(&self.bins, p)?;
        let residual = |b: &Bin, m: f64| match self.statistic {
            FitStatistic::Chi2 => (b.content - m) / b.uncertainty,
            FitStatistic::Poisson => {
                let m = m.max(MODEL_FLOOR);
                let y = b.content;
                let d = if y > 0.0 { 2.0 * (m - y + y * (y / m).ln()) } else { 2.0 * m };
                d.max(0.0).sqrt().copysign(y - m)
            }
        };
        Ok(DVector::from_iterator(
            self.bins.len(),
            self.bins.iter().zip(predicted).map(|(b, m)| residual(b, m)),
        ))
    }

    /// Statistic value at `p`.
    pub(crate) fn value(&self, p: &[f64]) -> Result<f64, FitError> {
        Ok(self.residuals(p)?.norm_squared())
    }

    pub(crate) fn jacobian(
        &self,
        p: &[f64],
        r: &DVector<f64>,
        free: &[usize],
        bounds: &[Bound],
    ) -> Result<DMatrix<f64>, FitError> {
        let columns = free
            .par_iter()
            .map(|&i| -> Result<DVector<f64>, FitError> {
                let mut h = 1e-6 * p[i].abs().max(1e-3);
                if p[i] + h > bounds[i].upper {
                    h = -h;
                }
                let mut q = p.to_vec();
                q[i] += h;
                let rq = self.residuals(&q)?;
                Ok((rq - r) / h)
            })
            .collect::<Result<Vec<DVector<f64>>, FitError>>()?;
        Ok(DMatrix::from_columns(&columns))
    }

    /// Package a terminal point as a `SolverOutcome`.
    pub(crate) fn outcome(
        &self,
        p: Vec<f64>,
        free: &[usize],
        bounds: &[Bound],
        iterations: usize,
        converged: bool,
        message: &str,
    ) -> Result<SolverOutcome, FitError> {
        let chi2 = self.value(&p)?;
        let uncertainties = self.uncertainties(&p, free, bounds)?;
        debug!(iterations, chi2, converged, reason = message, "solver finished");
        Ok(SolverOutcome {
            parameters: p,
            uncertainties,
            chi2,
            ndf: self.bins.len().saturating_sub(free.len()),
            bins_used: self.bins.len(),
            free_parameters: free.len(),
            iterations,
            converged,
            message: message.to_string(),
        })
    }

    fn uncertainties(&self, p: &[f64], free: &[usize], bounds: &[Bound]) -> Result<Vec<f64>, FitError> {
        let mut out = vec![0.0; p.len()];
        if free.is_empty() {
            return Ok(out);
        }
        let r = self.residuals(p)?;
        let j = self.jacobian(p, &r, free, bounds)?;
        if let Some(cov) = symmetric_inverse(&j.tr_mul(&j)) {
            for (k, &i) in free.iter().enumerate() {
                out[i] = cov[(k, k)].max(0.0).sqrt();
            }
        } else {
            for &i in free {
                out[i] = f64::INFINITY;
            }
        }
        Ok(out)
    }
}

impl Minimizer for LevenbergMarquardt {
    fn minimize(&self, problem: &FitProblem<'_>) -> Result<SolverOutcome, FitError> {
        let data = Objective::new(problem, self.statistic)?;
        let bounds = &problem.bounds;
        let (free, mut p) = problem.free_start();

        let mut r = data.residuals(&p)?;
        let mut chi2 = r.norm_squared();
        if !chi2.is_finite() {
            return Err(FitError::NumericOverflow { x: f64::NAN });
        }

        if free.is_empty() {
            return data.outcome(p, &free, bounds, 0, true, "no free parameters");
        }

        let mut mu = INITIAL_DAMPING;
        let mut iterations = 0;
        while iterations < self.max_iterations {
            iterations += 1;
            let j_all = data.jacobian(&p, &r, &free, bounds)?;
            let g_all = j_all.tr_mul(&r);

            let active: Vec<usize> = (0..free.len())
                .filter(|&k| {
                    let i = free[k];
                    let outward = (p[i] <= bounds[i].lower && g_all[k] > 0.0)
                        || (p[i] >= bounds[i].upper && g_all[k] < 0.0);
                    let unconstrained = j_all.column(k).iter().all(|&v| v == 0.0);
                    !(outward || unconstrained)
                })
                .collect();
            if active.is_empty() {
                return data.outcome(p, &free, bounds, iterations, true, "every free parameter is stationary");
            }

            let j = j_all.select_columns(&active);
            let g = j.tr_mul(&r);
            let a = j.tr_mul(&j);
            let edm = solve_symmetric(&a, &g).map_or(f64::INFINITY, |x| g.dot(&x));
            if edm <= self.edm_tolerance {
                let reason = "estimated distance to minimum below tolerance";
                return data.outcome(p, &free, bounds, iterations, true, reason);
            }

            let diag_max = (0..active.len()).map(|k| a[(k, k)]).fold(0.0, f64::max);
            loop {
                let mut damped = a.clone();
                for k in 0..active.len() {
                    damped[(k, k)] += mu * a[(k, k)].max(1e-12 * diag_max);
                }

                if let Some(delta) = solve_symmetric(&damped, &(-&g)) {
                    let mut q = p.clone();
                    for (k, &kk) in active.iter().enumerate() {
                        let i = free[kk];
                        q[i] = (p[i] + delta[k]).clamp(bounds[i].lower, bounds[i].upper);
                    }
                    let step_norm = free.iter().map(|&i| (q[i] - p[i]).powi(2)).sum::<f64>().sqrt();
                    let p_norm = free.iter().map(|&i| p[i].powi(2)).sum::<f64>().sqrt();
                    if step_norm <= self.xtol * (p_norm + self.xtol) {
                        return data.outcome(p, &free, bounds, iterations, true, "step below tolerance");
                    }

                    let trial = match data.residuals(&q) {
                        Ok(rq) => Some(rq),
                        Err(FitError::NumericOverflow { .. }) => None,
                        Err(e) => return Err(e),
                    };
                    if let Some(rq) = trial {
                        let chi2_trial = rq.norm_squared();
                        if chi2_trial.is_finite() && chi2_trial < chi2 {
                            p = q;
                            r = rq;
                            chi2 = chi2_trial;
                            mu = (mu / 10.0).max(MIN_DAMPING);
                            trace!(iterations, chi2, mu, edm, "step accepted");
                            break;
                        }
                    }
                }

                mu *= 10.0;
                if mu > MAX_DAMPING {
                    return data.outcome(p, &free, bounds, iterations, false, "damping limit reached");
                }
            }
        }

        data.outcome(p, &free, bounds, iterations, false, "iteration cap reached")
    }
}

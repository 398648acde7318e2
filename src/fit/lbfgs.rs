//! L-BFGS with box constraints, on top of argmin.
//!
//! The statistic is minimized over the free parameters only. Bounds are
//! enforced by clamping every point argmin asks about, and gradient components
//! that push a clamped parameter further outward are zeroed so the line search
//! does not wander into the flat region beyond a bound.

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use rayon::prelude::*;

use crate::domain::{Bound, FitStatistic};
use crate::error::FitError;
use crate::fit::solver::{FitProblem, Minimizer, Objective, SolverOutcome};

/// Quasi-Newton alternative to `LevenbergMarquardt`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lbfgs {
    pub max_iterations: usize,
    pub statistic: FitStatistic,
    /// Gradient-norm tolerance; the cost tolerance is a tenth of it.
    pub tolerance: f64,
    /// Number of correction pairs kept for the inverse Hessian.
    pub memory: usize,
}

impl Default for Lbfgs {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            statistic: FitStatistic::Poisson,
            tolerance: 1e-6,
            memory: 10,
        }
    }
}

/// Statistic restricted to the free parameters.
struct Reduced<'a> {
    objective: &'a Objective<'a>,
    base: &'a [f64],
    free: &'a [usize],
    bounds: &'a [Bound],
}

impl Reduced<'_> {
    fn eval(&self, x: &[f64]) -> Result<f64, FitError> {
        match self.objective.value(&expand(self.base, self.free, self.bounds, x)) {
            Err(FitError::NumericOverflow { .. }) => Ok(f64::INFINITY),
            other => other,
        }
    }
}

fn expand(base: &[f64], free: &[usize], bounds: &[Bound], x: &[f64]) -> Vec<f64> {
    let mut p = base.to_vec();
    for (&i, &v) in free.iter().zip(x) {
        p[i] = v.clamp(bounds[i].lower, bounds[i].upper);
    }
    p
}

fn to_argmin(e: FitError) -> argmin::core::Error {
    argmin::core::Error::msg(e.to_string())
}

impl CostFunction for Reduced<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        self.eval(x).map_err(to_argmin)
    }
}

impl Gradient for Reduced<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, x: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        let mut g = (0..x.len())
            .into_par_iter()
            .map(|k| -> Result<f64, FitError> {
                let h = 1e-8 * x[k].abs().max(1.0);
                let mut plus = x.clone();
                plus[k] += h;
                let mut minus = x.clone();
                minus[k] -= h;
                Ok((self.eval(&plus)? - self.eval(&minus)?) / (2.0 * h))
            })
            .collect::<Result<Vec<f64>, FitError>>()
            .map_err(to_argmin)?;

        const EPS: f64 = 1e-12;
        for (k, &i) in self.free.iter().enumerate() {
            let v = x[k].clamp(self.bounds[i].lower, self.bounds[i].upper);
            if (v <= self.bounds[i].lower + EPS && g[k] > 0.0) || (v >= self.bounds[i].upper - EPS && g[k] < 0.0) {
                g[k] = 0.0;
            }
        }
        Ok(g)
    }
}

impl Minimizer for Lbfgs {
    fn minimize(&self, problem: &FitProblem<'_>) -> Result<SolverOutcome, FitError> {
        let data = Objective::new(problem, self.statistic)?;
        let bounds = &problem.bounds;
        let (free, start) = problem.free_start();
        if !data.value(&start)?.is_finite() {
            return Err(FitError::NumericOverflow { x: f64::NAN });
        }
        if free.is_empty() {
            return data.outcome(start, &free, bounds, 0, true, "no free parameters");
        }

        let x0: Vec<f64> = free.iter().map(|&i| start[i]).collect();
        let reduced = Reduced {
            objective: &data,
            base: &start,
            free: &free,
            bounds,
        };
        let config = |e: argmin::core::Error| FitError::invalid("solver", e.to_string());
        let solver = LBFGS::new(MoreThuenteLineSearch::new(), self.memory)
            .with_tolerance_grad(self.tolerance)
            .map_err(config)?
            .with_tolerance_cost((0.1 * self.tolerance).max(1e-12))
            .map_err(config)?;

        let run = Executor::new(reduced, solver)
            .configure(|state| state.param(x0.clone()).max_iters(self.max_iterations as u64))
            .run();
        let res = match run {
            Ok(res) => res,
            Err(e) => return data.outcome(start.clone(), &free, bounds, 0, false, &e.to_string()),
        };

        let state = res.state();
        let best = state.get_best_param().unwrap_or(&x0);
        let p = expand(&start, &free, bounds, best);
        let termination = state.get_termination_status();
        let converged = matches!(
            termination,
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
                | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
        );
        data.outcome(
            p,
            &free,
            bounds,
            state.get_iter() as usize,
            converged,
            &termination.to_string(),
        )
    }
}

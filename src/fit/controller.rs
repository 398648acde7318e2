//! Staged fit of one channel.
//!
//! The controller walks a protocol (an ordered list of `FitStageSpec`). Every
//! stage builds a fresh `SpectrumModel`, derives bounds from the parameters the
//! previous stage left behind, and hands a `FitProblem` to the `Minimizer`.
//! Its result seeds the next stage; the terminal stage yields the calibration.
//!
//! Checks happen before any solver call:
//!
//! 1. seed domain, peak count, limits and protocol (`InvalidParameter`)
//! 2. histogram content (`DegenerateHistogram`)
//!
//! A failing stage aborts the rest with `SolverNonConvergence`. A stage fails
//! when the solver does not converge, when its result leaves the physical
//! domain, or (for `reject_pinned` stages) when a parameter ends on a bound.

use tracing::{debug, info, warn};

use crate::data::BinnedHistogram;
use crate::domain::{
    BinEvaluation, Bound, Calibration, ConvergenceStatus, ModelParameters, ParamIndex, ParameterLimits, StageReport,
};
use crate::error::FitError;
use crate::fit::solver::{FitProblem, LevenbergMarquardt, Minimizer, SolverOutcome};
use crate::fit::stages::{FitStageSpec, default_protocol, validate_protocol};
use crate::models::{DEFAULT_NEIGHBORS, MAX_ORDER, SpectrumModel};

/// Relative tolerance for "on a bound".
const PIN_TOLERANCE: f64 = 1e-9;

/// Result of a complete staged fit.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedFit {
    pub parameters: ModelParameters,
    /// Uncertainties from the terminal stage (0 for parameters it kept fixed).
    pub uncertainties: Vec<f64>,
    pub stages: Vec<StageReport>,
    pub status: ConvergenceStatus,
    pub calibration: Calibration,
}

impl StagedFit {
    pub fn final_stage(&self) -> Option<&StageReport> {
        self.stages.last()
    }
}

/// Runs a protocol against one histogram.
pub struct StagedFitController<'a> {
    minimizer: &'a dyn Minimizer,
    protocol: Option<Vec<FitStageSpec>>,
    limits: ParameterLimits,
    neighbors: u32,
    bin_evaluation: BinEvaluation,
}

impl<'a> StagedFitController<'a> {
    /// Controller using the default protocol and limits.
    pub fn new(minimizer: &'a dyn Minimizer) -> Self {
        Self {
            minimizer,
            protocol: None,
            limits: ParameterLimits::default(),
            neighbors: DEFAULT_NEIGHBORS,
            bin_evaluation: BinEvaluation::Center,
        }
    }

    pub fn with_protocol(mut self, protocol: Vec<FitStageSpec>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_limits(mut self, limits: ParameterLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_neighbors(mut self, neighbors: u32) -> Self {
        self.neighbors = neighbors;
        self
    }

    pub fn with_bin_evaluation(mut self, mode: BinEvaluation) -> Self {
        self.bin_evaluation = mode;
        self
    }

    /// Fit `histogram` starting from `initial`.
    pub fn run(
        &self,
        histogram: &BinnedHistogram,
        initial: &ModelParameters,
        num_peaks: usize,
        enable_mip: bool,
    ) -> Result<StagedFit, FitError> {
        initial.validate()?;
        if initial.has_mip() != enable_mip {
            return Err(FitError::invalid(
                "parameters",
                format!(
                    "{} seed values do not match MIP modeling {}",
                    initial.len(),
                    if enable_mip { "on" } else { "off" }
                ),
            ));
        }
        if !(1..=MAX_ORDER).contains(&num_peaks) {
            return Err(FitError::invalid("num_peaks", format!("{num_peaks} outside 1..={MAX_ORDER}")));
        }
        self.limits.validate()?;
        let default;
        let protocol = match &self.protocol {
            Some(stages) => stages.as_slice(),
            None => {
                default = default_protocol(enable_mip);
                default.as_slice()
            }
        };
        validate_protocol(protocol, enable_mip)?;

        histogram.ensure_not_degenerate()?;

        let mut current = initial.to_vec();
        let mut reports = Vec::with_capacity(protocol.len());
        let mut last_uncertainties = vec![0.0; current.len()];

        for stage in protocol {
            let (report, outcome) = self.run_stage(stage, histogram, &current, num_peaks)?;
            current[..outcome.parameters.len()].copy_from_slice(&outcome.parameters);
            last_uncertainties = vec![0.0; current.len()];
            last_uncertainties[..outcome.uncertainties.len()].copy_from_slice(&outcome.uncertainties);
            reports.push(report);
        }

        let parameters = ModelParameters::new(current)?;
        parameters.validate()?;
        let calibration = Calibration::from_parameters(&parameters);
        info!(
            channel = %histogram.name,
            pedestal = calibration.pedestal,
            mean_pe = calibration.mean_pe,
            gain = calibration.gain,
            crosstalk = calibration.crosstalk,
            "staged fit finished"
        );
        Ok(StagedFit {
            parameters,
            uncertainties: last_uncertainties,
            stages: reports,
            status: ConvergenceStatus::Success,
            calibration,
        })
    }

    fn run_stage(
        &self,
        stage: &FitStageSpec,
        histogram: &BinnedHistogram,
        current: &[f64],
        num_peaks: usize,
    ) -> Result<(StageReport, SolverOutcome), FitError> {
        let n = stage.param_count();
        let peaks = stage.peaks.resolve(num_peaks);
        let model = SpectrumModel::new(peaks, stage.mip)?
            .with_neighbors(self.neighbors)
            .with_bin_evaluation(self.bin_evaluation);

        let (x_min, x_max) = stage.x_range(current[ParamIndex::Shift.index()]);
        let bins = histogram.select_range(x_min, x_max);
        if bins.is_empty() {
            return Err(non_convergence(stage, format!("no bins in [{x_min}, {x_max}]")));
        }

        let constraints = stage.constraints(current, &self.limits)?;
        let start = current[..n].to_vec();
        debug!(
            channel = %histogram.name,
            stage = %stage.name,
            x_min,
            x_max,
            bins = bins.len(),
            peaks,
            "stage starting"
        );

        let problem = FitProblem {
            model: &model,
            bins: &bins,
            start: start.clone(),
            bounds: constraints.bounds,
            fixed: constraints.fixed,
        };
        let outcome = self.minimizer.minimize(&problem).map_err(|e| match e {
            FitError::DegenerateHistogram(reason) => non_convergence(stage, reason),
            other => other,
        })?;

        if !outcome.converged {
            return Err(non_convergence(stage, outcome.message));
        }
        if outcome.parameters.len() != n || outcome.parameters.iter().any(|v| !v.is_finite()) {
            return Err(non_convergence(stage, "non-finite parameters".to_string()));
        }
        let mut candidate = current.to_vec();
        candidate[..n].copy_from_slice(&outcome.parameters);
        ModelParameters::new(candidate)?
            .validate()
            .map_err(|e| non_convergence(stage, format!("result outside the physical domain: {e}")))?;

        let pinned = pinned_parameters(&start, &outcome.parameters, &problem.bounds, &problem.fixed);
        if !pinned.is_empty() {
            if stage.reject_pinned {
                return Err(non_convergence(stage, format!("parameters pinned at a bound: {}", pinned.join(", "))));
            }
            warn!(channel = %histogram.name, stage = %stage.name, pinned = %pinned.join(","), "parameters ended on a bound");
        }

        info!(
            channel = %histogram.name,
            stage = %stage.name,
            chi2 = outcome.chi2,
            ndf = outcome.ndf,
            iterations = outcome.iterations,
            "stage converged"
        );

        let report = StageReport {
            name: stage.name.clone(),
            x_min,
            x_max,
            bins_used: outcome.bins_used,
            free_parameters: outcome.free_parameters,
            chi2: outcome.chi2,
            ndf: outcome.ndf,
            iterations: outcome.iterations,
            pinned,
            parameters: outcome.parameters.clone(),
        };
        Ok((report, outcome))
    }
}

fn non_convergence(stage: &FitStageSpec, reason: String) -> FitError {
    FitError::SolverNonConvergence {
        stage: stage.name.clone(),
        reason,
    }
}

/// Free parameters seeded strictly inside their bounds that ended on one.
fn pinned_parameters(start: &[f64], end: &[f64], bounds: &[Bound], fixed: &[bool]) -> Vec<String> {
    start
        .iter()
        .zip(end)
        .zip(bounds.iter().zip(fixed))
        .enumerate()
        .filter_map(|(i, ((&s, &e), (b, &is_fixed)))| {
            let span = b.upper - b.lower;
            if is_fixed || span <= 0.0 {
                return None;
            }
            let tol = PIN_TOLERANCE * span;
            let interior = s > b.lower + tol && s < b.upper - tol;
            let on_bound = e <= b.lower + tol || e >= b.upper - tol;
            (interior && on_bound).then(|| ParamIndex::from_index(i).map_or_else(|| format!("p{i}"), |p| p.name().to_string()))
        })
        .collect()
}

/// Fit with the default protocol, limits and solver.
pub fn run_staged_fit(
    histogram: &BinnedHistogram,
    initial: &ModelParameters,
    num_peaks: usize,
    enable_mip: bool,
) -> Result<StagedFit, FitError> {
    let solver = LevenbergMarquardt::default();
    StagedFitController::new(&solver).run(histogram, initial, num_peaks, enable_mip)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::data::Bin;
    use crate::fit::stages::{ParameterRule, PeakSelection, RangeEdge};

    const TRUTH: [f64; 10] = [5000.0, 8.0, 140.0, 0.0, 5.0, 5000.0, 0.15, 140.0, 15.0, 0.05];
    const MIP_TRUTH: [f64; 4] = [20_000.0, 1000.0, 30.0, 40.0];

    /// Noise-free histogram of the model itself, 1000 bins of width 2.
    fn synthetic(truth: &ModelParameters, num_peaks: usize) -> BinnedHistogram {
        let model = SpectrumModel::new(num_peaks, truth.has_mip()).unwrap();
        let bins = (0..1000)
            .map(|i| {
                let lower = 2.0 * i as f64;
                let v = model.evaluate(lower + 1.0, truth).unwrap();
                let sigma = if v > 1.0 { v.sqrt() } else { 1.0 };
                Bin::new(lower, 2.0, v, sigma)
            })
            .collect();
        BinnedHistogram::new("synthetic", bins).unwrap()
    }

    fn within(got: f64, want: f64, rel: f64) -> bool {
        (got - want).abs() <= rel * want.abs()
    }

    #[test]
    fn recovers_spectrum_calibration() {
        let truth = ModelParameters::new(TRUTH.to_vec()).unwrap();
        let h = synthetic(&truth, 3);
        let fit = run_staged_fit(&h, &ModelParameters::default_seed(false), 3, false).unwrap();

        assert_eq!(fit.status, ConvergenceStatus::Success);
        assert_eq!(fit.stages.len(), 5);
        let c = &fit.calibration;
        assert!(within(c.mean_pe, 0.15, 0.05), "mean_pe {}", c.mean_pe);
        assert!(within(c.gain, 140.0, 0.01), "gain {}", c.gain);
        assert!(within(c.crosstalk, 0.05, 0.05), "crosstalk {}", c.crosstalk);
        assert!(within(c.pedestal, 140.0, 0.01), "pedestal {}", c.pedestal);
        assert!(c.mip_mpv.is_none());
        assert_eq!(fit.uncertainties.len(), 10);
    }

    #[test]
    fn recovers_calibration_from_offset_seeds() {
        let truth = ModelParameters::new(TRUTH.to_vec()).unwrap();
        let h = synthetic(&truth, 3);
        let seeds = [
            (0.2, 145.0, 0.04, 5000.0),
            (0.12, 146.0, 0.055, 5000.0),
            (0.18, 142.0, 0.035, 5000.0),
            (0.2, 145.0, 0.04, 4000.0),
            (0.1, 130.0, 0.07, 6000.0),
            (0.25, 155.0, 0.03, 4500.0),
            (0.3, 120.0, 0.1, 3000.0),
        ];
        for (mean_pe, gain, crosstalk, pe_amp) in seeds {
            let mut seed = ModelParameters::default_seed(false);
            seed.set(ParamIndex::MeanPe, mean_pe);
            seed.set(ParamIndex::Gain, gain);
            seed.set(ParamIndex::Crosstalk, crosstalk);
            seed.set(ParamIndex::PeAmplitude, pe_amp);
            let label = format!("seed λ={mean_pe} gain={gain} ct={crosstalk} A={pe_amp}");

            let fit = run_staged_fit(&h, &seed, 3, false).unwrap_or_else(|e| panic!("{label}: {e}"));
            let c = &fit.calibration;
            assert!(within(c.mean_pe, 0.15, 0.05), "{label}: mean_pe {}", c.mean_pe);
            assert!(within(c.gain, 140.0, 0.01), "{label}: gain {}", c.gain);
            assert!(within(c.crosstalk, 0.05, 0.05), "{label}: crosstalk {}", c.crosstalk);
            assert!(within(c.pedestal, 140.0, 0.01), "{label}: pedestal {}", c.pedestal);
            let pe_amp = fit.parameters.get(ParamIndex::PeAmplitude).unwrap();
            assert!(within(pe_amp, 5000.0, 0.05), "{label}: pe_amp {pe_amp}");
        }
    }

    #[test]
    fn lbfgs_solver_fits_the_pedestal_stage() {
        let truth = ModelParameters::new(TRUTH.to_vec()).unwrap();
        let h = synthetic(&truth, 3);
        let mut seed = ModelParameters::default_seed(false);
        seed.set(ParamIndex::Shift, 137.0);
        seed.set(ParamIndex::PedestalWidth, 6.5);
        let solver = crate::fit::Lbfgs::default();
        let fit = StagedFitController::new(&solver)
            .with_protocol(vec![default_protocol(false)[1].clone()])
            .run(&h, &seed, 3, false)
            .unwrap();
        assert!(within(fit.calibration.pedestal, 140.0, 0.005), "pedestal {}", fit.calibration.pedestal);
        let width = fit.parameters.get(ParamIndex::PedestalWidth).unwrap();
        assert!(within(width, 8.0, 0.05), "width {width}");
    }

    /// Counts calls and returns the start point unchanged.
    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl Minimizer for Counting {
        fn minimize(&self, problem: &FitProblem<'_>) -> Result<SolverOutcome, FitError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(echo(problem, true))
        }
    }

    fn echo(problem: &FitProblem<'_>, converged: bool) -> SolverOutcome {
        SolverOutcome {
            parameters: problem.start.clone(),
            uncertainties: vec![0.0; problem.start.len()],
            chi2: 1.0,
            ndf: problem.bins.len(),
            bins_used: problem.bins.len(),
            free_parameters: problem.fixed.iter().filter(|f| !**f).count(),
            iterations: 1,
            converged,
            message: if converged { "ok" } else { "iteration cap reached" }.to_string(),
        }
    }

    #[test]
    fn zero_histogram_never_reaches_solver() {
        let h = BinnedHistogram::uniform("zeros", 1000, 0.0, 2000.0).unwrap();
        let solver = Counting::default();
        let err = StagedFitController::new(&solver)
            .run(&h, &ModelParameters::default_seed(false), 3, false)
            .unwrap_err();
        assert!(matches!(err, FitError::DegenerateHistogram(_)));
        assert_eq!(solver.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn invalid_seed_is_rejected_first() {
        let h = BinnedHistogram::uniform("zeros", 10, 0.0, 20.0).unwrap();
        let solver = Counting::default();
        let mut seed = ModelParameters::default_seed(false);
        seed.set(ParamIndex::Crosstalk, 1.5);
        let err = StagedFitController::new(&solver).run(&h, &seed, 3, false).unwrap_err();
        assert!(matches!(err, FitError::InvalidParameter { .. }));

        let seed = ModelParameters::default_seed(false);
        let err = StagedFitController::new(&solver).run(&h, &seed, 16, false).unwrap_err();
        assert!(matches!(err, FitError::InvalidParameter { .. }));
        let err = StagedFitController::new(&solver).run(&h, &seed, 3, true).unwrap_err();
        assert!(matches!(err, FitError::InvalidParameter { .. }));
        assert_eq!(solver.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn echo_solver_walks_every_stage() {
        let truth = ModelParameters::new(TRUTH.to_vec()).unwrap();
        let h = synthetic(&truth, 3);
        let solver = Counting::default();
        let fit = StagedFitController::new(&solver)
            .run(&h, &ModelParameters::default_seed(false), 3, false)
            .unwrap();
        assert_eq!(solver.calls.load(Ordering::SeqCst), 5);
        assert_eq!(fit.parameters, ModelParameters::default_seed(false));
        let ped = &fit.stages[1];
        assert_eq!((ped.x_min, ped.x_max), (130.0, 160.0));
        assert_eq!(ped.bins_used, 15);
    }

    struct NeverConverges;

    impl Minimizer for NeverConverges {
        fn minimize(&self, problem: &FitProblem<'_>) -> Result<SolverOutcome, FitError> {
            Ok(echo(problem, false))
        }
    }

    #[test]
    fn non_convergence_aborts_remaining_stages() {
        let truth = ModelParameters::new(TRUTH.to_vec()).unwrap();
        let h = synthetic(&truth, 3);
        let err = StagedFitController::new(&NeverConverges)
            .run(&h, &ModelParameters::default_seed(false), 3, false)
            .unwrap_err();
        match err {
            FitError::SolverNonConvergence { stage, reason } => {
                assert_eq!(stage, "background");
                assert!(reason.contains("iteration cap"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    /// Moves every free parameter to its upper bound.
    struct ToUpperBound;

    impl Minimizer for ToUpperBound {
        fn minimize(&self, problem: &FitProblem<'_>) -> Result<SolverOutcome, FitError> {
            let mut out = echo(problem, true);
            for (i, b) in problem.bounds.iter().enumerate() {
                if !problem.fixed[i] {
                    out.parameters[i] = b.upper;
                }
            }
            Ok(out)
        }
    }

    fn single_stage(reject_pinned: bool) -> Vec<FitStageSpec> {
        vec![FitStageSpec {
            name: "gain_only".to_string(),
            x_min: RangeEdge::Shift(0.0),
            x_max: RangeEdge::Absolute(450.0),
            peaks: PeakSelection::Configured,
            mip: false,
            reject_pinned,
            rules: [(ParamIndex::Gain, ParameterRule::Relative { lower: 0.9, upper: 1.1 })].into_iter().collect(),
        }]
    }

    #[test]
    fn pinned_parameter_is_reported() {
        let truth = ModelParameters::new(TRUTH.to_vec()).unwrap();
        let h = synthetic(&truth, 3);
        let fit = StagedFitController::new(&ToUpperBound)
            .with_protocol(single_stage(false))
            .run(&h, &ModelParameters::default_seed(false), 3, false)
            .unwrap();
        assert_eq!(fit.status, ConvergenceStatus::Success);
        assert_eq!(fit.stages[0].pinned, vec!["gain".to_string()]);
        assert!((fit.calibration.gain - 154.0).abs() < 1e-9);
    }

    #[test]
    fn pinned_parameter_fails_rejecting_stage() {
        let truth = ModelParameters::new(TRUTH.to_vec()).unwrap();
        let h = synthetic(&truth, 3);
        let err = StagedFitController::new(&ToUpperBound)
            .with_protocol(single_stage(true))
            .run(&h, &ModelParameters::default_seed(false), 3, false)
            .unwrap_err();
        assert!(matches!(err, FitError::SolverNonConvergence { ref stage, .. } if stage == "gain_only"));
    }

    #[test]
    fn limits_outside_the_domain_never_reach_the_solver() {
        let truth = ModelParameters::new(TRUTH.to_vec()).unwrap();
        let h = synthetic(&truth, 3);
        let mut limits = ParameterLimits::default();
        limits.bounds[ParamIndex::Crosstalk.index()] = Bound::new(0.0, 1.5);
        let solver = Counting::default();
        let err = StagedFitController::new(&solver)
            .with_limits(limits)
            .run(&h, &ModelParameters::default_seed(false), 3, false)
            .unwrap_err();
        assert!(matches!(err, FitError::InvalidParameter { ref name, .. } if name == "crosstalk"));
        assert_eq!(solver.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn wide_relative_rule_stays_inside_limits() {
        let truth = ModelParameters::new(TRUTH.to_vec()).unwrap();
        let h = synthetic(&truth, 3);
        let mut protocol = single_stage(false);
        protocol[0].rules.insert(ParamIndex::Crosstalk, ParameterRule::Relative { lower: 0.5, upper: 30.0 });
        let fit = StagedFitController::new(&ToUpperBound)
            .with_protocol(protocol)
            .run(&h, &ModelParameters::default_seed(false), 3, false)
            .unwrap();
        assert_eq!(fit.calibration.crosstalk, 0.06);
        assert!(fit.parameters.validate().is_ok());
    }

    /// Ignores the bounds and returns a negative PE width.
    struct OutOfDomain;

    impl Minimizer for OutOfDomain {
        fn minimize(&self, problem: &FitProblem<'_>) -> Result<SolverOutcome, FitError> {
            let mut out = echo(problem, true);
            out.parameters[ParamIndex::PeWidth.index()] = -1.0;
            Ok(out)
        }
    }

    #[test]
    fn result_outside_the_domain_fails_the_stage() {
        let truth = ModelParameters::new(TRUTH.to_vec()).unwrap();
        let h = synthetic(&truth, 3);
        let err = StagedFitController::new(&OutOfDomain)
            .run(&h, &ModelParameters::default_seed(false), 3, false)
            .unwrap_err();
        match err {
            FitError::SolverNonConvergence { stage, reason } => {
                assert_eq!(stage, "background");
                assert!(reason.contains("pe_width"), "{reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn empty_fit_window_is_non_convergence() {
        let truth = ModelParameters::new(TRUTH.to_vec()).unwrap();
        let h = synthetic(&truth, 3);
        let mut protocol = single_stage(false);
        protocol[0].x_min = RangeEdge::Absolute(5000.0);
        protocol[0].x_max = RangeEdge::Absolute(6000.0);
        let err = StagedFitController::new(&Counting::default())
            .with_protocol(protocol)
            .run(&h, &ModelParameters::default_seed(false), 3, false)
            .unwrap_err();
        assert!(matches!(err, FitError::SolverNonConvergence { .. }));
    }
}

//! Shared "fit pipeline" logic used by the `fit` command.
//!
//! Keeping this in one place keeps the workflow readable:
//! ingest -> seed/limits/protocol -> staged fit per channel (parallel) -> reports
//!
//! The front-end then only decides what to print and export.

use rayon::prelude::*;
use tracing::{info, warn};

use crate::data::BinnedHistogram;
use crate::domain::{ChannelReport, ConvergenceStatus, FitConfig, ModelParameters, ParameterLimits, SolverKind};
use crate::error::{AppError, EXIT_INPUT, FitError};
use crate::fit::{Lbfgs, LevenbergMarquardt, Minimizer, StagedFit, StagedFitController, validate_protocol};
use crate::io::calib::{load_limits, load_protocol, load_seed};
use crate::io::ingest::{IngestedData, load_channels};

/// All computed outputs of a single `sipmcal fit` run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub ingest: IngestedData,
    /// One report per ingested histogram, in input order.
    pub reports: Vec<ChannelReport>,
    pub seed: ModelParameters,
}

/// Execute the full fitting pipeline and return the computed outputs.
///
/// Channel failures are recorded in their report; only problems with the run
/// inputs themselves (files, seed, limits, protocol) are returned as errors.
pub fn run_fit(config: &FitConfig) -> Result<RunOutput, AppError> {
    // 1) Seed, limits and protocol.
    let seed = match &config.seed_file {
        Some(path) => load_seed(path)?,
        None => ModelParameters::default_seed(config.enable_mip),
    };
    if seed.has_mip() != config.enable_mip {
        info!(values = seed.len(), mip = config.enable_mip, "resizing seed to the model");
    }
    let seed = seed.resized(config.enable_mip);

    let limits = match &config.limits_file {
        Some(path) => load_limits(path)?,
        None => ParameterLimits::default(),
    };
    let protocol = config.protocol_file.as_deref().map(load_protocol).transpose()?;
    if let Some(stages) = &protocol {
        validate_protocol(stages, config.enable_mip).map_err(|e| AppError::new(EXIT_INPUT, e.to_string()))?;
    }

    // 2) Ingest.
    let ingest = load_channels(config)?;
    info!(channels = ingest.histograms.len(), rows = ingest.rows_read, "input loaded");

    // 3) Fit channels in parallel; results keep input order.
    let solver = minimizer(config);
    info!(solver = ?config.solver, statistic = ?config.statistic, "fitting");
    let mut controller = StagedFitController::new(solver.as_ref())
        .with_limits(limits)
        .with_neighbors(config.neighbors)
        .with_bin_evaluation(config.bin_evaluation);
    if let Some(stages) = protocol {
        controller = controller.with_protocol(stages);
    }

    let reports = ingest
        .histograms
        .par_iter()
        .map(|h| fit_channel(&controller, h, &seed, config))
        .collect();

    Ok(RunOutput { ingest, reports, seed })
}

fn minimizer(config: &FitConfig) -> Box<dyn Minimizer> {
    match config.solver {
        SolverKind::Lm => Box::new(LevenbergMarquardt {
            max_iterations: config.max_iterations,
            statistic: config.statistic,
            ..LevenbergMarquardt::default()
        }),
        SolverKind::Lbfgs => Box::new(Lbfgs {
            max_iterations: config.max_iterations,
            statistic: config.statistic,
            ..Lbfgs::default()
        }),
    }
}

fn fit_channel(
    controller: &StagedFitController<'_>,
    histogram: &BinnedHistogram,
    seed: &ModelParameters,
    config: &FitConfig,
) -> ChannelReport {
    let result = controller.run(histogram, seed, config.num_peaks, config.enable_mip);
    channel_report(&histogram.name, result)
}

/// Convert a fit result into the exported per-channel record.
pub fn channel_report(channel: &str, result: Result<StagedFit, FitError>) -> ChannelReport {
    match result {
        Ok(fit) => ChannelReport {
            channel: channel.to_string(),
            calibration: Some(fit.calibration),
            parameters: Some(fit.parameters.to_vec()),
            uncertainties: Some(fit.uncertainties),
            status: fit.status,
            stages: fit.stages,
            error: None,
            error_kind: None,
        },
        Err(err) => {
            warn!(channel, kind = err.kind(), "{err}");
            ChannelReport {
                channel: channel.to_string(),
                calibration: None,
                parameters: None,
                uncertainties: None,
                status: ConvergenceStatus::Failed,
                stages: Vec::new(),
                error: Some(err.to_string()),
                error_kind: Some(err.kind().to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;

    use super::*;
    use crate::data::{SimulationSpec, events_for_truth, generate_samples, reference_truth};
    use crate::domain::{BinEvaluation, BinningSpec, FitStatistic, InputSource, ParamIndex};
    use crate::fit::run_staged_fit;
    use crate::models::SpectrumModel;

    fn config(input: InputSource) -> FitConfig {
        FitConfig {
            input,
            binning: BinningSpec::default(),
            channels: Vec::new(),
            num_peaks: 3,
            enable_mip: false,
            neighbors: 4,
            bin_evaluation: BinEvaluation::Center,
            statistic: FitStatistic::Poisson,
            solver: SolverKind::Lm,
            max_iterations: 500,
            seed_file: None,
            limits_file: None,
            protocol_file: None,
            plot: false,
            plot_width: 100,
            plot_height: 25,
            log_y: false,
            export_csv: None,
            export_json: None,
        }
    }

    /// Long-format CSV: one noise-free synthetic channel and one all-zero channel.
    fn histogram_csv() -> tempfile::NamedTempFile {
        let truth = ModelParameters::new(vec![5000.0, 8.0, 140.0, 0.0, 5.0, 5000.0, 0.15, 140.0, 15.0, 0.05]).unwrap();
        let model = SpectrumModel::new(3, false).unwrap();
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "channel,lower,width,content,uncertainty").unwrap();
        for i in 0..1000 {
            let lower = 2.0 * i as f64;
            let v = model.evaluate(lower + 1.0, &truth).unwrap();
            let sigma = if v > 1.0 { v.sqrt() } else { 1.0 };
            writeln!(f, "good,{lower},2,{v},{sigma}").unwrap();
        }
        for i in 0..10 {
            writeln!(f, "dead,{},2,0,0", 2 * i).unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[test]
    fn failed_channel_does_not_stop_the_run() {
        let f = histogram_csv();
        let out = run_fit(&config(InputSource::Histograms(f.path().to_path_buf()))).unwrap();
        assert_eq!(out.reports.len(), 2);

        let good = &out.reports[0];
        assert_eq!(good.channel, "good");
        assert_eq!(good.status, ConvergenceStatus::Success);
        let gain = good.calibration.as_ref().unwrap().gain;
        assert!((gain - 140.0).abs() < 1.0, "gain {gain}");

        let dead = &out.reports[1];
        assert_eq!(dead.status, ConvergenceStatus::Failed);
        assert_eq!(dead.error_kind.as_deref(), Some("degenerate_histogram"));
    }

    #[test]
    fn fits_simulated_samples_from_an_offset_seed() {
        let truth = reference_truth(false).unwrap();
        let spec = SimulationSpec {
            events: events_for_truth(&truth, 4, 2.0),
            channels: 3,
            seed: 7,
            truth: truth.clone(),
            neighbors: 4,
            channel_prefix: "ch".to_string(),
        };
        let data = generate_samples(&spec).unwrap();

        let mut seed = ModelParameters::default_seed(false);
        seed.set(ParamIndex::MeanPe, 0.2);
        seed.set(ParamIndex::Gain, 145.0);
        seed.set(ParamIndex::Crosstalk, 0.04);

        for (name, samples) in data.channels.iter().zip(&data.columns) {
            let h = BinnedHistogram::from_samples(name.as_str(), samples, &BinningSpec::default()).unwrap();
            let fit = run_staged_fit(&h, &seed, 3, false).unwrap_or_else(|e| panic!("{name}: {e}"));
            let c = &fit.calibration;
            assert_eq!(fit.status, ConvergenceStatus::Success);
            assert!((c.pedestal - 140.0).abs() < 1.0, "{name}: pedestal {}", c.pedestal);
            assert!((c.gain - 140.0).abs() < 0.01 * 140.0, "{name}: gain {}", c.gain);
            // λ and the PE amplitude are strongly correlated; λ only has to stay within its limits.
            assert!((c.crosstalk - 0.05).abs() < 0.3 * 0.05, "{name}: crosstalk {}", c.crosstalk);
            assert!((0.05..=0.3).contains(&c.mean_pe), "{name}: mean_pe {}", c.mean_pe);
        }
    }

    #[test]
    fn lbfgs_and_chi2_are_selectable() {
        let f = histogram_csv();
        let mut cfg = config(InputSource::Histograms(f.path().to_path_buf()));
        cfg.solver = SolverKind::Lbfgs;
        cfg.statistic = FitStatistic::Chi2;
        let out = run_fit(&cfg).unwrap();
        assert_eq!(out.reports.len(), 2);
        assert_eq!(out.reports[1].error_kind.as_deref(), Some("degenerate_histogram"));
    }

    #[test]
    fn bad_seed_file_is_an_input_error() {
        let mut seed = tempfile::NamedTempFile::new().unwrap();
        write!(seed, "[1, 2, 3]").unwrap();
        let mut cfg = config(InputSource::Histograms(PathBuf::from("unused.csv")));
        cfg.seed_file = Some(seed.path().to_path_buf());
        let err = run_fit(&cfg).unwrap_err();
        assert_eq!(err.exit_code(), EXIT_INPUT);
    }

    #[test]
    fn channel_report_records_error_kind() {
        let r = channel_report(
            "ch7",
            Err(FitError::SolverNonConvergence {
                stage: "spectrum".to_string(),
                reason: "iteration cap reached".to_string(),
            }),
        );
        assert_eq!(r.status, ConvergenceStatus::Failed);
        assert_eq!(r.error_kind.as_deref(), Some("non_convergence"));
        assert!(r.error.unwrap().contains("spectrum"));
        assert!(r.calibration.is_none());
    }
}

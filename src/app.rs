//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments and sets up logging
//! - loads spectra and runs the staged fit per channel
//! - prints reports/plots
//! - writes optional exports

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{BinningArgs, Command, FitArgs, InputArgs, PlotArgs, ProtocolArgs, SimulateArgs};
use crate::data::{SimulationSpec, events_for_truth, generate_samples, reference_truth};
use crate::domain::{BinningSpec, FitConfig, InputSource, ModelParameters};
use crate::error::{AppError, EXIT_COMPUTE, EXIT_INPUT};
use crate::io::calib::{CalibrationFile, read_calibration_json, write_calibration_json};
use crate::models::SpectrumModel;
use crate::plot::PlotOptions;

pub mod pipeline;

/// Bin width assumed when deriving the default event count for `simulate`.
const SIMULATION_BIN_WIDTH: f64 = 2.0;

/// Entry point for the `sipmcal` binary.
pub fn run() -> Result<(), AppError> {
    let cli = crate::cli::Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Fit(args) => handle_fit(args),
        Command::Simulate(args) => handle_simulate(args),
        Command::Protocol(args) => handle_protocol(args),
        Command::Plot(args) => handle_plot(args),
    }
}

/// Logs go to stderr so stdout carries only the report. `RUST_LOG` wins over `-v`.
fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn handle_fit(args: FitArgs) -> Result<(), AppError> {
    let config = fit_config_from_args(&args)?;
    let run = pipeline::run_fit(&config)?;

    println!("{}", crate::report::format_run_summary(&run.ingest, &run.reports, &config));
    println!("{}", crate::report::format_calibration_table(&run.reports));

    if args.stages {
        for r in &run.reports {
            println!("{}", crate::report::format_stage_table(r));
        }
    }

    if config.plot {
        let opts = PlotOptions {
            width: config.plot_width,
            height: config.plot_height,
            log_y: config.log_y,
        };
        for (h, r) in run.ingest.histograms.iter().zip(&run.reports) {
            let Some(params) = &r.parameters else {
                continue;
            };
            let model = SpectrumModel::new(config.num_peaks, config.enable_mip)?
                .with_neighbors(config.neighbors)
                .with_bin_evaluation(config.bin_evaluation);
            let plot = crate::plot::render_spectrum_plot(h, &model, params, r.calibration.as_ref(), &opts)?;
            println!("{plot}");
        }
    }

    // Optional exports.
    if let Some(path) = &config.export_csv {
        crate::io::export::write_calibration_csv(path, &run.reports)?;
        info!(path = %path.display(), "wrote calibration CSV");
    }
    if let Some(path) = &config.export_json {
        let file = CalibrationFile {
            tool: "sipmcal".to_string(),
            num_peaks: config.num_peaks,
            enable_mip: config.enable_mip,
            neighbors: config.neighbors,
            bin_evaluation: config.bin_evaluation,
            channels: run.reports.clone(),
        };
        write_calibration_json(path, &file)?;
        info!(path = %path.display(), "wrote calibration JSON");
    }

    let stats = crate::report::run_stats(&run.reports);
    if stats.channels > 0 && stats.succeeded == 0 {
        return Err(AppError::new(EXIT_COMPUTE, format!("All {} channel fits failed.", stats.channels)));
    }
    Ok(())
}

fn handle_simulate(args: SimulateArgs) -> Result<(), AppError> {
    let truth = match &args.truth {
        Some(path) => crate::io::calib::load_seed(path)?,
        None => reference_truth(args.mip)?,
    };
    let events = args
        .events
        .unwrap_or_else(|| events_for_truth(&truth, args.neighbors, SIMULATION_BIN_WIDTH));
    let spec = SimulationSpec {
        events,
        channels: args.channels,
        seed: args.seed,
        truth,
        neighbors: args.neighbors,
        channel_prefix: args.prefix.clone(),
    };
    let data = generate_samples(&spec)?;
    crate::io::export::write_samples_csv(&args.output, &data)?;
    println!(
        "Wrote {} channels x {} events to {}",
        data.channels.len(),
        data.events(),
        args.output.display()
    );
    Ok(())
}

fn handle_protocol(args: ProtocolArgs) -> Result<(), AppError> {
    let protocol = crate::fit::default_protocol(args.mip);
    let json = serde_json::to_string_pretty(&protocol)
        .map_err(|e| AppError::new(EXIT_COMPUTE, format!("Failed to serialize protocol: {e}")))?;
    println!("{json}");
    Ok(())
}

fn handle_plot(args: PlotArgs) -> Result<(), AppError> {
    let calibration = read_calibration_json(&args.calibration)?;
    let input = input_source(&args.input)?;
    let binning = binning_spec(&args.binning);
    let ingest = match &input {
        InputSource::Samples(path) => crate::io::ingest::load_samples(path, &binning, &args.input.channels)?,
        InputSource::Histograms(path) => crate::io::ingest::load_histograms(path, &args.input.channels)?,
    };

    let model = SpectrumModel::new(calibration.num_peaks, calibration.enable_mip)?
        .with_neighbors(calibration.neighbors)
        .with_bin_evaluation(calibration.bin_evaluation);
    let opts = PlotOptions {
        width: args.width,
        height: args.height,
        log_y: args.log_y,
    };

    let mut plotted = 0usize;
    for h in &ingest.histograms {
        let Some(report) = calibration.channel(&h.name) else {
            continue;
        };
        let Some(params) = &report.parameters else {
            println!("{}: no fitted parameters ({})", h.name, report.error.as_deref().unwrap_or("failed"));
            continue;
        };
        let params = ModelParameters::new(params.clone())?;
        let plot =
            crate::plot::render_spectrum_plot(h, &model, params.as_slice(), report.calibration.as_ref(), &opts)?;
        println!("{plot}");
        plotted += 1;
    }

    if plotted == 0 {
        return Err(AppError::new(
            EXIT_INPUT,
            "No channel of the input has fitted parameters in the calibration file.",
        ));
    }
    Ok(())
}

pub fn fit_config_from_args(args: &FitArgs) -> Result<FitConfig, AppError> {
    Ok(FitConfig {
        input: input_source(&args.input)?,
        binning: binning_spec(&args.binning),
        channels: args.input.channels.clone(),

        num_peaks: args.peaks,
        enable_mip: args.mip,
        neighbors: args.neighbors,
        bin_evaluation: args.bin_eval,
        statistic: args.statistic,
        solver: args.solver,
        max_iterations: args.max_iterations,

        seed_file: args.seed_file.clone(),
        limits_file: args.limits.clone(),
        protocol_file: args.protocol.clone(),

        plot: args.plot,
        plot_width: args.width,
        plot_height: args.height,
        log_y: args.log_y,

        export_csv: args.export.clone(),
        export_json: args.export_json.clone(),
    })
}

fn input_source(args: &InputArgs) -> Result<InputSource, AppError> {
    match (&args.samples, &args.histograms) {
        (Some(p), None) => Ok(InputSource::Samples(p.clone())),
        (None, Some(p)) => Ok(InputSource::Histograms(p.clone())),
        _ => Err(AppError::new(EXIT_INPUT, "Give exactly one of `--samples` or `--histograms`.")),
    }
}

fn binning_spec(args: &BinningArgs) -> BinningSpec {
    BinningSpec {
        bins: args.bins,
        x_min: args.x_min,
        x_max: args.x_max,
        accept_min: args.accept_min,
        accept_max: args.accept_max,
        normalize: !args.no_normalize,
    }
}

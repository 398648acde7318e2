//! Command-line parsing for the SiPM spectrum calibrator.
//!
//! The goal of this module is to keep **argument parsing** and **command dispatch**
//! separate from the modeling/math code.

use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand};

use crate::domain::{BinEvaluation, FitStatistic, SolverKind};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "sipmcal", version, about = "SiPM charge-spectrum calibration (staged fit)")]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace). `RUST_LOG` overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit every channel of an input file and print/export the calibrations.
    Fit(FitArgs),
    /// Write a synthetic raw-samples CSV.
    Simulate(SimulateArgs),
    /// Print the default fit protocol as JSON (edit and pass back with `--protocol`).
    Protocol(ProtocolArgs),
    /// Plot one channel of a saved calibration against its histogram.
    Plot(PlotArgs),
}

/// Where the spectra come from.
#[derive(Debug, Args, Clone)]
#[command(group(ArgGroup::new("input").required(true).args(["samples", "histograms"])))]
pub struct InputArgs {
    /// CSV of raw per-event samples, one column per channel.
    #[arg(long, value_name = "CSV")]
    pub samples: Option<PathBuf>,

    /// CSV of pre-binned histograms (`channel,lower,width,content[,uncertainty]`).
    #[arg(long, value_name = "CSV")]
    pub histograms: Option<PathBuf>,

    /// Only use these channels (repeatable).
    #[arg(short = 'c', long = "channel", value_name = "NAME")]
    pub channels: Vec<String>,
}

/// Histogram binning for raw samples.
#[derive(Debug, Args, Clone)]
pub struct BinningArgs {
    /// Number of bins.
    #[arg(long, default_value_t = 1000)]
    pub bins: usize,

    /// Lower edge of the first bin.
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub x_min: f64,

    /// Upper edge of the last bin.
    #[arg(long, default_value_t = 2000.0)]
    pub x_max: f64,

    /// Samples at or below this value are dropped.
    #[arg(long, default_value_t = 20.0, allow_negative_numbers = true)]
    pub accept_min: f64,

    /// Samples at or above this value are dropped.
    #[arg(long, default_value_t = 5000.0)]
    pub accept_max: f64,

    /// Keep raw counts instead of per-width densities.
    #[arg(long)]
    pub no_normalize: bool,
}

/// Options for `fit`.
#[derive(Debug, Parser, Clone)]
pub struct FitArgs {
    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub binning: BinningArgs,

    /// Number of photoelectron peaks in the model (1-15).
    #[arg(short = 'p', long, default_value_t = 3)]
    pub peaks: usize,

    /// Model the MIP (Landau ⊗ Gauss) peak.
    #[arg(long)]
    pub mip: bool,

    /// Neighbor cells reachable by crosstalk.
    #[arg(long, default_value_t = 4)]
    pub neighbors: u32,

    /// Compare the model with each bin at its centre or averaged over the bin.
    #[arg(long, value_enum, default_value_t = BinEvaluation::Center)]
    pub bin_eval: BinEvaluation,

    /// Statistic minimized in every stage.
    #[arg(long, value_enum, default_value_t = FitStatistic::Poisson)]
    pub statistic: FitStatistic,

    /// Minimization algorithm.
    #[arg(long, value_enum, default_value_t = SolverKind::Lm)]
    pub solver: SolverKind,

    /// Solver iteration cap per stage.
    #[arg(long, default_value_t = 500)]
    pub max_iterations: usize,

    /// Seed parameters (JSON array of 10 or 14 values).
    #[arg(long, value_name = "JSON")]
    pub seed_file: Option<PathBuf>,

    /// Absolute parameter limits (JSON).
    #[arg(long, value_name = "JSON")]
    pub limits: Option<PathBuf>,

    /// Fit protocol (JSON, see `sipmcal protocol`).
    #[arg(long, value_name = "JSON")]
    pub protocol: Option<PathBuf>,

    /// Print per-stage diagnostics for every channel.
    #[arg(long)]
    pub stages: bool,

    /// Render an ASCII plot per successful channel.
    #[arg(long)]
    pub plot: bool,

    /// Logarithmic y axis for plots.
    #[arg(long)]
    pub log_y: bool,

    /// Plot width (columns).
    #[arg(long, default_value_t = 100)]
    pub width: usize,

    /// Plot height (rows).
    #[arg(long, default_value_t = 25)]
    pub height: usize,

    /// Export the calibration table to CSV.
    #[arg(long, value_name = "CSV")]
    pub export: Option<PathBuf>,

    /// Export parameters, uncertainties and stage reports to JSON.
    #[arg(long = "export-json", value_name = "JSON")]
    pub export_json: Option<PathBuf>,
}

/// Options for `simulate`.
#[derive(Debug, Parser, Clone)]
pub struct SimulateArgs {
    /// Output CSV.
    #[arg(short, long, value_name = "CSV")]
    pub output: PathBuf,

    /// Events per channel (default: enough to reproduce the truth amplitudes with 2-unit bins).
    #[arg(short = 'n', long)]
    pub events: Option<usize>,

    /// Number of channels.
    #[arg(long, default_value_t = 4)]
    pub channels: usize,

    /// Random seed.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Truth parameters (JSON array of 10 or 14 values).
    #[arg(long, value_name = "JSON")]
    pub truth: Option<PathBuf>,

    /// Include MIP events in the default truth.
    #[arg(long)]
    pub mip: bool,

    /// Neighbor cells reachable by crosstalk.
    #[arg(long, default_value_t = 4)]
    pub neighbors: u32,

    /// Channel name prefix.
    #[arg(long, default_value = "ch")]
    pub prefix: String,
}

/// Options for `protocol`.
#[derive(Debug, Parser, Clone)]
pub struct ProtocolArgs {
    /// Include the MIP stage.
    #[arg(long)]
    pub mip: bool,
}

/// Options for `plot`.
#[derive(Debug, Parser, Clone)]
pub struct PlotArgs {
    /// Calibration JSON written by `sipmcal fit --export-json`.
    #[arg(long, value_name = "JSON")]
    pub calibration: PathBuf,

    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub binning: BinningArgs,

    /// Logarithmic y axis.
    #[arg(long)]
    pub log_y: bool,

    /// Plot width (columns).
    #[arg(long, default_value_t = 100)]
    pub width: usize,

    /// Plot height (rows).
    #[arg(long, default_value_t = 25)]
    pub height: usize,
}

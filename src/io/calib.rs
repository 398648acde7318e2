//! JSON files: calibration results and run inputs.
//!
//! A calibration file is the portable record of a `fit` run. It holds the model
//! configuration plus one `ChannelReport` per channel, which is enough for the
//! `plot` subcommand to redraw any channel against its histogram.
//!
//! Seeds, limits and protocols are plain serde documents:
//!
//! - seed: `[p0, …, p9]` or `[p0, …, p13]`
//! - limits: `{"bounds": [{"lower": …, "upper": …}, …]}` (14 entries)
//! - protocol: the output of `sipmcal protocol`

use std::fs::File;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::{BinEvaluation, ChannelReport, ModelParameters, ParameterLimits};
use crate::error::{AppError, EXIT_INPUT};
use crate::fit::FitStageSpec;

/// Calibration file schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationFile {
    pub tool: String,
    pub num_peaks: usize,
    pub enable_mip: bool,
    pub neighbors: u32,
    pub bin_evaluation: BinEvaluation,
    pub channels: Vec<ChannelReport>,
}

impl CalibrationFile {
    pub fn channel(&self, name: &str) -> Option<&ChannelReport> {
        self.channels.iter().find(|c| c.channel == name)
    }
}

pub fn write_calibration_json(path: &Path, calibration: &CalibrationFile) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::new(EXIT_INPUT, format!("Failed to create calibration JSON '{}': {e}", path.display())))?;
    serde_json::to_writer_pretty(file, calibration)
        .map_err(|e| AppError::new(EXIT_INPUT, format!("Failed to write calibration JSON: {e}")))?;
    Ok(())
}

pub fn read_calibration_json(path: &Path) -> Result<CalibrationFile, AppError> {
    read_json(path, "calibration")
}

/// Load and validate a seed file.
pub fn load_seed(path: &Path) -> Result<ModelParameters, AppError> {
    let seed: ModelParameters = read_json(path, "seed")?;
    seed.validate()?;
    Ok(seed)
}

/// Load and validate a limits file.
pub fn load_limits(path: &Path) -> Result<ParameterLimits, AppError> {
    let limits: ParameterLimits = read_json(path, "limits")?;
    limits.validate()?;
    Ok(limits)
}

/// Load a protocol file. Stage-level checks happen when the fit starts.
pub fn load_protocol(path: &Path) -> Result<Vec<FitStageSpec>, AppError> {
    read_json(path, "protocol")
}

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::new(EXIT_INPUT, format!("Failed to open {what} JSON '{}': {e}", path.display())))?;
    serde_json::from_reader(file).map_err(|e| AppError::new(EXIT_INPUT, format!("Invalid {what} JSON: {e}")))
}

//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - the parameter vector and its roles (`ModelParameters`, `ParamIndex`)
//! - absolute parameter limits (`ParameterLimits`)
//! - fit outputs (`Calibration`, `StageReport`, `ChannelReport`)
//! - the run configuration (`FitConfig`)

pub mod types;

pub use types::*;

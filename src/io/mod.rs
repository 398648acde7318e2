//! Input/output helpers.
//!
//! - CSV ingest of samples and pre-binned histograms (`ingest`)
//! - CSV exports (`export`)
//! - calibration, seed, limits and protocol JSON (`calib`)

pub mod calib;
pub mod export;
pub mod ingest;

pub use calib::*;
pub use export::*;
pub use ingest::*;

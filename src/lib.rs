//! `sipm-calib` library crate.
//!
//! The binary (`sipmcal`) is a thin wrapper around this library so that:
//!
//! - the model and the staged fit are testable without spawning processes
//! - modules are reusable (e.g. from a DAQ monitor or notebooks)
//! - code stays easy to navigate as the project grows

pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod models;
pub mod plot;
pub mod report;

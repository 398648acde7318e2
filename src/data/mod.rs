//! Input data: binned histograms and synthetic event samples.

pub mod histogram;
pub mod sample;

pub use histogram::*;
pub use sample::*;

//! Spectrum fitting.
//!
//! - `solver`: the `Minimizer` seam, fit statistics and Levenberg–Marquardt
//! - `lbfgs`: argmin L-BFGS behind the same seam
//! - `stages`: protocol records and the default calibration protocol
//! - `controller`: runs a protocol against one histogram

pub mod controller;
pub mod lbfgs;
pub mod solver;
pub mod stages;

pub use controller::*;
pub use lbfgs::*;
pub use solver::*;
pub use stages::*;

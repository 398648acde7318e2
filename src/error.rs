//! Error types.
//!
//! Two layers:
//!
//! - `FitError`: channel-local failures raised by the model and the staged fit.
//!   These never abort other channels.
//! - `AppError`: what the binary reports, carrying the process exit code.

use thiserror::Error;

/// Exit code for bad input, unreadable files and usage problems.
pub const EXIT_INPUT: u8 = 2;
/// Exit code for computation failures.
pub const EXIT_COMPUTE: u8 = 4;

/// Failures raised while evaluating the spectrum model or fitting it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    /// A seed or configuration value lies outside its physical domain.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// A fit stage failed to converge; remaining stages were not run.
    #[error("stage '{stage}' did not converge: {reason}")]
    SolverNonConvergence { stage: String, reason: String },

    /// The histogram has no bins, or its total content is zero.
    #[error("degenerate histogram: {0}")]
    DegenerateHistogram(String),

    /// The model produced a non-finite value.
    #[error("non-finite model value at x={x}")]
    NumericOverflow { x: f64 },
}

impl FitError {
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        FitError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-friendly label used in exports.
    pub fn kind(&self) -> &'static str {
        match self {
            FitError::InvalidParameter { .. } => "invalid_parameter",
            FitError::SolverNonConvergence { .. } => "non_convergence",
            FitError::DegenerateHistogram(_) => "degenerate_histogram",
            FitError::NumericOverflow { .. } => "numeric_overflow",
        }
    }
}

#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}

impl From<FitError> for AppError {
    fn from(err: FitError) -> Self {
        let code = match err {
            FitError::InvalidParameter { .. } | FitError::DegenerateHistogram(_) => EXIT_INPUT,
            FitError::SolverNonConvergence { .. } | FitError::NumericOverflow { .. } => EXIT_COMPUTE,
        };
        AppError::new(code, err.to_string())
    }
}

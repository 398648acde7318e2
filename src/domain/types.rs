//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - used in-memory during fitting
//! - exported to JSON/CSV
//! - reloaded later for plotting or comparisons

use std::path::PathBuf;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::FitError;

/// Number of parameters of the spectrum-only model.
pub const SPECTRUM_PARAM_COUNT: usize = 10;
/// Number of parameters when the MIP component is enabled.
pub const MIP_PARAM_COUNT: usize = 14;

/// Role of each entry of a parameter vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamIndex {
    PedestalAmplitude,
    PedestalWidth,
    Shift,
    BackgroundAmplitude,
    BackgroundWidth,
    PeAmplitude,
    MeanPe,
    Gain,
    PeWidth,
    Crosstalk,
    MipArea,
    MipMpv,
    LandauWidth,
    MipSigma,
}

impl ParamIndex {
    pub const ALL: [ParamIndex; MIP_PARAM_COUNT] = [
        ParamIndex::PedestalAmplitude,
        ParamIndex::PedestalWidth,
        ParamIndex::Shift,
        ParamIndex::BackgroundAmplitude,
        ParamIndex::BackgroundWidth,
        ParamIndex::PeAmplitude,
        ParamIndex::MeanPe,
        ParamIndex::Gain,
        ParamIndex::PeWidth,
        ParamIndex::Crosstalk,
        ParamIndex::MipArea,
        ParamIndex::MipMpv,
        ParamIndex::LandauWidth,
        ParamIndex::MipSigma,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: usize) -> Option<Self> {
        Self::ALL.get(i).copied()
    }

    /// Short label used in reports and logs.
    pub fn name(self) -> &'static str {
        match self {
            ParamIndex::PedestalAmplitude => "ped_amp",
            ParamIndex::PedestalWidth => "ped_width",
            ParamIndex::Shift => "shift",
            ParamIndex::BackgroundAmplitude => "bg_amp",
            ParamIndex::BackgroundWidth => "bg_width",
            ParamIndex::PeAmplitude => "pe_amp",
            ParamIndex::MeanPe => "mean_pe",
            ParamIndex::Gain => "gain",
            ParamIndex::PeWidth => "pe_width",
            ParamIndex::Crosstalk => "crosstalk",
            ParamIndex::MipArea => "mip_area",
            ParamIndex::MipMpv => "mip_mpv",
            ParamIndex::LandauWidth => "landau_width",
            ParamIndex::MipSigma => "mip_sigma",
        }
    }

    /// Physically admissible values.
    ///
    /// - amplitudes, the mean PE count and the gain: `[0, ∞)`
    /// - peak widths: strictly positive
    /// - background width: `[0, ∞)`, zero switches the background off
    /// - crosstalk: a probability in `[0, 1)`
    /// - shift and MIP most probable value: unrestricted
    pub fn domain(self) -> Bound {
        match self {
            ParamIndex::PedestalAmplitude
            | ParamIndex::BackgroundAmplitude
            | ParamIndex::PeAmplitude
            | ParamIndex::MipArea
            | ParamIndex::MeanPe
            | ParamIndex::Gain
            | ParamIndex::BackgroundWidth => Bound::new(0.0, f64::INFINITY),
            ParamIndex::PedestalWidth | ParamIndex::PeWidth | ParamIndex::LandauWidth | ParamIndex::MipSigma => {
                Bound::new(f64::MIN_POSITIVE, f64::INFINITY)
            }
            ParamIndex::Crosstalk => Bound::new(0.0, 1.0 - f64::EPSILON),
            ParamIndex::Shift | ParamIndex::MipMpv => Bound::new(f64::NEG_INFINITY, f64::INFINITY),
        }
    }
}

/// Model parameter vector (10 or 14 entries, see `ParamIndex`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct ModelParameters {
    values: Vec<f64>,
}

impl ModelParameters {
    /// Build from a raw vector; the length must be 10 or 14.
    pub fn new(values: Vec<f64>) -> Result<Self, FitError> {
        if values.len() != SPECTRUM_PARAM_COUNT && values.len() != MIP_PARAM_COUNT {
            return Err(FitError::invalid(
                "parameters",
                format!(
                    "expected {SPECTRUM_PARAM_COUNT} or {MIP_PARAM_COUNT} values, got {}",
                    values.len()
                ),
            ));
        }
        Ok(Self { values })
    }

    /// Seed used when no seed file is supplied.
    ///
    /// Spectrum values follow a typical 140 ADC/PE sensor; MIP values are a
    /// neutral starting point that the `mip` stage refines.
    pub fn default_seed(enable_mip: bool) -> Self {
        let mut values = vec![4900.0, 8.0, 140.0, 2000.0, 5.0, 5000.0, 0.15, 140.0, 15.0, 0.05];
        if enable_mip {
            values.extend_from_slice(&[20_000.0, 1000.0, 50.0, 100.0]);
        }
        Self { values }
    }

    pub fn has_mip(&self) -> bool {
        self.values.len() == MIP_PARAM_COUNT
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: ParamIndex) -> Option<f64> {
        self.values.get(idx.index()).copied()
    }

    pub fn set(&mut self, idx: ParamIndex, value: f64) {
        if let Some(slot) = self.values.get_mut(idx.index()) {
            *slot = value;
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.values.clone()
    }

    /// Extend a spectrum-only vector with MIP entries (or drop them).
    pub fn resized(&self, enable_mip: bool) -> Self {
        let mut values = self.values.clone();
        if enable_mip && !self.has_mip() {
            values.extend_from_slice(&ModelParameters::default_seed(true).values[SPECTRUM_PARAM_COUNT..]);
        } else if !enable_mip {
            values.truncate(SPECTRUM_PARAM_COUNT);
        }
        Self { values }
    }

    /// Check that every entry is finite and inside `ParamIndex::domain`.
    pub fn validate(&self) -> Result<(), FitError> {
        for (&v, idx) in self.values.iter().zip(ParamIndex::ALL) {
            if !v.is_finite() {
                return Err(FitError::invalid(idx.name(), format!("value {v} is not finite")));
            }
            if !idx.domain().contains(v) {
                return Err(FitError::invalid(idx.name(), format!("value {v} outside {}", idx.domain())));
            }
        }
        Ok(())
    }
}

impl TryFrom<Vec<f64>> for ModelParameters {
    type Error = FitError;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        ModelParameters::new(values)
    }
}

impl From<ModelParameters> for Vec<f64> {
    fn from(p: ModelParameters) -> Self {
        p.values
    }
}

/// Closed interval `[lower, upper]` for one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub lower: f64,
    pub upper: f64,
}

impl Bound {
    pub const fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    pub fn contains(&self, v: f64) -> bool {
        v >= self.lower && v <= self.upper
    }

    /// Overlap of two intervals; disjoint intervals give a single point.
    pub fn intersect(&self, other: Bound) -> Bound {
        let upper = self.upper.min(other.upper);
        let lower = self.lower.max(other.lower).min(upper);
        Bound { lower, upper }
    }
}

impl std::fmt::Display for Bound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.lower, self.upper)
    }
}

/// Absolute parameter limits used by stages that free a parameter "within limits".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterLimits {
    pub bounds: Vec<Bound>,
}

impl Default for ParameterLimits {
    fn default() -> Self {
        Self {
            bounds: vec![
                Bound::new(4500.0, 5300.0),
                Bound::new(2.0, 10.0),
                Bound::new(0.0, 200.0),
                Bound::new(0.0, 2000.0),
                Bound::new(0.0, 10.0),
                Bound::new(3000.0, 6000.0),
                Bound::new(0.05, 0.3),
                Bound::new(100.0, 200.0),
                Bound::new(12.0, 18.0),
                Bound::new(0.02, 0.06),
                Bound::new(0.0, 1e7),
                Bound::new(0.0, 2000.0),
                Bound::new(1.0, 150.0),
                Bound::new(1.0, 200.0),
            ],
        }
    }
}

impl ParameterLimits {
    pub fn get(&self, idx: ParamIndex) -> Option<Bound> {
        self.bounds.get(idx.index()).copied()
    }

    pub fn validate(&self) -> Result<(), FitError> {
        if self.bounds.len() < MIP_PARAM_COUNT {
            return Err(FitError::invalid(
                "limits",
                format!("expected {MIP_PARAM_COUNT} bounds, got {}", self.bounds.len()),
            ));
        }
        for (b, idx) in self.bounds.iter().zip(ParamIndex::ALL) {
            if !(b.lower.is_finite() && b.upper.is_finite()) || b.lower > b.upper {
                return Err(FitError::invalid(idx.name(), format!("invalid limits {b}")));
            }
            let domain = idx.domain();
            if !(domain.contains(b.lower) && domain.contains(b.upper)) {
                return Err(FitError::invalid(idx.name(), format!("limits {b} leave the domain {domain}")));
            }
        }
        Ok(())
    }
}

/// How the model is compared with a bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BinEvaluation {
    /// Model density at the bin centre.
    #[default]
    Center,
    /// Model density averaged over the bin (Simpson rule).
    Average,
}

/// Statistic minimized by the fit stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FitStatistic {
    /// Poisson likelihood ratio (deviance). Empty bins contribute.
    #[default]
    Poisson,
    /// Weighted least squares; bins with zero uncertainty are skipped.
    Chi2,
}

/// Minimization algorithm used by the fit stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SolverKind {
    /// Projected Levenberg–Marquardt on the statistic's residuals.
    #[default]
    Lm,
    /// L-BFGS-B (argmin) on the statistic itself.
    Lbfgs,
}

/// Physical calibration extracted from the terminal fit stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Pedestal position (global shift, ADC).
    pub pedestal: f64,
    /// Mean number of photoelectrons (Poisson mean).
    pub mean_pe: f64,
    /// PE peak spacing (ADC per photoelectron).
    pub gain: f64,
    /// Crosstalk probability per neighbor.
    pub crosstalk: f64,
    pub mip_mpv: Option<f64>,
    pub mip_area: Option<f64>,
}

impl Calibration {
    pub fn from_parameters(p: &ModelParameters) -> Self {
        let v = |idx| p.get(idx).unwrap_or(f64::NAN);
        Self {
            pedestal: v(ParamIndex::Shift),
            mean_pe: v(ParamIndex::MeanPe),
            gain: v(ParamIndex::Gain),
            crosstalk: v(ParamIndex::Crosstalk),
            mip_mpv: p.get(ParamIndex::MipMpv),
            mip_area: p.get(ParamIndex::MipArea),
        }
    }
}

/// Outcome of the staged fit for one channel.
///
/// Parameters left on a bound by an intermediate stage do not change the
/// status; they are listed in that stage's report instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    /// Every stage converged and the terminal stage produced a calibration.
    Success,
    /// A stage failed; no calibration was produced.
    Failed,
}

impl ConvergenceStatus {
    pub fn label(self) -> &'static str {
        match self {
            ConvergenceStatus::Success => "success",
            ConvergenceStatus::Failed => "failed",
        }
    }
}

/// Diagnostics for one fit stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub x_min: f64,
    pub x_max: f64,
    pub bins_used: usize,
    pub free_parameters: usize,
    pub chi2: f64,
    pub ndf: usize,
    pub iterations: usize,
    /// Free parameters that ended on a bound.
    pub pinned: Vec<String>,
    pub parameters: Vec<f64>,
}

/// Result of fitting one channel, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelReport {
    pub channel: String,
    pub calibration: Option<Calibration>,
    pub parameters: Option<Vec<f64>>,
    pub uncertainties: Option<Vec<f64>>,
    pub status: ConvergenceStatus,
    pub stages: Vec<StageReport>,
    /// Error kind and message when the channel failed.
    pub error: Option<String>,
    pub error_kind: Option<String>,
}

impl ChannelReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn final_stage(&self) -> Option<&StageReport> {
        self.stages.last()
    }
}

/// Input source for a `fit` run.
#[derive(Debug, Clone, PartialEq)]
pub enum InputSource {
    /// Pre-binned histograms (`channel,lower,width,content,uncertainty`).
    Histograms(PathBuf),
    /// Raw per-event samples (one column per channel).
    Samples(PathBuf),
}

/// Histogram binning used when filling from raw samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinningSpec {
    pub bins: usize,
    pub x_min: f64,
    pub x_max: f64,
    /// Samples outside the open interval `(accept_min, accept_max)` are dropped.
    pub accept_min: f64,
    pub accept_max: f64,
    /// Divide contents by bin width, then rescale to the accepted event count.
    pub normalize: bool,
}

impl Default for BinningSpec {
    fn default() -> Self {
        Self {
            bins: 1000,
            x_min: 0.0,
            x_max: 2000.0,
            accept_min: 20.0,
            accept_max: 5000.0,
            normalize: true,
        }
    }
}

/// A full run's configuration as understood by the pipeline.
///
/// This is derived from CLI flags (plus defaults and optional JSON files).
#[derive(Debug, Clone)]
pub struct FitConfig {
    pub input: InputSource,
    pub binning: BinningSpec,
    /// Restrict the run to these channel names (all channels when empty).
    pub channels: Vec<String>,

    pub num_peaks: usize,
    pub enable_mip: bool,
    pub neighbors: u32,
    pub bin_evaluation: BinEvaluation,
    pub statistic: FitStatistic,
    pub solver: SolverKind,
    pub max_iterations: usize,

    pub seed_file: Option<PathBuf>,
    pub limits_file: Option<PathBuf>,
    pub protocol_file: Option<PathBuf>,

    pub plot: bool,
    pub plot_width: usize,
    pub plot_height: usize,
    pub log_y: bool,

    pub export_csv: Option<PathBuf>,
    pub export_json: Option<PathBuf>,
}

//! Fit stage descriptions and the default calibration protocol.
//!
//! A protocol is an ordered list of `FitStageSpec` records. Each record says
//! which x-window to fit, how many peaks the model carries, whether the MIP
//! component is on, and what each parameter may do:
//!
//! - not listed: fixed at the value left by the previous stage
//! - `limits`: free within the absolute `ParameterLimits`
//! - `relative`: free within `[lower·v, upper·v]` of the previous value `v`,
//!   clipped to the absolute limits
//! - `fixed`: explicitly fixed (same as not listed)
//!
//! Every free bound is also clipped to the parameter's physical domain.
//!
//! Protocols are plain data (serde), so they can be printed, edited and loaded
//! back from JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{Bound, MIP_PARAM_COUNT, ParamIndex, ParameterLimits, SPECTRUM_PARAM_COUNT};
use crate::error::FitError;
use crate::models::MAX_ORDER;

/// One edge of a stage's fit window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeEdge {
    /// Fixed x position.
    Absolute(f64),
    /// Offset from the current global shift.
    Shift(f64),
}

impl RangeEdge {
    pub fn resolve(self, shift: f64) -> f64 {
        match self {
            RangeEdge::Absolute(x) => x,
            RangeEdge::Shift(offset) => shift + offset,
        }
    }

    fn value(self) -> f64 {
        match self {
            RangeEdge::Absolute(v) | RangeEdge::Shift(v) => v,
        }
    }
}

/// What a stage may do with one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ParameterRule {
    Fixed,
    Limits,
    Relative { lower: f64, upper: f64 },
}

/// Number of photoelectron peaks a stage's model carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakSelection {
    /// The run's configured peak count.
    Configured,
    /// The configured count, capped.
    AtMost(usize),
}

impl PeakSelection {
    pub fn resolve(self, configured: usize) -> usize {
        match self {
            PeakSelection::Configured => configured,
            PeakSelection::AtMost(cap) => configured.min(cap),
        }
    }
}

/// One stage of the staged fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitStageSpec {
    pub name: String,
    pub x_min: RangeEdge,
    pub x_max: RangeEdge,
    pub peaks: PeakSelection,
    /// Whether the MIP component (parameters 10..=13) is part of this stage's model.
    #[serde(default)]
    pub mip: bool,
    /// Fail the stage when a parameter seeded inside its bounds ends on one.
    #[serde(default)]
    pub reject_pinned: bool,
    #[serde(default)]
    pub rules: BTreeMap<ParamIndex, ParameterRule>,
}

/// Resolved per-stage constraints over the stage's parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct StageConstraints {
    pub bounds: Vec<Bound>,
    pub fixed: Vec<bool>,
}

impl FitStageSpec {
    pub fn param_count(&self) -> usize {
        if self.mip { MIP_PARAM_COUNT } else { SPECTRUM_PARAM_COUNT }
    }

    pub fn rule(&self, idx: ParamIndex) -> ParameterRule {
        self.rules.get(&idx).copied().unwrap_or(ParameterRule::Fixed)
    }

    pub fn x_range(&self, shift: f64) -> (f64, f64) {
        (self.x_min.resolve(shift), self.x_max.resolve(shift))
    }

    /// Bounds and fixed flags for `previous` (the parameters entering the stage).
    pub fn constraints(&self, previous: &[f64], limits: &ParameterLimits) -> Result<StageConstraints, FitError> {
        let n = self.param_count();
        if previous.len() < n {
            return Err(FitError::invalid(
                &self.name,
                format!("stage needs {n} parameters, got {}", previous.len()),
            ));
        }
        let absolute = |idx: ParamIndex| {
            limits
                .get(idx)
                .ok_or_else(|| FitError::invalid(idx.name(), "no limits configured"))
        };
        let mut bounds = Vec::with_capacity(n);
        let mut fixed = Vec::with_capacity(n);
        for (i, &v) in previous.iter().take(n).enumerate() {
            let idx = ParamIndex::from_index(i)
                .ok_or_else(|| FitError::invalid(&self.name, format!("no parameter at index {i}")))?;
            match self.rule(idx) {
                ParameterRule::Fixed => {
                    bounds.push(Bound::new(v, v));
                    fixed.push(true);
                }
                ParameterRule::Limits => {
                    bounds.push(absolute(idx)?.intersect(idx.domain()));
                    fixed.push(false);
                }
                ParameterRule::Relative { lower, upper } => {
                    let (a, b) = (lower * v, upper * v);
                    let relative = Bound::new(a.min(b), a.max(b));
                    bounds.push(relative.intersect(absolute(idx)?).intersect(idx.domain()));
                    fixed.push(false);
                }
            }
        }
        Ok(StageConstraints { bounds, fixed })
    }
}

/// Check a protocol before any stage runs.
pub fn validate_protocol(stages: &[FitStageSpec], enable_mip: bool) -> Result<(), FitError> {
    if stages.is_empty() {
        return Err(FitError::invalid("protocol", "no stages"));
    }
    for stage in stages {
        if stage.mip && !enable_mip {
            return Err(FitError::invalid(
                &stage.name,
                "stage enables the MIP component but MIP modeling is off",
            ));
        }
        if !(stage.x_min.value().is_finite() && stage.x_max.value().is_finite()) {
            return Err(FitError::invalid(&stage.name, "fit range edges must be finite"));
        }
        if let PeakSelection::AtMost(cap) = stage.peaks {
            if !(1..=MAX_ORDER).contains(&cap) {
                return Err(FitError::invalid(&stage.name, format!("peak cap {cap} outside 1..={MAX_ORDER}")));
            }
        }
        for (idx, rule) in &stage.rules {
            if idx.index() >= stage.param_count() && *rule != ParameterRule::Fixed {
                return Err(FitError::invalid(
                    &stage.name,
                    format!("{} is not part of this stage's model", idx.name()),
                ));
            }
            if let ParameterRule::Relative { lower, upper } = rule {
                if !(lower.is_finite() && upper.is_finite()) || lower > upper {
                    return Err(FitError::invalid(
                        &stage.name,
                        format!("{}: relative bounds [{lower}, {upper}]", idx.name()),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn rules(entries: &[(ParamIndex, ParameterRule)]) -> BTreeMap<ParamIndex, ParameterRule> {
    entries.iter().copied().collect()
}

/// The calibration protocol used unless a protocol file is given.
///
/// | stage | window | free |
/// |---|---|---|
/// | background | [0, 1000] | background amplitude and width |
/// | pedestal | [shift-10, shift+20] | pedestal amplitude, width, shift |
/// | photoelectron | [shift+70, 450] | mean PE, gain, PE width, crosstalk |
/// | mip (MIP only) | [shift+600, 2000] | MIP area, MPV, Landau width, resolution |
/// | spectrum | [0, 1500], or [0, 2000] with MIP | everything within limits |
/// | final | same as spectrum | everything within a few percent |
///
/// The photoelectron window starts past the pedestal so that the mean PE count
/// and crosstalk are set by peaks 2 and 3 while the PE amplitude stays at its
/// seed. The pedestal and the first PE peak are only separated in the
/// `spectrum` stage, where all parameters move together.
pub fn default_protocol(enable_mip: bool) -> Vec<FitStageSpec> {
    use ParamIndex::*;
    use ParameterRule::{Limits, Relative};

    let upper = if enable_mip { 2000.0 } else { 1500.0 };
    let free = if enable_mip { MIP_PARAM_COUNT } else { SPECTRUM_PARAM_COUNT };

    let mut stages = vec![
        FitStageSpec {
            name: "background".to_string(),
            x_min: RangeEdge::Absolute(0.0),
            x_max: RangeEdge::Absolute(1000.0),
            peaks: PeakSelection::AtMost(3),
            mip: false,
            reject_pinned: false,
            rules: rules(&[(BackgroundAmplitude, Limits), (BackgroundWidth, Limits)]),
        },
        FitStageSpec {
            name: "pedestal".to_string(),
            x_min: RangeEdge::Shift(-10.0),
            x_max: RangeEdge::Shift(20.0),
            peaks: PeakSelection::AtMost(3),
            mip: false,
            reject_pinned: false,
            rules: rules(&[(PedestalAmplitude, Limits), (PedestalWidth, Limits), (Shift, Limits)]),
        },
        FitStageSpec {
            name: "photoelectron".to_string(),
            x_min: RangeEdge::Shift(70.0),
            x_max: RangeEdge::Absolute(450.0),
            peaks: PeakSelection::AtMost(3),
            mip: false,
            reject_pinned: false,
            rules: rules(&[(MeanPe, Limits), (Gain, Limits), (PeWidth, Limits), (Crosstalk, Limits)]),
        },
    ];

    if enable_mip {
        stages.push(FitStageSpec {
            name: "mip".to_string(),
            x_min: RangeEdge::Shift(600.0),
            x_max: RangeEdge::Absolute(2000.0),
            peaks: PeakSelection::Configured,
            mip: true,
            reject_pinned: false,
            rules: rules(&[(MipArea, Limits), (MipMpv, Limits), (LandauWidth, Limits), (MipSigma, Limits)]),
        });
    }

    stages.push(FitStageSpec {
        name: "spectrum".to_string(),
        x_min: RangeEdge::Absolute(0.0),
        x_max: RangeEdge::Absolute(upper),
        peaks: PeakSelection::Configured,
        mip: enable_mip,
        reject_pinned: false,
        rules: ParamIndex::ALL.iter().take(free).map(|&idx| (idx, Limits)).collect(),
    });

    let near = Relative { lower: 0.95, upper: 1.05 };
    let below = Relative { lower: 0.95, upper: 1.0 };
    let mut last = rules(&[
        (PedestalAmplitude, near),
        (PedestalWidth, near),
        (Shift, near),
        (BackgroundAmplitude, below),
        (BackgroundWidth, below),
        (PeAmplitude, near),
        (MeanPe, near),
        (Gain, near),
        (PeWidth, near),
        (Crosstalk, near),
    ]);
    if enable_mip {
        for idx in [MipArea, MipMpv, LandauWidth, MipSigma] {
            last.insert(idx, near);
        }
    }
    stages.push(FitStageSpec {
        name: "final".to_string(),
        x_min: RangeEdge::Absolute(0.0),
        x_max: RangeEdge::Absolute(upper),
        peaks: PeakSelection::Configured,
        mip: enable_mip,
        reject_pinned: true,
        rules: last,
    });

    stages
}

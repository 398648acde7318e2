//! Binned histograms.
//!
//! A histogram is an ordered list of contiguous or disjoint bins, each with its
//! own lower edge and width (variable binning is allowed). Uncertainties are
//! carried explicitly; histograms filled from raw samples start with `√N`.
//!
//! Filling follows the usual acquisition convention:
//!
//! 1. keep samples strictly inside the acceptance window
//! 2. count them into bins (samples outside every bin are dropped)
//! 3. optionally divide each bin by its width and rescale so that the summed
//!    content equals the accepted in-range event count

use serde::{Deserialize, Serialize};

use crate::domain::BinningSpec;
use crate::error::FitError;

/// One histogram bin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bin {
    pub lower: f64,
    pub width: f64,
    pub content: f64,
    pub uncertainty: f64,
}

impl Bin {
    pub fn new(lower: f64, width: f64, content: f64, uncertainty: f64) -> Self {
        Self {
            lower,
            width,
            content,
            uncertainty,
        }
    }

    pub fn center(&self) -> f64 {
        self.lower + 0.5 * self.width
    }

    pub fn upper(&self) -> f64 {
        self.lower + self.width
    }
}

/// A named, validated histogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinnedHistogram {
    pub name: String,
    bins: Vec<Bin>,
}

impl BinnedHistogram {
    /// Build from explicit bins.
    ///
    /// Bins must have finite values, positive widths, non-negative uncertainties
    /// and increasing, non-overlapping edges.
    pub fn new(name: impl Into<String>, bins: Vec<Bin>) -> Result<Self, FitError> {
        let name = name.into();
        for (i, b) in bins.iter().enumerate() {
            let finite = b.lower.is_finite() && b.width.is_finite() && b.content.is_finite() && b.uncertainty.is_finite();
            if !finite || b.width <= 0.0 || b.uncertainty < 0.0 {
                return Err(FitError::invalid(
                    format!("{name}[{i}]"),
                    format!("bad bin lower={} width={} uncertainty={}", b.lower, b.width, b.uncertainty),
                ));
            }
        }
        for (i, pair) in bins.windows(2).enumerate() {
            if pair[1].lower < pair[0].upper() - 1e-9 * pair[0].width {
                return Err(FitError::invalid(
                    format!("{name}[{}]", i + 1),
                    "bins overlap or are not sorted by lower edge",
                ));
            }
        }
        Ok(Self { name, bins })
    }

    /// Empty histogram with `n` equal bins over `[x_min, x_max)`.
    pub fn uniform(name: impl Into<String>, n: usize, x_min: f64, x_max: f64) -> Result<Self, FitError> {
        if n == 0 || !(x_min.is_finite() && x_max.is_finite()) || x_max <= x_min {
            return Err(FitError::invalid("binning", format!("{n} bins over [{x_min}, {x_max})")));
        }
        let width = (x_max - x_min) / n as f64;
        let bins = (0..n)
            .map(|i| Bin::new(x_min + i as f64 * width, width, 0.0, 0.0))
            .collect();
        Self::new(name, bins)
    }

    /// Empty histogram from an increasing list of edges (`edges.len() - 1` bins).
    pub fn from_edges(name: impl Into<String>, edges: &[f64]) -> Result<Self, FitError> {
        if edges.len() < 2 {
            return Err(FitError::invalid("binning", "need at least two edges"));
        }
        let bins = edges
            .windows(2)
            .map(|e| Bin::new(e[0], e[1] - e[0], 0.0, 0.0))
            .collect();
        Self::new(name, bins)
    }

    /// Fill a histogram from raw samples according to `spec`.
    pub fn from_samples(name: impl Into<String>, samples: &[f64], spec: &BinningSpec) -> Result<Self, FitError> {
        let mut h = Self::uniform(name, spec.bins, spec.x_min, spec.x_max)?;
        for &v in samples {
            if v > spec.accept_min && v < spec.accept_max {
                h.fill(v);
            }
        }
        h.reset_poisson_uncertainties();
        if spec.normalize {
            h.normalize_by_width();
        }
        Ok(h)
    }

    pub fn bins(&self) -> &[Bin] {
        &self.bins
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Sum of bin contents.
    pub fn total_content(&self) -> f64 {
        self.bins.iter().map(|b| b.content).sum()
    }

    /// Lowest and highest edge.
    pub fn x_range(&self) -> Option<(f64, f64)> {
        Some((self.bins.first()?.lower, self.bins.last()?.upper()))
    }

    /// Index of the bin containing `x` (lower edge inclusive).
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        let idx = self.bins.partition_point(|b| b.lower <= x);
        let i = idx.checked_sub(1)?;
        (x < self.bins[i].upper()).then_some(i)
    }

    /// Add one unit count at `x`; returns false when `x` falls outside every bin.
    pub fn fill(&mut self, x: f64) -> bool {
        match self.find_bin(x) {
            Some(i) => {
                self.bins[i].content += 1.0;
                true
            }
            None => false,
        }
    }

    /// Set every uncertainty to `√content`.
    pub fn reset_poisson_uncertainties(&mut self) {
        for b in &mut self.bins {
            b.uncertainty = b.content.max(0.0).sqrt();
        }
    }

    /// Divide by bin width, then rescale so the summed content is unchanged.
    pub fn normalize_by_width(&mut self) {
        let before = self.total_content();
        for b in &mut self.bins {
            b.content /= b.width;
            b.uncertainty /= b.width;
        }
        let after = self.total_content();
        if after > 0.0 {
            self.scale(before / after);
        }
    }

    /// Multiply contents and uncertainties by `factor`.
    pub fn scale(&mut self, factor: f64) {
        for b in &mut self.bins {
            b.content *= factor;
            b.uncertainty *= factor;
        }
    }

    /// Fail when there is nothing to fit.
    pub fn ensure_not_degenerate(&self) -> Result<(), FitError> {
        if self.bins.is_empty() {
            return Err(FitError::DegenerateHistogram(format!("'{}' has no bins", self.name)));
        }
        let total = self.total_content();
        if !(total.is_finite() && total > 0.0) {
            return Err(FitError::DegenerateHistogram(format!(
                "'{}' has total content {total}",
                self.name
            )));
        }
        Ok(())
    }

    /// Bins whose centre lies in `[lo, hi]`.
    pub fn select_range(&self, lo: f64, hi: f64) -> Vec<Bin> {
        self.bins
            .iter()
            .filter(|b| {
                let c = b.center();
                c >= lo && c <= hi
            })
            .copied()
            .collect()
    }
}

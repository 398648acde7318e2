//! The SiPM response spectrum.
//!
//! With `u = x - shift`, the expected density is
//!
//! ```text
//! f(x) = A_ped · G(u; 0, σ_ped)
//!      + Σ_{i=1..N} sc[i] · A_pe · G(u; (i-1)·gain, σ_pe)
//!      + A_bg · Landau((u + 50) / w_bg)
//!      + LandauGauss(u; A_mip, mpv, w_L, σ_mip)          (MIP enabled only)
//! ```
//!
//! where `G` is an unnormalized Gaussian and `sc` are the peak amplitude weights
//! of `models::convolution`. Peak `i` sits at `(i-1)·gain` above the shift: the
//! shift locates the first photoelectron peak, and the pedestal shares it.
//!
//! The model is a pure value: every call recomputes `sc` from the parameters it
//! is given, and nothing is cached between calls.

use crate::data::Bin;
use crate::domain::{BinEvaluation, MIP_PARAM_COUNT, ModelParameters, ParamIndex, SPECTRUM_PARAM_COUNT};
use crate::error::FitError;
use crate::math::{gaussian, landau_density};
use crate::models::convolution::PeakOrderWeights;
use crate::models::crosstalk::{CrosstalkTable, DEFAULT_NEIGHBORS, MAX_ORDER, TABLE_LEN};
use crate::models::langau::LandauGauss;

/// Offset applied to the background Landau argument.
const BACKGROUND_OFFSET: f64 = 50.0;

/// A density model with a fixed parameter layout, as seen by the solver.
pub trait ModelFunction: Send + Sync {
    /// Number of leading parameter entries the model reads.
    fn param_count(&self) -> usize;

    /// Density at `x`.
    fn evaluate_at(&self, x: f64, params: &[f64]) -> Result<f64, FitError>;

    /// Expected value for each bin.
    ///
    /// The default compares at bin centres; implementations may precompute
    /// parameter-dependent state once per call.
    fn evaluate_bins(&self, bins: &[Bin], params: &[f64]) -> Result<Vec<f64>, FitError> {
        bins.iter().map(|b| self.evaluate_at(b.center(), params)).collect()
    }
}

/// Spectrum model configuration. Cheap to copy; one per fit stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectrumModel {
    table: CrosstalkTable,
    num_peaks: usize,
    enable_mip: bool,
    bin_evaluation: BinEvaluation,
}

impl SpectrumModel {
    /// Build a model with `num_peaks` photoelectron peaks (1..=15).
    pub fn new(num_peaks: usize, enable_mip: bool) -> Result<Self, FitError> {
        if !(1..=MAX_ORDER).contains(&num_peaks) {
            return Err(FitError::invalid(
                "num_peaks",
                format!("{num_peaks} outside 1..={MAX_ORDER}"),
            ));
        }
        Ok(Self {
            table: CrosstalkTable::new(DEFAULT_NEIGHBORS),
            num_peaks,
            enable_mip,
            bin_evaluation: BinEvaluation::Center,
        })
    }

    pub fn with_neighbors(mut self, neighbors: u32) -> Self {
        self.table = CrosstalkTable::new(neighbors);
        self
    }

    pub fn with_bin_evaluation(mut self, mode: BinEvaluation) -> Self {
        self.bin_evaluation = mode;
        self
    }

    pub fn num_peaks(&self) -> usize {
        self.num_peaks
    }

    pub fn enable_mip(&self) -> bool {
        self.enable_mip
    }

    pub fn table(&self) -> &CrosstalkTable {
        &self.table
    }

    /// Density at `x` for a typed parameter set.
    pub fn evaluate(&self, x: f64, params: &ModelParameters) -> Result<f64, FitError> {
        self.evaluate_at(x, params.as_slice())
    }

    /// Peak amplitude weights for the given parameters.
    pub fn peak_weights(&self, params: &[f64]) -> Result<PeakOrderWeights, FitError> {
        Ok(self.prepare(params)?.weights)
    }

    fn prepare<'a>(&self, params: &'a [f64]) -> Result<Prepared<'a>, FitError> {
        let needed = self.param_count();
        if params.len() < needed {
            return Err(FitError::invalid(
                "parameters",
                format!("model needs {needed} values, got {}", params.len()),
            ));
        }
        let p = |idx: ParamIndex| params[idx.index()];
        let weights = PeakOrderWeights::compute(&self.table, p(ParamIndex::MeanPe), p(ParamIndex::Crosstalk));
        let mip = self.enable_mip.then(|| LandauGauss {
            area: p(ParamIndex::MipArea),
            mpv: p(ParamIndex::MipMpv),
            width: p(ParamIndex::LandauWidth),
            sigma: p(ParamIndex::MipSigma),
        });
        Ok(Prepared {
            params,
            weights,
            num_peaks: self.num_peaks,
            mip,
        })
    }
}

impl ModelFunction for SpectrumModel {
    fn param_count(&self) -> usize {
        if self.enable_mip {
            MIP_PARAM_COUNT
        } else {
            SPECTRUM_PARAM_COUNT
        }
    }

    fn evaluate_at(&self, x: f64, params: &[f64]) -> Result<f64, FitError> {
        let prepared = self.prepare(params)?;
        finite(x, prepared.density(x))
    }

    fn evaluate_bins(&self, bins: &[Bin], params: &[f64]) -> Result<Vec<f64>, FitError> {
        let prepared = self.prepare(params)?;
        bins.iter()
            .map(|b| {
                let v = match self.bin_evaluation {
                    BinEvaluation::Center => prepared.density(b.center()),
                    BinEvaluation::Average => {
                        let (lo, mid, hi) = (b.lower, b.center(), b.upper());
                        (prepared.density(lo) + 4.0 * prepared.density(mid) + prepared.density(hi)) / 6.0
                    }
                };
                finite(b.center(), v)
            })
            .collect()
    }
}

fn finite(x: f64, v: f64) -> Result<f64, FitError> {
    if v.is_finite() {
        Ok(v)
    } else {
        Err(FitError::NumericOverflow { x })
    }
}

/// Parameter-dependent state for one evaluation pass.
struct Prepared<'a> {
    params: &'a [f64],
    weights: PeakOrderWeights,
    num_peaks: usize,
    mip: Option<LandauGauss>,
}

impl Prepared<'_> {
    fn density(&self, x: f64) -> f64 {
        let p = |idx: ParamIndex| self.params[idx.index()];
        let u = x - p(ParamIndex::Shift);

        let mut total = p(ParamIndex::PedestalAmplitude) * gaussian(u, 0.0, p(ParamIndex::PedestalWidth));

        let pe_amp = p(ParamIndex::PeAmplitude);
        let gain = p(ParamIndex::Gain);
        let pe_width = p(ParamIndex::PeWidth);
        for i in 1..=self.num_peaks.min(TABLE_LEN - 1) {
            let mean = (i - 1) as f64 * gain;
            total += self.weights.amplitudes[i] * pe_amp * gaussian(u, mean, pe_width);
        }

        let bg_width = p(ParamIndex::BackgroundWidth);
        if bg_width > 0.0 {
            total += p(ParamIndex::BackgroundAmplitude) * landau_density((u + BACKGROUND_OFFSET) / bg_width);
        }

        if let Some(mip) = &self.mip {
            total += mip.density(u);
        }

        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_params(mip: bool) -> ModelParameters {
        let mut v = vec![5000.0, 8.0, 140.0, 300.0, 5.0, 5000.0, 0.15, 140.0, 15.0, 0.05];
        if mip {
            v.extend_from_slice(&[20_000.0, 1000.0, 30.0, 40.0]);
        }
        ModelParameters::new(v).unwrap()
    }

    #[test]
    fn pedestal_dominates_at_shift() {
        let mut params = reference_params(false);
        params.set(ParamIndex::BackgroundAmplitude, 0.0);
        let model = SpectrumModel::new(3, false).unwrap();
        let at_shift = model.evaluate(140.0, &params).unwrap();
        let w = model.peak_weights(params.as_slice()).unwrap();
        let expected = 5000.0 + w.amplitudes[1] * 5000.0;
        assert!((at_shift - expected).abs() < 1e-9);
    }

    #[test]
    fn peaks_beyond_configured_count_contribute_nothing() {
        let params = reference_params(false);
        let three = SpectrumModel::new(3, false).unwrap();
        let four = SpectrumModel::new(4, false).unwrap();
        let w = three.peak_weights(params.as_slice()).unwrap();
        for &x in &[100.0, 400.0, 560.0, 700.0] {
            let diff = four.evaluate(x, &params).unwrap() - three.evaluate(x, &params).unwrap();
            let fourth = w.amplitudes[4] * 5000.0 * gaussian(x - 140.0, 3.0 * 140.0, 15.0);
            assert!((diff - fourth).abs() < 1e-9 * (1.0 + fourth.abs()), "x={x}");
        }
    }

    #[test]
    fn evaluation_is_continuous_in_x() {
        let params = reference_params(true);
        let model = SpectrumModel::new(5, true).unwrap();
        let h = 1e-6;
        let mut x = 0.0;
        while x < 2000.0 {
            let a = model.evaluate(x, &params).unwrap();
            let b = model.evaluate(x + h, &params).unwrap();
            assert!((a - b).abs() < 1e-2, "jump at x={x}: {a} vs {b}");
            x += 0.73;
        }
    }

    #[test]
    fn mip_component_is_only_added_when_enabled() {
        let params = reference_params(true);
        let plain = SpectrumModel::new(3, false).unwrap();
        let mip = SpectrumModel::new(3, true).unwrap();
        let x = 1140.0;
        let diff = mip.evaluate(x, &params).unwrap() - plain.evaluate(x, &params).unwrap();
        let expected = LandauGauss {
            area: 20_000.0,
            mpv: 1000.0,
            width: 30.0,
            sigma: 40.0,
        }
        .density(1000.0);
        assert!(diff > 0.0);
        assert!((diff - expected).abs() < 1e-9 * expected);
    }

    #[test]
    fn rejects_short_parameter_vectors_and_bad_peak_counts() {
        let model = SpectrumModel::new(3, true).unwrap();
        let params = reference_params(false);
        assert!(matches!(
            model.evaluate(100.0, &params),
            Err(FitError::InvalidParameter { .. })
        ));
        assert!(SpectrumModel::new(0, false).is_err());
        assert!(SpectrumModel::new(16, false).is_err());
    }

    #[test]
    fn non_finite_values_surface_as_overflow() {
        let model = SpectrumModel::new(3, false).unwrap();
        let mut v = reference_params(false).to_vec();
        v[0] = f64::INFINITY;
        assert!(matches!(
            model.evaluate_at(140.0, &v),
            Err(FitError::NumericOverflow { .. })
        ));
    }

    #[test]
    fn bin_average_differs_from_centre_by_curvature_only() {
        let params = reference_params(false);
        let centre = SpectrumModel::new(3, false).unwrap();
        let average = centre.with_bin_evaluation(BinEvaluation::Average);
        let bins: Vec<Bin> = (0..1000).map(|i| Bin::new(i as f64 * 2.0, 2.0, 0.0, 0.0)).collect();
        let a = centre.evaluate_bins(&bins, params.as_slice()).unwrap();
        let b = average.evaluate_bins(&bins, params.as_slice()).unwrap();

        let peak = a.iter().cloned().fold(0.0, f64::max);
        let max_diff = a.iter().zip(&b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max);
        // Correction is about width²/24 · f'', well below 1% of the pedestal height.
        assert!(max_diff > 0.0);
        assert!(max_diff < 0.005 * peak, "max_diff={max_diff} peak={peak}");
    }
}

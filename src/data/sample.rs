//! Synthetic SiPM event generation.
//!
//! Each event is drawn from one of the spectrum components, chosen with
//! probability proportional to the component's area under the model density:
//!
//! - pedestal: `N(shift, σ_ped)`
//! - photoelectron signal: `m ~ Poisson(λ)` primaries (conditioned on `m >= 1`),
//!   each growing into a crosstalk cascade with `Binomial(n, p)` offspring per
//!   fired cell; `k` fired cells give `N(shift + (k-1)·gain, σ_pe)`
//! - background: `shift - 50 + w_bg · L` with `L` standard Landau
//! - MIP (when the truth carries MIP parameters): `shift + mpv' + w_L · L + N(0, σ_mip)`
//!
//! Landau variates come from a tabulated inverse CDF of `math::landau_density`,
//! truncated at `LANDAU_V_MAX`.

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::{Binomial, Normal, Poisson};

use crate::domain::{ModelParameters, ParamIndex};
use crate::error::FitError;
use crate::math::{LANDAU_PEAK_OFFSET, landau_density};
use crate::models::{CrosstalkTable, MAX_ORDER, PeakOrderWeights};

const LANDAU_V_MIN: f64 = -4.0;
const LANDAU_V_MAX: f64 = 200.0;
const LANDAU_TABLE_STEPS: usize = 20_000;
const SQRT_2PI: f64 = 2.5066282746310002;

/// What to simulate.
#[derive(Debug, Clone)]
pub struct SimulationSpec {
    /// Events per channel.
    pub events: usize,
    pub channels: usize,
    pub seed: u64,
    pub truth: ModelParameters,
    pub neighbors: u32,
    /// Channel name prefix (`<prefix><index>`).
    pub channel_prefix: String,
}

/// Truth used by `sipmcal simulate` when no truth file is given.
pub fn reference_truth(enable_mip: bool) -> Result<ModelParameters, FitError> {
    let mut values = vec![5000.0, 8.0, 140.0, 50.0, 5.0, 5000.0, 0.15, 140.0, 15.0, 0.05];
    if enable_mip {
        values.extend_from_slice(&[20_000.0, 1000.0, 30.0, 40.0]);
    }
    ModelParameters::new(values)
}

/// Simulated raw samples, one column per channel.
#[derive(Debug, Clone)]
pub struct SampleData {
    pub channels: Vec<String>,
    pub columns: Vec<Vec<f64>>,
}

impl SampleData {
    pub fn events(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }
}

/// Number of events whose histogram, at `bin_width`, has the truth amplitudes.
///
/// Amplitudes in the model are heights in counts per bin, so the expected count
/// of a component is its area divided by the bin width.
pub fn events_for_truth(truth: &ModelParameters, neighbors: u32, bin_width: f64) -> usize {
    let areas = component_areas(truth, neighbors);
    let total: f64 = areas.iter().sum();
    if bin_width > 0.0 && total.is_finite() {
        (total / bin_width).round() as usize
    } else {
        0
    }
}

/// Component areas: pedestal, photoelectron signal, background, MIP.
fn component_areas(truth: &ModelParameters, neighbors: u32) -> [f64; 4] {
    let p = |idx| truth.get(idx).unwrap_or(0.0);
    let weights = PeakOrderWeights::compute(
        &CrosstalkTable::new(neighbors),
        p(ParamIndex::MeanPe),
        p(ParamIndex::Crosstalk),
    );
    let visible: f64 = weights.amplitudes[1..].iter().sum();
    [
        p(ParamIndex::PedestalAmplitude) * p(ParamIndex::PedestalWidth) * SQRT_2PI,
        p(ParamIndex::PeAmplitude) * p(ParamIndex::PeWidth) * SQRT_2PI * visible,
        p(ParamIndex::BackgroundAmplitude) * p(ParamIndex::BackgroundWidth),
        if truth.has_mip() { p(ParamIndex::MipArea) } else { 0.0 },
    ]
}

/// Generate raw samples for every channel.
pub fn generate_samples(spec: &SimulationSpec) -> Result<SampleData, FitError> {
    spec.truth.validate()?;
    if spec.events == 0 || spec.channels == 0 {
        return Err(FitError::invalid("simulation", "events and channels must be > 0"));
    }

    let landau = LandauSampler::new();
    let mut channels = Vec::with_capacity(spec.channels);
    let mut columns = Vec::with_capacity(spec.channels);
    for ch in 0..spec.channels {
        let mut rng = StdRng::seed_from_u64(channel_seed(spec.seed, ch));
        columns.push(simulate_channel(spec, &landau, &mut rng)?);
        channels.push(format!("{}{ch}", spec.channel_prefix));
    }

    Ok(SampleData { channels, columns })
}

/// SplitMix64 output for step `channel + 1` from `seed`, stable across builds.
fn channel_seed(seed: u64, channel: usize) -> u64 {
    let mut z = seed.wrapping_add((channel as u64).wrapping_add(1).wrapping_mul(0x9e37_79b9_7f4a_7c15));
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

fn simulate_channel(spec: &SimulationSpec, landau: &LandauSampler, rng: &mut StdRng) -> Result<Vec<f64>, FitError> {
    let truth = &spec.truth;
    let p = |idx| truth.get(idx).unwrap_or(0.0);
    let shift = p(ParamIndex::Shift);

    let areas = component_areas(truth, spec.neighbors);
    let chooser = WeightedIndex::new(areas)
        .map_err(|e| FitError::invalid("simulation", format!("component weights: {e}")))?;

    let pedestal = normal(shift, p(ParamIndex::PedestalWidth))?;
    let unit = normal(0.0, 1.0)?;
    let cascade = CascadeSampler::new(p(ParamIndex::MeanPe), p(ParamIndex::Crosstalk), spec.neighbors)?;
    let gain = p(ParamIndex::Gain);
    let pe_width = p(ParamIndex::PeWidth);

    let mut out = Vec::with_capacity(spec.events);
    for _ in 0..spec.events {
        let v = match chooser.sample(rng) {
            0 => pedestal.sample(rng),
            1 => {
                let k = cascade.sample(rng);
                shift + (k - 1) as f64 * gain + pe_width * unit.sample(rng)
            }
            2 => shift - 50.0 + p(ParamIndex::BackgroundWidth) * landau.sample(rng),
            _ => {
                let width = p(ParamIndex::LandauWidth);
                let location = p(ParamIndex::MipMpv) - LANDAU_PEAK_OFFSET * width;
                shift + location + width * landau.sample(rng) + p(ParamIndex::MipSigma) * unit.sample(rng)
            }
        };
        out.push(v);
    }
    Ok(out)
}

fn normal(mean: f64, sigma: f64) -> Result<Normal<f64>, FitError> {
    Normal::new(mean, sigma).map_err(|e| FitError::invalid("simulation", format!("normal({mean}, {sigma}): {e}")))
}

/// Fired-cell count for one photoelectron event.
struct CascadeSampler {
    primaries: Option<Poisson<f64>>,
    offspring: Binomial,
}

impl CascadeSampler {
    fn new(mean_pe: f64, crosstalk: f64, neighbors: u32) -> Result<Self, FitError> {
        let primaries = if mean_pe > 0.0 {
            Some(Poisson::new(mean_pe).map_err(|e| FitError::invalid("mean_pe", e.to_string()))?)
        } else {
            None
        };
        let offspring = Binomial::new(u64::from(neighbors), crosstalk)
            .map_err(|e| FitError::invalid("crosstalk", e.to_string()))?;
        Ok(Self { primaries, offspring })
    }

    /// Draw until the total cell count is within `1..=MAX_ORDER`.
    fn sample(&self, rng: &mut StdRng) -> usize {
        loop {
            let m = match &self.primaries {
                Some(poisson) => poisson.sample(rng) as usize,
                None => 1,
            };
            if m == 0 || m > MAX_ORDER {
                continue;
            }
            if let Some(k) = self.grow(m, rng) {
                return k;
            }
        }
    }

    /// Breadth-first cascade; `None` once it exceeds `MAX_ORDER` cells.
    fn grow(&self, primaries: usize, rng: &mut StdRng) -> Option<usize> {
        let mut fired = primaries;
        let mut pending = primaries;
        while pending > 0 {
            pending -= 1;
            let children = self.offspring.sample(rng) as usize;
            fired += children;
            pending += children;
            if fired > MAX_ORDER {
                return None;
            }
        }
        Some(fired)
    }
}

/// Inverse-CDF sampler for the standard Landau density.
struct LandauSampler {
    v: Vec<f64>,
    cdf: Vec<f64>,
}

impl LandauSampler {
    fn new() -> Self {
        let step = (LANDAU_V_MAX - LANDAU_V_MIN) / LANDAU_TABLE_STEPS as f64;
        let mut v = Vec::with_capacity(LANDAU_TABLE_STEPS + 1);
        let mut cdf = Vec::with_capacity(LANDAU_TABLE_STEPS + 1);
        let mut acc = 0.0;
        let mut prev = landau_density(LANDAU_V_MIN);
        v.push(LANDAU_V_MIN);
        cdf.push(0.0);
        for i in 1..=LANDAU_TABLE_STEPS {
            let x = LANDAU_V_MIN + i as f64 * step;
            let d = landau_density(x);
            acc += 0.5 * (prev + d) * step;
            prev = d;
            v.push(x);
            cdf.push(acc);
        }
        Self { v, cdf }
    }

    fn sample(&self, rng: &mut StdRng) -> f64 {
        let total = self.cdf[self.cdf.len() - 1];
        let u = rng.gen_range(0.0..total);
        let i = self.cdf.partition_point(|&c| c < u).clamp(1, self.cdf.len() - 1);
        let (c0, c1) = (self.cdf[i - 1], self.cdf[i]);
        let t = if c1 > c0 { (u - c0) / (c1 - c0) } else { 0.0 };
        self.v[i - 1] + t * (self.v[i] - self.v[i - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn truth(mip: bool) -> ModelParameters {
        let mut v = vec![5000.0, 8.0, 140.0, 0.0, 5.0, 5000.0, 0.15, 140.0, 15.0, 0.05];
        if mip {
            v.extend_from_slice(&[20_000.0, 1000.0, 30.0, 40.0]);
        }
        ModelParameters::new(v).unwrap()
    }

    fn spec(events: usize, mip: bool) -> SimulationSpec {
        SimulationSpec {
            events,
            channels: 2,
            seed: 7,
            truth: truth(mip),
            neighbors: 4,
            channel_prefix: "ch".to_string(),
        }
    }

    #[test]
    fn generation_is_deterministic_per_seed() {
        let a = generate_samples(&spec(500, true)).unwrap();
        let b = generate_samples(&spec(500, true)).unwrap();
        assert_eq!(a.columns, b.columns);
        assert_eq!(a.channels, vec!["ch0".to_string(), "ch1".to_string()]);
        assert_ne!(a.columns[0], a.columns[1]);
    }

    #[test]
    fn channel_seeds_are_fixed_values() {
        assert_eq!(channel_seed(0, 0), 0xe220_a839_7b1d_cdaf);
        assert_eq!(channel_seed(42, 1), 0x28ef_e333_b266_f103);
        assert_ne!(channel_seed(42, 0), channel_seed(42, 1));
    }

    #[test]
    fn cascade_sizes_follow_crosstalk_weights() {
        let sampler = CascadeSampler::new(0.0, 0.05, 4).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let n = 200_000;
        let mut counts = [0usize; 4];
        for _ in 0..n {
            let k = sampler.sample(&mut rng);
            if k < 4 {
                counts[k] += 1;
            }
        }
        let w = CrosstalkTable::new(4).weights(0.05);
        for k in 1..4 {
            let observed = counts[k] as f64 / n as f64;
            let sigma = (w[k] * (1.0 - w[k]) / n as f64).sqrt();
            assert!((observed - w[k]).abs() < 5.0 * sigma + 1e-4, "k={k} observed={observed} expected={}", w[k]);
        }
    }

    #[test]
    fn landau_sampler_median_is_plausible() {
        // Median of the standard Landau distribution truncated at v = 200 is about 1.345.
        let sampler = LandauSampler::new();
        let mut rng = StdRng::seed_from_u64(3);
        let mut draws: Vec<f64> = (0..200_001).map(|_| sampler.sample(&mut rng)).collect();
        draws.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let median = draws[draws.len() / 2];
        assert!((median - 1.345).abs() < 0.05, "median={median}");
    }

    #[test]
    fn events_for_truth_reproduces_pedestal_height() {
        let t = truth(false);
        let events = events_for_truth(&t, 4, 2.0);
        let areas = component_areas(&t, 4);
        let pedestal_events = events as f64 * areas[0] / areas.iter().sum::<f64>();
        // Peak height in counts per 2-unit bin: N·2/(σ√2π).
        let height = pedestal_events * 2.0 / (8.0 * SQRT_2PI);
        assert!((height - 5000.0).abs() < 1.0, "height={height}");
    }

    #[test]
    fn reference_truth_is_valid() {
        for mip in [false, true] {
            let t = reference_truth(mip).unwrap();
            assert!(t.validate().is_ok());
            assert_eq!(t.has_mip(), mip);
        }
    }

    #[test]
    fn rejects_invalid_truth() {
        let mut s = spec(10, false);
        s.truth.set(ParamIndex::Crosstalk, 1.5);
        assert!(generate_samples(&s).is_err());
    }
}

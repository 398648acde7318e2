//! Poisson ⊗ crosstalk: effective amplitude of each visible peak.
//!
//! With `m` primary photoelectrons, each independently growing into a cascade of
//! `i` cells with probability `cp[i]`, the number of fired cells has generating
//! function `G(z)^m` where `G(z) = Σ cp[i] zⁱ`. Averaging over the Poisson
//! distribution of `m`:
//!
//! ```text
//! sc[k] = [zᵏ] Σ_m s[m] · G(z)^m
//! ```
//!
//! Everything is truncated at order 15. Since `cp[0] = 0`, `G(z)^m` starts at
//! `zᵐ` and truncation never drops a contribution to an order <= 15.

use crate::models::crosstalk::{CrosstalkTable, TABLE_LEN};
use crate::models::poisson::poisson_weights;

/// Truncated product of two power series.
fn series_mul(a: &[f64; TABLE_LEN], b: &[f64; TABLE_LEN]) -> [f64; TABLE_LEN] {
    let mut out = [0.0; TABLE_LEN];
    for (k, slot) in out.iter_mut().enumerate() {
        let mut acc = 0.0;
        for j in 0..=k {
            acc += a[j] * b[k - j];
        }
        *slot = acc;
    }
    out
}

/// Peak amplitude weights `sc[0..=15]` (`sc[0]` is left at 0).
pub fn peak_amplitudes(s: &[f64; TABLE_LEN], cp: &[f64; TABLE_LEN]) -> [f64; TABLE_LEN] {
    let mut sc = [0.0; TABLE_LEN];
    let mut power = [0.0; TABLE_LEN];
    power[0] = 1.0;
    for m in 1..TABLE_LEN {
        power = series_mul(&power, cp);
        for k in m..TABLE_LEN {
            sc[k] += s[m] * power[k];
        }
    }
    sc
}

/// All per-order weights for one parameter set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakOrderWeights {
    /// Poisson probabilities `s[k]`.
    pub poisson: [f64; TABLE_LEN],
    /// Cascade size probabilities `cp[k]`.
    pub crosstalk: [f64; TABLE_LEN],
    /// Effective peak amplitudes `sc[k]`.
    pub amplitudes: [f64; TABLE_LEN],
}

impl PeakOrderWeights {
    pub fn compute(table: &CrosstalkTable, mean_pe: f64, crosstalk: f64) -> Self {
        let poisson = poisson_weights(mean_pe);
        let crosstalk = table.weights(crosstalk);
        let amplitudes = peak_amplitudes(&poisson, &crosstalk);
        Self {
            poisson,
            crosstalk,
            amplitudes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights(lambda: f64, p: f64) -> PeakOrderWeights {
        PeakOrderWeights::compute(&CrosstalkTable::default(), lambda, p)
    }

    /// Sum over every ordered composition of `k` into `m` positive parts.
    fn brute_force(s: &[f64; TABLE_LEN], cp: &[f64; TABLE_LEN], k: usize) -> f64 {
        // Compositions of k correspond to subsets of the k-1 gaps between units.
        let mut total = 0.0;
        for mask in 0u32..(1u32 << (k - 1)) {
            let mut parts = Vec::new();
            let mut run = 1usize;
            for gap in 0..(k - 1) {
                if mask & (1 << gap) != 0 {
                    parts.push(run);
                    run = 1;
                } else {
                    run += 1;
                }
            }
            parts.push(run);
            let prod: f64 = parts.iter().map(|&i| cp[i]).product();
            total += s[parts.len()] * prod;
        }
        total
    }

    #[test]
    fn first_order_is_exact_product() {
        for &(lambda, p) in &[(0.15, 0.05), (0.8, 0.3), (0.01, 0.0), (2.0, 0.2)] {
            let w = weights(lambda, p);
            assert_eq!(w.amplitudes[1], w.poisson[1] * w.crosstalk[1]);
        }
    }

    #[test]
    fn matches_composition_enumeration_through_order_15() {
        let w = weights(0.6, 0.12);
        for k in 1..TABLE_LEN {
            let expected = brute_force(&w.poisson, &w.crosstalk, k);
            let got = w.amplitudes[k];
            let scale = expected.abs().max(1e-300);
            assert!((got - expected).abs() / scale < 1e-10, "k={k}: {got} vs {expected}");
        }
    }

    #[test]
    fn matches_reference_low_order_expressions() {
        let w = weights(0.35, 0.08);
        let (s, cp) = (&w.poisson, &w.crosstalk);
        let sc2 = s[1] * cp[2] + s[2] * cp[1].powi(2);
        let sc3 = 2.0 * s[2] * cp[1] * cp[2] + s[3] * cp[1].powi(3) + s[1] * cp[3];
        let sc4 = 3.0 * s[3] * cp[1].powi(2) * cp[2]
            + 2.0 * s[2] * cp[1] * cp[3]
            + s[4] * cp[1].powi(4)
            + s[2] * cp[2].powi(2)
            + s[1] * cp[4];
        let sc5 = 3.0 * s[3] * cp[1].powi(2) * cp[3]
            + 2.0 * s[2] * cp[1] * cp[4]
            + 3.0 * s[3] * cp[1] * cp[2].powi(2)
            + s[1] * cp[5]
            + 2.0 * s[2] * cp[2] * cp[3]
            + 4.0 * s[4] * cp[1].powi(3) * cp[2]
            + s[5] * cp[1].powi(5);
        for (k, expected) in [(2, sc2), (3, sc3), (4, sc4), (5, sc5)] {
            let got = w.amplitudes[k];
            assert!((got - expected).abs() <= 1e-12 * expected.abs(), "k={k}: {got} vs {expected}");
        }
    }

    #[test]
    fn no_crosstalk_reduces_to_poisson() {
        let w = weights(0.4, 0.0);
        for k in 1..TABLE_LEN {
            assert!((w.amplitudes[k] - w.poisson[k]).abs() < 1e-15);
        }
    }

    #[test]
    fn total_visible_mass_matches_poisson_for_weak_crosstalk() {
        // With little crosstalk and a small mean, almost nothing spills past order 15.
        let w = weights(0.15, 0.05);
        let visible: f64 = w.amplitudes[1..].iter().sum();
        let expected = 1.0 - w.poisson[0];
        assert!((visible - expected).abs() < 1e-6);
    }
}

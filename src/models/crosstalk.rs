//! Optical crosstalk cascade.
//!
//! A fired pixel can trigger each of its `n` neighbors with probability `p`, and
//! every triggered pixel can in turn trigger its own neighbors. The number of
//! cells fired by one primary is the total size of a Galton–Watson tree with
//! `Binomial(n, p)` offspring, whose distribution is
//!
//! ```text
//! P(k) = CPn[k] · p^(k-1) · (1-p)^(k·n - (k-1))
//! CPn[k] = C(k·n, k-1) / k        (Fuss–Catalan numbers)
//! ```
//!
//! `CPn` depends only on `n`, so it is tabulated once per model.

use crate::math::binomial;

/// Highest photoelectron order carried by the model.
pub const MAX_ORDER: usize = 15;
/// Length of every per-order table (index 0 included).
pub const TABLE_LEN: usize = MAX_ORDER + 1;
/// Neighbor count of a square pixel grid.
pub const DEFAULT_NEIGHBORS: u32 = 4;

/// Immutable table of cascade multiplicities `CPn[0..=15]` (`CPn[0] = 0`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrosstalkTable {
    neighbors: u32,
    coefficients: [f64; TABLE_LEN],
}

impl CrosstalkTable {
    pub fn new(neighbors: u32) -> Self {
        let n = u64::from(neighbors);
        let mut coefficients = [0.0; TABLE_LEN];
        for (k, c) in coefficients.iter_mut().enumerate().skip(1) {
            let k = k as u64;
            *c = binomial(k * n, k - 1) / k as f64;
        }
        Self {
            neighbors,
            coefficients,
        }
    }

    pub fn neighbors(&self) -> u32 {
        self.neighbors
    }

    pub fn coefficients(&self) -> &[f64; TABLE_LEN] {
        &self.coefficients
    }

    /// Probability that one primary ends up firing exactly `k` cells, for k = 1..=15.
    ///
    /// Entry 0 is always 0. Not renormalized: for large `p` the mass beyond
    /// order 15 is simply lost.
    pub fn weights(&self, p: f64) -> [f64; TABLE_LEN] {
        let n = self.neighbors as i32;
        let q = 1.0 - p;
        let mut out = [0.0; TABLE_LEN];
        for (k, w) in out.iter_mut().enumerate().skip(1) {
            let k = k as i32;
            *w = self.coefficients[k as usize] * p.powi(k - 1) * q.powi(k * n - (k - 1));
        }
        out
    }
}

impl Default for CrosstalkTable {
    fn default() -> Self {
        Self::new(DEFAULT_NEIGHBORS)
    }
}

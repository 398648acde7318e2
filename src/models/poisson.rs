//! Poisson photoelectron statistics.

use crate::models::crosstalk::TABLE_LEN;

/// `Poisson(k; λ)` for k = 0..=15, built by the recurrence `s[k] = s[k-1]·λ/k`.
///
/// `λ = 0` gives `s[0] = 1` and zero for every k >= 1.
pub fn poisson_weights(lambda: f64) -> [f64; TABLE_LEN] {
    let mut s = [0.0; TABLE_LEN];
    s[0] = (-lambda).exp();
    for k in 1..TABLE_LEN {
        s[k] = s[k - 1] * lambda / k as f64;
    }
    s
}

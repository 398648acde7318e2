//! Special functions used by the spectrum model.
//!
//! - `gaussian`: unnormalized Gaussian shape `exp(-0.5 ((x - mean) / sigma)^2)`
//! - `landau_density`: standard Landau density via the CERNLIB `DENLAN` rational
//!   approximations (peak near -0.2228, unit area)
//! - `binomial`: binomial coefficient as `f64`

/// Location of the standard Landau density maximum.
pub const LANDAU_PEAK_OFFSET: f64 = -0.22278298;

/// `1 / sqrt(2π)`.
pub const INV_SQRT_2PI: f64 = 0.3989422804014;

/// Unnormalized Gaussian.
///
/// Returns 0 when `sigma <= 0` rather than a delta spike.
#[inline]
pub fn gaussian(x: f64, mean: f64, sigma: f64) -> f64 {
    if sigma <= 0.0 {
        return 0.0;
    }
    let z = (x - mean) / sigma;
    (-0.5 * z * z).exp()
}

const P1: [f64; 5] = [0.4259894875, -0.1249762550, 0.03984243700, -0.006298287635, 0.001511162253];
const Q1: [f64; 5] = [1.0, -0.3388260629, 0.09594393323, -0.01608042283, 0.003778942063];
const P2: [f64; 5] = [0.1788541609, 0.1173957403, 0.01488850518, -0.001394989411, 0.0001283617211];
const Q2: [f64; 5] = [1.0, 0.7428795082, 0.3153932961, 0.06694219548, 0.008790609714];
const P3: [f64; 5] = [0.1788544503, 0.09359161662, 0.006325387654, 0.00006611667319, -0.000002031049101];
const Q3: [f64; 5] = [1.0, 0.6097809921, 0.2560616665, 0.04746722384, 0.006957301675];
const P4: [f64; 5] = [0.9874054407, 118.6723273, 849.2794360, -743.7792444, 427.0262186];
const Q4: [f64; 5] = [1.0, 106.8615961, 337.6496214, 2016.712389, 1597.063511];
const P5: [f64; 5] = [1.003675074, 167.5702434, 4789.711289, 21217.86767, -22324.94910];
const Q5: [f64; 5] = [1.0, 156.9424537, 3745.310488, 9834.698876, 66924.28357];
const P6: [f64; 5] = [1.000827619, 664.9143136, 62972.92665, 475554.6998, -5743609.109];
const Q6: [f64; 5] = [1.0, 651.4101098, 56974.73333, 165917.4725, -2815759.939];
const A1: [f64; 3] = [0.04166666667, -0.01996527778, 0.02709538966];
const A2: [f64; 2] = [-1.845568670, -4.284640743];

#[inline]
fn poly4(c: &[f64; 5], t: f64) -> f64 {
    c[0] + (c[1] + (c[2] + (c[3] + c[4] * t) * t) * t) * t
}

/// Standard Landau probability density at `v` (location 0, scale 1).
pub fn landau_density(v: f64) -> f64 {
    if !v.is_finite() {
        return 0.0;
    }
    if v < -5.5 {
        let u = (v + 1.0).exp();
        if u < 1e-10 {
            return 0.0;
        }
        let ue = (-1.0 / u).exp();
        let us = u.sqrt();
        0.3989422803 * (ue / us) * (1.0 + (A1[0] + (A1[1] + A1[2] * u) * u) * u)
    } else if v < -1.0 {
        let u = (-v - 1.0).exp();
        (-u).exp() * u.sqrt() * poly4(&P1, v) / poly4(&Q1, v)
    } else if v < 1.0 {
        poly4(&P2, v) / poly4(&Q2, v)
    } else if v < 5.0 {
        poly4(&P3, v) / poly4(&Q3, v)
    } else if v < 12.0 {
        let u = 1.0 / v;
        u * u * poly4(&P4, u) / poly4(&Q4, u)
    } else if v < 50.0 {
        let u = 1.0 / v;
        u * u * poly4(&P5, u) / poly4(&Q5, u)
    } else if v < 300.0 {
        let u = 1.0 / v;
        u * u * poly4(&P6, u) / poly4(&Q6, u)
    } else {
        let u = 1.0 / (v - v * v.ln() / (v + 1.0));
        u * u * (1.0 + (A2[0] + A2[1] * u) * u)
    }
}

/// Binomial coefficient `C(n, k)` as a float.
///
/// Exact for every value this crate needs (results stay well below 2^53).
pub fn binomial(n: u64, k: u64) -> f64 {
    if k > n {
        return 0.0;
    }
    let k = k.min(n - k);
    let mut acc = 1.0_f64;
    for i in 0..k {
        acc = acc * (n - i) as f64 / (i + 1) as f64;
    }
    acc.round()
}

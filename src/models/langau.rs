//! Landau ⊗ Gaussian (the MIP energy-loss peak).
//!
//! The convolution is evaluated by a fixed midpoint rule over `x ± 5σ` with 200
//! steps, summed from both window ends inward. The Landau location is shifted by
//! the offset of its maximum so that `mpv` is the true most probable value of
//! the (unsmeared) Landau component.

use crate::math::{INV_SQRT_2PI, LANDAU_PEAK_OFFSET, gaussian, landau_density};

const STEPS: usize = 200;
const SIGMA_WINDOW: f64 = 5.0;

/// Parameters of one Landau⊗Gauss component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandauGauss {
    /// Total area.
    pub area: f64,
    /// Landau most probable value.
    pub mpv: f64,
    /// Landau width (scale).
    pub width: f64,
    /// Gaussian resolution.
    pub sigma: f64,
}

impl LandauGauss {
    pub fn density(&self, x: f64) -> f64 {
        if self.width <= 0.0 || self.sigma <= 0.0 {
            return 0.0;
        }
        let location = self.mpv - LANDAU_PEAK_OFFSET * self.width;
        let lo = x - SIGMA_WINDOW * self.sigma;
        let hi = x + SIGMA_WINDOW * self.sigma;
        let step = (hi - lo) / STEPS as f64;

        let mut sum = 0.0;
        for i in 1..=STEPS / 2 {
            let offset = (i as f64 - 0.5) * step;

            let xx = lo + offset;
            sum += landau_density((xx - location) / self.width) / self.width * gaussian(x, xx, self.sigma);

            let xx = hi - offset;
            sum += landau_density((xx - location) / self.width) / self.width * gaussian(x, xx, self.sigma);
        }

        self.area * step * sum * INV_SQRT_2PI / self.sigma
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn integrate(c: &LandauGauss, lo: f64, hi: f64, n: usize) -> f64 {
        let h = (hi - lo) / n as f64;
        (0..n).map(|i| c.density(lo + (i as f64 + 0.5) * h)).sum::<f64>() * h
    }

    #[test]
    fn area_is_preserved() {
        for &(width, sigma) in &[(30.0, 40.0), (10.0, 5.0), (50.0, 100.0), (5.0, 20.0)] {
            let c = LandauGauss {
                area: 1000.0,
                mpv: 0.0,
                width,
                sigma,
            };
            // The Landau tail decays like 1/x², so the window must reach far to the right.
            let area = integrate(&c, -20.0 * (width + sigma), 400.0 * width, 20_000);
            assert!((area - 1000.0).abs() < 10.0, "width={width} sigma={sigma} area={area}");
        }
    }

    #[test]
    fn peaks_near_mpv_for_narrow_resolution() {
        let c = LandauGauss {
            area: 1.0,
            mpv: 500.0,
            width: 20.0,
            sigma: 1.0,
        };
        let mut best = (f64::NEG_INFINITY, 0.0);
        let mut x = 450.0;
        while x < 550.0 {
            let d = c.density(x);
            if d > best.0 {
                best = (d, x);
            }
            x += 0.1;
        }
        assert!((best.1 - 500.0).abs() < 1.0, "peak at {}", best.1);
    }

    #[test]
    fn non_positive_widths_give_zero() {
        let mut c = LandauGauss {
            area: 1.0,
            mpv: 0.0,
            width: 0.0,
            sigma: 1.0,
        };
        assert_eq!(c.density(0.0), 0.0);
        c.width = 1.0;
        c.sigma = -1.0;
        assert_eq!(c.density(0.0), 0.0);
    }
}

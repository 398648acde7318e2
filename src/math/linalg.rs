//! Small dense linear solves for the non-linear least-squares solver.
//!
//! Each Levenberg–Marquardt iteration solves the damped normal equations
//!
//! ```text
//! (JᵀJ + μ D) δ = -Jᵀr
//! ```
//!
//! over the free parameters only (at most 14 columns). The matrix is symmetric
//! positive definite whenever μ > 0 and D has a positive diagonal, so Cholesky is
//! tried first. When it fails (loss of definiteness through rounding), we fall
//! back to an SVD solve with progressively looser tolerances.

use nalgebra::{DMatrix, DVector};

/// Solve a symmetric positive (semi-)definite system `a x = b`.
///
/// Returns `None` if no finite solution could be obtained.
pub fn solve_symmetric(a: &DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    if let Some(chol) = a.clone().cholesky() {
        let x = chol.solve(b);
        if x.iter().all(|v| v.is_finite()) {
            return Some(x);
        }
    }

    let svd = a.clone().svd(true, true);
    for &tol in &[1e-12, 1e-10, 1e-8, 1e-6] {
        if let Ok(x) = svd.solve(b, tol) {
            if x.iter().all(|v| v.is_finite()) {
                return Some(x);
            }
        }
    }

    None
}

/// Inverse of a symmetric positive (semi-)definite matrix.
///
/// Used to turn `JᵀJ` at the optimum into a covariance estimate. Singular
/// directions are pseudo-inverted so that a degenerate parameter yields a large
/// (rather than NaN) uncertainty on the others.
pub fn symmetric_inverse(a: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if let Some(chol) = a.clone().cholesky() {
        let inv = chol.inverse();
        if inv.iter().all(|v| v.is_finite()) {
            return Some(inv);
        }
    }

    for &tol in &[1e-12, 1e-10, 1e-8] {
        if let Ok(inv) = a.clone().svd(true, true).pseudo_inverse(tol) {
            if inv.iter().all(|v| v.is_finite()) {
                return Some(inv);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solves_spd_system() {
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let b = DVector::from_row_slice(&[1.0, 2.0]);
        let x = solve_symmetric(&a, &b).unwrap();
        assert!((x[0] - 1.0 / 11.0).abs() < 1e-12);
        assert!((x[1] - 7.0 / 11.0).abs() < 1e-12);
    }

    #[test]
    fn singular_system_falls_back_to_svd() {
        // Rank-one matrix; minimum-norm solution of [1 1; 1 1] x = [2, 2] is [1, 1].
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let b = DVector::from_row_slice(&[2.0, 2.0]);
        let x = solve_symmetric(&a, &b).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-9);
        assert!((x[1] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn inverse_of_diagonal() {
        let a = DMatrix::from_diagonal(&DVector::from_row_slice(&[2.0, 4.0, 0.5]));
        let inv = symmetric_inverse(&a).unwrap();
        assert!((inv[(0, 0)] - 0.5).abs() < 1e-12);
        assert!((inv[(1, 1)] - 0.25).abs() < 1e-12);
        assert!((inv[(2, 2)] - 2.0).abs() < 1e-12);
        assert!(inv[(0, 1)].abs() < 1e-12);
    }
}

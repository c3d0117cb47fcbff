//! Dense linear algebra for the regression engine.
//!
//! The model works in ndarray; information matrices are handed to nalgebra
//! for factorisation and the results converted back.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use ndarray::{Array1, Array2};
use statrs::distribution::{ContinuousCDF, Normal};

/// Pivots below this fraction of the largest diagonal entry count as zero
const PIVOT_TOLERANCE: f64 = 1e-10;

/// Cholesky factorisation of a symmetric positive definite matrix
pub struct SpdFactor {
    cholesky: Cholesky<f64, Dyn>,
}

impl SpdFactor {
    /// Factor `a`, or None when it is not numerically positive definite.
    ///
    /// nalgebra accepts any strictly positive pivot; near-singular matrices
    /// are rejected here against the scale of the diagonal.
    pub fn new(a: &Array2<f64>) -> Option<Self> {
        let n = a.nrows();
        if a.ncols() != n || a.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let scale = a.diag().iter().fold(0.0f64, |m, v| m.max(v.abs()));
        if n > 0 && scale == 0.0 {
            return None;
        }

        let matrix = DMatrix::from_fn(n, n, |i, j| a[[i, j]]);
        let cholesky = matrix.cholesky()?;
        let tolerance = PIVOT_TOLERANCE * scale;
        let l = cholesky.l_dirty();
        if (0..n).any(|i| l[(i, i)] * l[(i, i)] <= tolerance) {
            return None;
        }
        Some(Self { cholesky })
    }

    /// Solve A x = b
    pub fn solve(&self, b: &Array1<f64>) -> Array1<f64> {
        let rhs = DVector::from_iterator(b.len(), b.iter().copied());
        let x = self.cholesky.solve(&rhs);
        Array1::from_iter(x.iter().copied())
    }

    pub fn inverse(&self) -> Array2<f64> {
        let inverse = self.cholesky.inverse();
        let n = inverse.nrows();
        Array2::from_shape_fn((n, n), |(i, j)| inverse[(i, j)])
    }
}

/// Standard normal quantile; infinite at the ends of [0, 1]
pub fn normal_quantile(p: f64) -> f64 {
    if !(p > 0.0) {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    match Normal::new(0.0, 1.0) {
        Ok(standard) => standard.inverse_cdf(p),
        Err(_) => f64::NAN,
    }
}

//! Linear algebra helpers for estimation, fusion and trajectory synthesis
//!
//! Everything is dimension-generic (`DVector`/`DMatrix`). Precision matrices and
//! Gaussian densities always go through a Cholesky factor, never a raw inverse.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

pub type Vector = DVector<f64>;
pub type Matrix = DMatrix<f64>;
pub type CholeskyFactor = Cholesky<f64, Dyn>;

/// ln(2π)
pub const LN_2PI: f64 = 1.837_877_066_409_345_5;

const JITTER_BASE: f64 = 1e-10;
const MAX_JITTER_STEPS: usize = 12;

/// Cholesky factor together with the diagonal jitter it took to obtain it.
#[derive(Clone, Debug)]
pub struct StableCholesky {
    pub factor: CholeskyFactor,
    pub jitter: f64,
}

impl StableCholesky {
    pub fn was_regularized(&self) -> bool {
        self.jitter > 0.0
    }
}

/// Average with the transpose to remove round-off asymmetry
pub fn symmetrize(matrix: &Matrix) -> Matrix {
    0.5 * (matrix + matrix.transpose())
}

/// Factor a symmetric matrix, escalating diagonal jitter by decades until it is
/// positive definite. Returns `None` only if every jitter level fails (NaN input).
pub fn stable_cholesky(matrix: &Matrix) -> Option<StableCholesky> {
    let sym = symmetrize(matrix);
    if let Some(factor) = definite_factor(sym.clone()) {
        return Some(StableCholesky { factor, jitter: 0.0 });
    }

    let n = sym.nrows();
    let scale = if n > 0 {
        (sym.diagonal().iter().map(|d| d.abs()).sum::<f64>() / n as f64).max(1.0)
    } else {
        1.0
    };

    let mut jitter = scale * JITTER_BASE;
    for _ in 0..MAX_JITTER_STEPS {
        let candidate = &sym + Matrix::identity(n, n) * jitter;
        if let Some(factor) = definite_factor(candidate) {
            return Some(StableCholesky { factor, jitter });
        }
        jitter *= 10.0;
    }
    None
}

// nalgebra accepts a zero pivot, which would later divide by zero
fn definite_factor(matrix: Matrix) -> Option<CholeskyFactor> {
    matrix
        .cholesky()
        .filter(|c| c.l_dirty().diagonal().iter().all(|d| d.is_finite() && *d > 0.0))
}

/// ln|Σ| from the Cholesky factor of Σ
pub fn log_det(factor: &CholeskyFactor) -> f64 {
    2.0 * factor.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>()
}

/// Log density of N(mean, Σ) at `x`, with Σ given by its factor and log-determinant.
pub fn log_gaussian_pdf(x: &Vector, mean: &Vector, factor: &CholeskyFactor, log_det: f64) -> f64 {
    let diff = x - mean;
    let mahalanobis = diff.dot(&factor.solve(&diff));
    -0.5 * (x.len() as f64 * LN_2PI + log_det + mahalanobis)
}

/// Σ⁻¹ through the Cholesky factor
pub fn precision(factor: &CholeskyFactor) -> Matrix {
    symmetrize(&factor.inverse())
}

/// λ_min / λ_max of a symmetric matrix. Zero when not positive definite.
pub fn reciprocal_condition(matrix: &Matrix) -> f64 {
    let eigenvalues = symmetrize(matrix).symmetric_eigenvalues();
    let max = eigenvalues.max();
    let min = eigenvalues.min();
    if max <= 0.0 || min <= 0.0 {
        0.0
    } else {
        min / max
    }
}

/// Block-diagonal repetition `I_blocks ⊗ A`, used to extend a positional linear
/// map onto stacked derivative blocks.
pub fn repeat_block(matrix: &Matrix, blocks: usize) -> Matrix {
    Matrix::identity(blocks, blocks).kronecker(matrix)
}

/// Unbiased sample covariance (N-1 normalization, N for a single sample).
pub fn sample_covariance(samples: &[&Vector], mean: &Vector) -> Matrix {
    let dim = mean.len();
    let mut cov = Matrix::zeros(dim, dim);
    for sample in samples {
        let diff = *sample - mean;
        cov += &diff * diff.transpose();
    }
    let denom = if samples.len() > 1 {
        (samples.len() - 1) as f64
    } else {
        1.0
    };
    cov / denom
}

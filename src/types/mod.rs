pub mod linalg;

pub use linalg::*;

use ndarray::{Array2, ArrayView2};

use crate::error::{Result, TpGmmError};

/// Fewest timesteps for which a derivative can be estimated
pub const MIN_DEMONSTRATION_LEN: usize = 2;

/// One demonstrated trajectory: T rows of D-dimensional positions.
///
/// Owned by the caller; the pipeline only reads it.
#[derive(Clone, Debug, PartialEq)]
pub struct Demonstration {
    positions: Array2<f64>,
}

impl Demonstration {
    pub fn new(positions: Array2<f64>) -> Result<Self> {
        let (len, dim) = positions.dim();
        if len < MIN_DEMONSTRATION_LEN {
            return Err(TpGmmError::DemonstrationTooShort {
                required: MIN_DEMONSTRATION_LEN,
                actual: len,
            });
        }
        if dim == 0 {
            return Err(TpGmmError::dimension("demonstration", 1, 0));
        }
        if positions.iter().any(|v| !v.is_finite()) {
            return Err(TpGmmError::InvalidConfig(
                "demonstration contains non-finite values".to_string(),
            ));
        }
        Ok(Self { positions })
    }

    /// Build from row-major point lists, e.g. `[[x0, y0], [x1, y1], ...]`.
    pub fn from_points(points: &[Vec<f64>]) -> Result<Self> {
        let dim = points.first().map_or(0, |p| p.len());
        if let Some(bad) = points.iter().find(|p| p.len() != dim) {
            return Err(TpGmmError::dimension("demonstration point", dim, bad.len()));
        }
        let flat: Vec<f64> = points.iter().flatten().copied().collect();
        let positions = Array2::from_shape_vec((points.len(), dim), flat)
            .map_err(|e| TpGmmError::InvalidConfig(format!("Failed to build demonstration: {e}")))?;
        Self::new(positions)
    }

    pub fn len(&self) -> usize {
        self.positions.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.nrows() == 0
    }

    pub fn dim(&self) -> usize {
        self.positions.ncols()
    }

    pub fn positions(&self) -> ArrayView2<'_, f64> {
        self.positions.view()
    }

    pub fn position(&self, t: usize) -> Vector {
        Vector::from_iterator(self.dim(), self.positions.row(t).iter().copied())
    }

    pub fn start(&self) -> Vector {
        self.position(0)
    }

    pub fn end(&self) -> Vector {
        self.position(self.len() - 1)
    }

    /// All positions as nalgebra vectors, one per timestep.
    pub fn to_vectors(&self) -> Vec<Vector> {
        (0..self.len()).map(|t| self.position(t)).collect()
    }
}

/// Stack equal-length vectors as the rows of an `Array2`.
pub fn vectors_to_array2(rows: &[Vector]) -> Array2<f64> {
    let cols = rows.first().map_or(0, |r| r.len());
    Array2::from_shape_fn((rows.len(), cols), |(i, j)| rows[i][j])
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TpGmmError};
use crate::types::Matrix;

/// Width factor of the radial basis, applied on normalized time [0, 1]
const RBF_WIDTH: f64 = 1e2;

/// Family of functions a control sequence is projected onto.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BasisKind {
    Piecewise,
    Rbf,
    Bernstein,
    Fourier,
}

impl FromStr for BasisKind {
    type Err = TpGmmError;

    /// Case-insensitive. `PIECEWEISE` is accepted for older configuration records.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PIECEWISE" | "PIECEWEISE" => Ok(BasisKind::Piecewise),
            "RBF" => Ok(BasisKind::Rbf),
            "BERNSTEIN" => Ok(BasisKind::Bernstein),
            "FOURIER" => Ok(BasisKind::Fourier),
            _ => Err(TpGmmError::InvalidBasis(s.to_string())),
        }
    }
}

impl TryFrom<String> for BasisKind {
    type Error = TpGmmError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BasisKind> for String {
    fn from(kind: BasisKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for BasisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BasisKind::Piecewise => "PIECEWISE",
            BasisKind::Rbf => "RBF",
            BasisKind::Bernstein => "BERNSTEIN",
            BasisKind::Fourier => "FOURIER",
        };
        f.write_str(name)
    }
}

impl BasisKind {
    /// `steps × count` matrix φ with `φ[t, c]` the value of function `c` at step `t`.
    pub fn build(&self, steps: usize, count: usize) -> Result<Matrix> {
        if count == 0 || steps == 0 {
            return Err(TpGmmError::InvalidConfig(format!(
                "basis needs at least one step and one function, got {} x {}",
                steps, count
            )));
        }
        if count > steps {
            return Err(TpGmmError::InvalidConfig(format!(
                "{} basis functions exceed the {}-step control horizon",
                count, steps
            )));
        }

        let phi = match self {
            // Blocks differ in length by at most one step, none is empty
            BasisKind::Piecewise => {
                Matrix::from_fn(steps, count, |t, c| if t * count / steps == c { 1.0 } else { 0.0 })
            }
            BasisKind::Rbf => {
                let centers = linspace(count);
                let times = linspace(steps);
                Matrix::from_fn(steps, count, |t, c| {
                    (-RBF_WIDTH * (times[t] - centers[c]).powi(2)).exp()
                })
            }
            BasisKind::Bernstein => {
                let times = linspace(steps);
                let degree = count - 1;
                Matrix::from_fn(steps, count, |t, c| {
                    let s = times[t];
                    binomial(degree, c) * s.powi(c as i32) * (1.0 - s).powi((degree - c) as i32)
                })
            }
            BasisKind::Fourier => {
                let times = linspace(steps);
                Matrix::from_fn(steps, count, |t, c| {
                    (std::f64::consts::PI * c as f64 * times[t]).cos()
                })
            }
        };
        Ok(phi)
    }
}

/// Ψ = φ ⊗ I_dof: maps stacked basis weights onto a stacked control sequence.
pub fn control_basis(kind: BasisKind, steps: usize, count: usize, dof: usize) -> Result<Matrix> {
    Ok(kind.build(steps, count)?.kronecker(&Matrix::identity(dof, dof)))
}

/// `n` evenly spaced points on [0, 1]
fn linspace(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![0.0];
    }
    (0..n).map(|i| i as f64 / (n - 1) as f64).collect()
}

fn binomial(n: usize, k: usize) -> f64 {
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

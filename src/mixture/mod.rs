//! Sequential Gaussian mixture (HMM with full-covariance Gaussian emissions)
//!
//! Holds the fitted model and the operations other stages need from it:
//! slicing onto one frame's block, pushing through an affine map, and scoring
//! observation sequences.

pub mod estimation;
pub mod viterbi;

pub use estimation::{fit, FitReport};
pub use viterbi::{decode, StatePath};

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::diagnostics::{DegeneracyStage, Diagnostic, Diagnostics};
use crate::error::{Result, TpGmmError};
use crate::frames::FrameTransform;
use crate::types::{
    log_det, log_gaussian_pdf, stable_cholesky, symmetrize, CholeskyFactor, Matrix, Vector,
};

/// Tolerance on probability vectors summing to one
const PROBABILITY_TOLERANCE: f64 = 1e-6;

/// A single Gaussian: mean and full covariance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawComponent")]
pub struct GaussianComponent {
    pub mean: Vector,
    pub covariance: Matrix,
}

impl GaussianComponent {
    pub fn new(mean: Vector, covariance: Matrix) -> Result<Self> {
        if covariance.nrows() != mean.len() || covariance.ncols() != mean.len() {
            return Err(TpGmmError::dimension(
                "component covariance",
                mean.len(),
                covariance.nrows(),
            ));
        }
        Ok(Self { mean, covariance })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Marginal over dimensions `start..start + len`. Exact for a Gaussian.
    pub fn marginal(&self, start: usize, len: usize) -> GaussianComponent {
        GaussianComponent {
            mean: self.mean.rows(start, len).into_owned(),
            covariance: self.covariance.view((start, start), (len, len)).into_owned(),
        }
    }

    /// Push through `x ↦ A x + b`: mean `A μ + b`, covariance `A Σ Aᵗ`.
    pub fn linear_transform(&self, transform: &FrameTransform) -> GaussianComponent {
        GaussianComponent {
            mean: transform.apply(&self.mean),
            covariance: symmetrize(&(&transform.a * &self.covariance * transform.a.transpose())),
        }
    }
}

#[derive(Deserialize)]
struct RawComponent {
    mean: Vector,
    covariance: Matrix,
}

impl TryFrom<RawComponent> for GaussianComponent {
    type Error = TpGmmError;

    fn try_from(raw: RawComponent) -> Result<Self> {
        Self::new(raw.mean, raw.covariance)
    }
}

/// Cholesky factor and log-determinant of one component's covariance
#[derive(Clone, Debug)]
pub(crate) struct PreparedComponent {
    pub factor: CholeskyFactor,
    pub log_det: f64,
}

/// K-state sequential mixture over the multi-frame observation space.
///
/// Immutable once fitted, so one instance can back any number of concurrent
/// fusion/generation requests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMixtureModel")]
pub struct MixtureModel {
    priors: Vector,
    initial: Vector,
    transition: Matrix,
    components: Vec<GaussianComponent>,
}

/// Serialized form, checked through `MixtureModel::new` on the way in
#[derive(Deserialize)]
struct RawMixtureModel {
    priors: Vector,
    initial: Vector,
    transition: Matrix,
    components: Vec<GaussianComponent>,
}

impl TryFrom<RawMixtureModel> for MixtureModel {
    type Error = TpGmmError;

    fn try_from(raw: RawMixtureModel) -> Result<Self> {
        Self::new(raw.priors, raw.initial, raw.transition, raw.components)
    }
}

impl MixtureModel {
    pub fn new(
        priors: Vector,
        initial: Vector,
        transition: Matrix,
        components: Vec<GaussianComponent>,
    ) -> Result<Self> {
        let k = components.len();
        if k == 0 {
            return Err(TpGmmError::NoStates);
        }
        let dim = components[0].dim();
        if let Some(bad) = components.iter().find(|c| c.dim() != dim) {
            return Err(TpGmmError::dimension("mixture component", dim, bad.dim()));
        }
        if priors.len() != k {
            return Err(TpGmmError::dimension("mixture priors", k, priors.len()));
        }
        if initial.len() != k {
            return Err(TpGmmError::dimension("initial probabilities", k, initial.len()));
        }
        if transition.nrows() != k || transition.ncols() != k {
            return Err(TpGmmError::dimension("transition matrix", k, transition.nrows()));
        }
        check_distribution("mixture priors", priors.iter())?;
        check_distribution("initial probabilities", initial.iter())?;
        for row in transition.row_iter() {
            check_distribution("transition row", row.iter())?;
        }
        Ok(Self {
            priors,
            initial,
            transition,
            components,
        })
    }

    pub fn num_states(&self) -> usize {
        self.components.len()
    }

    pub fn dim(&self) -> usize {
        self.components[0].dim()
    }

    pub fn priors(&self) -> &Vector {
        &self.priors
    }

    pub fn initial_probabilities(&self) -> &Vector {
        &self.initial
    }

    pub fn transition(&self) -> &Matrix {
        &self.transition
    }

    pub fn components(&self) -> &[GaussianComponent] {
        &self.components
    }

    pub fn means(&self) -> Vec<&Vector> {
        self.components.iter().map(|c| &c.mean).collect()
    }

    pub fn covariances(&self) -> Vec<&Matrix> {
        self.components.iter().map(|c| &c.covariance).collect()
    }

    /// Restrict every component to the dimensions in `range`. Priors and the
    /// transition structure carry over unchanged.
    pub fn marginal_model(&self, range: Range<usize>) -> Result<MixtureModel> {
        if range.start >= range.end || range.end > self.dim() {
            return Err(TpGmmError::dimension("marginal range end", self.dim(), range.end));
        }
        let len = range.end - range.start;
        Ok(MixtureModel {
            priors: self.priors.clone(),
            initial: self.initial.clone(),
            transition: self.transition.clone(),
            components: self
                .components
                .iter()
                .map(|c| c.marginal(range.start, len))
                .collect(),
        })
    }

    /// Apply the same affine map to every component.
    pub fn linear_transform(&self, transform: &FrameTransform) -> Result<MixtureModel> {
        if transform.a.ncols() != self.dim() {
            return Err(TpGmmError::dimension("transform input", self.dim(), transform.a.ncols()));
        }
        Ok(MixtureModel {
            priors: self.priors.clone(),
            initial: self.initial.clone(),
            transition: self.transition.clone(),
            components: self
                .components
                .iter()
                .map(|c| c.linear_transform(transform))
                .collect(),
        })
    }

    /// Log-likelihood of an observation sequence under the sequential model
    /// (scaled forward recursion). Covariances that need jitter to factor are
    /// reported into `diagnostics`.
    pub fn log_likelihood(&self, samples: &[Vector], diagnostics: &mut Diagnostics) -> Result<f64> {
        self.check_samples(samples)?;
        let prepared = self.prepare(DegeneracyStage::Estimation, diagnostics)?;
        let log_b = log_emission_table(&self.components, &prepared, samples);
        Ok(estimation::forward_backward(&log_b, &self.initial, &self.transition).log_likelihood)
    }

    pub(crate) fn check_samples(&self, samples: &[Vector]) -> Result<()> {
        if samples.is_empty() {
            return Err(TpGmmError::DemonstrationTooShort {
                required: 1,
                actual: 0,
            });
        }
        if let Some(bad) = samples.iter().find(|s| s.len() != self.dim()) {
            return Err(TpGmmError::dimension("observation", self.dim(), bad.len()));
        }
        Ok(())
    }

    /// Factor every covariance, repairing and reporting near-singular ones.
    pub(crate) fn prepare(
        &self,
        stage: DegeneracyStage,
        diagnostics: &mut Diagnostics,
    ) -> Result<Vec<PreparedComponent>> {
        self.components
            .iter()
            .enumerate()
            .map(|(k, component)| {
                let chol = stable_cholesky(&component.covariance).ok_or_else(|| {
                    TpGmmError::Numerical(format!("covariance of state {} cannot be factored", k))
                })?;
                if chol.was_regularized() {
                    diagnostics.push(Diagnostic::NumericalDegeneracy {
                        stage,
                        component: k,
                        jitter: chol.jitter,
                    });
                }
                let log_det = log_det(&chol.factor);
                Ok(PreparedComponent {
                    factor: chol.factor,
                    log_det,
                })
            })
            .collect()
    }
}

fn check_distribution<'a>(what: &str, values: impl Iterator<Item = &'a f64>) -> Result<()> {
    let mut sum = 0.0;
    for &v in values {
        if !(v >= 0.0) {
            return Err(TpGmmError::InvalidConfig(format!("{} contain a negative entry", what)));
        }
        sum += v;
    }
    if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
        return Err(TpGmmError::InvalidConfig(format!(
            "{} sum to {} instead of 1",
            what, sum
        )));
    }
    Ok(())
}

/// `table[t][k]` = log N(x_t; μ_k, Σ_k)
pub(crate) fn log_emission_table(
    components: &[GaussianComponent],
    prepared: &[PreparedComponent],
    samples: &[Vector],
) -> Vec<Vec<f64>> {
    samples
        .iter()
        .map(|x| {
            components
                .iter()
                .zip(prepared)
                .map(|(c, p)| log_gaussian_pdf(x, &c.mean, &p.factor, p.log_det))
                .collect()
        })
        .collect()
}

//! Product-of-Gaussians fusion across task frames
//!
//! Each frame's block of the mixture is mapped back to world coordinates, then the
//! per-frame Gaussians of one state are multiplied:
//!
//! ```text
//! Λ = Σ_p Σ_p⁻¹        μ = Λ⁻¹ Σ_p Σ_p⁻¹ μ_p        Σ = Λ⁻¹
//! ```
//!
//! All inverses go through Cholesky factors.

use serde::{Deserialize, Serialize};

use crate::config::TpGmmConfig;
use crate::diagnostics::{DegeneracyStage, Diagnostic, Diagnostics};
use crate::error::{Result, TpGmmError};
use crate::frames::{TaskParameters, AUGMENTED_ORDERS};
use crate::mixture::{GaussianComponent, MixtureModel, StatePath};
use crate::types::{precision, reciprocal_condition, stable_cholesky, symmetrize, Matrix, Vector};

/// Mixture in world coordinates over one frame's augmented state (2·D).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FusedModel {
    model: MixtureModel,
    diagnostics: Diagnostics,
}

impl FusedModel {
    pub fn model(&self) -> &MixtureModel {
        &self.model
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn dim(&self) -> usize {
        self.model.dim()
    }

    pub fn num_states(&self) -> usize {
        self.model.num_states()
    }

    pub fn means(&self) -> Vec<&Vector> {
        self.model.means()
    }

    pub fn covariances(&self) -> Vec<&Matrix> {
        self.model.covariances()
    }

    pub fn component(&self, state: usize) -> &GaussianComponent {
        &self.model.components()[state]
    }
}

/// Multiply Gaussian densities over the same variable.
pub fn product_of_gaussians(parts: &[GaussianComponent]) -> Result<GaussianComponent> {
    product(parts, 0, &mut Diagnostics::new())
}

fn product(
    parts: &[GaussianComponent],
    component: usize,
    diagnostics: &mut Diagnostics,
) -> Result<GaussianComponent> {
    let dim = match parts.first() {
        Some(first) => first.dim(),
        None => {
            return Err(TpGmmError::InvalidConfig(
                "product of zero Gaussians".to_string(),
            ))
        }
    };

    let mut lambda = Matrix::zeros(dim, dim);
    let mut eta = Vector::zeros(dim);
    for part in parts {
        if part.dim() != dim {
            return Err(TpGmmError::dimension("product operand", dim, part.dim()));
        }
        let chol = stable_cholesky(&part.covariance).ok_or_else(|| {
            TpGmmError::Numerical(format!("marginal covariance of state {} cannot be factored", component))
        })?;
        if chol.was_regularized() {
            diagnostics.push(Diagnostic::NumericalDegeneracy {
                stage: DegeneracyStage::Marginal,
                component,
                jitter: chol.jitter,
            });
        }
        let part_precision = precision(&chol.factor);
        eta += &part_precision * &part.mean;
        lambda += part_precision;
    }

    let fused = stable_cholesky(&lambda).ok_or_else(|| {
        TpGmmError::Numerical(format!("fused precision of state {} cannot be factored", component))
    })?;
    if fused.was_regularized() {
        diagnostics.push(Diagnostic::NumericalDegeneracy {
            stage: DegeneracyStage::Fusion,
            component,
            jitter: fused.jitter,
        });
    }

    let mean = fused.factor.solve(&eta);
    let covariance = precision(&fused.factor);
    GaussianComponent::new(mean, covariance)
}

/// Fuse every state of `model` across the frames of `params`, using each frame's
/// transform at `timestep`.
pub fn fuse(
    model: &MixtureModel,
    params: &TaskParameters,
    timestep: usize,
    config: &TpGmmConfig,
) -> Result<FusedModel> {
    let block_dim = params.dim() * AUGMENTED_ORDERS;
    let expected = block_dim * params.num_frames();
    if model.dim() != expected {
        return Err(TpGmmError::dimension("model for task parameters", expected, model.dim()));
    }

    let mut diagnostics = Diagnostics::new();

    // Per-frame marginals mapped back to world coordinates
    let world_views = params
        .frames()
        .iter()
        .enumerate()
        .map(|(p, frame)| {
            let transform = frame.transform_at(timestep).augmented(AUGMENTED_ORDERS);
            model
                .marginal_model(p * block_dim..(p + 1) * block_dim)?
                .linear_transform(&transform)
        })
        .collect::<Result<Vec<MixtureModel>>>()?;

    let mut components = Vec::with_capacity(model.num_states());
    for state in 0..model.num_states() {
        let parts: Vec<GaussianComponent> = world_views
            .iter()
            .map(|view| view.components()[state].clone())
            .collect();
        let mut fused = product(&parts, state, &mut diagnostics)?;

        if reciprocal_condition(&fused.covariance) < config.degeneracy_threshold {
            let jitter = config.regularization.max(config.degeneracy_threshold);
            fused.covariance = symmetrize(&fused.covariance) + Matrix::identity(block_dim, block_dim) * jitter;
            diagnostics.push(Diagnostic::NumericalDegeneracy {
                stage: DegeneracyStage::Fusion,
                component: state,
                jitter,
            });
        }
        components.push(fused);
    }

    let model = MixtureModel::new(
        model.priors().clone(),
        model.initial_probabilities().clone(),
        model.transition().clone(),
        components,
    )?;
    Ok(FusedModel { model, diagnostics })
}

/// Per-timestep mean and covariance to be tracked.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDistribution {
    means: Vec<Vector>,
    covariances: Vec<Matrix>,
}

impl ReferenceDistribution {
    pub fn new(means: Vec<Vector>, covariances: Vec<Matrix>) -> Result<Self> {
        if means.is_empty() {
            return Err(TpGmmError::DemonstrationTooShort {
                required: 1,
                actual: 0,
            });
        }
        if means.len() != covariances.len() {
            return Err(TpGmmError::HorizonMismatch {
                requested: covariances.len(),
                reference: means.len(),
            });
        }
        let dim = means[0].len();
        if let Some(bad) = means.iter().find(|m| m.len() != dim) {
            return Err(TpGmmError::dimension("reference mean", dim, bad.len()));
        }
        if let Some(bad) = covariances.iter().find(|c| c.nrows() != dim || c.ncols() != dim) {
            return Err(TpGmmError::dimension("reference covariance", dim, bad.nrows()));
        }
        Ok(Self { means, covariances })
    }

    /// Step `t` takes the fused component of `path[t]`.
    pub fn from_path(fused: &FusedModel, path: &StatePath) -> Result<Self> {
        let k = fused.num_states();
        if let Some(&bad) = path.states().iter().find(|&&s| s >= k) {
            return Err(TpGmmError::InvalidConfig(format!(
                "state path visits state {} of a {}-state model",
                bad, k
            )));
        }
        let means = path
            .states()
            .iter()
            .map(|&s| fused.component(s).mean.clone())
            .collect();
        let covariances = path
            .states()
            .iter()
            .map(|&s| fused.component(s).covariance.clone())
            .collect();
        Self::new(means, covariances)
    }

    pub fn len(&self) -> usize {
        self.means.len()
    }

    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.means[0].len()
    }

    pub fn means(&self) -> &[Vector] {
        &self.means
    }

    pub fn covariances(&self) -> &[Matrix] {
        &self.covariances
    }
}

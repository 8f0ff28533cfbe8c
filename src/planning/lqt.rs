//! Batch linear-quadratic tracking
//!
//! Minimizes Σ_t (x_t - μ_t)ᵀ Q_t (x_t - μ_t) + uᵀ R u over the whole horizon at once
//! through the lifted dynamics. With a control basis Ψ the unknowns are basis
//! weights w, u = Ψ w:
//!
//! ```text
//! (Wᵀ Q W + r ΨᵀΨ) w = Wᵀ Q (μ - Sx x₀),    W = Su Ψ
//! ```

use ndarray::Array2;

use super::basis::control_basis;
use super::dynamics::IntegratorDynamics;
use crate::config::TpGmmConfig;
use crate::diagnostics::{DegeneracyStage, Diagnostic, Diagnostics};
use crate::error::{Result, TpGmmError};
use crate::fusion::ReferenceDistribution;
use crate::types::{precision, stable_cholesky, symmetrize, vectors_to_array2, Matrix, Vector};

/// Target means and tracking precisions, one pair per timestep, in the state space
/// of the dynamics.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackingReference {
    means: Vec<Vector>,
    precisions: Vec<Matrix>,
    diagnostics: Diagnostics,
}

impl TrackingReference {
    pub fn new(means: Vec<Vector>, precisions: Vec<Matrix>) -> Result<Self> {
        if means.len() != precisions.len() {
            return Err(TpGmmError::HorizonMismatch {
                requested: precisions.len(),
                reference: means.len(),
            });
        }
        let dim = means.first().map_or(0, |m| m.len());
        if dim == 0 {
            return Err(TpGmmError::InvalidConfig("empty tracking reference".to_string()));
        }
        if let Some(bad) = means.iter().find(|m| m.len() != dim) {
            return Err(TpGmmError::dimension("tracking mean", dim, bad.len()));
        }
        if let Some(bad) = precisions.iter().find(|q| q.nrows() != dim || q.ncols() != dim) {
            return Err(TpGmmError::dimension("tracking precision", dim, bad.nrows()));
        }
        Ok(Self {
            means,
            precisions,
            diagnostics: Diagnostics::new(),
        })
    }

    /// Track the leading `state_dim` dimensions of a reference distribution, weighting
    /// each step by the inverse of its covariance.
    pub fn from_distribution(reference: &ReferenceDistribution, state_dim: usize) -> Result<Self> {
        if state_dim == 0 || state_dim > reference.dim() {
            return Err(TpGmmError::dimension("tracked state", reference.dim(), state_dim));
        }

        let mut diagnostics = Diagnostics::new();
        let mut precisions = Vec::with_capacity(reference.len());
        for (t, covariance) in reference.covariances().iter().enumerate() {
            let block = covariance.view((0, 0), (state_dim, state_dim)).into_owned();
            let chol = stable_cholesky(&block).ok_or_else(|| {
                TpGmmError::Numerical(format!("reference covariance at step {} cannot be factored", t))
            })?;
            if chol.was_regularized() {
                diagnostics.push(Diagnostic::NumericalDegeneracy {
                    stage: DegeneracyStage::Tracking,
                    component: t,
                    jitter: chol.jitter,
                });
            }
            precisions.push(precision(&chol.factor));
        }
        let means = reference
            .means()
            .iter()
            .map(|m| m.rows(0, state_dim).into_owned())
            .collect();

        let mut tracking = Self::new(means, precisions)?;
        tracking.diagnostics = diagnostics;
        Ok(tracking)
    }

    /// Pass through `via_points` spread evenly over `horizon` steps, the last one at
    /// the final step. Each via point constrains the leading dimensions it supplies
    /// with precision `weight`; every other step is left free.
    pub fn from_via_points(
        via_points: &[Vector],
        horizon: usize,
        state_dim: usize,
        weight: f64,
    ) -> Result<Self> {
        if via_points.is_empty() {
            return Err(TpGmmError::InvalidConfig("no via points given".to_string()));
        }
        if via_points.len() >= horizon {
            return Err(TpGmmError::HorizonMismatch {
                requested: horizon,
                reference: via_points.len() + 1,
            });
        }
        if let Some(bad) = via_points.iter().find(|v| v.is_empty() || v.len() > state_dim) {
            return Err(TpGmmError::dimension("via point", state_dim, bad.len()));
        }
        if !(weight > 0.0) {
            return Err(TpGmmError::InvalidConfig(format!(
                "via-point precision must be positive, got {}",
                weight
            )));
        }

        let mut means = vec![Vector::zeros(state_dim); horizon];
        let mut precisions = vec![Matrix::zeros(state_dim, state_dim); horizon];
        for (t, point) in via_point_steps(via_points.len(), horizon)
            .into_iter()
            .zip(via_points)
        {
            means[t].rows_mut(0, point.len()).copy_from(point);
            for d in 0..point.len() {
                precisions[t][(d, d)] = weight;
            }
        }
        Self::new(means, precisions)
    }

    pub fn len(&self) -> usize {
        self.means.len()
    }

    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }

    pub fn state_dim(&self) -> usize {
        self.means[0].len()
    }

    pub fn means(&self) -> &[Vector] {
        &self.means
    }

    pub fn precisions(&self) -> &[Matrix] {
        &self.precisions
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }
}

/// Timesteps of `count` via points evenly spread after step 0, ending at `horizon - 1`.
pub fn via_point_steps(count: usize, horizon: usize) -> Vec<usize> {
    (1..=count)
        .map(|i| ((i * (horizon - 1)) as f64 / count as f64).round() as usize)
        .collect()
}

/// Optimal state and control sequences.
#[derive(Clone, Debug, PartialEq)]
pub struct Trajectory {
    states: Vec<Vector>,
    controls: Vec<Vector>,
    /// Basis weights, one vector of length dof per function. Empty for full-horizon solves.
    weights: Vec<Vector>,
    dof: usize,
    diagnostics: Diagnostics,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn states(&self) -> &[Vector] {
        &self.states
    }

    pub fn controls(&self) -> &[Vector] {
        &self.controls
    }

    pub fn weights(&self) -> &[Vector] {
        &self.weights
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn position(&self, t: usize) -> Vector {
        self.states[t].rows(0, self.dof).into_owned()
    }

    pub fn positions(&self) -> Vec<Vector> {
        (0..self.len()).map(|t| self.position(t)).collect()
    }

    /// T × (dof · order)
    pub fn states_array(&self) -> Array2<f64> {
        vectors_to_array2(&self.states)
    }

    /// T × dof
    pub fn positions_array(&self) -> Array2<f64> {
        vectors_to_array2(&self.positions())
    }

    /// (T-1) × dof
    pub fn controls_array(&self) -> Array2<f64> {
        vectors_to_array2(&self.controls)
    }
}

/// Solve the tracking problem over `horizon` states from `initial_state`.
///
/// `config.basis` selects the basis-compressed solve, `None` the full-horizon one.
pub fn track(
    reference: &TrackingReference,
    initial_state: &Vector,
    horizon: usize,
    config: &TpGmmConfig,
) -> Result<Trajectory> {
    config.validate()?;
    if horizon != reference.len() {
        return Err(TpGmmError::HorizonMismatch {
            requested: horizon,
            reference: reference.len(),
        });
    }
    let state_dim = reference.state_dim();
    if state_dim % config.num_derivatives != 0 {
        return Err(TpGmmError::InvalidConfig(format!(
            "a {}-dimensional state cannot hold {} derivative orders",
            state_dim, config.num_derivatives
        )));
    }
    if initial_state.len() != state_dim {
        return Err(TpGmmError::dimension("initial state", state_dim, initial_state.len()));
    }

    let dof = state_dim / config.num_derivatives;
    let dynamics = IntegratorDynamics::new(dof, config.num_derivatives, config.time_step)?;
    let lifted = dynamics.lift(horizon)?;
    let control_len = dof * (horizon - 1);

    let psi = match config.basis {
        Some(kind) => Some(control_basis(kind, horizon - 1, config.num_basis_functions, dof)?),
        None => None,
    };
    let unknowns = psi.as_ref().map_or(control_len, |p| p.ncols());

    // Normal equations, accumulated per timestep so Q never needs a dense nT × nT form
    let mut hessian = Matrix::zeros(unknowns, unknowns);
    let mut gradient = Vector::zeros(unknowns);
    for t in 0..lifted.horizon() {
        let su_t = lifted.su_block(t);
        let w_t = match &psi {
            Some(psi) => su_t * psi,
            None => su_t,
        };
        let q_t = &reference.precisions()[t];
        let residual = &reference.means()[t] - lifted.free_response(t, initial_state);
        let wq = w_t.transpose() * q_t;
        hessian += &wq * &w_t;
        gradient += wq * residual;
    }
    let effort = match &psi {
        Some(psi) => psi.transpose() * psi,
        None => Matrix::identity(control_len, control_len),
    };
    hessian += effort * config.control_cost;

    let mut diagnostics = reference.diagnostics().clone();
    let solution = solve_normal_equations(symmetrize(&hessian), &gradient, &mut diagnostics)?;

    let controls_stacked = match &psi {
        Some(psi) => psi * &solution,
        None => solution.clone(),
    };
    let states_stacked = &lifted.sx * initial_state + &lifted.su * &controls_stacked;

    let states = (0..horizon)
        .map(|t| states_stacked.rows(t * state_dim, state_dim).into_owned())
        .collect();
    let controls = (0..horizon - 1)
        .map(|t| controls_stacked.rows(t * dof, dof).into_owned())
        .collect();
    let weights = if psi.is_some() {
        (0..config.num_basis_functions)
            .map(|c| solution.rows(c * dof, dof).into_owned())
            .collect()
    } else {
        Vec::new()
    };

    Ok(Trajectory {
        states,
        controls,
        weights,
        dof,
        diagnostics,
    })
}

/// Smallest accepted squared ratio between Cholesky pivots
const PIVOT_RATIO: f64 = 1e-12;

/// Cholesky when the system is clearly positive definite. A semidefinite system
/// (zero control cost, unconstrained steps) takes the minimum-norm least-squares
/// solution instead.
fn solve_normal_equations(
    hessian: Matrix,
    gradient: &Vector,
    diagnostics: &mut Diagnostics,
) -> Result<Vector> {
    if let Some(chol) = hessian.clone().cholesky() {
        let pivots = chol.l_dirty().diagonal();
        let (min, max) = (pivots.min(), pivots.max());
        if min > 0.0 && min * min >= PIVOT_RATIO * max * max {
            return Ok(chol.solve(gradient));
        }
    }

    log::debug!("[LQT] normal equations not positive definite, using least squares");
    let svd = hessian.svd(true, true);
    let cutoff = svd.singular_values.max() * PIVOT_RATIO;
    let solution = svd
        .solve(gradient, cutoff)
        .map_err(|e| TpGmmError::Numerical(format!("tracking normal equations: {}", e)))?;
    if solution.iter().any(|v| !v.is_finite()) {
        return Err(TpGmmError::Numerical(
            "tracking normal equations produced non-finite controls".to_string(),
        ));
    }
    diagnostics.push(Diagnostic::NumericalDegeneracy {
        stage: DegeneracyStage::Tracking,
        component: 0,
        jitter: 0.0,
    });
    Ok(solution)
}

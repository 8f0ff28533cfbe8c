use serde::{Deserialize, Serialize};

use crate::error::{Result, TpGmmError};
use crate::planning::basis::BasisKind;

// ─── Configuration ───────────────────────────────────────────────────────────

/// One immutable record per training/generation call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TpGmmConfig {
    // ── Mixture ──
    pub num_states: usize,
    pub regularization: f64,
    pub init_regularization: f64,
    pub max_iterations: usize,
    /// `None` runs the full iteration budget.
    pub convergence_tolerance: Option<f64>,

    // ── Demonstration preprocessing ──
    pub time_step: f64,

    // ── Trajectory synthesis ──
    pub num_derivatives: usize,
    /// `None` solves over the full horizon.
    pub basis: Option<BasisKind>,
    pub num_basis_functions: usize,
    pub control_cost: f64,

    // ── Numerical health ──
    /// Reciprocal condition number below which a fused covariance is reported.
    pub degeneracy_threshold: f64,
}

impl Default for TpGmmConfig {
    fn default() -> Self {
        Self {
            num_states: 4,
            regularization: 1e-3,
            init_regularization: 1e-8,
            max_iterations: 40,
            convergence_tolerance: None,
            time_step: 0.01,
            num_derivatives: 2,
            basis: None,
            num_basis_functions: 9,
            control_cost: 1e-4,
            degeneracy_threshold: 1e-12,
        }
    }
}

impl TpGmmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_states == 0 {
            return Err(TpGmmError::NoStates);
        }
        if !(self.time_step > 0.0) {
            return Err(TpGmmError::InvalidConfig(format!(
                "time_step must be positive, got {}",
                self.time_step
            )));
        }
        if !(self.regularization >= 0.0) || !(self.init_regularization >= 0.0) {
            return Err(TpGmmError::InvalidConfig(
                "regularization must be non-negative".to_string(),
            ));
        }
        if !(1..=2).contains(&self.num_derivatives) {
            return Err(TpGmmError::InvalidConfig(format!(
                "num_derivatives must be 1 or 2, got {}",
                self.num_derivatives
            )));
        }
        if self.basis.is_some() && self.num_basis_functions == 0 {
            return Err(TpGmmError::InvalidConfig(
                "num_basis_functions must be positive".to_string(),
            ));
        }
        if !(self.control_cost >= 0.0) {
            return Err(TpGmmError::InvalidConfig(format!(
                "control_cost must be non-negative, got {}",
                self.control_cost
            )));
        }
        if self.max_iterations == 0 {
            return Err(TpGmmError::InvalidConfig(
                "max_iterations must be positive".to_string(),
            ));
        }
        if let Some(tol) = self.convergence_tolerance {
            if !(tol > 0.0) {
                return Err(TpGmmError::InvalidConfig(format!(
                    "convergence_tolerance must be positive, got {}",
                    tol
                )));
            }
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration record. Missing fields take defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| TpGmmError::InvalidConfig(e.to_string()))?;

        // Surface a bad basis name as its own error rather than a generic parse failure
        if let Some(name) = value.get("basis").and_then(|b| b.as_str()) {
            name.parse::<BasisKind>()?;
        }

        let config: Self =
            serde_json::from_value(value).map_err(|e| TpGmmError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Position/derivative state size for `dof` positional degrees of freedom.
    pub fn state_dim(&self, dof: usize) -> usize {
        dof * self.num_derivatives
    }
}

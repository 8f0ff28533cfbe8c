use crate::error::{Result, TpGmmError};
use crate::types::{Matrix, Vector};

/// Discrete integrator chain over `dof` positional coordinates.
///
/// State layout is `[x; ẋ]` (or just `[x]`), control is the highest derivative.
///
/// ```text
/// order 1:  A = I          B = dt·I
/// order 2:  A = [I dt·I]   B = [dt²/2·I]
///               [0   I ]       [  dt·I ]
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct IntegratorDynamics {
    pub a: Matrix,
    pub b: Matrix,
    dof: usize,
    order: usize,
}

/// Whole-horizon response: `x = Sx x₀ + Su u`, with states and controls stacked in time.
#[derive(Clone, Debug)]
pub struct LiftedDynamics {
    pub sx: Matrix,
    pub su: Matrix,
    horizon: usize,
    state_dim: usize,
}

impl IntegratorDynamics {
    pub fn new(dof: usize, order: usize, dt: f64) -> Result<Self> {
        if dof == 0 {
            return Err(TpGmmError::dimension("dynamics degrees of freedom", 1, 0));
        }
        if !(1..=2).contains(&order) {
            return Err(TpGmmError::InvalidConfig(format!(
                "integrator order must be 1 or 2, got {}",
                order
            )));
        }
        if !(dt > 0.0) {
            return Err(TpGmmError::InvalidConfig(format!("time step must be positive, got {}", dt)));
        }

        let n = dof * order;
        let eye = Matrix::identity(dof, dof);
        let mut a = Matrix::identity(n, n);
        let mut b = Matrix::zeros(n, dof);
        if order == 2 {
            a.view_mut((0, dof), (dof, dof)).copy_from(&(&eye * dt));
            b.view_mut((0, 0), (dof, dof)).copy_from(&(&eye * (dt * dt / 2.0)));
            b.view_mut((dof, 0), (dof, dof)).copy_from(&(&eye * dt));
        } else {
            b.copy_from(&(&eye * dt));
        }

        Ok(Self { a, b, dof, order })
    }

    pub fn dof(&self) -> usize {
        self.dof
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn state_dim(&self) -> usize {
        self.dof * self.order
    }

    /// One step: `A x + B u`
    pub fn step(&self, x: &Vector, u: &Vector) -> Vector {
        &self.a * x + &self.b * u
    }

    /// Build `Sx` (nT × n) and `Su` (nT × m(T-1)) for a horizon of `horizon` states.
    ///
    /// Block row t of `Su` holds `A^{t-1-s} B` in column block s for s < t.
    pub fn lift(&self, horizon: usize) -> Result<LiftedDynamics> {
        if horizon < 2 {
            return Err(TpGmmError::DemonstrationTooShort {
                required: 2,
                actual: horizon,
            });
        }
        let n = self.state_dim();
        let m = self.dof;
        let mut sx = Matrix::zeros(n * horizon, n);
        let mut su = Matrix::zeros(n * horizon, m * (horizon - 1));

        let mut a_pow = Matrix::identity(n, n);
        for t in 0..horizon {
            sx.view_mut((t * n, 0), (n, n)).copy_from(&a_pow);
            a_pow = &self.a * a_pow;
        }

        // Column block s starts with B at row block s+1, then A B, A² B, ...
        let mut propagated = self.b.clone();
        for lag in 0..horizon - 1 {
            for s in 0..horizon - 1 - lag {
                let t = s + 1 + lag;
                su.view_mut((t * n, s * m), (n, m)).copy_from(&propagated);
            }
            propagated = &self.a * propagated;
        }

        Ok(LiftedDynamics {
            sx,
            su,
            horizon,
            state_dim: n,
        })
    }
}

impl LiftedDynamics {
    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn state_dim(&self) -> usize {
        self.state_dim
    }

    /// Rows of `Su` belonging to state `t`
    pub fn su_block(&self, t: usize) -> Matrix {
        self.su.rows(t * self.state_dim, self.state_dim).into_owned()
    }

    /// Free response `A^t x₀`
    pub fn free_response(&self, t: usize, x0: &Vector) -> Vector {
        self.sx.rows(t * self.state_dim, self.state_dim) * x0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_double_integrator_matrices() {
        let dynamics = IntegratorDynamics::new(1, 2, 0.1).unwrap();
        assert_eq!(dynamics.a, Matrix::from_row_slice(2, 2, &[1.0, 0.1, 0.0, 1.0]));
        assert_relative_eq!(dynamics.b, Matrix::from_row_slice(2, 1, &[0.005, 0.1]), epsilon = 1e-15);
    }

    #[test]
    fn test_lifted_matches_rollout() {
        let dynamics = IntegratorDynamics::new(2, 2, 0.05).unwrap();
        let horizon = 6;
        let lifted = dynamics.lift(horizon).unwrap();

        let x0 = Vector::from_vec(vec![0.3, -1.0, 0.5, 0.2]);
        let controls: Vec<Vector> = (0..horizon - 1)
            .map(|t| Vector::from_vec(vec![t as f64, 1.0 - t as f64]))
            .collect();
        let mut stacked = Vector::zeros(2 * (horizon - 1));
        for (t, u) in controls.iter().enumerate() {
            stacked.rows_mut(2 * t, 2).copy_from(u);
        }

        let batch = &lifted.sx * &x0 + &lifted.su * &stacked;
        let mut x = x0.clone();
        for t in 0..horizon {
            assert_relative_eq!(batch.rows(4 * t, 4).into_owned(), x, epsilon = 1e-12);
            if t + 1 < horizon {
                x = dynamics.step(&x, &controls[t]);
            }
        }
    }

    #[test]
    fn test_invalid_order_rejected() {
        assert!(IntegratorDynamics::new(2, 3, 0.01).is_err());
        assert!(IntegratorDynamics::new(2, 1, 0.0).is_err());
    }
}

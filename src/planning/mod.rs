//! Trajectory synthesis: integrator dynamics, control bases and batch LQT
pub mod basis;
pub mod dynamics;
pub mod lqt;

pub use basis::{control_basis, BasisKind};
pub use dynamics::{IntegratorDynamics, LiftedDynamics};
pub use lqt::{track, via_point_steps, TrackingReference, Trajectory};

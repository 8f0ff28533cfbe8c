//! Task-parameterized Gaussian mixture learning and LQT trajectory synthesis.
//!
//! Demonstrations are seen from several task frames at once, a sequential Gaussian
//! mixture is fitted on the stacked views, and new trajectories are produced by
//! fusing the per-frame views under new frames and tracking the result with a
//! batch linear-quadratic controller.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod frames;
pub mod fusion;
pub mod mixture;
pub mod planning;
pub mod tpgmm;
pub mod types;

pub use config::TpGmmConfig;
pub use diagnostics::{DegeneracyStage, Diagnostic, Diagnostics};
pub use error::{Result, TpGmmError};
pub use frames::{FrameSchedule, FrameTransform, MultiFrameObservation, TaskFrame, TaskParameters};
pub use fusion::{fuse, product_of_gaussians, FusedModel, ReferenceDistribution};
pub use mixture::{decode, fit, FitReport, GaussianComponent, MixtureModel, StatePath};
pub use planning::{track, BasisKind, IntegratorDynamics, TrackingReference, Trajectory};
pub use tpgmm::{BimanualTpGmm, FittedBimanualTpGmm, FittedTpGmm, Generation, TpGmm};
pub use types::{Demonstration, Matrix, Vector};

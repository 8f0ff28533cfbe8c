//! Task frames and multi-frame observations
//!
//! A task frame is an affine map `x_world = A x_local + b` attached to a landmark of
//! the task (start pose, end pose, an object). Demonstrations are projected into
//! every frame's local coordinates and concatenated so the mixture sees the motion
//! from all frames at once.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TpGmmError};
use crate::types::{repeat_block, Demonstration, Matrix, Vector};

/// Number of stacked blocks in an augmented state (position, velocity)
pub const AUGMENTED_ORDERS: usize = 2;

/// Affine map from frame-local to world coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFrameTransform")]
pub struct FrameTransform {
    pub a: Matrix,
    pub b: Vector,
}

#[derive(Deserialize)]
struct RawFrameTransform {
    a: Matrix,
    b: Vector,
}

impl TryFrom<RawFrameTransform> for FrameTransform {
    type Error = TpGmmError;

    fn try_from(raw: RawFrameTransform) -> Result<Self> {
        Self::new(raw.a, raw.b)
    }
}

impl FrameTransform {
    pub fn new(a: Matrix, b: Vector) -> Result<Self> {
        if a.nrows() != a.ncols() {
            return Err(TpGmmError::dimension("frame linear part columns", a.nrows(), a.ncols()));
        }
        if a.nrows() != b.len() {
            return Err(TpGmmError::dimension("frame offset", a.nrows(), b.len()));
        }
        Ok(Self { a, b })
    }

    pub fn identity(dim: usize) -> Self {
        Self {
            a: Matrix::identity(dim, dim),
            b: Vector::zeros(dim),
        }
    }

    pub fn translation(b: Vector) -> Self {
        let dim = b.len();
        Self {
            a: Matrix::identity(dim, dim),
            b,
        }
    }

    pub fn dim(&self) -> usize {
        self.b.len()
    }

    /// Extend onto `orders` stacked derivative blocks: `A' = I ⊗ A`, `b' = [b; 0; ...]`.
    /// Derivatives are not translated.
    pub fn augmented(&self, orders: usize) -> FrameTransform {
        let dim = self.dim();
        let mut b = Vector::zeros(dim * orders);
        b.rows_mut(0, dim).copy_from(&self.b);
        FrameTransform {
            a: repeat_block(&self.a, orders),
            b,
        }
    }

    /// `A x + b`
    pub fn apply(&self, x: &Vector) -> Vector {
        &self.a * x + &self.b
    }

    /// `A⁻¹ (x - b)` via an LU solve
    pub fn to_local(&self, x: &Vector) -> Option<Vector> {
        self.a.clone().lu().solve(&(x - &self.b))
    }

    fn is_invertible(&self) -> bool {
        self.a.clone().lu().is_invertible()
    }
}

/// How a frame evolves over a demonstration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FrameSchedule {
    Constant(FrameTransform),
    PerTimestep(Vec<FrameTransform>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTaskFrame")]
pub struct TaskFrame {
    name: String,
    schedule: FrameSchedule,
}

// Deserialized frames go through the same checks as constructed ones
#[derive(Deserialize)]
struct RawTaskFrame {
    name: String,
    schedule: FrameSchedule,
}

impl TryFrom<RawTaskFrame> for TaskFrame {
    type Error = TpGmmError;

    fn try_from(raw: RawTaskFrame) -> Result<Self> {
        match raw.schedule {
            FrameSchedule::Constant(transform) => Self::constant(&raw.name, transform),
            FrameSchedule::PerTimestep(transforms) => Self::per_timestep(&raw.name, transforms),
        }
    }
}

impl TaskFrame {
    pub fn constant(name: &str, transform: FrameTransform) -> Result<Self> {
        if !transform.is_invertible() {
            return Err(TpGmmError::SingularFrame {
                frame: name.to_string(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            schedule: FrameSchedule::Constant(transform),
        })
    }

    pub fn per_timestep(name: &str, transforms: Vec<FrameTransform>) -> Result<Self> {
        let dim = match transforms.first() {
            Some(first) => first.dim(),
            None => {
                return Err(TpGmmError::FrameLengthMismatch {
                    frame: name.to_string(),
                    expected: 1,
                    actual: 0,
                })
            }
        };
        for transform in &transforms {
            if transform.dim() != dim {
                return Err(TpGmmError::dimension("frame schedule", dim, transform.dim()));
            }
            if !transform.is_invertible() {
                return Err(TpGmmError::SingularFrame {
                    frame: name.to_string(),
                });
            }
        }
        Ok(Self {
            name: name.to_string(),
            schedule: FrameSchedule::PerTimestep(transforms),
        })
    }

    /// Frame anchored at `position` with an optional orientation (identity if `None`).
    pub fn from_pose(name: &str, position: Vector, orientation: Option<Matrix>) -> Result<Self> {
        let dim = position.len();
        let a = orientation.unwrap_or_else(|| Matrix::identity(dim, dim));
        Self::constant(name, FrameTransform::new(a, position)?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schedule(&self) -> &FrameSchedule {
        &self.schedule
    }

    pub fn dim(&self) -> usize {
        self.transform_at(0).dim()
    }

    /// Transform in effect at timestep `t`. Constant frames broadcast; a per-timestep
    /// schedule holds its last entry past the end.
    pub fn transform_at(&self, t: usize) -> &FrameTransform {
        match &self.schedule {
            FrameSchedule::Constant(transform) => transform,
            FrameSchedule::PerTimestep(transforms) => &transforms[t.min(transforms.len() - 1)],
        }
    }

    fn check_length(&self, len: usize) -> Result<()> {
        match &self.schedule {
            FrameSchedule::PerTimestep(transforms) if transforms.len() != len => {
                Err(TpGmmError::FrameLengthMismatch {
                    frame: self.name.clone(),
                    expected: len,
                    actual: transforms.len(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Ordered set of P frames describing one task instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTaskParameters")]
pub struct TaskParameters {
    frames: Vec<TaskFrame>,
}

#[derive(Deserialize)]
struct RawTaskParameters {
    frames: Vec<TaskFrame>,
}

impl TryFrom<RawTaskParameters> for TaskParameters {
    type Error = TpGmmError;

    fn try_from(raw: RawTaskParameters) -> Result<Self> {
        Self::new(raw.frames)
    }
}

impl TaskParameters {
    pub fn new(frames: Vec<TaskFrame>) -> Result<Self> {
        let dim = match frames.first() {
            Some(first) => first.dim(),
            None => {
                return Err(TpGmmError::InvalidConfig(
                    "task parameters need at least one frame".to_string(),
                ))
            }
        };
        if let Some(bad) = frames.iter().find(|f| f.dim() != dim) {
            return Err(TpGmmError::dimension(
                &format!("frame '{}'", bad.name()),
                dim,
                bad.dim(),
            ));
        }
        Ok(Self { frames })
    }

    /// "start" and "end" frames at the given poses, identity orientation.
    pub fn from_start_end(start: Vector, end: Vector) -> Result<Self> {
        if start.len() != end.len() {
            return Err(TpGmmError::dimension("end pose", start.len(), end.len()));
        }
        Self::new(vec![
            TaskFrame::from_pose("start", start, None)?,
            TaskFrame::from_pose("end", end, None)?,
        ])
    }

    /// Start/end frames anchored at a demonstration's boundary positions.
    pub fn from_endpoints(demo: &Demonstration) -> Result<Self> {
        Self::from_start_end(demo.start(), demo.end())
    }

    pub fn frames(&self) -> &[TaskFrame] {
        &self.frames
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn dim(&self) -> usize {
        self.frames[0].dim()
    }

    pub fn frame(&self, name: &str) -> Option<&TaskFrame> {
        self.frames.iter().find(|f| f.name() == name)
    }

    /// Check these parameters against a demonstration of `len` steps in `dim` dimensions.
    pub fn validate_for(&self, len: usize, dim: usize) -> Result<()> {
        if self.dim() != dim {
            return Err(TpGmmError::dimension("task frames", dim, self.dim()));
        }
        for frame in &self.frames {
            frame.check_length(len)?;
        }
        Ok(())
    }
}

/// Positions stacked with their finite-difference velocity: `[x_t; ẋ_t]`.
///
/// Centered difference inside, one-sided at the boundaries, all divided by `dt`.
pub fn augment_with_derivative(positions: &[Vector], dt: f64) -> Vec<Vector> {
    let len = positions.len();
    (0..len)
        .map(|t| {
            let dim = positions[t].len();
            let difference = if len < 2 {
                Vector::zeros(dim)
            } else if t == 0 {
                &positions[1] - &positions[0]
            } else if t == len - 1 {
                &positions[t] - &positions[t - 1]
            } else {
                (&positions[t + 1] - &positions[t - 1]) / 2.0
            };
            let velocity = difference / dt;
            let mut state = Vector::zeros(dim * AUGMENTED_ORDERS);
            state.rows_mut(0, dim).copy_from(&positions[t]);
            state.rows_mut(dim, dim).copy_from(&velocity);
            state
        })
        .collect()
}

/// One demonstration seen from all P frames: per timestep, the augmented state in
/// each frame's local coordinates, concatenated in frame order.
#[derive(Clone, Debug, PartialEq)]
pub struct MultiFrameObservation {
    samples: Vec<Vector>,
    block_dim: usize,
    num_frames: usize,
}

impl MultiFrameObservation {
    pub fn samples(&self) -> &[Vector] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Total dimension, `block_dim * num_frames`
    pub fn dim(&self) -> usize {
        self.block_dim * self.num_frames
    }

    pub fn block_dim(&self) -> usize {
        self.block_dim
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    /// Augmented state of timestep `t` in frame `p`
    pub fn block(&self, t: usize, p: usize) -> Vector {
        self.samples[t].rows(p * self.block_dim, self.block_dim).into_owned()
    }
}

/// Project augmented states into every frame of `params`.
pub fn project_to_frames(
    augmented: &[Vector],
    params: &TaskParameters,
) -> Result<MultiFrameObservation> {
    let block_dim = augmented.first().map_or(0, |s| s.len());
    let dim = params.dim();
    if block_dim != dim * AUGMENTED_ORDERS {
        return Err(TpGmmError::dimension(
            "augmented state",
            dim * AUGMENTED_ORDERS,
            block_dim,
        ));
    }
    params.validate_for(augmented.len(), dim)?;

    let num_frames = params.num_frames();
    let mut samples = Vec::with_capacity(augmented.len());
    for (t, state) in augmented.iter().enumerate() {
        let mut sample = Vector::zeros(block_dim * num_frames);
        for (p, frame) in params.frames().iter().enumerate() {
            let local = frame
                .transform_at(t)
                .augmented(AUGMENTED_ORDERS)
                .to_local(state)
                .ok_or_else(|| TpGmmError::SingularFrame {
                    frame: frame.name().to_string(),
                })?;
            sample.rows_mut(p * block_dim, block_dim).copy_from(&local);
        }
        samples.push(sample);
    }

    Ok(MultiFrameObservation {
        samples,
        block_dim,
        num_frames,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn line_positions(len: usize) -> Vec<Vector> {
        (0..len)
            .map(|t| Vector::from_vec(vec![t as f64, 2.0 * t as f64]))
            .collect()
    }

    #[test]
    fn test_derivative_centered_and_one_sided() {
        let positions = vec![
            Vector::from_vec(vec![0.0]),
            Vector::from_vec(vec![1.0]),
            Vector::from_vec(vec![4.0]),
        ];
        let augmented = augment_with_derivative(&positions, 0.5);
        // forward, centered, backward
        assert_relative_eq!(augmented[0][1], 2.0);
        assert_relative_eq!(augmented[1][1], 4.0);
        assert_relative_eq!(augmented[2][1], 6.0);
        assert_relative_eq!(augmented[2][0], 4.0);
    }

    #[test]
    fn test_augmented_transform_keeps_velocity_untranslated() {
        let frame = FrameTransform::new(
            Matrix::from_row_slice(2, 2, &[0.0, -1.0, 1.0, 0.0]),
            Vector::from_vec(vec![1.0, 2.0]),
        )
        .unwrap();
        let big = frame.augmented(2);
        assert_eq!(big.b, Vector::from_vec(vec![1.0, 2.0, 0.0, 0.0]));
        assert_eq!(big.a[(2, 3)], -1.0);
    }

    #[test]
    fn test_local_round_trip_through_rotated_frame() {
        let frame = FrameTransform::new(
            Matrix::from_row_slice(2, 2, &[0.0, -1.0, 1.0, 0.0]),
            Vector::from_vec(vec![3.0, -1.0]),
        )
        .unwrap();
        let x = Vector::from_vec(vec![0.5, 4.0]);
        let local = frame.to_local(&x).unwrap();
        assert_relative_eq!(frame.apply(&local), x, epsilon = 1e-12);
    }

    #[test]
    fn test_multi_frame_dimension() {
        let positions = line_positions(10);
        let demo = Demonstration::from_points(
            &positions
                .iter()
                .map(|p| p.iter().copied().collect::<Vec<f64>>())
                .collect::<Vec<_>>(),
        )
        .unwrap();
        let params = TaskParameters::from_endpoints(&demo).unwrap();
        let augmented = augment_with_derivative(&positions, 0.1);
        let observation = project_to_frames(&augmented, &params).unwrap();

        // 2 * D * P
        assert_eq!(observation.dim(), 2 * 2 * 2);
        assert_eq!(observation.len(), 10);
        // Start frame sees the first point at its origin, end frame the last
        assert_relative_eq!(observation.block(0, 0).rows(0, 2).norm(), 0.0);
        assert_relative_eq!(observation.block(9, 1).rows(0, 2).norm(), 0.0);
        // Velocity identical in both translation-only frames
        assert_relative_eq!(
            observation.block(4, 0).rows(2, 2).into_owned(),
            observation.block(4, 1).rows(2, 2).into_owned()
        );
    }

    #[test]
    fn test_schedule_length_mismatch_is_fatal() {
        let transforms = vec![FrameTransform::identity(2); 5];
        let frame = TaskFrame::per_timestep("moving", transforms).unwrap();
        let params = TaskParameters::new(vec![frame]).unwrap();
        let augmented = augment_with_derivative(&line_positions(8), 0.1);
        let err = project_to_frames(&augmented, &params).unwrap_err();
        assert_eq!(
            err,
            TpGmmError::FrameLengthMismatch {
                frame: "moving".to_string(),
                expected: 8,
                actual: 5
            }
        );
    }

    #[test]
    fn test_per_timestep_frame_follows_schedule() {
        let positions = line_positions(3);
        let transforms: Vec<FrameTransform> = positions
            .iter()
            .map(|p| FrameTransform::translation(p.clone()))
            .collect();
        let params =
            TaskParameters::new(vec![TaskFrame::per_timestep("tracker", transforms).unwrap()])
                .unwrap();
        let augmented = augment_with_derivative(&positions, 1.0);
        let observation = project_to_frames(&augmented, &params).unwrap();
        for t in 0..3 {
            assert_relative_eq!(observation.block(t, 0).rows(0, 2).norm(), 0.0);
        }
    }

    #[test]
    fn test_singular_orientation_rejected() {
        let err = TaskFrame::from_pose(
            "flat",
            Vector::from_vec(vec![0.0, 0.0]),
            Some(Matrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0])),
        )
        .unwrap_err();
        assert_eq!(
            err,
            TpGmmError::SingularFrame {
                frame: "flat".to_string()
            }
        );
    }

    #[test]
    fn test_deserialize_rejects_empty_schedule() {
        let json = r#"{"frames":[{"name":"m","schedule":{"PerTimestep":[]}}]}"#;
        let err = serde_json::from_str::<TaskParameters>(json).unwrap_err();
        assert!(err.to_string().contains("'m'"), "{}", err);
    }

    #[test]
    fn test_deserialize_rejects_frameless_parameters() {
        assert!(serde_json::from_str::<TaskParameters>(r#"{"frames":[]}"#).is_err());
    }

    #[test]
    fn test_deserialize_rejects_singular_frame() {
        let frame = TaskFrame::constant("tilted", FrameTransform::identity(2)).unwrap();
        let mut value = serde_json::to_value(&frame).unwrap();
        let singular = FrameTransform {
            a: Matrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]),
            b: Vector::zeros(2),
        };
        value["schedule"]["Constant"] = serde_json::to_value(&singular).unwrap();
        assert!(serde_json::from_value::<TaskFrame>(value).is_err());
    }

    #[test]
    fn test_serde_round_trip_keeps_parameters() {
        let params = TaskParameters::from_start_end(
            Vector::from_vec(vec![0.0, 1.0]),
            Vector::from_vec(vec![2.0, 3.0]),
        )
        .unwrap();
        let json = serde_json::to_string(&params).unwrap();
        let back: TaskParameters = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
        assert_eq!(back.dim(), 2);
    }
}

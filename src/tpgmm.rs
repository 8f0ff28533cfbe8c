//! Task-parameterized pipeline: demonstrations → multi-frame observations → sequential
//! mixture → per-request fusion, decoding and tracking.

use serde::{Deserialize, Serialize};

use crate::config::TpGmmConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{Result, TpGmmError};
use crate::frames::{
    augment_with_derivative, project_to_frames, MultiFrameObservation, TaskParameters,
    AUGMENTED_ORDERS,
};
use crate::fusion::{fuse, FusedModel, ReferenceDistribution};
use crate::mixture::{decode, fit, FitReport, MixtureModel, StatePath};
use crate::planning::{track, TrackingReference, Trajectory};
use crate::types::{Demonstration, Vector};

/// Frame transforms are read at this step when fusing
const REFERENCE_TIMESTEP: usize = 0;

/// Untrained pipeline holding one immutable configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TpGmm {
    config: TpGmmConfig,
}

/// Everything produced for one reproduction or generation request.
#[derive(Clone, Debug)]
pub struct Generation {
    pub path: StatePath,
    pub fused: FusedModel,
    pub reference: ReferenceDistribution,
    pub trajectory: Trajectory,
}

impl Generation {
    /// Every recoverable condition met while decoding, fusing and tracking, in
    /// pipeline order.
    pub fn diagnostics(&self) -> Diagnostics {
        let mut all = self.path.diagnostics().clone();
        all.extend(self.fused.diagnostics().clone());
        all.extend(self.trajectory.diagnostics().clone());
        all
    }
}

impl TpGmm {
    pub fn new(config: TpGmmConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &TpGmmConfig {
        &self.config
    }

    /// Fit on demonstrations paired one-to-one with their task parameters.
    pub fn fit(
        &self,
        demonstrations: &[Demonstration],
        task_parameters: &[TaskParameters],
    ) -> Result<FittedTpGmm> {
        if demonstrations.is_empty() {
            return Err(TpGmmError::NoDemonstrations);
        }
        if demonstrations.len() != task_parameters.len() {
            return Err(TpGmmError::TaskParameterCount {
                demonstrations: demonstrations.len(),
                parameters: task_parameters.len(),
            });
        }
        let dim = demonstrations[0].dim();
        if let Some(bad) = demonstrations.iter().find(|d| d.dim() != dim) {
            return Err(TpGmmError::dimension("demonstration", dim, bad.dim()));
        }
        let num_frames = task_parameters[0].num_frames();
        if let Some(bad) = task_parameters.iter().find(|p| p.num_frames() != num_frames) {
            return Err(TpGmmError::dimension("task frame count", num_frames, bad.num_frames()));
        }

        let augmented: Vec<Vec<Vector>> = demonstrations
            .iter()
            .map(|demo| augment_with_derivative(&demo.to_vectors(), self.config.time_step))
            .collect();
        let observations = augmented
            .iter()
            .zip(task_parameters)
            .map(|(states, params)| project_to_frames(states, params))
            .collect::<Result<Vec<MultiFrameObservation>>>()?;

        let sequences: Vec<&[Vector]> = observations.iter().map(|o| o.samples()).collect();
        let (model, report) = fit(&sequences, &self.config)?;
        log::info!(
            "[TP-GMM] fitted {} states on {} demonstrations ({} frames, dim {}) in {} iterations",
            model.num_states(),
            demonstrations.len(),
            num_frames,
            model.dim(),
            report.iterations
        );

        Ok(FittedTpGmm {
            config: self.config.clone(),
            model,
            report,
            task_parameters: task_parameters.to_vec(),
            augmented,
            observations,
        })
    }

    /// Fit with "start"/"end" frames anchored at each demonstration's endpoints.
    pub fn fit_from_endpoints(&self, demonstrations: &[Demonstration]) -> Result<FittedTpGmm> {
        let params = demonstrations
            .iter()
            .map(TaskParameters::from_endpoints)
            .collect::<Result<Vec<_>>>()?;
        self.fit(demonstrations, &params)
    }
}

/// Trained pipeline. The mixture is never mutated, so one instance can serve any
/// number of reproduction/generation requests, including concurrently.
#[derive(Clone, Debug)]
pub struct FittedTpGmm {
    config: TpGmmConfig,
    model: MixtureModel,
    report: FitReport,
    task_parameters: Vec<TaskParameters>,
    augmented: Vec<Vec<Vector>>,
    observations: Vec<MultiFrameObservation>,
}

impl FittedTpGmm {
    pub fn model(&self) -> &MixtureModel {
        &self.model
    }

    pub fn report(&self) -> &FitReport {
        &self.report
    }

    pub fn config(&self) -> &TpGmmConfig {
        &self.config
    }

    pub fn num_demonstrations(&self) -> usize {
        self.observations.len()
    }

    pub fn task_parameters(&self, index: usize) -> Result<&TaskParameters> {
        self.check_index(index)?;
        Ok(&self.task_parameters[index])
    }

    pub fn observation(&self, index: usize) -> Result<&MultiFrameObservation> {
        self.check_index(index)?;
        Ok(&self.observations[index])
    }

    /// Viterbi path of demonstration `index` under the fitted model.
    pub fn state_path(&self, index: usize) -> Result<StatePath> {
        decode(&self.model, self.observation(index)?.samples())
    }

    /// Product of the per-frame views of the model under `params`.
    pub fn fuse(&self, params: &TaskParameters) -> Result<FusedModel> {
        fuse(&self.model, params, REFERENCE_TIMESTEP, &self.config)
    }

    /// Regenerate demonstration `index` under its own frames, starting from its
    /// first recorded state.
    pub fn reproduce(&self, index: usize) -> Result<Generation> {
        let params = self.task_parameters(index)?.clone();
        let state_dim = self.tracked_dim();
        let start = self.augmented[index][0].rows(0, state_dim).into_owned();
        self.generate(index, &params, Some(start))
    }

    /// Track the phase structure of demonstration `index` under new task frames.
    ///
    /// Without `initial_state` the trajectory starts at the fused mean of the first
    /// state on the path.
    pub fn generate(
        &self,
        index: usize,
        params: &TaskParameters,
        initial_state: Option<Vector>,
    ) -> Result<Generation> {
        let path = self.state_path(index)?;
        let fused = self.fuse(params)?;
        let reference = ReferenceDistribution::from_path(&fused, &path)?;

        let state_dim = self.tracked_dim();
        let tracking = TrackingReference::from_distribution(&reference, state_dim)?;
        let x0 = match initial_state {
            Some(x0) => x0,
            None => reference.means()[0].rows(0, state_dim).into_owned(),
        };
        let trajectory = track(&tracking, &x0, reference.len(), &self.config)?;

        log::debug!(
            "[TP-GMM] generated {} steps for demonstration {} through segments {:?}",
            trajectory.len(),
            index,
            path.segments()
        );
        Ok(Generation {
            path,
            fused,
            reference,
            trajectory,
        })
    }

    fn tracked_dim(&self) -> usize {
        let dof = self.observations[0].block_dim() / AUGMENTED_ORDERS;
        self.config.state_dim(dof)
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.observations.len() {
            return Err(TpGmmError::DemonstrationIndex {
                index,
                count: self.observations.len(),
            });
        }
        Ok(())
    }
}

/// Two independent pipelines, one per arm, sharing a configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BimanualTpGmm {
    inner: TpGmm,
}

#[derive(Clone, Debug)]
pub struct FittedBimanualTpGmm {
    pub left: FittedTpGmm,
    pub right: FittedTpGmm,
}

impl BimanualTpGmm {
    pub fn new(config: TpGmmConfig) -> Result<Self> {
        Ok(Self {
            inner: TpGmm::new(config)?,
        })
    }

    pub fn config(&self) -> &TpGmmConfig {
        self.inner.config()
    }

    /// Both arms are fitted on the rayon pool.
    pub fn fit(
        &self,
        left: (&[Demonstration], &[TaskParameters]),
        right: (&[Demonstration], &[TaskParameters]),
    ) -> Result<FittedBimanualTpGmm> {
        if left.0.len() != right.0.len() {
            return Err(TpGmmError::dimension(
                "right-arm demonstration count",
                left.0.len(),
                right.0.len(),
            ));
        }
        let (left, right) = rayon::join(
            || self.inner.fit(left.0, left.1),
            || self.inner.fit(right.0, right.1),
        );
        Ok(FittedBimanualTpGmm {
            left: left?,
            right: right?,
        })
    }

    pub fn fit_from_endpoints(
        &self,
        left: &[Demonstration],
        right: &[Demonstration],
    ) -> Result<FittedBimanualTpGmm> {
        let left_params = left
            .iter()
            .map(TaskParameters::from_endpoints)
            .collect::<Result<Vec<_>>>()?;
        let right_params = right
            .iter()
            .map(TaskParameters::from_endpoints)
            .collect::<Result<Vec<_>>>()?;
        self.fit((left, &left_params), (right, &right_params))
    }
}

impl FittedBimanualTpGmm {
    pub fn reproduce(&self, index: usize) -> Result<(Generation, Generation)> {
        Ok((self.left.reproduce(index)?, self.right.reproduce(index)?))
    }

    pub fn generate(
        &self,
        index: usize,
        left: &TaskParameters,
        right: &TaskParameters,
    ) -> Result<(Generation, Generation)> {
        Ok((
            self.left.generate(index, left, None)?,
            self.right.generate(index, right, None)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Quarter arcs of different radii, all from the positive x-axis counterclockwise.
    fn arc_demos(len: usize) -> Vec<Demonstration> {
        [1.0, 1.3, 1.6]
            .iter()
            .map(|radius| {
                let points: Vec<Vec<f64>> = (0..len)
                    .map(|t| {
                        let angle = std::f64::consts::FRAC_PI_2 * t as f64 / (len - 1) as f64;
                        vec![radius * angle.cos(), radius * angle.sin()]
                    })
                    .collect();
                Demonstration::from_points(&points).unwrap()
            })
            .collect()
    }

    fn config() -> TpGmmConfig {
        TpGmmConfig {
            num_states: 3,
            max_iterations: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_fit_model_dimension() {
        let demos = arc_demos(30);
        let fitted = TpGmm::new(config()).unwrap().fit_from_endpoints(&demos).unwrap();
        // 2 frames × (position + velocity) × 2-D
        assert_eq!(fitted.model().dim(), 8);
        assert_eq!(fitted.model().num_states(), 3);
        assert_eq!(fitted.num_demonstrations(), 3);
    }

    #[test]
    fn test_parameter_count_mismatch() {
        let demos = arc_demos(20);
        let params = vec![TaskParameters::from_endpoints(&demos[0]).unwrap()];
        assert_eq!(
            TpGmm::new(config()).unwrap().fit(&demos, &params).unwrap_err(),
            TpGmmError::TaskParameterCount {
                demonstrations: 3,
                parameters: 1
            }
        );
    }

    #[test]
    fn test_reproduce_shapes() {
        let demos = arc_demos(25);
        let fitted = TpGmm::new(config()).unwrap().fit_from_endpoints(&demos).unwrap();
        let generation = fitted.reproduce(1).unwrap();
        assert_eq!(generation.path.len(), 25);
        assert_eq!(generation.fused.dim(), 4);
        assert_eq!(generation.trajectory.len(), 25);
        assert_eq!(generation.trajectory.controls().len(), 24);
        assert_eq!(generation.trajectory.positions_array().dim(), (25, 2));
        assert_eq!(
            generation.diagnostics().len(),
            generation.path.diagnostics().len()
                + generation.fused.diagnostics().len()
                + generation.trajectory.diagnostics().len()
        );
    }

    #[test]
    fn test_out_of_range_demonstration() {
        let demos = arc_demos(20);
        let fitted = TpGmm::new(config()).unwrap().fit_from_endpoints(&demos).unwrap();
        assert!(matches!(
            fitted.reproduce(3),
            Err(TpGmmError::DemonstrationIndex { index: 3, count: 3 })
        ));
    }

    #[test]
    fn test_bimanual_returns_pair() {
        let left = arc_demos(20);
        let right: Vec<Demonstration> = left
            .iter()
            .map(|d| Demonstration::new(d.positions().mapv(|v| -v)).unwrap())
            .collect();
        let fitted = BimanualTpGmm::new(config())
            .unwrap()
            .fit_from_endpoints(&left, &right)
            .unwrap();
        let (l, r) = fitted.reproduce(0).unwrap();
        assert_eq!(l.trajectory.len(), 20);
        assert_eq!(r.trajectory.len(), 20);
        // Mirrored demonstrations start on opposite sides
        assert!(l.trajectory.position(0)[0] > 0.0);
        assert!(r.trajectory.position(0)[0] < 0.0);
    }
}

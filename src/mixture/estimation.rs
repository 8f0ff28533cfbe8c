//! Expectation-Maximization for the sequential mixture
//!
//! k-bins initialization, scaled forward/backward E-step (run per demonstration on
//! the rayon pool, reduced in order), weighted M-step with diagonal regularization.

use rayon::prelude::*;

use super::{log_emission_table, GaussianComponent, MixtureModel, PreparedComponent};
use crate::config::TpGmmConfig;
use crate::diagnostics::{DegeneracyStage, Diagnostic, Diagnostics};
use crate::error::{Result, TpGmmError};
use crate::types::{sample_covariance, symmetrize, Matrix, Vector};

/// Floor applied to initial transition/start probabilities before normalization,
/// so no transition is structurally impossible for EM.
const PROBABILITY_FLOOR: f64 = 1e-4;

/// Responsibility mass under which a state counts as starved
const MIN_STATE_MASS: f64 = 1e-10;

/// Outcome metadata of one fit.
#[derive(Clone, Debug, PartialEq)]
pub struct FitReport {
    pub iterations: usize,
    /// Total log-likelihood before each M-step
    pub log_likelihood: Vec<f64>,
    /// True only when the plateau rule stopped EM early
    pub converged: bool,
    pub diagnostics: Diagnostics,
}

impl FitReport {
    pub fn final_log_likelihood(&self) -> Option<f64> {
        self.log_likelihood.last().copied()
    }
}

/// Posterior statistics of one sequence
#[derive(Clone, Debug)]
pub(crate) struct SequenceStats {
    /// gamma[t][k]: state occupancy posterior
    pub gamma: Vec<Vec<f64>>,
    /// Σ_t xi_t(i, j): expected transition counts
    pub xi_sum: Matrix,
    pub log_likelihood: f64,
}

/// Fit a K-state sequential mixture to pooled observation sequences.
pub fn fit(sequences: &[&[Vector]], config: &TpGmmConfig) -> Result<(MixtureModel, FitReport)> {
    config.validate()?;
    let mut diagnostics = Diagnostics::new();
    let mut model = init_kbins(sequences, config, &mut diagnostics)?;

    let mut trace: Vec<f64> = Vec::with_capacity(config.max_iterations);
    let mut converged = false;
    let mut iterations = 0;

    for iteration in 0..config.max_iterations {
        let prepared = model.prepare(DegeneracyStage::Estimation, &mut diagnostics)?;
        let stats = expectation(&model, &prepared, sequences);
        let log_likelihood: f64 = stats.iter().map(|s| s.log_likelihood).sum();
        if !log_likelihood.is_finite() {
            return Err(TpGmmError::Numerical(format!(
                "log-likelihood became {} at iteration {}",
                log_likelihood, iteration
            )));
        }
        log::debug!("[EM] iteration {} log-likelihood {:.6}", iteration, log_likelihood);

        let delta = trace.last().map(|prev| (log_likelihood - prev).abs());
        trace.push(log_likelihood);
        model = maximization(&model, sequences, &stats, config.regularization, iteration, &mut diagnostics)?;
        iterations = iteration + 1;

        if let (Some(tol), Some(delta)) = (config.convergence_tolerance, delta) {
            if delta < tol {
                converged = true;
                break;
            }
        }
    }

    // The last M-step output has not been factored yet
    model.prepare(DegeneracyStage::Estimation, &mut diagnostics)?;

    let final_ll = trace.last().copied().unwrap_or(f64::NEG_INFINITY);
    diagnostics.push(if converged {
        Diagnostic::Converged {
            iterations,
            log_likelihood: final_ll,
        }
    } else {
        Diagnostic::ConvergenceLimitReached {
            iterations,
            log_likelihood: final_ll,
        }
    });

    Ok((
        model,
        FitReport {
            iterations,
            log_likelihood: trace,
            converged,
            diagnostics,
        },
    ))
}

/// Split each sequence's timeline into K equal-width contiguous bins and seed state
/// k from the pooled samples of bin k. Transitions start left-to-right with a
/// self-transition matching the mean bin length.
pub(crate) fn init_kbins(
    sequences: &[&[Vector]],
    config: &TpGmmConfig,
    diagnostics: &mut Diagnostics,
) -> Result<MixtureModel> {
    let k = config.num_states;
    if sequences.is_empty() {
        return Err(TpGmmError::NoDemonstrations);
    }
    let dim = sequences[0].first().map_or(0, |s| s.len());
    for seq in sequences {
        if seq.len() < k {
            return Err(TpGmmError::TooManyStates {
                states: k,
                required: k,
                actual: seq.len(),
            });
        }
        if let Some(bad) = seq.iter().find(|s| s.len() != dim) {
            return Err(TpGmmError::dimension("observation", dim, bad.len()));
        }
    }

    let mut bins: Vec<Vec<&Vector>> = vec![Vec::new(); k];
    for seq in sequences {
        let len = seq.len();
        let edges: Vec<usize> = (0..=k)
            .map(|i| ((i * len) as f64 / k as f64).round() as usize)
            .collect();
        for state in 0..k {
            bins[state].extend(seq[edges[state]..edges[state + 1]].iter());
        }
    }

    let total: usize = bins.iter().map(|b| b.len()).sum();
    let mut components = Vec::with_capacity(k);
    let mut priors = Vector::zeros(k);
    for (state, samples) in bins.iter().enumerate() {
        let mut mean = Vector::zeros(dim);
        for sample in samples {
            mean += *sample;
        }
        mean /= samples.len() as f64;
        let covariance = sample_covariance(samples, &mean)
            + Matrix::identity(dim, dim) * config.init_regularization;
        components.push(GaussianComponent::new(mean, covariance)?);
        priors[state] = samples.len() as f64 / total as f64;
    }

    let mut transition = Matrix::zeros(k, k);
    for state in 0..k {
        if state + 1 < k {
            let mean_len = bins[state].len() as f64 / sequences.len() as f64;
            let leave = 1.0 / mean_len.max(1.0);
            transition[(state, state)] = 1.0 - leave;
            transition[(state, state + 1)] = leave;
        } else {
            transition[(state, state)] = 1.0;
        }
    }
    transition.add_scalar_mut(PROBABILITY_FLOOR);
    normalize_rows(&mut transition);

    let mut initial = Vector::from_element(k, PROBABILITY_FLOOR);
    initial[0] += 1.0;
    initial /= initial.sum();

    let model = MixtureModel::new(priors, initial, transition, components)?;
    // Factor once so badly conditioned seeds show up in the report
    model.prepare(DegeneracyStage::Initialization, diagnostics)?;
    Ok(model)
}

fn normalize_rows(matrix: &mut Matrix) {
    for mut row in matrix.row_iter_mut() {
        let sum = row.sum();
        if sum > 0.0 {
            row /= sum;
        }
    }
}

fn expectation(
    model: &MixtureModel,
    prepared: &[PreparedComponent],
    sequences: &[&[Vector]],
) -> Vec<SequenceStats> {
    sequences
        .par_iter()
        .map(|seq| {
            let log_b = log_emission_table(model.components(), prepared, seq);
            forward_backward(&log_b, model.initial_probabilities(), model.transition())
        })
        .collect()
}

/// Scaled forward/backward over a log-emission table.
///
/// Emissions are shifted by their per-timestep maximum before exponentiation; the
/// shifts and scale factors are added back into the log-likelihood.
pub(crate) fn forward_backward(
    log_b: &[Vec<f64>],
    initial: &Vector,
    transition: &Matrix,
) -> SequenceStats {
    let len = log_b.len();
    let k = initial.len();

    let mut shifts = vec![0.0; len];
    let emission: Vec<Vec<f64>> = log_b
        .iter()
        .enumerate()
        .map(|(t, row)| {
            let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let shift = if max.is_finite() { max } else { 0.0 };
            shifts[t] = shift;
            row.iter().map(|v| (v - shift).exp()).collect()
        })
        .collect();

    // Forward
    let mut alpha = vec![vec![0.0; k]; len];
    let mut scale = vec![0.0; len];
    for t in 0..len {
        for j in 0..k {
            let predicted = if t == 0 {
                initial[j]
            } else {
                (0..k).map(|i| alpha[t - 1][i] * transition[(i, j)]).sum()
            };
            alpha[t][j] = predicted * emission[t][j];
        }
        let c = alpha[t].iter().sum::<f64>().max(f64::MIN_POSITIVE);
        scale[t] = c;
        alpha[t].iter_mut().for_each(|a| *a /= c);
    }

    // Backward
    let mut beta = vec![vec![1.0; k]; len];
    for t in (0..len.saturating_sub(1)).rev() {
        for i in 0..k {
            beta[t][i] = (0..k)
                .map(|j| transition[(i, j)] * emission[t + 1][j] * beta[t + 1][j])
                .sum::<f64>()
                / scale[t + 1];
        }
    }

    let gamma: Vec<Vec<f64>> = (0..len)
        .map(|t| {
            let mut row: Vec<f64> = (0..k).map(|i| alpha[t][i] * beta[t][i]).collect();
            let sum: f64 = row.iter().sum();
            if sum > 0.0 {
                row.iter_mut().for_each(|g| *g /= sum);
            }
            row
        })
        .collect();

    let mut xi_sum = Matrix::zeros(k, k);
    for t in 0..len.saturating_sub(1) {
        let mut xi = Matrix::from_fn(k, k, |i, j| {
            alpha[t][i] * transition[(i, j)] * emission[t + 1][j] * beta[t + 1][j]
        });
        let sum = xi.sum();
        if sum > 0.0 {
            xi /= sum;
            xi_sum += xi;
        }
    }

    let log_likelihood = scale
        .iter()
        .zip(&shifts)
        .map(|(c, shift)| c.ln() + shift)
        .sum();

    SequenceStats {
        gamma,
        xi_sum,
        log_likelihood,
    }
}

fn maximization(
    model: &MixtureModel,
    sequences: &[&[Vector]],
    stats: &[SequenceStats],
    regularization: f64,
    iteration: usize,
    diagnostics: &mut Diagnostics,
) -> Result<MixtureModel> {
    let k = model.num_states();
    let dim = model.dim();

    let mut mass = Vector::zeros(k);
    let mut components = Vec::with_capacity(k);
    for state in 0..k {
        let mut weight = 0.0;
        let mut weighted_sum = Vector::zeros(dim);
        for (seq, stat) in sequences.iter().zip(stats) {
            for (x, g) in seq.iter().zip(&stat.gamma) {
                weight += g[state];
                weighted_sum += x * g[state];
            }
        }
        mass[state] = weight;

        if weight < MIN_STATE_MASS {
            diagnostics.push(Diagnostic::ComponentStarved {
                component: state,
                iteration,
            });
            components.push(model.components()[state].clone());
            continue;
        }

        let mean = weighted_sum / weight;
        let mut covariance = Matrix::zeros(dim, dim);
        for (seq, stat) in sequences.iter().zip(stats) {
            for (x, g) in seq.iter().zip(&stat.gamma) {
                let diff = x - &mean;
                covariance += (&diff * diff.transpose()) * g[state];
            }
        }
        covariance /= weight;
        covariance += Matrix::identity(dim, dim) * regularization;
        components.push(GaussianComponent::new(mean, symmetrize(&covariance))?);
    }

    let total_mass = mass.sum();
    let priors = if total_mass > 0.0 {
        &mass / total_mass
    } else {
        model.priors().clone()
    };

    let mut initial = Vector::zeros(k);
    for stat in stats {
        for (state, g) in stat.gamma[0].iter().enumerate() {
            initial[state] += g;
        }
    }
    let initial_sum = initial.sum();
    let initial = if initial_sum > 0.0 {
        initial / initial_sum
    } else {
        model.initial_probabilities().clone()
    };

    let mut transition = model.transition().clone();
    for i in 0..k {
        let mut row = Vector::zeros(k);
        for stat in stats {
            for j in 0..k {
                row[j] += stat.xi_sum[(i, j)];
            }
        }
        let row_sum = row.sum();
        if row_sum > MIN_STATE_MASS {
            transition.set_row(i, &(row / row_sum).transpose());
        }
    }

    MixtureModel::new(priors, initial, transition, components)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Three noisy 1-D sequences that dwell at 0, then 10, then 20.
    fn staircase_sequences() -> Vec<Vec<Vector>> {
        (0..3)
            .map(|n| {
                (0..30)
                    .map(|t| {
                        let level = (t / 10) as f64 * 10.0;
                        let wiggle = ((t * 7 + n * 3) % 5) as f64 * 0.1 - 0.2;
                        Vector::from_vec(vec![level + wiggle])
                    })
                    .collect()
            })
            .collect()
    }

    fn config(states: usize) -> TpGmmConfig {
        TpGmmConfig {
            num_states: states,
            max_iterations: 15,
            ..Default::default()
        }
    }

    #[test]
    fn test_kbins_seeds_contiguous_segments() {
        let data = staircase_sequences();
        let sequences: Vec<&[Vector]> = data.iter().map(|s| s.as_slice()).collect();
        let mut diagnostics = Diagnostics::new();
        let model = init_kbins(&sequences, &config(3), &mut diagnostics).unwrap();

        assert_relative_eq!(model.means()[0][0], 0.0, epsilon = 0.3);
        assert_relative_eq!(model.means()[1][0], 10.0, epsilon = 0.3);
        assert_relative_eq!(model.means()[2][0], 20.0, epsilon = 0.3);
        assert_relative_eq!(model.priors().sum(), 1.0, epsilon = 1e-12);
        // Left-to-right start
        assert!(model.transition()[(0, 0)] > model.transition()[(0, 2)]);
        assert!(model.initial_probabilities()[0] > 0.99);
    }

    #[test]
    fn test_too_many_states() {
        let data = vec![vec![Vector::from_vec(vec![0.0]); 3]];
        let sequences: Vec<&[Vector]> = data.iter().map(|s| s.as_slice()).collect();
        let err = fit(&sequences, &config(4)).unwrap_err();
        assert!(matches!(err, TpGmmError::TooManyStates { .. }));
    }

    #[test]
    fn test_em_improves_log_likelihood() {
        let data = staircase_sequences();
        let sequences: Vec<&[Vector]> = data.iter().map(|s| s.as_slice()).collect();
        let (_, report) = fit(&sequences, &config(3)).unwrap();

        assert_eq!(report.iterations, 15);
        assert_eq!(report.log_likelihood.len(), 15);
        let first = report.log_likelihood[0];
        let last = report.final_log_likelihood().unwrap();
        assert!(last >= first - 1e-6, "{} -> {}", first, last);
    }

    #[test]
    fn test_fixed_budget_reports_limit() {
        let data = staircase_sequences();
        let sequences: Vec<&[Vector]> = data.iter().map(|s| s.as_slice()).collect();
        let (_, report) = fit(&sequences, &config(3)).unwrap();

        assert!(!report.converged);
        assert!(report
            .diagnostics
            .entries()
            .iter()
            .any(|d| matches!(d, Diagnostic::ConvergenceLimitReached { iterations: 15, .. })));
    }

    #[test]
    fn test_plateau_rule_stops_early() {
        let data = staircase_sequences();
        let sequences: Vec<&[Vector]> = data.iter().map(|s| s.as_slice()).collect();
        let cfg = TpGmmConfig {
            max_iterations: 200,
            convergence_tolerance: Some(1e-6),
            ..config(3)
        };
        let (_, report) = fit(&sequences, &cfg).unwrap();
        assert!(report.converged);
        assert!(report.iterations < 200);
    }

    #[test]
    fn test_fitted_covariances_positive_definite() {
        let data = staircase_sequences();
        let sequences: Vec<&[Vector]> = data.iter().map(|s| s.as_slice()).collect();
        let (model, _) = fit(&sequences, &config(3)).unwrap();
        for cov in model.covariances() {
            assert_relative_eq!(cov.clone(), cov.transpose(), epsilon = 1e-12);
            assert!(cov.clone().cholesky().is_some());
        }
        for row in model.transition().row_iter() {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_forward_backward_posteriors_normalized() {
        let log_b = vec![vec![-1.0, -5.0], vec![-4.0, -0.5], vec![-3.0, -0.2]];
        let initial = Vector::from_vec(vec![0.6, 0.4]);
        let transition = Matrix::from_row_slice(2, 2, &[0.7, 0.3, 0.2, 0.8]);
        let stats = forward_backward(&log_b, &initial, &transition);
        for g in &stats.gamma {
            assert_relative_eq!(g.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        }
        assert_relative_eq!(stats.xi_sum.sum(), 2.0, epsilon = 1e-12);

        // Brute force over all 8 paths
        let mut total = 0.0;
        for path in 0..8usize {
            let s = [(path >> 2) & 1, (path >> 1) & 1, path & 1];
            let mut p = initial[s[0]] * log_b[0][s[0]].exp();
            for t in 1..3 {
                p *= transition[(s[t - 1], s[t])] * log_b[t][s[t]].exp();
            }
            total += p;
        }
        assert_relative_eq!(stats.log_likelihood, total.ln(), epsilon = 1e-10);
    }

    #[test]
    fn test_unreachable_state_is_held() {
        // Two plateaus; state 2 is neither a start state nor reachable from 0 or 1
        let data: Vec<Vec<Vector>> = (0..2)
            .map(|n| {
                (0..20)
                    .map(|t| {
                        let level = if t < 10 { 0.0 } else { 10.0 };
                        let wiggle = ((t + n) % 3) as f64 * 0.1;
                        Vector::from_vec(vec![level + wiggle])
                    })
                    .collect()
            })
            .collect();
        let sequences: Vec<&[Vector]> = data.iter().map(|s| s.as_slice()).collect();
        let component = |mean: f64| {
            GaussianComponent::new(Vector::from_vec(vec![mean]), Matrix::identity(1, 1)).unwrap()
        };
        let model = MixtureModel::new(
            Vector::from_vec(vec![0.4, 0.4, 0.2]),
            Vector::from_vec(vec![1.0, 0.0, 0.0]),
            Matrix::from_row_slice(3, 3, &[0.9, 0.1, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]),
            vec![component(0.0), component(10.0), component(20.0)],
        )
        .unwrap();

        let mut diagnostics = Diagnostics::new();
        let prepared = model
            .prepare(DegeneracyStage::Estimation, &mut diagnostics)
            .unwrap();
        let stats = expectation(&model, &prepared, &sequences);
        for stat in &stats {
            assert!(stat.gamma.iter().all(|g| g[2] == 0.0));
        }
        let updated = maximization(&model, &sequences, &stats, 1e-6, 0, &mut diagnostics).unwrap();

        assert_eq!(updated.components()[2], model.components()[2]);
        assert_eq!(updated.priors()[2], 0.0);
        assert_eq!(updated.transition().row(2), model.transition().row(2));
        assert!(diagnostics
            .entries()
            .contains(&Diagnostic::ComponentStarved {
                component: 2,
                iteration: 0
            }));
        // The reachable states still move onto their plateaus
        assert_relative_eq!(updated.means()[0][0], 0.1, epsilon = 0.1);
        assert_relative_eq!(updated.means()[1][0], 10.1, epsilon = 0.1);
    }
}

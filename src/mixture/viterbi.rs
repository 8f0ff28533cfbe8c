use serde::{Deserialize, Serialize};

use super::{log_emission_table, MixtureModel};
use crate::diagnostics::{DegeneracyStage, Diagnostics};
use crate::error::Result;
use crate::types::Vector;

/// Most likely state at every timestep of one observation sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatePath {
    states: Vec<usize>,
    /// Covariance repairs needed to score the sequence
    #[serde(default)]
    diagnostics: Diagnostics,
}

impl StatePath {
    pub fn new(states: Vec<usize>) -> Self {
        Self {
            states,
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn states(&self) -> &[usize] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Collapse runs of repeated states, e.g. `[0, 0, 1, 1, 1, 2]` -> `[0, 1, 2]`.
    pub fn segments(&self) -> Vec<usize> {
        let mut out: Vec<usize> = Vec::new();
        for &s in &self.states {
            if out.last() != Some(&s) {
                out.push(s);
            }
        }
        out
    }
}

fn safe_ln(p: f64) -> f64 {
    if p > 0.0 {
        p.ln()
    } else {
        f64::NEG_INFINITY
    }
}

/// Log-space Viterbi decoding.
///
/// Predecessors are scanned in ascending index order and only replaced on a strictly
/// better score, so ties resolve to the lowest-indexed state.
pub fn decode(model: &MixtureModel, samples: &[Vector]) -> Result<StatePath> {
    model.check_samples(samples)?;
    let mut diagnostics = Diagnostics::new();
    let prepared = model.prepare(DegeneracyStage::Estimation, &mut diagnostics)?;
    let log_b = log_emission_table(model.components(), &prepared, samples);

    let k = model.num_states();
    let len = samples.len();
    let log_a = model.transition().map(safe_ln);
    let log_pi = model.initial_probabilities().map(safe_ln);

    let mut delta: Vec<f64> = (0..k).map(|j| log_pi[j] + log_b[0][j]).collect();
    let mut backpointer = vec![vec![0usize; k]; len];

    for t in 1..len {
        let mut next = vec![f64::NEG_INFINITY; k];
        for j in 0..k {
            let mut best = f64::NEG_INFINITY;
            let mut arg = 0;
            for i in 0..k {
                let score = delta[i] + log_a[(i, j)];
                if score > best {
                    best = score;
                    arg = i;
                }
            }
            next[j] = best + log_b[t][j];
            backpointer[t][j] = arg;
        }
        delta = next;
    }

    let mut last = 0;
    for j in 1..k {
        if delta[j] > delta[last] {
            last = j;
        }
    }

    let mut states = vec![0usize; len];
    states[len - 1] = last;
    for t in (1..len).rev() {
        states[t - 1] = backpointer[t][states[t]];
    }

    let path = StatePath {
        states,
        diagnostics,
    };
    log::debug!("[Viterbi] decoded {} steps, segments {:?}", len, path.segments());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixture::GaussianComponent;
    use crate::types::Matrix;

    fn chain_model(initial: Vec<f64>, transition: &[f64]) -> MixtureModel {
        let components = vec![
            GaussianComponent::new(Vector::from_vec(vec![0.0]), Matrix::identity(1, 1)).unwrap(),
            GaussianComponent::new(Vector::from_vec(vec![4.0]), Matrix::identity(1, 1)).unwrap(),
        ];
        MixtureModel::new(
            Vector::from_vec(vec![0.5, 0.5]),
            Vector::from_vec(initial),
            Matrix::from_row_slice(2, 2, transition),
            components,
        )
        .unwrap()
    }

    fn scalars(values: &[f64]) -> Vec<Vector> {
        values.iter().map(|v| Vector::from_vec(vec![*v])).collect()
    }

    #[test]
    fn test_decodes_obvious_switch() {
        let model = chain_model(vec![0.9, 0.1], &[0.8, 0.2, 0.0, 1.0]);
        let path = decode(&model, &scalars(&[0.1, -0.2, 0.0, 3.9, 4.2, 4.0])).unwrap();
        assert_eq!(path.states(), &[0, 0, 0, 1, 1, 1]);
        assert_eq!(path.segments(), vec![0, 1]);
    }

    #[test]
    fn test_forbidden_transition_respected() {
        // 1 -> 0 is impossible, so the trailing 0.0 must stay in state 1
        let model = chain_model(vec![0.5, 0.5], &[0.5, 0.5, 0.0, 1.0]);
        let path = decode(&model, &scalars(&[4.0, 4.0, 0.0])).unwrap();
        assert_eq!(path.states(), &[1, 1, 1]);
    }

    #[test]
    fn test_ties_prefer_lower_index() {
        let model = chain_model(vec![0.5, 0.5], &[0.5, 0.5, 0.5, 0.5]);
        // Exactly midway between both means
        let path = decode(&model, &scalars(&[2.0, 2.0, 2.0])).unwrap();
        assert_eq!(path.states(), &[0, 0, 0]);
    }

    #[test]
    fn test_decoding_is_deterministic() {
        let model = chain_model(vec![0.6, 0.4], &[0.7, 0.3, 0.2, 0.8]);
        let samples = scalars(&[0.3, 1.9, 2.2, 3.5, 0.4, 4.1, 2.0]);
        let first = decode(&model, &samples).unwrap();
        let second = decode(&model, &samples).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), samples.len());
    }

    #[test]
    fn test_empty_sequence_rejected() {
        let model = chain_model(vec![0.5, 0.5], &[0.5, 0.5, 0.5, 0.5]);
        assert!(decode(&model, &[]).is_err());
    }

    #[test]
    fn test_repaired_covariance_reported_on_path() {
        let components = vec![
            GaussianComponent::new(Vector::from_vec(vec![0.0]), Matrix::zeros(1, 1)).unwrap(),
            GaussianComponent::new(Vector::from_vec(vec![4.0]), Matrix::identity(1, 1)).unwrap(),
        ];
        let model = MixtureModel::new(
            Vector::from_vec(vec![0.5, 0.5]),
            Vector::from_vec(vec![0.5, 0.5]),
            Matrix::from_row_slice(2, 2, &[0.5, 0.5, 0.5, 0.5]),
            components,
        )
        .unwrap();
        let path = decode(&model, &scalars(&[0.0, 4.0])).unwrap();
        assert_eq!(path.states(), &[0, 1]);
        assert!(path.diagnostics().has_degeneracy());

        let clean = chain_model(vec![0.5, 0.5], &[0.5, 0.5, 0.5, 0.5]);
        assert!(decode(&clean, &scalars(&[0.0])).unwrap().diagnostics().is_empty());
    }
}

// diagnostics.rs: recoverable conditions reported alongside results
//
// Nothing in here aborts a call. Degeneracies are repaired locally (jitter on the
// diagonal) and recorded so the caller can decide whether to trust the output.

use serde::{Deserialize, Serialize};

/// Pipeline stage at which a covariance or precision needed repair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegeneracyStage {
    Initialization,
    Estimation,
    Marginal,
    Fusion,
    Tracking,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Diagnostic {
    /// A matrix was near-singular; `jitter` was added to its diagonal.
    NumericalDegeneracy {
        stage: DegeneracyStage,
        component: usize,
        jitter: f64,
    },
    /// Component received no responsibility mass; its parameters were held.
    ComponentStarved { component: usize, iteration: usize },
    /// EM used its whole iteration budget. Informational.
    ConvergenceLimitReached {
        iterations: usize,
        log_likelihood: f64,
    },
    /// EM stopped on the log-likelihood plateau rule.
    Converged {
        iterations: usize,
        log_likelihood: f64,
    },
}

impl Diagnostic {
    pub fn is_degeneracy(&self) -> bool {
        matches!(self, Diagnostic::NumericalDegeneracy { .. })
    }

    /// Forward to the `log` facade at a level matching severity.
    pub(crate) fn emit(&self) {
        match self {
            Diagnostic::NumericalDegeneracy {
                stage,
                component,
                jitter,
            } => log::warn!(
                "[DEGENERACY] {:?} component {} regularized with jitter {:.3e}",
                stage,
                component,
                jitter
            ),
            Diagnostic::ComponentStarved {
                component,
                iteration,
            } => log::warn!(
                "[EM] component {} starved at iteration {}, holding parameters",
                component,
                iteration
            ),
            Diagnostic::ConvergenceLimitReached {
                iterations,
                log_likelihood,
            } => log::info!(
                "[EM] iteration budget of {} exhausted, log-likelihood {:.4}",
                iterations,
                log_likelihood
            ),
            Diagnostic::Converged {
                iterations,
                log_likelihood,
            } => log::info!(
                "[EM] converged after {} iterations, log-likelihood {:.4}",
                iterations,
                log_likelihood
            ),
        }
    }
}

/// Append-only collector. Each push is also logged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        diagnostic.emit();
        self.entries.push(diagnostic);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn has_degeneracy(&self) -> bool {
        self.entries.iter().any(Diagnostic::is_degeneracy)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degeneracy_detection() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.push(Diagnostic::ConvergenceLimitReached {
            iterations: 10,
            log_likelihood: -3.0,
        });
        assert!(!diagnostics.has_degeneracy());

        diagnostics.push(Diagnostic::NumericalDegeneracy {
            stage: DegeneracyStage::Fusion,
            component: 2,
            jitter: 1e-9,
        });
        assert!(diagnostics.has_degeneracy());
        assert_eq!(diagnostics.len(), 2);
    }

    #[test]
    fn test_extend_keeps_order() {
        let mut first = Diagnostics::new();
        first.push(Diagnostic::ComponentStarved {
            component: 0,
            iteration: 1,
        });
        let mut second = Diagnostics::new();
        second.push(Diagnostic::ComponentStarved {
            component: 1,
            iteration: 1,
        });
        first.extend(second);

        let components: Vec<usize> = first
            .entries()
            .iter()
            .filter_map(|d| match d {
                Diagnostic::ComponentStarved { component, .. } => Some(*component),
                _ => None,
            })
            .collect();
        assert_eq!(components, vec![0, 1]);
    }
}

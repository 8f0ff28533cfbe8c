use thiserror::Error;

/// Errors raised by the learning and synthesis pipeline.
///
/// Everything here is a configuration problem the caller has to fix. Recoverable
/// numerical trouble goes through [`crate::diagnostics::Diagnostic`] instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TpGmmError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown basis function family: {0}")]
    InvalidBasis(String),

    #[error("Number of states must be positive")]
    NoStates,

    #[error("Need at least {required} samples per demonstration for {states} states, got {actual}")]
    TooManyStates {
        states: usize,
        required: usize,
        actual: usize,
    },

    #[error("No demonstrations supplied")]
    NoDemonstrations,

    #[error("Demonstration must have at least {required} timesteps, got {actual}")]
    DemonstrationTooShort { required: usize, actual: usize },

    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("Frame '{frame}' defines {actual} timesteps but the demonstration has {expected}")]
    FrameLengthMismatch {
        frame: String,
        expected: usize,
        actual: usize,
    },

    #[error("{demonstrations} demonstrations but {parameters} task-parameter sets")]
    TaskParameterCount {
        demonstrations: usize,
        parameters: usize,
    },

    #[error("Horizon {requested} does not match reference length {reference}")]
    HorizonMismatch { requested: usize, reference: usize },

    #[error("Demonstration index {index} out of range ({count} demonstrations)")]
    DemonstrationIndex { index: usize, count: usize },

    #[error("Linear part of frame '{frame}' is singular")]
    SingularFrame { frame: String },

    #[error("Numerical failure: {0}")]
    Numerical(String),
}

/// Result type for all fallible pipeline operations
pub type Result<T> = std::result::Result<T, TpGmmError>;

impl TpGmmError {
    pub(crate) fn dimension(context: &str, expected: usize, actual: usize) -> Self {
        TpGmmError::DimensionMismatch {
            context: context.to_string(),
            expected,
            actual,
        }
    }
}

//! Error types for graph construction, evaluation and sensitivity integration.

use std::fmt;

/// Result type for diffsim operations.
pub type DiffResult<T> = Result<T, DiffError>;

/// Errors that can occur while building, evaluating or differentiating computations.
#[derive(Debug, Clone)]
pub enum DiffError {
    /// Operand or port shapes are inconsistent.
    ///
    /// Raised when a node or a Function is constructed, never during evaluation.
    ShapeMismatch {
        op: String,
        expected: String,
        got: String,
    },

    /// Integrator state/parameter dimensions or rhs arity are inconsistent.
    DimensionError { context: String },

    /// Unrecognized or out-of-range configuration option.
    ConfigurationError { option: String, reason: String },

    /// The stepper could not satisfy the tolerances above the step-size floor,
    /// or a checkpoint replay diverged from the recorded trajectory.
    IntegrationDivergence { t: f64, step: f64, context: String },

    /// A requested derivative path is not implemented.
    UnsupportedDerivative { context: String },

    /// An integrator operation was invoked in a state that does not allow it.
    InvalidState { operation: String, state: String },

    /// Invalid argument (index out of range, non-symbol input, free symbol).
    InvalidArgument { context: String },

    /// An expression belonging to another graph was used.
    ForeignExpression { context: String },

    /// A runtime assertion node evaluated to false.
    AssertionFailed { message: String },

    /// Error from an underlying numr operation.
    Numeric { context: String },
}

impl DiffError {
    pub(crate) fn shape_mismatch(
        op: &str,
        expected: impl fmt::Display,
        got: impl fmt::Display,
    ) -> Self {
        Self::ShapeMismatch {
            op: op.to_string(),
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }

    pub(crate) fn numeric(context: &str, e: numr::error::Error) -> Self {
        Self::Numeric {
            context: format!("{}: {}", context, e),
        }
    }
}

impl fmt::Display for DiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch { op, expected, got } => {
                write!(f, "shape mismatch in {}: expected {}, got {}", op, expected, got)
            }
            Self::DimensionError { context } => {
                write!(f, "dimension error: {}", context)
            }
            Self::ConfigurationError { option, reason } => {
                write!(f, "invalid option '{}': {}", option, reason)
            }
            Self::IntegrationDivergence { t, step, context } => {
                write!(
                    f,
                    "{}: integration diverged at t = {:.6} (step {:.2e})",
                    context, t, step
                )
            }
            Self::UnsupportedDerivative { context } => {
                write!(f, "unsupported derivative: {}", context)
            }
            Self::InvalidState { operation, state } => {
                write!(f, "cannot {} while integrator is {}", operation, state)
            }
            Self::InvalidArgument { context } => {
                write!(f, "invalid argument: {}", context)
            }
            Self::ForeignExpression { context } => {
                write!(f, "expression belongs to another graph: {}", context)
            }
            Self::AssertionFailed { message } => {
                write!(f, "assertion failed: {}", message)
            }
            Self::Numeric { context } => {
                write!(f, "numr error: {}", context)
            }
        }
    }
}

impl std::error::Error for DiffError {}

impl From<numr::error::Error> for DiffError {
    fn from(err: numr::error::Error) -> Self {
        DiffError::Numeric {
            context: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DiffError::shape_mismatch("add", "2x1", "3x1");
        assert_eq!(err.to_string(), "shape mismatch in add: expected 2x1, got 3x1");

        let err = DiffError::IntegrationDivergence {
            t: 0.5,
            step: 1e-15,
            context: "solve".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("solve"));
        assert!(msg.contains("0.500000"));

        let err = DiffError::InvalidState {
            operation: "solve".to_string(),
            state: "Failed".to_string(),
        };
        assert_eq!(err.to_string(), "cannot solve while integrator is Failed");
    }

    #[test]
    fn test_configuration_error_display() {
        let err = DiffError::ConfigurationError {
            option: "reltol".to_string(),
            reason: "unknown option".to_string(),
        };
        assert_eq!(err.to_string(), "invalid option 'reltol': unknown option");
    }
}

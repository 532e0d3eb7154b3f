//! Error types for the compile pipeline.
//!
//! Tiering decisions are advisory: every compile request may fail and the
//! function simply keeps running at its current tier. The error values here
//! exist so compilers can *report* failure; no layer above the compiler
//! propagates them to user code.

use thiserror::Error;

/// The result type used by compile entry points.
pub type CompileResult<T> = Result<T, CompileError>;

/// Failure modes of a single compile job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The function has been excluded from compilation at this tier.
    #[error("optimization disabled for function '{name}'")]
    OptimizationDisabled {
        /// Name of the function.
        name: String,
    },

    /// The compile queue refused the request (full or duplicate).
    #[error("compile queue rejected request: {reason}")]
    QueueRejected {
        /// Why the request was dropped.
        reason: String,
    },

    /// The back-end failed to produce code.
    #[error("code generation failed: {message}")]
    CodegenFailed {
        /// Back-end diagnostic.
        message: String,
    },

    /// The graph handed to a pass violated a structural precondition.
    #[error("malformed graph: {message}")]
    MalformedGraph {
        /// Which precondition was violated.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CompileError::OptimizationDisabled {
            name: "outer".to_string(),
        };
        assert_eq!(err.to_string(), "optimization disabled for function 'outer'");

        let err = CompileError::QueueRejected {
            reason: "full".to_string(),
        };
        assert!(err.to_string().contains("full"));
    }
}

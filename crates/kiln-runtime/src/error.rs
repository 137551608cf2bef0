//! Error types for the runtime crate.

use thiserror::Error;

/// Runtime compilation and execution errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Building, placing or initializing the graph failed.
    #[error("Compilation failed: {0}")]
    Compilation(#[from] kiln_core::Error),

    /// An operation failed while enqueueing its work.
    #[error("Operation '{op}' failed: {source}")]
    Execution {
        op: String,
        #[source]
        source: kiln_core::Error,
    },

    /// A queued device command failed while the stream drained.
    #[error("Device execution failed: {0}")]
    Device(#[source] kiln_core::Error),

    /// Invalid tensor.
    #[error("Invalid tensor: {0}")]
    TensorError(String),

    /// Tensor not found.
    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    /// Invalid input/output.
    #[error("Invalid input or output: {0}")]
    InvalidInputOutput(String),
}

impl RuntimeError {
    /// The underlying backend error, if any.
    pub fn core_error(&self) -> Option<&kiln_core::Error> {
        match self {
            RuntimeError::Compilation(err)
            | RuntimeError::Execution { source: err, .. }
            | RuntimeError::Device(err) => Some(err),
            _ => None,
        }
    }
}

/// Specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

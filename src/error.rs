//! Error types shared by every layer of the training engine.
//!
//! Validation happens at API boundaries before any buffer is touched, so an
//! `Err` never leaves a model half-updated.

use crate::memory::ArenaError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by models, layers, optimizers and the parallel coordinator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Model not compiled: call compile() before {0}")]
    NotCompiled(&'static str),

    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Unknown {kind} type: {key:?}")]
    UnknownType { kind: &'static str, key: String },

    #[error("Layer {index} is already built; pass the reuse flag to share it")]
    AlreadyBuilt { index: usize },

    #[error("Invalid architecture: {0}")]
    InvalidArchitecture(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Training batch is empty")]
    EmptyBatch,

    #[error("Arena error: {0}")]
    Arena(#[from] ArenaError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Worker {worker} is busy with another request")]
    WorkerBusy { worker: usize },

    #[error("Worker {worker} stopped before answering")]
    WorkerCrashed { worker: usize },

    #[error("Worker {worker} failed: {message}")]
    WorkerFailed { worker: usize, message: String },

    #[error("Parallel trainer has not been initialized")]
    NotInitialized,

    #[error("Parallel trainer has been terminated")]
    Terminated,
}

impl Error {
    /// Shorthand for the common length check.
    pub(crate) fn check_len(context: &'static str, expected: usize, actual: usize) -> Result<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(Error::DimensionMismatch {
                context,
                expected,
                actual,
            })
        }
    }
}

#[cfg(feature = "serde")]
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_len() {
        assert!(Error::check_len("test", 3, 3).is_ok());
        let err = Error::check_len("test", 3, 4).unwrap_err();
        assert_eq!(
            err,
            Error::DimensionMismatch {
                context: "test",
                expected: 3,
                actual: 4
            }
        );
        assert!(err.to_string().contains("expected 3, got 4"));
    }

    #[test]
    fn test_arena_error_conversion() {
        let err: Error = ArenaError::InvalidHandle { chunk: 7, chunks: 1 }.into();
        assert!(matches!(err, Error::Arena(ArenaError::InvalidHandle { chunk: 7, .. })));
    }
}

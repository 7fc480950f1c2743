//! Error types for the Mooring engine.

use crate::ClassName;
use thiserror::Error;

/// All possible errors from the Mooring engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Operation errors
    #[error("cannot merge {next} over {previous} for key '{key}'")]
    MergeType {
        key: String,
        previous: String,
        next: String,
    },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("operation set not found: {0}")]
    OperationSetNotFound(String),

    // Value errors
    #[error("invalid pointer: {0}")]
    InvalidPointer(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("unknown class: {0}")]
    UnknownClass(ClassName),

    // Query errors
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl Error {
    /// Build a merge error, naming the two operations involved.
    pub fn merge_type(key: &str, previous: impl Into<String>, next: impl Into<String>) -> Self {
        Error::MergeType {
            key: key.to_string(),
            previous: previous.into(),
            next: next.into(),
        }
    }

    /// True if this error comes from an incompatible operation merge.
    pub fn is_merge_type(&self) -> bool {
        matches!(self, Error::MergeType { .. })
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

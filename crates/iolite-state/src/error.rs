//! Error types for the state layer.

use thiserror::Error;

/// Errors that can occur in state-tree operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("Type mismatch for field '{field}': expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },

    #[error("Dependency cycle involving computed field '{0}'")]
    DependencyCycle(String),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Computed field '{0}' is read-only")]
    ComputedFieldReadOnly(String),

    #[error("Unknown computed input '{input}' for computed field '{field}'")]
    UnknownComputedInput { field: String, input: String },

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, StateError>;

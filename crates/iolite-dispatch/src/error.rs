//! Error types for dispatch and handler execution.

use iolite_state::StateError;
use thiserror::Error;

/// Errors surfaced by the dispatcher or returned from handler bodies.
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("No handler registered for '{0}'")]
    HandlerNotFound(String),

    #[error("Timed out after {waited_ms}ms waiting for the state lock")]
    LockTimeout { waited_ms: u64 },

    #[error("Task cancelled")]
    Cancelled,

    #[error(transparent)]
    State(#[from] StateError),

    #[error("{0}")]
    Failed(String),
}

impl DispatchError {
    /// Build a handler failure from any displayable error.
    pub fn failed(msg: impl std::fmt::Display) -> Self {
        DispatchError::Failed(msg.to_string())
    }
}

/// What every handler body resolves to.
pub type HandlerResult = std::result::Result<(), DispatchError>;

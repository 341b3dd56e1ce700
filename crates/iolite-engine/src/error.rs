//! Error types for the engine layer.

use iolite_delta::Seq;
use iolite_dispatch::DispatchError;
use iolite_state::StateError;
use thiserror::Error;

/// Errors that can occur in engine and client-store operations.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// A delta arrived whose sequence number is not exactly one greater
    /// than the last applied; the client must resync.
    #[error("Sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: Seq, got: Seq },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Connection not established")]
    NotConnected,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

//! Error types for backend calls and engine operations
//!
//! `BackendError` is what the backend SDK hands back. `EngineError` is what
//! callers of the engine observe. The classifier in
//! `resilience::classifier` maps backend errors onto the recovery taxonomy.

use crate::core::types::InitState;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by the backend client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// No network path to the backend
    #[error("client is offline")]
    Offline,

    /// Backend reachable but refusing or dropping requests
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Call did not complete in time
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Security rules rejected the call
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// No (or expired) auth session
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Client-internal failure (assertion, corrupted local state, ...)
    #[error("internal error [{code}]: {message}")]
    Internal { code: String, message: String },

    /// Target document or collection does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Client was terminated and has not been reconstructed
    #[error("client terminated")]
    Terminated,

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Internal {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// Errors from the local persistent key-value store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced to engine callers
#[derive(Debug, Error)]
pub enum EngineError {
    /// The backend call itself failed after any local retries
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Backend initialization ended in the terminal error state
    #[error("backend initialization failed: {0}")]
    InitFailed(String),

    /// Operation requires a state the gate is not in
    #[error("backend not ready (state: {0})")]
    NotReady(InitState),

    /// Circuit breaker is stopped; call rejected without reaching the backend
    #[error("circuit breaker open, backend calls suspended")]
    CircuitOpen,

    /// Queued operation was rejected by `flush()`
    #[error("operation flushed before execution")]
    Flushed,

    /// In-flight operation was aborted by emergency recovery
    #[error("operation aborted by emergency recovery")]
    Aborted,

    #[error("engine is shutting down")]
    ShuttingDown,

    /// Subscription was torn down while it was being created
    #[error("subscription '{0}' cancelled during creation")]
    SubscriptionCancelled(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid wiring or configuration detected at construction time
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// The underlying backend error, if any
    pub fn backend(&self) -> Option<&BackendError> {
        match self {
            Self::Backend(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

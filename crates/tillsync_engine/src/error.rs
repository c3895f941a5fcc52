//! Error types for the replication engine and the remote store.

use std::fmt;
use thiserror::Error;
use tillsync_core::CoreError;
use tillsync_protocol::ProtocolError;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type for remote store calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Why a remote call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// The store could not be reached.
    Unavailable,
    /// A transaction was aborted by contention; retrying may succeed.
    Aborted,
    /// The store refused the request.
    Rejected,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteErrorKind::Unavailable => f.write_str("unavailable"),
            RemoteErrorKind::Aborted => f.write_str("aborted"),
            RemoteErrorKind::Rejected => f.write_str("rejected"),
        }
    }
}

/// A failed remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote {kind}: {message}")]
pub struct RemoteError {
    /// Failure class.
    pub kind: RemoteErrorKind,
    /// Details.
    pub message: String,
}

impl RemoteError {
    /// Creates an error.
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The store could not be reached.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Unavailable, message)
    }

    /// Contention abort.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Aborted, message)
    }

    /// Refused request.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Rejected, message)
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            RemoteErrorKind::Unavailable | RemoteErrorKind::Aborted
        )
    }
}

/// Errors raised by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Local database error.
    #[error("local database error: {0}")]
    Core(#[from] CoreError),

    /// Document or timestamp could not be translated.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Remote store error.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The engine was cancelled.
    #[error("replication cancelled")]
    Cancelled,

    /// The local applier stopped.
    #[error("pull stream closed")]
    StreamClosed,
}

impl EngineError {
    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Remote(e) => e.is_retryable(),
            _ => false,
        }
    }
}

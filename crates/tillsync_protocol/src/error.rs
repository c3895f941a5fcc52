//! Error types for protocol conversions.

use thiserror::Error;

/// Result type for protocol conversions.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while converting between remote and local shapes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A timestamp is outside the representable calendar range.
    #[error("timestamp out of range: {seconds}s {nanos}ns")]
    TimestampOutOfRange {
        /// Seconds since the Unix epoch.
        seconds: i64,
        /// Sub-second nanoseconds.
        nanos: u32,
    },

    /// A string is not a canonical timestamp.
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    /// A local document cannot be sent to the remote.
    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

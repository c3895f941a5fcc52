//! Error types for the local database and boot path.

use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the local database, the guardian and the session store.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] tillsync_storage::StorageError),

    /// Record encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The record log is damaged.
    #[error("record log corrupted at offset {offset}: {message}")]
    Corrupted {
        /// Byte offset of the damaged frame.
        offset: u64,
        /// What was wrong with it.
        message: String,
    },

    /// No collection with this name has been added.
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    /// A document does not satisfy its collection schema.
    #[error("schema violation in {collection}: {message}")]
    SchemaViolation {
        /// Collection name.
        collection: String,
        /// Description of the violation.
        message: String,
    },

    /// A persisted record could not be migrated to the current schema.
    #[error("migration failed for {collection}: {message}")]
    MigrationFailed {
        /// Collection name.
        collection: String,
        /// Description of the failure.
        message: String,
    },

    /// The handle was closed or destroyed.
    #[error("database is closed")]
    DatabaseClosed,

    /// Database acquisition did not finish in time.
    #[error("database acquisition timed out after {0:?}")]
    AcquireTimeout(Duration),

    /// The guardian's single cold rebuild also failed.
    #[error("cold rebuild failed after initial error ({initial}): {source}")]
    ColdRebuildFailed {
        /// Rendering of the first acquisition error.
        initial: String,
        /// The rebuild's own error.
        #[source]
        source: Box<CoreError>,
    },

    /// A background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl CoreError {
    /// Creates a schema violation error.
    pub fn schema_violation(collection: &str, message: impl Into<String>) -> Self {
        Self::SchemaViolation {
            collection: collection.to_string(),
            message: message.into(),
        }
    }

    /// Creates a migration failure.
    pub fn migration_failed(collection: &str, message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            collection: collection.to_string(),
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(offset: u64, message: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            message: message.into(),
        }
    }
}

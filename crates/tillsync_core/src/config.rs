//! Local database configuration.

use crate::collections::app_collections;
use crate::schema::CollectionSchema;
use std::path::PathBuf;
use std::time::Duration;
use tillsync_storage::InMemoryBackend;

/// Default bound on a single database acquisition.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(8);

/// Where the record log lives.
#[derive(Debug, Clone)]
pub enum DatabaseLocation {
    /// A fresh in-memory log on every open.
    Memory,
    /// An in-memory log that survives reopen (clones share the bytes).
    Shared(InMemoryBackend),
    /// A locked file on disk.
    File(PathBuf),
}

/// Configuration for acquiring the local database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Where the record log lives.
    pub location: DatabaseLocation,
    /// Bound on one acquisition attempt.
    pub acquire_timeout: Duration,
    /// Collections added on open.
    pub collections: Vec<CollectionSchema>,
}

impl DatabaseConfig {
    /// Creates a configuration for `location` with the product's collections.
    pub fn new(location: DatabaseLocation) -> Self {
        Self {
            location,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            collections: app_collections(),
        }
    }

    /// In-memory configuration.
    pub fn in_memory() -> Self {
        Self::new(DatabaseLocation::Memory)
    }

    /// File-backed configuration.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(DatabaseLocation::File(path.into()))
    }

    /// Sets the acquisition timeout.
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Replaces the collection set.
    #[must_use]
    pub fn with_collections(mut self, collections: Vec<CollectionSchema>) -> Self {
        self.collections = collections;
        self
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

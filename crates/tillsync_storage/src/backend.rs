//! The record log contract.

use crate::error::StorageResult;

/// An ordered, append-only byte log.
///
/// Shared between the UI side and the replication engine through the
/// database, hence `Send + Sync`. Writes take `&mut self`; the database
/// serializes them behind its own lock.
pub trait StorageBackend: Send + Sync {
    /// The whole log, oldest byte first.
    fn load(&self) -> StorageResult<Vec<u8>>;

    /// Appends one committed batch and returns the log size before it.
    fn append(&mut self, batch: &[u8]) -> StorageResult<u64>;

    /// Hands appended bytes to the OS.
    fn flush(&mut self) -> StorageResult<()>;

    /// Waits until appended bytes are on stable storage.
    fn sync(&mut self) -> StorageResult<()>;

    /// Current log size in bytes.
    fn size(&self) -> StorageResult<u64>;

    /// Drops every byte. Used by the cold rebuild.
    fn clear(&mut self) -> StorageResult<()>;
}

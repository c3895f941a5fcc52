//! In-memory record log.

use crate::backend::StorageBackend;
use crate::error::StorageResult;
use parking_lot::RwLock;
use std::sync::Arc;

/// A record log held in memory.
///
/// Clones share one buffer: a database reopened over a clone replays what
/// the previous handle wrote, and a test can damage the bytes in between.
///
/// ```rust
/// use tillsync_storage::{InMemoryBackend, StorageBackend};
///
/// let mut log = InMemoryBackend::new();
/// let view = log.clone();
/// log.append(b"abc").unwrap();
/// assert_eq!(view.size().unwrap(), 3);
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// An empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A log that starts out holding `bytes`.
    #[must_use]
    pub fn with_data(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(bytes)),
        }
    }

    /// Copy of the current bytes.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }

    /// Overwrites the byte at `offset`; no-op past the end.
    pub fn poke(&self, offset: usize, byte: u8) {
        if let Some(slot) = self.bytes.write().get_mut(offset) {
            *slot = byte;
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn load(&self) -> StorageResult<Vec<u8>> {
        Ok(self.snapshot())
    }

    fn append(&mut self, batch: &[u8]) -> StorageResult<u64> {
        let mut bytes = self.bytes.write();
        let before = bytes.len() as u64;
        bytes.extend_from_slice(batch);
        Ok(before)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.bytes.read().len() as u64)
    }

    fn clear(&mut self) -> StorageResult<()> {
        self.bytes.write().clear();
        Ok(())
    }
}

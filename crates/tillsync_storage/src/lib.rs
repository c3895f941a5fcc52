//! # tillsync storage
//!
//! Where the local database's record log lives.
//!
//! The database appends whole committed batches of framed records and
//! replays the full log when it opens. A backend only keeps bytes in
//! order; framing and checksums belong to the database.
//!
//! - [`InMemoryBackend`] for tests and ephemeral databases. Clones share bytes.
//! - [`FileBackend`] for a device: one file, held under an exclusive lock.
//!
//! ```rust
//! use tillsync_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut log = InMemoryBackend::new();
//! log.append(b"batch-1").unwrap();
//! assert_eq!(log.load().unwrap(), b"batch-1");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;

//! # tillsync protocol
//!
//! Types exchanged between the replication engine and the remote document
//! store:
//! - [`RemoteDocument`] and [`RemoteValue`], the remote's native shape
//! - [`ServerTimestamp`] and its canonical string form
//! - [`Checkpoint`], the pull cursor
//! - [`RemoteChange`] for the live subscription
//! - [`SyncConflict`] and [`PushOutcome`] for the push path
//!
//! This is a pure protocol crate with no I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod checkpoint;
mod conflict;
mod document;
mod error;
mod timestamp;

pub use change::{ChangeKind, RemoteChange};
pub use checkpoint::Checkpoint;
pub use conflict::{ConflictReason, PushOutcome, PushSummary, SyncConflict};
pub use document::{
    normalize_document, RemoteDocument, RemoteValue, FIELD_DELETED, FIELD_ID, FIELD_UPDATED_AT,
    FIELD_VERSION,
};
pub use error::{ProtocolError, ProtocolResult};
pub use timestamp::ServerTimestamp;

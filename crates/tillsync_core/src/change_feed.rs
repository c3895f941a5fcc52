//! Change feed for observing committed writes.
//!
//! Every committed upsert or removal is broadcast after it reaches the
//! record log. UI consumers subscribe to refresh their views; the origin
//! tells them whether the write came from this device or from replication.
//!
//! ```rust,ignore
//! let mut changes = db.subscribe();
//! while let Ok(event) = changes.recv().await {
//!     println!("{} {} {:?}", event.collection, event.id, event.change_type);
//! }
//! ```

/// Type of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    /// No visible record existed before.
    Insert,
    /// A visible record was replaced.
    Update,
    /// The record was removed or tombstoned.
    Delete,
}

/// Who produced a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeOrigin {
    /// A write made on this device. Marks synced records pending.
    #[default]
    Local,
    /// A write applied by the replication engine. Never pending.
    Replication,
}

/// One committed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Collection name.
    pub collection: String,
    /// Primary key.
    pub id: String,
    /// What happened.
    pub change_type: ChangeType,
    /// Who did it.
    pub origin: ChangeOrigin,
}

impl ChangeEvent {
    /// Creates an event.
    pub fn new(
        collection: impl Into<String>,
        id: impl Into<String>,
        change_type: ChangeType,
        origin: ChangeOrigin,
    ) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            change_type,
            origin,
        }
    }
}

/// Capacity of the broadcast buffer. Slow subscribers observe `Lagged`.
pub(crate) const CHANGE_FEED_CAPACITY: usize = 1024;

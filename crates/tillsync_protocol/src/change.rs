//! Change notifications from the live subscription.

use crate::document::RemoteDocument;

/// Kind of change reported by the remote subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The document entered the subscribed window.
    Added,
    /// The document was rewritten.
    Modified,
    /// The document left the window or was deleted.
    Removed,
}

/// A single diff from the remote subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    /// What happened.
    pub kind: ChangeKind,
    /// The document as of the change.
    pub document: RemoteDocument,
}

impl RemoteChange {
    /// Creates an `Added` change.
    pub fn added(document: RemoteDocument) -> Self {
        Self {
            kind: ChangeKind::Added,
            document,
        }
    }

    /// Creates a `Modified` change.
    pub fn modified(document: RemoteDocument) -> Self {
        Self {
            kind: ChangeKind::Modified,
            document,
        }
    }

    /// Creates a `Removed` change.
    pub fn removed(document: RemoteDocument) -> Self {
        Self {
            kind: ChangeKind::Removed,
            document,
        }
    }

    /// Returns true for changes the live pull feeds downstream.
    pub fn is_upsert(&self) -> bool {
        matches!(self.kind, ChangeKind::Added | ChangeKind::Modified)
    }
}

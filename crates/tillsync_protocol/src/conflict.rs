//! Push results and conflict records.
//!
//! Conflicts are resolved by version alone: when the remote copy carries
//! a strictly greater version than the one a local write was computed
//! against, the local write loses and is dropped. There is no field-level
//! merge.

use std::fmt;

/// Why a push lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Another push for the same id was in flight in this process.
    InFlight,
    /// The remote copy is newer than the local write's base version.
    RemoteNewer,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictReason::InFlight => f.write_str("in-flight"),
            ConflictReason::RemoteNewer => f.write_str("remote-newer"),
        }
    }
}

/// A lost push. Recorded, never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConflict {
    /// Collection the document belongs to.
    pub collection: String,
    /// Document id.
    pub id: String,
    /// Version the local write was computed against.
    pub local_version: u64,
    /// Remote version observed, if the remote was read.
    pub remote_version: Option<u64>,
    /// Why the push lost.
    pub reason: ConflictReason,
}

/// Result of pushing one document.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// The remote now holds the local write at `version`.
    Written {
        /// Document id.
        id: String,
        /// New remote version (`local_version + 1`).
        version: u64,
    },
    /// The local write lost and was discarded.
    Conflict(SyncConflict),
    /// The transaction failed; the write stays pending.
    Failed {
        /// Document id.
        id: String,
        /// Failure description.
        error: String,
    },
}

impl PushOutcome {
    /// Document id this outcome is about.
    pub fn id(&self) -> &str {
        match self {
            PushOutcome::Written { id, .. } | PushOutcome::Failed { id, .. } => id,
            PushOutcome::Conflict(conflict) => &conflict.id,
        }
    }

    /// Returns true if the remote was mutated.
    pub fn is_written(&self) -> bool {
        matches!(self, PushOutcome::Written { .. })
    }

    /// Returns true if the write lost a conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, PushOutcome::Conflict(_))
    }
}

/// Tally of a push pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushSummary {
    /// Documents written to the remote.
    pub written: u64,
    /// Writes discarded by conflict.
    pub conflicts: u64,
    /// Writes left pending after a failure.
    pub failed: u64,
}

impl PushSummary {
    /// Counts one outcome.
    pub fn record(&mut self, outcome: &PushOutcome) {
        match outcome {
            PushOutcome::Written { .. } => self.written += 1,
            PushOutcome::Conflict(_) => self.conflicts += 1,
            PushOutcome::Failed { .. } => self.failed += 1,
        }
    }

    /// Adds another summary into this one.
    pub fn merge(&mut self, other: PushSummary) {
        self.written += other.written;
        self.conflicts += other.conflicts;
        self.failed += other.failed;
    }

    /// Total documents attempted.
    pub fn attempted(&self) -> u64 {
        self.written + self.conflicts + self.failed
    }
}

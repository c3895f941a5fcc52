//! Structured telemetry events and sinks.
//!
//! Every component reports what it observed through a [`TelemetrySink`].
//! Recoverable conditions (conflicts, failed pushes, lost connectivity) are
//! reported here instead of being returned as errors.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info, warn};

/// One structured telemetry event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryEvent {
    /// A database acquisition attempt failed or timed out.
    DbAcquireFailed {
        /// Rendered error.
        error: String,
    },
    /// Outcome of the guardian's cold rebuild.
    DbColdRebuild {
        /// Whether the rebuilt database was acquired.
        succeeded: bool,
        /// Rendered error if it was not.
        error: Option<String>,
    },
    /// Boot reached `Ready`.
    BootCompleted {
        /// Resolved authentication mode.
        mode: String,
    },
    /// Boot stopped before `Ready`.
    BootFailed {
        /// Rendered error.
        error: String,
    },
    /// The network monitor changed state.
    NetworkStatusChanged {
        /// Previous status.
        from: String,
        /// New status.
        to: String,
    },
    /// A request wrapped by the network monitor failed.
    NetworkRequestFailed {
        /// Caller-supplied request key.
        key: String,
        /// Whether the platform reported no connectivity.
        offline: bool,
        /// Rendered error.
        error: String,
    },
    /// A pull batch reached the local applier.
    ReplicationPullBatch {
        /// Collection name.
        collection: String,
        /// Number of documents.
        size: usize,
        /// `checkpoint` or `live`.
        source: String,
    },
    /// A push lost against a newer remote version or an in-flight push.
    ReplicationConflict {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
        /// Version the local write was computed against.
        local_version: u64,
        /// Remote version, when it was read.
        remote_version: Option<u64>,
        /// Why the push did not happen.
        reason: String,
    },
    /// A pulled document was not stored locally and will not be pulled again.
    ReplicationRejected {
        /// Collection name.
        collection: String,
        /// Document id, if the document carried one.
        id: Option<String>,
        /// Rendered validation error.
        reason: String,
    },
    /// A push transaction failed; the document stays pending.
    ReplicationPushFailed {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
        /// Rendered error.
        error: String,
    },
    /// A replication pass failed and may be retried.
    ReplicationPassFailed {
        /// Collection name.
        collection: String,
        /// Attempt number, starting at 0.
        attempt: u32,
        /// Rendered error.
        error: String,
    },
    /// A sync pass started.
    SyncStarted {
        /// Number of collections.
        collections: usize,
    },
    /// A sync pass finished.
    SyncCompleted {
        /// Number of collections.
        collections: usize,
        /// Wall time in milliseconds.
        duration_ms: u64,
    },
    /// A sync pass failed.
    SyncFailed {
        /// Rendered error.
        error: String,
    },
}

impl TelemetryEvent {
    /// Dotted event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DbAcquireFailed { .. } => "db.acquire_failed",
            Self::DbColdRebuild { .. } => "db.cold_rebuild",
            Self::BootCompleted { .. } => "boot.completed",
            Self::BootFailed { .. } => "boot.failed",
            Self::NetworkStatusChanged { .. } => "network.status_changed",
            Self::NetworkRequestFailed { .. } => "network.request_failed",
            Self::ReplicationPullBatch { .. } => "replication.pull_batch",
            Self::ReplicationConflict { .. } => "replication.conflict",
            Self::ReplicationRejected { .. } => "replication.rejected",
            Self::ReplicationPushFailed { .. } => "replication.push_failed",
            Self::ReplicationPassFailed { .. } => "replication.pass_failed",
            Self::SyncStarted { .. } => "sync.started",
            Self::SyncCompleted { .. } => "sync.completed",
            Self::SyncFailed { .. } => "sync.failed",
        }
    }
}

/// Receives telemetry events.
pub trait TelemetrySink: Send + Sync {
    /// Records one event. Must not block.
    fn record(&self, event: TelemetryEvent);
}

/// Shared sink handle.
pub type SharedTelemetry = Arc<dyn TelemetrySink>;

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TracingTelemetry {
    /// Creates a shared handle.
    pub fn shared() -> SharedTelemetry {
        Arc::new(Self)
    }
}

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: TelemetryEvent) {
        let name = event.name();
        match &event {
            TelemetryEvent::DbAcquireFailed { error } => {
                warn!(event = name, %error, "database acquisition failed");
            }
            TelemetryEvent::DbColdRebuild { succeeded: true, .. } => {
                info!(event = name, "cold rebuild succeeded");
            }
            TelemetryEvent::DbColdRebuild { error, .. } => {
                error!(event = name, error = ?error, "cold rebuild failed");
            }
            TelemetryEvent::BootFailed { error } | TelemetryEvent::SyncFailed { error } => {
                error!(event = name, %error);
            }
            TelemetryEvent::NetworkRequestFailed { key, offline, error } => {
                warn!(event = name, %key, offline, %error);
            }
            TelemetryEvent::ReplicationConflict {
                collection,
                id,
                local_version,
                remote_version,
                reason,
            } => {
                warn!(
                    event = name,
                    %collection,
                    %id,
                    local_version,
                    remote_version = ?remote_version,
                    %reason,
                    "local write dropped"
                );
            }
            TelemetryEvent::ReplicationRejected { collection, id, reason } => {
                warn!(event = name, %collection, id = ?id, %reason, "pulled document skipped");
            }
            TelemetryEvent::ReplicationPushFailed { collection, id, error } => {
                warn!(event = name, %collection, %id, %error);
            }
            TelemetryEvent::ReplicationPassFailed {
                collection,
                attempt,
                error,
            } => {
                warn!(event = name, %collection, attempt, %error);
            }
            other => info!(event = name, details = ?other),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    /// Creates an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All events so far.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    /// Number of events with this name.
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    /// Names of all events, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(TelemetryEvent::name).collect()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn record(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}

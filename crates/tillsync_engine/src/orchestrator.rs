//! Guarded sync trigger.
//!
//! At most one sync pass runs at a time. A trigger while one is running
//! is a no-op; callers re-trigger on the next reconnect instead of queuing.

use crate::network::{NetworkEvent, NetworkMonitor};
use crate::replication::{PassReport, Replicator};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tillsync_core::{SharedTelemetry, TelemetryEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Result of [`SyncOrchestrator::trigger_sync`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Every replicator finished its pass.
    Completed(Vec<PassReport>),
    /// Another pass was in flight; nothing was started.
    AlreadyRunning,
    /// The network was not reachable; nothing was started.
    Offline,
    /// At least one replicator failed.
    Failed(String),
}

impl TriggerOutcome {
    /// Whether a pass ran to completion.
    pub fn is_completed(&self) -> bool {
        matches!(self, TriggerOutcome::Completed(_))
    }
}

/// Clears the syncing flag however the pass ends.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Starts every replicator in response to network events.
pub struct SyncOrchestrator {
    replicators: Vec<Arc<dyn Replicator>>,
    network: Arc<NetworkMonitor>,
    telemetry: SharedTelemetry,
    syncing: AtomicBool,
}

impl fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("replicators", &self.replicators.len())
            .field("syncing", &self.is_syncing())
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    /// Creates an orchestrator.
    pub fn new(
        replicators: Vec<Arc<dyn Replicator>>,
        network: Arc<NetworkMonitor>,
        telemetry: SharedTelemetry,
    ) -> Arc<Self> {
        Arc::new(Self {
            replicators,
            network,
            telemetry,
            syncing: AtomicBool::new(false),
        })
    }

    /// Whether a pass is in flight.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// The network monitor this orchestrator follows.
    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    /// Runs one pass over every replicator, unless offline or already running.
    pub async fn trigger_sync(&self) -> TriggerOutcome {
        if !self.network.status().is_reachable() {
            debug!(status = %self.network.status(), "sync skipped, offline");
            return TriggerOutcome::Offline;
        }
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("sync already running");
            return TriggerOutcome::AlreadyRunning;
        }
        let _guard = SyncingGuard(&self.syncing);

        let collections = self.replicators.len();
        info!(collections, "sync started");
        self.telemetry
            .record(TelemetryEvent::SyncStarted { collections });
        let started = Instant::now();

        let mut passes = JoinSet::new();
        for replicator in &self.replicators {
            let replicator = Arc::clone(replicator);
            passes.spawn(async move {
                let result = replicator.start().await;
                (replicator.collection().to_string(), result)
            });
        }

        let mut reports = Vec::with_capacity(collections);
        let mut failures = Vec::new();
        while let Some(joined) = passes.join_next().await {
            match joined {
                Ok((_, Ok(report))) => reports.push(report),
                Ok((collection, Err(e))) => failures.push(format!("{collection}: {e}")),
                Err(e) => failures.push(format!("replication task failed: {e}")),
            }
        }

        if failures.is_empty() {
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            info!(collections, duration_ms, "sync completed");
            self.telemetry.record(TelemetryEvent::SyncCompleted {
                collections,
                duration_ms,
            });
            reports.sort_by(|a, b| a.collection.cmp(&b.collection));
            TriggerOutcome::Completed(reports)
        } else {
            let error = failures.join("; ");
            warn!(%error, "sync failed");
            self.telemetry
                .record(TelemetryEvent::SyncFailed { error: error.clone() });
            TriggerOutcome::Failed(error)
        }
    }

    /// Fire-and-forget form of [`trigger_sync`](Self::trigger_sync).
    pub fn trigger_sync_detached(self: &Arc<Self>) -> JoinHandle<TriggerOutcome> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.trigger_sync().await })
    }

    /// Triggers a sync for every resync request the network monitor
    /// publishes, until the monitor goes away.
    pub fn listen(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut events = self.network.subscribe_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(NetworkEvent::ResyncRequested) => {
                        let outcome = orchestrator.trigger_sync().await;
                        debug!(?outcome, "resync handled");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Collapsed requests still deserve one pass.
                        debug!(skipped, "resync requests collapsed");
                        orchestrator.trigger_sync().await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("sync listener stopped");
        })
    }

    /// Cancels every replicator.
    pub fn cancel_all(&self) {
        for replicator in &self.replicators {
            replicator.cancel();
        }
    }
}

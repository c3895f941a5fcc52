//! Per-collection replication engine.
//!
//! One engine keeps one local collection and its remote counterpart
//! eventually consistent:
//!
//! - **Catch-up pull**: pages through the remote ordered by `updatedAt`,
//!   strictly after the stored checkpoint. Each page is applied together
//!   with the advanced checkpoint in one local transaction.
//! - **Live pull**: a standing subscription to the newest documents,
//!   fed into the same stream as catch-up pages.
//! - **Push**: pending local writes in batches, each document in its own
//!   remote transaction, guarded by the write-lock set.
//!
//! Both pulls feed a single `mpsc` stream whose only consumer is the
//! local applier task. Conflicts resolve by version alone.

use crate::backoff::BackoffConfig;
use crate::error::{EngineError, EngineResult};
use crate::remote::{RemoteStore, TransactionBody, TransactionDecision, TransactionResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tillsync_core::collections::{synced_collection_names, REPLICATION_CHECKPOINTS};
use tillsync_core::{
    ChangeOrigin, CoreError, Database, Document, RecordEntry, SharedTelemetry, TelemetryEvent,
};
use tillsync_protocol::{
    normalize_document, Checkpoint, ConflictReason, PushOutcome, PushSummary, RemoteDocument,
    SyncConflict, FIELD_ID, FIELD_UPDATED_AT,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Suffix of a collection's replication identifier.
pub const REPLICATION_SUFFIX: &str = "-rx";

const PULL_STREAM_CAPACITY: usize = 64;

/// Replication settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationConfig {
    /// Documents per catch-up page.
    pub pull_batch_size: usize,
    /// Pending writes per push batch.
    pub push_batch_size: usize,
    /// Newest documents replayed when the live subscription opens.
    pub live_window: usize,
    /// Attempts per pass before `start` gives up.
    pub max_pass_attempts: u32,
    /// Delay between pass attempts.
    pub backoff: BackoffConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            pull_batch_size: 100,
            push_batch_size: 50,
            live_window: 25,
            max_pass_attempts: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Sets the catch-up page size.
    #[must_use]
    pub fn with_pull_batch_size(mut self, size: usize) -> Self {
        self.pull_batch_size = size.max(1);
        self
    }

    /// Sets the push batch size.
    #[must_use]
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Sets the live window.
    #[must_use]
    pub fn with_live_window(mut self, window: usize) -> Self {
        self.live_window = window;
        self
    }

    /// Sets the attempts per pass.
    #[must_use]
    pub fn with_max_pass_attempts(mut self, attempts: u32) -> Self {
        self.max_pass_attempts = attempts.max(1);
        self
    }

    /// Sets the backoff policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Where a pulled batch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullSource {
    /// A catch-up page.
    Checkpoint,
    /// A live subscription change.
    Live,
}

impl fmt::Display for PullSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PullSource::Checkpoint => f.write_str("checkpoint"),
            PullSource::Live => f.write_str("live"),
        }
    }
}

/// A pulled document that was not stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedDocument {
    /// Document id, if it had one.
    pub id: Option<String>,
    /// Rendered validation error.
    pub reason: String,
}

/// What applying pulled documents did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// Documents written locally.
    pub applied: usize,
    /// Documents kept out by the version rule or an in-flight push.
    pub skipped: usize,
    /// Documents the local schema refused. The checkpoint still moves past them.
    pub rejected: Vec<RejectedDocument>,
    /// Pending local writes replaced by a newer remote version.
    pub overwritten: Vec<SyncConflict>,
}

impl ApplySummary {
    fn merge(&mut self, other: ApplySummary) {
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.rejected.extend(other.rejected);
        self.overwritten.extend(other.overwritten);
    }
}

/// One item of the unified pull stream.
#[derive(Debug)]
pub struct PullEvent {
    /// Origin of the batch.
    pub source: PullSource,
    /// Normalized documents.
    pub documents: Vec<Document>,
    /// Checkpoint to store with the batch (catch-up only).
    pub checkpoint: Option<Checkpoint>,
    /// Completion signal (catch-up only).
    pub ack: Option<oneshot::Sender<EngineResult<ApplySummary>>>,
}

/// Outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Collection name.
    pub collection: String,
    /// Catch-up pages applied.
    pub pull_batches: usize,
    /// Catch-up apply counts.
    pub pulled: ApplySummary,
    /// Checkpoint after the pass.
    pub checkpoint: Option<Checkpoint>,
    /// Push counts.
    pub push: PushSummary,
}

/// Ids with a push in flight.
///
/// An id is held from before its remote transaction starts until the
/// returned guard drops, whatever the outcome.
#[derive(Debug, Clone, Default)]
pub struct WriteLockSet {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl WriteLockSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes `id`, or returns `None` if a push for it is in flight.
    pub fn try_acquire(&self, id: &str) -> Option<WriteLockGuard> {
        if !self.ids.lock().insert(id.to_string()) {
            return None;
        }
        Some(WriteLockGuard {
            set: self.clone(),
            id: id.to_string(),
        })
    }

    /// Whether `id` is held.
    pub fn contains(&self, id: &str) -> bool {
        self.ids.lock().contains(id)
    }

    /// Number of held ids.
    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    /// Whether no id is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its id on drop.
#[derive(Debug)]
pub struct WriteLockGuard {
    set: WriteLockSet,
    id: String,
}

impl Drop for WriteLockGuard {
    fn drop(&mut self) {
        self.set.ids.lock().remove(&self.id);
    }
}

/// Replication identifier of a collection.
pub fn replication_identifier(collection: &str) -> String {
    format!("{collection}{REPLICATION_SUFFIX}")
}

/// Reads a stored checkpoint.
pub fn load_checkpoint(db: &Database, identifier: &str) -> EngineResult<Option<Checkpoint>> {
    Ok(db
        .collection(REPLICATION_CHECKPOINTS)?
        .find_one(identifier)?
        .and_then(|doc| {
            doc.get(FIELD_UPDATED_AT)
                .and_then(Value::as_str)
                .map(Checkpoint::new)
        }))
}

/// Applies pulled documents, and optionally a checkpoint, atomically.
///
/// A remote document replaces the local one when there is none, when it
/// is strictly newer, or when versions tie and the local copy has no
/// pending write. Ids in `locks` are left alone: their push decides the
/// local copy. A pending write replaced this way is listed in
/// [`ApplySummary::overwritten`]. The stored checkpoint never moves
/// backwards.
pub fn apply_pull_batch(
    db: &Database,
    collection: &str,
    identifier: &str,
    documents: Vec<Document>,
    checkpoint: Option<&Checkpoint>,
    locks: &WriteLockSet,
) -> EngineResult<ApplySummary> {
    let summary = db.transaction(ChangeOrigin::Replication, |txn| {
        let mut summary = ApplySummary::default();
        for doc in documents {
            let (id, remote_version) = match RemoteDocument::local_envelope(&doc) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(%collection, error = %e, "pulled document has no usable envelope");
                    summary.rejected.push(RejectedDocument {
                        id: doc.get(FIELD_ID).and_then(Value::as_str).map(str::to_string),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if locks.contains(&id) {
                debug!(%collection, %id, remote_version, "push in flight, pulled copy ignored");
                summary.skipped += 1;
                continue;
            }
            let (replace, pending_version) = match txn.entry(collection, &id)? {
                None => (true, None),
                Some(local) => (
                    remote_version > local.version()
                        || (remote_version == local.version() && !local.pending),
                    local.pending.then(|| local.version()),
                ),
            };
            if !replace {
                debug!(%collection, %id, remote_version, "local copy kept");
                summary.skipped += 1;
                continue;
            }
            match txn.put(collection, doc) {
                Ok(_) => {
                    summary.applied += 1;
                    if let Some(local_version) = pending_version {
                        summary.overwritten.push(SyncConflict {
                            collection: collection.to_string(),
                            id,
                            local_version,
                            remote_version: Some(remote_version),
                            reason: ConflictReason::RemoteNewer,
                        });
                    }
                }
                Err(CoreError::SchemaViolation { message, .. }) => {
                    warn!(%collection, %id, %message, "pulled document rejected by schema");
                    summary.rejected.push(RejectedDocument {
                        id: Some(id),
                        reason: message,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(checkpoint) = checkpoint {
            let stored = txn
                .get(REPLICATION_CHECKPOINTS, identifier)?
                .and_then(|d| d.get(FIELD_UPDATED_AT).and_then(Value::as_str).map(Checkpoint::new));
            let next = checkpoint.clone().max(stored.clone());
            if stored.as_ref() != Some(&next) {
                let mut doc = Document::new();
                doc.insert(FIELD_ID.into(), Value::String(identifier.to_string()));
                doc.insert(FIELD_UPDATED_AT.into(), Value::String(next.updated_at));
                txn.put(REPLICATION_CHECKPOINTS, doc)?;
            }
        }
        Ok(summary)
    })?;
    Ok(summary)
}

/// Something the orchestrator can start and cancel.
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Collection name.
    fn collection(&self) -> &str;

    /// Arms live replication and runs one pass.
    async fn start(&self) -> EngineResult<PassReport>;

    /// Stops live replication and further batches.
    fn cancel(&self);
}

#[derive(Default)]
struct Tasks {
    pull_tx: Option<mpsc::Sender<PullEvent>>,
    applier: Option<JoinHandle<()>>,
    live: Option<JoinHandle<()>>,
}

struct Shared {
    collection: String,
    identifier: String,
    db: Arc<Database>,
    remote: Arc<dyn RemoteStore>,
    config: ReplicationConfig,
    telemetry: SharedTelemetry,
    locks: WriteLockSet,
    cancelled: AtomicBool,
    tasks: Mutex<Tasks>,
}

/// Replication engine for one collection.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ReplicationEngine {
    shared: Arc<Shared>,
}

impl fmt::Debug for ReplicationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationEngine")
            .field("collection", &self.shared.collection)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl ReplicationEngine {
    /// Creates an engine for `collection`.
    pub fn new(
        collection: impl Into<String>,
        db: Arc<Database>,
        remote: Arc<dyn RemoteStore>,
        config: ReplicationConfig,
        telemetry: SharedTelemetry,
    ) -> Self {
        let collection = collection.into();
        Self {
            shared: Arc::new(Shared {
                identifier: replication_identifier(&collection),
                collection,
                db,
                remote,
                config,
                telemetry,
                locks: WriteLockSet::new(),
                cancelled: AtomicBool::new(false),
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    /// One engine per synced collection present in `db`.
    pub fn for_synced_collections(
        db: &Arc<Database>,
        remote: &Arc<dyn RemoteStore>,
        config: ReplicationConfig,
        telemetry: &SharedTelemetry,
    ) -> Vec<Self> {
        synced_collection_names()
            .into_iter()
            .filter(|name| db.has_collection(name))
            .map(|name| {
                Self::new(
                    name,
                    Arc::clone(db),
                    Arc::clone(remote),
                    config,
                    Arc::clone(telemetry),
                )
            })
            .collect()
    }

    /// Collection name.
    pub fn collection(&self) -> &str {
        &self.shared.collection
    }

    /// Replication identifier (`<collection>-rx`).
    pub fn identifier(&self) -> &str {
        &self.shared.identifier
    }

    /// Stored checkpoint.
    pub fn checkpoint(&self) -> EngineResult<Option<Checkpoint>> {
        load_checkpoint(&self.shared.db, &self.shared.identifier)
    }

    /// The write-lock set.
    pub fn write_locks(&self) -> &WriteLockSet {
        &self.shared.locks
    }

    /// Whether live replication is armed.
    pub fn is_running(&self) -> bool {
        self.shared.tasks.lock().pull_tx.is_some()
    }

    /// Arms live replication if needed and runs one pass, retrying
    /// transient failures with backoff.
    pub async fn start(&self) -> EngineResult<PassReport> {
        let stream = self.arm();
        self.run_pass(&stream).await
    }

    /// Starts the applier and the live subscription. A second call while
    /// armed only revives a live subscription that ended.
    fn arm(&self) -> mpsc::Sender<PullEvent> {
        let shared = &self.shared;
        let mut tasks = shared.tasks.lock();
        shared.cancelled.store(false, Ordering::SeqCst);

        if let Some(tx) = tasks.pull_tx.clone() {
            if tasks.live.as_ref().map_or(true, JoinHandle::is_finished) {
                debug!(collection = %shared.collection, "reopening live subscription");
                tasks.live = Some(tokio::spawn(run_live(Arc::clone(shared), tx.clone())));
            }
            return tx;
        }

        let (tx, rx) = mpsc::channel(PULL_STREAM_CAPACITY);
        tasks.applier = Some(tokio::spawn(run_applier(Arc::clone(shared), rx)));
        tasks.live = Some(tokio::spawn(run_live(Arc::clone(shared), tx.clone())));
        tasks.pull_tx = Some(tx.clone());
        info!(collection = %shared.collection, "replication started");
        tx
    }

    /// Stops the live subscription and further batches. In-flight remote
    /// transactions finish on their own.
    pub fn cancel(&self) {
        let shared = &self.shared;
        shared.cancelled.store(true, Ordering::SeqCst);
        let mut tasks = shared.tasks.lock();
        if tasks.pull_tx.take().is_none() {
            debug!(collection = %shared.collection, "replication already stopped");
            return;
        }
        if let Some(live) = tasks.live.take() {
            live.abort();
        }
        // The applier drains what is queued and exits once every sender is gone.
        tasks.applier.take();
        info!(collection = %shared.collection, "replication cancelled");
    }

    /// Follows an auth feed: a user starts the engine, `None` cancels it.
    pub fn bind_auth(&self, mut auth: watch::Receiver<Option<String>>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                let user = auth.borrow_and_update().clone();
                match user {
                    Some(uid) => {
                        debug!(collection = %engine.collection(), %uid, "authenticated, starting");
                        if let Err(e) = engine.start().await {
                            warn!(collection = %engine.collection(), error = %e, "replication pass failed");
                        }
                    }
                    None => engine.cancel(),
                }
                if auth.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    async fn run_pass(&self, stream: &mpsc::Sender<PullEvent>) -> EngineResult<PassReport> {
        let shared = &self.shared;
        let attempts = shared.config.max_pass_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            match self.pass(stream).await {
                Ok(report) => {
                    info!(
                        collection = %shared.collection,
                        pulled = report.pulled.applied,
                        attempted = report.push.attempted(),
                        pushed = report.push.written,
                        conflicts = report.push.conflicts,
                        "replication pass complete"
                    );
                    return Ok(report);
                }
                Err(e) => {
                    warn!(collection = %shared.collection, attempt, error = %e, "replication pass failed");
                    shared.telemetry.record(TelemetryEvent::ReplicationPassFailed {
                        collection: shared.collection.clone(),
                        attempt,
                        error: e.to_string(),
                    });
                    let cancelled = shared.cancelled.load(Ordering::SeqCst);
                    if attempt + 1 >= attempts || !e.is_retryable() || cancelled {
                        return Err(e);
                    }
                    tokio::time::sleep(shared.config.backoff.delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn pass(&self, stream: &mpsc::Sender<PullEvent>) -> EngineResult<PassReport> {
        let (pulled, pull_batches, checkpoint) = self.catch_up(stream).await?;
        let push = self.push_pending().await?;
        Ok(PassReport {
            collection: self.shared.collection.clone(),
            pull_batches,
            pulled,
            checkpoint,
            push,
        })
    }

    async fn catch_up(
        &self,
        stream: &mpsc::Sender<PullEvent>,
    ) -> EngineResult<(ApplySummary, usize, Option<Checkpoint>)> {
        let shared = &self.shared;
        let batch_size = shared.config.pull_batch_size.max(1);
        let mut checkpoint = load_checkpoint(&shared.db, &shared.identifier)?;
        let mut total = ApplySummary::default();
        let mut batches = 0usize;

        loop {
            shared.ensure_active()?;
            let page = shared
                .remote
                .query_after(&shared.collection, checkpoint.as_ref(), batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            let next = Checkpoint::at(last.updated_at)?;
            let full = page.len() >= batch_size;
            let documents = page
                .iter()
                .map(normalize_document)
                .collect::<Result<Vec<_>, _>>()?;

            shared.telemetry.record(TelemetryEvent::ReplicationPullBatch {
                collection: shared.collection.clone(),
                size: documents.len(),
                source: PullSource::Checkpoint.to_string(),
            });

            let (ack, applied) = oneshot::channel();
            stream
                .send(PullEvent {
                    source: PullSource::Checkpoint,
                    documents,
                    checkpoint: Some(next.clone()),
                    ack: Some(ack),
                })
                .await
                .map_err(|_| EngineError::StreamClosed)?;
            let summary = applied.await.map_err(|_| EngineError::StreamClosed)??;

            total.merge(summary);
            batches += 1;
            debug!(collection = %shared.collection, checkpoint = %next.updated_at, "catch-up page applied");
            checkpoint = Some(next);
            if !full {
                break;
            }
        }
        Ok((total, batches, checkpoint))
    }

    /// Pushes pending writes until none are left or a batch makes no progress.
    pub async fn push_pending(&self) -> EngineResult<PushSummary> {
        let shared = &self.shared;
        let batch_size = shared.config.push_batch_size.max(1);
        let mut summary = PushSummary::default();
        loop {
            shared.ensure_active()?;
            let batch = shared
                .db
                .collection(&shared.collection)?
                .pending_writes(batch_size)?;
            if batch.is_empty() {
                break;
            }
            let full = batch.len() >= batch_size;

            let mut round = PushSummary::default();
            for outcome in self.push_documents(batch).await {
                round.record(&outcome);
            }
            summary.merge(round);
            if !full || round.written + round.conflicts == 0 {
                break;
            }
        }
        Ok(summary)
    }

    /// Pushes each entry concurrently. A failure never affects siblings.
    pub async fn push_documents(&self, entries: Vec<RecordEntry>) -> Vec<PushOutcome> {
        let mut tasks = JoinSet::new();
        for entry in entries {
            let shared = Arc::clone(&self.shared);
            tasks.spawn(async move { shared.push_one(entry).await });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(collection = %self.shared.collection, error = %e, "push task died"),
            }
        }
        outcomes
    }
}

impl Shared {
    fn ensure_active(&self) -> EngineResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn report_conflict(&self, conflict: &SyncConflict) {
        self.telemetry.record(TelemetryEvent::ReplicationConflict {
            collection: conflict.collection.clone(),
            id: conflict.id.clone(),
            local_version: conflict.local_version,
            remote_version: conflict.remote_version,
            reason: conflict.reason.to_string(),
        });
    }

    async fn push_one(&self, entry: RecordEntry) -> PushOutcome {
        let local_version = entry.version();
        let conflict = |remote_version, reason| SyncConflict {
            collection: self.collection.clone(),
            id: entry.id.clone(),
            local_version,
            remote_version,
            reason,
        };

        let Some(_lock) = self.locks.try_acquire(&entry.id) else {
            let conflict = conflict(None, ConflictReason::InFlight);
            self.report_conflict(&conflict);
            return PushOutcome::Conflict(conflict);
        };

        let fields = RemoteDocument::fields_from_local(&entry.document);
        let body: TransactionBody = Box::new(move |current| match current {
            Some(remote) if remote.version > local_version => TransactionDecision::Abort,
            _ => TransactionDecision::Write {
                fields,
                version: local_version + 1,
            },
        });

        match self
            .remote
            .run_transaction(&self.collection, &entry.id, body)
            .await
        {
            Ok(TransactionResult::Committed(doc)) => {
                let acknowledged = self
                    .db
                    .collection(&self.collection)
                    .and_then(|c| c.acknowledge_push(&entry.id, entry.rev, doc.version));
                if let Err(e) = acknowledged {
                    warn!(collection = %self.collection, id = %entry.id, error = %e, "pushed but could not acknowledge locally");
                }
                debug!(collection = %self.collection, id = %entry.id, version = doc.version, "pushed");
                PushOutcome::Written {
                    id: entry.id,
                    version: doc.version,
                }
            }
            Ok(TransactionResult::Declined(current)) => {
                let conflict = conflict(
                    current.as_ref().map(|d| d.version),
                    ConflictReason::RemoteNewer,
                );
                if let Some(remote) = current {
                    let discarded = normalize_document(&remote)
                        .map_err(EngineError::from)
                        .and_then(|doc| {
                            self.db
                                .collection(&self.collection)
                                .and_then(|c| c.discard_local(doc))
                                .map_err(EngineError::from)
                        });
                    if let Err(e) = discarded {
                        warn!(collection = %self.collection, id = %entry.id, error = %e, "could not take remote copy");
                    }
                }
                self.report_conflict(&conflict);
                PushOutcome::Conflict(conflict)
            }
            Err(e) => {
                warn!(collection = %self.collection, id = %entry.id, error = %e, "push failed, will retry");
                self.telemetry.record(TelemetryEvent::ReplicationPushFailed {
                    collection: self.collection.clone(),
                    id: entry.id.clone(),
                    error: e.to_string(),
                });
                PushOutcome::Failed {
                    id: entry.id,
                    error: e.to_string(),
                }
            }
        }
    }
}

#[async_trait]
impl Replicator for ReplicationEngine {
    fn collection(&self) -> &str {
        ReplicationEngine::collection(self)
    }

    async fn start(&self) -> EngineResult<PassReport> {
        ReplicationEngine::start(self).await
    }

    fn cancel(&self) {
        ReplicationEngine::cancel(self)
    }
}

async fn run_applier(shared: Arc<Shared>, mut stream: mpsc::Receiver<PullEvent>) {
    while let Some(event) = stream.recv().await {
        let size = event.documents.len();
        let result = apply_pull_batch(
            &shared.db,
            &shared.collection,
            &shared.identifier,
            event.documents,
            event.checkpoint.as_ref(),
            &shared.locks,
        );
        match &result {
            Ok(summary) => {
                debug!(
                    collection = %shared.collection,
                    source = %event.source,
                    size,
                    applied = summary.applied,
                    "pull batch applied"
                );
                for conflict in &summary.overwritten {
                    shared.report_conflict(conflict);
                }
                for rejected in &summary.rejected {
                    shared.telemetry.record(TelemetryEvent::ReplicationRejected {
                        collection: shared.collection.clone(),
                        id: rejected.id.clone(),
                        reason: rejected.reason.clone(),
                    });
                }
            }
            Err(e) => warn!(collection = %shared.collection, source = %event.source, error = %e, "pull batch failed"),
        }
        if let Some(ack) = event.ack {
            // The pass may have given up waiting.
            let _ = ack.send(result);
        }
    }
    debug!(collection = %shared.collection, "applier stopped");
}

async fn run_live(shared: Arc<Shared>, stream: mpsc::Sender<PullEvent>) {
    let mut subscription = match shared
        .remote
        .subscribe(&shared.collection, shared.config.live_window)
        .await
    {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(collection = %shared.collection, error = %e, "live subscription failed");
            return;
        }
    };

    while let Some(change) = subscription.recv().await {
        if !change.is_upsert() {
            debug!(collection = %shared.collection, id = %change.document.id, "ignoring remote removal");
            continue;
        }
        let document = match normalize_document(&change.document) {
            Ok(document) => document,
            Err(e) => {
                warn!(collection = %shared.collection, error = %e, "live document not normalizable");
                continue;
            }
        };
        shared.telemetry.record(TelemetryEvent::ReplicationPullBatch {
            collection: shared.collection.clone(),
            size: 1,
            source: PullSource::Live.to_string(),
        });
        let event = PullEvent {
            source: PullSource::Live,
            documents: vec![document],
            checkpoint: None,
            ack: None,
        };
        if stream.send(event).await.is_err() {
            break;
        }
    }
    debug!(collection = %shared.collection, "live subscription ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;
    use serde_json::json;
    use std::time::Duration;
    use tillsync_core::{app_collections, ChangeType, RecordingTelemetry};

    struct Fixture {
        db: Arc<Database>,
        remote: Arc<MemoryRemoteStore>,
        telemetry: Arc<RecordingTelemetry>,
    }

    impl Fixture {
        fn new() -> Self {
            let db = Database::open_in_memory().unwrap();
            db.add_collections(app_collections()).unwrap();
            Self {
                db: Arc::new(db),
                remote: Arc::new(MemoryRemoteStore::new()),
                telemetry: RecordingTelemetry::new(),
            }
        }

        fn engine(&self, collection: &str, config: ReplicationConfig) -> ReplicationEngine {
            ReplicationEngine::new(
                collection,
                self.db.clone(),
                self.remote.clone(),
                config,
                self.telemetry.clone(),
            )
        }
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn remote_users(fx: &Fixture, n: usize) {
        for i in 0..n {
            fx.remote
                .put_json("users", &format!("u{i:02}"), json!({"name": format!("User {i}")}), 1);
        }
    }

    #[test]
    fn write_lock_guard_releases_on_drop() {
        let locks = WriteLockSet::new();
        let guard = locks.try_acquire("a").unwrap();
        assert!(locks.try_acquire("a").is_none());
        assert!(locks.contains("a"));
        let other = locks.try_acquire("b").unwrap();
        assert_eq!(locks.len(), 2);
        drop(guard);
        drop(other);
        assert!(locks.is_empty());
    }

    #[test]
    fn apply_rule() {
        let fx = Fixture::new();
        let users = fx.db.collection("users").unwrap();
        users.upsert(doc(json!({"id": "pending", "name": "mine", "version": 3}))).unwrap();
        apply_pull_batch(
            &fx.db,
            "users",
            "users-rx",
            vec![doc(json!({"id": "clean", "name": "old", "version": 3}))],
            None,
            &WriteLockSet::new(),
        )
        .unwrap();

        let summary = apply_pull_batch(
            &fx.db,
            "users",
            "users-rx",
            vec![
                doc(json!({"id": "fresh", "name": "new", "version": 1})),
                doc(json!({"id": "pending", "name": "theirs", "version": 3})),
                doc(json!({"id": "clean", "name": "same version", "version": 3})),
            ],
            None,
            &WriteLockSet::new(),
        )
        .unwrap();
        assert_eq!(summary.applied, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(users.find_one("pending").unwrap().unwrap()["name"], json!("mine"));
        assert_eq!(users.find_one("clean").unwrap().unwrap()["name"], json!("same version"));

        // Strictly newer wins over a pending write.
        let summary = apply_pull_batch(
            &fx.db,
            "users",
            "users-rx",
            vec![doc(json!({"id": "pending", "name": "theirs", "version": 4}))],
            None,
            &WriteLockSet::new(),
        )
        .unwrap();
        let entry = users.entry("pending").unwrap().unwrap();
        assert_eq!(entry.document["name"], json!("theirs"));
        assert!(!entry.pending);
        assert_eq!(
            summary.overwritten,
            vec![SyncConflict {
                collection: "users".into(),
                id: "pending".into(),
                local_version: 3,
                remote_version: Some(4),
                reason: ConflictReason::RemoteNewer,
            }]
        );
    }

    #[test]
    fn ids_with_a_push_in_flight_are_not_applied() {
        let fx = Fixture::new();
        let users = fx.db.collection("users").unwrap();
        users.upsert(doc(json!({"id": "u1", "name": "mine", "version": 1}))).unwrap();
        let locks = WriteLockSet::new();
        let _held = locks.try_acquire("u1").unwrap();

        let summary = apply_pull_batch(
            &fx.db,
            "users",
            "users-rx",
            vec![doc(json!({"id": "u1", "name": "theirs", "version": 2}))],
            None,
            &locks,
        )
        .unwrap();
        assert_eq!(summary.skipped, 1);
        assert!(summary.overwritten.is_empty());
        let entry = users.entry("u1").unwrap().unwrap();
        assert_eq!(entry.document["name"], json!("mine"));
        assert!(entry.pending);
    }

    #[test]
    fn checkpoint_never_moves_backwards() {
        let fx = Fixture::new();
        let locks = WriteLockSet::new();
        let later = Checkpoint::new("2024-05-01T10:00:00.000002Z");
        let earlier = Checkpoint::new("2024-05-01T10:00:00.000001Z");
        apply_pull_batch(&fx.db, "users", "users-rx", Vec::new(), Some(&later), &locks).unwrap();
        apply_pull_batch(&fx.db, "users", "users-rx", Vec::new(), Some(&earlier), &locks).unwrap();
        assert_eq!(load_checkpoint(&fx.db, "users-rx").unwrap(), Some(later));
    }

    #[test]
    fn schema_rejects_do_not_fail_the_batch() {
        let fx = Fixture::new();
        let summary = apply_pull_batch(
            &fx.db,
            "sales",
            "sales-rx",
            vec![
                doc(json!({"id": "s1", "version": 1})),
                doc(json!({"id": "s2", "items": [], "total": 3.5, "version": 1})),
            ],
            Some(&Checkpoint::new("2024-05-01T10:00:00.000000Z")),
            &WriteLockSet::new(),
        )
        .unwrap();
        assert_eq!(summary.rejected.len(), 1);
        assert_eq!(summary.rejected[0].id.as_deref(), Some("s1"));
        assert_eq!(summary.applied, 1);
        assert!(load_checkpoint(&fx.db, "sales-rx").unwrap().is_some());
    }

    #[tokio::test]
    async fn catch_up_pages_through_remote() {
        let fx = Fixture::new();
        remote_users(&fx, 7);
        let engine = fx.engine("users", ReplicationConfig::default().with_pull_batch_size(3));

        let report = engine.start().await.unwrap();
        assert_eq!(report.pull_batches, 3);
        assert_eq!(report.pulled.applied, 7);
        assert_eq!(fx.db.collection("users").unwrap().count().unwrap(), 7);
        assert!(fx.telemetry.count("replication.pull_batch") >= 3);

        let newest = fx.remote.get("users", "u06").unwrap();
        assert_eq!(
            engine.checkpoint().unwrap(),
            Some(Checkpoint::at(newest.updated_at).unwrap())
        );

        // Nothing new: an empty page ends catch-up at once.
        let again = engine.start().await.unwrap();
        assert_eq!(again.pull_batches, 0);
        engine.cancel();
    }

    #[tokio::test]
    async fn pulled_newer_version_reports_the_dropped_local_write() {
        let fx = Fixture::new();
        let users = fx.db.collection("users").unwrap();
        users.upsert(doc(json!({"id": "u1", "name": "mine", "version": 1}))).unwrap();
        fx.remote.put_json("users", "u1", json!({"name": "theirs"}), 3);
        let engine = fx.engine("users", ReplicationConfig::default());

        let report = engine.start().await.unwrap();
        assert_eq!(report.push.attempted(), 0);
        assert_eq!(users.find_one("u1").unwrap().unwrap()["name"], json!("theirs"));
        assert_eq!(fx.telemetry.count("replication.conflict"), 1);
        let conflict = fx
            .telemetry
            .events()
            .into_iter()
            .find(|e| e.name() == "replication.conflict")
            .unwrap();
        assert_eq!(
            conflict,
            TelemetryEvent::ReplicationConflict {
                collection: "users".into(),
                id: "u1".into(),
                local_version: 1,
                remote_version: Some(3),
                reason: "remote-newer".into(),
            }
        );
        engine.cancel();
    }

    #[tokio::test]
    async fn schema_rejects_are_reported_and_skipped_for_good() {
        let fx = Fixture::new();
        let nameless = fx.remote.put_json("users", "u1", json!({"role": "cashier"}), 1);
        let engine = fx.engine("users", ReplicationConfig::default().with_live_window(0));

        let report = engine.start().await.unwrap();
        assert_eq!(report.pulled.rejected.len(), 1);
        assert!(fx.db.collection("users").unwrap().find_one("u1").unwrap().is_none());
        assert_eq!(
            engine.checkpoint().unwrap(),
            Some(Checkpoint::at(nameless.updated_at).unwrap())
        );
        let rejected = fx
            .telemetry
            .events()
            .into_iter()
            .find(|e| e.name() == "replication.rejected")
            .unwrap();
        assert!(matches!(
            rejected,
            TelemetryEvent::ReplicationRejected { ref collection, ref id, .. }
                if collection == "users" && id.as_deref() == Some("u1")
        ));

        let again = engine.start().await.unwrap();
        assert_eq!(again.pull_batches, 0);
        assert_eq!(fx.telemetry.count("replication.rejected"), 1);
        engine.cancel();
    }

    #[tokio::test]
    async fn push_advances_version() {
        let fx = Fixture::new();
        fx.remote.put_json("products", "p1", json!({"name": "Tea"}), 5);
        let engine = fx.engine("products", ReplicationConfig::default());
        engine.start().await.unwrap();

        let products = fx.db.collection("products").unwrap();
        products
            .upsert(doc(json!({"id": "p1", "name": "Green tea", "version": 5})))
            .unwrap();
        let summary = engine.push_pending().await.unwrap();
        assert_eq!(summary.written, 1);

        let remote = fx.remote.get("products", "p1").unwrap();
        assert_eq!(remote.version, 6);
        let local = products.entry("p1").unwrap().unwrap();
        assert_eq!(local.version(), 6);
        assert!(!local.pending);
        assert!(engine.write_locks().is_empty());
        engine.cancel();
    }

    #[tokio::test]
    async fn newer_remote_discards_local_write() {
        let fx = Fixture::new();
        fx.remote.put_json("products", "p1", json!({"name": "Remote"}), 7);
        let engine = fx.engine("products", ReplicationConfig::default());

        let products = fx.db.collection("products").unwrap();
        products
            .upsert(doc(json!({"id": "p1", "name": "Local", "version": 5})))
            .unwrap();
        let entries = products.pending_writes(10).unwrap();
        let outcomes = engine.push_documents(entries).await;

        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            PushOutcome::Conflict(c) => {
                assert_eq!(c.reason, ConflictReason::RemoteNewer);
                assert_eq!(c.local_version, 5);
                assert_eq!(c.remote_version, Some(7));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(fx.remote.get("products", "p1").unwrap().version, 7);
        let local = products.entry("p1").unwrap().unwrap();
        assert_eq!(local.document["name"], json!("Remote"));
        assert!(!local.pending);
        assert_eq!(fx.telemetry.count("replication.conflict"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_pushes_of_one_id_write_once() {
        let fx = Fixture::new();
        fx.remote.put_json("customers", "c1", json!({"name": "Ana"}), 5);
        fx.remote.set_transaction_delay(Duration::from_millis(20));
        let engine = fx.engine("customers", ReplicationConfig::default());

        let customers = fx.db.collection("customers").unwrap();
        customers
            .upsert(doc(json!({"id": "c1", "name": "Ana B", "version": 5})))
            .unwrap();
        let entry = customers.pending_writes(1).unwrap().remove(0);
        let writes_before = fx.remote.write_count();

        let outcomes = engine.push_documents(vec![entry.clone(), entry]).await;
        assert_eq!(outcomes.iter().filter(|o| o.is_written()).count(), 1);
        let conflict = outcomes.iter().find(|o| o.is_conflict()).unwrap();
        assert!(matches!(
            conflict,
            PushOutcome::Conflict(SyncConflict { reason: ConflictReason::InFlight, .. })
        ));
        assert_eq!(fx.remote.write_count(), writes_before + 1);
        assert_eq!(fx.remote.get("customers", "c1").unwrap().version, 6);
        assert!(engine.write_locks().is_empty());
    }

    #[tokio::test]
    async fn failed_transaction_leaves_write_pending() {
        let fx = Fixture::new();
        let engine = fx.engine("customers", ReplicationConfig::default());
        let customers = fx.db.collection("customers").unwrap();
        customers.upsert(doc(json!({"id": "c1", "name": "Ana"}))).unwrap();
        customers.upsert(doc(json!({"id": "c2", "name": "Ben"}))).unwrap();

        fx.remote.fail_next_transactions(1);
        let summary = engine.push_pending().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.written, 1);
        assert_eq!(customers.pending_count().unwrap(), 1);
        assert_eq!(fx.telemetry.count("replication.push_failed"), 1);

        let retry = engine.push_pending().await.unwrap();
        assert_eq!(retry.written, 1);
        assert_eq!(customers.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn tombstone_is_pushed() {
        let fx = Fixture::new();
        let engine = fx.engine("customers", ReplicationConfig::default());
        let customers = fx.db.collection("customers").unwrap();
        customers.upsert(doc(json!({"id": "c1", "name": "Ana"}))).unwrap();
        engine.push_pending().await.unwrap();
        customers.remove("c1").unwrap();
        engine.push_pending().await.unwrap();

        let remote = fx.remote.get("customers", "c1").unwrap();
        assert!(remote.is_deleted());
        assert_eq!(remote.version, 2);
    }

    #[tokio::test]
    async fn live_changes_reach_the_local_collection() {
        let fx = Fixture::new();
        let engine = fx.engine("sales", ReplicationConfig::default());
        engine.start().await.unwrap();
        let mut changes = fx.db.subscribe();

        fx.remote
            .put_json("sales", "s1", json!({"items": [], "total": 12.0}), 1);
        let event = tokio::time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.id, "s1");
        assert_eq!(event.change_type, ChangeType::Insert);
        assert_eq!(event.origin, ChangeOrigin::Replication);

        // Removals are not mirrored.
        fx.remote.delete("sales", "s1");
        settle().await;
        assert!(fx.db.collection("sales").unwrap().find_one("s1").unwrap().is_some());
        engine.cancel();
    }

    #[tokio::test]
    async fn start_and_cancel_are_idempotent() {
        let fx = Fixture::new();
        let engine = fx.engine("users", ReplicationConfig::default());
        engine.start().await.unwrap();
        engine.start().await.unwrap();
        assert!(engine.is_running());
        settle().await;
        assert_eq!(fx.remote.subscriber_count("users"), 1);

        engine.cancel();
        engine.cancel();
        assert!(!engine.is_running());
        settle().await;
        assert_eq!(fx.remote.subscriber_count("users"), 0);
        assert!(matches!(
            engine.push_pending().await,
            Err(EngineError::Cancelled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn pass_retries_with_backoff_then_gives_up() {
        let fx = Fixture::new();
        fx.remote.set_available(false);
        let engine = fx.engine("users", ReplicationConfig::default());

        let started = tokio::time::Instant::now();
        let err = engine.start().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(fx.telemetry.count("replication.pass_failed"), 3);
        // Two waits: at least 1s and 2s.
        assert!(started.elapsed() >= Duration::from_secs(3));
        engine.cancel();
    }

    #[tokio::test]
    async fn auth_feed_starts_and_cancels() {
        let fx = Fixture::new();
        remote_users(&fx, 2);
        let engine = fx.engine("users", ReplicationConfig::default());
        let (auth, feed) = watch::channel(None);
        let listener = engine.bind_auth(feed);
        let mut changes = fx.db.subscribe();

        auth.send(Some("u00".to_string())).unwrap();
        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(5), changes.recv())
                .await
                .unwrap()
                .unwrap();
        }
        assert!(engine.is_running());

        auth.send(None).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while engine.is_running() && tokio::time::Instant::now() < deadline {
            tokio::task::yield_now().await;
        }
        assert!(!engine.is_running());
        listener.abort();
    }
}

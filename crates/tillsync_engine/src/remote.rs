//! Remote document store contract and the in-memory implementation.

use crate::error::{RemoteError, RemoteResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tillsync_protocol::{Checkpoint, RemoteChange, RemoteDocument, RemoteValue, ServerTimestamp};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// What a transaction body decided after reading the current copy.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionDecision {
    /// Write these payload fields at this version. The store stamps the time.
    Write {
        /// Payload fields.
        fields: BTreeMap<String, RemoteValue>,
        /// New version.
        version: u64,
    },
    /// Leave the document untouched.
    Abort,
}

/// Read-modify-write body run inside a remote transaction.
pub type TransactionBody =
    Box<dyn FnOnce(Option<&RemoteDocument>) -> TransactionDecision + Send + 'static>;

/// Result of a committed or declined transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionResult {
    /// The write was applied; the document as stored.
    Committed(RemoteDocument),
    /// The body declined; the current remote copy, if any.
    Declined(Option<RemoteDocument>),
}

/// A standing change subscription.
///
/// Dropping it or calling [`RemoteSubscription::close`] ends the
/// subscription on the store side.
#[derive(Debug)]
pub struct RemoteSubscription {
    changes: mpsc::UnboundedReceiver<RemoteChange>,
}

impl RemoteSubscription {
    /// Wraps a change receiver.
    pub fn new(changes: mpsc::UnboundedReceiver<RemoteChange>) -> Self {
        Self { changes }
    }

    /// Next change, or `None` once the store ends the subscription.
    pub async fn recv(&mut self) -> Option<RemoteChange> {
        self.changes.recv().await
    }

    /// Stops receiving. Buffered changes can still be drained.
    pub fn close(&mut self) {
        self.changes.close();
    }
}

/// The authoritative remote document store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Documents with `updated_at` strictly after `after`, oldest first,
    /// at most `limit`.
    async fn query_after(
        &self,
        collection: &str,
        after: Option<&Checkpoint>,
        limit: usize,
    ) -> RemoteResult<Vec<RemoteDocument>>;

    /// Opens a subscription: the newest `window` documents as `Added`, then
    /// every later change.
    async fn subscribe(&self, collection: &str, window: usize) -> RemoteResult<RemoteSubscription>;

    /// Runs `body` against the current copy of `collection/id` and applies
    /// its decision atomically.
    async fn run_transaction(
        &self,
        collection: &str,
        id: &str,
        body: TransactionBody,
    ) -> RemoteResult<TransactionResult>;
}

#[derive(Default)]
struct RemoteState {
    collections: HashMap<String, BTreeMap<String, RemoteDocument>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<RemoteChange>>>,
    last_commit_micros: i64,
    writes: u64,
}

impl RemoteState {
    /// Commit time strictly after every earlier commit.
    fn next_timestamp(&mut self) -> ServerTimestamp {
        let now = ServerTimestamp::now().as_micros();
        let micros = now.max(self.last_commit_micros + 1);
        self.last_commit_micros = micros;
        ServerTimestamp::from_micros(micros)
    }

    fn commit(
        &mut self,
        collection: &str,
        id: &str,
        fields: BTreeMap<String, RemoteValue>,
        version: u64,
    ) -> RemoteDocument {
        let doc = RemoteDocument {
            id: id.to_string(),
            version,
            updated_at: self.next_timestamp(),
            fields,
        };
        let previous = self
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc.clone());
        self.writes += 1;
        let change = if previous.is_some() {
            RemoteChange::modified(doc.clone())
        } else {
            RemoteChange::added(doc.clone())
        };
        self.notify(collection, change);
        trace!(%collection, %id, version, "remote commit");
        doc
    }

    fn notify(&mut self, collection: &str, change: RemoteChange) {
        if let Some(subscribers) = self.subscribers.get_mut(collection) {
            subscribers.retain(|tx| tx.send(change.clone()).is_ok());
        }
    }
}

/// In-memory remote store.
///
/// Commit timestamps are strictly increasing, so `updated_at` totally
/// orders the documents of a collection. Supports fault injection for
/// tests.
#[derive(Default)]
pub struct MemoryRemoteStore {
    state: Mutex<RemoteState>,
    unavailable: AtomicBool,
    fail_next: AtomicU32,
    transaction_delay: Mutex<Duration>,
}

impl std::fmt::Debug for MemoryRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemoteStore")
            .field("writes", &self.write_count())
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}

impl MemoryRemoteStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with `Unavailable` while false.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Whether calls are served.
    pub fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    /// Makes the next `n` transactions fail with `Aborted`.
    pub fn fail_next_transactions(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Holds every transaction open for `delay` between read and commit.
    pub fn set_transaction_delay(&self, delay: Duration) {
        *self.transaction_delay.lock() = delay;
    }

    /// Writes a document directly, as another device would.
    pub fn put(
        &self,
        collection: &str,
        id: &str,
        fields: BTreeMap<String, RemoteValue>,
        version: u64,
    ) -> RemoteDocument {
        self.state.lock().commit(collection, id, fields, version)
    }

    /// Writes a JSON object's fields directly. Non-object values store no fields.
    pub fn put_json(&self, collection: &str, id: &str, body: Value, version: u64) -> RemoteDocument {
        let fields = match body {
            Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| (k, RemoteValue::Json(v)))
                .collect(),
            _ => BTreeMap::new(),
        };
        self.put(collection, id, fields, version)
    }

    /// Hard-deletes a document and notifies subscribers.
    pub fn delete(&self, collection: &str, id: &str) -> Option<RemoteDocument> {
        let mut state = self.state.lock();
        let removed = state.collections.get_mut(collection)?.remove(id)?;
        state.notify(collection, RemoteChange::removed(removed.clone()));
        Some(removed)
    }

    /// Current copy of a document.
    pub fn get(&self, collection: &str, id: &str) -> Option<RemoteDocument> {
        self.state
            .lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Number of documents in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.state
            .lock()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Whether a collection is empty.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Total commits since creation.
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }

    /// Live subscriptions on a collection.
    pub fn subscriber_count(&self, collection: &str) -> usize {
        let mut state = self.state.lock();
        match state.subscribers.get_mut(collection) {
            Some(subscribers) => {
                subscribers.retain(|tx| !tx.is_closed());
                subscribers.len()
            }
            None => 0,
        }
    }

    fn check_available(&self) -> RemoteResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(RemoteError::unavailable("remote store unreachable"))
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn query_after(
        &self,
        collection: &str,
        after: Option<&Checkpoint>,
        limit: usize,
    ) -> RemoteResult<Vec<RemoteDocument>> {
        self.check_available()?;
        let after = after
            .map(Checkpoint::timestamp)
            .transpose()
            .map_err(|e| RemoteError::rejected(format!("bad cursor: {e}")))?;

        let state = self.state.lock();
        let mut docs: Vec<RemoteDocument> = state
            .collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|d| after.map_or(true, |cursor| d.updated_at > cursor))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        docs.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        docs.truncate(limit);
        debug!(%collection, returned = docs.len(), "remote query");
        Ok(docs)
    }

    async fn subscribe(&self, collection: &str, window: usize) -> RemoteResult<RemoteSubscription> {
        self.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.state.lock();
        let mut recent: Vec<RemoteDocument> = state
            .collections
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default();
        recent.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        for doc in recent.into_iter().take(window) {
            // The receiver is still in hand, so this cannot fail.
            let _ = tx.send(RemoteChange::added(doc));
        }
        state
            .subscribers
            .entry(collection.to_string())
            .or_default()
            .push(tx);
        debug!(%collection, window, "remote subscription opened");
        Ok(RemoteSubscription::new(rx))
    }

    async fn run_transaction(
        &self,
        collection: &str,
        id: &str,
        body: TransactionBody,
    ) -> RemoteResult<TransactionResult> {
        self.check_available()?;
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RemoteError::aborted("injected transaction failure"));
        }

        let snapshot = self.get(collection, id);
        let delay = *self.transaction_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let current = state
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned();
        if current.as_ref().map(|d| d.version) != snapshot.as_ref().map(|d| d.version) {
            return Err(RemoteError::aborted(format!(
                "{collection}/{id} changed during transaction"
            )));
        }

        match body(current.as_ref()) {
            TransactionDecision::Write { fields, version } => Ok(TransactionResult::Committed(
                state.commit(collection, id, fields, version),
            )),
            TransactionDecision::Abort => Ok(TransactionResult::Declined(current)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tillsync_protocol::ChangeKind;

    fn write(version: u64) -> TransactionBody {
        Box::new(move |_| TransactionDecision::Write {
            fields: BTreeMap::new(),
            version,
        })
    }

    #[tokio::test]
    async fn query_pages_by_commit_time() {
        let store = MemoryRemoteStore::new();
        for i in 0..5 {
            store.put_json("products", &format!("p{i}"), json!({"n": i}), 1);
        }

        let first = store.query_after("products", None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first[0].updated_at < first[1].updated_at);

        let cursor = Checkpoint::at(first[1].updated_at).unwrap();
        let rest = store.query_after("products", Some(&cursor), 10).await.unwrap();
        let ids: Vec<_> = rest.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["p2", "p3", "p4"]);

        let end = Checkpoint::at(rest[2].updated_at).unwrap();
        assert!(store.query_after("products", Some(&end), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rewrite_moves_document_to_the_end() {
        let store = MemoryRemoteStore::new();
        store.put_json("users", "a", json!({}), 1);
        store.put_json("users", "b", json!({}), 1);
        store.put_json("users", "a", json!({}), 2);
        let ids: Vec<_> = store
            .query_after("users", None, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn subscription_replays_window_then_follows() {
        let store = MemoryRemoteStore::new();
        for i in 0..4 {
            store.put_json("sales", &format!("s{i}"), json!({}), 1);
        }
        let mut sub = store.subscribe("sales", 2).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().document.id, "s3");
        assert_eq!(sub.recv().await.unwrap().document.id, "s2");

        store.put_json("sales", "s1", json!({"total": 3}), 2);
        let change = sub.recv().await.unwrap();
        assert_eq!(change.kind, ChangeKind::Modified);
        assert_eq!(change.document.version, 2);

        store.delete("sales", "s0");
        assert_eq!(sub.recv().await.unwrap().kind, ChangeKind::Removed);

        assert_eq!(store.subscriber_count("sales"), 1);
        drop(sub);
        assert_eq!(store.subscriber_count("sales"), 0);
    }

    #[tokio::test]
    async fn transaction_commits_or_declines() {
        let store = MemoryRemoteStore::new();
        let result = store.run_transaction("users", "u1", write(1)).await.unwrap();
        assert!(matches!(result, TransactionResult::Committed(ref d) if d.version == 1));

        let declined = store
            .run_transaction("users", "u1", Box::new(|_| TransactionDecision::Abort))
            .await
            .unwrap();
        assert!(matches!(declined, TransactionResult::Declined(Some(ref d)) if d.version == 1));
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn fault_injection() {
        let store = MemoryRemoteStore::new();
        store.fail_next_transactions(1);
        let err = store.run_transaction("users", "u1", write(1)).await.unwrap_err();
        assert!(err.is_retryable());
        store.run_transaction("users", "u1", write(1)).await.unwrap();

        store.set_available(false);
        let err = store.query_after("users", None, 10).await.unwrap_err();
        assert_eq!(err.kind, crate::error::RemoteErrorKind::Unavailable);
        assert!(store.subscribe("users", 5).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_writer_aborts_slow_transaction() {
        let store = std::sync::Arc::new(MemoryRemoteStore::new());
        store.put_json("users", "u1", json!({}), 1);
        store.set_transaction_delay(Duration::from_millis(50));

        let slow = {
            let store = store.clone();
            tokio::spawn(async move { store.run_transaction("users", "u1", write(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.put_json("users", "u1", json!({}), 5);

        let err = slow.await.unwrap().unwrap_err();
        assert_eq!(err.kind, crate::error::RemoteErrorKind::Aborted);
        assert_eq!(store.get("users", "u1").unwrap().version, 5);
    }
}

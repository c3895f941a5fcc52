//! Collection handles and selectors.

use crate::change_feed::ChangeOrigin;
use crate::database::{is_tombstone, Database, StoredRecord};
use crate::error::CoreResult;
use crate::schema::CollectionSchema;
use crate::Document;
use serde_json::Value;
use tillsync_protocol::FIELD_VERSION;

/// A conjunction of field equality predicates.
///
/// An empty selector matches every document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector {
    predicates: Vec<(String, Value)>,
}

impl Selector {
    /// Matches everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches documents with `field == value`.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and(field, value)
    }

    /// Adds another predicate.
    #[must_use]
    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicates.push((field.into(), value.into()));
        self
    }

    /// Returns true if every predicate holds for `doc`.
    pub fn matches(&self, doc: &Document) -> bool {
        self.predicates
            .iter()
            .all(|(field, value)| doc.get(field) == Some(value))
    }

    fn first(&self) -> Option<(&str, &Value)> {
        self.predicates.first().map(|(f, v)| (f.as_str(), v))
    }
}

/// A stored record with its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordEntry {
    /// Primary key.
    pub id: String,
    /// Stored document, tombstone marker included.
    pub document: Document,
    /// Whether the write still has to be pushed.
    pub pending: bool,
    /// In-memory write counter; changes on every write to this record.
    pub rev: u64,
}

impl RecordEntry {
    /// The document's `version`, or 0.
    pub fn version(&self) -> u64 {
        self.document
            .get(FIELD_VERSION)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Whether the record is a deletion marker.
    pub fn is_tombstone(&self) -> bool {
        is_tombstone(&self.document)
    }
}

/// Handle to one collection of a [`Database`].
#[derive(Debug, Clone)]
pub struct Collection<'db> {
    db: &'db Database,
    name: String,
}

impl<'db> Collection<'db> {
    pub(crate) fn new(db: &'db Database, name: &str) -> Self {
        Self {
            db,
            name: name.to_string(),
        }
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The collection's schema.
    pub fn schema(&self) -> CoreResult<CollectionSchema> {
        self.db
            .read(|state| Ok(state.collection(&self.name)?.schema.clone()))
    }

    /// Returns the visible document with this id.
    pub fn find_one(&self, id: &str) -> CoreResult<Option<Document>> {
        Ok(self
            .entry(id)?
            .filter(|e| !e.is_tombstone())
            .map(|e| e.document))
    }

    /// Returns the raw record, tombstones included.
    pub fn entry(&self, id: &str) -> CoreResult<Option<RecordEntry>> {
        self.db.read(|state| {
            Ok(state
                .collection(&self.name)?
                .records
                .get(id)
                .map(|r| r.entry(id)))
        })
    }

    /// Returns visible documents matching `selector`, ordered by id.
    pub fn find(&self, selector: &Selector) -> CoreResult<Vec<Document>> {
        self.db.read(|state| {
            let collection = state.collection(&self.name)?;
            let candidates: Box<dyn Iterator<Item = &StoredRecord> + '_> = match selector
                .first()
                .and_then(|(field, value)| collection.lookup(field, value))
            {
                Some(ids) => Box::new(
                    ids.into_iter()
                        .filter_map(|id| collection.records.get(id)),
                ),
                None => Box::new(collection.records.values()),
            };
            Ok(candidates
                .filter(|r| !r.is_tombstone() && selector.matches(&r.document))
                .map(|r| r.document.clone())
                .collect())
        })
    }

    /// Number of visible documents.
    pub fn count(&self) -> CoreResult<usize> {
        self.db.read(|state| {
            Ok(state
                .collection(&self.name)?
                .records
                .values()
                .filter(|r| !r.is_tombstone())
                .count())
        })
    }

    /// Inserts or replaces a document as a local write.
    ///
    /// Returns the document as stored.
    pub fn upsert(&self, doc: Document) -> CoreResult<Document> {
        self.db.transaction(ChangeOrigin::Local, |txn| {
            let id = txn.put(&self.name, doc)?;
            Ok(txn
                .entry(&self.name, &id)?
                .map(|e| e.document)
                .unwrap_or_default())
        })
    }

    /// Removes a document as a local write.
    pub fn remove(&self, id: &str) -> CoreResult<bool> {
        self.db
            .transaction(ChangeOrigin::Local, |txn| txn.remove(&self.name, id))
    }

    /// Returns up to `limit` pending writes, ordered by id.
    pub fn pending_writes(&self, limit: usize) -> CoreResult<Vec<RecordEntry>> {
        self.db.read(|state| {
            Ok(state
                .collection(&self.name)?
                .records
                .iter()
                .filter(|(_, r)| r.pending)
                .take(limit)
                .map(|(id, r)| r.entry(id))
                .collect())
        })
    }

    /// Number of pending writes.
    pub fn pending_count(&self) -> CoreResult<usize> {
        self.db.read(|state| {
            Ok(state
                .collection(&self.name)?
                .records
                .values()
                .filter(|r| r.pending)
                .count())
        })
    }

    /// Records a successful push of the write observed at `rev`.
    ///
    /// The record takes the remote's new `version`. It stays pending if it
    /// was written again after `rev`. Returns false if the record is gone.
    pub fn acknowledge_push(&self, id: &str, rev: u64, version: u64) -> CoreResult<bool> {
        self.db.transaction(ChangeOrigin::Replication, |txn| {
            let Some(entry) = txn.entry(&self.name, id)? else {
                return Ok(false);
            };
            let still_pending = entry.pending && entry.rev != rev;
            let mut doc = entry.document;
            doc.insert(FIELD_VERSION.into(), Value::from(version));
            txn.put_with_pending(&self.name, doc, still_pending)?;
            Ok(true)
        })
    }

    /// Replaces the local record with the remote copy after a lost conflict.
    ///
    /// The local write is dropped and the pending flag cleared.
    pub fn discard_local(&self, remote: Document) -> CoreResult<()> {
        self.db.transaction(ChangeOrigin::Replication, |txn| {
            txn.put(&self.name, remote)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::collections::app_collections;
    use crate::database::Database;
    use crate::{Document, Selector};
    use serde_json::{json, Value};

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.add_collections(app_collections()).unwrap();
        db
    }

    #[test]
    fn local_upsert_stamps_envelope_and_marks_pending() {
        let db = db();
        let products = db.collection("products").unwrap();
        let stored = products
            .upsert(doc(json!({"id": "p1", "name": "Tea", "price": 1.5})))
            .unwrap();
        assert_eq!(stored["version"], json!(0));
        assert!(stored["updatedAt"].as_str().unwrap().ends_with('Z'));
        assert_eq!(products.pending_count().unwrap(), 1);
    }

    #[test]
    fn local_upsert_inherits_version() {
        let db = db();
        db.transaction(crate::ChangeOrigin::Replication, |txn| {
            txn.put("products", doc(json!({"id": "p1", "name": "Tea", "version": 5})))
        })
        .unwrap();
        let products = db.collection("products").unwrap();
        let stored = products
            .upsert(doc(json!({"id": "p1", "name": "Green tea"})))
            .unwrap();
        assert_eq!(stored["version"], json!(5));
    }

    #[test]
    fn find_uses_index_and_filters() {
        let db = db();
        let users = db.collection("users").unwrap();
        users.upsert(doc(json!({"id": "u1", "name": "Ana", "role": "admin"}))).unwrap();
        users.upsert(doc(json!({"id": "u2", "name": "Ben", "role": "cashier"}))).unwrap();
        users.upsert(doc(json!({"id": "u3", "name": "Cy", "role": "cashier"}))).unwrap();

        let cashiers = users.find(&Selector::eq("role", "cashier")).unwrap();
        let ids: Vec<_> = cashiers.iter().map(|d| d["id"].clone()).collect();
        assert_eq!(ids, vec![json!("u2"), json!("u3")]);

        let ben = users
            .find(&Selector::eq("role", "cashier").and("name", "Ben"))
            .unwrap();
        assert_eq!(ben.len(), 1);

        // Unindexed field falls back to a scan.
        assert_eq!(users.find(&Selector::eq("name", "Cy")).unwrap().len(), 1);
        assert_eq!(users.find(&Selector::all()).unwrap().len(), 3);

        // Index follows updates.
        users.upsert(doc(json!({"id": "u3", "name": "Cy", "role": "admin"}))).unwrap();
        assert_eq!(users.find(&Selector::eq("role", "cashier")).unwrap().len(), 1);
    }

    #[test]
    fn synced_remove_leaves_pending_tombstone() {
        let db = db();
        let customers = db.collection("customers").unwrap();
        customers.upsert(doc(json!({"id": "c1", "name": "Ana"}))).unwrap();
        assert!(customers.remove("c1").unwrap());
        assert!(!customers.remove("c1").unwrap());
        assert!(customers.find_one("c1").unwrap().is_none());
        assert_eq!(customers.count().unwrap(), 0);

        let pending = customers.pending_writes(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].is_tombstone());
    }

    #[test]
    fn local_only_remove_is_hard() {
        let db = db();
        let sessions = db.collection("sessions").unwrap();
        sessions.upsert(doc(json!({"id": "current", "uid": "u1"}))).unwrap();
        assert_eq!(sessions.pending_count().unwrap(), 0);
        assert!(sessions.remove("current").unwrap());
        assert!(sessions.entry("current").unwrap().is_none());
    }

    #[test]
    fn acknowledge_clears_pending_unless_rewritten() {
        let db = db();
        let users = db.collection("users").unwrap();
        users.upsert(doc(json!({"id": "u1", "name": "Ana"}))).unwrap();
        users.upsert(doc(json!({"id": "u2", "name": "Ben"}))).unwrap();

        let batch = users.pending_writes(10).unwrap();
        // u2 is edited again while its push is in flight.
        users.upsert(doc(json!({"id": "u2", "name": "Benjamin"}))).unwrap();

        for entry in &batch {
            assert!(users.acknowledge_push(&entry.id, entry.rev, 1).unwrap());
        }
        let u1 = users.entry("u1").unwrap().unwrap();
        let u2 = users.entry("u2").unwrap().unwrap();
        assert!(!u1.pending);
        assert_eq!(u1.version(), 1);
        assert!(u2.pending);
        assert_eq!(u2.version(), 1);
        assert_eq!(u2.document["name"], json!("Benjamin"));
        assert!(!users.acknowledge_push("ghost", 1, 1).unwrap());
    }

    #[test]
    fn discard_local_takes_remote_copy() {
        let db = db();
        let users = db.collection("users").unwrap();
        users.upsert(doc(json!({"id": "u1", "name": "Local"}))).unwrap();
        users
            .discard_local(doc(json!({"id": "u1", "name": "Remote", "version": 7})))
            .unwrap();
        let entry = users.entry("u1").unwrap().unwrap();
        assert!(!entry.pending);
        assert_eq!(entry.version(), 7);
        assert_eq!(entry.document["name"], json!("Remote"));
    }
}

//! Database facade and record-log replay.

use crate::change_feed::{ChangeEvent, ChangeOrigin, ChangeType, CHANGE_FEED_CAPACITY};
use crate::collection::{Collection, RecordEntry};
use crate::error::{CoreError, CoreResult};
use crate::record::{decode_frames, encode_frame, LogRecord};
use crate::schema::CollectionSchema;
use crate::Document;
use chrono::{SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tillsync_protocol::{FIELD_DELETED, FIELD_UPDATED_AT, FIELD_VERSION};
use tillsync_storage::{InMemoryBackend, StorageBackend};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Current time in the canonical `updatedAt` form.
pub(crate) fn now_canonical() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StoredRecord {
    pub(crate) document: Document,
    pub(crate) pending: bool,
    pub(crate) schema_version: u32,
    /// In-memory write counter, reassigned on replay.
    pub(crate) rev: u64,
}

impl StoredRecord {
    pub(crate) fn is_tombstone(&self) -> bool {
        is_tombstone(&self.document)
    }

    pub(crate) fn entry(&self, id: &str) -> RecordEntry {
        RecordEntry {
            id: id.to_string(),
            document: self.document.clone(),
            pending: self.pending,
            rev: self.rev,
        }
    }
}

pub(crate) fn is_tombstone(doc: &Document) -> bool {
    matches!(doc.get(FIELD_DELETED), Some(Value::Bool(true)))
}

fn index_key(value: &Value) -> String {
    value.to_string()
}

/// Records and secondary indexes of one collection.
pub(crate) struct CollectionState {
    pub(crate) schema: CollectionSchema,
    pub(crate) records: BTreeMap<String, StoredRecord>,
    indexes: HashMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl CollectionState {
    fn new(schema: CollectionSchema) -> Self {
        let indexes = schema
            .indexes
            .iter()
            .map(|field| (field.clone(), BTreeMap::new()))
            .collect();
        Self {
            schema,
            records: BTreeMap::new(),
            indexes,
        }
    }

    fn insert(&mut self, id: String, record: StoredRecord) {
        self.remove(&id);
        for (field, index) in &mut self.indexes {
            if let Some(value) = record.document.get(field) {
                index
                    .entry(index_key(value))
                    .or_default()
                    .insert(id.clone());
            }
        }
        self.records.insert(id, record);
    }

    fn remove(&mut self, id: &str) -> Option<StoredRecord> {
        let old = self.records.remove(id)?;
        for (field, index) in &mut self.indexes {
            if let Some(value) = old.document.get(field) {
                let key = index_key(value);
                if let Some(ids) = index.get_mut(&key) {
                    ids.remove(id);
                    if ids.is_empty() {
                        index.remove(&key);
                    }
                }
            }
        }
        Some(old)
    }

    /// Ids with `field == value`, or `None` if `field` is not indexed.
    pub(crate) fn lookup(&self, field: &str, value: &Value) -> Option<Vec<&str>> {
        let index = self.indexes.get(field)?;
        Some(
            index
                .get(&index_key(value))
                .map(|ids| ids.iter().map(String::as_str).collect())
                .unwrap_or_default(),
        )
    }
}

#[derive(Default)]
pub(crate) struct State {
    pub(crate) collections: HashMap<String, CollectionState>,
    /// Replayed records of collections that have not been added yet.
    replayed: HashMap<String, BTreeMap<String, LogRecord>>,
}

impl State {
    pub(crate) fn collection(&self, name: &str) -> CoreResult<&CollectionState> {
        self.collections
            .get(name)
            .ok_or_else(|| CoreError::CollectionNotFound(name.to_string()))
    }
}

/// The local database handle.
///
/// A set of schema-checked collections held in memory and backed by an
/// append-only record log. The handle is shared between the UI layer and
/// the replication engine; writers are serialized on the log.
///
/// ```rust,ignore
/// let db = Database::open_in_memory()?;
/// db.add_collections(app_collections())?;
/// db.collection("users")?.upsert(json!({"id": "u1", "name": "Ana"}).as_object().cloned().unwrap())?;
/// ```
pub struct Database {
    log: Mutex<Option<Box<dyn StorageBackend>>>,
    state: RwLock<State>,
    changes: broadcast::Sender<ChangeEvent>,
    next_rev: AtomicU64,
    is_open: AtomicBool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("is_open", &self.is_open())
            .field("collections", &self.collection_names())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Opens a database over `backend`, replaying its record log.
    ///
    /// Records are held back until their collection is added with
    /// [`Database::add_collections`].
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Corrupted` if any frame fails to decode.
    pub fn open(backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let bytes = backend.load()?;
        let frames = decode_frames(&bytes)?;
        let frame_count = frames.len();

        let mut replayed: HashMap<String, BTreeMap<String, LogRecord>> = HashMap::new();
        for (_, record) in frames {
            let records = replayed.entry(record.collection.clone()).or_default();
            if record.deleted {
                records.remove(&record.id);
            } else {
                records.insert(record.id.clone(), record);
            }
        }

        info!(
            frames = frame_count,
            bytes = bytes.len(),
            "record log replayed"
        );

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            log: Mutex::new(Some(backend)),
            state: RwLock::new(State {
                collections: HashMap::new(),
                replayed,
            }),
            changes,
            next_rev: AtomicU64::new(1),
            is_open: AtomicBool::new(true),
        })
    }

    /// Opens an empty in-memory database.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open(Box::new(InMemoryBackend::new()))
    }

    fn bump_rev(&self) -> u64 {
        self.next_rev.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds collections, skipping any that already exist.
    ///
    /// Replayed records written under an older schema version are migrated
    /// forward and rewritten to the log. Returns the names actually added.
    ///
    /// # Errors
    ///
    /// Fails with `CoreError::MigrationFailed` if a record cannot be brought
    /// to the current schema. Nothing is added in that case.
    pub fn add_collections(&self, schemas: Vec<CollectionSchema>) -> CoreResult<Vec<String>> {
        let mut log = self.log.lock();
        let backend = log.as_mut().ok_or(CoreError::DatabaseClosed)?;
        let mut state = self.state.write();

        let mut prepared: Vec<CollectionState> = Vec::new();
        let mut frames = Vec::new();

        for schema in schemas {
            let name = schema.name.clone();
            if state.collections.contains_key(&name)
                || prepared.iter().any(|c| c.schema.name == name)
            {
                debug!(collection = %name, "collection already present, skipping");
                continue;
            }

            let mut collection = CollectionState::new(schema);
            let mut migrated = 0usize;
            if let Some(records) = state.replayed.get(&name) {
                for (id, record) in records {
                    let target = collection.schema.version;
                    if record.schema_version > target {
                        return Err(CoreError::migration_failed(
                            &name,
                            format!(
                                "record {id} has schema version {}, newer than {target}",
                                record.schema_version
                            ),
                        ));
                    }

                    let mut document = record.document.clone();
                    if record.schema_version < target {
                        document = collection.schema.migrations.migrate(
                            &name,
                            document,
                            record.schema_version,
                            target,
                        )?;
                        collection.schema.validate(&document).map_err(|e| {
                            CoreError::migration_failed(&name, format!("record {id}: {e}"))
                        })?;
                        frames.extend(encode_frame(&LogRecord::put(
                            &name,
                            id,
                            target,
                            record.pending,
                            document.clone(),
                        ))?);
                        migrated += 1;
                    }

                    collection.insert(
                        id.clone(),
                        StoredRecord {
                            document,
                            pending: record.pending,
                            schema_version: target,
                            rev: self.bump_rev(),
                        },
                    );
                }
            }

            info!(
                collection = %name,
                version = collection.schema.version,
                records = collection.records.len(),
                migrated,
                "collection added"
            );
            prepared.push(collection);
        }

        if !frames.is_empty() {
            backend.append(&frames)?;
            backend.flush()?;
        }

        let mut added = Vec::with_capacity(prepared.len());
        for collection in prepared {
            let name = collection.schema.name.clone();
            state.replayed.remove(&name);
            state.collections.insert(name.clone(), collection);
            added.push(name);
        }
        Ok(added)
    }

    /// Returns whether a collection has been added.
    pub fn has_collection(&self, name: &str) -> bool {
        self.state.read().collections.contains_key(name)
    }

    /// Returns the names of all added collections, sorted.
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.read().collections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns a handle to a collection.
    pub fn collection(&self, name: &str) -> CoreResult<Collection<'_>> {
        self.ensure_open()?;
        if !self.has_collection(name) {
            return Err(CoreError::CollectionNotFound(name.to_string()));
        }
        Ok(Collection::new(self, name))
    }

    /// Subscribes to committed changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Executes `f` as one atomic write.
    ///
    /// Staged writes are appended to the log together, then become visible
    /// and are broadcast. If `f` fails nothing is written. `f` must not
    /// start another transaction on the same handle.
    pub fn transaction<F, T>(&self, origin: ChangeOrigin, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> CoreResult<T>,
    {
        let mut log = self.log.lock();
        let backend = log.as_mut().ok_or(CoreError::DatabaseClosed)?;

        let (value, writes) = {
            let state = self.state.read();
            let mut txn = Transaction::new(&state, origin);
            let value = f(&mut txn)?;
            (value, txn.into_writes())
        };
        if writes.is_empty() {
            return Ok(value);
        }

        let mut bytes = Vec::new();
        for write in &writes {
            let record = match &write.record {
                Some(r) => LogRecord::put(
                    &write.collection,
                    &write.id,
                    r.schema_version,
                    r.pending,
                    r.document.clone(),
                ),
                None => LogRecord::remove(&write.collection, &write.id),
            };
            bytes.extend(encode_frame(&record)?);
        }
        backend.append(&bytes)?;
        backend.flush()?;

        let mut events = Vec::with_capacity(writes.len());
        {
            let mut state = self.state.write();
            for write in writes {
                let Some(collection) = state.collections.get_mut(&write.collection) else {
                    continue;
                };
                let was_visible = collection
                    .records
                    .get(&write.id)
                    .is_some_and(|r| !r.is_tombstone());
                let change_type = match write.record {
                    Some(mut record) => {
                        record.rev = self.bump_rev();
                        let visible = !record.is_tombstone();
                        collection.insert(write.id.clone(), record);
                        match (visible, was_visible) {
                            (false, _) => ChangeType::Delete,
                            (true, true) => ChangeType::Update,
                            (true, false) => ChangeType::Insert,
                        }
                    }
                    None => {
                        collection.remove(&write.id);
                        ChangeType::Delete
                    }
                };
                events.push(ChangeEvent::new(
                    write.collection,
                    write.id,
                    change_type,
                    origin,
                ));
            }
        }

        for event in events {
            // No subscribers is fine.
            let _ = self.changes.send(event);
        }
        Ok(value)
    }

    pub(crate) fn read<T>(&self, f: impl FnOnce(&State) -> CoreResult<T>) -> CoreResult<T> {
        self.ensure_open()?;
        let state = self.state.read();
        f(&state)
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CoreError::DatabaseClosed)
        }
    }

    /// Returns whether the handle is usable.
    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }

    /// Current record log size in bytes.
    pub fn log_size(&self) -> CoreResult<u64> {
        let log = self.log.lock();
        let backend = log.as_ref().ok_or(CoreError::DatabaseClosed)?;
        Ok(backend.size()?)
    }

    /// Syncs and releases the record log. Idempotent.
    pub fn close(&self) -> CoreResult<()> {
        let mut log = self.log.lock();
        if let Some(mut backend) = log.take() {
            self.is_open.store(false, Ordering::Release);
            backend.sync()?;
            info!("database closed");
        }
        Ok(())
    }

    /// Wipes the record log and closes the handle.
    ///
    /// Used by the cold-rebuild path; tolerates an already-closed handle.
    pub fn destroy(&self) -> CoreResult<()> {
        let mut log = self.log.lock();
        self.is_open.store(false, Ordering::Release);
        *self.state.write() = State::default();
        match log.take() {
            Some(mut backend) => {
                backend.clear()?;
                backend.sync()?;
                warn!("database destroyed");
            }
            None => debug!("destroy on closed database"),
        }
        Ok(())
    }
}

struct StagedWrite {
    collection: String,
    id: String,
    record: Option<StoredRecord>,
}

/// Writes staged inside [`Database::transaction`].
///
/// Reads see the transaction's own staged writes first.
pub struct Transaction<'a> {
    state: &'a State,
    origin: ChangeOrigin,
    order: Vec<(String, String)>,
    staged: HashMap<(String, String), Option<StoredRecord>>,
}

impl<'a> Transaction<'a> {
    fn new(state: &'a State, origin: ChangeOrigin) -> Self {
        Self {
            state,
            origin,
            order: Vec::new(),
            staged: HashMap::new(),
        }
    }

    /// Who the writes are attributed to.
    pub fn origin(&self) -> ChangeOrigin {
        self.origin
    }

    /// Returns the schema of `collection`.
    pub fn schema(&self, collection: &str) -> CoreResult<&'a CollectionSchema> {
        Ok(&self.state.collection(collection)?.schema)
    }

    /// Returns the raw record, tombstones included.
    pub fn entry(&self, collection: &str, id: &str) -> CoreResult<Option<RecordEntry>> {
        let current = self.state.collection(collection)?;
        let key = (collection.to_string(), id.to_string());
        if let Some(staged) = self.staged.get(&key) {
            return Ok(staged.as_ref().map(|r| r.entry(id)));
        }
        Ok(current.records.get(id).map(|r| r.entry(id)))
    }

    /// Returns the visible document, if any.
    pub fn get(&self, collection: &str, id: &str) -> CoreResult<Option<Document>> {
        Ok(self
            .entry(collection, id)?
            .filter(|e| !e.is_tombstone())
            .map(|e| e.document))
    }

    /// Stages an upsert and returns the document's primary key.
    ///
    /// Local writes to synced collections inherit the stored `version` when
    /// the document has none, get a fresh `updatedAt` and are marked
    /// pending. Replication writes are stored as given.
    pub fn put(&mut self, collection: &str, mut doc: Document) -> CoreResult<String> {
        let schema = self.schema(collection)?;
        let id = schema.key_of(&doc)?;

        let pending = match self.origin {
            ChangeOrigin::Local => schema.synced,
            ChangeOrigin::Replication => false,
        };
        if self.origin == ChangeOrigin::Local && schema.synced {
            if !doc.contains_key(FIELD_VERSION) {
                let version = self
                    .entry(collection, &id)?
                    .map(|e| e.version())
                    .unwrap_or(0);
                doc.insert(FIELD_VERSION.into(), Value::from(version));
            }
            doc.insert(FIELD_UPDATED_AT.into(), Value::String(now_canonical()));
        } else if schema.fields.contains_key(FIELD_UPDATED_AT)
            && !doc.contains_key(FIELD_UPDATED_AT)
        {
            doc.insert(FIELD_UPDATED_AT.into(), Value::String(now_canonical()));
        }

        self.put_with_pending(collection, doc, pending)
    }

    /// Stages an upsert with an explicit pending flag.
    pub(crate) fn put_with_pending(
        &mut self,
        collection: &str,
        doc: Document,
        pending: bool,
    ) -> CoreResult<String> {
        let schema = self.schema(collection)?;
        let id = schema.key_of(&doc)?;
        schema.validate(&doc)?;
        let record = StoredRecord {
            document: doc,
            pending,
            schema_version: schema.version,
            rev: 0,
        };
        self.stage(collection, &id, Some(record));
        Ok(id)
    }

    /// Stages a removal. Returns false if there was nothing to remove.
    ///
    /// A local removal in a synced collection leaves a pending tombstone
    /// so the deletion can be pushed. Everything else is dropped outright.
    pub fn remove(&mut self, collection: &str, id: &str) -> CoreResult<bool> {
        let schema = self.schema(collection)?;
        let Some(existing) = self.entry(collection, id)? else {
            return Ok(false);
        };

        if self.origin == ChangeOrigin::Local && schema.synced {
            if existing.is_tombstone() {
                return Ok(false);
            }
            let mut doc = existing.document;
            doc.insert(FIELD_DELETED.into(), Value::Bool(true));
            doc.insert(FIELD_UPDATED_AT.into(), Value::String(now_canonical()));
            self.put_with_pending(collection, doc, true)?;
        } else {
            self.stage(collection, id, None);
        }
        Ok(true)
    }

    fn stage(&mut self, collection: &str, id: &str, record: Option<StoredRecord>) {
        let key = (collection.to_string(), id.to_string());
        if !self.staged.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.staged.insert(key, record);
    }

    fn into_writes(mut self) -> Vec<StagedWrite> {
        self.order
            .into_iter()
            .filter_map(|key| {
                let record = self.staged.remove(&key)?;
                Some(StagedWrite {
                    collection: key.0,
                    id: key.1,
                    record,
                })
            })
            .collect()
    }
}

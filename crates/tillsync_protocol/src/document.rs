//! Remote document shape and its normalization into local JSON.

use crate::error::{ProtocolError, ProtocolResult};
use crate::timestamp::ServerTimestamp;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Local field holding the document id.
pub const FIELD_ID: &str = "id";
/// Local field holding the conflict-resolution version.
pub const FIELD_VERSION: &str = "version";
/// Local field holding the canonical update timestamp.
pub const FIELD_UPDATED_AT: &str = "updatedAt";
/// Soft-delete marker carried by tombstones.
pub const FIELD_DELETED: &str = "_deleted";

/// A field value as the remote store holds it.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteValue {
    /// A plain JSON value.
    Json(Value),
    /// A server-native timestamp.
    Timestamp(ServerTimestamp),
}

impl RemoteValue {
    /// Converts into local JSON, rendering timestamps canonically.
    pub fn normalize(&self) -> ProtocolResult<Value> {
        match self {
            RemoteValue::Json(value) => Ok(value.clone()),
            RemoteValue::Timestamp(ts) => Ok(Value::String(ts.normalize()?)),
        }
    }
}

impl From<Value> for RemoteValue {
    fn from(value: Value) -> Self {
        RemoteValue::Json(value)
    }
}

impl From<ServerTimestamp> for RemoteValue {
    fn from(ts: ServerTimestamp) -> Self {
        RemoteValue::Timestamp(ts)
    }
}

/// A document in the remote store.
///
/// `version` is the only conflict-resolution signal. `updated_at` is the
/// ordering key for pull queries and is assigned by the store on commit.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocument {
    /// Document id, unique within its collection.
    pub id: String,
    /// Monotonically increasing write version.
    pub version: u64,
    /// Commit time assigned by the store.
    pub updated_at: ServerTimestamp,
    /// Payload fields, excluding the envelope above.
    pub fields: BTreeMap<String, RemoteValue>,
}

impl RemoteDocument {
    /// Returns true if the document is a soft-deleted tombstone.
    pub fn is_deleted(&self) -> bool {
        matches!(
            self.fields.get(FIELD_DELETED),
            Some(RemoteValue::Json(Value::Bool(true)))
        )
    }

    /// Creates a document with no payload fields.
    pub fn new(id: impl Into<String>, version: u64, updated_at: ServerTimestamp) -> Self {
        Self {
            id: id.into(),
            version,
            updated_at,
            fields: BTreeMap::new(),
        }
    }

    /// Adds a payload field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<RemoteValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Extracts payload fields from a local JSON document.
    ///
    /// The envelope fields (`id`, `version`, `updatedAt`) are dropped; the
    /// store owns them.
    pub fn fields_from_local(local: &Map<String, Value>) -> BTreeMap<String, RemoteValue> {
        local
            .iter()
            .filter(|(name, _)| !is_envelope(name))
            .map(|(name, value)| (name.clone(), RemoteValue::Json(value.clone())))
            .collect()
    }

    /// Reads the id and version a local document was written against.
    pub fn local_envelope(local: &Map<String, Value>) -> ProtocolResult<(String, u64)> {
        let id = local
            .get(FIELD_ID)
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::InvalidDocument("missing string id".into()))?;
        let version = match local.get(FIELD_VERSION) {
            None | Some(Value::Null) => 0,
            Some(value) => value.as_u64().ok_or_else(|| {
                ProtocolError::InvalidDocument(format!("document {id} has a non-integer version"))
            })?,
        };
        Ok((id.to_string(), version))
    }
}

fn is_envelope(name: &str) -> bool {
    name == FIELD_ID || name == FIELD_VERSION || name == FIELD_UPDATED_AT
}

/// Converts a remote document into the local JSON shape.
///
/// Every server-native timestamp becomes its canonical string. The
/// envelope is written last, so a payload field can never shadow it.
pub fn normalize_document(doc: &RemoteDocument) -> ProtocolResult<Map<String, Value>> {
    let mut local = Map::with_capacity(doc.fields.len() + 3);
    for (name, value) in &doc.fields {
        if is_envelope(name) {
            continue;
        }
        local.insert(name.clone(), value.normalize()?);
    }
    local.insert(FIELD_ID.into(), Value::String(doc.id.clone()));
    local.insert(FIELD_VERSION.into(), Value::from(doc.version));
    local.insert(
        FIELD_UPDATED_AT.into(),
        Value::String(doc.updated_at.normalize()?),
    );
    Ok(local)
}

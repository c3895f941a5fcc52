//! Collection schemas and document validation.

use crate::error::{CoreError, CoreResult};
use crate::migration::{MigrationStrategy, MigrationVersion};
use crate::Document;
use serde_json::Value;
use std::collections::BTreeMap;
use tillsync_protocol::FIELD_DELETED;

/// Declared type of a document field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// JSON string.
    String,
    /// JSON integer.
    Integer,
    /// Any JSON number.
    Number,
    /// JSON boolean.
    Boolean,
    /// JSON object.
    Object,
    /// JSON array.
    Array,
}

impl FieldType {
    /// Returns true if `value` has this type. `null` never matches.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }
}

/// The declared shape of one collection.
#[derive(Debug, Clone)]
pub struct CollectionSchema {
    /// Collection name.
    pub name: String,
    /// Schema version; persisted records carry the version they were written under.
    pub version: MigrationVersion,
    /// Field holding the primary key.
    pub primary_key: String,
    /// Declared fields.
    pub fields: BTreeMap<String, FieldType>,
    /// Fields that must be present.
    pub required: Vec<String>,
    /// Secondary-indexed fields.
    pub indexes: Vec<String>,
    /// Whether undeclared fields are accepted.
    pub additional_properties: bool,
    /// Whether the collection replicates with the remote store.
    pub synced: bool,
    /// Forward migrations from older schema versions.
    pub migrations: MigrationStrategy,
}

impl CollectionSchema {
    /// Creates a schema with `id` as a string primary key.
    pub fn new(name: impl Into<String>, version: MigrationVersion) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), FieldType::String);
        Self {
            name: name.into(),
            version,
            primary_key: "id".into(),
            fields,
            required: Vec::new(),
            indexes: Vec::new(),
            additional_properties: false,
            synced: false,
            migrations: MigrationStrategy::new(),
        }
    }

    /// Sets the primary key field (declared as a string).
    #[must_use]
    pub fn primary_key(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.fields.insert(field.clone(), FieldType::String);
        self.primary_key = field;
        self
    }

    /// Declares a field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.insert(name.into(), ty);
        self
    }

    /// Marks fields as required.
    #[must_use]
    pub fn required<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(names.into_iter().map(Into::into));
        self
    }

    /// Adds a secondary index.
    #[must_use]
    pub fn index(mut self, field: impl Into<String>) -> Self {
        self.indexes.push(field.into());
        self
    }

    /// Accepts undeclared fields.
    #[must_use]
    pub fn additional_properties(mut self, allowed: bool) -> Self {
        self.additional_properties = allowed;
        self
    }

    /// Marks the collection as replicated and declares the sync envelope
    /// (`version`, `updatedAt`).
    #[must_use]
    pub fn synced(mut self) -> Self {
        self.synced = true;
        self.fields.insert("version".into(), FieldType::Integer);
        self.fields.insert("updatedAt".into(), FieldType::String);
        self
    }

    /// Sets the migration strategy.
    #[must_use]
    pub fn migrations(mut self, strategy: MigrationStrategy) -> Self {
        self.migrations = strategy;
        self
    }

    /// Extracts the primary key of `doc`.
    pub fn key_of(&self, doc: &Document) -> CoreResult<String> {
        match doc.get(&self.primary_key) {
            Some(Value::String(key)) if !key.is_empty() => Ok(key.clone()),
            _ => Err(CoreError::schema_violation(
                &self.name,
                format!("primary key `{}` must be a non-empty string", self.primary_key),
            )),
        }
    }

    /// Checks `doc` against the schema.
    pub fn validate(&self, doc: &Document) -> CoreResult<()> {
        self.key_of(doc)?;

        for name in &self.required {
            if !doc.contains_key(name) {
                return Err(CoreError::schema_violation(
                    &self.name,
                    format!("missing required field `{name}`"),
                ));
            }
        }

        for (name, value) in doc {
            if name == FIELD_DELETED {
                continue;
            }
            match self.fields.get(name) {
                Some(_) if value.is_null() && !self.required.contains(name) => {}
                Some(ty) if !ty.accepts(value) => {
                    return Err(CoreError::schema_violation(
                        &self.name,
                        format!("field `{name}` is not {ty:?}"),
                    ));
                }
                Some(_) => {}
                None if self.additional_properties => {}
                None => {
                    return Err(CoreError::schema_violation(
                        &self.name,
                        format!("unknown field `{name}`"),
                    ));
                }
            }
        }
        Ok(())
    }
}

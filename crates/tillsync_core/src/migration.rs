//! Schema-version migration strategies.
//!
//! Each collection may register one step per schema version. Step `n`
//! turns a record written under version `n - 1` into a version `n` record.
//! Steps run forward only, in order, when a collection is added to an
//! open database and the log holds older records.

use crate::error::{CoreError, CoreResult};
use crate::Document;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Schema version number.
pub type MigrationVersion = u32;

type Step = Arc<dyn Fn(Document) -> Result<Document, String> + Send + Sync>;

/// Forward migration steps for one collection, keyed by target version.
#[derive(Clone, Default)]
pub struct MigrationStrategy {
    steps: BTreeMap<MigrationVersion, Step>,
}

impl MigrationStrategy {
    /// Creates an empty strategy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the step producing `version` from `version - 1`.
    #[must_use]
    pub fn register<F>(mut self, version: MigrationVersion, step: F) -> Self
    where
        F: Fn(Document) -> Result<Document, String> + Send + Sync + 'static,
    {
        self.steps.insert(version, Arc::new(step));
        self
    }

    /// Returns the registered target versions.
    pub fn versions(&self) -> Vec<MigrationVersion> {
        self.steps.keys().copied().collect()
    }

    /// Runs every step from `from + 1` through `to`.
    ///
    /// # Errors
    ///
    /// Fails if a step is missing or a step rejects the document.
    pub fn migrate(
        &self,
        collection: &str,
        mut doc: Document,
        from: MigrationVersion,
        to: MigrationVersion,
    ) -> CoreResult<Document> {
        for version in from.saturating_add(1)..=to {
            let step = self.steps.get(&version).ok_or_else(|| {
                CoreError::migration_failed(
                    collection,
                    format!("no migration step to version {version}"),
                )
            })?;
            doc = step(doc).map_err(|message| {
                CoreError::migration_failed(collection, format!("step {version}: {message}"))
            })?;
        }
        Ok(doc)
    }
}

impl fmt::Debug for MigrationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStrategy")
            .field("versions", &self.versions())
            .finish()
    }
}

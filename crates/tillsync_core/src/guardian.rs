//! Bounded-time database acquisition with a single cold rebuild.

use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::lifecycle::DatabaseContext;
use crate::telemetry::{SharedTelemetry, TelemetryEvent};
use std::sync::Arc;
use tillsync_storage::StorageError;
use tracing::{error, info, warn};

/// Wraps [`DatabaseContext`] with an acquisition timeout and a recovery
/// path.
///
/// When acquisition fails or times out, the guardian drops the cached
/// handle, tears down whatever is left of the store (ignoring teardown
/// errors) and tries exactly once more. A second failure is returned as
/// [`CoreError::ColdRebuildFailed`].
///
/// A store locked by another handle is never rebuilt; the lock error is
/// returned as is.
#[derive(Clone)]
pub struct DatabaseGuardian {
    context: Arc<DatabaseContext>,
    telemetry: SharedTelemetry,
}

impl std::fmt::Debug for DatabaseGuardian {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseGuardian")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl DatabaseGuardian {
    /// Creates a guardian over `context`.
    pub fn new(context: Arc<DatabaseContext>, telemetry: SharedTelemetry) -> Self {
        Self { context, telemetry }
    }

    /// The guarded context.
    pub fn context(&self) -> &Arc<DatabaseContext> {
        &self.context
    }

    /// Returns a ready database, rebuilding it once if needed.
    pub async fn get_database_safely(&self) -> CoreResult<Arc<Database>> {
        let initial = match self.acquire().await {
            Ok(db) => return Ok(db),
            Err(e) => e,
        };

        warn!(error = %initial, "database acquisition failed");
        self.telemetry.record(TelemetryEvent::DbAcquireFailed {
            error: initial.to_string(),
        });

        if matches!(initial, CoreError::Storage(StorageError::Locked(_))) {
            // Tearing down would delete a store another handle is using.
            error!(error = %initial, "database is locked, not rebuilding");
            return Err(initial);
        }

        self.teardown().await;

        match self.acquire().await {
            Ok(db) => {
                info!("cold rebuild succeeded");
                self.telemetry.record(TelemetryEvent::DbColdRebuild {
                    succeeded: true,
                    error: None,
                });
                Ok(db)
            }
            Err(e) => {
                error!(error = %e, "cold rebuild failed");
                self.telemetry.record(TelemetryEvent::DbColdRebuild {
                    succeeded: false,
                    error: Some(e.to_string()),
                });
                Err(CoreError::ColdRebuildFailed {
                    initial: initial.to_string(),
                    source: Box::new(e),
                })
            }
        }
    }

    async fn acquire(&self) -> CoreResult<Arc<Database>> {
        let limit = self.context.config().acquire_timeout;
        tokio::time::timeout(limit, self.context.get_database())
            .await
            .map_err(|_| CoreError::AcquireTimeout(limit))?
    }

    async fn teardown(&self) {
        if let Some(db) = self.context.reset() {
            if let Err(e) = db.destroy() {
                warn!(error = %e, "teardown of cached handle failed");
            }
        }
        if let Err(e) = self.context.factory().destroy(self.context.config()).await {
            warn!(error = %e, "teardown of storage failed");
        }
    }
}

//! Local database lifecycle: the factory and the application context.
//!
//! [`DatabaseContext`] is the single acquisition point for the local
//! database. It is created once at startup and handed to every component
//! that needs the database. The first `get_database` call opens the store;
//! later calls, including concurrent ones, share that handle.

use crate::config::{DatabaseConfig, DatabaseLocation};
use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tillsync_storage::{FileBackend, InMemoryBackend, StorageBackend};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Opens and tears down local databases.
#[async_trait]
pub trait DatabaseFactory: Send + Sync {
    /// Opens the database and adds the configured collections.
    async fn open(&self, config: &DatabaseConfig) -> CoreResult<Database>;

    /// Removes whatever the database left behind on its storage.
    ///
    /// Called on a store that may be unusable.
    async fn destroy(&self, config: &DatabaseConfig) -> CoreResult<()>;
}

/// Production factory over the storage backends.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageFactory;

fn open_backend(location: &DatabaseLocation) -> CoreResult<Box<dyn StorageBackend>> {
    Ok(match location {
        DatabaseLocation::Memory => Box::new(InMemoryBackend::new()),
        DatabaseLocation::Shared(backend) => Box::new(backend.clone()),
        DatabaseLocation::File(path) => Box::new(FileBackend::open(path)?),
    })
}

#[async_trait]
impl DatabaseFactory for StorageFactory {
    async fn open(&self, config: &DatabaseConfig) -> CoreResult<Database> {
        let config = config.clone();
        tokio::task::spawn_blocking(move || {
            let db = Database::open(open_backend(&config.location)?)?;
            db.add_collections(config.collections)?;
            Ok(db)
        })
        .await
        .map_err(|e| CoreError::Task(e.to_string()))?
    }

    async fn destroy(&self, config: &DatabaseConfig) -> CoreResult<()> {
        match &config.location {
            DatabaseLocation::Memory => Ok(()),
            DatabaseLocation::Shared(backend) => {
                let mut backend = backend.clone();
                backend.clear()?;
                Ok(())
            }
            DatabaseLocation::File(path) => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || match std::fs::remove_file(&path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(CoreError::Storage(e.into())),
                })
                .await
                .map_err(|e| CoreError::Task(e.to_string()))?
            }
        }
    }
}

/// Application-lifetime holder of the local database.
pub struct DatabaseContext {
    config: DatabaseConfig,
    factory: Arc<dyn DatabaseFactory>,
    cell: RwLock<Arc<OnceCell<Arc<Database>>>>,
}

impl std::fmt::Debug for DatabaseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseContext")
            .field("config", &self.config)
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl DatabaseContext {
    /// Creates a context using the production factory.
    pub fn new(config: DatabaseConfig) -> Self {
        Self::with_factory(config, Arc::new(StorageFactory))
    }

    /// Creates a context with a custom factory.
    pub fn with_factory(config: DatabaseConfig, factory: Arc<dyn DatabaseFactory>) -> Self {
        Self {
            config,
            factory,
            cell: RwLock::new(Arc::new(OnceCell::new())),
        }
    }

    /// The configuration.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// The factory.
    pub fn factory(&self) -> &Arc<dyn DatabaseFactory> {
        &self.factory
    }

    /// Returns the database, opening it on first use.
    ///
    /// A failed initialization leaves the cell empty, so a later call
    /// tries again.
    pub async fn get_database(&self) -> CoreResult<Arc<Database>> {
        let cell = self.cell.read().clone();
        let db = cell
            .get_or_try_init(|| async {
                debug!("opening local database");
                let db = self.factory.open(&self.config).await?;
                info!(collections = db.collection_names().len(), "local database ready");
                Ok::<_, CoreError>(Arc::new(db))
            })
            .await?;
        Ok(Arc::clone(db))
    }

    /// Returns the cached handle without initializing.
    pub fn cached(&self) -> Option<Arc<Database>> {
        self.cell.read().get().cloned()
    }

    /// Whether a handle is cached.
    pub fn is_initialized(&self) -> bool {
        self.cell.read().initialized()
    }

    /// Drops the cached handle and returns it.
    ///
    /// An initialization still running on the old cell finishes into that
    /// cell and is not seen by later callers.
    pub fn reset(&self) -> Option<Arc<Database>> {
        let old = std::mem::replace(&mut *self.cell.write(), Arc::new(OnceCell::new()));
        old.get().cloned()
    }
}

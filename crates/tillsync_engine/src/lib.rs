//! # tillsync engine
//!
//! The networked half of the offline-first bootstrap:
//! - [`BackoffConfig`] and the generic retry helpers
//! - [`NetworkMonitor`], the reachability state machine behind every
//!   networked call
//! - [`RemoteStore`], the contract of the authoritative remote, with an
//!   in-memory implementation
//! - [`ReplicationEngine`], per-collection pull/push replication
//! - [`SyncOrchestrator`], which keeps at most one sync pass in flight
//!
//! ## Wiring
//!
//! ```rust,ignore
//! let network = NetworkMonitor::new(connectivity, NetworkConfig::default(), telemetry.clone());
//! let engines = ReplicationEngine::for_synced_collections(&db, &remote, ReplicationConfig::default(), &telemetry);
//! let replicators = engines.into_iter().map(|e| Arc::new(e) as Arc<dyn Replicator>).collect();
//! let sync = SyncOrchestrator::new(replicators, network.clone(), telemetry);
//! network.watch_platform();
//! sync.listen();
//! sync.trigger_sync().await;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod error;
mod network;
mod orchestrator;
mod remote;
mod replication;

pub use backoff::{retry, retry_if, BackoffConfig};
pub use error::{EngineError, EngineResult, RemoteError, RemoteErrorKind, RemoteResult};
pub use network::{
    Connectivity, ExecuteOptions, ManualConnectivity, NetworkConfig, NetworkEvent, NetworkMonitor,
    NetworkStatus, RequestOutcome,
};
pub use orchestrator::{SyncOrchestrator, TriggerOutcome};
pub use remote::{
    MemoryRemoteStore, RemoteStore, RemoteSubscription, TransactionBody, TransactionDecision,
    TransactionResult,
};
pub use replication::{
    apply_pull_batch, load_checkpoint, replication_identifier, ApplySummary, PassReport,
    PullEvent, PullSource, RejectedDocument, ReplicationConfig, ReplicationEngine, Replicator,
    WriteLockGuard, WriteLockSet, REPLICATION_SUFFIX,
};

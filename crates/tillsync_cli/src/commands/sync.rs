//! Sync command implementation.
//!
//! Runs one orchestrated pass over an in-memory copy of the database
//! file against an empty in-memory remote, so the file itself is never
//! acknowledged against a remote that does not persist.

use super::CommandResult;
use std::path::Path;
use std::sync::Arc;
use tillsync_core::{DatabaseConfig, DatabaseContext, DatabaseLocation, TracingTelemetry};
use tillsync_engine::{
    ManualConnectivity, MemoryRemoteStore, NetworkConfig, NetworkMonitor, RemoteStore,
    ReplicationConfig, ReplicationEngine, Replicator, SyncOrchestrator, TriggerOutcome,
};
use tillsync_storage::InMemoryBackend;

/// Runs the sync command.
pub async fn run(path: &Path, pull_batch: usize, push_batch: usize) -> CommandResult {
    let bytes = std::fs::read(path)
        .map_err(|e| format!("No database found at {:?}: {}", path, e))?;
    let config = DatabaseConfig::new(DatabaseLocation::Shared(InMemoryBackend::with_data(bytes)));
    let db = DatabaseContext::new(config).get_database().await?;

    let telemetry = TracingTelemetry::shared();
    let remote: Arc<dyn RemoteStore> = Arc::new(MemoryRemoteStore::new());
    let network = NetworkMonitor::new(
        ManualConnectivity::new(true),
        NetworkConfig::default(),
        telemetry.clone(),
    );
    let replication = ReplicationConfig::default()
        .with_pull_batch_size(pull_batch)
        .with_push_batch_size(push_batch);
    let replicators: Vec<Arc<dyn Replicator>> =
        ReplicationEngine::for_synced_collections(&db, &remote, replication, &telemetry)
            .into_iter()
            .map(|engine| Arc::new(engine) as Arc<dyn Replicator>)
            .collect();
    let sync = SyncOrchestrator::new(replicators, network, telemetry);

    let outcome = sync.trigger_sync().await;
    sync.cancel_all();

    match outcome {
        TriggerOutcome::Completed(reports) => {
            println!("Sync pass");
            println!("=========");
            println!();
            for report in reports {
                println!(
                    "  {:<12} pulled {}, pushed {}, conflicts {}, failed {}",
                    report.collection,
                    report.pulled.applied,
                    report.push.written,
                    report.push.conflicts,
                    report.push.failed
                );
            }
            Ok(())
        }
        TriggerOutcome::Failed(error) => Err(format!("Sync failed: {}", error).into()),
        other => Err(format!("Sync did not run: {:?}", other).into()),
    }
}

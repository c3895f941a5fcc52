//! End-to-end tests: boot, replication between devices and the sync trigger.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tillsync_core::collections::{CUSTOMERS, PRODUCTS, USERS};
use tillsync_core::{
    app_collections, AuthMode, BootController, BootState, Database, DatabaseConfig,
    DatabaseContext, DatabaseGuardian, Document, LocalSession, RecordingTelemetry, SessionMode,
    SessionStore, SharedTelemetry,
};
use tillsync_engine::{
    ExecuteOptions, ManualConnectivity, MemoryRemoteStore, NetworkConfig, NetworkMonitor,
    NetworkStatus, RemoteError, RemoteStore, ReplicationConfig, ReplicationEngine, Replicator,
    RequestOutcome, SyncOrchestrator, TriggerOutcome,
};

fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap()
}

struct Device {
    db: Arc<Database>,
    telemetry: Arc<RecordingTelemetry>,
    remote: Arc<dyn RemoteStore>,
}

impl Device {
    fn new(remote: &Arc<MemoryRemoteStore>) -> Self {
        let db = Database::open_in_memory().unwrap();
        db.add_collections(app_collections()).unwrap();
        Self {
            db: Arc::new(db),
            telemetry: RecordingTelemetry::new(),
            remote: remote.clone(),
        }
    }

    fn engine(&self, collection: &str) -> ReplicationEngine {
        ReplicationEngine::new(
            collection,
            self.db.clone(),
            self.remote.clone(),
            ReplicationConfig::default(),
            self.telemetry.clone(),
        )
    }

    fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.db.collection(collection).unwrap().find_one(id).unwrap()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn boot_resolves_offline_identity_then_user_syncs() {
    let telemetry = RecordingTelemetry::new();
    let context = Arc::new(DatabaseContext::new(DatabaseConfig::in_memory()));
    let guardian = DatabaseGuardian::new(context, telemetry.clone());
    let boot = BootController::new(guardian, telemetry.clone());

    let report = boot.boot().await.unwrap();
    assert_eq!(report.state, BootState::Ready);
    assert_eq!(report.auth_mode, AuthMode::Anonymous);

    let db = boot.guardian().get_database_safely().await.unwrap();
    db.collection(USERS)
        .unwrap()
        .upsert(doc(json!({"id": "u1", "name": "Ana"})))
        .unwrap();
    let session = LocalSession {
        uid: "u1".into(),
        issued_at: String::new(),
        device_id: String::new(),
        mode: SessionMode::Offline,
        integrity_hash: "h".into(),
    };
    SessionStore::new(&db).save(&session).unwrap();

    let report = boot.boot().await.unwrap();
    assert_eq!(report.auth_mode, AuthMode::OfflineAuthenticated);
    assert_eq!(report.profile.unwrap().id, "u1");

    // The user written offline reaches the remote on the first pass.
    let remote = Arc::new(MemoryRemoteStore::new());
    let shared: SharedTelemetry = telemetry.clone();
    let engine = ReplicationEngine::new(
        USERS,
        db.clone(),
        remote.clone(),
        ReplicationConfig::default(),
        shared,
    );
    let pass = engine.start().await.unwrap();
    assert_eq!(pass.push.written, 1);
    let pushed = remote.get(USERS, "u1").unwrap();
    assert_eq!(pushed.version, 1);
    assert_eq!(db.collection(USERS).unwrap().pending_count().unwrap(), 0);
    engine.cancel();
}

#[tokio::test]
async fn devices_converge_through_the_remote() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let till = Device::new(&remote);
    let office = Device::new(&remote);
    let till_engine = till.engine(PRODUCTS);
    let office_engine = office.engine(PRODUCTS);

    till.db
        .collection(PRODUCTS)
        .unwrap()
        .upsert(doc(json!({"id": "p1", "name": "Tea", "price": 2.5, "stock": 10})))
        .unwrap();
    till_engine.start().await.unwrap();

    office_engine.start().await.unwrap();
    assert_eq!(office.get(PRODUCTS, "p1").unwrap()["name"], json!("Tea"));

    let mut edited = office.get(PRODUCTS, "p1").unwrap();
    edited.insert("price".into(), json!(3.0));
    office.db.collection(PRODUCTS).unwrap().upsert(edited).unwrap();
    office_engine.start().await.unwrap();
    assert_eq!(remote.get(PRODUCTS, "p1").unwrap().version, 2);

    // The till's live subscription delivers the office edit.
    eventually(|| {
        till.get(PRODUCTS, "p1")
            .is_some_and(|d| d["price"] == json!(3.0) && d["version"] == json!(2))
    })
    .await;

    till_engine.cancel();
    office_engine.cancel();
}

#[tokio::test]
async fn same_version_edit_advances_remote() {
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.put_json(CUSTOMERS, "c1", json!({"name": "Ana"}), 5);
    let device = Device::new(&remote);
    let engine = device.engine(CUSTOMERS);
    engine.start().await.unwrap();

    let mut local = device.get(CUSTOMERS, "c1").unwrap();
    assert_eq!(local["version"], json!(5));
    local.insert("phone".into(), json!("555-0100"));
    device.db.collection(CUSTOMERS).unwrap().upsert(local).unwrap();

    let pass = engine.start().await.unwrap();
    assert_eq!(pass.push.written, 1);
    assert_eq!(remote.get(CUSTOMERS, "c1").unwrap().version, 6);
    assert_eq!(device.get(CUSTOMERS, "c1").unwrap()["version"], json!(6));
    engine.cancel();
}

#[tokio::test]
async fn concurrent_edits_keep_the_first_pushed_write() {
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.put_json(CUSTOMERS, "c1", json!({"name": "Ana"}), 1);
    let first = Device::new(&remote);
    let second = Device::new(&remote);
    let first_engine = first.engine(CUSTOMERS);
    let second_engine = second.engine(CUSTOMERS);
    first_engine.start().await.unwrap();
    second_engine.start().await.unwrap();
    first_engine.cancel();
    second_engine.cancel();

    for (device, name) in [(&first, "Ana First"), (&second, "Ana Second")] {
        let mut edit = device.get(CUSTOMERS, "c1").unwrap();
        edit.insert("name".into(), json!(name));
        device.db.collection(CUSTOMERS).unwrap().upsert(edit).unwrap();
    }

    first_engine.start().await.unwrap();
    second_engine.start().await.unwrap();

    let stored = remote.get(CUSTOMERS, "c1").unwrap();
    assert_eq!(stored.version, 2);
    let kept = second.get(CUSTOMERS, "c1").unwrap();
    assert_eq!(kept["name"], json!("Ana First"));
    assert_eq!(second.db.collection(CUSTOMERS).unwrap().pending_count().unwrap(), 0);
    // The losing edit never reached the remote, but its loss is on record.
    assert_eq!(second.telemetry.count("replication.conflict"), 1);
    assert_eq!(first.telemetry.count("replication.conflict"), 0);

    first_engine.cancel();
    second_engine.cancel();
}

#[tokio::test]
async fn reconnect_triggers_one_sync_pass() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let device = Device::new(&remote);
    let connectivity = ManualConnectivity::new(false);
    let network = NetworkMonitor::new(
        connectivity.clone(),
        NetworkConfig::default(),
        device.telemetry.clone(),
    );
    let shared: SharedTelemetry = device.telemetry.clone();
    let replicators: Vec<Arc<dyn Replicator>> = ReplicationEngine::for_synced_collections(
        &device.db,
        &device.remote,
        ReplicationConfig::default(),
        &shared,
    )
    .into_iter()
    .map(|engine| Arc::new(engine) as Arc<dyn Replicator>)
    .collect();
    let sync = SyncOrchestrator::new(replicators, network.clone(), shared);
    let watcher = network.watch_platform();
    let listener = sync.listen();

    device
        .db
        .collection(CUSTOMERS)
        .unwrap()
        .upsert(doc(json!({"id": "c1", "name": "Ana"})))
        .unwrap();
    assert_eq!(sync.trigger_sync().await, TriggerOutcome::Offline);
    assert!(remote.get(CUSTOMERS, "c1").is_none());

    connectivity.set_online(true);
    eventually(|| remote.get(CUSTOMERS, "c1").is_some()).await;
    eventually(|| device.telemetry.count("sync.completed") == 1).await;
    assert_ne!(network.status(), NetworkStatus::Offline);
    assert_eq!(device.telemetry.count("sync.started"), 1);

    sync.cancel_all();
    listener.abort();
    watcher.abort();
}

#[tokio::test]
async fn offline_execute_never_runs_the_call() {
    let telemetry = RecordingTelemetry::new();
    let network = NetworkMonitor::new(
        ManualConnectivity::new(false),
        NetworkConfig::default(),
        telemetry.clone(),
    );
    let calls = AtomicUsize::new(0);
    let counter = &calls;
    let outcome = network
        .execute("products.fetch", ExecuteOptions::default(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, RemoteError>(())
        })
        .await;
    assert!(outcome.is_offline());
    assert!(matches!(outcome, RequestOutcome::Offline));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

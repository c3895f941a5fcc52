//! Network status monitor.
//!
//! Tracks reachability as an explicit state machine and wraps networked
//! calls so that a real disconnection (`NetworkLost`) is told apart from a
//! call that failed while the link was up (`Failed`).
//!
//! ```text
//! Offline --online signal--> Reconnecting --success--> Online
//!    ^                                                   |
//!    +---------- offline signal / failed while offline --+
//!                          failed while connected --> Unstable
//! ```

use crate::backoff::{retry, BackoffConfig};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tillsync_core::{SharedTelemetry, TelemetryEvent};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reachability state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkStatus {
    /// Connected and healthy.
    Online,
    /// The platform reports no connectivity.
    Offline,
    /// Connectivity came back; not yet confirmed by a successful call.
    Reconnecting,
    /// Connected, but calls are failing.
    Unstable,
}

impl NetworkStatus {
    /// Whether calls may be attempted.
    pub fn is_reachable(self) -> bool {
        self != NetworkStatus::Offline
    }
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkStatus::Online => "online",
            NetworkStatus::Offline => "offline",
            NetworkStatus::Reconnecting => "reconnecting",
            NetworkStatus::Unstable => "unstable",
        };
        f.write_str(name)
    }
}

/// Events published to the rest of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A sync pass should run.
    ResyncRequested,
}

/// The platform's connectivity flag and its change signal.
pub trait Connectivity: Send + Sync {
    /// Current flag.
    fn is_online(&self) -> bool;

    /// Receiver of flag changes.
    fn watch(&self) -> watch::Receiver<bool>;
}

/// Connectivity flag set by hand. Used by tests and the CLI.
#[derive(Debug)]
pub struct ManualConnectivity {
    flag: watch::Sender<bool>,
}

impl ManualConnectivity {
    /// Creates the flag.
    pub fn new(online: bool) -> Arc<Self> {
        let (flag, _) = watch::channel(online);
        Arc::new(Self { flag })
    }

    /// Changes the flag and signals watchers.
    pub fn set_online(&self, online: bool) {
        self.flag.send_replace(online);
    }
}

impl Connectivity for ManualConnectivity {
    fn is_online(&self) -> bool {
        *self.flag.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.flag.subscribe()
    }
}

/// Network monitor settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Attempts made by `execute` when retrying.
    pub retry_attempts: u32,
    /// Delay policy between attempts.
    pub backoff: BackoffConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

impl NetworkConfig {
    /// Sets the attempt count.
    #[must_use]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Sets the backoff policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Per-call options for [`NetworkMonitor::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Wrap the call in the retry helper.
    pub retry: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self { retry: true }
    }
}

impl ExecuteOptions {
    /// A single attempt.
    pub fn no_retry() -> Self {
        Self { retry: false }
    }
}

/// Result of a wrapped call. Never an `Err`: the caller decides.
#[derive(Debug, PartialEq, Eq)]
pub enum RequestOutcome<T, E> {
    /// The call succeeded.
    Completed(T),
    /// Not attempted: the monitor was offline.
    Offline,
    /// The call failed and the platform reports no connectivity.
    NetworkLost(E),
    /// The call failed while connectivity was present.
    Failed(E),
}

impl<T, E> RequestOutcome<T, E> {
    /// Whether the call succeeded.
    pub fn is_ok(&self) -> bool {
        matches!(self, RequestOutcome::Completed(_))
    }

    /// Whether the failure is due to missing connectivity.
    pub fn is_offline(&self) -> bool {
        matches!(self, RequestOutcome::Offline | RequestOutcome::NetworkLost(_))
    }

    /// The value, if the call succeeded.
    pub fn ok(self) -> Option<T> {
        match self {
            RequestOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// Reachability state machine.
pub struct NetworkMonitor {
    connectivity: Arc<dyn Connectivity>,
    config: NetworkConfig,
    telemetry: SharedTelemetry,
    status: watch::Sender<NetworkStatus>,
    events: broadcast::Sender<NetworkEvent>,
    retry_count: AtomicU32,
    transition_lock: Mutex<()>,
}

impl fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("status", &self.status())
            .field("retry_count", &self.retry_count())
            .finish_non_exhaustive()
    }
}

impl NetworkMonitor {
    /// Creates a monitor whose initial state follows the platform flag.
    pub fn new(
        connectivity: Arc<dyn Connectivity>,
        config: NetworkConfig,
        telemetry: SharedTelemetry,
    ) -> Arc<Self> {
        let initial = if connectivity.is_online() {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        };
        let (status, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            connectivity,
            config,
            telemetry,
            status,
            events,
            retry_count: AtomicU32::new(0),
            transition_lock: Mutex::new(()),
        })
    }

    /// Current status.
    pub fn status(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    /// Receiver of status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }

    /// Receiver of resync requests.
    pub fn subscribe_events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    /// Failed calls observed while offline since the last recovery.
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Acquire)
    }

    /// Asks listeners to run a sync pass.
    pub fn request_resync(&self) {
        debug!("resync requested");
        // Nobody listening is fine.
        let _ = self.events.send(NetworkEvent::ResyncRequested);
    }

    fn transition(&self, to: NetworkStatus) -> NetworkStatus {
        let _guard = self.transition_lock.lock();
        let from = self.status.send_replace(to);
        if from != to {
            info!(%from, %to, "network status changed");
            self.telemetry.record(TelemetryEvent::NetworkStatusChanged {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        from
    }

    /// Platform reported connectivity.
    ///
    /// Only `Offline` moves, to `Reconnecting`, and a resync is requested.
    pub fn handle_online(&self) {
        if self.status() == NetworkStatus::Offline {
            self.transition(NetworkStatus::Reconnecting);
            self.request_resync();
        }
    }

    /// Platform reported loss of connectivity.
    pub fn handle_offline(&self) {
        self.transition(NetworkStatus::Offline);
    }

    /// Follows the platform signal until the connectivity source goes away.
    pub fn watch_platform(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let mut signal = monitor.connectivity.watch();
        tokio::spawn(async move {
            while signal.changed().await.is_ok() {
                let online = *signal.borrow_and_update();
                if online {
                    monitor.handle_online();
                } else {
                    monitor.handle_offline();
                }
            }
            debug!("platform connectivity signal closed");
        })
    }

    /// Runs a networked call identified by `key`.
    ///
    /// Offline: the call is not attempted. Otherwise it runs, retried with
    /// backoff unless `options.retry` is false. Success after failures
    /// brings the monitor back `Online` and requests a resync.
    pub async fn execute<T, E, F, Fut>(
        &self,
        key: &str,
        options: ExecuteOptions,
        mut op: F,
    ) -> RequestOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if !self.status().is_reachable() {
            debug!(%key, "offline, request not attempted");
            return RequestOutcome::Offline;
        }

        let result = if options.retry {
            retry(&self.config.backoff, self.config.retry_attempts, &mut op).await
        } else {
            op().await
        };

        match result {
            Ok(value) => {
                let in_streak =
                    self.retry_count() > 0 || self.status() != NetworkStatus::Online;
                if in_streak {
                    self.retry_count.store(0, Ordering::Release);
                    self.transition(NetworkStatus::Online);
                    self.request_resync();
                }
                RequestOutcome::Completed(value)
            }
            Err(error) => {
                let offline = !self.connectivity.is_online();
                warn!(%key, offline, %error, "request failed");
                self.telemetry.record(TelemetryEvent::NetworkRequestFailed {
                    key: key.to_string(),
                    offline,
                    error: error.to_string(),
                });
                if offline {
                    self.transition(NetworkStatus::Offline);
                    self.retry_count.fetch_add(1, Ordering::AcqRel);
                    RequestOutcome::NetworkLost(error)
                } else {
                    self.transition(NetworkStatus::Unstable);
                    RequestOutcome::Failed(error)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tillsync_core::RecordingTelemetry;

    fn monitor(online: bool) -> (Arc<NetworkMonitor>, Arc<ManualConnectivity>, Arc<RecordingTelemetry>) {
        let connectivity = ManualConnectivity::new(online);
        let telemetry = RecordingTelemetry::new();
        let config = NetworkConfig::default()
            .with_backoff(BackoffConfig::default().with_jitter(Duration::ZERO));
        let monitor = NetworkMonitor::new(connectivity.clone(), config, telemetry.clone());
        (monitor, connectivity, telemetry)
    }

    #[test]
    fn initial_state_follows_platform() {
        assert_eq!(monitor(true).0.status(), NetworkStatus::Online);
        assert_eq!(monitor(false).0.status(), NetworkStatus::Offline);
        assert!(!NetworkStatus::Offline.is_reachable());
        assert!(NetworkStatus::Unstable.is_reachable());
    }

    #[tokio::test]
    async fn offline_execute_never_calls_the_operation() {
        let (monitor, _, _) = monitor(false);
        let calls = AtomicUsize::new(0);
        let calls_ref = &calls;
        let outcome: RequestOutcome<(), String> = monitor
            .execute("orders.list", ExecuteOptions::default(), move || async move {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(outcome, RequestOutcome::Offline);
        assert!(outcome.is_offline());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn online_signal_moves_offline_to_reconnecting_and_requests_resync() {
        let (monitor, _, telemetry) = monitor(false);
        let mut events = monitor.subscribe_events();
        monitor.handle_online();
        assert_eq!(monitor.status(), NetworkStatus::Reconnecting);
        assert_eq!(events.recv().await.unwrap(), NetworkEvent::ResyncRequested);
        assert_eq!(telemetry.count("network.status_changed"), 1);

        // Online signal while not offline changes nothing.
        monitor.handle_online();
        assert_eq!(monitor.status(), NetworkStatus::Reconnecting);

        monitor.handle_offline();
        assert_eq!(monitor.status(), NetworkStatus::Offline);
    }

    #[tokio::test]
    async fn failure_while_connected_is_unstable() {
        let (monitor, _, telemetry) = monitor(true);
        let outcome: RequestOutcome<(), String> = monitor
            .execute("sync.push", ExecuteOptions::no_retry(), || async {
                Err("500 internal".to_string())
            })
            .await;
        assert_eq!(outcome, RequestOutcome::Failed("500 internal".into()));
        assert!(!outcome.is_offline());
        assert_eq!(monitor.status(), NetworkStatus::Unstable);
        assert_eq!(monitor.retry_count(), 0);
        assert_eq!(telemetry.count("network.request_failed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_disconnect_is_network_lost() {
        let (monitor, connectivity, _) = monitor(true);
        let flag = connectivity.clone();
        let outcome: RequestOutcome<(), String> = monitor
            .execute("sync.pull", ExecuteOptions::default(), move || {
                flag.set_online(false);
                async { Err("connection reset".to_string()) }
            })
            .await;
        assert!(matches!(outcome, RequestOutcome::NetworkLost(_)));
        assert_eq!(monitor.status(), NetworkStatus::Offline);
        assert_eq!(monitor.retry_count(), 1);
    }

    #[tokio::test]
    async fn recovery_resets_streak_and_requests_resync() {
        let (monitor, _, _) = monitor(true);
        let _: RequestOutcome<(), String> = monitor
            .execute("a", ExecuteOptions::no_retry(), || async { Err("boom".to_string()) })
            .await;
        assert_eq!(monitor.status(), NetworkStatus::Unstable);

        let mut events = monitor.subscribe_events();
        let outcome: RequestOutcome<u8, String> = monitor
            .execute("a", ExecuteOptions::no_retry(), || async { Ok(7) })
            .await;
        assert_eq!(outcome.ok(), Some(7));
        assert_eq!(monitor.status(), NetworkStatus::Online);
        assert_eq!(events.recv().await.unwrap(), NetworkEvent::ResyncRequested);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_retries_transient_failures() {
        let (monitor, _, _) = monitor(true);
        let calls = AtomicUsize::new(0);
        let calls_ref = &calls;
        let outcome: RequestOutcome<usize, String> = monitor
            .execute("catalog", ExecuteOptions::default(), move || async move {
                let n = calls_ref.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("timeout".to_string())
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(outcome.ok(), Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(monitor.status(), NetworkStatus::Online);
    }

    #[tokio::test]
    async fn platform_watcher_drives_transitions() {
        let (monitor, connectivity, _) = monitor(true);
        let mut status = monitor.subscribe_status();
        let handle = monitor.watch_platform();

        connectivity.set_online(false);
        status.changed().await.unwrap();
        assert_eq!(*status.borrow_and_update(), NetworkStatus::Offline);

        connectivity.set_online(true);
        status.changed().await.unwrap();
        assert_eq!(*status.borrow_and_update(), NetworkStatus::Reconnecting);

        handle.abort();
    }
}

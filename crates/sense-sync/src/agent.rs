//! # Sync Agent
//!
//! Main orchestrator for the sync daemon. Runs the startup sequence, owns
//! the broker connection, and drives every timer.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncAgent Architecture                           │
//! │                                                                         │
//! │  STARTUP (each step: up to 10 attempts, 60s apart, then fatal)         │
//! │  ──────────────────────────────────────────────────────────            │
//! │  fetch identity → validate → fetch config → validate                   │
//! │       → [cloud] ensure keys → build broker → connect                   │
//! │                                                                         │
//! │  RUNNING (one task, one event at a time)                               │
//! │  ───────────────────────────────────────                               │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                        tokio::select!                            │  │
//! │  │                                                                  │  │
//! │  │  shutdown ─────────► disconnect, cancel retries, stop            │  │
//! │  │  publish timer ────► TelemetryPublisher::run_cycle (every 300s)  │  │
//! │  │  broker events ────► status / reconnect schedule / config push   │  │
//! │  │  reconnect timer ──► broker.connect() (cloud, 60s after drop)    │  │
//! │  │  reconciler retry ─► ConfigReconciler::on_retry_due              │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing after startup is fatal. Every failure is logged and left to the
//! timer that owns it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::{Backoff, Constant};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use sense_core::{validate_broker_config, validate_identity, BrokerKind, DeviceIdentity};
use sense_local::{LocalQueue, LocalResult};

use crate::broker::{Broker, BrokerConnector, BrokerEvent};
use crate::error::{SyncError, SyncResult};
use crate::keys::KeyProvisioner;
use crate::outbox::{CycleOutcome, TelemetryPublisher, PUBLISH_INTERVAL};
use crate::protocol::{ConfigPush, TopicKind};
use crate::reconciler::{ConfigReconciler, ReconcileOutcome};

/// Spacing between attempts of a failing startup step.
pub const STARTUP_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Attempts per startup step before the daemon gives up.
pub const STARTUP_MAX_ATTEMPTS: u32 = 10;

/// Delay before the agent reconnects a dropped cloud session.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(60);

// =============================================================================
// Sync Status
// =============================================================================

/// Broker connection state as seen by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Startup sequence still running.
    Starting,
    /// Connect initiated, waiting for the session.
    Connecting,
    Connected,
    Disconnected,
    /// Agent has shut down or startup failed.
    Stopped,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Starting => write!(f, "starting"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Snapshot of the agent for external queries.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub connection_state: ConnectionState,

    /// Whether a broker session is up.
    pub is_connected: bool,

    /// Configured broker provider, once the config has been fetched.
    pub provider: Option<BrokerKind>,

    pub device_id: Option<String>,

    /// Time of the last acknowledged publish.
    pub last_publish: Option<DateTime<Utc>>,

    /// Outcome of the last publish cycle.
    pub last_cycle: Option<CycleOutcome>,

    /// A config write-back is waiting for its retry.
    pub pending_config_write: bool,

    /// Last error message (if any).
    pub last_error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            connection_state: ConnectionState::Starting,
            is_connected: false,
            provider: None,
            device_id: None,
            last_publish: None,
            last_cycle: None,
            pending_config_write: false,
            last_error: None,
        }
    }
}

// =============================================================================
// Sync Agent
// =============================================================================

/// Runtime state once startup has finished.
struct Running {
    identity: DeviceIdentity,
    kind: BrokerKind,
    broker: Box<dyn Broker>,
    events_tx: mpsc::UnboundedSender<BrokerEvent>,
    events_rx: mpsc::UnboundedReceiver<BrokerEvent>,
    reconciler: ConfigReconciler,
    retry_rx: mpsc::UnboundedReceiver<u64>,
    reconnect_at: Option<Instant>,
}

/// Main sync agent that orchestrates all sync operations.
pub struct SyncAgent {
    /// Local store client.
    queue: Arc<dyn LocalQueue>,

    /// Builds the broker for the configured provider.
    connector: Arc<dyn BrokerConnector>,

    /// Downloads cloud key material before the first connect.
    keys: Option<KeyProvisioner>,

    /// How long a publish waits for PUBACK.
    ack_timeout: Duration,

    /// Current sync status.
    status: Arc<RwLock<SyncStatus>>,
}

impl SyncAgent {
    pub fn new(
        queue: Arc<dyn LocalQueue>,
        connector: Arc<dyn BrokerConnector>,
        ack_timeout: Duration,
    ) -> Self {
        SyncAgent {
            queue,
            connector,
            keys: None,
            ack_timeout,
            status: Arc::new(RwLock::new(SyncStatus::default())),
        }
    }

    /// Enables key provisioning for the cloud provider.
    pub fn with_key_provisioner(mut self, keys: KeyProvisioner) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Starts the agent on its own task.
    ///
    /// The task ends with `Ok` after a shutdown and with the fatal error if
    /// startup fails. Dropping every handle counts as a shutdown.
    pub fn spawn(self) -> (SyncAgentHandle, JoinHandle<SyncResult<()>>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = SyncAgentHandle::new(shutdown_tx, self.status.clone());
        let task = tokio::spawn(self.run(shutdown_rx));
        (handle, task)
    }

    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) -> SyncResult<()> {
        let running = match self.start(&mut shutdown_rx).await {
            Ok(running) => running,
            Err(SyncError::ShuttingDown) => {
                info!("Sync agent stopped during startup");
                self.update_status(|s| s.connection_state = ConnectionState::Stopped)
                    .await;
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, "Sync agent startup failed");
                let message = e.to_string();
                self.update_status(|s| {
                    s.connection_state = ConnectionState::Stopped;
                    s.last_error = Some(message);
                })
                .await;
                return Err(e);
            }
        };

        self.serve(running, shutdown_rx).await;
        Ok(())
    }

    // =========================================================================
    // Startup
    // =========================================================================

    async fn start(&self, shutdown_rx: &mut mpsc::Receiver<()>) -> SyncResult<Running> {
        let identity = self
            .retry_step("fetch identity", shutdown_rx, || self.queue.fetch_identity())
            .await?;
        validate_identity(&identity)?;

        info!(
            device_id = %identity.device_id,
            device_name = %identity.device_name,
            app_name = %identity.app_name,
            "Device identity loaded"
        );

        let config = self
            .retry_step("fetch config", shutdown_rx, || self.queue.fetch_config())
            .await?;
        validate_broker_config(&config.broker)?;

        let kind = config.broker.kind();
        self.update_status(|s| {
            s.provider = Some(kind);
            s.device_id = Some(identity.device_id.clone());
        })
        .await;

        if kind == BrokerKind::Cloud {
            if let Some(keys) = &self.keys {
                let material = keys.ensure(&identity.device_id).await;
                if !material.complete {
                    warn!(
                        device_id = %identity.device_id,
                        "Key material incomplete, connecting anyway"
                    );
                }
            }
        }

        let mut broker = self.connector.build(&identity, &config.broker)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (reconciler, retry_rx) = ConfigReconciler::new(self.queue.clone(), config.clone());

        info!(
            device_id = %identity.device_id,
            provider = %kind,
            host = %config.broker.hostname(),
            port = config.broker.port(),
            "Starting sync agent"
        );
        self.update_status(|s| s.connection_state = ConnectionState::Connecting)
            .await;

        let reconnect_at = match broker.connect(events_tx.clone()).await {
            Ok(()) => None,
            Err(e) => {
                warn!(
                    error = %e,
                    retry_in_secs = RECONNECT_DELAY.as_secs(),
                    "Initial broker connect failed, retrying later"
                );
                self.record_error(&e).await;
                Some(Instant::now() + RECONNECT_DELAY)
            }
        };

        Ok(Running {
            identity,
            kind,
            broker,
            events_tx,
            events_rx,
            reconciler,
            retry_rx,
            reconnect_at,
        })
    }

    /// Runs `op` until it succeeds, sleeping between attempts.
    async fn retry_step<T, F, Fut>(
        &self,
        step: &'static str,
        shutdown_rx: &mut mpsc::Receiver<()>,
        mut op: F,
    ) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LocalResult<T>>,
    {
        let mut backoff = Constant::new(STARTUP_RETRY_INTERVAL);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let err = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(step, attempt, "Startup step succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let remaining = STARTUP_MAX_ATTEMPTS.saturating_sub(attempt);
            if remaining == 0 {
                error!(step, attempt, error = %err, "Startup step failed, giving up");
                return Err(SyncError::StartupExhausted {
                    step,
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }

            let delay = backoff.next_backoff().unwrap_or(STARTUP_RETRY_INTERVAL);
            warn!(
                step,
                attempt,
                remaining,
                endpoint = err.endpoint().unwrap_or("-"),
                error = %err,
                retry_in_secs = delay.as_secs(),
                "Startup step failed, retrying"
            );
            self.update_status(|s| s.last_error = Some(err.to_string()))
                .await;

            tokio::select! {
                _ = shutdown_rx.recv() => return Err(SyncError::ShuttingDown),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    // =========================================================================
    // Main Loop
    // =========================================================================

    async fn serve(&self, mut running: Running, mut shutdown_rx: mpsc::Receiver<()>) {
        let publisher = TelemetryPublisher::new(self.queue.clone(), self.ack_timeout);
        let mut next_cycle = Instant::now();

        loop {
            let reconnect_at = running.reconnect_at;

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Sync agent received shutdown");
                    break;
                }

                _ = tokio::time::sleep_until(next_cycle) => {
                    let outcome = publisher.run_cycle(running.broker.as_mut()).await;
                    self.record_cycle(outcome).await;
                    next_cycle = Instant::now() + PUBLISH_INTERVAL;
                    debug!(next_in_secs = PUBLISH_INTERVAL.as_secs(), "Publish cycle finished");
                }

                Some(event) = running.events_rx.recv() => {
                    self.handle_event(&mut running, event).await;
                }

                _ = tokio::time::sleep_until(reconnect_at.unwrap_or(next_cycle)), if reconnect_at.is_some() => {
                    running.reconnect_at = None;
                    self.reconnect(&mut running).await;
                }

                Some(generation) = running.retry_rx.recv() => {
                    let outcome = running.reconciler.on_retry_due(generation).await;
                    self.record_reconcile(&running.reconciler, outcome).await;
                }
            }
        }

        running.reconciler.cancel_retry();
        running.broker.disconnect().await;
        self.update_status(|s| {
            s.connection_state = ConnectionState::Stopped;
            s.is_connected = false;
        })
        .await;

        info!(device_id = %running.identity.device_id, "Sync agent stopped");
    }

    async fn handle_event(&self, running: &mut Running, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => {
                info!(
                    device_id = %running.identity.device_id,
                    provider = %running.kind,
                    "Broker connected"
                );
                self.update_status(|s| {
                    s.connection_state = ConnectionState::Connected;
                    s.is_connected = true;
                })
                .await;
            }

            BrokerEvent::Disconnected { requested } => {
                self.update_status(|s| {
                    s.connection_state = ConnectionState::Disconnected;
                    s.is_connected = false;
                })
                .await;

                if requested {
                    debug!("Broker disconnected on request");
                } else if running.kind == BrokerKind::Cloud {
                    if running.reconnect_at.is_none() {
                        running.reconnect_at = Some(Instant::now() + RECONNECT_DELAY);
                        info!(
                            retry_in_secs = RECONNECT_DELAY.as_secs(),
                            "Cloud broker disconnected, reconnect scheduled"
                        );
                    } else {
                        debug!("Cloud broker disconnected, reconnect already scheduled");
                    }
                } else {
                    info!("Local broker disconnected, client reconnects on its own");
                }
            }

            BrokerEvent::Error(e) => {
                warn!(provider = %running.kind, error = %e, "Broker error");
                self.record_error(&e).await;
            }

            BrokerEvent::Message { topic, payload } => {
                self.handle_message(running, &topic, &payload).await;
            }
        }
    }

    async fn handle_message(&self, running: &mut Running, topic: &str, payload: &str) {
        let kind = running.broker.topics().classify(topic);

        match kind {
            TopicKind::Errors => {
                warn!(topic = %topic, message = %payload, "Broker reported a device error");
            }

            TopicKind::Config => match ConfigPush::parse(topic, payload) {
                Ok(Some(push)) => {
                    let outcome = running.reconciler.submit(push.parameters).await;
                    self.record_reconcile(&running.reconciler, outcome).await;
                }
                Ok(None) => debug!(topic = %topic, "Ignoring empty config push"),
                Err(e) => warn!(topic = %topic, error = %e, "Dropping malformed config push"),
            },

            TopicKind::Events | TopicKind::Unknown => {
                debug!(topic = %topic, "Ignoring message on unexpected topic");
            }
        }
    }

    async fn reconnect(&self, running: &mut Running) {
        info!(
            device_id = %running.identity.device_id,
            provider = %running.kind,
            "Reconnecting to broker"
        );
        self.update_status(|s| s.connection_state = ConnectionState::Connecting)
            .await;

        if let Err(e) = running.broker.connect(running.events_tx.clone()).await {
            warn!(
                error = %e,
                retry_in_secs = RECONNECT_DELAY.as_secs(),
                "Reconnect failed, retrying later"
            );
            self.record_error(&e).await;
            self.update_status(|s| s.connection_state = ConnectionState::Disconnected)
                .await;
            running.reconnect_at = Some(Instant::now() + RECONNECT_DELAY);
        }
    }

    // =========================================================================
    // Status Bookkeeping
    // =========================================================================

    async fn update_status(&self, f: impl FnOnce(&mut SyncStatus)) {
        let mut status = self.status.write().await;
        f(&mut status);
    }

    async fn record_error(&self, error: &SyncError) {
        let message = error.to_string();
        self.update_status(|s| s.last_error = Some(message)).await;
    }

    async fn record_cycle(&self, outcome: CycleOutcome) {
        self.update_status(|s| {
            match &outcome {
                CycleOutcome::Published { .. } => s.last_publish = Some(Utc::now()),
                CycleOutcome::Rejected { reason, .. } | CycleOutcome::Unavailable { reason } => {
                    s.last_error = Some(reason.clone())
                }
                CycleOutcome::Empty => {}
            }
            s.last_cycle = Some(outcome);
        })
        .await;
    }

    async fn record_reconcile(&self, reconciler: &ConfigReconciler, outcome: ReconcileOutcome) {
        debug!(?outcome, "Config push handled");
        let pending = reconciler.pending().is_some();
        self.update_status(|s| s.pending_config_write = pending).await;
    }
}

// =============================================================================
// Agent Handle (for external control)
// =============================================================================

/// Handle for controlling a running SyncAgent from outside.
#[derive(Clone)]
pub struct SyncAgentHandle {
    shutdown_tx: mpsc::Sender<()>,
    status: Arc<RwLock<SyncStatus>>,
}

impl SyncAgentHandle {
    pub(crate) fn new(shutdown_tx: mpsc::Sender<()>, status: Arc<RwLock<SyncStatus>>) -> Self {
        SyncAgentHandle {
            shutdown_tx,
            status,
        }
    }

    /// Gets the current sync status.
    pub async fn status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    /// Signals the agent to shut down gracefully.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cloud_config, identity, local_config, AckMode, FakeConnector, FakeQueue};
    use sense_core::LocalConfig;

    const ACK_TIMEOUT: Duration = Duration::from_secs(30);

    fn spawn_agent(
        queue: &Arc<FakeQueue>,
        connector: &FakeConnector,
    ) -> (SyncAgentHandle, JoinHandle<SyncResult<()>>) {
        let queue: Arc<dyn LocalQueue> = queue.clone();
        let connector: Arc<dyn BrokerConnector> = Arc::new(connector.clone());
        SyncAgent::new(queue, connector, ACK_TIMEOUT).spawn()
    }

    async fn wait_until(handle: &SyncAgentHandle, check: impl Fn(&SyncStatus) -> bool) {
        // Paused clock: this covers about 15 virtual minutes.
        for _ in 0..9000 {
            if check(&handle.status().await) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("agent never reached the expected status");
    }

    async fn connected(queue: &Arc<FakeQueue>, connector: &FakeConnector) -> SyncAgentHandle {
        let (handle, _task) = spawn_agent(queue, connector);
        wait_until(&handle, |s| s.is_connected).await;
        handle
    }

    fn config_push(value: u64) -> BrokerEvent {
        BrokerEvent::Message {
            topic: "/devices/dev-42/config".into(),
            payload: format!(r#"{{"parameters":{{"telemetryRefreshInterval":{}}}}}"#, value),
        }
    }

    #[test]
    fn test_sync_status_default() {
        let status = SyncStatus::default();
        assert_eq!(status.connection_state, ConnectionState::Starting);
        assert!(!status.is_connected);
        assert!(status.last_publish.is_none());
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_exhaustion_is_fatal_without_connecting() {
        let queue = FakeQueue::new(identity(), cloud_config());
        queue.state().identity = None;
        let connector = FakeConnector::new();

        let started = Instant::now();
        let (handle, task) = spawn_agent(&queue, &connector);
        let result = task.await.unwrap();

        match result {
            Err(SyncError::StartupExhausted { step, attempts, .. }) => {
                assert_eq!(step, "fetch identity");
                assert_eq!(attempts, STARTUP_MAX_ATTEMPTS);
            }
            other => panic!("expected StartupExhausted, got {:?}", other),
        }
        assert_eq!(queue.state().identity_calls, 10);
        assert_eq!(queue.state().config_calls, 0);
        assert!(started.elapsed() >= STARTUP_RETRY_INTERVAL * 9);
        assert!(started.elapsed() < STARTUP_RETRY_INTERVAL * 10);
        assert_eq!(connector.state().builds, 0);
        assert_eq!(connector.state().connects, 0);
        assert_eq!(handle.status().await.connection_state, ConnectionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_recovers_after_transient_failures() {
        let queue = FakeQueue::new(identity(), local_config());
        queue.state().config = None;
        let connector = FakeConnector::new();
        let (handle, _task) = spawn_agent(&queue, &connector);

        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(queue.state().config_calls, 3);
        queue.state().config = Some(local_config());

        wait_until(&handle, |s| s.is_connected).await;
        assert_eq!(queue.state().config_calls, 4);
        assert_eq!(queue.state().identity_calls, 1);
        assert_eq!(handle.status().await.provider, Some(BrokerKind::Local));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unset_identity_is_fatal() {
        let mut unset = identity();
        unset.device_id = "unset".into();
        let queue = FakeQueue::new(unset, cloud_config());
        let connector = FakeConnector::new();

        let (_handle, task) = spawn_agent(&queue, &connector);
        let err = task.await.unwrap().unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(queue.state().identity_calls, 1);
        assert_eq!(connector.state().connects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_immediately_then_every_interval() {
        let queue = FakeQueue::new(identity(), local_config());
        queue.add_record("2024-03-01T10:00:00.000Z", "2024-03-01T10:00:00.000Z");
        let connector = FakeConnector::new();
        let handle = connected(&queue, &connector).await;

        wait_until(&handle, |s| s.last_publish.is_some()).await;
        assert_eq!(connector.state().publishes.len(), 1);
        assert!(queue.state().records.is_empty());

        queue.add_record("2024-03-01T10:05:00.000Z", "2024-03-01T10:05:00.000Z");
        tokio::time::sleep(Duration::from_secs(290)).await;
        assert_eq!(connector.state().publishes.len(), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(connector.state().publishes.len(), 2);
        assert!(queue.state().records.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_store_never_publishes() {
        let queue = FakeQueue::new(identity(), local_config());
        let connector = FakeConnector::new();
        let _handle = connected(&queue, &connector).await;

        tokio::time::sleep(Duration::from_secs(650)).await;
        assert!(connector.state().publishes.is_empty());
        assert_eq!(queue.state().unsent_calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_publish_retries_next_cycle() {
        let queue = FakeQueue::new(identity(), local_config());
        queue.add_record("2024-03-01T10:00:00.000Z", "2024-03-01T10:00:00.000Z");
        let connector = FakeConnector::new();
        connector.state().ack_mode = AckMode::Reject;
        let handle = connected(&queue, &connector).await;

        wait_until(&handle, |s| s.last_cycle.is_some()).await;
        assert_eq!(queue.state().records.len(), 1);
        assert!(handle.status().await.last_error.is_some());

        connector.state().ack_mode = AckMode::Accept;
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(connector.state().publishes.len(), 2);
        assert!(queue.state().records.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cloud_disconnect_reconnects_once_after_delay() {
        let queue = FakeQueue::new(identity(), cloud_config());
        let connector = FakeConnector::new();
        let handle = connected(&queue, &connector).await;
        assert_eq!(connector.state().connects, 1);

        connector.drop_connection();
        wait_until(&handle, |s| !s.is_connected).await;

        tokio::time::sleep(Duration::from_secs(58)).await;
        assert_eq!(connector.state().connects, 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(connector.state().connects, 2);
        wait_until(&handle, |s| s.is_connected).await;

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(connector.state().connects, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_disconnect_does_not_double_schedule() {
        let queue = FakeQueue::new(identity(), cloud_config());
        let connector = FakeConnector::new();
        let _handle = connected(&queue, &connector).await;

        connector.drop_connection();
        tokio::time::sleep(Duration::from_secs(10)).await;
        connector.drop_connection();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.state().connects, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_disconnect_is_left_to_the_client() {
        let queue = FakeQueue::new(identity(), local_config());
        let connector = FakeConnector::new();
        let _handle = connected(&queue, &connector).await;

        connector.drop_connection();
        tokio::time::sleep(Duration::from_secs(180)).await;
        assert_eq!(connector.state().connects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_initial_connect_is_retried() {
        let queue = FakeQueue::new(identity(), cloud_config());
        let connector = FakeConnector::new();
        connector.state().failing_connects = 2;
        let (handle, _task) = spawn_agent(&queue, &connector);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.state().connects, 1);

        wait_until(&handle, |s| s.is_connected).await;
        assert_eq!(connector.state().connects, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_push_is_written_back() {
        let queue = FakeQueue::new(identity(), cloud_config());
        let connector = FakeConnector::new();
        let _handle = connected(&queue, &connector).await;

        connector.push_event(config_push(5000));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let state = queue.state();
        assert_eq!(state.writes.len(), 1);
        let written: &LocalConfig = &state.writes[0];
        assert_eq!(written.parameters.get_u64("telemetryRefreshInterval"), Some(5000));
        assert_eq!(written.broker, cloud_config().broker);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_and_foreign_messages_are_dropped() {
        let queue = FakeQueue::new(identity(), cloud_config());
        let connector = FakeConnector::new();
        let handle = connected(&queue, &connector).await;

        for (topic, payload) in [
            ("/devices/dev-42/config", "{not json"),
            ("/devices/dev-42/config", ""),
            ("/devices/dev-42/errors", "quota exceeded"),
            ("/devices/other/config", r#"{"parameters":{}}"#),
        ] {
            connector.push_event(BrokerEvent::Message {
                topic: topic.into(),
                payload: payload.into(),
            });
        }
        connector.push_event(config_push(1000));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(queue.state().writes.is_empty());
        assert!(handle.status().await.is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_back_retries_in_background() {
        let queue = FakeQueue::new(identity(), cloud_config());
        queue.state().failing_writes = 1;
        let connector = FakeConnector::new();
        let handle = connected(&queue, &connector).await;

        connector.push_event(config_push(5000));
        wait_until(&handle, |s| s.pending_config_write).await;
        assert!(queue.state().writes.is_empty());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(queue.state().writes.len(), 1);
        assert!(!handle.status().await.pending_config_write);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects_broker() {
        let queue = FakeQueue::new(identity(), cloud_config());
        let connector = FakeConnector::new();
        let (handle, task) = spawn_agent(&queue, &connector);
        wait_until(&handle, |s| s.is_connected).await;

        handle.shutdown().await;
        assert!(task.await.unwrap().is_ok());

        assert_eq!(connector.state().disconnects, 1);
        assert!(!connector.state().connected);
        let status = handle.status().await;
        assert_eq!(status.connection_state, ConnectionState::Stopped);
        assert!(!status.is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_startup_retry() {
        let queue = FakeQueue::new(identity(), cloud_config());
        queue.state().identity = None;
        let connector = FakeConnector::new();
        let (handle, task) = spawn_agent(&queue, &connector);

        tokio::time::sleep(Duration::from_secs(30)).await;
        handle.shutdown().await;

        assert!(task.await.unwrap().is_ok());
        assert_eq!(queue.state().identity_calls, 1);
        assert_eq!(connector.state().connects, 0);
    }
}

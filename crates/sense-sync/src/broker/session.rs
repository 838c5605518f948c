//! # MQTT Session Driver
//!
//! A background task that owns the rumqttc client and event loop for one
//! broker connection. Both provider variants sit on top of it.
//!
//! ## Task Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Session Driver Task                              │
//! │                                                                         │
//! │  MqttSession (caller side)           SessionDriver (spawned)            │
//! │  ─────────────────────────           ───────────────────────            │
//! │  publish(text) ──PublishRequest──►   try_publish(events, QoS1, retain)  │
//! │       ▲                              Outgoing::Publish(pkid) → inflight │
//! │       └──── PublishAck ◄─ oneshot ── Incoming::PubAck(pkid)             │
//! │                                                                         │
//! │  stop() ──── CancellationToken ───►  DISCONNECT, flush, exit            │
//! │                                                                         │
//! │  events ◄─── BrokerEvent ─────────   ConnAck → subscribe errors/config  │
//! │                                      SubAck ×2 → Connected              │
//! │                                      Publish → decode → Message         │
//! │                                      poll error / rejected SubAck       │
//! │                                        → Error (+Disconnected)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Reconnects
//! Each attempt gets a fresh client and event loop, so nothing queued on a
//! dead connection is ever replayed. Pending acks fail with
//! `ConnectionLost` the moment the link drops.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::tokio_rustls::rustls::{ClientConfig, RootCertStore};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
    TlsConfiguration,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sense_core::BrokerKind;

use super::{BrokerEvent, BrokerEvents, PublishAck};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{DeviceTopics, PayloadEncoding};

/// Capacity of rumqttc's request channel.
const REQUEST_CAPACITY: usize = 64;

/// Largest packet accepted in either direction.
const MAX_PACKET_SIZE: usize = 256 * 1024;

/// How long a requested disconnect waits for DISCONNECT to leave.
const DISCONNECT_FLUSH: Duration = Duration::from_secs(2);

/// TLS settings for broker connections, trusting the bundled Mozilla roots.
pub(crate) fn tls_configuration() -> SyncResult<TlsConfiguration> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if roots.is_empty() {
        return Err(SyncError::Transport("no trusted root certificates available".into()));
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConfiguration::Rustls(Arc::new(config)))
}

/// Options every session starts from.
pub(crate) fn base_options(client_id: impl Into<String>, host: &str, port: u16) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
    options
}

/// Per-provider session behaviour.
#[derive(Debug, Clone)]
pub(crate) struct SessionSettings {
    pub kind: BrokerKind,
    pub topics: DeviceTopics,
    pub encoding: PayloadEncoding,
    /// `Some` makes the driver reconnect on its own after this delay.
    pub reconnect_interval: Option<Duration>,
}

type AckSender = oneshot::Sender<SyncResult<()>>;

struct PublishRequest {
    payload: Vec<u8>,
    ack: AckSender,
}

struct ActiveSession {
    publish_tx: mpsc::UnboundedSender<PublishRequest>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

// =============================================================================
// Caller Side
// =============================================================================

/// Handle to at most one running session driver.
pub(crate) struct MqttSession {
    settings: Arc<SessionSettings>,
    connected: Arc<AtomicBool>,
    active: Option<ActiveSession>,
}

impl MqttSession {
    pub fn new(settings: SessionSettings) -> Self {
        MqttSession {
            settings: Arc::new(settings),
            connected: Arc::new(AtomicBool::new(false)),
            active: None,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Replaces any running session with a new one.
    pub async fn start(&mut self, options: MqttOptions, events: BrokerEvents) {
        self.stop().await;

        let cancel = CancellationToken::new();
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let driver = SessionDriver {
            settings: self.settings.clone(),
            options,
            connected: self.connected.clone(),
            events,
            publish_rx,
            cancel: cancel.clone(),
            awaiting: VecDeque::new(),
            inflight: HashMap::new(),
            pending_subacks: 0,
            ready: false,
        };

        let task = tokio::spawn(driver.run());
        self.active = Some(ActiveSession {
            publish_tx,
            cancel,
            task,
        });
    }

    /// Queues already-serialized text for the events topic.
    pub fn publish(&self, text: &str) -> SyncResult<PublishAck> {
        let active = self.active.as_ref().ok_or(SyncError::NotConnected)?;
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let (ack, receipt) = PublishAck::channel();
        active
            .publish_tx
            .send(PublishRequest {
                payload: self.settings.encoding.encode(text),
                ack,
            })
            .map_err(|_| SyncError::ConnectionLost)?;

        Ok(receipt)
    }

    /// Ends the running session, if any, and waits for its task.
    pub async fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            drop(active.publish_tx);
            if let Err(e) = active.task.await {
                warn!(kind = %self.settings.kind, error = %e, "Broker session task ended abnormally");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Driver Task
// =============================================================================

struct SessionDriver {
    settings: Arc<SessionSettings>,
    options: MqttOptions,
    connected: Arc<AtomicBool>,
    events: BrokerEvents,
    publish_rx: mpsc::UnboundedReceiver<PublishRequest>,
    cancel: CancellationToken,
    /// Handed to rumqttc, pkid not yet known.
    awaiting: VecDeque<AckSender>,
    /// Sent, waiting for PUBACK.
    inflight: HashMap<u16, AckSender>,
    pending_subacks: usize,
    ready: bool,
}

impl SessionDriver {
    async fn run(mut self) {
        let (host, port) = self.options.broker_address();
        info!(kind = %self.settings.kind, host = %host, port, "Broker session started");

        let (mut client, mut eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.close(&client, &mut eventloop).await;
                    return;
                }

                Some(request) = self.publish_rx.recv() => {
                    self.send_publish(&client, request);
                }

                polled = eventloop.poll() => {
                    let failure = match polled {
                        Ok(event) => self.handle_event(&client, event).err(),
                        Err(e) => Some(SyncError::from(e)),
                    };

                    if let Some(error) = failure {
                        // Closes the socket before any reconnect wait.
                        drop(eventloop);
                        drop(client);
                        if !self.recover(error).await {
                            return;
                        }
                        (client, eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
                    }
                }
            }
        }
    }

    /// Handles a dead link. Returns false once the session is over.
    async fn recover(&mut self, error: SyncError) -> bool {
        let was_connected = self.link_down(error);

        let Some(interval) = self.settings.reconnect_interval else {
            self.emit(BrokerEvent::Disconnected { requested: false });
            info!(kind = %self.settings.kind, "Broker session ended");
            return false;
        };

        if was_connected {
            self.emit(BrokerEvent::Disconnected { requested: false });
        }
        debug!(
            kind = %self.settings.kind,
            retry_in_secs = interval.as_secs(),
            "Scheduling broker reconnect"
        );

        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.reject_queued();
                false
            }
            _ = tokio::time::sleep(interval) => true,
        }
    }

    /// Returns an error when the link has to be dropped.
    fn handle_event(&mut self, client: &AsyncClient, event: Event) -> SyncResult<()> {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                self.connected.store(true, Ordering::SeqCst);
                self.ready = false;
                self.pending_subacks = 0;
                info!(kind = %self.settings.kind, "Broker accepted connection");

                let settings = self.settings.clone();
                for (topic, qos) in [
                    (&settings.topics.errors, QoS::AtMostOnce),
                    (&settings.topics.config, QoS::AtLeastOnce),
                ] {
                    match client.try_subscribe(topic.clone(), qos) {
                        Ok(()) => self.pending_subacks += 1,
                        Err(e) => {
                            warn!(topic = %topic, error = %e, "Subscribe request failed");
                            self.emit(BrokerEvent::Error(e.into()));
                        }
                    }
                }
            }

            Event::Incoming(Packet::SubAck(suback)) => {
                if suback
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    warn!(kind = %self.settings.kind, pkid = suback.pkid, "Broker rejected subscription");
                    return Err(SyncError::Transport("subscription rejected by broker".into()));
                }

                self.pending_subacks = self.pending_subacks.saturating_sub(1);
                if self.pending_subacks == 0 && !self.ready {
                    self.ready = true;
                    info!(kind = %self.settings.kind, "Broker session ready");
                    self.emit(BrokerEvent::Connected);
                }
            }

            Event::Incoming(Packet::Publish(publish)) => {
                match self.settings.encoding.decode(&publish.topic, &publish.payload) {
                    Ok(payload) => self.emit(BrokerEvent::Message {
                        topic: publish.topic,
                        payload,
                    }),
                    Err(e) => {
                        warn!(topic = %publish.topic, error = %e, "Dropping undecodable broker message");
                        self.emit(BrokerEvent::Error(e));
                    }
                }
            }

            Event::Incoming(Packet::PubAck(puback)) => {
                if let Some(ack) = self.inflight.remove(&puback.pkid) {
                    debug!(pkid = puback.pkid, "Publish acknowledged");
                    let _ = ack.send(Ok(()));
                }
            }

            Event::Outgoing(Outgoing::Publish(pkid)) => {
                if let Some(ack) = self.awaiting.pop_front() {
                    self.inflight.insert(pkid, ack);
                }
            }

            _ => {}
        }

        Ok(())
    }

    fn send_publish(&mut self, client: &AsyncClient, request: PublishRequest) {
        if !self.connected.load(Ordering::SeqCst) {
            let _ = request.ack.send(Err(SyncError::NotConnected));
            return;
        }

        match client.try_publish(
            self.settings.topics.events.clone(),
            QoS::AtLeastOnce,
            true,
            request.payload,
        ) {
            Ok(()) => self.awaiting.push_back(request.ack),
            Err(e) => {
                let _ = request.ack.send(Err(e.into()));
            }
        }
    }

    /// Records a dropped link. Returns whether the session had been up.
    fn link_down(&mut self, error: SyncError) -> bool {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.ready = false;
        self.fail_pending();

        warn!(kind = %self.settings.kind, error = %error, "Broker connection error");
        self.emit(BrokerEvent::Error(error));
        was_connected
    }

    async fn close(&mut self, client: &AsyncClient, eventloop: &mut EventLoop) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);

        if was_connected {
            let _ = client.try_disconnect();
            let flush = async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            };
            if tokio::time::timeout(DISCONNECT_FLUSH, flush).await.is_err() {
                debug!(kind = %self.settings.kind, "Disconnect flush timed out");
            }
        }

        self.fail_pending();
        self.reject_queued();

        if was_connected {
            self.emit(BrokerEvent::Disconnected { requested: true });
        }
        info!(kind = %self.settings.kind, "Broker session closed");
    }

    fn fail_pending(&mut self) {
        for ack in self.awaiting.drain(..) {
            let _ = ack.send(Err(SyncError::ConnectionLost));
        }
        for (_, ack) in self.inflight.drain() {
            let _ = ack.send(Err(SyncError::ConnectionLost));
        }
    }

    fn reject_queued(&mut self) {
        while let Ok(request) = self.publish_rx.try_recv() {
            let _ = request.ack.send(Err(SyncError::NotConnected));
        }
    }

    fn emit(&self, event: BrokerEvent) {
        if self.events.send(event).is_err() {
            debug!(kind = %self.settings.kind, "Broker event receiver dropped");
        }
    }
}

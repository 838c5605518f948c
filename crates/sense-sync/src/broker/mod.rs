//! # Broker Connections
//!
//! One interface over the two supported MQTT providers.
//!
//! ## Provider Comparison
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Broker Variants                                  │
//! │                                                                         │
//! │  CLOUD (CloudBroker)                │  LOCAL (LocalBroker)              │
//! │  ───────────────────                │  ────────────────────             │
//! │  • client id: projects/…/devices/id │  • client id: device id           │
//! │  • password: ES256 JWT (5 min)      │  • no credentials                 │
//! │  • always TLS                       │  • TCP, TLS or WebSocket          │
//! │                                     │    per `protocol`                 │
//! │  • payloads: plain JSON             │  • payloads: base64(JSON)         │
//! │  • no auto-reconnect: the agent     │  • reconnects itself every 20s    │
//! │    reconnects 60s after Disconnected│    and only logs disconnects      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Event Contract
//! `connect()` returns immediately; progress arrives on the event channel:
//! - `Connected` once per session, after CONNACK and both SUBACKs
//! - `Error` zero or more times, never ends the session by itself
//! - `Disconnected` exactly once per dropped connection
//! - `Message` for every inbound publish, already unwrapped to text

pub mod cloud;
pub mod local;
mod session;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use sense_core::{BrokerConfig, BrokerKind, DeviceIdentity, Telemetry};

use crate::credentials::CredentialManager;
use crate::error::{SyncError, SyncResult};
use crate::protocol::DeviceTopics;

pub use cloud::CloudBroker;
pub use local::LocalBroker;

// =============================================================================
// Events
// =============================================================================

/// Something the broker session wants the agent to know.
#[derive(Debug)]
pub enum BrokerEvent {
    Connected,
    Disconnected {
        /// True when `disconnect()` ended the session.
        requested: bool,
    },
    Error(SyncError),
    Message {
        topic: String,
        payload: String,
    },
}

/// Sending half of the broker event channel.
pub type BrokerEvents = mpsc::UnboundedSender<BrokerEvent>;

// =============================================================================
// Publish Acknowledgment
// =============================================================================

/// Resolves once the broker acknowledges a publish, or the session drops it.
///
/// Consumed by [`wait`](Self::wait), so it settles exactly once.
#[derive(Debug)]
pub struct PublishAck {
    rx: oneshot::Receiver<SyncResult<()>>,
}

impl PublishAck {
    pub(crate) fn channel() -> (oneshot::Sender<SyncResult<()>>, PublishAck) {
        let (tx, rx) = oneshot::channel();
        (tx, PublishAck { rx })
    }

    /// An acknowledgment that is already settled.
    #[cfg(test)]
    pub(crate) fn resolved(result: SyncResult<()>) -> Self {
        let (tx, ack) = Self::channel();
        let _ = tx.send(result);
        ack
    }

    /// Waits for the broker's verdict.
    ///
    /// A session that goes away first yields `ConnectionLost`; no verdict
    /// within `timeout` yields `AckTimeout`.
    pub async fn wait(self, timeout: Duration) -> SyncResult<()> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::ConnectionLost),
            Err(_) => Err(SyncError::AckTimeout(timeout.as_secs())),
        }
    }
}

// =============================================================================
// Broker Trait
// =============================================================================

#[async_trait]
pub trait Broker: Send {
    fn kind(&self) -> BrokerKind;

    fn topics(&self) -> &DeviceTopics;

    /// Starts a session in the background. Errors only when the session
    /// cannot even be attempted (e.g. no device token).
    async fn connect(&mut self, events: BrokerEvents) -> SyncResult<()>;

    /// Publishes telemetry on the events topic (QoS 1, retained).
    async fn publish(&mut self, telemetry: &Telemetry) -> SyncResult<PublishAck>;

    /// Ends the session and stops any automatic reconnect. Idempotent.
    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;
}

/// Builds the broker for a device's configured provider.
pub trait BrokerConnector: Send + Sync {
    fn build(&self, identity: &DeviceIdentity, config: &BrokerConfig)
        -> SyncResult<Box<dyn Broker>>;
}

/// Production connector backed by rumqttc.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    private_key_path: PathBuf,
}

impl MqttConnector {
    /// `private_key_path` signs cloud tokens; unused for the local broker.
    pub fn new(private_key_path: impl Into<PathBuf>) -> Self {
        MqttConnector {
            private_key_path: private_key_path.into(),
        }
    }
}

impl BrokerConnector for MqttConnector {
    fn build(
        &self,
        identity: &DeviceIdentity,
        config: &BrokerConfig,
    ) -> SyncResult<Box<dyn Broker>> {
        match config {
            BrokerConfig::CloudProvider(cloud) => {
                let credentials =
                    CredentialManager::new(cloud.project_id.clone(), self.private_key_path.clone());
                Ok(Box::new(CloudBroker::new(identity, cloud.clone(), credentials)))
            }
            BrokerConfig::LocalBroker(local) => {
                Ok(Box::new(LocalBroker::new(identity, local.clone())?))
            }
        }
    }
}

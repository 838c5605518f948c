//! # sense-sync: Telemetry Sync Engine
//!
//! Store-and-forward pipeline between the device-local record store and an
//! MQTT broker. Records are deleted locally only after the broker has
//! acknowledged them; broker-pushed parameters are written back to the
//! local config.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                     SyncAgent (Main Orchestrator)                │  │
//! │  │                                                                  │  │
//! │  │  Startup sequence with bounded retries, then one select! loop   │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │TelemetryPublish│  │  dyn Broker    │  │  ConfigReconciler      │    │
//! │  │                │  │                │  │                        │    │
//! │  │ fetch unsent   │  │ CloudBroker    │  │ parameters write-back  │    │
//! │  │ publish (QoS1) │  │  (JWT, TLS)    │  │ 60s retry, last        │    │
//! │  │ delete on ack  │  │ LocalBroker    │  │ writer wins            │    │
//! │  │                │  │  (base64)      │  │                        │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  ┌────────────────┐  ┌────────────────┐                                │
//! │  │ Credentials    │  │ KeyProvisioner │                                │
//! │  │ ES256 device   │  │ downloads the  │                                │
//! │  │ tokens, cached │  │ cloud key pair │                                │
//! │  └────────────────┘  └────────────────┘                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - Main `SyncAgent` orchestrator
//! - [`broker`] - Broker trait, cloud and local MQTT sessions
//! - [`config`] - Daemon configuration (data folder, local API, keys)
//! - [`credentials`] - Device token minting and caching
//! - [`error`] - Sync error types
//! - [`keys`] - Cloud key material provisioning
//! - [`outbox`] - One publish cycle
//! - [`protocol`] - Topics, payload framing, config pushes
//! - [`reconciler`] - Config write-back state machine
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sense_local::HttpLocalQueue;
//! use sense_sync::{DaemonConfig, MqttConnector, SyncAgent};
//!
//! let config = DaemonConfig::load(None)?;
//! let queue = Arc::new(HttpLocalQueue::new(&config.daemon.local_api_url)?);
//! let connector = Arc::new(MqttConnector::new(config.private_key_path()));
//!
//! let (handle, task) = SyncAgent::new(queue, connector, config.ack_timeout()).spawn();
//! println!("Connected: {}", handle.status().await.is_connected);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod broker;
pub mod config;
pub mod credentials;
pub mod error;
pub mod keys;
pub mod outbox;
pub mod protocol;
pub mod reconciler;

#[cfg(test)]
pub(crate) mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{ConnectionState, SyncAgent, SyncAgentHandle, SyncStatus};
pub use broker::{
    Broker, BrokerConnector, BrokerEvent, CloudBroker, LocalBroker, MqttConnector, PublishAck,
};
pub use config::DaemonConfig;
pub use credentials::{AuthToken, CredentialManager};
pub use error::{SyncError, SyncResult};
pub use keys::{KeyMaterial, KeyProvisioner};
pub use outbox::{CycleOutcome, TelemetryPublisher};
pub use protocol::{ConfigPush, DeviceTopics, PayloadEncoding};
pub use reconciler::{ConfigReconciler, ReconcileOutcome};

//! # Domain Types
//!
//! Wire types shared by the local store client and the sync engine.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────────┐   ┌─────────────────┐   │
//! │  │ DeviceIdentity  │   │    LocalConfig      │   │  SensorRecord   │   │
//! │  │  ─────────────  │   │  ─────────────────  │   │  ─────────────  │   │
//! │  │  appName        │   │  mqttConfig ──┐     │   │  timestamp      │   │
//! │  │  deviceId       │   │  parameters   │     │   │  pressure       │   │
//! │  │  deviceName     │   └───────────────┼─────┘   │  humidity ...   │   │
//! │  │  hostname       │                   ▼         └────────┬────────┘   │
//! │  └─────────────────┘   ┌─────────────────────┐            │            │
//! │                        │   BrokerConfig      │            ▼            │
//! │                        │  provider = "GCP"   │   ┌─────────────────┐   │
//! │                        │   │ "Mosquitto"     │   │  UnsentBatch    │   │
//! │                        └─────────────────────┘   │  record + file  │   │
//! │                                                  └─────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ownership
//! - `DeviceIdentity` is owned by the local store and read-only here.
//! - `LocalConfig.broker` never changes while the daemon runs; only
//!   `parameters` is written back.
//! - Sensor records are never mutated; they are deleted once delivered.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};

/// Placeholder device id written by the local store before provisioning.
pub const UNSET_DEVICE_ID: &str = "unset";

// =============================================================================
// Device Identity
// =============================================================================

/// Identity of this device install, as reported by `GET /info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct DeviceIdentity {
    pub app_name: String,
    pub device_id: String,
    pub device_name: String,
    pub hostname: String,
}

impl DeviceIdentity {
    /// Returns false while the local store still carries the placeholder id.
    pub fn is_provisioned(&self) -> bool {
        let id = self.device_id.trim();
        !id.is_empty() && id != UNSET_DEVICE_ID
    }
}

// =============================================================================
// Broker Configuration
// =============================================================================

/// Which broker provider a config targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    /// Managed cloud IoT broker, token-authenticated over TLS.
    Cloud,
    /// Self-hosted broker on the local network.
    Local,
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerKind::Cloud => write!(f, "cloud"),
            BrokerKind::Local => write!(f, "local"),
        }
    }
}

/// Connection settings for the cloud provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct CloudBrokerConfig {
    pub hostname: String,
    pub port: u16,
    pub project_id: String,
    pub region: String,
    pub registry_id: String,
}

impl CloudBrokerConfig {
    /// Fully qualified client id the cloud broker expects for a device.
    pub fn client_id(&self, device_id: &str) -> String {
        format!(
            "projects/{}/locations/{}/registries/{}/devices/{}",
            self.project_id, self.region, self.registry_id, device_id
        )
    }
}

/// Connection settings for a self-hosted broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct LocalBrokerConfig {
    pub hostname: String,
    pub port: u16,
    /// Transport protocol as written by the operator (`mqtt`, `mqtts`, ...).
    pub protocol: String,
}

impl LocalBrokerConfig {
    /// Parses the configured protocol.
    pub fn protocol(&self) -> CoreResult<BrokerProtocol> {
        self.protocol.parse()
    }
}

/// Transport used to reach a self-hosted broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerProtocol {
    /// Plain TCP.
    Mqtt,
    /// TCP wrapped in TLS.
    Mqtts,
    /// MQTT over a WebSocket.
    Ws,
    /// MQTT over a WebSocket on TLS.
    Wss,
}

impl BrokerProtocol {
    pub fn is_tls(&self) -> bool {
        matches!(self, BrokerProtocol::Mqtts | BrokerProtocol::Wss)
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, BrokerProtocol::Ws | BrokerProtocol::Wss)
    }
}

impl fmt::Display for BrokerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerProtocol::Mqtt => write!(f, "mqtt"),
            BrokerProtocol::Mqtts => write!(f, "mqtts"),
            BrokerProtocol::Ws => write!(f, "ws"),
            BrokerProtocol::Wss => write!(f, "wss"),
        }
    }
}

impl FromStr for BrokerProtocol {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mqtt" | "tcp" => Ok(BrokerProtocol::Mqtt),
            "mqtts" | "ssl" | "tls" => Ok(BrokerProtocol::Mqtts),
            "ws" => Ok(BrokerProtocol::Ws),
            "wss" => Ok(BrokerProtocol::Wss),
            other => Err(CoreError::InvalidConfig(format!(
                "Unsupported broker protocol: '{}'. Valid options: mqtt, mqtts, ws, wss",
                other
            ))),
        }
    }
}

/// Broker section of the local config, tagged by `provider`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "provider")]
#[ts(export)]
pub enum BrokerConfig {
    #[serde(rename = "GCP")]
    CloudProvider(CloudBrokerConfig),

    #[serde(rename = "Mosquitto")]
    LocalBroker(LocalBrokerConfig),
}

impl BrokerConfig {
    pub fn kind(&self) -> BrokerKind {
        match self {
            BrokerConfig::CloudProvider(_) => BrokerKind::Cloud,
            BrokerConfig::LocalBroker(_) => BrokerKind::Local,
        }
    }

    pub fn hostname(&self) -> &str {
        match self {
            BrokerConfig::CloudProvider(c) => &c.hostname,
            BrokerConfig::LocalBroker(c) => &c.hostname,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            BrokerConfig::CloudProvider(c) => c.port,
            BrokerConfig::LocalBroker(c) => c.port,
        }
    }
}

// =============================================================================
// Parameters
// =============================================================================

/// Open map of runtime tunables (`telemetryRefreshInterval`, ...).
///
/// Compared by value: two maps with the same entries are equal no matter
/// how they were built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Parameters(#[ts(type = "Record<string, unknown>")] BTreeMap<String, Value>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Numeric lookup, `None` when absent or not an unsigned integer.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Parameters(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// =============================================================================
// Local Config
// =============================================================================

/// Persisted device configuration, as served by `GET /local-config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct LocalConfig {
    #[serde(rename = "mqttConfig", alias = "brokerConfig")]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub parameters: Parameters,
}

impl LocalConfig {
    /// Copy of this config with `parameters` replaced. The broker section is
    /// carried over untouched.
    pub fn with_parameters(&self, parameters: Parameters) -> LocalConfig {
        LocalConfig {
            broker: self.broker.clone(),
            parameters,
        }
    }
}

// =============================================================================
// Sensor Records
// =============================================================================

/// One captured sensor reading.
///
/// The timestamp is kept exactly as the store wrote it so the record reaches
/// the broker byte-for-byte. Fields this crate does not know about ride along
/// in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SensorRecord {
    /// ISO-8601 capture time.
    pub timestamp: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_from_humidity: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_from_pressure: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,

    #[serde(flatten)]
    #[ts(skip)]
    pub extra: BTreeMap<String, Value>,
}

impl SensorRecord {
    /// A record with only a timestamp set.
    pub fn at(timestamp: impl Into<String>) -> Self {
        SensorRecord {
            timestamp: timestamp.into(),
            temperature_from_humidity: None,
            temperature_from_pressure: None,
            pressure: None,
            humidity: None,
            extra: BTreeMap::new(),
        }
    }
}

// =============================================================================
// Unsent Batch
// =============================================================================

/// Raw body of `GET /sensors/unprocessed`: `data[i]` was read from `files[i]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct UnsentListing {
    #[serde(default)]
    pub data: Vec<SensorRecord>,

    #[serde(default)]
    pub files: Vec<String>,
}

/// A record paired with the handle used to delete it from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsentRecord {
    pub record: SensorRecord,
    pub origin_file_id: String,
}

/// Records fetched in one poll cycle, ordered by origin file id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnsentBatch {
    entries: Vec<UnsentRecord>,
}

impl UnsentBatch {
    /// Pairs up a listing. Rejects listings whose arrays differ in length,
    /// since the file handles could no longer be trusted.
    pub fn from_listing(listing: UnsentListing) -> CoreResult<Self> {
        if listing.data.len() != listing.files.len() {
            return Err(CoreError::MisalignedBatch {
                records: listing.data.len(),
                files: listing.files.len(),
            });
        }

        let mut entries: Vec<UnsentRecord> = listing
            .data
            .into_iter()
            .zip(listing.files)
            .map(|(record, origin_file_id)| UnsentRecord {
                record,
                origin_file_id,
            })
            .collect();
        entries.sort_by(|a, b| a.origin_file_id.cmp(&b.origin_file_id));

        Ok(UnsentBatch { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[UnsentRecord] {
        &self.entries
    }

    pub fn file_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.origin_file_id.as_str())
    }

    /// Payload to publish for this batch.
    pub fn to_telemetry(&self) -> Telemetry {
        Telemetry {
            data: self.entries.iter().map(|e| e.record.clone()).collect(),
        }
    }
}

// =============================================================================
// Telemetry
// =============================================================================

/// Payload published on the device events topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Telemetry {
    pub data: Vec<SensorRecord>,
}

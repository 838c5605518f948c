//! # Broker Protocol
//!
//! Topic layout and payload framing shared by both broker providers.
//!
//! ## Topics
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Topic                        │ Direction │ QoS │ Payload               │
//! │  ─────────────────────────────┼───────────┼─────┼────────────────────── │
//! │  /devices/{id}/errors         │ inbound   │  0  │ free text, logged     │
//! │  /devices/{id}/config         │ inbound   │  1  │ { parameters: {...} } │
//! │  /devices/{id}/events         │ outbound  │  1  │ { data: [...] } (ret.)│
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Framing
//! The cloud provider carries JSON text as-is. The local broker wraps every
//! payload in standard base64, in both directions.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use sense_core::{Parameters, Telemetry};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Topics
// =============================================================================

/// Which device channel a topic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Errors,
    Config,
    Events,
    Unknown,
}

/// Topics scoped to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    pub errors: String,
    pub config: String,
    pub events: String,
}

impl DeviceTopics {
    pub fn for_device(device_id: &str) -> Self {
        DeviceTopics {
            errors: format!("/devices/{}/errors", device_id),
            config: format!("/devices/{}/config", device_id),
            events: format!("/devices/{}/events", device_id),
        }
    }

    pub fn classify(&self, topic: &str) -> TopicKind {
        if topic == self.errors {
            TopicKind::Errors
        } else if topic == self.config {
            TopicKind::Config
        } else if topic == self.events {
            TopicKind::Events
        } else {
            TopicKind::Unknown
        }
    }
}

// =============================================================================
// Payload Encoding
// =============================================================================

/// Wire framing for payload text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    /// UTF-8 text as-is.
    Plain,
    /// Standard base64 over the UTF-8 text.
    Base64,
}

impl PayloadEncoding {
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            PayloadEncoding::Plain => text.as_bytes().to_vec(),
            PayloadEncoding::Base64 => STANDARD.encode(text).into_bytes(),
        }
    }

    /// Decodes a received payload back to text.
    pub fn decode(&self, topic: &str, payload: &[u8]) -> SyncResult<String> {
        let malformed = |reason: String| SyncError::MalformedMessage {
            topic: topic.to_string(),
            reason,
        };

        let bytes = match self {
            PayloadEncoding::Plain => payload.to_vec(),
            PayloadEncoding::Base64 => {
                // Brokers and tools sometimes append a newline.
                let trimmed = trim_ascii_whitespace(payload);
                STANDARD
                    .decode(trimmed)
                    .map_err(|e| malformed(format!("invalid base64: {}", e)))?
            }
        };

        String::from_utf8(bytes).map_err(|e| malformed(format!("invalid UTF-8: {}", e)))
    }
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

// =============================================================================
// Messages
// =============================================================================

/// Body of a config-channel push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigPush {
    pub parameters: Parameters,
}

impl ConfigPush {
    /// Parses decoded payload text. Empty payloads are not pushes and come
    /// back as `None`.
    pub fn parse(topic: &str, text: &str) -> SyncResult<Option<ConfigPush>> {
        if text.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(text)
            .map(Some)
            .map_err(|e| SyncError::MalformedMessage {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Serialized telemetry text, before framing.
pub fn telemetry_text(telemetry: &Telemetry) -> SyncResult<String> {
    Ok(serde_json::to_string(telemetry)?)
}

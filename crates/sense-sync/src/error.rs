//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Local API     │  │     Startup             │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Unavailable    │  │  StartupExhausted       │ │
//! │  │  ConfigLoad...  │  │                 │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Credentials    │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Credential     │  │  Transport      │  │  MalformedMessage       │ │
//! │  │  KeyProvisioning│  │  NotConnected   │  │  SerializationFailed    │ │
//! │  │                 │  │  ConnectionLost │  │                         │ │
//! │  │                 │  │  AckTimeout     │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Handling Policy
//! - Startup: only `StartupExhausted` and invalid identity/config are fatal
//! - Steady state: every error is logged and recovered by a timer

use thiserror::Error;

use sense_core::CoreError;
use sense_local::LocalError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Daemon or broker configuration is unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to read or parse the daemon config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    // =========================================================================
    // Local API Errors
    // =========================================================================
    /// The local store API is unreachable or returned a failure.
    #[error(transparent)]
    Unavailable(#[from] LocalError),

    // =========================================================================
    // Startup Errors
    // =========================================================================
    /// A startup step kept failing until its retry budget ran out.
    #[error("Startup step '{step}' failed after {attempts} attempts: {last_error}")]
    StartupExhausted {
        step: &'static str,
        attempts: u32,
        last_error: String,
    },

    // =========================================================================
    // Credential Errors
    // =========================================================================
    /// The device token could not be produced (key unreadable, signing failed).
    #[error("Credential error: {0}")]
    Credential(String),

    /// Key material could not be downloaded or persisted.
    #[error("Key provisioning failed: {0}")]
    KeyProvisioning(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Broker-level failure (connection refused, TLS, protocol violation).
    #[error("Broker transport error: {0}")]
    Transport(String),

    /// Publish attempted while no broker session is up.
    #[error("Not connected to broker")]
    NotConnected,

    /// The session ended before the broker acknowledged a publish.
    #[error("Broker connection lost before acknowledgment")]
    ConnectionLost,

    /// The broker did not acknowledge in time.
    #[error("No broker acknowledgment after {0} seconds")]
    AckTimeout(u64),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Inbound broker payload could not be decoded or parsed.
    #[error("Malformed message on {topic}: {reason}")]
    MalformedMessage { topic: String, reason: String },

    /// Failed to serialize an outbound payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Agent is shutting down.
    #[error("Sync agent is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        SyncError::InvalidConfig(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidConfig(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for SyncError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        SyncError::Credential(err.to_string())
    }
}

impl From<rumqttc::ClientError> for SyncError {
    fn from(err: rumqttc::ClientError) -> Self {
        SyncError::Transport(err.to_string())
    }
}

impl From<rumqttc::ConnectionError> for SyncError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        SyncError::Transport(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if a later attempt of the same operation may succeed.
    ///
    /// ## Retryable Errors
    /// - Local API outages
    /// - Broker transport failures, lost sessions, missing acks
    /// - Credential failures (the reconnect timer retries them)
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Exhausted startup steps
    /// - Malformed payloads
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Unavailable(_)
                | SyncError::Credential(_)
                | SyncError::KeyProvisioning(_)
                | SyncError::Transport(_)
                | SyncError::NotConnected
                | SyncError::ConnectionLost
                | SyncError::AckTimeout(_)
        )
    }

    /// Returns true if the daemon cannot continue and must exit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::StartupExhausted { .. }
                | SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
        )
    }
}

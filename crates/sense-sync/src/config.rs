//! # Daemon Configuration
//!
//! Process-level settings for the sync daemon. Broker settings are NOT here:
//! they live in the local store (`GET /local-config`) and are fetched at
//! startup.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     SENSE_DATA_FOLDER=/var/lib/sense                                   │
//! │     SENSE_LOCAL_API_URL=http://localhost:8080/api                      │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     --config / SENSE_CONFIG, else                                      │
//! │     ~/.config/sense-sync/syncd.toml (Linux)                            │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [daemon]
//! data_folder = "/var/lib/sense/mqtt"
//! local_api_url = "http://localhost:8080/api"
//!
//! [keys]
//! provisioning_url = "https://storage.googleapis.com/gp-iot-dev.appspot.com/public/certs"
//! # private_key_file = "/etc/sense/ec_private.pem"
//!
//! [broker]
//! ack_timeout_secs = 30
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{SyncError, SyncResult};

/// File names used inside `<data_folder>/keys`.
pub const PRIVATE_KEY_FILE: &str = "ec_private.pem";
pub const PUBLIC_KEY_FILE: &str = "ec_public.pem";

// =============================================================================
// Daemon Settings
// =============================================================================

/// Where the daemon keeps its files and how it reaches the local store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Root folder for daemon state (key material lives under `keys/`).
    #[serde(default = "default_data_folder")]
    pub data_folder: PathBuf,

    /// Base URL of the local store API.
    #[serde(default = "default_local_api_url")]
    pub local_api_url: String,
}

fn default_data_folder() -> PathBuf {
    directories::ProjectDirs::from("com", "sense", "sense-sync")
        .map(|dirs| dirs.data_dir().join("mqtt"))
        .unwrap_or_else(|| PathBuf::from("./data/mqtt"))
}

fn default_local_api_url() -> String {
    sense_local::DEFAULT_LOCAL_API_URL.to_string()
}

impl Default for DaemonSettings {
    fn default() -> Self {
        DaemonSettings {
            data_folder: default_data_folder(),
            local_api_url: default_local_api_url(),
        }
    }
}

// =============================================================================
// Key Settings
// =============================================================================

/// Cloud provider key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySettings {
    /// Base URL keys are downloaded from: `<url>/<deviceId>/<file>`.
    #[serde(default = "default_provisioning_url")]
    pub provisioning_url: String,

    /// Override for the signing key path.
    #[serde(default)]
    pub private_key_file: Option<PathBuf>,

    /// Override for the public key path.
    #[serde(default)]
    pub public_key_file: Option<PathBuf>,
}

fn default_provisioning_url() -> String {
    "https://storage.googleapis.com/gp-iot-dev.appspot.com/public/certs".to_string()
}

impl Default for KeySettings {
    fn default() -> Self {
        KeySettings {
            provisioning_url: default_provisioning_url(),
            private_key_file: None,
            public_key_file: None,
        }
    }
}

// =============================================================================
// Broker Settings
// =============================================================================

/// Broker client tunables that are not part of the local config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// How long a publish waits for PUBACK before it counts as failed.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
}

fn default_ack_timeout() -> u64 {
    30
}

impl Default for BrokerSettings {
    fn default() -> Self {
        BrokerSettings {
            ack_timeout_secs: default_ack_timeout(),
        }
    }
}

// =============================================================================
// Main Daemon Configuration
// =============================================================================

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSettings,

    #[serde(default)]
    pub keys: KeySettings,

    #[serde(default)]
    pub broker: BrokerSettings,
}

impl DaemonConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (syncd.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        let explicit = config_path.or_else(|| std::env::var("SENSE_CONFIG").ok().map(PathBuf::from));
        let is_explicit = explicit.is_some();

        if let Some(path) = explicit.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading daemon config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else if is_explicit {
                return Err(SyncError::ConfigLoadFailed(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.daemon.data_folder.as_os_str().is_empty() {
            return Err(SyncError::InvalidConfig("data_folder must not be empty".into()));
        }

        for (name, value) in [
            ("local_api_url", &self.daemon.local_api_url),
            ("provisioning_url", &self.keys.provisioning_url),
        ] {
            let url = Url::parse(value)
                .map_err(|e| SyncError::InvalidConfig(format!("{} '{}': {}", name, value, e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(SyncError::InvalidConfig(format!(
                    "{} must be an http(s) URL, got: {}",
                    name, value
                )));
            }
        }

        if self.broker.ack_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "ack_timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(folder) = std::env::var("SENSE_DATA_FOLDER") {
            debug!(data_folder = %folder, "Overriding data folder from environment");
            self.daemon.data_folder = PathBuf::from(folder);
        }

        if let Ok(url) = std::env::var("SENSE_LOCAL_API_URL") {
            debug!(url = %url, "Overriding local API URL from environment");
            self.daemon.local_api_url = url;
        }

        if let Ok(url) = std::env::var("SENSE_KEY_PROVISIONING_URL") {
            self.keys.provisioning_url = url;
        }

        if let Ok(path) = std::env::var("SENSE_PRIVATE_KEY_FILE") {
            self.keys.private_key_file = Some(PathBuf::from(path));
        }

        if let Ok(path) = std::env::var("SENSE_PUBLIC_KEY_FILE") {
            self.keys.public_key_file = Some(PathBuf::from(path));
        }

        if let Ok(secs) = std::env::var("SENSE_ACK_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.broker.ack_timeout_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring unparsable SENSE_ACK_TIMEOUT_SECS"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "sense", "sense-sync")
            .map(|dirs| dirs.config_dir().join("syncd.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn data_folder(&self) -> &Path {
        &self.daemon.data_folder
    }

    /// Folder holding the cloud provider key pair.
    pub fn keys_dir(&self) -> PathBuf {
        self.daemon.data_folder.join("keys")
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.keys
            .private_key_file
            .clone()
            .unwrap_or_else(|| self.keys_dir().join(PRIVATE_KEY_FILE))
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.keys
            .public_key_file
            .clone()
            .unwrap_or_else(|| self.keys_dir().join(PUBLIC_KEY_FILE))
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.broker.ack_timeout_secs)
    }
}

//! # Validation Module
//!
//! Checks run on data fetched from the local store before the daemon acts on
//! it. The store is trusted for shape (serde already enforced that) but not
//! for content: an unprovisioned device or a half-filled broker form must
//! stop startup instead of producing a broker session that can never work.
//!
//! ## Usage
//! ```rust
//! use sense_core::validation::validate_identity;
//! use sense_core::DeviceIdentity;
//!
//! let identity = DeviceIdentity {
//!     app_name: "weather".into(),
//!     device_id: "dev-42".into(),
//!     device_name: "Porch".into(),
//!     hostname: "porch.local".into(),
//! };
//! validate_identity(&identity).unwrap();
//! ```

use crate::error::{CoreError, CoreResult};
use crate::types::{BrokerConfig, DeviceIdentity};

/// Rejects identities that still carry the placeholder or an empty id.
pub fn validate_identity(identity: &DeviceIdentity) -> CoreResult<()> {
    if !identity.is_provisioned() {
        return Err(CoreError::InvalidIdentity(format!(
            "device id '{}' has not been provisioned",
            identity.device_id
        )));
    }

    if identity.device_id.contains(['/', '+', '#']) {
        return Err(CoreError::InvalidIdentity(format!(
            "device id '{}' contains topic wildcard or separator characters",
            identity.device_id
        )));
    }

    Ok(())
}

/// Validates the broker section of the local config.
///
/// ## Rules
/// - Hostname must not be empty
/// - Port must not be 0
/// - Cloud: project, region and registry ids must be present
/// - Local: protocol must be one of `mqtt`, `mqtts`, `ws`, `wss`
pub fn validate_broker_config(broker: &BrokerConfig) -> CoreResult<()> {
    if broker.hostname().trim().is_empty() {
        return Err(CoreError::InvalidConfig("hostname must not be empty".into()));
    }

    if broker.port() == 0 {
        return Err(CoreError::InvalidConfig("port must be greater than 0".into()));
    }

    match broker {
        BrokerConfig::CloudProvider(cloud) => {
            for (name, value) in [
                ("projectId", &cloud.project_id),
                ("region", &cloud.region),
                ("registryId", &cloud.registry_id),
            ] {
                if value.trim().is_empty() {
                    return Err(CoreError::InvalidConfig(format!("{} must not be empty", name)));
                }
            }
        }
        BrokerConfig::LocalBroker(local) => {
            local.protocol()?;
        }
    }

    Ok(())
}

//! # Credential Manager
//!
//! Short-lived device tokens for the cloud broker. The cloud provider
//! authenticates devices with a JWT signed by the device's EC private key and
//! passed as the MQTT password.
//!
//! ## Token Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Device Token Lifecycle                           │
//! │                                                                         │
//! │   iat                          exp - 60s              exp               │
//! │    │◄────────── reused ─────────►│◄─── refreshed ────►│                 │
//! │    ├─────────────────────────────┼────────────────────┤                 │
//! │    0s                           240s                 300s               │
//! │                                                                         │
//! │  get_token():                                                          │
//! │    cached && now < exp - 60s  →  same token, no side effect            │
//! │    otherwise                  →  read key, sign {iat, exp, aud}, cache │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Token Storage
//! Tokens live in memory only, one at a time. The signing key is re-read
//! from disk on every mint so a freshly provisioned key is picked up.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// Lifetime of a freshly minted token.
pub const TOKEN_LIFETIME_SECS: i64 = 300;

/// Margin before expiry at which a cached token is replaced.
pub const REFRESH_SKEW_SECS: i64 = 60;

/// A signed device token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    /// Compact JWS, sent as the MQTT password.
    pub signed_value: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    /// True from one skew window before expiry onwards.
    pub fn needs_refresh_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at - Duration::seconds(REFRESH_SKEW_SECS)
    }
}

/// JWT claims the cloud broker checks.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub iat: i64,
    pub exp: i64,
    /// Cloud project id.
    pub aud: String,
}

/// Mints and caches device tokens.
#[derive(Debug)]
pub struct CredentialManager {
    audience: String,
    private_key_path: PathBuf,
    cached: Mutex<Option<AuthToken>>,
}

impl CredentialManager {
    /// `audience` is the cloud project id; the key must be a PKCS#8 EC PEM.
    pub fn new(audience: impl Into<String>, private_key_path: impl Into<PathBuf>) -> Self {
        CredentialManager {
            audience: audience.into(),
            private_key_path: private_key_path.into(),
            cached: Mutex::new(None),
        }
    }

    /// Returns a token valid for at least another minute.
    pub fn get_token(&self) -> SyncResult<AuthToken> {
        self.token_at(Utc::now())
    }

    /// [`get_token`](Self::get_token) with an explicit clock.
    pub fn token_at(&self, now: DateTime<Utc>) -> SyncResult<AuthToken> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| SyncError::Credential("token cache lock poisoned".into()))?;

        if let Some(token) = cached.as_ref() {
            if !token.needs_refresh_at(now) {
                return Ok(token.clone());
            }
        }

        let token = self.mint(now)?;
        *cached = Some(token.clone());
        Ok(token)
    }

    fn mint(&self, now: DateTime<Utc>) -> SyncResult<AuthToken> {
        let pem = std::fs::read(&self.private_key_path).map_err(|e| {
            SyncError::Credential(format!(
                "cannot read signing key {}: {}",
                self.private_key_path.display(),
                e
            ))
        })?;
        let key = EncodingKey::from_ec_pem(&pem)?;

        let expires_at = now + Duration::seconds(TOKEN_LIFETIME_SECS);
        let claims = Claims {
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            aud: self.audience.clone(),
        };
        let signed_value = encode(&Header::new(Algorithm::ES256), &claims, &key)?;

        debug!(audience = %self.audience, expires_at = %expires_at, "Minted device token");

        Ok(AuthToken {
            signed_value,
            issued_at: now,
            expires_at,
        })
    }
}

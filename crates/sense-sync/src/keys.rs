//! # Key Provisioning
//!
//! Makes sure the cloud provider key pair exists on disk before the first
//! connect. Missing files are downloaded from the provisioning location:
//!
//! ```text
//! <provisioning_url>/<deviceId>/ec_private.pem  →  <data_folder>/keys/ec_private.pem
//! <provisioning_url>/<deviceId>/ec_public.pem   →  <data_folder>/keys/ec_public.pem
//! ```
//!
//! Nothing here is fatal. A failed download is logged and the connect
//! attempt goes ahead; it fails on its own if the key is unusable and the
//! reconnect timer takes over.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{DaemonConfig, PRIVATE_KEY_FILE, PUBLIC_KEY_FILE};
use crate::error::{SyncError, SyncResult};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of [`KeyProvisioner::ensure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
    /// Both files are present on disk.
    pub complete: bool,
}

/// Downloads missing key files.
#[derive(Debug, Clone)]
pub struct KeyProvisioner {
    client: Client,
    base_url: Url,
    private_key: PathBuf,
    public_key: PathBuf,
}

impl KeyProvisioner {
    pub fn new(
        provisioning_url: &str,
        private_key: impl Into<PathBuf>,
        public_key: impl Into<PathBuf>,
    ) -> SyncResult<Self> {
        let base_url = Url::parse(provisioning_url)?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::InvalidConfig(format!(
                "provisioning_url cannot be used as a base URL: {}",
                provisioning_url
            )));
        }

        let client = Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| SyncError::KeyProvisioning(e.to_string()))?;

        Ok(KeyProvisioner {
            client,
            base_url,
            private_key: private_key.into(),
            public_key: public_key.into(),
        })
    }

    pub fn from_config(config: &DaemonConfig) -> SyncResult<Self> {
        Self::new(
            &config.keys.provisioning_url,
            config.private_key_path(),
            config.public_key_path(),
        )
    }

    /// Downloads whichever key files are missing. Never fails; check
    /// [`KeyMaterial::complete`] for the result.
    pub async fn ensure(&self, device_id: &str) -> KeyMaterial {
        let mut complete = true;

        for (dest, file) in [
            (&self.private_key, PRIVATE_KEY_FILE),
            (&self.public_key, PUBLIC_KEY_FILE),
        ] {
            if tokio::fs::try_exists(dest).await.unwrap_or(false) {
                debug!(path = %dest.display(), "Key file present");
                continue;
            }

            match self.download(device_id, file, dest).await {
                Ok(bytes) => {
                    info!(path = %dest.display(), bytes, "Provisioned key file");
                }
                Err(e) => {
                    warn!(
                        device_id = %device_id,
                        file = %file,
                        error = %e,
                        "Key provisioning failed, continuing without it"
                    );
                    complete = false;
                }
            }
        }

        KeyMaterial {
            private_key: self.private_key.clone(),
            public_key: self.public_key.clone(),
            complete,
        }
    }

    fn file_url(&self, device_id: &str, file: &str) -> SyncResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidConfig(self.base_url.to_string()))?
            .pop_if_empty()
            .push(device_id)
            .push(file);
        Ok(url)
    }

    async fn download(&self, device_id: &str, file: &str, dest: &Path) -> SyncResult<usize> {
        let url = self.file_url(device_id, file)?;
        debug!(endpoint = %url, "Downloading key file");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| SyncError::KeyProvisioning(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::KeyProvisioning(format!("{}: HTTP {}", url, status)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| SyncError::KeyProvisioning(format!("{}: {}", url, e)))?;

        persist(dest, &body)
            .await
            .map_err(|e| SyncError::KeyProvisioning(format!("{}: {}", dest.display(), e)))?;

        Ok(body.len())
    }
}

/// Writes via a sibling temp file so a crash never leaves a truncated key.
async fn persist(dest: &Path, body: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = dest.with_extension("pem.part");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, dest).await
}

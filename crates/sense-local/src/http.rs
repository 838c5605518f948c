//! # HTTP Local Queue
//!
//! [`LocalQueue`] over the local store's JSON API.
//!
//! ## Endpoints
//! ```text
//! ┌──────────────────────────────────────┬──────────────────────────────────┐
//! │ Request                              │ Response                         │
//! ├──────────────────────────────────────┼──────────────────────────────────┤
//! │ GET    {base}/info                   │ DeviceIdentity                   │
//! │ GET    {base}/local-config           │ LocalConfig                      │
//! │ PATCH  {base}/local-config           │ { message }                      │
//! │ GET    {base}/sensors/unprocessed    │ { data: [...], files: [...] }    │
//! │ DELETE {base}/sensors/unprocessed/:f │ { status, message } (404 = gone) │
//! └──────────────────────────────────────┴──────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use sense_core::{DeviceIdentity, LocalConfig, UnsentBatch, UnsentListing};

use crate::error::{LocalError, LocalResult};
use crate::queue::LocalQueue;

/// Where the local store API listens on a stock device.
pub const DEFAULT_LOCAL_API_URL: &str = "http://localhost:8080/api";

/// Upper bound for a single local API call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Local store client backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpLocalQueue {
    client: Client,
    base: Url,
}

impl HttpLocalQueue {
    /// Creates a client rooted at `base_url` (e.g. `http://localhost:8080/api`).
    pub fn new(base_url: &str) -> LocalResult<Self> {
        let mut base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            return Err(LocalError::InvalidUrl(format!(
                "{} cannot be used as a base URL",
                base_url
            )));
        }
        // `Url::join` replaces the last segment unless the path ends in '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LocalError::InvalidUrl(e.to_string()))?;

        Ok(HttpLocalQueue { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> LocalResult<Url> {
        Ok(self.base.join(path)?)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> LocalResult<T> {
        let url = self.endpoint(path)?;
        debug!(method = "GET", endpoint = %url, "Local API request");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| LocalError::unavailable(&url, e))?;

        ensure_success(&url, response)?
            .json::<T>()
            .await
            .map_err(|e| LocalError::unavailable(&url, e))
    }
}

fn ensure_success(url: &Url, response: Response) -> LocalResult<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(LocalError::unavailable(url, format!("HTTP {}", status)))
    }
}

#[async_trait]
impl LocalQueue for HttpLocalQueue {
    async fn fetch_identity(&self) -> LocalResult<DeviceIdentity> {
        self.get_json("info").await
    }

    async fn fetch_config(&self) -> LocalResult<LocalConfig> {
        self.get_json("local-config").await
    }

    async fn write_config(&self, config: &LocalConfig) -> LocalResult<()> {
        let url = self.endpoint("local-config")?;
        debug!(method = "PATCH", endpoint = %url, "Local API request");

        let response = self
            .client
            .patch(url.clone())
            .json(config)
            .send()
            .await
            .map_err(|e| LocalError::unavailable(&url, e))?;

        ensure_success(&url, response)?;
        Ok(())
    }

    async fn fetch_unsent(&self) -> LocalResult<UnsentBatch> {
        let listing: UnsentListing = self.get_json("sensors/unprocessed").await?;
        Ok(UnsentBatch::from_listing(listing)?)
    }

    async fn delete_unsent(&self, origin_file_id: &str) -> LocalResult<()> {
        let mut url = self.endpoint("sensors/unprocessed")?;
        url.path_segments_mut()
            .map_err(|_| LocalError::InvalidUrl(self.base.to_string()))?
            .push(origin_file_id);
        debug!(method = "DELETE", endpoint = %url, "Local API request");

        let response = self
            .client
            .delete(url.clone())
            .send()
            .await
            .map_err(|e| LocalError::unavailable(&url, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(file = %origin_file_id, "Unsent record already gone");
            return Ok(());
        }

        ensure_success(&url, response)?;
        Ok(())
    }
}

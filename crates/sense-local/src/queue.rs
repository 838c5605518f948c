//! # Local Queue
//!
//! The seam between the sync engine and the device-local record store.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  sense-sync                                                             │
//! │       │  queue.fetch_unsent()  /  queue.delete_unsent("<file>")         │
//! │       ▼                                                                 │
//! │  dyn LocalQueue                                                        │
//! │  ├── HttpLocalQueue   (production, talks to the local API)             │
//! │  └── in-memory fakes  (sense-sync tests)                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Implementations never retry. Callers own the retry policy.

use async_trait::async_trait;
use sense_core::{DeviceIdentity, LocalConfig, UnsentBatch};

use crate::error::LocalResult;

#[async_trait]
pub trait LocalQueue: Send + Sync {
    /// Device identity (`GET /info`).
    async fn fetch_identity(&self) -> LocalResult<DeviceIdentity>;

    /// Persisted config (`GET /local-config`).
    async fn fetch_config(&self) -> LocalResult<LocalConfig>;

    /// Replaces the persisted config (`PATCH /local-config`).
    async fn write_config(&self, config: &LocalConfig) -> LocalResult<()>;

    /// Records not yet delivered. An empty store yields an empty batch.
    async fn fetch_unsent(&self) -> LocalResult<UnsentBatch>;

    /// Removes one delivered record. Deleting a missing record succeeds.
    async fn delete_unsent(&self, origin_file_id: &str) -> LocalResult<()>;
}

//! # sense-local: Local Store Client
//!
//! Typed access to the device-local record store. The store persists sensor
//! readings as one JSON file per capture and exposes them over a small HTTP
//! API; this crate is the only place that speaks that API.
//!
//! ## Modules
//!
//! - [`queue`] - The `LocalQueue` trait consumed by the sync engine
//! - [`http`] - `HttpLocalQueue`, the reqwest-backed implementation
//! - [`error`] - Local store error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sense_local::{HttpLocalQueue, LocalQueue};
//!
//! let queue = HttpLocalQueue::new("http://localhost:8080/api")?;
//! let batch = queue.fetch_unsent().await?;
//! for file in batch.file_ids() {
//!     queue.delete_unsent(file).await?;
//! }
//! ```

pub mod error;
pub mod http;
pub mod queue;

pub use error::{LocalError, LocalResult};
pub use http::{HttpLocalQueue, DEFAULT_LOCAL_API_URL};
pub use queue::LocalQueue;

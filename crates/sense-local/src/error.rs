//! # Local Store Error Types
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  reqwest::Error / HTTP status / bad JSON                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  LocalError (this module) ← Adds endpoint context                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncError::Unavailable (sense-sync) ← Caller picks retry policy       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use sense_core::CoreError;
use thiserror::Error;

/// Result type alias for local store operations.
pub type LocalResult<T> = Result<T, LocalError>;

/// Local store client errors.
#[derive(Debug, Error)]
pub enum LocalError {
    /// The local API could not be reached or answered with a failure.
    ///
    /// ## When This Occurs
    /// - Connection refused / timed out
    /// - Non-2xx status (other than 404 on delete)
    /// - Response body is not the expected JSON
    #[error("Local API unavailable at {endpoint}: {reason}")]
    Unavailable { endpoint: String, reason: String },

    /// The configured base URL cannot be used.
    #[error("Invalid local API URL: {0}")]
    InvalidUrl(String),

    /// The unsent listing could not be paired into a batch.
    #[error("Invalid unsent listing: {0}")]
    InvalidListing(#[from] CoreError),
}

impl LocalError {
    pub(crate) fn unavailable(endpoint: &url::Url, reason: impl ToString) -> Self {
        LocalError::Unavailable {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Endpoint the failure relates to, when there is one.
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            LocalError::Unavailable { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }
}

impl From<url::ParseError> for LocalError {
    fn from(err: url::ParseError) -> Self {
        LocalError::InvalidUrl(err.to_string())
    }
}

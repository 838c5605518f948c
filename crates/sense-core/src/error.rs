//! # Error Types
//!
//! Domain errors raised while validating data coming from the local store.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  sense-core errors (this file)                                         │
//! │  └── CoreError        - Invalid identity / config / unsent listing     │
//! │                                                                         │
//! │  sense-local errors (separate crate)                                   │
//! │  └── LocalError       - Local API unreachable or misbehaving           │
//! │                                                                         │
//! │  sense-sync errors (separate crate)                                    │
//! │  └── SyncError        - Everything the daemon can run into             │
//! │                                                                         │
//! │  Flow: CoreError → LocalError → SyncError → log line / exit code       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type for domain checks.
pub type CoreResult<T> = Result<T, CoreError>;

/// Domain errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// The device identity cannot be used to address the broker.
    ///
    /// ## When This Occurs
    /// - The local store has not been provisioned yet (`deviceId == "unset"`)
    /// - The device id is empty
    #[error("Invalid device identity: {0}")]
    InvalidIdentity(String),

    /// The broker section of the local config is unusable.
    #[error("Invalid broker config: {0}")]
    InvalidConfig(String),

    /// The unsent listing had a different number of records and file handles.
    #[error("Unsent listing is misaligned: {records} records, {files} files")]
    MisalignedBatch { records: usize, files: usize },
}

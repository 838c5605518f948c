//! # Telemetry Publisher
//!
//! One store-and-forward cycle: fetch unsent records, publish them as one
//! telemetry message, delete them once the broker has acknowledged.
//!
//! ## Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  fetch_unsent() ──err──► Unavailable   (nothing published)             │
//! │       │                                                                 │
//! │     empty ─────────────► Empty         (zero broker calls)             │
//! │       │                                                                 │
//! │  publish + wait(ack) ──err──► Rejected (records stay for next cycle)   │
//! │       │                                                                 │
//! │       ok                                                                │
//! │       ▼                                                                 │
//! │  delete_unsent(file) for each ──► Published { deleted, failures }      │
//! │  (a failed delete only means a duplicate next cycle)                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The caller schedules cycles; nothing here retries.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use sense_local::LocalQueue;

use crate::broker::Broker;

/// Delay between the end of one cycle and the start of the next.
pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(300);

/// Result of one publish cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No unsent records.
    Empty,
    /// Acknowledged by the broker.
    Published {
        records: usize,
        deleted: usize,
        delete_failures: usize,
    },
    /// Publish failed or was not acknowledged; nothing was deleted.
    Rejected { records: usize, reason: String },
    /// The local store could not be read.
    Unavailable { reason: String },
}

pub struct TelemetryPublisher {
    queue: Arc<dyn LocalQueue>,
    ack_timeout: Duration,
}

impl TelemetryPublisher {
    pub fn new(queue: Arc<dyn LocalQueue>, ack_timeout: Duration) -> Self {
        TelemetryPublisher { queue, ack_timeout }
    }

    /// Runs one cycle against `broker`.
    pub async fn run_cycle(&self, broker: &mut dyn Broker) -> CycleOutcome {
        let batch = match self.queue.fetch_unsent().await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(
                    endpoint = e.endpoint().unwrap_or("-"),
                    error = %e,
                    "Could not fetch unsent records"
                );
                return CycleOutcome::Unavailable {
                    reason: e.to_string(),
                };
            }
        };

        if batch.is_empty() {
            debug!("No unsent records");
            return CycleOutcome::Empty;
        }

        let records = batch.len();
        let telemetry = batch.to_telemetry();
        debug!(records, topic = %broker.topics().events, "Publishing telemetry");

        let acked = match broker.publish(&telemetry).await {
            Ok(ack) => ack.wait(self.ack_timeout).await,
            Err(e) => Err(e),
        };

        if let Err(e) = acked {
            warn!(
                records,
                error = %e,
                retryable = e.is_retryable(),
                "Publish failed, keeping records for next cycle"
            );
            return CycleOutcome::Rejected {
                records,
                reason: e.to_string(),
            };
        }

        info!(records, "Telemetry acknowledged by broker");

        let mut deleted = 0;
        let mut delete_failures = 0;
        for file in batch.file_ids() {
            match self.queue.delete_unsent(file).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    delete_failures += 1;
                    warn!(file = %file, error = %e, "Could not delete published record, it will be sent again");
                }
            }
        }

        if delete_failures > 0 {
            debug!(deleted, delete_failures, "Cleanup finished with leftovers");
        }

        CycleOutcome::Published {
            records,
            deleted,
            delete_failures,
        }
    }
}

//! # Config Reconciler
//!
//! Writes broker-pushed `parameters` back to the local store.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │            push == target                                               │
//! │           ┌────────────┐                                                │
//! │           │  (no-op)   │                                                │
//! │           ▼            │                                                │
//! │      ┌─────────┐  push != target  ┌──────────────────────┐             │
//! │      │  Idle   │ ────────────────►│ write_config(target) │             │
//! │      └─────────┘                  └──────────┬───────────┘             │
//! │           ▲                          ok      │      err                 │
//! │           └──────────────────────────────────┤                          │
//! │                                              ▼                          │
//! │                                  ┌────────────────────────┐             │
//! │   newer push: cancel retry, ────►│ WritePending { target, │             │
//! │   write immediately              │   generation, retry }  │             │
//! │                                  └───────────┬────────────┘             │
//! │                                              │ 60s later: retry_rx      │
//! │                                              ▼                          │
//! │                                  generation current? write again        │
//! │                                  otherwise drop as stale                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only `parameters` ever changes. The broker section is carried over from
//! the config fetched at startup.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sense_core::{LocalConfig, Parameters};
use sense_local::LocalQueue;

/// Delay before a failed write-back is attempted again.
pub const WRITE_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// What a reconciler call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The value already matches what is stored or pending.
    Unchanged,
    /// The local store now holds the value.
    Written,
    /// The write failed; a retry fires after [`WRITE_RETRY_INTERVAL`].
    RetryScheduled,
    /// A retry signal for a write that has since been superseded.
    Stale,
}

enum WriteState {
    Idle,
    WritePending {
        target: Parameters,
        generation: u64,
        retry: CancellationToken,
    },
}

pub struct ConfigReconciler {
    queue: Arc<dyn LocalQueue>,
    current: LocalConfig,
    state: WriteState,
    last_generation: u64,
    retry_tx: mpsc::UnboundedSender<u64>,
}

impl ConfigReconciler {
    /// Returns the reconciler and the receiver its retry timers signal on.
    /// Feed each received generation to [`on_retry_due`](Self::on_retry_due).
    pub fn new(
        queue: Arc<dyn LocalQueue>,
        current: LocalConfig,
    ) -> (Self, mpsc::UnboundedReceiver<u64>) {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let reconciler = ConfigReconciler {
            queue,
            current,
            state: WriteState::Idle,
            last_generation: 0,
            retry_tx,
        };
        (reconciler, retry_rx)
    }

    /// Config as last confirmed by the local store.
    pub fn current(&self) -> &LocalConfig {
        &self.current
    }

    /// Parameters waiting for a retry, if any.
    pub fn pending(&self) -> Option<&Parameters> {
        match &self.state {
            WriteState::Idle => None,
            WriteState::WritePending { target, .. } => Some(target),
        }
    }

    fn target(&self) -> &Parameters {
        self.pending().unwrap_or(&self.current.parameters)
    }

    /// Handles a pushed `parameters` value.
    pub async fn submit(&mut self, parameters: Parameters) -> ReconcileOutcome {
        if &parameters == self.target() {
            debug!("Pushed parameters match local config, nothing to write");
            return ReconcileOutcome::Unchanged;
        }

        self.cancel_retry();
        self.attempt(parameters).await
    }

    /// Handles a retry timer firing.
    pub async fn on_retry_due(&mut self, generation: u64) -> ReconcileOutcome {
        let due = match &self.state {
            WriteState::WritePending {
                target,
                generation: pending,
                ..
            } if *pending == generation => Some(target.clone()),
            _ => None,
        };

        match due {
            Some(target) => {
                debug!(generation, "Retrying config write");
                self.attempt(target).await
            }
            None => {
                debug!(generation, "Ignoring superseded config retry");
                ReconcileOutcome::Stale
            }
        }
    }

    /// Cancels the scheduled retry. The pending value is kept.
    pub fn cancel_retry(&mut self) {
        if let WriteState::WritePending { retry, .. } = &self.state {
            retry.cancel();
        }
    }

    async fn attempt(&mut self, target: Parameters) -> ReconcileOutcome {
        let desired = self.current.with_parameters(target.clone());

        match self.queue.write_config(&desired).await {
            Ok(()) => {
                info!(parameters = target.len(), "Local config updated from broker push");
                self.current = desired;
                self.state = WriteState::Idle;
                ReconcileOutcome::Written
            }
            Err(e) => {
                self.last_generation += 1;
                let generation = self.last_generation;
                let retry = CancellationToken::new();
                schedule_retry(self.retry_tx.clone(), generation, retry.clone());

                warn!(
                    error = %e,
                    generation,
                    retry_in_secs = WRITE_RETRY_INTERVAL.as_secs(),
                    "Config write failed, retry scheduled"
                );
                self.state = WriteState::WritePending {
                    target,
                    generation,
                    retry,
                };
                ReconcileOutcome::RetryScheduled
            }
        }
    }
}

fn schedule_retry(tx: mpsc::UnboundedSender<u64>, generation: u64, cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(WRITE_RETRY_INTERVAL) => {
                let _ = tx.send(generation);
            }
        }
    });
}

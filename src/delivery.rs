//! Deferred delivery: a ledger-driven worker publishes completed tasks'
//! replies and tracks per-task delivery state with retry backoff.

use crate::bus::{DeliveryReporter, MessageBus, SendError, SendErrorKind};
use crate::error::Result;
use crate::ledger::{Ledger, TaskRow};
use crate::settings::SettingsStore;
use crate::OutboundMessage;
use async_trait::async_trait;
use rand::Rng as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Poll cadence when nothing nudges the worker.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Batch size per poll.
const BATCH_LIMIT: i64 = 20;

/// Base retry backoff; doubles per attempt up to the cap, with jitter.
const BASE_BACKOFF_SECS: u64 = 5;
const MAX_BACKOFF_SECS: u64 = 300;

/// Compute the next-attempt delay for a retry.
fn backoff_secs(attempts: i64) -> u64 {
    let exp = attempts.clamp(0, 10) as u32;
    let base = BASE_BACKOFF_SECS.saturating_mul(2u64.saturating_pow(exp)).min(MAX_BACKOFF_SECS);
    let jitter = rand::rng().random_range(0..=base / 2);
    base + jitter
}

/// Applies channel send outcomes to task delivery state.
pub struct LedgerDeliveryReporter {
    ledger: Arc<Ledger>,
}

impl LedgerDeliveryReporter {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl DeliveryReporter for LedgerDeliveryReporter {
    async fn report(&self, task_id: &str, outcome: std::result::Result<(), SendError>) {
        let result = match outcome {
            Ok(()) => self.ledger.mark_delivery_sent(task_id).await,
            Err(error) => match error.kind {
                SendErrorKind::Transient => {
                    let attempts = match self.ledger.get_task(task_id).await {
                        Ok(task) => task.delivery_attempts,
                        Err(_) => 0,
                    };
                    let next_at = chrono::Utc::now().timestamp() + backoff_secs(attempts) as i64;
                    tracing::info!(
                        task_id,
                        attempts,
                        message = %error.message,
                        "transient send failure, deferring delivery"
                    );
                    self.ledger.defer_delivery(task_id, next_at).await
                }
                SendErrorKind::Permanent => {
                    tracing::warn!(task_id, message = %error.message, "permanent send failure");
                    self.ledger.mark_delivery_failed(task_id).await
                }
            },
        };
        if let Err(error) = result {
            tracing::error!(%error, task_id, "failed to update delivery state");
        }
    }
}

/// Polls for due deliveries and publishes them through the bus.
pub struct DeliveryWorker {
    ledger: Arc<Ledger>,
    bus: Arc<MessageBus>,
    settings: Arc<SettingsStore>,
    nudge: Arc<Notify>,
}

impl DeliveryWorker {
    pub fn new(
        ledger: Arc<Ledger>,
        bus: Arc<MessageBus>,
        settings: Arc<SettingsStore>,
        nudge: Arc<Notify>,
    ) -> Self {
        Self { ledger, bus, settings, nudge }
    }

    /// Run until cancelled. Wakes on the nudge or every poll interval.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("delivery worker started");
        loop {
            if let Err(error) = self.drain_due().await {
                tracing::warn!(%error, "delivery pass failed");
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.nudge.notified() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
        tracing::info!("delivery worker stopped");
    }

    /// One delivery pass over the due set.
    pub async fn drain_due(&self) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let due = self.ledger.due_deliverable_tasks(now, BATCH_LIMIT).await?;
        if due.is_empty() {
            return Ok(());
        }

        let silent = self.settings.get().silent_mode;
        for task in due {
            if silent {
                tracing::debug!(task_id = %task.task_id, "silent mode, skipping delivery");
                self.ledger.skip_delivery(&task.task_id).await?;
                continue;
            }
            self.bus.publish_outbound(outbound_for(&task)).await?;
        }
        Ok(())
    }
}

/// Build the outbound reply for a completed task.
fn outbound_for(task: &TaskRow) -> OutboundMessage {
    OutboundMessage {
        channel: task.channel.clone(),
        chat_id: task.chat_id.clone(),
        thread_id: task.thread_id.clone(),
        trace_id: task.trace_id.clone(),
        task_id: Some(task.task_id.clone()),
        content: task.content_out.clone().unwrap_or_default(),
        media: Vec::new(),
        card: None,
    }
}

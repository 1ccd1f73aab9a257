//! Observation pipeline: raw observations queue up and are periodically
//! compressed into a small prioritized set the context builder can use.

use crate::config::ObserverConfig;
use crate::error::Result;
use crate::ledger::Ledger;
use anyhow::Context as _;
use sqlx::Row as _;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// In-memory queue bound; enqueue drops when full.
const QUEUE_CAPACITY: usize = 100;

/// A compressed observation carried into future prompts.
#[derive(Debug, Clone)]
pub struct Observation {
    pub id: String,
    pub content: String,
    pub priority: i64,
    pub created_at: String,
}

/// Non-blocking handle for recording raw observations.
#[derive(Clone)]
pub struct ObservationRecorder {
    tx: mpsc::Sender<RawObservation>,
}

#[derive(Debug, Clone)]
pub struct RawObservation {
    pub channel: String,
    pub content: String,
}

impl ObservationRecorder {
    pub fn try_record(&self, observation: RawObservation) {
        if self.tx.try_send(observation).is_err() {
            tracing::debug!("observation queue full, dropping");
        }
    }
}

/// Owns the raw queue table and the compression pass.
pub struct Observer {
    ledger: Arc<Ledger>,
    config: ObserverConfig,
}

impl Observer {
    pub fn new(ledger: Arc<Ledger>, config: ObserverConfig) -> Self {
        Self { ledger, config }
    }

    /// Build the recorder handle and the worker future. The worker drains
    /// the in-memory queue into the ledger and compresses when the threshold
    /// is reached.
    pub fn start(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> (ObservationRecorder, impl std::future::Future<Output = ()>) {
        let (tx, mut rx) = mpsc::channel::<RawObservation>(QUEUE_CAPACITY);
        let worker = async move {
            if !self.config.enabled {
                tracing::debug!("observer disabled");
                return;
            }
            tracing::info!("observer started");
            loop {
                let raw = tokio::select! {
                    _ = cancel.cancelled() => break,
                    raw = rx.recv() => match raw {
                        Some(raw) => raw,
                        None => break,
                    },
                };
                if let Err(error) = self.enqueue(&raw).await {
                    tracing::warn!(%error, "failed to enqueue observation");
                    continue;
                }
                match self.queued_count().await {
                    Ok(count) if count >= self.config.message_threshold as i64 => {
                        if let Err(error) = self.compress().await {
                            tracing::warn!(%error, "observation compression failed");
                        }
                    }
                    Ok(_) => {}
                    Err(error) => tracing::warn!(%error, "failed to count observations"),
                }
            }
            tracing::info!("observer stopped");
        };
        (ObservationRecorder { tx }, worker)
    }

    async fn enqueue(&self, raw: &RawObservation) -> Result<()> {
        sqlx::query(
            "INSERT INTO observations_queue (content, channel, created_at) VALUES (?, ?, ?)",
        )
        .bind(&raw.content)
        .bind(&raw.channel)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(self.ledger.pool())
        .await
        .with_context(|| "failed to insert queued observation")?;
        Ok(())
    }

    async fn queued_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM observations_queue")
            .fetch_one(self.ledger.pool())
            .await
            .with_context(|| "failed to count queued observations")?;
        Ok(row.get::<i64, _>("n"))
    }

    /// Fold the queued raw observations into one compressed entry, drain the
    /// queue, and trim the retained set to the configured cap.
    pub async fn compress(&self) -> Result<()> {
        let rows = sqlx::query(
            "SELECT id, content, channel FROM observations_queue ORDER BY id",
        )
        .fetch_all(self.ledger.pool())
        .await
        .with_context(|| "failed to load queued observations")?;

        if rows.is_empty() {
            return Ok(());
        }

        let count = rows.len();
        let mut lines = Vec::with_capacity(count);
        let mut last_id = 0i64;
        for row in rows {
            last_id = row.get("id");
            let channel: Option<String> = row.get("channel");
            lines.push(format!(
                "[{}] {}",
                channel.unwrap_or_else(|| "unknown".into()),
                row.get::<String, _>("content"),
            ));
        }
        let compressed = lines.join("\n");
        // More activity folded in means higher priority in the prompt.
        let priority = count as i64;

        sqlx::query(
            "INSERT INTO observations (id, content, priority, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&compressed)
        .bind(priority)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(self.ledger.pool())
        .await
        .with_context(|| "failed to insert compressed observation")?;

        sqlx::query("DELETE FROM observations_queue WHERE id <= ?")
            .bind(last_id)
            .execute(self.ledger.pool())
            .await
            .with_context(|| "failed to drain observation queue")?;

        sqlx::query(
            "DELETE FROM observations WHERE id NOT IN \
             (SELECT id FROM observations ORDER BY priority DESC, created_at DESC LIMIT ?)",
        )
        .bind(self.config.max_observations as i64)
        .execute(self.ledger.pool())
        .await
        .with_context(|| "failed to trim observations")?;

        tracing::debug!(folded = count, "observations compressed");
        Ok(())
    }

    /// Retained observations, highest priority first, newest breaking ties.
    pub async fn observations(&self) -> Result<Vec<Observation>> {
        let rows = sqlx::query(
            "SELECT id, content, priority, created_at FROM observations \
             ORDER BY priority DESC, created_at DESC",
        )
        .fetch_all(self.ledger.pool())
        .await
        .with_context(|| "failed to load observations")?;

        Ok(rows
            .into_iter()
            .map(|row| Observation {
                id: row.get("id"),
                content: row.get("content"),
                priority: row.get("priority"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: usize) -> ObserverConfig {
        ObserverConfig { enabled: true, message_threshold: threshold, max_observations: 3 }
    }

    #[tokio::test]
    async fn compression_folds_queue_and_trims_retained() {
        let ledger = Arc::new(Ledger::open_in_memory().await.expect("ledger"));
        let observer = Observer::new(ledger.clone(), config(2));

        for i in 0..4 {
            observer
                .enqueue(&RawObservation { channel: "console".into(), content: format!("saw {i}") })
                .await
                .expect("enqueue");
        }
        observer.compress().await.expect("compress");

        assert_eq!(observer.queued_count().await.expect("count"), 0);
        let observations = observer.observations().await.expect("list");
        assert_eq!(observations.len(), 1);
        assert!(observations[0].content.contains("saw 0"));
        assert!(observations[0].content.contains("saw 3"));
        assert_eq!(observations[0].priority, 4);
    }

    #[tokio::test]
    async fn worker_compresses_at_threshold() {
        let ledger = Arc::new(Ledger::open_in_memory().await.expect("ledger"));
        let observer = Arc::new(Observer::new(ledger.clone(), config(2)));
        let cancel = CancellationToken::new();
        let (recorder, worker) = observer.clone().start(cancel.clone());
        let handle = tokio::spawn(worker);

        recorder.try_record(RawObservation { channel: "console".into(), content: "one".into() });
        recorder.try_record(RawObservation { channel: "console".into(), content: "two".into() });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.expect("join");

        let observations = observer.observations().await.expect("list");
        assert_eq!(observations.len(), 1);
    }
}

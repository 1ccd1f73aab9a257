//! Semantic memory: chunk storage with embeddings, vector recall, and a
//! bounded background indexing queue.
//!
//! The embedding back-end is a capability seam; the shipped implementation
//! calls an OpenAI-compatible `/embeddings` endpoint.

use crate::error::{LlmError, Result};
use crate::ledger::Ledger;
use anyhow::Context as _;
use async_trait::async_trait;
use sqlx::Row as _;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bounded indexing queue size. Enqueue is non-blocking and drops when full.
pub const INDEX_QUEUE_CAPACITY: usize = 100;

/// Vector embedding back-end.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// OpenAI-compatible `/embeddings` client.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpEmbedder {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self { client, base_url: base_url.into(), api_key: api_key.into(), model: model.into() }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&serde_json::json!({
            "model": self.model,
            "input": text,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| LlmError::EmbeddingFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(LlmError::EmbeddingFailed(format!(
                "embedding endpoint returned {}",
                response.status()
            ))
            .into());
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::EmbeddingFailed(e.to_string()))?;
        let vector = body["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| LlmError::EmbeddingFailed("missing embedding in response".into()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        Ok(vector)
    }
}

/// A recalled memory chunk with its similarity score.
#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub id: String,
    pub content: String,
    pub source: String,
    pub score: f32,
}

/// Semantic memory over the ledger's chunk table.
pub struct MemoryService {
    ledger: Arc<Ledger>,
    embedder: Arc<dyn Embedder>,
}

impl MemoryService {
    pub fn new(ledger: Arc<Ledger>, embedder: Arc<dyn Embedder>) -> Self {
        Self { ledger, embedder }
    }

    /// Store a chunk under a source-prefixed tag (e.g. `chat:console`,
    /// `group:<author>:<item>`). Returns the chunk id.
    pub async fn remember(&self, source: &str, content: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let embedding = self.embedder.embed(content).await?;

        sqlx::query(
            "INSERT INTO memory_chunks (id, content, embedding, source, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(content)
        .bind(embedding_to_blob(&embedding))
        .bind(source)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(self.ledger.pool())
        .await
        .with_context(|| "failed to store memory chunk")?;

        tracing::debug!(chunk_id = %id, source, "memory chunk stored");
        Ok(id)
    }

    /// Top-k recall by cosine similarity against the query embedding.
    pub async fn recall(&self, query: &str, k: usize) -> Result<Vec<MemoryHit>> {
        let query_embedding = self.embedder.embed(query).await?;

        let rows = sqlx::query("SELECT id, content, embedding, source FROM memory_chunks")
            .fetch_all(self.ledger.pool())
            .await
            .with_context(|| "failed to load memory chunks")?;

        let mut hits: Vec<MemoryHit> = rows
            .into_iter()
            .filter_map(|row| {
                let blob: Option<Vec<u8>> = row.get("embedding");
                let embedding = blob_to_embedding(&blob?);
                let score = cosine_similarity(&query_embedding, &embedding)?;
                Some(MemoryHit {
                    id: row.get("id"),
                    content: row.get("content"),
                    source: row.get("source"),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a * norm_b))
}

/// A queued indexing job.
#[derive(Debug, Clone)]
pub struct IndexJob {
    pub source: String,
    pub content: String,
}

/// Handle for enqueueing indexing work. Non-blocking; jobs are dropped (with
/// a debug log) when the queue is full.
#[derive(Clone)]
pub struct MemoryIndexer {
    tx: mpsc::Sender<IndexJob>,
}

impl MemoryIndexer {
    /// Create the indexer and its worker future. The caller spawns the
    /// worker.
    pub fn new(
        service: Arc<MemoryService>,
        cancel: CancellationToken,
    ) -> (Self, impl std::future::Future<Output = ()>) {
        let (tx, mut rx) = mpsc::channel::<IndexJob>(INDEX_QUEUE_CAPACITY);
        let worker = async move {
            tracing::info!("memory indexer started");
            loop {
                let job = tokio::select! {
                    _ = cancel.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                if let Err(error) = service.remember(&job.source, &job.content).await {
                    tracing::warn!(%error, source = %job.source, "memory indexing failed");
                }
            }
            tracing::info!("memory indexer stopped");
        };
        (Self { tx }, worker)
    }

    /// Try to enqueue; drops the job when the queue is full.
    pub fn try_enqueue(&self, job: IndexJob) {
        if let Err(mpsc::error::TrySendError::Full(job)) = self.tx.try_send(job) {
            tracing::debug!(source = %job.source, "index queue full, dropping job");
        }
    }
}

#[cfg(test)]
pub(crate) struct StubEmbedder;

#[cfg(test)]
#[async_trait]
impl Embedder for StubEmbedder {
    /// Deterministic toy embedding: letter histogram, good enough to make
    /// similar strings land near each other in tests.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; 26];
        for c in text.to_ascii_lowercase().bytes() {
            if c.is_ascii_lowercase() {
                v[(c - b'a') as usize] += 1.0;
            }
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> Arc<MemoryService> {
        let ledger = Arc::new(Ledger::open_in_memory().await.expect("ledger"));
        Arc::new(MemoryService::new(ledger, Arc::new(StubEmbedder)))
    }

    #[tokio::test]
    async fn remember_then_recall_ranks_by_similarity() {
        let service = service().await;
        service.remember("chat:console", "the cat sat on the mat").await.expect("remember");
        service.remember("chat:console", "rust borrow checker rules").await.expect("remember");

        let hits = service.recall("cat mat", 1).await.expect("recall");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("cat"));
    }

    #[tokio::test]
    async fn recall_respects_k() {
        let service = service().await;
        for i in 0..5 {
            service.remember("chat:console", &format!("note number {i}")).await.expect("remember");
        }
        let hits = service.recall("note", 3).await.expect("recall");
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn indexer_worker_persists_jobs() {
        let service = service().await;
        let cancel = CancellationToken::new();
        let (indexer, worker) = MemoryIndexer::new(service.clone(), cancel.clone());
        let handle = tokio::spawn(worker);

        indexer.try_enqueue(IndexJob { source: "chat:test".into(), content: "queued fact".into() });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.expect("join");

        let hits = service.recall("queued fact", 5).await.expect("recall");
        assert!(hits.iter().any(|h| h.content == "queued fact"));
    }

    #[test]
    fn embedding_blob_round_trips() {
        let embedding = vec![0.25f32, -1.5, 3.0];
        let blob = embedding_to_blob(&embedding);
        assert_eq!(blob_to_embedding(&blob), embedding);
    }
}

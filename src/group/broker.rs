//! Broker bridge client and the large-artifact endpoint.
//!
//! The peer broker is an external collaborator reached through an HTTP
//! bridge: publishes POST to a topic, consumption long-polls a consumer
//! group. The trait is the seam; any topic-based transport can stand in.

use crate::error::{GroupError, Result};
use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// One consumed record.
#[derive(Debug, Clone)]
pub struct BrokerRecord {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Topic-based broker transport.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Replace the consumer subscription set.
    async fn subscribe(&self, topics: &[String]) -> Result<()>;

    /// Publish one payload to a topic.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Fetch the next batch of records; may return empty on poll timeout.
    async fn poll(&self) -> Result<Vec<BrokerRecord>>;
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    topic: String,
    /// Base64-encoded message value.
    value: String,
}

/// HTTP bridge implementation with endpoint failover.
pub struct HttpBrokerClient {
    client: reqwest::Client,
    endpoints: Vec<String>,
    user: Option<String>,
    password: Option<String>,
    consumer_group: String,
    subscriptions: RwLock<Vec<String>>,
    cursor: AtomicUsize,
}

impl HttpBrokerClient {
    pub fn new(
        client: reqwest::Client,
        endpoints: Vec<String>,
        user: Option<String>,
        password: Option<String>,
        consumer_group: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoints,
            user,
            password,
            consumer_group: consumer_group.into(),
            subscriptions: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    fn endpoint(&self) -> Result<&str> {
        if self.endpoints.is_empty() {
            return Err(GroupError::Broker("no broker endpoints configured".into()).into());
        }
        let index = self.cursor.load(Ordering::Relaxed) % self.endpoints.len();
        Ok(self.endpoints[index].trim_end_matches('/'))
    }

    fn rotate(&self) {
        self.cursor.fetch_add(1, Ordering::Relaxed);
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.user {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        }
    }
}

#[async_trait]
impl BrokerClient for HttpBrokerClient {
    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        *self.subscriptions.write().await = topics.to_vec();
        let endpoint = self.endpoint()?.to_string();
        let url = format!("{endpoint}/consumers/{}/subscription", self.consumer_group);
        let request = self
            .with_auth(self.client.post(&url))
            .json(&serde_json::json!({ "topics": topics }));
        let response = request
            .send()
            .await
            .map_err(|e| GroupError::Broker(format!("subscribe failed: {e}")))?;
        if !response.status().is_success() {
            return Err(GroupError::Broker(format!(
                "subscribe returned {}",
                response.status()
            ))
            .into());
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let endpoint = self.endpoint()?.to_string();
        let url = format!("{endpoint}/topics/{topic}/messages");
        let body = serde_json::json!({
            "value": base64::engine::general_purpose::STANDARD.encode(payload),
        });
        let request = self.with_auth(self.client.post(&url)).json(&body);
        match request.send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => {
                self.rotate();
                Err(GroupError::Broker(format!(
                    "publish to {topic} returned {}",
                    response.status()
                ))
                .into())
            }
            Err(e) => {
                self.rotate();
                Err(GroupError::Broker(format!("publish to {topic} failed: {e}")).into())
            }
        }
    }

    async fn poll(&self) -> Result<Vec<BrokerRecord>> {
        let topics = self.subscriptions.read().await.join(",");
        if topics.is_empty() {
            return Ok(Vec::new());
        }
        let endpoint = self.endpoint()?.to_string();
        let url = format!(
            "{endpoint}/consumers/{}/records?topics={topics}&max_wait_ms=1000",
            self.consumer_group
        );
        let request = self.with_auth(self.client.get(&url));
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.rotate();
                return Err(GroupError::Broker(format!("poll failed: {e}")).into());
            }
        };
        if !response.status().is_success() {
            self.rotate();
            return Err(GroupError::Broker(format!("poll returned {}", response.status())).into());
        }

        let records: Vec<WireRecord> = response
            .json()
            .await
            .map_err(|e| GroupError::Broker(format!("poll body malformed: {e}")))?;

        Ok(records
            .into_iter()
            .filter_map(|record| {
                match base64::engine::general_purpose::STANDARD.decode(&record.value) {
                    Ok(payload) => Some(BrokerRecord { topic: record.topic, payload }),
                    Err(error) => {
                        tracing::warn!(%error, topic = %record.topic, "dropping undecodable record");
                        None
                    }
                }
            })
            .collect())
    }
}

/// Content reference returned by the large-artifact endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactPointer {
    pub kfs_lfs: bool,
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub sha256: String,
    pub checksum: String,
    pub checksum_alg: String,
    pub content_type: String,
    pub created_at: String,
    pub proxy_id: String,
}

/// Client for the broker's large-artifact upload endpoint, used when a
/// payload exceeds topic limits.
pub struct LargeArtifactClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl LargeArtifactClient {
    pub fn new(client: reqwest::Client, url: impl Into<String>, api_key: Option<String>) -> Self {
        Self { client, url: url.into(), api_key }
    }

    /// Upload content and return the pointer. The response digest is checked
    /// against a locally computed one; a mismatch is logged but the pointer
    /// is still returned since the broker is authoritative.
    pub async fn upload(
        &self,
        topic: &str,
        request_id: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<ArtifactPointer> {
        let local_sha256 = hex::encode(Sha256::digest(&bytes));

        let mut request = self
            .client
            .post(&self.url)
            .header("X-Kafka-Topic", topic)
            .header("X-Request-ID", request_id)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GroupError::Broker(format!("artifact upload failed: {e}")))?;
        if !response.status().is_success() {
            return Err(GroupError::Broker(format!(
                "artifact upload returned {}",
                response.status()
            ))
            .into());
        }

        let pointer: ArtifactPointer = response
            .json()
            .await
            .map_err(|e| GroupError::Broker(format!("artifact pointer malformed: {e}")))?;

        if pointer.sha256 != local_sha256 {
            tracing::warn!(
                expected = %local_sha256,
                received = %pointer.sha256,
                "artifact digest mismatch"
            );
        }
        Ok(pointer)
    }
}

/// In-memory loopback broker for tests: published records come back on poll.
#[cfg(test)]
pub struct LoopbackBroker {
    queue: tokio::sync::Mutex<std::collections::VecDeque<BrokerRecord>>,
    pub subscribed: RwLock<Vec<String>>,
}

#[cfg(test)]
impl LoopbackBroker {
    pub fn new() -> Self {
        Self {
            queue: tokio::sync::Mutex::new(std::collections::VecDeque::new()),
            subscribed: RwLock::new(Vec::new()),
        }
    }

    pub async fn inject(&self, topic: &str, payload: Vec<u8>) {
        self.queue
            .lock()
            .await
            .push_back(BrokerRecord { topic: topic.to_string(), payload });
    }
}

#[cfg(test)]
#[async_trait]
impl BrokerClient for LoopbackBroker {
    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        *self.subscribed.write().await = topics.to_vec();
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.inject(topic, payload.to_vec()).await;
        Ok(())
    }

    async fn poll(&self) -> Result<Vec<BrokerRecord>> {
        let mut queue = self.queue.lock().await;
        Ok(queue.drain(..).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_pointer_deserializes_full_shape() {
        let raw = serde_json::json!({
            "kfs_lfs": true,
            "bucket": "artifacts",
            "key": "group/home/abc",
            "size": 2048,
            "sha256": "deadbeef",
            "checksum": "deadbeef",
            "checksum_alg": "sha256",
            "content_type": "application/json",
            "created_at": "2026-01-01T00:00:00Z",
            "proxy_id": "proxy-1"
        });
        let pointer: ArtifactPointer = serde_json::from_value(raw).expect("parse");
        assert_eq!(pointer.bucket, "artifacts");
        assert!(pointer.kfs_lfs);
    }

    #[tokio::test]
    async fn loopback_round_trips() {
        let broker = LoopbackBroker::new();
        broker.publish("group.g.announce", b"hello").await.expect("publish");
        let records = broker.poll().await.expect("poll");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].topic, "group.g.announce");
        assert_eq!(records[0].payload, b"hello");
    }
}

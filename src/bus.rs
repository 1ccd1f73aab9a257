//! In-process message bus decoupling channels from the agent loop.
//!
//! Buffered, typed publish/subscribe: channels publish inbound messages, the
//! agent loop is the single inbound consumer, and outbound messages fan out
//! to the one subscriber whose name matches the message's channel. The bus
//! holds no durable state.

use crate::error::Result;
use crate::{InboundMessage, MessageType, OutboundMessage, META_MESSAGE_TYPE};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;

/// Default buffer capacity for the inbound and outbound queues.
pub const DEFAULT_CAPACITY: usize = 100;

/// How a channel send failed, for delivery retry classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    /// Network trouble or a 5xx; worth retrying with backoff.
    Transient,
    /// Auth or request-shape problems; retrying cannot help.
    Permanent,
}

/// A failed channel send.
#[derive(Debug, Clone)]
pub struct SendError {
    pub kind: SendErrorKind,
    pub message: String,
}

impl SendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self { kind: SendErrorKind::Transient, message: message.into() }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self { kind: SendErrorKind::Permanent, message: message.into() }
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// A channel transport's outbound handler. Invoked exactly once per outbound
/// message whose `channel` field matches the subscription name.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn deliver(&self, message: &OutboundMessage) -> std::result::Result<(), SendError>;
}

/// Observer for per-task delivery outcomes. The delivery module implements
/// this over the ledger; the bus itself stays stateless.
#[async_trait]
pub trait DeliveryReporter: Send + Sync {
    async fn report(
        &self,
        task_id: &str,
        outcome: std::result::Result<(), SendError>,
    );
}

/// Buffered in-process pub/sub for inbound and outbound messages.
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Mutex<Option<mpsc::Receiver<OutboundMessage>>>,
    subscribers: RwLock<HashMap<String, Arc<dyn ChannelSink>>>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Classify a message from its metadata. `internal` only when explicitly
    /// tagged; anything else (including garbage) is external.
    pub fn message_type(metadata: &HashMap<String, serde_json::Value>) -> MessageType {
        metadata
            .get(META_MESSAGE_TYPE)
            .and_then(|v| v.as_str())
            .and_then(MessageType::parse)
            .unwrap_or(MessageType::External)
    }

    /// Publish an inbound message. Blocks (back-pressure) when the buffer is
    /// full.
    pub async fn publish_inbound(&self, message: InboundMessage) -> Result<()> {
        self.inbound_tx
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("inbound bus closed"))?;
        Ok(())
    }

    /// Receive the next inbound message. Single-consumer semantics: callers
    /// serialize on an internal lock. Returns None when cancelled or closed.
    pub async fn consume_inbound(&self, cancel: &CancellationToken) -> Option<InboundMessage> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => None,
            message = rx.recv() => message,
        }
    }

    /// Publish an outbound message. Blocks when the buffer is full.
    pub async fn publish_outbound(&self, message: OutboundMessage) -> Result<()> {
        self.outbound_tx
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("outbound bus closed"))?;
        Ok(())
    }

    /// Register the handler for a channel name, replacing any previous one.
    pub async fn subscribe(&self, channel: impl Into<String>, sink: Arc<dyn ChannelSink>) {
        self.subscribers.write().await.insert(channel.into(), sink);
    }

    /// Run the outbound dispatcher until cancelled. Fans out each outbound to
    /// the subscriber whose name matches, in FIFO order per channel, and
    /// reports per-task outcomes through `reporter`.
    ///
    /// Only one dispatcher may run per bus.
    pub async fn dispatch_outbound(
        &self,
        cancel: CancellationToken,
        reporter: Arc<dyn DeliveryReporter>,
    ) {
        let mut rx = match self.outbound_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                tracing::error!("outbound dispatcher already running");
                return;
            }
        };

        tracing::info!("outbound dispatcher started");
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let sink = self.subscribers.read().await.get(&message.channel).cloned();
            let outcome = match sink {
                Some(sink) => sink.deliver(&message).await,
                None => {
                    tracing::warn!(channel = %message.channel, "no subscriber for outbound channel");
                    Err(SendError::permanent(format!(
                        "no subscriber for channel {}",
                        message.channel
                    )))
                }
            };

            if let Err(error) = &outcome {
                tracing::warn!(
                    channel = %message.channel,
                    %error,
                    "outbound delivery failed"
                );
            }
            if let Some(task_id) = &message.task_id {
                reporter.report(task_id, outcome).await;
            }
        }
        tracing::info!("outbound dispatcher stopped");
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

//! Skiff: a personal AI-assistant runtime that turns messages from
//! heterogeneous channels into LLM-driven, tool-using conversations.

pub mod agent;
pub mod approval;
pub mod bus;
pub mod config;
pub mod console;
pub mod context;
pub mod delivery;
pub mod error;
pub mod group;
pub mod ledger;
pub mod llm;
pub mod memory;
pub mod observer;
pub mod policy;
pub mod settings;
pub mod subagents;
pub mod tools;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata key carrying the message classification.
pub const META_MESSAGE_TYPE: &str = "message_type";

/// Metadata key carrying the resolved session scope.
pub const META_SESSION_SCOPE: &str = "session_scope";

/// Classification of an inbound message relative to the local operator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Sent by the owner or generated inside the process.
    Internal,
    /// Anything else. Unknown classifications default here.
    External,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Internal => "internal",
            MessageType::External => "external",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "internal" => Some(MessageType::Internal),
            "external" => Some(MessageType::External),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// File attachment metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub url: String,
    pub size_bytes: Option<u64>,
}

/// Inbound message from any channel transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Channel name the message arrived on (e.g. "console", "group").
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub thread_id: Option<String>,
    /// Transport-assigned message identifier.
    pub message_id: String,
    /// Opaque identifier propagated through all spans of this message's
    /// processing.
    pub trace_id: String,
    /// Unique per channel+chat. None means the message is never deduplicated.
    pub idempotency_key: Option<String>,
    pub content: String,
    #[serde(default)]
    pub media: Vec<Attachment>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl InboundMessage {
    /// Build a message with fresh message/trace ids and empty metadata.
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            thread_id: None,
            message_id: uuid::Uuid::new_v4().to_string(),
            trace_id: uuid::Uuid::new_v4().to_string(),
            idempotency_key: None,
            content: content.into(),
            media: Vec::new(),
            metadata: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Read a string value out of metadata.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// A rich-formatted card a channel may render natively.
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Card {
    pub title: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub fields: Vec<CardField>,
    pub footer: Option<String>,
}

/// A field within a Card.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CardField {
    pub name: String,
    pub value: String,
}

/// Outbound response headed to a channel transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub thread_id: Option<String>,
    pub trace_id: String,
    /// Task this message answers. Delivery state is tracked on the task when
    /// present; control messages (approval prompts) leave it unset.
    pub task_id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub media: Vec<Attachment>,
    pub card: Option<Card>,
}

impl OutboundMessage {
    /// Plain text reply addressed at the same conversation as `inbound`.
    pub fn reply_to(inbound: &InboundMessage, content: impl Into<String>) -> Self {
        Self {
            channel: inbound.channel.clone(),
            chat_id: inbound.chat_id.clone(),
            thread_id: inbound.thread_id.clone(),
            trace_id: inbound.trace_id.clone(),
            task_id: None,
            content: content.into(),
            media: Vec::new(),
            card: None,
        }
    }
}

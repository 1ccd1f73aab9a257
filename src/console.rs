//! Console channel: a minimal transport that reads stdin lines and prints
//! replies. Mostly useful for local operation and as the reference channel
//! implementation.

use crate::bus::{ChannelSink, MessageBus, SendError};
use crate::error::Result;
use crate::InboundMessage;
use async_trait::async_trait;
use sha2::{Digest as _, Sha256};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Channel name on the bus.
pub const CHANNEL: &str = "console";

/// Prints outbound messages to stdout.
pub struct ConsoleSink;

#[async_trait]
impl ChannelSink for ConsoleSink {
    async fn deliver(&self, message: &crate::OutboundMessage) -> std::result::Result<(), SendError> {
        println!("{}", message.content);
        Ok(())
    }
}

/// Reads stdin lines and publishes them as inbound messages until EOF or
/// cancellation.
pub async fn run_stdin_loop(
    bus: Arc<MessageBus>,
    sender_id: String,
    cancel: CancellationToken,
) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let mut message = InboundMessage::new(CHANNEL, sender_id.clone(), "terminal", trimmed);
        // Same text in the same second dedups; distinct lines flow through.
        let fingerprint = format!("{}:{}", chrono::Utc::now().timestamp(), trimmed);
        message.idempotency_key = Some(hex::encode(&Sha256::digest(fingerprint.as_bytes())[..16]));
        bus.publish_inbound(message).await?;
    }
    Ok(())
}

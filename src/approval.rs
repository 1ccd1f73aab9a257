//! Interactive approval state machine for tool calls above the auto tier.
//!
//! A pending approval is resolved exactly once: by a user reply
//! (`approve:<id>` / `deny:<id>`), by timeout or cancellation, or by the
//! startup sweep. At most one waiter blocks per approval id.

use crate::bus::MessageBus;
use crate::error::Result;
use crate::ledger::{ApprovalRow, ApprovalStatus, Ledger};
use crate::OutboundMessage;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// Default wall-clock bound on one approval wait.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Terminal outcome observed by the waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Denied,
    Timeout,
}

/// Input for opening an approval.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub trace_id: String,
    pub task_id: String,
    pub tool: String,
    pub tier: u8,
    pub arguments: serde_json::Value,
    pub sender: String,
    pub channel: String,
    pub chat_id: String,
    pub thread_id: Option<String>,
}

/// Coordinates pending approvals between the agent loop and user replies.
pub struct ApprovalManager {
    ledger: Arc<Ledger>,
    bus: Arc<MessageBus>,
    waiters: Mutex<HashMap<String, Arc<Notify>>>,
    wait_timeout: Duration,
}

impl ApprovalManager {
    pub fn new(ledger: Arc<Ledger>, bus: Arc<MessageBus>) -> Self {
        Self {
            ledger,
            bus,
            waiters: Mutex::new(HashMap::new()),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// On startup, any row still pending belongs to a dead process and is
    /// transitioned to timeout.
    pub async fn startup_sweep(&self) -> Result<u64> {
        let swept = self.ledger.sweep_stale_approvals().await?;
        if swept > 0 {
            tracing::info!(count = swept, "timed out stale approvals from previous run");
        }
        Ok(swept)
    }

    /// Persist a new approval and broadcast a user-visible prompt containing
    /// the approval id and a tool+arguments summary. Returns the id.
    pub async fn create(&self, request: ApprovalRequest) -> Result<String> {
        let approval_id = uuid::Uuid::new_v4().simple().to_string();
        let row = ApprovalRow {
            approval_id: approval_id.clone(),
            trace_id: request.trace_id.clone(),
            task_id: request.task_id.clone(),
            tool: request.tool.clone(),
            tier: request.tier,
            arguments: request.arguments.clone(),
            sender: request.sender.clone(),
            channel: request.channel.clone(),
            status: ApprovalStatus::Pending,
            created_at: chrono::Utc::now().to_rfc3339(),
            responded_at: None,
        };
        self.ledger.insert_approval(&row).await?;

        self.waiters
            .lock()
            .await
            .insert(approval_id.clone(), Arc::new(Notify::new()));

        let arguments_summary = summarize_arguments(&request.arguments);
        let prompt = format!(
            "Tool `{}` (tier {}) needs approval.\n{}\nReply `approve:{}` or `deny:{}`.",
            request.tool, request.tier, arguments_summary, approval_id, approval_id,
        );
        let outbound = OutboundMessage {
            channel: request.channel,
            chat_id: request.chat_id,
            thread_id: request.thread_id,
            trace_id: request.trace_id,
            task_id: None,
            content: prompt,
            media: Vec::new(),
            card: None,
        };
        if let Err(error) = self.bus.publish_outbound(outbound).await {
            tracing::warn!(%error, %approval_id, "failed to publish approval prompt");
        }

        tracing::info!(%approval_id, tool = %row.tool, "approval requested");
        Ok(approval_id)
    }

    /// Atomically flip a pending approval and wake its waiter. Errors when
    /// the id is unknown or already terminal.
    pub async fn respond(&self, approval_id: &str, approve: bool) -> Result<()> {
        let status = if approve { ApprovalStatus::Approved } else { ApprovalStatus::Denied };
        self.ledger.resolve_approval(approval_id, status).await?;

        let notify = self.waiters.lock().await.get(approval_id).cloned();
        if let Some(notify) = notify {
            notify.notify_one();
        }

        tracing::info!(approval_id, status = %status, "approval resolved");
        Ok(())
    }

    /// Block until the approval reaches a terminal status, the context is
    /// cancelled, or the configured timeout elapses. Cancellation and timeout
    /// both resolve the row to `timeout`.
    pub async fn wait(&self, cancel: &CancellationToken, approval_id: &str) -> Result<ApprovalOutcome> {
        let notify = self
            .waiters
            .lock()
            .await
            .get(approval_id)
            .cloned()
            .unwrap_or_else(|| Arc::new(Notify::new()));

        let deadline = tokio::time::Instant::now() + self.wait_timeout;
        let outcome = loop {
            let row = self.ledger.get_approval(approval_id).await?;
            match row.status {
                ApprovalStatus::Approved => break ApprovalOutcome::Approved,
                ApprovalStatus::Denied => break ApprovalOutcome::Denied,
                ApprovalStatus::Timeout => break ApprovalOutcome::Timeout,
                ApprovalStatus::Pending => {}
            }

            tokio::select! {
                _ = notify.notified() => {}
                _ = cancel.cancelled() => {
                    // Resolve to timeout unless a racing respond() beat us.
                    let _ = self.ledger.resolve_approval(approval_id, ApprovalStatus::Timeout).await;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = self.ledger.resolve_approval(approval_id, ApprovalStatus::Timeout).await;
                }
            }
        };

        self.waiters.lock().await.remove(approval_id);
        Ok(outcome)
    }
}

fn summarize_arguments(arguments: &serde_json::Value) -> String {
    let rendered = match arguments {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    };
    if rendered.len() > 300 {
        format!("{}…", &rendered[..rendered.floor_char_boundary(300)])
    } else {
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            trace_id: "trace-1".into(),
            task_id: "task-1".into(),
            tool: "exec".into(),
            tier: 2,
            arguments: serde_json::json!({"command": "echo hi"}),
            sender: "alice".into(),
            channel: "console".into(),
            chat_id: "chat-1".into(),
            thread_id: None,
        }
    }

    async fn manager() -> (Arc<ApprovalManager>, Arc<Ledger>) {
        let ledger = Arc::new(Ledger::open_in_memory().await.expect("ledger"));
        let bus = Arc::new(MessageBus::new(10));
        let manager = Arc::new(ApprovalManager::new(ledger.clone(), bus));
        (manager, ledger)
    }

    #[tokio::test]
    async fn approve_unblocks_waiter() {
        let (manager, _ledger) = manager().await;
        let approval_id = manager.create(request()).await.expect("create");

        let waiter = {
            let manager = manager.clone();
            let approval_id = approval_id.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                manager.wait(&cancel, &approval_id).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.respond(&approval_id, true).await.expect("respond");

        let outcome = waiter.await.expect("join").expect("wait");
        assert_eq!(outcome, ApprovalOutcome::Approved);
    }

    #[tokio::test]
    async fn respond_on_terminal_id_fails() {
        let (manager, _ledger) = manager().await;
        let approval_id = manager.create(request()).await.expect("create");

        manager.respond(&approval_id, false).await.expect("first respond");
        let error = manager
            .respond(&approval_id, true)
            .await
            .expect_err("second respond must fail");
        assert!(error.to_string().contains("already denied"));
    }

    #[tokio::test]
    async fn cancellation_resolves_to_timeout() {
        let (manager, ledger) = manager().await;
        let approval_id = manager.create(request()).await.expect("create");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = manager.wait(&cancel, &approval_id).await.expect("wait");
        assert_eq!(outcome, ApprovalOutcome::Timeout);

        let row = ledger.get_approval(&approval_id).await.expect("get");
        assert_eq!(row.status, ApprovalStatus::Timeout);
    }

    #[tokio::test]
    async fn wait_timeout_resolves_to_timeout() {
        let ledger = Arc::new(Ledger::open_in_memory().await.expect("ledger"));
        let bus = Arc::new(MessageBus::new(10));
        let manager = ApprovalManager::new(ledger.clone(), bus)
            .with_wait_timeout(Duration::from_millis(30));

        let approval_id = manager.create(request()).await.expect("create");
        let cancel = CancellationToken::new();
        let outcome = manager.wait(&cancel, &approval_id).await.expect("wait");
        assert_eq!(outcome, ApprovalOutcome::Timeout);
    }
}

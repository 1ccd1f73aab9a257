//! Ledger core: schema, timeline, tasks, approvals, policy decisions.

use crate::error::{LedgerError, Result};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row as _, SqlitePool};
use std::path::Path;

/// Single embedded store owning all durable state.
#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

/// Task processing status. Transitions are monotonic:
/// pending -> processing -> (completed | failed).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Terminal statuses admit no further processing transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outbound delivery state for a completed task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    Skipped,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DeliveryStatus::Pending),
            "sent" => Some(DeliveryStatus::Sent),
            "failed" => Some(DeliveryStatus::Failed),
            "skipped" => Some(DeliveryStatus::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Interactive approval lifecycle. Exactly one terminal transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Timeout,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "denied" => Some(ApprovalStatus::Denied),
            "timeout" => Some(ApprovalStatus::Timeout),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A durable task row.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub task_id: String,
    pub idempotency_key: Option<String>,
    pub trace_id: String,
    pub channel: String,
    pub chat_id: String,
    pub thread_id: Option<String>,
    pub sender_id: String,
    pub message_type: String,
    pub status: TaskStatus,
    pub content_in: String,
    pub content_out: Option<String>,
    pub error: Option<String>,
    pub delivery_status: DeliveryStatus,
    pub delivery_attempts: i64,
    /// Unix seconds; delivery is due when unset or in the past.
    pub delivery_next_at: Option<i64>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub provider: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

/// Input for task creation.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub idempotency_key: Option<String>,
    pub trace_id: String,
    pub channel: String,
    pub chat_id: String,
    pub thread_id: Option<String>,
    pub sender_id: String,
    pub message_type: String,
    pub content_in: String,
}

/// A persisted approval request.
#[derive(Debug, Clone)]
pub struct ApprovalRow {
    pub approval_id: String,
    pub trace_id: String,
    pub task_id: String,
    pub tool: String,
    pub tier: u8,
    pub arguments: serde_json::Value,
    pub sender: String,
    pub channel: String,
    pub status: ApprovalStatus,
    pub created_at: String,
    pub responded_at: Option<String>,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl Ledger {
    /// Open (creating if missing) the ledger database at `path` and run
    /// migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| LedgerError::Open(e.to_string()))?;

        let ledger = Self { pool };
        ledger.migrate().await?;
        Ok(ledger)
    }

    /// In-memory ledger for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| LedgerError::Open(e.to_string()))?;

        let ledger = Self { pool };
        ledger.migrate().await?;
        Ok(ledger)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create missing tables and apply best-effort column upgrades.
    async fn migrate(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS timeline (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL,
                trace_id TEXT,
                task_id TEXT,
                kind TEXT NOT NULL,
                payload TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                idempotency_key TEXT,
                trace_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                thread_id TEXT,
                sender_id TEXT NOT NULL,
                message_type TEXT NOT NULL DEFAULT 'external',
                status TEXT NOT NULL DEFAULT 'pending',
                content_in TEXT NOT NULL,
                content_out TEXT,
                error TEXT,
                delivery_status TEXT NOT NULL DEFAULT 'pending',
                delivery_attempts INTEGER NOT NULL DEFAULT 0,
                delivery_next_at INTEGER,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                provider TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_idempotency
                ON tasks(channel, chat_id, idempotency_key)
                WHERE idempotency_key IS NOT NULL
            "#,
            "CREATE INDEX IF NOT EXISTS idx_tasks_delivery ON tasks(status, delivery_status)",
            r#"
            CREATE TABLE IF NOT EXISTS policy_decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trace_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                tool TEXT NOT NULL,
                tier INTEGER NOT NULL,
                sender TEXT NOT NULL,
                channel TEXT NOT NULL,
                message_type TEXT NOT NULL,
                allowed INTEGER NOT NULL,
                requires_approval INTEGER NOT NULL DEFAULT 0,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS approval_requests (
                approval_id TEXT PRIMARY KEY,
                trace_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                tool TEXT NOT NULL,
                tier INTEGER NOT NULL,
                arguments TEXT NOT NULL,
                sender TEXT NOT NULL,
                channel TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                responded_at TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_jobs (
                job_id TEXT PRIMARY KEY,
                schedule TEXT NOT NULL,
                payload TEXT,
                next_run_at INTEGER,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS memory_chunks (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                embedding BLOB,
                source TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS observations_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content TEXT NOT NULL,
                channel TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS observations (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS working_memory (
                resource_id TEXT NOT NULL,
                thread_id TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (resource_id, thread_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS orchestrator_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                correlation_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                payload TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS web_users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS web_links (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                url TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| LedgerError::Migration(e.to_string()))?;
        }

        self.migrate_group_tables().await?;
        self.upgrade_schema().await?;
        Ok(())
    }

    /// Best-effort upgrades for databases created by older builds.
    async fn upgrade_schema(&self) -> Result<()> {
        self.ensure_column("timeline", "trace_id", "TEXT").await?;
        self.ensure_column("tasks", "provider", "TEXT").await?;
        self.ensure_column("tasks", "delivery_next_at", "INTEGER").await?;

        // Legacy rows predate trace ids; synthesize one from the event id so
        // trace-graph queries keep working.
        sqlx::query("UPDATE timeline SET trace_id = event_id WHERE trace_id IS NULL")
            .execute(&self.pool)
            .await
            .map_err(|e| LedgerError::Migration(e.to_string()))?;
        Ok(())
    }

    pub(crate) async fn ensure_column(
        &self,
        table: &str,
        column: &str,
        ddl_type: &str,
    ) -> Result<()> {
        let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LedgerError::Migration(e.to_string()))?;

        let exists = rows.iter().any(|row| {
            row.try_get::<String, _>("name")
                .map(|name| name == column)
                .unwrap_or(false)
        });

        if !exists {
            sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {ddl_type}"))
                .execute(&self.pool)
                .await
                .map_err(|e| LedgerError::Migration(e.to_string()))?;
            tracing::info!(table, column, "added missing column");
        }
        Ok(())
    }

    // --- timeline ---

    /// Append a trace span to the timeline.
    pub async fn log_event(
        &self,
        trace_id: &str,
        task_id: Option<&str>,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO timeline (event_id, trace_id, task_id, kind, payload, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(trace_id)
        .bind(task_id)
        .bind(kind)
        .bind(payload.to_string())
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| "failed to append timeline event")?;
        Ok(())
    }

    // --- settings ---

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read setting {key}"))?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    /// Upsert a setting and record the change for the audit view.
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write setting {key}"))?;

        self.log_event(
            "settings",
            None,
            "mode_change",
            serde_json::json!({ "key": key, "value": value }),
        )
        .await
    }

    // --- tasks ---

    /// Look up a task by idempotency key. A nil key never matches.
    pub async fn find_task_by_idempotency(
        &self,
        channel: &str,
        chat_id: &str,
        key: Option<&str>,
    ) -> Result<Option<TaskRow>> {
        let Some(key) = key.filter(|k| !k.is_empty()) else {
            return Ok(None);
        };

        let row = sqlx::query(
            "SELECT * FROM tasks WHERE channel = ? AND chat_id = ? AND idempotency_key = ?",
        )
        .bind(channel)
        .bind(chat_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| "dedup lookup failed")?;

        row.map(task_from_row).transpose()
    }

    /// Insert a new task with status `pending`, delivery `pending`.
    pub async fn create_task(&self, input: NewTask) -> Result<TaskRow> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let now = now_rfc3339();

        sqlx::query(
            "INSERT INTO tasks (task_id, idempotency_key, trace_id, channel, chat_id, thread_id, \
             sender_id, message_type, status, content_in, delivery_status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, 'pending', ?, ?)",
        )
        .bind(&task_id)
        .bind(&input.idempotency_key)
        .bind(&input.trace_id)
        .bind(&input.channel)
        .bind(&input.chat_id)
        .bind(&input.thread_id)
        .bind(&input.sender_id)
        .bind(&input.message_type)
        .bind(&input.content_in)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .with_context(|| "failed to insert task")?;

        self.get_task(&task_id).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<TaskRow> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| "failed to fetch task")?
            .ok_or_else(|| LedgerError::NotFound(format!("task {task_id}")))?;
        task_from_row(row)
    }

    /// pending -> processing. Fails on any other current status.
    pub async fn mark_task_processing(&self, task_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'processing', updated_at = ? \
             WHERE task_id = ? AND status = 'pending'",
        )
        .bind(now_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .with_context(|| "failed to mark task processing")?;

        if result.rows_affected() == 0 {
            let current = self.get_task(task_id).await?;
            return Err(LedgerError::InvalidTransition {
                from: current.status.to_string(),
                to: "processing".into(),
            }
            .into());
        }
        Ok(())
    }

    /// processing -> completed, recording output and token usage.
    pub async fn complete_task(
        &self,
        task_id: &str,
        content_out: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        provider: Option<&str>,
    ) -> Result<()> {
        let now = now_rfc3339();
        let result = sqlx::query(
            "UPDATE tasks SET status = 'completed', content_out = ?, prompt_tokens = ?, \
             completion_tokens = ?, provider = ?, updated_at = ?, completed_at = ? \
             WHERE task_id = ? AND status = 'processing'",
        )
        .bind(content_out)
        .bind(prompt_tokens)
        .bind(completion_tokens)
        .bind(provider)
        .bind(&now)
        .bind(&now)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .with_context(|| "failed to complete task")?;

        if result.rows_affected() == 0 {
            let current = self.get_task(task_id).await?;
            return Err(LedgerError::InvalidTransition {
                from: current.status.to_string(),
                to: "completed".into(),
            }
            .into());
        }
        Ok(())
    }

    /// pending|processing -> failed. Delivery is skipped when the task never
    /// produced output.
    pub async fn fail_task(&self, task_id: &str, error: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE tasks SET status = 'failed', error = ?, updated_at = ?, completed_at = ?, \
             delivery_status = CASE WHEN content_out IS NULL THEN 'skipped' ELSE delivery_status END \
             WHERE task_id = ? AND status IN ('pending', 'processing')",
        )
        .bind(error)
        .bind(&now)
        .bind(&now)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .with_context(|| "failed to fail task")?;
        Ok(())
    }

    /// Completed tasks whose delivery is due.
    pub async fn due_deliverable_tasks(&self, now_unix: i64, limit: i64) -> Result<Vec<TaskRow>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE status = 'completed' AND delivery_status = 'pending' \
             AND (delivery_next_at IS NULL OR delivery_next_at <= ?) \
             ORDER BY created_at ASC LIMIT ?",
        )
        .bind(now_unix)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .with_context(|| "failed to list deliverable tasks")?;

        rows.into_iter().map(task_from_row).collect()
    }

    pub async fn mark_delivery_sent(&self, task_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET delivery_status = 'sent', delivery_attempts = delivery_attempts + 1, \
             updated_at = ? WHERE task_id = ?",
        )
        .bind(now_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .with_context(|| "failed to mark delivery sent")?;
        Ok(())
    }

    pub async fn mark_delivery_failed(&self, task_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET delivery_status = 'failed', delivery_attempts = delivery_attempts + 1, \
             updated_at = ? WHERE task_id = ?",
        )
        .bind(now_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .with_context(|| "failed to mark delivery failed")?;
        Ok(())
    }

    pub async fn skip_delivery(&self, task_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET delivery_status = 'skipped', updated_at = ? WHERE task_id = ?",
        )
        .bind(now_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .with_context(|| "failed to skip delivery")?;
        Ok(())
    }

    /// Keep delivery pending and schedule the next attempt.
    pub async fn defer_delivery(&self, task_id: &str, next_at_unix: i64) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET delivery_status = 'pending', delivery_attempts = delivery_attempts + 1, \
             delivery_next_at = ?, updated_at = ? WHERE task_id = ?",
        )
        .bind(next_at_unix)
        .bind(now_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .with_context(|| "failed to defer delivery")?;
        Ok(())
    }

    pub async fn recent_tasks(&self, limit: i64) -> Result<Vec<TaskRow>> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .with_context(|| "failed to list recent tasks")?;
        rows.into_iter().map(task_from_row).collect()
    }

    // --- policy decisions ---

    #[allow(clippy::too_many_arguments)]
    pub async fn record_policy_decision(
        &self,
        trace_id: &str,
        task_id: &str,
        tool: &str,
        tier: u8,
        sender: &str,
        channel: &str,
        message_type: &str,
        allowed: bool,
        requires_approval: bool,
        reason: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO policy_decisions (trace_id, task_id, tool, tier, sender, channel, \
             message_type, allowed, requires_approval, reason, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(trace_id)
        .bind(task_id)
        .bind(tool)
        .bind(tier as i64)
        .bind(sender)
        .bind(channel)
        .bind(message_type)
        .bind(allowed)
        .bind(requires_approval)
        .bind(reason)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| "failed to record policy decision")?;
        Ok(())
    }

    pub async fn policy_decisions_for_task(&self, task_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM policy_decisions WHERE task_id = ?")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| "failed to count policy decisions")?;
        Ok(row.get::<i64, _>("n"))
    }

    // --- approvals ---

    pub async fn insert_approval(&self, approval: &ApprovalRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO approval_requests (approval_id, trace_id, task_id, tool, tier, arguments, \
             sender, channel, status, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)",
        )
        .bind(&approval.approval_id)
        .bind(&approval.trace_id)
        .bind(&approval.task_id)
        .bind(&approval.tool)
        .bind(approval.tier as i64)
        .bind(approval.arguments.to_string())
        .bind(&approval.sender)
        .bind(&approval.channel)
        .bind(&approval.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| "failed to insert approval request")?;
        Ok(())
    }

    pub async fn get_approval(&self, approval_id: &str) -> Result<ApprovalRow> {
        let row = sqlx::query("SELECT * FROM approval_requests WHERE approval_id = ?")
            .bind(approval_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| "failed to fetch approval")?
            .ok_or_else(|| LedgerError::NotFound(format!("approval {approval_id}")))?;
        approval_from_row(row)
    }

    /// Atomically flip a pending approval to a terminal status. Errors when
    /// the row is already terminal.
    pub async fn resolve_approval(&self, approval_id: &str, status: ApprovalStatus) -> Result<()> {
        debug_assert!(status.is_terminal());
        let result = sqlx::query(
            "UPDATE approval_requests SET status = ?, responded_at = ? \
             WHERE approval_id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(now_rfc3339())
        .bind(approval_id)
        .execute(&self.pool)
        .await
        .with_context(|| "failed to resolve approval")?;

        if result.rows_affected() == 0 {
            let current = self.get_approval(approval_id).await?;
            return Err(LedgerError::ApprovalTerminal {
                id: approval_id.to_string(),
                status: current.status.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Startup sweep: anything still pending from a previous run times out.
    pub async fn sweep_stale_approvals(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE approval_requests SET status = 'timeout', responded_at = ? \
             WHERE status = 'pending'",
        )
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| "failed to sweep stale approvals")?;
        Ok(result.rows_affected())
    }

    // --- scheduled jobs (owned here; the scheduler itself is external) ---

    pub async fn upsert_scheduled_job(
        &self,
        job_id: &str,
        schedule: &str,
        payload: serde_json::Value,
        next_run_at: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO scheduled_jobs (job_id, schedule, payload, next_run_at, enabled, created_at) \
             VALUES (?, ?, ?, ?, 1, ?) \
             ON CONFLICT(job_id) DO UPDATE SET schedule = excluded.schedule, \
             payload = excluded.payload, next_run_at = excluded.next_run_at",
        )
        .bind(job_id)
        .bind(schedule)
        .bind(payload.to_string())
        .bind(next_run_at)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| "failed to upsert scheduled job")?;
        Ok(())
    }

    /// Enabled jobs whose next run is due.
    pub async fn due_scheduled_jobs(&self, now_unix: i64) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT job_id, COALESCE(payload, '') AS payload FROM scheduled_jobs \
             WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ? \
             ORDER BY next_run_at",
        )
        .bind(now_unix)
        .fetch_all(&self.pool)
        .await
        .with_context(|| "failed to list due jobs")?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("job_id"), row.get::<String, _>("payload")))
            .collect())
    }

    // --- working memory ---

    /// Read the scratchpad for (resource, thread), falling back to the
    /// resource-level entry.
    pub async fn get_working_memory(
        &self,
        resource_id: &str,
        thread_id: Option<&str>,
    ) -> Result<Option<String>> {
        if let Some(thread) = thread_id {
            let row = sqlx::query(
                "SELECT content FROM working_memory WHERE resource_id = ? AND thread_id = ?",
            )
            .bind(resource_id)
            .bind(thread)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| "failed to read working memory")?;
            if let Some(row) = row {
                return Ok(Some(row.get::<String, _>("content")));
            }
        }

        let row = sqlx::query(
            "SELECT content FROM working_memory WHERE resource_id = ? AND thread_id = ''",
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| "failed to read working memory")?;
        Ok(row.map(|r| r.get::<String, _>("content")))
    }

    pub async fn set_working_memory(
        &self,
        resource_id: &str,
        thread_id: Option<&str>,
        content: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO working_memory (resource_id, thread_id, content, updated_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(resource_id, thread_id) DO UPDATE SET \
             content = excluded.content, updated_at = excluded.updated_at",
        )
        .bind(resource_id)
        .bind(thread_id.unwrap_or(""))
        .bind(content)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| "failed to write working memory")?;
        Ok(())
    }
}

pub(crate) fn task_from_row(row: sqlx::sqlite::SqliteRow) -> Result<TaskRow> {
    let status_raw: String = row.get("status");
    let delivery_raw: String = row.get("delivery_status");
    Ok(TaskRow {
        task_id: row.get("task_id"),
        idempotency_key: row.get("idempotency_key"),
        trace_id: row.get("trace_id"),
        channel: row.get("channel"),
        chat_id: row.get("chat_id"),
        thread_id: row.get("thread_id"),
        sender_id: row.get("sender_id"),
        message_type: row.get("message_type"),
        status: TaskStatus::parse(&status_raw)
            .ok_or_else(|| LedgerError::Query(format!("unknown task status {status_raw}")))?,
        content_in: row.get("content_in"),
        content_out: row.get("content_out"),
        error: row.get("error"),
        delivery_status: DeliveryStatus::parse(&delivery_raw)
            .ok_or_else(|| LedgerError::Query(format!("unknown delivery status {delivery_raw}")))?,
        delivery_attempts: row.get("delivery_attempts"),
        delivery_next_at: row.get("delivery_next_at"),
        prompt_tokens: row.get("prompt_tokens"),
        completion_tokens: row.get("completion_tokens"),
        provider: row.get("provider"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        completed_at: row.get("completed_at"),
    })
}

fn approval_from_row(row: sqlx::sqlite::SqliteRow) -> Result<ApprovalRow> {
    let status_raw: String = row.get("status");
    let arguments_raw: String = row.get("arguments");
    Ok(ApprovalRow {
        approval_id: row.get("approval_id"),
        trace_id: row.get("trace_id"),
        task_id: row.get("task_id"),
        tool: row.get("tool"),
        tier: row.get::<i64, _>("tier") as u8,
        arguments: serde_json::from_str(&arguments_raw).unwrap_or(serde_json::Value::Null),
        sender: row.get("sender"),
        channel: row.get("channel"),
        status: ApprovalStatus::parse(&status_raw)
            .ok_or_else(|| LedgerError::Query(format!("unknown approval status {status_raw}")))?,
        created_at: row.get("created_at"),
        responded_at: row.get("responded_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task(key: Option<&str>) -> NewTask {
        NewTask {
            idempotency_key: key.map(Into::into),
            trace_id: uuid::Uuid::new_v4().to_string(),
            channel: "console".into(),
            chat_id: "chat-1".into(),
            thread_id: None,
            sender_id: "alice".into(),
            message_type: "internal".into(),
            content_in: "hi".into(),
        }
    }

    #[tokio::test]
    async fn dedup_finds_existing_key_and_ignores_nil() {
        let ledger = Ledger::open_in_memory().await.expect("ledger");
        ledger.create_task(new_task(Some("k1"))).await.expect("create");

        let hit = ledger
            .find_task_by_idempotency("console", "chat-1", Some("k1"))
            .await
            .expect("lookup");
        assert!(hit.is_some());

        let miss = ledger
            .find_task_by_idempotency("console", "chat-1", None)
            .await
            .expect("lookup");
        assert!(miss.is_none());

        let other_chat = ledger
            .find_task_by_idempotency("console", "chat-2", Some("k1"))
            .await
            .expect("lookup");
        assert!(other_chat.is_none());
    }

    #[tokio::test]
    async fn status_transitions_are_monotonic() {
        let ledger = Ledger::open_in_memory().await.expect("ledger");
        let task = ledger.create_task(new_task(None)).await.expect("create");

        ledger.mark_task_processing(&task.task_id).await.expect("processing");
        ledger
            .complete_task(&task.task_id, "done", 10, 5, Some("openai"))
            .await
            .expect("complete");

        // completed is terminal
        let error = ledger
            .mark_task_processing(&task.task_id)
            .await
            .expect_err("completed -> processing must fail");
        assert!(error.to_string().contains("invalid task status transition"));

        let row = ledger.get_task(&task.task_id).await.expect("get");
        assert_eq!(row.status, TaskStatus::Completed);
        assert_eq!(row.content_out.as_deref(), Some("done"));
        assert_eq!(row.prompt_tokens, 10);
    }

    #[tokio::test]
    async fn failed_task_without_output_skips_delivery() {
        let ledger = Ledger::open_in_memory().await.expect("ledger");
        let task = ledger.create_task(new_task(None)).await.expect("create");
        ledger.mark_task_processing(&task.task_id).await.expect("processing");
        ledger.fail_task(&task.task_id, "provider exploded").await.expect("fail");

        let row = ledger.get_task(&task.task_id).await.expect("get");
        assert_eq!(row.status, TaskStatus::Failed);
        assert_eq!(row.delivery_status, DeliveryStatus::Skipped);
        assert_eq!(row.error.as_deref(), Some("provider exploded"));
    }

    #[tokio::test]
    async fn approval_resolution_is_atomic() {
        let ledger = Ledger::open_in_memory().await.expect("ledger");
        let approval = ApprovalRow {
            approval_id: "ap-1".into(),
            trace_id: "t-1".into(),
            task_id: "task-1".into(),
            tool: "exec".into(),
            tier: 2,
            arguments: serde_json::json!({"command": "echo hi"}),
            sender: "alice".into(),
            channel: "console".into(),
            status: ApprovalStatus::Pending,
            created_at: chrono::Utc::now().to_rfc3339(),
            responded_at: None,
        };
        ledger.insert_approval(&approval).await.expect("insert");

        ledger
            .resolve_approval("ap-1", ApprovalStatus::Approved)
            .await
            .expect("first resolve succeeds");

        let error = ledger
            .resolve_approval("ap-1", ApprovalStatus::Denied)
            .await
            .expect_err("second resolve must fail");
        assert!(error.to_string().contains("already approved"));
    }

    #[tokio::test]
    async fn startup_sweep_times_out_pending_approvals() {
        let ledger = Ledger::open_in_memory().await.expect("ledger");
        for i in 0..3 {
            let approval = ApprovalRow {
                approval_id: format!("ap-{i}"),
                trace_id: "t".into(),
                task_id: "task".into(),
                tool: "exec".into(),
                tier: 2,
                arguments: serde_json::Value::Null,
                sender: "alice".into(),
                channel: "console".into(),
                status: ApprovalStatus::Pending,
                created_at: chrono::Utc::now().to_rfc3339(),
                responded_at: None,
            };
            ledger.insert_approval(&approval).await.expect("insert");
        }
        ledger
            .resolve_approval("ap-0", ApprovalStatus::Denied)
            .await
            .expect("resolve");

        let swept = ledger.sweep_stale_approvals().await.expect("sweep");
        assert_eq!(swept, 2);
        let row = ledger.get_approval("ap-1").await.expect("get");
        assert_eq!(row.status, ApprovalStatus::Timeout);
    }

    #[tokio::test]
    async fn working_memory_falls_back_to_resource_scope() {
        let ledger = Ledger::open_in_memory().await.expect("ledger");
        ledger
            .set_working_memory("console:alice:room", None, "resource-level")
            .await
            .expect("set");

        let thread_read = ledger
            .get_working_memory("console:alice:room", Some("thread-9"))
            .await
            .expect("get");
        assert_eq!(thread_read.as_deref(), Some("resource-level"));

        ledger
            .set_working_memory("console:alice:room", Some("thread-9"), "thread-level")
            .await
            .expect("set");
        let thread_read = ledger
            .get_working_memory("console:alice:room", Some("thread-9"))
            .await
            .expect("get");
        assert_eq!(thread_read.as_deref(), Some("thread-level"));
    }
}

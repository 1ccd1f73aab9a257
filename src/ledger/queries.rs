//! Reporting queries: token rollups, trace graphs, unified audit view.

use crate::error::Result;
use crate::ledger::Ledger;
use anyhow::Context as _;
use serde::Serialize;
use sqlx::Row as _;

/// Token totals aggregated by provider or by day.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRollup {
    /// Provider name or `YYYY-MM-DD` bucket.
    pub bucket: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub task_count: i64,
}

/// A node in a reconstructed trace graph.
#[derive(Debug, Clone, Serialize)]
pub struct TraceNode {
    pub id: String,
    pub kind: String,
    pub label: String,
    pub created_at: String,
}

/// A parent->child edge in a trace graph.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEdge {
    pub from: String,
    pub to: String,
}

/// Node/edge set joining timeline events, group traces, policy decisions,
/// approvals, and delegation events under one trace id.
#[derive(Debug, Clone, Serialize)]
pub struct TraceGraph {
    pub trace_id: String,
    pub nodes: Vec<TraceNode>,
    pub edges: Vec<TraceEdge>,
}

/// One row of the unified audit view.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRow {
    pub source: String,
    pub subject: String,
    pub actor: String,
    pub action: String,
    pub detail: String,
    pub created_at: String,
}

impl Ledger {
    /// Token usage grouped by provider.
    pub async fn usage_by_provider(&self) -> Result<Vec<UsageRollup>> {
        let rows = sqlx::query(
            "SELECT COALESCE(provider, 'unknown') AS bucket, \
             SUM(prompt_tokens) AS prompt_tokens, \
             SUM(completion_tokens) AS completion_tokens, \
             COUNT(*) AS task_count \
             FROM tasks WHERE status = 'completed' \
             GROUP BY COALESCE(provider, 'unknown') ORDER BY bucket",
        )
        .fetch_all(self.pool())
        .await
        .with_context(|| "usage-by-provider rollup failed")?;

        Ok(rows.into_iter().map(rollup_from_row).collect())
    }

    /// Token usage grouped by day, newest first.
    pub async fn usage_by_day(&self, days: i64) -> Result<Vec<UsageRollup>> {
        let rows = sqlx::query(
            "SELECT substr(created_at, 1, 10) AS bucket, \
             SUM(prompt_tokens) AS prompt_tokens, \
             SUM(completion_tokens) AS completion_tokens, \
             COUNT(*) AS task_count \
             FROM tasks WHERE status = 'completed' \
             GROUP BY substr(created_at, 1, 10) \
             ORDER BY bucket DESC LIMIT ?",
        )
        .bind(days)
        .fetch_all(self.pool())
        .await
        .with_context(|| "usage-by-day rollup failed")?;

        Ok(rows.into_iter().map(rollup_from_row).collect())
    }

    /// Join every span source under one trace id into a node/edge set. The
    /// task node (when present) anchors the graph; all other spans hang off
    /// it in timestamp order.
    pub async fn trace_graph(&self, trace_id: &str) -> Result<TraceGraph> {
        let mut nodes = Vec::new();
        let mut edges = Vec::new();

        let task_row = sqlx::query(
            "SELECT task_id, status, created_at FROM tasks WHERE trace_id = ? LIMIT 1",
        )
        .bind(trace_id)
        .fetch_optional(self.pool())
        .await
        .with_context(|| "trace task lookup failed")?;

        let anchor = task_row.map(|row| {
            let task_id: String = row.get("task_id");
            let status: String = row.get("status");
            nodes.push(TraceNode {
                id: format!("task:{task_id}"),
                kind: "task".into(),
                label: format!("task {status}"),
                created_at: row.get("created_at"),
            });
            format!("task:{task_id}")
        });

        let event_rows = sqlx::query(
            "SELECT event_id, kind, payload, created_at FROM timeline \
             WHERE trace_id = ? ORDER BY id",
        )
        .bind(trace_id)
        .fetch_all(self.pool())
        .await
        .with_context(|| "trace event lookup failed")?;

        for row in event_rows {
            let event_id: String = row.get("event_id");
            let id = format!("event:{event_id}");
            nodes.push(TraceNode {
                id: id.clone(),
                kind: row.get("kind"),
                label: row.get::<Option<String>, _>("payload").unwrap_or_default(),
                created_at: row.get("created_at"),
            });
            if let Some(anchor) = &anchor {
                edges.push(TraceEdge { from: anchor.clone(), to: id });
            }
        }

        let policy_rows = sqlx::query(
            "SELECT id, tool, allowed, reason, created_at FROM policy_decisions \
             WHERE trace_id = ? ORDER BY id",
        )
        .bind(trace_id)
        .fetch_all(self.pool())
        .await
        .with_context(|| "trace policy lookup failed")?;

        for row in policy_rows {
            let id = format!("policy:{}", row.get::<i64, _>("id"));
            let allowed: bool = row.get("allowed");
            nodes.push(TraceNode {
                id: id.clone(),
                kind: "policy".into(),
                label: format!(
                    "{} {} ({})",
                    row.get::<String, _>("tool"),
                    if allowed { "allowed" } else { "denied" },
                    row.get::<String, _>("reason"),
                ),
                created_at: row.get("created_at"),
            });
            if let Some(anchor) = &anchor {
                edges.push(TraceEdge { from: anchor.clone(), to: id });
            }
        }

        let approval_rows = sqlx::query(
            "SELECT approval_id, tool, status, created_at FROM approval_requests \
             WHERE trace_id = ? ORDER BY created_at",
        )
        .bind(trace_id)
        .fetch_all(self.pool())
        .await
        .with_context(|| "trace approval lookup failed")?;

        for row in approval_rows {
            let approval_id: String = row.get("approval_id");
            let id = format!("approval:{approval_id}");
            nodes.push(TraceNode {
                id: id.clone(),
                kind: "approval".into(),
                label: format!(
                    "{} {}",
                    row.get::<String, _>("tool"),
                    row.get::<String, _>("status"),
                ),
                created_at: row.get("created_at"),
            });
            if let Some(anchor) = &anchor {
                edges.push(TraceEdge { from: anchor.clone(), to: id });
            }
        }

        let group_rows = sqlx::query(
            "SELECT id, trace_type, sender_id, created_at FROM group_traces \
             WHERE correlation_id = ? ORDER BY id",
        )
        .bind(trace_id)
        .fetch_all(self.pool())
        .await
        .with_context(|| "trace group lookup failed")?;

        for row in group_rows {
            let id = format!("group:{}", row.get::<i64, _>("id"));
            nodes.push(TraceNode {
                id: id.clone(),
                kind: "group_trace".into(),
                label: format!(
                    "{} from {}",
                    row.get::<String, _>("trace_type"),
                    row.get::<String, _>("sender_id"),
                ),
                created_at: row.get("created_at"),
            });
            if let Some(anchor) = &anchor {
                edges.push(TraceEdge { from: anchor.clone(), to: id });
            }
        }

        Ok(TraceGraph {
            trace_id: trace_id.to_string(),
            nodes,
            edges,
        })
    }

    /// Unified audit feed over delegation, policy, approval, and mode-change
    /// sources with a stable column schema.
    pub async fn audit_view(&self, limit: i64) -> Result<Vec<AuditRow>> {
        let rows = sqlx::query(
            "SELECT 'delegation' AS source, task_id AS subject, agent_id AS actor, \
                    event AS action, COALESCE(detail, '') AS detail, created_at \
             FROM delegation_events \
             UNION ALL \
             SELECT 'policy', tool, sender, \
                    CASE WHEN allowed THEN 'allowed' ELSE 'denied' END, reason, created_at \
             FROM policy_decisions \
             UNION ALL \
             SELECT 'approval', tool, sender, status, approval_id, created_at \
             FROM approval_requests \
             UNION ALL \
             SELECT 'mode_change', kind, 'system', kind, COALESCE(payload, ''), created_at \
             FROM timeline WHERE kind = 'mode_change' \
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .with_context(|| "audit view query failed")?;

        Ok(rows
            .into_iter()
            .map(|row| AuditRow {
                source: row.get("source"),
                subject: row.get("subject"),
                actor: row.get("actor"),
                action: row.get("action"),
                detail: row.get("detail"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

fn rollup_from_row(row: sqlx::sqlite::SqliteRow) -> UsageRollup {
    UsageRollup {
        bucket: row.get("bucket"),
        prompt_tokens: row.get::<Option<i64>, _>("prompt_tokens").unwrap_or(0),
        completion_tokens: row.get::<Option<i64>, _>("completion_tokens").unwrap_or(0),
        task_count: row.get("task_count"),
    }
}

//! Group fabric tables: roster, membership history, traces, delegated tasks,
//! shared memory items, skill channels, and the topic message log.

use crate::error::{LedgerError, Result};
use crate::ledger::Ledger;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::Row as _;

/// Roster liveness state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Active,
    Stale,
    Left,
}

impl MemberStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MemberStatus::Active => "active",
            MemberStatus::Stale => "stale",
            MemberStatus::Left => "left",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(MemberStatus::Active),
            "stale" => Some(MemberStatus::Stale),
            "left" => Some(MemberStatus::Left),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A peer agent as seen on the announce topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub agent_id: String,
    pub agent_name: String,
    pub soul_summary: Option<String>,
    pub capabilities: Vec<String>,
    pub channels: Vec<String>,
    pub model: Option<String>,
    pub role: String,
    pub status: MemberStatus,
    pub parent_id: Option<String>,
    pub zone_id: Option<String>,
    pub last_seen: String,
    pub left_at: Option<String>,
}

/// A delegated task row with tree linkage.
#[derive(Debug, Clone)]
pub struct GroupTaskRow {
    pub task_id: String,
    pub parent_task_id: Option<String>,
    pub delegation_depth: i64,
    pub original_requester_id: String,
    pub assignee_id: Option<String>,
    pub deadline_at: Option<String>,
    pub status: String,
    pub accepted_at: Option<String>,
    pub created_at: String,
}

/// Versioned description of the group's topic set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicManifest {
    pub group_name: String,
    pub version: i64,
    pub core_topics: Vec<String>,
    pub skill_topics: Vec<String>,
    pub updated_at: String,
    pub updated_by: String,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl Ledger {
    pub(crate) async fn migrate_group_tables(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS group_members (
                agent_id TEXT PRIMARY KEY,
                agent_name TEXT NOT NULL,
                soul_summary TEXT,
                capabilities TEXT NOT NULL DEFAULT '[]',
                channels TEXT NOT NULL DEFAULT '[]',
                model TEXT,
                role TEXT NOT NULL DEFAULT 'worker',
                status TEXT NOT NULL DEFAULT 'active',
                parent_id TEXT,
                zone_id TEXT,
                last_seen TEXT NOT NULL,
                left_at TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS group_membership_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                event TEXT NOT NULL,
                broker_snapshot TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS group_traces (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trace_type TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                payload TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS group_tasks (
                task_id TEXT PRIMARY KEY,
                parent_task_id TEXT,
                delegation_depth INTEGER NOT NULL DEFAULT 0,
                original_requester_id TEXT NOT NULL,
                assignee_id TEXT,
                deadline_at TEXT,
                status TEXT NOT NULL DEFAULT 'open',
                accepted_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS delegation_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                event TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                detail TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS group_memory_items (
                item_id TEXT PRIMARY KEY,
                author_id TEXT NOT NULL,
                title TEXT NOT NULL,
                pointer TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS group_skill_channels (
                skill TEXT PRIMARY KEY,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS topic_message_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT NOT NULL,
                envelope_type TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                payload TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS group_manifest (
                group_name TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                core_topics TEXT NOT NULL DEFAULT '[]',
                skill_topics TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT NOT NULL,
                updated_by TEXT NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(self.pool())
                .await
                .map_err(|e| LedgerError::Migration(e.to_string()))?;
        }
        Ok(())
    }

    // --- roster ---

    /// Upsert a member from an announce or heartbeat. Reactivates soft-deleted
    /// members; last writer wins per member id.
    pub async fn upsert_member(&self, member: &GroupMember) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_members (agent_id, agent_name, soul_summary, capabilities, \
             channels, model, role, status, parent_id, zone_id, last_seen, left_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 'active', ?, ?, ?, NULL) \
             ON CONFLICT(agent_id) DO UPDATE SET \
             agent_name = excluded.agent_name, soul_summary = excluded.soul_summary, \
             capabilities = excluded.capabilities, channels = excluded.channels, \
             model = excluded.model, role = excluded.role, status = 'active', \
             parent_id = excluded.parent_id, zone_id = excluded.zone_id, \
             last_seen = excluded.last_seen, left_at = NULL",
        )
        .bind(&member.agent_id)
        .bind(&member.agent_name)
        .bind(&member.soul_summary)
        .bind(serde_json::to_string(&member.capabilities).unwrap_or_else(|_| "[]".into()))
        .bind(serde_json::to_string(&member.channels).unwrap_or_else(|_| "[]".into()))
        .bind(&member.model)
        .bind(&member.role)
        .bind(&member.parent_id)
        .bind(&member.zone_id)
        .bind(&member.last_seen)
        .execute(self.pool())
        .await
        .with_context(|| "failed to upsert group member")?;
        Ok(())
    }

    /// Soft-delete on leave.
    pub async fn mark_member_left(&self, agent_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE group_members SET status = 'left', left_at = ? WHERE agent_id = ?",
        )
        .bind(now_rfc3339())
        .bind(agent_id)
        .execute(self.pool())
        .await
        .with_context(|| "failed to mark member left")?;
        Ok(())
    }

    /// Members unseen since `cutoff` become stale. Returns how many flipped.
    pub async fn mark_stale_members(&self, cutoff_rfc3339: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE group_members SET status = 'stale' \
             WHERE status = 'active' AND last_seen < ?",
        )
        .bind(cutoff_rfc3339)
        .execute(self.pool())
        .await
        .with_context(|| "failed to sweep stale members")?;
        Ok(result.rows_affected())
    }

    pub async fn roster(&self) -> Result<Vec<GroupMember>> {
        let rows = sqlx::query("SELECT * FROM group_members ORDER BY agent_id")
            .fetch_all(self.pool())
            .await
            .with_context(|| "failed to load roster")?;
        rows.into_iter().map(member_from_row).collect()
    }

    pub async fn get_member(&self, agent_id: &str) -> Result<Option<GroupMember>> {
        let row = sqlx::query("SELECT * FROM group_members WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(self.pool())
            .await
            .with_context(|| "failed to load member")?;
        row.map(member_from_row).transpose()
    }

    pub async fn append_membership_history(
        &self,
        agent_id: &str,
        event: &str,
        broker_snapshot: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_membership_history (agent_id, event, broker_snapshot, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(agent_id)
        .bind(event)
        .bind(broker_snapshot.to_string())
        .bind(now_rfc3339())
        .execute(self.pool())
        .await
        .with_context(|| "failed to append membership history")?;
        Ok(())
    }

    // --- traces, topic log ---

    pub async fn insert_group_trace(
        &self,
        trace_type: &str,
        correlation_id: &str,
        sender_id: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_traces (trace_type, correlation_id, sender_id, payload, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(trace_type)
        .bind(correlation_id)
        .bind(sender_id)
        .bind(payload.to_string())
        .bind(now_rfc3339())
        .execute(self.pool())
        .await
        .with_context(|| "failed to insert group trace")?;
        Ok(())
    }

    /// Every received topic message is logged, own messages included, so
    /// analytics can see the full traffic.
    pub async fn log_topic_message(
        &self,
        topic: &str,
        envelope_type: &str,
        correlation_id: &str,
        sender_id: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO topic_message_log (topic, envelope_type, correlation_id, sender_id, \
             payload, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(topic)
        .bind(envelope_type)
        .bind(correlation_id)
        .bind(sender_id)
        .bind(payload.to_string())
        .bind(now_rfc3339())
        .execute(self.pool())
        .await
        .with_context(|| "failed to log topic message")?;
        Ok(())
    }

    // --- delegated tasks ---

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_group_task(
        &self,
        task_id: &str,
        parent_task_id: Option<&str>,
        delegation_depth: u32,
        original_requester_id: &str,
        assignee_id: Option<&str>,
        deadline_at: Option<&str>,
    ) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO group_tasks (task_id, parent_task_id, delegation_depth, \
             original_requester_id, assignee_id, deadline_at, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, 'open', ?, ?)",
        )
        .bind(task_id)
        .bind(parent_task_id)
        .bind(delegation_depth as i64)
        .bind(original_requester_id)
        .bind(assignee_id)
        .bind(deadline_at)
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await
        .with_context(|| "failed to insert group task")?;
        Ok(())
    }

    pub async fn accept_group_task(&self, task_id: &str, assignee_id: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE group_tasks SET status = 'accepted', assignee_id = ?, accepted_at = ?, \
             updated_at = ? WHERE task_id = ?",
        )
        .bind(assignee_id)
        .bind(&now)
        .bind(&now)
        .bind(task_id)
        .execute(self.pool())
        .await
        .with_context(|| "failed to accept group task")?;
        Ok(())
    }

    pub async fn close_group_task(&self, task_id: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE group_tasks SET status = ?, updated_at = ? WHERE task_id = ?")
            .bind(status)
            .bind(now_rfc3339())
            .bind(task_id)
            .execute(self.pool())
            .await
            .with_context(|| "failed to close group task")?;
        Ok(())
    }

    pub async fn get_group_task(&self, task_id: &str) -> Result<Option<GroupTaskRow>> {
        let row = sqlx::query("SELECT * FROM group_tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(self.pool())
            .await
            .with_context(|| "failed to load group task")?;
        Ok(row.map(group_task_from_row))
    }

    /// Direct children of a delegated task.
    pub async fn child_group_tasks(&self, parent_task_id: &str) -> Result<Vec<GroupTaskRow>> {
        let rows = sqlx::query(
            "SELECT * FROM group_tasks WHERE parent_task_id = ? ORDER BY created_at",
        )
        .bind(parent_task_id)
        .fetch_all(self.pool())
        .await
        .with_context(|| "failed to load child tasks")?;
        Ok(rows.into_iter().map(group_task_from_row).collect())
    }

    /// Breadth-first reconstruction of a delegation chain from its root.
    pub async fn delegation_chain(&self, root_task_id: &str) -> Result<Vec<GroupTaskRow>> {
        let mut chain = Vec::new();
        let mut frontier = vec![root_task_id.to_string()];

        while let Some(task_id) = frontier.pop() {
            if let Some(task) = self.get_group_task(&task_id).await? {
                for child in self.child_group_tasks(&task.task_id).await? {
                    frontier.insert(0, child.task_id.clone());
                }
                chain.push(task);
            }
        }
        Ok(chain)
    }

    pub async fn log_delegation_event(
        &self,
        task_id: &str,
        event: &str,
        agent_id: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO delegation_events (task_id, event, agent_id, detail, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(event)
        .bind(agent_id)
        .bind(detail)
        .bind(now_rfc3339())
        .execute(self.pool())
        .await
        .with_context(|| "failed to log delegation event")?;
        Ok(())
    }

    pub async fn insert_orchestrator_event(
        &self,
        correlation_id: &str,
        sender_id: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO orchestrator_events (correlation_id, sender_id, payload, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(correlation_id)
        .bind(sender_id)
        .bind(payload.to_string())
        .bind(now_rfc3339())
        .execute(self.pool())
        .await
        .with_context(|| "failed to insert orchestrator event")?;
        Ok(())
    }

    // --- shared memory items, skill channels ---

    pub async fn upsert_memory_item(
        &self,
        item_id: &str,
        author_id: &str,
        title: &str,
        pointer: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_memory_items (item_id, author_id, title, pointer, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(item_id) DO UPDATE SET \
             author_id = excluded.author_id, title = excluded.title, pointer = excluded.pointer",
        )
        .bind(item_id)
        .bind(author_id)
        .bind(title)
        .bind(pointer.to_string())
        .bind(now_rfc3339())
        .execute(self.pool())
        .await
        .with_context(|| "failed to upsert memory item")?;
        Ok(())
    }

    pub async fn register_skill_channel(&self, skill: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_skill_channels (skill, created_at) VALUES (?, ?) \
             ON CONFLICT(skill) DO NOTHING",
        )
        .bind(skill)
        .bind(now_rfc3339())
        .execute(self.pool())
        .await
        .with_context(|| "failed to register skill channel")?;
        Ok(())
    }

    pub async fn list_skill_channels(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT skill FROM group_skill_channels ORDER BY skill")
            .fetch_all(self.pool())
            .await
            .with_context(|| "failed to list skill channels")?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("skill")).collect())
    }

    // --- manifest ---

    pub async fn get_manifest(&self, group_name: &str) -> Result<Option<TopicManifest>> {
        let row = sqlx::query("SELECT * FROM group_manifest WHERE group_name = ?")
            .bind(group_name)
            .fetch_optional(self.pool())
            .await
            .with_context(|| "failed to load manifest")?;

        Ok(row.map(|r| {
            let core_raw: String = r.get("core_topics");
            let skill_raw: String = r.get("skill_topics");
            TopicManifest {
                group_name: r.get("group_name"),
                version: r.get("version"),
                core_topics: serde_json::from_str(&core_raw).unwrap_or_default(),
                skill_topics: serde_json::from_str(&skill_raw).unwrap_or_default(),
                updated_at: r.get("updated_at"),
                updated_by: r.get("updated_by"),
            }
        }))
    }

    pub async fn put_manifest(&self, manifest: &TopicManifest) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_manifest (group_name, version, core_topics, skill_topics, \
             updated_at, updated_by) VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(group_name) DO UPDATE SET version = excluded.version, \
             core_topics = excluded.core_topics, skill_topics = excluded.skill_topics, \
             updated_at = excluded.updated_at, updated_by = excluded.updated_by",
        )
        .bind(&manifest.group_name)
        .bind(manifest.version)
        .bind(serde_json::to_string(&manifest.core_topics).unwrap_or_else(|_| "[]".into()))
        .bind(serde_json::to_string(&manifest.skill_topics).unwrap_or_else(|_| "[]".into()))
        .bind(&manifest.updated_at)
        .bind(&manifest.updated_by)
        .execute(self.pool())
        .await
        .with_context(|| "failed to store manifest")?;
        Ok(())
    }
}

fn member_from_row(row: sqlx::sqlite::SqliteRow) -> Result<GroupMember> {
    let capabilities_raw: String = row.get("capabilities");
    let channels_raw: String = row.get("channels");
    let status_raw: String = row.get("status");
    Ok(GroupMember {
        agent_id: row.get("agent_id"),
        agent_name: row.get("agent_name"),
        soul_summary: row.get("soul_summary"),
        capabilities: serde_json::from_str(&capabilities_raw).unwrap_or_default(),
        channels: serde_json::from_str(&channels_raw).unwrap_or_default(),
        model: row.get("model"),
        role: row.get("role"),
        status: MemberStatus::parse(&status_raw).unwrap_or(MemberStatus::Active),
        parent_id: row.get("parent_id"),
        zone_id: row.get("zone_id"),
        last_seen: row.get("last_seen"),
        left_at: row.get("left_at"),
    })
}

fn group_task_from_row(row: sqlx::sqlite::SqliteRow) -> GroupTaskRow {
    GroupTaskRow {
        task_id: row.get("task_id"),
        parent_task_id: row.get("parent_task_id"),
        delegation_depth: row.get("delegation_depth"),
        original_requester_id: row.get("original_requester_id"),
        assignee_id: row.get("assignee_id"),
        deadline_at: row.get("deadline_at"),
        status: row.get("status"),
        accepted_at: row.get("accepted_at"),
        created_at: row.get("created_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(agent_id: &str) -> GroupMember {
        GroupMember {
            agent_id: agent_id.into(),
            agent_name: format!("{agent_id}-name"),
            soul_summary: None,
            capabilities: vec!["exec".into()],
            channels: vec!["console".into()],
            model: Some("gpt-4.1".into()),
            role: "worker".into(),
            status: MemberStatus::Active,
            parent_id: None,
            zone_id: None,
            last_seen: chrono::Utc::now().to_rfc3339(),
            left_at: None,
        }
    }

    #[tokio::test]
    async fn leave_soft_deletes_and_announce_reactivates() {
        let ledger = Ledger::open_in_memory().await.expect("ledger");
        ledger.upsert_member(&member("peer-1")).await.expect("upsert");
        ledger.mark_member_left("peer-1").await.expect("leave");

        let left = ledger.get_member("peer-1").await.expect("get").expect("row");
        assert_eq!(left.status, MemberStatus::Left);
        assert!(left.left_at.is_some());

        ledger.upsert_member(&member("peer-1")).await.expect("upsert");
        let back = ledger.get_member("peer-1").await.expect("get").expect("row");
        assert_eq!(back.status, MemberStatus::Active);
        assert!(back.left_at.is_none());
    }

    #[tokio::test]
    async fn stale_sweep_only_touches_old_members() {
        let ledger = Ledger::open_in_memory().await.expect("ledger");
        let mut old = member("old-peer");
        old.last_seen = (chrono::Utc::now() - chrono::Duration::minutes(10)).to_rfc3339();
        ledger.upsert_member(&old).await.expect("upsert");
        ledger.upsert_member(&member("fresh-peer")).await.expect("upsert");

        let cutoff = (chrono::Utc::now() - chrono::Duration::minutes(5)).to_rfc3339();
        let flipped = ledger.mark_stale_members(&cutoff).await.expect("sweep");
        assert_eq!(flipped, 1);

        let stale = ledger.get_member("old-peer").await.expect("get").expect("row");
        assert_eq!(stale.status, MemberStatus::Stale);
        let fresh = ledger.get_member("fresh-peer").await.expect("get").expect("row");
        assert_eq!(fresh.status, MemberStatus::Active);
    }

    #[tokio::test]
    async fn delegation_chain_walks_breadth_first() {
        let ledger = Ledger::open_in_memory().await.expect("ledger");
        ledger
            .insert_group_task("root", None, 0, "origin", None, None)
            .await
            .expect("insert");
        ledger
            .insert_group_task("child-a", Some("root"), 1, "origin", None, None)
            .await
            .expect("insert");
        ledger
            .insert_group_task("child-b", Some("root"), 1, "origin", None, None)
            .await
            .expect("insert");
        ledger
            .insert_group_task("grandchild", Some("child-a"), 2, "origin", None, None)
            .await
            .expect("insert");

        let chain = ledger.delegation_chain("root").await.expect("chain");
        let ids: Vec<&str> = chain.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids[0], "root");
        assert!(ids.contains(&"grandchild"));
        assert_eq!(ids.len(), 4);
        // Children come before grandchildren.
        let pos = |id: &str| ids.iter().position(|t| *t == id).expect("present");
        assert!(pos("child-a") < pos("grandchild"));
    }

    #[tokio::test]
    async fn manifest_round_trips() {
        let ledger = Ledger::open_in_memory().await.expect("ledger");
        let manifest = TopicManifest {
            group_name: "g1".into(),
            version: 3,
            core_topics: vec!["group.g1.announce".into()],
            skill_topics: vec!["group.g1.skill.search.requests".into()],
            updated_at: chrono::Utc::now().to_rfc3339(),
            updated_by: "peer-1".into(),
        };
        ledger.put_manifest(&manifest).await.expect("put");
        let loaded = ledger.get_manifest("g1").await.expect("get").expect("row");
        assert_eq!(loaded, manifest);
    }
}

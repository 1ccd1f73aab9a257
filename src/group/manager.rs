//! Group membership, heartbeats, delegation, and shared memory.

use crate::config::GroupConfig;
use crate::error::{GroupError, Result};
use crate::group::broker::{BrokerClient, LargeArtifactClient};
use crate::group::envelope::{
    AgentIdentity, AgentRole, Envelope, EnvelopeType, MemoryItemPayload, RequestPayload,
    ResponsePayload, TaskStatusPayload, Topics,
};
use crate::group::onboard::Onboarding;
use crate::ledger::group::{GroupMember, MemberStatus, TopicManifest};
use crate::ledger::Ledger;
use crate::memory::{IndexJob, MemoryIndexer};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Heartbeats run at this multiple of the broker poll interval.
const HEARTBEAT_POLL_MULTIPLE: u32 = 15;

/// Members unseen for this multiple of the heartbeat interval go stale.
const STALE_HEARTBEAT_MULTIPLE: u32 = 3;

/// Owns the local agent's presence in the group.
pub struct GroupManager {
    config: GroupConfig,
    identity: AgentIdentity,
    topics: Topics,
    broker: Arc<dyn BrokerClient>,
    ledger: Arc<Ledger>,
    artifact: Option<LargeArtifactClient>,
    manifest: RwLock<TopicManifest>,
    pub(crate) onboarding: Mutex<Onboarding>,
    /// Injected after construction to break the manager/indexer cycle.
    indexer: OnceLock<MemoryIndexer>,
}

impl GroupManager {
    pub fn new(
        config: GroupConfig,
        broker: Arc<dyn BrokerClient>,
        ledger: Arc<Ledger>,
        artifact: Option<LargeArtifactClient>,
        tool_names: Vec<String>,
    ) -> Self {
        let topics = Topics::new(config.group_name.clone());
        // Announce the well-known default tool set when no registry was
        // handed over yet.
        let capabilities = if tool_names.is_empty() {
            crate::tools::DEFAULT_TOOLS
                .iter()
                .map(|(name, _)| name.to_string())
                .collect()
        } else {
            tool_names
        };
        let identity = AgentIdentity {
            agent_id: config.agent_id.clone(),
            agent_name: config.agent_name.clone(),
            soul_summary: None,
            capabilities,
            channels: vec!["console".into(), "group".into()],
            model: None,
            role: AgentRole::parse(&config.role).unwrap_or(AgentRole::Worker),
            status: "active".into(),
            parent_id: None,
            zone_id: config.zone_id.clone(),
        };
        let manifest = TopicManifest {
            group_name: config.group_name.clone(),
            version: 1,
            core_topics: topics.core(),
            skill_topics: Vec::new(),
            updated_at: chrono::Utc::now().to_rfc3339(),
            updated_by: config.agent_id.clone(),
        };
        let onboarding = Onboarding::new(config.onboard_mode);
        Self {
            config,
            identity,
            topics,
            broker,
            ledger,
            artifact,
            manifest: RwLock::new(manifest),
            onboarding: Mutex::new(onboarding),
            indexer: OnceLock::new(),
        }
    }

    /// Late-bound memory indexer handle.
    pub fn set_memory_indexer(&self, indexer: MemoryIndexer) {
        let _ = self.indexer.set(indexer);
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn agent_id(&self) -> &str {
        &self.identity.agent_id
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms * HEARTBEAT_POLL_MULTIPLE as u64)
    }

    fn stale_cutoff(&self) -> chrono::DateTime<chrono::Utc> {
        let window = self.heartbeat_interval() * STALE_HEARTBEAT_MULTIPLE;
        chrono::Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(90))
    }

    fn identity_envelope(&self, kind: EnvelopeType) -> Envelope {
        Envelope::new(
            kind,
            self.identity.agent_id.clone(),
            serde_json::to_value(&self.identity).unwrap_or_default(),
        )
    }

    fn broker_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "brokers": self.config.brokers,
            "consumer_group": self.config.consumer_group,
            "group_name": self.config.group_name,
        })
    }

    fn member_from_identity(identity: &AgentIdentity) -> GroupMember {
        GroupMember {
            agent_id: identity.agent_id.clone(),
            agent_name: identity.agent_name.clone(),
            soul_summary: identity.soul_summary.clone(),
            capabilities: identity.capabilities.clone(),
            channels: identity.channels.clone(),
            model: identity.model.clone(),
            role: identity.role.as_str().to_string(),
            status: MemberStatus::Active,
            parent_id: identity.parent_id.clone(),
            zone_id: identity.zone_id.clone(),
            last_seen: chrono::Utc::now().to_rfc3339(),
            left_at: None,
        }
    }

    /// Subscribe to the group's topics and announce ourselves.
    pub async fn join(&self) -> Result<()> {
        let mut topics = self.topics.core();
        {
            let manifest = self.manifest.read().await;
            for topic in &manifest.skill_topics {
                if !topics.contains(topic) {
                    topics.push(topic.clone());
                }
            }
        }
        self.broker.subscribe(&topics).await?;

        let announce = self.identity_envelope(EnvelopeType::Announce);
        self.broker
            .publish(&self.topics.announce(), &announce.encode())
            .await?;

        self.ledger
            .upsert_member(&Self::member_from_identity(&self.identity))
            .await?;
        self.ledger
            .append_membership_history(self.agent_id(), "joined", self.broker_snapshot())
            .await?;

        tracing::info!(group = self.topics.group(), agent_id = self.agent_id(), "joined group");
        Ok(())
    }

    /// Announce departure and soft-delete the local membership row.
    pub async fn leave(&self) -> Result<()> {
        let mut identity = self.identity.clone();
        identity.status = "leaving".into();
        let envelope = Envelope::new(
            EnvelopeType::Announce,
            identity.agent_id.clone(),
            serde_json::to_value(&identity).unwrap_or_default(),
        );
        self.broker
            .publish(&self.topics.announce(), &envelope.encode())
            .await?;

        self.ledger.mark_member_left(self.agent_id()).await?;
        self.ledger
            .append_membership_history(self.agent_id(), "left", self.broker_snapshot())
            .await?;
        tracing::info!(group = self.topics.group(), "left group");
        Ok(())
    }

    /// Re-publish the identity so peers keep the roster fresh.
    pub async fn publish_heartbeat(&self) -> Result<()> {
        let heartbeat = self.identity_envelope(EnvelopeType::Heartbeat);
        self.broker
            .publish(&self.topics.announce(), &heartbeat.encode())
            .await
    }

    /// Heartbeat loop at 15x the poll interval.
    pub async fn heartbeat_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(error) = self.publish_heartbeat().await {
                        tracing::warn!(%error, "heartbeat publish failed");
                    }
                }
            }
        }
    }

    /// Stale sweep at 3x the heartbeat interval.
    pub async fn stale_sweep_loop(&self, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval(self.heartbeat_interval() * STALE_HEARTBEAT_MULTIPLE);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let cutoff = self.stale_cutoff().to_rfc3339();
                    match self.ledger.mark_stale_members(&cutoff).await {
                        Ok(0) => {}
                        Ok(count) => tracing::info!(count, "marked members stale"),
                        Err(error) => tracing::warn!(%error, "stale sweep failed"),
                    }
                }
            }
        }
    }

    /// Record a peer identity seen on announce/heartbeat. Returns true when
    /// this peer was previously unknown.
    pub async fn observe_peer(&self, identity: &AgentIdentity) -> Result<bool> {
        let known = self.ledger.get_member(&identity.agent_id).await?.is_some();
        if identity.status == "leaving" {
            self.ledger.mark_member_left(&identity.agent_id).await?;
            return Ok(false);
        }
        self.ledger
            .upsert_member(&Self::member_from_identity(identity))
            .await?;
        Ok(!known)
    }

    /// Submit a task to the group, enforcing the delegation-depth bound.
    /// Returns the new task id.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit_delegated_task(
        &self,
        content: &str,
        parent_task_id: Option<&str>,
        parent_depth: u32,
        original_requester_id: Option<&str>,
        deadline_at: Option<&str>,
        skill: Option<&str>,
        target_agent_id: Option<&str>,
    ) -> Result<String> {
        let depth = parent_depth + 1;
        if depth > self.config.max_delegation_depth {
            return Err(GroupError::DelegationDepthExceeded {
                depth,
                max: self.config.max_delegation_depth,
            }
            .into());
        }

        let task_id = uuid::Uuid::new_v4().to_string();
        let requester = original_requester_id.unwrap_or(self.agent_id());

        self.ledger
            .insert_group_task(&task_id, parent_task_id, depth, requester, target_agent_id, deadline_at)
            .await?;
        self.ledger
            .log_delegation_event(&task_id, "submitted", self.agent_id(), None)
            .await?;

        let payload = RequestPayload {
            task_id: task_id.clone(),
            content: content.to_string(),
            parent_task_id: parent_task_id.map(Into::into),
            delegation_depth: depth,
            original_requester_id: requester.to_string(),
            deadline_at: deadline_at.map(Into::into),
            skill: skill.map(Into::into),
            target_agent_id: target_agent_id.map(Into::into),
        };
        let kind = if skill.is_some() { EnvelopeType::SkillRequest } else { EnvelopeType::Request };
        let envelope = Envelope::new(
            kind,
            self.agent_id().to_string(),
            serde_json::to_value(&payload).unwrap_or_default(),
        )
        .with_correlation(task_id.clone());

        let topic = match skill {
            Some(skill) => {
                self.ensure_skill_topic(skill).await?;
                self.topics.skill_requests(skill)
            }
            None => self.topics.requests(),
        };
        self.broker.publish(&topic, &envelope.encode()).await?;

        tracing::info!(%task_id, depth, "delegated task submitted");
        Ok(task_id)
    }

    /// Report progress on a delegated task we are executing.
    pub async fn report_task_status(
        &self,
        task_id: &str,
        status: &str,
        content: &str,
    ) -> Result<()> {
        match status {
            "accepted" => {
                self.ledger.accept_group_task(task_id, self.agent_id()).await?;
                self.ledger
                    .log_delegation_event(task_id, "accepted", self.agent_id(), None)
                    .await?;
                let payload = TaskStatusPayload {
                    task_id: task_id.to_string(),
                    status: status.to_string(),
                    agent_id: self.agent_id().to_string(),
                };
                let envelope = Envelope::new(
                    EnvelopeType::TaskStatus,
                    self.agent_id().to_string(),
                    serde_json::to_value(&payload).unwrap_or_default(),
                )
                .with_correlation(task_id.to_string());
                self.broker
                    .publish(&self.topics.tasks_status(), &envelope.encode())
                    .await?;
            }
            "completed" | "failed" => {
                self.ledger.close_group_task(task_id, status).await?;
                let payload = ResponsePayload {
                    task_id: task_id.to_string(),
                    status: status.to_string(),
                    content: content.to_string(),
                };
                let envelope = Envelope::new(
                    EnvelopeType::Response,
                    self.agent_id().to_string(),
                    serde_json::to_value(&payload).unwrap_or_default(),
                )
                .with_correlation(task_id.to_string());
                self.broker
                    .publish(&self.topics.responses(), &envelope.encode())
                    .await?;
            }
            other => {
                return Err(GroupError::Other(anyhow::anyhow!(
                    "unknown task status '{other}'"
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Publish a trace span for cross-agent graph reconstruction.
    pub async fn publish_trace(&self, correlation_id: &str, payload: serde_json::Value) -> Result<()> {
        let envelope = Envelope::new(EnvelopeType::Trace, self.agent_id().to_string(), payload)
            .with_correlation(correlation_id.to_string());
        self.broker.publish(&self.topics.traces(), &envelope.encode()).await
    }

    /// Publish an audit event on the observe topic.
    pub async fn publish_audit(&self, payload: serde_json::Value) -> Result<()> {
        let envelope = Envelope::new(EnvelopeType::Audit, self.agent_id().to_string(), payload);
        self.broker.publish(&self.topics.audit(), &envelope.encode()).await
    }

    /// Share a memory item: content goes through the large-artifact endpoint
    /// first, then the pointer rides the memory topic.
    pub async fn share_memory_item(&self, title: &str, content: &str) -> Result<String> {
        let Some(artifact) = &self.artifact else {
            return Err(GroupError::Broker("no large-artifact endpoint configured".into()).into());
        };

        let item_id = uuid::Uuid::new_v4().to_string();
        let pointer = artifact
            .upload(
                &self.topics.memory_shared(),
                &item_id,
                "text/markdown",
                content.as_bytes().to_vec(),
            )
            .await?;
        let pointer_value = serde_json::to_value(&pointer).unwrap_or_default();

        let payload = MemoryItemPayload {
            item_id: item_id.clone(),
            title: title.to_string(),
            author_id: self.agent_id().to_string(),
            pointer: pointer_value.clone(),
        };
        let envelope = Envelope::new(
            EnvelopeType::Memory,
            self.agent_id().to_string(),
            serde_json::to_value(&payload).unwrap_or_default(),
        );
        self.broker
            .publish(&self.topics.memory_shared(), &envelope.encode())
            .await?;

        self.ledger
            .upsert_memory_item(&item_id, self.agent_id(), title, pointer_value)
            .await?;
        tracing::info!(%item_id, title, "memory item shared");
        Ok(item_id)
    }

    /// Record and locally index a peer's shared memory item.
    pub async fn receive_memory_item(&self, payload: &MemoryItemPayload) -> Result<()> {
        self.ledger
            .upsert_memory_item(
                &payload.item_id,
                &payload.author_id,
                &payload.title,
                payload.pointer.clone(),
            )
            .await?;
        if let Some(indexer) = self.indexer.get() {
            indexer.try_enqueue(IndexJob {
                source: format!("group:{}:{}", payload.author_id, payload.item_id),
                content: payload.title.clone(),
            });
        }
        Ok(())
    }

    /// Adopt a received manifest only when its version is strictly greater.
    /// Returns true when adopted.
    pub async fn update_manifest(&self, incoming: TopicManifest) -> Result<bool> {
        {
            let current = self.manifest.read().await;
            if incoming.version <= current.version {
                tracing::debug!(
                    incoming = incoming.version,
                    current = current.version,
                    "ignoring stale manifest"
                );
                return Ok(false);
            }
        }
        self.ledger.put_manifest(&incoming).await?;
        *self.manifest.write().await = incoming;
        tracing::info!("manifest updated");
        Ok(true)
    }

    pub async fn manifest(&self) -> TopicManifest {
        self.manifest.read().await.clone()
    }

    /// Broadcast the local manifest on the roster topic, bumping its version.
    pub async fn broadcast_manifest(&self) -> Result<()> {
        let manifest = {
            let mut manifest = self.manifest.write().await;
            manifest.version += 1;
            manifest.updated_at = chrono::Utc::now().to_rfc3339();
            manifest.updated_by = self.agent_id().to_string();
            manifest.clone()
        };
        self.ledger.put_manifest(&manifest).await?;
        let envelope = Envelope::new(
            EnvelopeType::Roster,
            self.agent_id().to_string(),
            serde_json::to_value(&manifest).unwrap_or_default(),
        );
        self.broker
            .publish(&self.topics.roster(), &envelope.encode())
            .await
    }

    /// Make sure a dynamic skill topic exists: a heartbeat envelope published
    /// to a new topic name auto-creates it on the broker, and the manifest
    /// learns the new pair.
    pub async fn ensure_skill_topic(&self, skill: &str) -> Result<()> {
        let requests = self.topics.skill_requests(skill);
        let responses = self.topics.skill_responses(skill);
        let already_known = {
            let manifest = self.manifest.read().await;
            manifest.skill_topics.contains(&requests)
        };
        if already_known {
            return Ok(());
        }

        let heartbeat = self.identity_envelope(EnvelopeType::Heartbeat);
        self.broker.publish(&requests, &heartbeat.encode()).await?;
        self.broker.publish(&responses, &heartbeat.encode()).await?;

        {
            let mut manifest = self.manifest.write().await;
            manifest.skill_topics.push(requests);
            manifest.skill_topics.push(responses);
        }
        self.ledger.register_skill_channel(skill).await?;
        self.broadcast_manifest().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::broker::LoopbackBroker;

    fn config() -> GroupConfig {
        GroupConfig {
            enabled: true,
            group_name: "home".into(),
            agent_id: "agent-local".into(),
            agent_name: "local".into(),
            brokers: vec!["http://broker".into()],
            max_delegation_depth: 3,
            poll_interval_ms: 2_000,
            ..GroupConfig::default()
        }
    }

    async fn manager() -> (Arc<GroupManager>, Arc<LoopbackBroker>, Arc<Ledger>) {
        let broker = Arc::new(LoopbackBroker::new());
        let ledger = Arc::new(Ledger::open_in_memory().await.expect("ledger"));
        let manager = Arc::new(GroupManager::new(
            config(),
            broker.clone(),
            ledger.clone(),
            None,
            vec!["exec".into()],
        ));
        (manager, broker, ledger)
    }

    #[tokio::test]
    async fn join_subscribes_announces_and_records_history() {
        let (manager, broker, ledger) = manager().await;
        manager.join().await.expect("join");

        let subscribed = broker.subscribed.read().await.clone();
        assert!(subscribed.contains(&"group.home.announce".to_string()));
        assert!(subscribed.contains(&"group.home.control.onboarding".to_string()));

        let records = broker.poll().await.expect("poll");
        assert_eq!(records.len(), 1);
        let envelope = Envelope::decode(&records[0].payload).expect("decode");
        assert_eq!(envelope.kind, EnvelopeType::Announce);
        assert_eq!(envelope.sender_id, "agent-local");

        let member = ledger.get_member("agent-local").await.expect("get").expect("row");
        assert_eq!(member.status, MemberStatus::Active);
    }

    #[tokio::test]
    async fn delegation_depth_bound_is_enforced() {
        let (manager, _broker, ledger) = manager().await;

        let task_id = manager
            .submit_delegated_task("do it", None, 1, None, None, None, None)
            .await
            .expect("depth 2 fits");
        let row = ledger.get_group_task(&task_id).await.expect("get").expect("row");
        assert_eq!(row.delegation_depth, 2);

        let error = manager
            .submit_delegated_task("too deep", Some(&task_id), 3, None, None, None, None)
            .await
            .expect_err("depth 4 exceeds max 3");
        assert!(error.to_string().contains("delegation depth 4 exceeds max 3"));
    }

    #[tokio::test]
    async fn skill_submission_creates_topic_and_manifest_entry() {
        let (manager, broker, _ledger) = manager().await;

        manager
            .submit_delegated_task("search the docs", None, 0, None, None, Some("search"), None)
            .await
            .expect("submit");

        let manifest = manager.manifest().await;
        assert!(manifest
            .skill_topics
            .contains(&"group.home.skill.search.requests".to_string()));
        assert!(manifest.version > 1);

        let records = broker.poll().await.expect("poll");
        let topics: Vec<&str> = records.iter().map(|r| r.topic.as_str()).collect();
        assert!(topics.contains(&"group.home.skill.search.requests"));
        assert!(topics.contains(&"group.home.control.roster"));
    }

    #[tokio::test]
    async fn accepted_status_sets_accepted_at_and_logs_event() {
        let (manager, broker, ledger) = manager().await;
        let task_id = manager
            .submit_delegated_task("work", None, 0, None, None, None, None)
            .await
            .expect("submit");
        broker.poll().await.expect("drain");

        manager
            .report_task_status(&task_id, "accepted", "")
            .await
            .expect("accept");
        let row = ledger.get_group_task(&task_id).await.expect("get").expect("row");
        assert!(row.accepted_at.is_some());
        assert_eq!(row.status, "accepted");

        let records = broker.poll().await.expect("poll");
        assert_eq!(records[0].topic, "group.home.tasks.status");
    }

    #[tokio::test]
    async fn manifest_updates_are_monotonic() {
        let (manager, _broker, _ledger) = manager().await;

        let mut incoming = manager.manifest().await;
        incoming.version = 5;
        assert!(manager.update_manifest(incoming.clone()).await.expect("adopt"));

        incoming.version = 4;
        assert!(!manager.update_manifest(incoming.clone()).await.expect("reject stale"));

        incoming.version = 5;
        assert!(!manager.update_manifest(incoming).await.expect("reject equal"));
        assert_eq!(manager.manifest().await.version, 5);
    }
}

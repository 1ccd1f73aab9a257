//! Bridges the remote broker to the local bus.
//!
//! A single consumer task reads the subscribed topics. Every message is
//! logged to the topic message log first (own messages included, for
//! analytics); only then are own messages skipped and the rest dispatched
//! by topic.

use crate::bus::{ChannelSink, MessageBus, SendError};
use crate::error::Result;
use crate::group::envelope::{
    AgentIdentity, Envelope, MemoryItemPayload, RequestPayload, ResponsePayload,
    TaskStatusPayload, TopicKind,
};
use crate::group::manager::GroupManager;
use crate::group::broker::BrokerClient;
use crate::ledger::Ledger;
use crate::observer::{ObservationRecorder, RawObservation};
use crate::InboundMessage;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outbound sink for the synthetic `group` channel: a completed reply to a
/// peer-delegated task is reported back on the responses topic. Replies to
/// messages that were not delegated tasks (peer-reply echoes) are dropped.
pub struct GroupChannelSink {
    ledger: Arc<Ledger>,
    manager: Arc<GroupManager>,
}

impl GroupChannelSink {
    pub fn new(ledger: Arc<Ledger>, manager: Arc<GroupManager>) -> Self {
        Self { ledger, manager }
    }
}

#[async_trait]
impl ChannelSink for GroupChannelSink {
    async fn deliver(
        &self,
        message: &crate::OutboundMessage,
    ) -> std::result::Result<(), SendError> {
        let Some(task_id) = &message.task_id else {
            return Ok(());
        };
        let task = self
            .ledger
            .get_task(task_id)
            .await
            .map_err(|e| SendError::permanent(format!("unknown task: {e}")))?;

        // The delegated-task id rides the idempotency key of the synthetic
        // inbound message.
        let Some(group_task_id) = task
            .idempotency_key
            .as_deref()
            .and_then(|key| key.strip_prefix("group-task:"))
        else {
            return Ok(());
        };

        self.manager
            .report_task_status(group_task_id, "completed", &message.content)
            .await
            .map_err(|e| SendError::transient(format!("broker publish failed: {e}")))
    }
}

/// Callback invoked for orchestrator-topic envelopes.
pub type DiscoveryCallback = Box<dyn Fn(&Envelope) + Send + Sync>;

/// The group topic consumer.
pub struct GroupRouter {
    broker: Arc<dyn BrokerClient>,
    ledger: Arc<Ledger>,
    bus: Arc<MessageBus>,
    /// Non-owning handle onto the manager.
    manager: Arc<GroupManager>,
    recorder: ObservationRecorder,
    discovery: Option<DiscoveryCallback>,
    poll_backoff: std::time::Duration,
}

impl GroupRouter {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        ledger: Arc<Ledger>,
        bus: Arc<MessageBus>,
        manager: Arc<GroupManager>,
        recorder: ObservationRecorder,
    ) -> Self {
        Self {
            broker,
            ledger,
            bus,
            manager,
            recorder,
            discovery: None,
            poll_backoff: std::time::Duration::from_millis(500),
        }
    }

    pub fn with_discovery(mut self, callback: DiscoveryCallback) -> Self {
        self.discovery = Some(callback);
        self
    }

    /// Run the consumer until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("group router started");
        loop {
            let records = tokio::select! {
                _ = cancel.cancelled() => break,
                records = self.broker.poll() => records,
            };

            let records = match records {
                Ok(records) => records,
                Err(error) => {
                    tracing::warn!(%error, "broker poll failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_backoff) => continue,
                    }
                }
            };

            for record in records {
                if let Err(error) = self.handle_record(&record.topic, &record.payload).await {
                    tracing::warn!(%error, topic = %record.topic, "record handling failed");
                }
            }
        }
        tracing::info!("group router stopped");
    }

    /// Process one raw record: decode, log, skip own, dispatch.
    pub async fn handle_record(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                // Schema mismatch drops the envelope; the router continues.
                tracing::warn!(%error, topic, "dropping malformed envelope");
                return Ok(());
            }
        };

        // Log before the own-message skip so analytics sees self heartbeats.
        self.ledger
            .log_topic_message(
                topic,
                envelope.kind.as_str(),
                &envelope.correlation_id,
                &envelope.sender_id,
                envelope.payload.clone(),
            )
            .await?;

        if envelope.sender_id == self.manager.agent_id() {
            return Ok(());
        }

        match self.manager.topics().parse(topic) {
            TopicKind::Announce => self.handle_announce(&envelope).await?,
            TopicKind::Requests => self.handle_request(&envelope, None).await?,
            TopicKind::SkillRequests(skill) => {
                self.handle_request(&envelope, Some(skill)).await?;
            }
            TopicKind::Responses | TopicKind::SkillResponses(_) => {
                self.handle_response(&envelope).await?;
            }
            TopicKind::Traces => {
                self.ledger
                    .insert_group_trace(
                        envelope.kind.as_str(),
                        &envelope.correlation_id,
                        &envelope.sender_id,
                        envelope.payload.clone(),
                    )
                    .await?;
            }
            TopicKind::Onboarding => self.handle_onboarding(&envelope).await?,
            TopicKind::Roster => {
                match envelope.payload_as() {
                    Ok(manifest) => {
                        self.manager.update_manifest(manifest).await?;
                    }
                    Err(error) => {
                        tracing::warn!(%error, "dropping malformed roster payload");
                    }
                }
            }
            TopicKind::MemoryShared | TopicKind::MemoryContext => {
                match envelope.payload_as::<MemoryItemPayload>() {
                    Ok(payload) => self.manager.receive_memory_item(&payload).await?,
                    Err(error) => {
                        tracing::warn!(%error, "dropping malformed memory payload");
                    }
                }
            }
            TopicKind::Audit => {
                self.ledger
                    .insert_group_trace(
                        "AUDIT",
                        &envelope.correlation_id,
                        &envelope.sender_id,
                        envelope.payload.clone(),
                    )
                    .await?;
            }
            TopicKind::TasksStatus => {
                if let Ok(payload) = envelope.payload_as::<TaskStatusPayload>() {
                    self.recorder.try_record(RawObservation {
                        channel: "group".into(),
                        content: format!(
                            "peer {} reported task {} {}",
                            payload.agent_id, payload.task_id, payload.status
                        ),
                    });
                }
            }
            TopicKind::Orchestrator => {
                self.ledger
                    .insert_orchestrator_event(
                        &envelope.correlation_id,
                        &envelope.sender_id,
                        envelope.payload.clone(),
                    )
                    .await?;
                if let Some(discovery) = &self.discovery {
                    discovery(&envelope);
                }
            }
            TopicKind::Unknown => {
                tracing::debug!(topic, "ignoring message on unknown topic");
            }
        }

        Ok(())
    }

    /// Roster upkeep; a first-time peer gets an immediate heartbeat back so
    /// it learns about us without waiting a full interval.
    async fn handle_announce(&self, envelope: &Envelope) -> Result<()> {
        let identity: AgentIdentity = match envelope.payload_as() {
            Ok(identity) => identity,
            Err(error) => {
                tracing::warn!(%error, "dropping malformed announce payload");
                return Ok(());
            }
        };

        let first_seen = self.manager.observe_peer(&identity).await?;
        if first_seen {
            tracing::info!(peer = %identity.agent_id, "new peer announced");
            if let Err(error) = self.manager.publish_heartbeat().await {
                tracing::warn!(%error, "greeting heartbeat failed");
            }
        }
        Ok(())
    }

    /// Peer requests become synthetic inbound messages on the `group`
    /// channel, carrying the delegation metadata the agent needs.
    async fn handle_request(&self, envelope: &Envelope, skill: Option<String>) -> Result<()> {
        let payload: RequestPayload = match envelope.payload_as() {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "dropping malformed request payload");
                return Ok(());
            }
        };

        if let Some(target) = &payload.target_agent_id {
            if target != self.manager.agent_id() {
                return Ok(());
            }
        }

        let mut message = InboundMessage::new(
            "group",
            envelope.sender_id.clone(),
            format!("group:{}", self.manager.topics().group()),
            payload.content.clone(),
        );
        message.trace_id = envelope.correlation_id.clone();
        message.idempotency_key = Some(format!("group-task:{}", payload.task_id));
        message
            .metadata
            .insert("group_task_id".into(), serde_json::json!(payload.task_id));
        message
            .metadata
            .insert("requester_id".into(), serde_json::json!(envelope.sender_id));
        message.metadata.insert(
            "original_requester_id".into(),
            serde_json::json!(payload.original_requester_id),
        );
        message.metadata.insert(
            "delegation_depth".into(),
            serde_json::json!(payload.delegation_depth),
        );
        if let Some(parent) = &payload.parent_task_id {
            message
                .metadata
                .insert("parent_task_id".into(), serde_json::json!(parent));
        }
        if let Some(skill) = skill {
            message.metadata.insert("skill".into(), serde_json::json!(skill));
        }

        self.bus.publish_inbound(message).await
    }

    /// Peer replies come back as synthetic inbound messages; terminal states
    /// also land in the delegation event log.
    async fn handle_response(&self, envelope: &Envelope) -> Result<()> {
        let payload: ResponsePayload = match envelope.payload_as() {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "dropping malformed response payload");
                return Ok(());
            }
        };

        if payload.status == "completed" || payload.status == "failed" {
            self.ledger
                .log_delegation_event(
                    &payload.task_id,
                    &payload.status,
                    &envelope.sender_id,
                    Some(&payload.content),
                )
                .await?;
            self.ledger
                .close_group_task(&payload.task_id, &payload.status)
                .await?;
        }

        let mut message = InboundMessage::new(
            "group",
            envelope.sender_id.clone(),
            format!("group:{}", self.manager.topics().group()),
            format!(
                "peer {} {} task {}: {}",
                envelope.sender_id, payload.status, payload.task_id, payload.content
            ),
        );
        message.trace_id = envelope.correlation_id.clone();
        message.idempotency_key =
            Some(format!("group-response:{}:{}", payload.task_id, payload.status));
        message
            .metadata
            .insert("group_task_id".into(), serde_json::json!(payload.task_id));
        message
            .metadata
            .insert("peer_reply".into(), serde_json::json!(true));

        self.bus.publish_inbound(message).await
    }

    async fn handle_onboarding(&self, envelope: &Envelope) -> Result<()> {
        let payload = match envelope.payload_as() {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "dropping malformed onboarding payload");
                return Ok(());
            }
        };

        let manifest = self.manager.manifest().await;
        let outcome = {
            let mut onboarding = self.manager.onboarding.lock().await;
            onboarding.handle(self.manager.identity(), &manifest, envelope, payload)
        };

        for reply in outcome.replies {
            self.broker
                .publish(&self.manager.topics().onboarding(), &reply.encode())
                .await?;
        }
        if let Some(manifest) = outcome.adopt_manifest {
            self.manager.update_manifest(manifest).await?;
        }
        if outcome.joined {
            self.manager.join().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GroupConfig, ObserverConfig};
    use crate::group::broker::LoopbackBroker;
    use crate::group::envelope::{AgentRole, EnvelopeType, Topics};
    use crate::observer::Observer;
    use sqlx::Row as _;

    struct Fixture {
        router: GroupRouter,
        broker: Arc<LoopbackBroker>,
        ledger: Arc<Ledger>,
        bus: Arc<MessageBus>,
        topics: Topics,
    }

    async fn fixture() -> Fixture {
        let broker = Arc::new(LoopbackBroker::new());
        let ledger = Arc::new(Ledger::open_in_memory().await.expect("ledger"));
        let bus = Arc::new(MessageBus::new(10));
        let config = GroupConfig {
            enabled: true,
            group_name: "home".into(),
            agent_id: "agent-local".into(),
            agent_name: "local".into(),
            brokers: vec!["http://broker".into()],
            ..GroupConfig::default()
        };
        let manager = Arc::new(GroupManager::new(
            config,
            broker.clone(),
            ledger.clone(),
            None,
            vec!["exec".into()],
        ));
        let observer = Arc::new(Observer::new(ledger.clone(), ObserverConfig::default()));
        let cancel = CancellationToken::new();
        let (recorder, worker) = observer.start(cancel);
        tokio::spawn(worker);

        let router = GroupRouter::new(broker.clone(), ledger.clone(), bus.clone(), manager, recorder);
        Fixture { router, broker, ledger, bus, topics: Topics::new("home") }
    }

    fn peer_identity(id: &str) -> AgentIdentity {
        AgentIdentity {
            agent_id: id.into(),
            agent_name: id.into(),
            soul_summary: None,
            capabilities: vec!["recall".into()],
            channels: vec!["console".into()],
            model: None,
            role: AgentRole::Worker,
            status: "active".into(),
            parent_id: None,
            zone_id: None,
        }
    }

    async fn topic_log_count(ledger: &Ledger) -> i64 {
        sqlx::query("SELECT COUNT(*) AS n FROM topic_message_log")
            .fetch_one(ledger.pool())
            .await
            .expect("count")
            .get::<i64, _>("n")
    }

    #[tokio::test]
    async fn own_messages_are_logged_then_skipped() {
        let fixture = fixture().await;
        let envelope = Envelope::new(
            EnvelopeType::Heartbeat,
            "agent-local",
            serde_json::to_value(peer_identity("agent-local")).expect("payload"),
        );
        fixture
            .router
            .handle_record(&fixture.topics.announce(), &envelope.encode())
            .await
            .expect("handle");

        assert_eq!(topic_log_count(&fixture.ledger).await, 1);
        // Skipped before side effects: no roster row was written.
        assert!(fixture
            .ledger
            .get_member("agent-local")
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn first_announce_upserts_and_greets() {
        let fixture = fixture().await;
        let envelope = Envelope::new(
            EnvelopeType::Announce,
            "peer-1",
            serde_json::to_value(peer_identity("peer-1")).expect("payload"),
        );
        fixture
            .router
            .handle_record(&fixture.topics.announce(), &envelope.encode())
            .await
            .expect("handle");

        let member = fixture.ledger.get_member("peer-1").await.expect("get").expect("row");
        assert_eq!(member.agent_name, "peer-1");

        // The greeting heartbeat went out on the announce topic.
        let records = fixture.broker.poll().await.expect("poll");
        assert_eq!(records.len(), 1);
        let greeting = Envelope::decode(&records[0].payload).expect("decode");
        assert_eq!(greeting.kind, EnvelopeType::Heartbeat);
        assert_eq!(greeting.sender_id, "agent-local");
    }

    #[tokio::test]
    async fn peer_request_becomes_group_channel_inbound() {
        let fixture = fixture().await;
        let envelope = Envelope::new(
            EnvelopeType::Request,
            "peer-1",
            serde_json::json!({
                "task_id": "gt-7",
                "content": "summarize the minutes",
                "delegation_depth": 2,
                "original_requester_id": "peer-0",
            }),
        );
        fixture
            .router
            .handle_record(&fixture.topics.requests(), &envelope.encode())
            .await
            .expect("handle");

        let cancel = CancellationToken::new();
        let message = fixture.bus.consume_inbound(&cancel).await.expect("inbound");
        assert_eq!(message.channel, "group");
        assert_eq!(message.content, "summarize the minutes");
        assert_eq!(message.meta_str("requester_id"), Some("peer-1"));
        assert_eq!(
            message.metadata.get("delegation_depth").and_then(|v| v.as_u64()),
            Some(2)
        );
        assert_eq!(message.idempotency_key.as_deref(), Some("group-task:gt-7"));
    }

    #[tokio::test]
    async fn malformed_envelope_is_dropped_and_router_continues() {
        let fixture = fixture().await;
        fixture
            .router
            .handle_record(&fixture.topics.requests(), b"{not json")
            .await
            .expect("handle");
        assert_eq!(topic_log_count(&fixture.ledger).await, 0);

        // A valid record afterwards still works.
        let envelope = Envelope::new(
            EnvelopeType::Announce,
            "peer-2",
            serde_json::to_value(peer_identity("peer-2")).expect("payload"),
        );
        fixture
            .router
            .handle_record(&fixture.topics.announce(), &envelope.encode())
            .await
            .expect("handle");
        assert!(fixture.ledger.get_member("peer-2").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn completed_response_logs_delegation_event() {
        let fixture = fixture().await;
        fixture
            .ledger
            .insert_group_task("gt-9", None, 1, "agent-local", Some("peer-1"), None)
            .await
            .expect("insert");

        let envelope = Envelope::new(
            EnvelopeType::Response,
            "peer-1",
            serde_json::json!({
                "task_id": "gt-9",
                "status": "completed",
                "content": "done, here are the results",
            }),
        );
        fixture
            .router
            .handle_record(&fixture.topics.responses(), &envelope.encode())
            .await
            .expect("handle");

        let row = fixture.ledger.get_group_task("gt-9").await.expect("get").expect("row");
        assert_eq!(row.status, "completed");

        let audit = fixture.ledger.audit_view(10).await.expect("audit");
        assert!(audit
            .iter()
            .any(|r| r.source == "delegation" && r.action == "completed"));

        let cancel = CancellationToken::new();
        let message = fixture.bus.consume_inbound(&cancel).await.expect("inbound");
        assert!(message.content.contains("completed"));
    }

    #[tokio::test]
    async fn group_sink_reports_completion_to_responses_topic() {
        let broker = Arc::new(LoopbackBroker::new());
        let ledger = Arc::new(Ledger::open_in_memory().await.expect("ledger"));
        let manager = Arc::new(GroupManager::new(
            GroupConfig {
                enabled: true,
                group_name: "home".into(),
                agent_id: "agent-local".into(),
                brokers: vec!["http://broker".into()],
                ..GroupConfig::default()
            },
            broker.clone(),
            ledger.clone(),
            None,
            Vec::new(),
        ));
        ledger
            .insert_group_task("gt-42", None, 1, "peer-1", Some("agent-local"), None)
            .await
            .expect("insert");

        let task = ledger
            .create_task(crate::ledger::NewTask {
                idempotency_key: Some("group-task:gt-42".into()),
                trace_id: "corr-42".into(),
                channel: "group".into(),
                chat_id: "group:home".into(),
                thread_id: None,
                sender_id: "peer-1".into(),
                message_type: "external".into(),
                content_in: "do the thing".into(),
            })
            .await
            .expect("task");
        ledger.mark_task_processing(&task.task_id).await.expect("processing");
        ledger
            .complete_task(&task.task_id, "all done", 1, 1, None)
            .await
            .expect("complete");

        let sink = GroupChannelSink::new(ledger.clone(), manager);
        let outbound = crate::OutboundMessage {
            channel: "group".into(),
            chat_id: "group:home".into(),
            thread_id: None,
            trace_id: "corr-42".into(),
            task_id: Some(task.task_id.clone()),
            content: "all done".into(),
            media: Vec::new(),
            card: None,
        };
        sink.deliver(&outbound).await.expect("deliver");

        let records = broker.poll().await.expect("poll");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].topic, "group.home.responses");
        let envelope = Envelope::decode(&records[0].payload).expect("decode");
        assert_eq!(envelope.correlation_id, "gt-42");

        let row = ledger.get_group_task("gt-42").await.expect("get").expect("row");
        assert_eq!(row.status, "completed");
    }

    #[tokio::test]
    async fn audit_topic_persists_as_audit_trace() {
        let fixture = fixture().await;
        let envelope = Envelope::new(
            EnvelopeType::Audit,
            "peer-1",
            serde_json::json!({"action": "policy_denied", "tool": "exec"}),
        );
        fixture
            .router
            .handle_record(&fixture.topics.audit(), &envelope.encode())
            .await
            .expect("handle");

        let row = sqlx::query("SELECT trace_type FROM group_traces LIMIT 1")
            .fetch_one(fixture.ledger.pool())
            .await
            .expect("row");
        assert_eq!(row.get::<String, _>("trace_type"), "AUDIT");
    }
}

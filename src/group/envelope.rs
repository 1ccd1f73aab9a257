//! The typed JSON wire object exchanged between peer agents, and the topic
//! naming scheme it travels on.

use crate::error::{GroupError, Result};
use crate::ledger::group::TopicManifest;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

/// Envelope type tag. The payload schema is bound to the type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Announce,
    Request,
    Response,
    Trace,
    Heartbeat,
    Onboard,
    Memory,
    SkillRequest,
    SkillResponse,
    Audit,
    TaskStatus,
    Roster,
}

impl EnvelopeType {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeType::Announce => "announce",
            EnvelopeType::Request => "request",
            EnvelopeType::Response => "response",
            EnvelopeType::Trace => "trace",
            EnvelopeType::Heartbeat => "heartbeat",
            EnvelopeType::Onboard => "onboard",
            EnvelopeType::Memory => "memory",
            EnvelopeType::SkillRequest => "skill_request",
            EnvelopeType::SkillResponse => "skill_response",
            EnvelopeType::Audit => "audit",
            EnvelopeType::TaskStatus => "task_status",
            EnvelopeType::Roster => "roster",
        }
    }
}

impl std::fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The wire object: type, correlation, sender, timestamp, typed payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub correlation_id: String,
    pub sender_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(kind: EnvelopeType, sender_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            timestamp: chrono::Utc::now(),
            payload,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            GroupError::MalformedEnvelope {
                topic: String::new(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Deserialize the payload into its bound schema.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            GroupError::MalformedEnvelope {
                topic: String::new(),
                reason: format!("payload does not match {}: {e}", self.kind),
            }
            .into()
        })
    }
}

/// Role a member plays in the group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Coordinator,
    Worker,
    Observer,
    Orchestrator,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Coordinator => "coordinator",
            AgentRole::Worker => "worker",
            AgentRole::Observer => "observer",
            AgentRole::Orchestrator => "orchestrator",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "coordinator" => Some(AgentRole::Coordinator),
            "worker" => Some(AgentRole::Worker),
            "observer" => Some(AgentRole::Observer),
            "orchestrator" => Some(AgentRole::Orchestrator),
            _ => None,
        }
    }
}

/// Identity broadcast in announces and heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub agent_name: String,
    pub soul_summary: Option<String>,
    pub capabilities: Vec<String>,
    pub channels: Vec<String>,
    pub model: Option<String>,
    pub role: AgentRole,
    pub status: String,
    pub parent_id: Option<String>,
    pub zone_id: Option<String>,
}

/// Payload of `request` / `skill_request` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayload {
    pub task_id: String,
    pub content: String,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub delegation_depth: u32,
    pub original_requester_id: String,
    #[serde(default)]
    pub deadline_at: Option<String>,
    #[serde(default)]
    pub skill: Option<String>,
    #[serde(default)]
    pub target_agent_id: Option<String>,
}

/// Payload of `response` / `skill_response` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub task_id: String,
    /// `accepted`, `completed`, or `failed`.
    pub status: String,
    pub content: String,
}

/// Payload of `task_status` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusPayload {
    pub task_id: String,
    pub status: String,
    pub agent_id: String,
}

/// Onboarding handshake step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnboardAction {
    Request,
    Challenge,
    Response,
    Complete,
    Reject,
}

/// Payload of `onboard` envelopes. All steps of one handshake share the
/// initial request's correlation id; `target_id` addresses a specific agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnboardPayload {
    pub action: OnboardAction,
    #[serde(default)]
    pub identity: Option<AgentIdentity>,
    #[serde(default)]
    pub manifest: Option<TopicManifest>,
    #[serde(default)]
    pub challenge: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
}

/// Payload of `memory` envelopes: a pointer, not the content itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItemPayload {
    pub item_id: String,
    pub title: String,
    pub author_id: String,
    pub pointer: serde_json::Value,
}

/// Topic name scheme for one group.
#[derive(Debug, Clone)]
pub struct Topics {
    group: String,
}

/// Which topic a name resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    Announce,
    Requests,
    Responses,
    Traces,
    Roster,
    Onboarding,
    TasksStatus,
    Audit,
    MemoryShared,
    MemoryContext,
    Orchestrator,
    SkillRequests(String),
    SkillResponses(String),
    Unknown,
}

impl Topics {
    pub fn new(group: impl Into<String>) -> Self {
        Self { group: group.into() }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn announce(&self) -> String {
        format!("group.{}.announce", self.group)
    }

    pub fn requests(&self) -> String {
        format!("group.{}.requests", self.group)
    }

    pub fn responses(&self) -> String {
        format!("group.{}.responses", self.group)
    }

    pub fn traces(&self) -> String {
        format!("group.{}.traces", self.group)
    }

    pub fn roster(&self) -> String {
        format!("group.{}.control.roster", self.group)
    }

    pub fn onboarding(&self) -> String {
        format!("group.{}.control.onboarding", self.group)
    }

    pub fn tasks_status(&self) -> String {
        format!("group.{}.tasks.status", self.group)
    }

    pub fn audit(&self) -> String {
        format!("group.{}.observe.audit", self.group)
    }

    pub fn memory_shared(&self) -> String {
        format!("group.{}.memory.shared", self.group)
    }

    pub fn memory_context(&self) -> String {
        format!("group.{}.memory.context", self.group)
    }

    pub fn orchestrator(&self) -> String {
        format!("group.{}.orchestrator", self.group)
    }

    pub fn skill_requests(&self, skill: &str) -> String {
        format!("group.{}.skill.{skill}.requests", self.group)
    }

    pub fn skill_responses(&self, skill: &str) -> String {
        format!("group.{}.skill.{skill}.responses", self.group)
    }

    /// The fixed topic set every member subscribes to.
    pub fn core(&self) -> Vec<String> {
        vec![
            self.announce(),
            self.requests(),
            self.responses(),
            self.traces(),
            self.roster(),
            self.onboarding(),
            self.tasks_status(),
            self.audit(),
            self.memory_shared(),
            self.memory_context(),
            self.orchestrator(),
        ]
    }

    /// Classify a topic name.
    pub fn parse(&self, topic: &str) -> TopicKind {
        let prefix = format!("group.{}.", self.group);
        let Some(rest) = topic.strip_prefix(&prefix) else {
            return TopicKind::Unknown;
        };
        match rest {
            "announce" => TopicKind::Announce,
            "requests" => TopicKind::Requests,
            "responses" => TopicKind::Responses,
            "traces" => TopicKind::Traces,
            "control.roster" => TopicKind::Roster,
            "control.onboarding" => TopicKind::Onboarding,
            "tasks.status" => TopicKind::TasksStatus,
            "observe.audit" => TopicKind::Audit,
            "memory.shared" => TopicKind::MemoryShared,
            "memory.context" => TopicKind::MemoryContext,
            "orchestrator" => TopicKind::Orchestrator,
            other => {
                if let Some(skill_part) = other.strip_prefix("skill.") {
                    if let Some(skill) = skill_part.strip_suffix(".requests") {
                        return TopicKind::SkillRequests(skill.to_string());
                    }
                    if let Some(skill) = skill_part.strip_suffix(".responses") {
                        return TopicKind::SkillResponses(skill.to_string());
                    }
                }
                TopicKind::Unknown
            }
        }
    }
}

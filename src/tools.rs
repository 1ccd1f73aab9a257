//! Tools available to the agent loop.

pub mod exec;
pub mod file;
pub mod memory;
pub mod subagent;

use crate::MessageType;
use crate::error::{Result, ToolError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Integer risk category of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    /// No side effects observable outside the process.
    ReadOnly,
    /// Controlled writes (work repo, memory).
    Write,
    /// High risk (shell execution).
    HighRisk,
}

impl Tier {
    pub fn as_u8(self) -> u8 {
        match self {
            Tier::ReadOnly => 0,
            Tier::Write => 1,
            Tier::HighRisk => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Tier::ReadOnly),
            1 => Some(Tier::Write),
            2 => Some(Tier::HighRisk),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Per-call context threaded through every tool execution.
#[derive(Debug, Clone)]
pub struct ToolCtx {
    pub task_id: String,
    pub trace_id: String,
    pub sender_id: String,
    pub channel: String,
    pub chat_id: String,
    pub thread_id: Option<String>,
    pub message_type: MessageType,
    pub session_scope: String,
    pub cancel: CancellationToken,
}

/// Capability contract every tool implements.
///
/// `execute` returns user/LLM-facing text; errors are also rendered as text
/// by the agent loop so the model can decide recovery.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON-schema object describing the parameters.
    fn parameters(&self) -> serde_json::Value;

    /// Tools that do not declare a tier default to read-only.
    fn tier(&self) -> Tier {
        Tier::ReadOnly
    }

    async fn execute(&self, ctx: &ToolCtx, params: serde_json::Value) -> Result<String>;
}

/// Well-known default tool names and tiers, used for identity announcements
/// before (or without) a live registry.
pub const DEFAULT_TOOLS: &[(&str, Tier)] = &[
    ("read_file", Tier::ReadOnly),
    ("write_file", Tier::Write),
    ("edit_file", Tier::Write),
    ("list_dir", Tier::ReadOnly),
    ("resolve_path", Tier::ReadOnly),
    ("exec", Tier::HighRisk),
    ("remember", Tier::Write),
    ("recall", Tier::ReadOnly),
    ("working_memory", Tier::Write),
    ("sessions_spawn", Tier::Write),
    ("subagents", Tier::Write),
    ("agents_list", Tier::ReadOnly),
];

/// Concrete name->tool map. Registered at startup, immutable thereafter.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Registration order, kept so definitions render deterministically.
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new(), order: Vec::new() }
    }

    /// Register a tool. Names must be unique.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::Duplicate { name }.into());
        }
        self.order.push(name.clone());
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Tier for a registered tool; unknown tools map to read-only.
    pub fn tier_of(&self, name: &str) -> Tier {
        self.tools.get(name).map(|t| t.tier()).unwrap_or(Tier::ReadOnly)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Function-tool definitions in the shape the chat API consumes.
    pub fn definitions(&self) -> Vec<serde_json::Value> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.parameters(),
                    }
                })
            })
            .collect()
    }

    /// One-line-per-tool summary for the system prompt.
    pub fn summary(&self) -> String {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| format!("- {} (tier {}): {}", tool.name(), tool.tier(), tool.description()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Look up and execute a tool with caller-supplied parameters.
    pub async fn execute(
        &self,
        name: &str,
        ctx: &ToolCtx,
        params: serde_json::Value,
    ) -> Result<String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.execute(ctx, params).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) fn test_ctx() -> ToolCtx {
    ToolCtx {
        task_id: "task-test".into(),
        trace_id: "trace-test".into(),
        sender_id: "alice".into(),
        channel: "console".into(),
        chat_id: "chat-test".into(),
        thread_id: None,
        message_type: MessageType::Internal,
        session_scope: "console:alice:chat-test".into(),
        cancel: CancellationToken::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the input back"
        }

        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }

        async fn execute(&self, _ctx: &ToolCtx, params: serde_json::Value) -> Result<String> {
            Ok(params["text"].as_str().unwrap_or_default().to_string())
        }
    }

    #[tokio::test]
    async fn registry_round_trip() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).expect("register");

        let result = registry
            .execute("echo", &test_ctx(), serde_json::json!({"text": "hello"}))
            .await
            .expect("execute");
        assert_eq!(result, "hello");

        let definitions = registry.definitions();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0]["function"]["name"], "echo");

        // Undeclared tier defaults to read-only.
        assert_eq!(registry.tier_of("echo"), Tier::ReadOnly);
        assert_eq!(registry.tier_of("missing"), Tier::ReadOnly);
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).expect("register");
        let error = registry.register(Arc::new(EchoTool)).expect_err("duplicate");
        assert!(error.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn unknown_tool_errors() {
        let registry = ToolRegistry::new();
        let error = registry
            .execute("ghost", &test_ctx(), serde_json::Value::Null)
            .await
            .expect_err("missing tool");
        assert!(error.to_string().contains("tool not found"));
    }
}

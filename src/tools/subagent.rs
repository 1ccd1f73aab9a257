//! Sub-agent spawn and control tools.

use crate::error::Result;
use crate::ledger::Ledger;
use crate::subagents::{Cleanup, SpawnRequest, SubagentManager};
use crate::tools::{Tier, Tool, ToolCtx};
use async_trait::async_trait;
use std::sync::Arc;

/// Spawn a detached sub-agent session. Tier 1.
pub struct SessionsSpawnTool {
    manager: Arc<SubagentManager>,
}

impl SessionsSpawnTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SessionsSpawnTool {
    fn name(&self) -> &str {
        "sessions_spawn"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent session to work on a task in the background."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": { "type": "string", "description": "What the sub-agent should do" },
                "label": { "type": "string", "description": "Short handle for later control" },
                "model": { "type": "string" },
                "thinking": { "type": "string", "enum": ["low", "medium", "high"] },
                "cleanup": { "type": "string", "enum": ["keep", "delete"] }
            },
            "required": ["task"]
        })
    }

    fn tier(&self) -> Tier {
        Tier::Write
    }

    async fn execute(&self, ctx: &ToolCtx, params: serde_json::Value) -> Result<String> {
        let Some(task) = params.get("task").and_then(|v| v.as_str()) else {
            return Ok("error: missing required parameter 'task'".into());
        };
        let cleanup = match params.get("cleanup").and_then(|v| v.as_str()) {
            Some("delete") => Cleanup::Delete,
            _ => Cleanup::Keep,
        };

        // Depth is derived from the caller's session: a spawn from a
        // sub-session goes one level deeper.
        let depth = if ctx.session_scope.starts_with("sub:") { 2 } else { 1 };

        let request = SpawnRequest {
            parent_session: ctx.session_scope.clone(),
            root_session: ctx.session_scope.clone(),
            task: task.to_string(),
            label: params.get("label").and_then(|v| v.as_str()).map(Into::into),
            model: params.get("model").and_then(|v| v.as_str()).map(Into::into),
            thinking: params.get("thinking").and_then(|v| v.as_str()).map(Into::into),
            cleanup,
            depth,
        };

        match self.manager.register_spawn(request).await {
            Ok(run) => Ok(format!(
                "spawned sub-agent {} (session {})",
                run.run_id, run.child_session_key
            )),
            // Limit violations come back as explanatory tool-result text.
            Err(error) => Ok(format!("error: {error}")),
        }
    }
}

/// Inspect and control sub-agent runs. Tier 1.
pub struct SubagentsTool {
    manager: Arc<SubagentManager>,
}

impl SubagentsTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SubagentsTool {
    fn name(&self) -> &str {
        "subagents"
    }

    fn description(&self) -> &str {
        "List, inspect, or kill sub-agent runs. Killing cascades to descendants."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": { "type": "string", "enum": ["list", "status", "kill"] },
                "target": {
                    "type": "string",
                    "description": "Run id, recent index, label, or session key"
                }
            },
            "required": ["action"]
        })
    }

    fn tier(&self) -> Tier {
        Tier::Write
    }

    async fn execute(&self, _ctx: &ToolCtx, params: serde_json::Value) -> Result<String> {
        let action = params.get("action").and_then(|v| v.as_str()).unwrap_or("list");

        match action {
            "list" => {
                let runs = self.manager.list().await;
                if runs.is_empty() {
                    return Ok("no sub-agent runs".into());
                }
                Ok(runs
                    .iter()
                    .enumerate()
                    .map(|(i, run)| {
                        format!(
                            "{}. [{}] {} {} — {}",
                            i + 1,
                            run.status,
                            run.run_id,
                            run.label.as_deref().unwrap_or("-"),
                            run.task,
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            "status" => {
                let Some(token) = params.get("target").and_then(|v| v.as_str()) else {
                    return Ok("error: 'status' requires a target".into());
                };
                let run_id = match self.manager.resolve_target(token).await {
                    Ok(run_id) => run_id,
                    Err(error) => return Ok(format!("error: {error}")),
                };
                match self.manager.get(&run_id).await {
                    Some(run) => Ok(format!(
                        "{} [{}] depth={} task: {}{}",
                        run.run_id,
                        run.status,
                        run.depth,
                        run.task,
                        run.fail_reason
                            .as_deref()
                            .map(|r| format!(" ({r})"))
                            .unwrap_or_default(),
                    )),
                    None => Ok(format!("error: run {run_id} vanished")),
                }
            }
            "kill" => {
                let Some(token) = params.get("target").and_then(|v| v.as_str()) else {
                    return Ok("error: 'kill' requires a target".into());
                };
                let run_id = match self.manager.resolve_target(token).await {
                    Ok(run_id) => run_id,
                    Err(error) => return Ok(format!("error: {error}")),
                };
                match self.manager.kill(&run_id).await {
                    Ok(killed) => Ok(format!("killed {} run(s): {}", killed.len(), killed.join(", "))),
                    Err(error) => Ok(format!("error: {error}")),
                }
            }
            other => Ok(format!("error: unknown action '{other}'")),
        }
    }
}

/// List known peer agents from the group roster. Tier 0.
pub struct AgentsListTool {
    ledger: Arc<Ledger>,
}

impl AgentsListTool {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Tool for AgentsListTool {
    fn name(&self) -> &str {
        "agents_list"
    }

    fn description(&self) -> &str {
        "List peer agents in the group with their roles and liveness."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(&self, _ctx: &ToolCtx, _params: serde_json::Value) -> Result<String> {
        let roster = match self.ledger.roster().await {
            Ok(roster) => roster,
            Err(error) => return Ok(format!("error: failed to load roster: {error}")),
        };
        if roster.is_empty() {
            return Ok("no known peer agents".into());
        }
        Ok(roster
            .iter()
            .map(|member| {
                format!(
                    "{} ({}) role={} status={} last_seen={}",
                    member.agent_name, member.agent_id, member.role, member.status, member.last_seen,
                )
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

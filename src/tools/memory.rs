//! Memory tools: save, search, and the per-conversation scratchpad.

use crate::error::Result;
use crate::ledger::Ledger;
use crate::memory::MemoryService;
use crate::tools::{Tier, Tool, ToolCtx};
use async_trait::async_trait;
use std::sync::Arc;

/// Write a fact into semantic memory. Tier 1.
pub struct RememberTool {
    memory: Arc<MemoryService>,
}

impl RememberTool {
    pub fn new(memory: Arc<MemoryService>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for RememberTool {
    fn name(&self) -> &str {
        "remember"
    }

    fn description(&self) -> &str {
        "Save a fact to long-term memory for later recall."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "The fact to remember" }
            },
            "required": ["content"]
        })
    }

    fn tier(&self) -> Tier {
        Tier::Write
    }

    async fn execute(&self, ctx: &ToolCtx, params: serde_json::Value) -> Result<String> {
        let Some(content) = params.get("content").and_then(|v| v.as_str()) else {
            return Ok("error: missing required parameter 'content'".into());
        };
        let source = format!("chat:{}", ctx.channel);
        match self.memory.remember(&source, content).await {
            Ok(id) => Ok(format!("remembered ({id})")),
            Err(error) => Ok(format!("error: failed to save memory: {error}")),
        }
    }
}

/// Search semantic memory. Tier 0.
pub struct RecallTool {
    memory: Arc<MemoryService>,
}

impl RecallTool {
    pub fn new(memory: Arc<MemoryService>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for RecallTool {
    fn name(&self) -> &str {
        "recall"
    }

    fn description(&self) -> &str {
        "Search long-term memory and return the closest matches."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "limit": { "type": "integer", "minimum": 1, "maximum": 20 }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, _ctx: &ToolCtx, params: serde_json::Value) -> Result<String> {
        let Some(query) = params.get("query").and_then(|v| v.as_str()) else {
            return Ok("error: missing required parameter 'query'".into());
        };
        let limit = params.get("limit").and_then(|v| v.as_u64()).unwrap_or(5) as usize;

        let hits = match self.memory.recall(query, limit).await {
            Ok(hits) => hits,
            Err(error) => return Ok(format!("error: memory search failed: {error}")),
        };
        if hits.is_empty() {
            return Ok("no matching memories".into());
        }
        Ok(hits
            .iter()
            .map(|hit| format!("[{} score={:.2}] {}", hit.source, hit.score, hit.content))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

/// Update the working-memory scratchpad for the current conversation. Tier 1.
pub struct WorkingMemoryTool {
    ledger: Arc<Ledger>,
}

impl WorkingMemoryTool {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Tool for WorkingMemoryTool {
    fn name(&self) -> &str {
        "working_memory"
    }

    fn description(&self) -> &str {
        "Replace the scratchpad carried into this conversation's future turns."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "New scratchpad contents" }
            },
            "required": ["content"]
        })
    }

    fn tier(&self) -> Tier {
        Tier::Write
    }

    async fn execute(&self, ctx: &ToolCtx, params: serde_json::Value) -> Result<String> {
        let Some(content) = params.get("content").and_then(|v| v.as_str()) else {
            return Ok("error: missing required parameter 'content'".into());
        };
        match self
            .ledger
            .set_working_memory(&ctx.session_scope, ctx.thread_id.as_deref(), content)
            .await
        {
            Ok(()) => Ok("working memory updated".into()),
            Err(error) => Ok(format!("error: failed to update working memory: {error}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::StubEmbedder;
    use crate::tools::test_ctx;

    #[tokio::test]
    async fn remember_and_recall_round_trip() {
        let ledger = Arc::new(Ledger::open_in_memory().await.expect("ledger"));
        let memory = Arc::new(MemoryService::new(ledger, Arc::new(StubEmbedder)));
        let remember = RememberTool::new(memory.clone());
        let recall = RecallTool::new(memory);

        let saved = remember
            .execute(&test_ctx(), serde_json::json!({"content": "birthday is in june"}))
            .await
            .expect("remember");
        assert!(saved.starts_with("remembered"));

        let found = recall
            .execute(&test_ctx(), serde_json::json!({"query": "birthday june"}))
            .await
            .expect("recall");
        assert!(found.contains("birthday is in june"));
        assert!(found.contains("chat:console"));
    }

    #[tokio::test]
    async fn working_memory_scopes_by_session() {
        let ledger = Arc::new(Ledger::open_in_memory().await.expect("ledger"));
        let tool = WorkingMemoryTool::new(ledger.clone());

        tool.execute(&test_ctx(), serde_json::json!({"content": "draft agenda"}))
            .await
            .expect("execute");

        let stored = ledger
            .get_working_memory("console:alice:chat-test", None)
            .await
            .expect("get");
        assert_eq!(stored.as_deref(), Some("draft agenda"));
    }
}

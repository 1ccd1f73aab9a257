//! The agent loop: drives one inbound message from arrival to delivered
//! reply, mediating policy, approvals, tool execution, memory updates, and
//! audit logging. Messages are processed one at a time.

use crate::agent::commands::{self, Command};
use crate::agent::session::{SessionManager, scope_key};
use crate::approval::{ApprovalManager, ApprovalOutcome, ApprovalRequest};
use crate::bus::MessageBus;
use crate::config::{ModelConfig, PolicyConfig, SessionScope};
use crate::context::{ContextBuilder, ContextInputs};
use crate::error::Result;
use crate::ledger::{Ledger, NewTask, TaskRow};
use crate::llm::{ChatMessage, ChatProvider, TokenUsage};
use crate::memory::{IndexJob, MemoryIndexer, MemoryService};
use crate::observer::{ObservationRecorder, Observer, RawObservation};
use crate::policy::{PolicyContext, PolicyEngine};
use crate::tools::{ToolCtx, ToolRegistry};
use crate::{InboundMessage, MessageType};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// How many identical consecutive calls to the same tool abort the turn.
const TOOL_LOOP_LIMIT: usize = 3;

/// Semantic recall depth for context assembly.
const RECALL_TOP_K: usize = 5;

/// Shared dependency bundle for the agent loop.
#[derive(Clone)]
pub struct AgentDeps {
    pub bus: Arc<MessageBus>,
    pub ledger: Arc<Ledger>,
    pub registry: Arc<ToolRegistry>,
    pub policy: Arc<PolicyEngine>,
    pub approvals: Arc<ApprovalManager>,
    pub sessions: Arc<SessionManager>,
    pub context: Arc<ContextBuilder>,
    pub llm: Arc<dyn ChatProvider>,
    pub memory: Arc<MemoryService>,
    pub indexer: MemoryIndexer,
    pub observer: Arc<Observer>,
    pub recorder: ObservationRecorder,
    /// Wakes the delivery worker as soon as a task completes.
    pub delivery_nudge: Arc<Notify>,
}

/// The per-process message loop.
pub struct AgentLoop {
    deps: AgentDeps,
    model: ModelConfig,
    policy_config: PolicyConfig,
    session_scope: SessionScope,
    /// Serializes regular message processing. Fair (FIFO), so per-channel
    /// arrival order is preserved.
    pipeline: tokio::sync::Mutex<()>,
}

impl AgentLoop {
    pub fn new(
        deps: AgentDeps,
        model: ModelConfig,
        policy_config: PolicyConfig,
        session_scope: SessionScope,
    ) -> Self {
        Self { deps, model, policy_config, session_scope, pipeline: tokio::sync::Mutex::new(()) }
    }

    /// Consume inbound messages. Regular messages are processed one at a
    /// time (FIFO through the pipeline lock); approval replies bypass the
    /// lock so a turn blocked on an approval wait can still be unblocked.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!("agent loop started");
        while let Some(message) = self.deps.bus.consume_inbound(&cancel).await {
            let trace_id = message.trace_id.clone();

            let is_approval_reply = matches!(
                commands::parse(&message.content),
                Some(Command::Approve(_) | Command::Deny(_))
            );
            if is_approval_reply {
                if let Err(error) = self.process_message(&cancel, message).await {
                    tracing::error!(%error, %trace_id, "approval reply handling failed");
                }
                continue;
            }

            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _serialized = this.pipeline.lock().await;
                if let Err(error) = this.process_message(&cancel, message).await {
                    tracing::error!(%error, %trace_id, "message processing failed");
                }
            });
        }
        tracing::info!("agent loop stopped");
    }

    #[tracing::instrument(skip(self, cancel, message), fields(trace_id = %message.trace_id, channel = %message.channel))]
    async fn process_message(
        &self,
        cancel: &CancellationToken,
        message: InboundMessage,
    ) -> Result<()> {
        let ledger = &self.deps.ledger;

        // Dedup before any side effects. A terminal or in-flight task with
        // the same idempotency key means this message was already handled.
        if let Some(existing) = ledger
            .find_task_by_idempotency(
                &message.channel,
                &message.chat_id,
                message.idempotency_key.as_deref(),
            )
            .await?
        {
            ledger
                .log_event(
                    &message.trace_id,
                    Some(&existing.task_id),
                    "dedup_drop",
                    serde_json::json!({
                        "idempotency_key": message.idempotency_key,
                        "existing_status": existing.status.as_str(),
                    }),
                )
                .await?;
            tracing::debug!(
                task_id = %existing.task_id,
                "dropping duplicate message"
            );
            return Ok(());
        }

        // Classify: internal when explicitly tagged or when the sender is
        // the owner; everything else is external.
        let tagged = MessageBus::message_type(&message.metadata);
        let is_owner = self
            .policy_config
            .sender_allowlist
            .iter()
            .any(|s| s == &message.sender_id);
        let message_type = if tagged == MessageType::Internal || is_owner {
            MessageType::Internal
        } else {
            MessageType::External
        };

        let task = ledger
            .create_task(NewTask {
                idempotency_key: message.idempotency_key.clone(),
                trace_id: message.trace_id.clone(),
                channel: message.channel.clone(),
                chat_id: message.chat_id.clone(),
                thread_id: message.thread_id.clone(),
                sender_id: message.sender_id.clone(),
                message_type: message_type.as_str().to_string(),
                content_in: message.content.clone(),
            })
            .await?;

        ledger
            .log_event(
                &message.trace_id,
                Some(&task.task_id),
                "received",
                serde_json::json!({
                    "channel": message.channel,
                    "sender": message.sender_id,
                    "message_type": message_type.as_str(),
                }),
            )
            .await?;

        // In-band commands short-circuit before any LLM dispatch.
        if let Some(command) = commands::parse(&message.content) {
            let reply = self.handle_command(command).await?;
            ledger.mark_task_processing(&task.task_id).await?;
            ledger.complete_task(&task.task_id, &reply, 0, 0, None).await?;
            self.deps.delivery_nudge.notify_one();
            return Ok(());
        }

        ledger.mark_task_processing(&task.task_id).await?;

        match self.run_turn(cancel, &message, &task, message_type).await {
            Ok((final_text, usage)) => {
                ledger
                    .complete_task(
                        &task.task_id,
                        &final_text,
                        usage.prompt_tokens,
                        usage.completion_tokens,
                        Some(self.deps.llm.provider()),
                    )
                    .await?;
                ledger
                    .log_event(&message.trace_id, Some(&task.task_id), "completed", serde_json::json!({}))
                    .await?;

                // Post-processing: index the conversation pair and record an
                // observation; both are best-effort.
                self.deps.indexer.try_enqueue(IndexJob {
                    source: format!("chat:{}", message.channel),
                    content: format!("user: {}\nassistant: {final_text}", message.content),
                });
                self.deps.recorder.try_record(RawObservation {
                    channel: message.channel.clone(),
                    content: format!("{}: {}", message.sender_id, message.content),
                });

                self.deps.delivery_nudge.notify_one();
            }
            Err(error) => {
                let rendered = error.to_string();
                ledger.fail_task(&task.task_id, &rendered).await?;
                ledger
                    .log_event(
                        &message.trace_id,
                        Some(&task.task_id),
                        "failed",
                        serde_json::json!({ "error": rendered }),
                    )
                    .await?;
                tracing::warn!(task_id = %task.task_id, error = %rendered, "task failed");
            }
        }

        Ok(())
    }

    /// Handle an intercepted command and return the reply text.
    async fn handle_command(&self, command: Command) -> Result<String> {
        let ledger = &self.deps.ledger;
        match command {
            Command::Approve(id) => match self.deps.approvals.respond(&id, true).await {
                Ok(()) => Ok(format!("approval {id} approved")),
                Err(error) => Ok(format!("could not approve {id}: {error}")),
            },
            Command::Deny(id) => match self.deps.approvals.respond(&id, false).await {
                Ok(()) => Ok(format!("approval {id} denied")),
                Err(error) => Ok(format!("could not deny {id}: {error}")),
            },
            Command::Tasks => commands::render_tasks(ledger).await,
            Command::Task(prefix) => commands::render_task(ledger, &prefix).await,
            Command::Usage => commands::render_usage(ledger).await,
        }
    }

    /// The iterative LLM+tool turn. Returns the final text and token usage.
    async fn run_turn(
        &self,
        cancel: &CancellationToken,
        message: &InboundMessage,
        task: &TaskRow,
        message_type: MessageType,
    ) -> Result<(String, TokenUsage)> {
        let scope = scope_key(self.session_scope, message);
        let session = self.deps.sessions.resolve(&scope).await?;
        {
            let mut session = session.lock().await;
            session
                .metadata
                .entry("channel".into())
                .or_insert_with(|| message.channel.clone());
            session.append(ChatMessage::user(message.content.clone()));
        }

        let inputs = self.assemble_inputs(message, &scope).await;
        let system_prompt = self.deps.context.system_prompt(&inputs).await?;
        let history = {
            let session = session.lock().await;
            session.history().to_vec()
        };
        let mut messages =
            ContextBuilder::build_messages(&system_prompt, &history, &message.content);

        let tool_definitions = self.deps.registry.definitions();
        let tool_ctx = ToolCtx {
            task_id: task.task_id.clone(),
            trace_id: message.trace_id.clone(),
            sender_id: message.sender_id.clone(),
            channel: message.channel.clone(),
            chat_id: message.chat_id.clone(),
            thread_id: message.thread_id.clone(),
            message_type,
            session_scope: scope.clone(),
            cancel: cancel.child_token(),
        };

        let mut usage = TokenUsage::default();
        let mut repeat: Option<(String, String)> = None;
        let mut repeat_count = 0usize;
        let mut final_text: Option<String> = None;

        for iteration in 0..self.model.max_tool_iterations {
            let response = self
                .deps
                .llm
                .chat(cancel, &messages, &tool_definitions)
                .await?;
            usage.add(response.usage);

            self.deps
                .ledger
                .log_event(
                    &message.trace_id,
                    Some(&task.task_id),
                    "llm_call",
                    serde_json::json!({
                        "iteration": iteration,
                        "tool_calls": response.tool_calls.len(),
                    }),
                )
                .await?;

            if response.tool_calls.is_empty() {
                final_text = Some(response.content.unwrap_or_default());
                break;
            }

            messages.push(ChatMessage::assistant_tool_calls(response.tool_calls.clone()));

            for call in &response.tool_calls {
                let key = (call.name.clone(), call.arguments.clone());
                if repeat.as_ref() == Some(&key) {
                    repeat_count += 1;
                } else {
                    repeat = Some(key);
                    repeat_count = 1;
                }
                if repeat_count >= TOOL_LOOP_LIMIT {
                    return Err(anyhow::anyhow!(
                        "tool-loop: {} called {TOOL_LOOP_LIMIT} times with identical arguments",
                        call.name
                    )
                    .into());
                }

                let result = self
                    .dispatch_tool_call(cancel, message, task, message_type, &tool_ctx, call)
                    .await?;

                self.deps
                    .ledger
                    .log_event(
                        &message.trace_id,
                        Some(&task.task_id),
                        "tool_call",
                        serde_json::json!({
                            "tool": call.name,
                            "result_preview": preview(&result, 200),
                        }),
                    )
                    .await?;

                if call.name != "recall" && !result.is_empty() {
                    self.deps.indexer.try_enqueue(IndexJob {
                        source: format!("tool:{}", call.name),
                        content: preview(&result, 2000),
                    });
                }

                messages.push(ChatMessage::tool_result(call.id.clone(), result));
            }
        }

        let final_text = final_text
            .unwrap_or_else(|| "I ran out of tool iterations before finishing.".to_string());

        {
            let mut session = session.lock().await;
            session.append(ChatMessage::assistant(final_text.clone()));
            if let Err(error) = self.deps.sessions.persist(&session).await {
                tracing::warn!(%error, %scope, "failed to persist session");
            }
        }

        Ok((final_text, usage))
    }

    /// Evaluate policy, run the approval round-trip when required, and
    /// execute the tool. Denials, timeouts, and execution errors all come
    /// back as tool-result text so the model can decide recovery.
    async fn dispatch_tool_call(
        &self,
        cancel: &CancellationToken,
        message: &InboundMessage,
        task: &TaskRow,
        message_type: MessageType,
        tool_ctx: &ToolCtx,
        call: &crate::llm::ToolCall,
    ) -> Result<String> {
        let tier = self.deps.registry.tier_of(&call.name);

        let decision = self
            .deps
            .policy
            .evaluate_and_record(&PolicyContext {
                tool: &call.name,
                tier,
                sender: &message.sender_id,
                channel: &message.channel,
                message_type,
                task_id: &task.task_id,
                trace_id: &message.trace_id,
            })
            .await?;

        if !decision.allowed {
            return Ok(format!("denied: {}", decision.reason));
        }

        let arguments: serde_json::Value = match serde_json::from_str(&call.arguments) {
            Ok(value) => value,
            Err(error) => return Ok(format!("error: invalid arguments JSON: {error}")),
        };

        if decision.requires_approval {
            let approval_id = self
                .deps
                .approvals
                .create(ApprovalRequest {
                    trace_id: message.trace_id.clone(),
                    task_id: task.task_id.clone(),
                    tool: call.name.clone(),
                    tier: tier.as_u8(),
                    arguments: arguments.clone(),
                    sender: message.sender_id.clone(),
                    channel: message.channel.clone(),
                    chat_id: message.chat_id.clone(),
                    thread_id: message.thread_id.clone(),
                })
                .await?;

            match self.deps.approvals.wait(cancel, &approval_id).await? {
                ApprovalOutcome::Approved => {}
                ApprovalOutcome::Denied => return Ok("denied: approval denied".into()),
                ApprovalOutcome::Timeout => return Ok("denied: approval timeout".into()),
            }
        }

        match self.deps.registry.execute(&call.name, tool_ctx, arguments).await {
            Ok(result) => Ok(result),
            Err(error) => Ok(format!("error: {error}")),
        }
    }

    /// Gather the variable context sections. Failures degrade to empty
    /// sections rather than killing the turn.
    async fn assemble_inputs(&self, message: &InboundMessage, scope: &str) -> ContextInputs {
        let working_memory = match self
            .deps
            .ledger
            .get_working_memory(scope, message.thread_id.as_deref())
            .await
        {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(%error, "failed to read working memory");
                None
            }
        };

        let observations = match self.deps.observer.observations().await {
            Ok(observations) => observations.into_iter().map(|o| o.content).collect(),
            Err(error) => {
                tracing::warn!(%error, "failed to load observations");
                Vec::new()
            }
        };

        let recalled = match self.deps.memory.recall(&message.content, RECALL_TOP_K).await {
            Ok(hits) => hits,
            Err(error) => {
                tracing::debug!(%error, "semantic recall unavailable");
                Vec::new()
            }
        };

        ContextInputs {
            working_memory,
            observations,
            skills_summary: self.deps.registry.summary(),
            skill_notes: self.deps.context.load_skill_notes().await,
            recalled,
        }
    }
}

fn preview(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        format!("{}…", &text[..text.floor_char_boundary(max)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecConfig, ObserverConfig, SubagentsConfig};
    use crate::ledger::{ApprovalStatus, DeliveryStatus, TaskStatus};
    use crate::llm::{ChatResponse, ToolCall};
    use crate::memory::StubEmbedder;
    use crate::subagents::SubagentManager;
    use crate::tools::Tool as _;
    use sqlx::Row as _;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Scripted provider: pops queued responses, records the message lists
    /// it was called with, and falls back to a plain text reply.
    struct ScriptedProvider {
        responses: StdMutex<VecDeque<ChatResponse>>,
        calls: StdMutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<ChatResponse>) -> Self {
            Self {
                responses: StdMutex::new(responses.into()),
                calls: StdMutex::new(Vec::new()),
            }
        }

        fn text(content: &str) -> ChatResponse {
            ChatResponse {
                content: Some(content.into()),
                tool_calls: Vec::new(),
                usage: TokenUsage { prompt_tokens: 10, completion_tokens: 5 },
            }
        }

        fn tool(name: &str, arguments: serde_json::Value) -> ChatResponse {
            ChatResponse {
                content: None,
                tool_calls: vec![ToolCall {
                    id: format!("call-{}", uuid::Uuid::new_v4().simple()),
                    name: name.into(),
                    arguments: arguments.to_string(),
                }],
                usage: TokenUsage { prompt_tokens: 10, completion_tokens: 5 },
            }
        }
    }

    #[async_trait::async_trait]
    impl ChatProvider for ScriptedProvider {
        fn provider(&self) -> &str {
            "scripted"
        }

        async fn chat(
            &self,
            _cancel: &CancellationToken,
            messages: &[ChatMessage],
            _tools: &[serde_json::Value],
        ) -> crate::error::Result<ChatResponse> {
            self.calls.lock().expect("lock").push(messages.to_vec());
            Ok(self
                .responses
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Self::text("fallback")))
        }
    }

    struct Fixture {
        agent: Arc<AgentLoop>,
        ledger: Arc<Ledger>,
        provider: Arc<ScriptedProvider>,
        approvals: Arc<ApprovalManager>,
        cancel: CancellationToken,
        _dirs: (tempfile::TempDir, tempfile::TempDir),
    }

    async fn fixture(
        responses: Vec<ChatResponse>,
        policy_config: PolicyConfig,
        approval_timeout_ms: u64,
    ) -> Fixture {
        let workspace = tempfile::tempdir().expect("workspace");
        let state_dir = tempfile::tempdir().expect("state");
        let cancel = CancellationToken::new();

        let ledger = Arc::new(Ledger::open_in_memory().await.expect("ledger"));
        let bus = Arc::new(MessageBus::new(32));
        let approvals = Arc::new(
            ApprovalManager::new(ledger.clone(), bus.clone())
                .with_wait_timeout(std::time::Duration::from_millis(approval_timeout_ms)),
        );
        let memory = Arc::new(MemoryService::new(ledger.clone(), Arc::new(StubEmbedder)));
        let (indexer, indexer_worker) = MemoryIndexer::new(memory.clone(), cancel.clone());
        tokio::spawn(indexer_worker);
        let observer = Arc::new(Observer::new(ledger.clone(), ObserverConfig::default()));
        let (recorder, observer_worker) = observer.clone().start(cancel.clone());
        tokio::spawn(observer_worker);

        let subagents = Arc::new(
            SubagentManager::load(
                SubagentsConfig::default(),
                state_dir.path().join("subagents.json"),
            )
            .await
            .expect("subagents"),
        );

        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(crate::tools::exec::ExecTool::new(
                ExecConfig { timeout_secs: 5, strict_allow_list: false, restrict_to_workspace: true },
                workspace.path().to_path_buf(),
                workspace.path().to_path_buf(),
            )))
            .expect("register exec");
        registry
            .register(Arc::new(crate::tools::file::ReadFileTool))
            .expect("register read_file");
        registry
            .register(Arc::new(crate::tools::subagent::SessionsSpawnTool::new(subagents)))
            .expect("register spawn");
        let registry = Arc::new(registry);

        let provider = Arc::new(ScriptedProvider::new(responses));
        let deps = AgentDeps {
            bus,
            ledger: ledger.clone(),
            registry,
            policy: Arc::new(PolicyEngine::new(policy_config.clone(), ledger.clone())),
            approvals: approvals.clone(),
            sessions: Arc::new(SessionManager::new(state_dir.path().join("sessions"))),
            context: Arc::new(
                ContextBuilder::new(
                    "skiff",
                    workspace.path().to_path_buf(),
                    workspace.path().to_path_buf(),
                )
                .expect("context"),
            ),
            llm: provider.clone(),
            memory,
            indexer,
            observer,
            recorder,
            delivery_nudge: Arc::new(Notify::new()),
        };

        let agent = Arc::new(AgentLoop::new(
            deps,
            ModelConfig::default(),
            policy_config,
            SessionScope::Room,
        ));
        Fixture { agent, ledger, provider, approvals, cancel, _dirs: (workspace, state_dir) }
    }

    fn inbound(sender: &str, content: &str, key: Option<&str>) -> InboundMessage {
        let mut message = InboundMessage::new("console", sender, "chat-1", content);
        message.idempotency_key = key.map(Into::into);
        message
    }

    fn internal_policy() -> PolicyConfig {
        // exec (tier 2) is above the auto cap, so internal senders go
        // through approval.
        PolicyConfig { max_auto_tier: 1, external_max_tier: 0, sender_allowlist: vec!["owner".into()] }
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_produces_one_task() {
        let fixture = fixture(
            vec![ScriptedProvider::text("hello!"), ScriptedProvider::text("hello again!")],
            PolicyConfig::default(),
            100,
        )
        .await;

        for _ in 0..2 {
            fixture
                .agent
                .process_message(&fixture.cancel, inbound("owner", "hi", Some("k1")))
                .await
                .expect("process");
        }

        let tasks = fixture.ledger.recent_tasks(10).await.expect("tasks");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(tasks[0].content_out.as_deref(), Some("hello!"));
        // Only the first message reached the provider.
        assert_eq!(fixture.provider.calls.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn external_sender_high_tier_tool_is_denied() {
        // No sender allowlist: the external cap itself does the denying.
        let fixture = fixture(
            vec![
                ScriptedProvider::tool("exec", serde_json::json!({"command": "ls"})),
                ScriptedProvider::text("I couldn't run that."),
            ],
            PolicyConfig { max_auto_tier: 2, external_max_tier: 0, sender_allowlist: Vec::new() },
            100,
        )
        .await;

        fixture
            .agent
            .process_message(&fixture.cancel, inbound("stranger", "run ls for me", None))
            .await
            .expect("process");

        let tasks = fixture.ledger.recent_tasks(10).await.expect("tasks");
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(tasks[0].message_type, "external");

        // The denial came back to the model as tool-result text.
        let calls = fixture.provider.calls.lock().expect("lock");
        let followup = calls.last().expect("second call");
        let denial = followup
            .iter()
            .find(|m| m.role == crate::llm::Role::Tool)
            .expect("tool result");
        assert!(denial.content.as_deref().expect("content").contains("denied"));
        assert!(denial.content.as_deref().expect("content").contains("tier-exceeds-external-cap"));

        // One policy row, allowed = false.
        let row = sqlx::query("SELECT allowed, reason FROM policy_decisions")
            .fetch_one(fixture.ledger.pool())
            .await
            .expect("policy row");
        assert!(!row.get::<bool, _>("allowed"));
        assert_eq!(row.get::<String, _>("reason"), "tier-exceeds-external-cap");
    }

    #[tokio::test]
    async fn internal_high_tier_runs_after_approval() {
        let fixture = fixture(
            vec![
                ScriptedProvider::tool("exec", serde_json::json!({"command": "echo hi"})),
                ScriptedProvider::text("it printed hi"),
            ],
            internal_policy(),
            2_000,
        )
        .await;

        let message = inbound("owner", "echo hi please", None);
        let trace_id = message.trace_id.clone();
        let processing = {
            let agent = fixture.agent.clone();
            let cancel = fixture.cancel.clone();
            tokio::spawn(async move { agent.process_message(&cancel, message).await })
        };

        // Wait for the approval row to appear, then approve it.
        let approval_id = loop {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let row = sqlx::query("SELECT approval_id FROM approval_requests LIMIT 1")
                .fetch_optional(fixture.ledger.pool())
                .await
                .expect("query");
            if let Some(row) = row {
                break row.get::<String, _>("approval_id");
            }
        };
        fixture.approvals.respond(&approval_id, true).await.expect("approve");
        processing.await.expect("join").expect("process");

        // The command really ran: its output went back as a tool result.
        let calls = fixture.provider.calls.lock().expect("lock");
        let followup = calls.last().expect("second call");
        let result = followup
            .iter()
            .find(|m| m.role == crate::llm::Role::Tool)
            .expect("tool result");
        let text = result.content.as_deref().expect("content");
        assert!(text.starts_with("Exit code: 0"), "unexpected tool result: {text}");
        assert!(text.contains("hi"));

        // Approval, policy, and task rows share the trace id.
        let approval = fixture.ledger.get_approval(&approval_id).await.expect("approval");
        assert_eq!(approval.status, ApprovalStatus::Approved);
        assert_eq!(approval.trace_id, trace_id);
        let tasks = fixture.ledger.recent_tasks(1).await.expect("tasks");
        assert_eq!(tasks[0].trace_id, trace_id);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        let row = sqlx::query("SELECT trace_id FROM policy_decisions LIMIT 1")
            .fetch_one(fixture.ledger.pool())
            .await
            .expect("policy");
        assert_eq!(row.get::<String, _>("trace_id"), trace_id);
    }

    #[tokio::test]
    async fn approval_timeout_comes_back_as_denied_text() {
        let fixture = fixture(
            vec![
                ScriptedProvider::tool("exec", serde_json::json!({"command": "echo hi"})),
                ScriptedProvider::text("okay, not running it"),
            ],
            internal_policy(),
            50,
        )
        .await;

        fixture
            .agent
            .process_message(&fixture.cancel, inbound("owner", "run it", None))
            .await
            .expect("process");

        let calls = fixture.provider.calls.lock().expect("lock");
        let followup = calls.last().expect("second call");
        let result = followup
            .iter()
            .find(|m| m.role == crate::llm::Role::Tool)
            .expect("tool result");
        assert_eq!(result.content.as_deref(), Some("denied: approval timeout"));
    }

    #[tokio::test]
    async fn blocked_shell_command_returns_sentinel_not_exit_code() {
        let fixture = fixture(
            vec![
                ScriptedProvider::tool("exec", serde_json::json!({"command": "rm -rf /"})),
                ScriptedProvider::text("that command is blocked"),
            ],
            // Owner at auto tier 2: no approval round, straight to the guard.
            PolicyConfig { max_auto_tier: 2, external_max_tier: 0, sender_allowlist: vec!["owner".into()] },
            100,
        )
        .await;

        fixture
            .agent
            .process_message(&fixture.cancel, inbound("owner", "clean up", None))
            .await
            .expect("process");

        let calls = fixture.provider.calls.lock().expect("lock");
        let followup = calls.last().expect("second call");
        let result = followup
            .iter()
            .find(|m| m.role == crate::llm::Role::Tool)
            .expect("tool result");
        let text = result.content.as_deref().expect("content");
        assert!(text.starts_with(crate::tools::exec::BLOCKED_SENTINEL));
        assert!(!text.contains("Exit code"));
    }

    #[tokio::test]
    async fn identical_tool_calls_three_times_abort_with_tool_loop() {
        let same = || ScriptedProvider::tool("read_file", serde_json::json!({"path": "/tmp/x"}));
        let fixture = fixture(
            vec![same(), same(), same(), same()],
            PolicyConfig::default(),
            100,
        )
        .await;

        fixture
            .agent
            .process_message(&fixture.cancel, inbound("owner", "read that file", None))
            .await
            .expect("process");

        let tasks = fixture.ledger.recent_tasks(1).await.expect("tasks");
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert!(tasks[0].error.as_deref().expect("error").contains("tool-loop"));
        assert_eq!(tasks[0].delivery_status, DeliveryStatus::Skipped);
    }

    #[tokio::test]
    async fn command_interception_short_circuits_llm() {
        let fixture = fixture(Vec::new(), PolicyConfig::default(), 100).await;

        fixture
            .agent
            .process_message(&fixture.cancel, inbound("owner", "!tasks", None))
            .await
            .expect("process");

        // No LLM call happened; the reply is the task summary itself.
        assert!(fixture.provider.calls.lock().expect("lock").is_empty());
        let tasks = fixture.ledger.recent_tasks(10).await.expect("tasks");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn spawn_limit_error_is_embedded_in_tool_result() {
        let fixture = fixture(
            vec![
                ScriptedProvider::tool("sessions_spawn", serde_json::json!({"task": "a"})),
                ScriptedProvider::tool("sessions_spawn", serde_json::json!({"task": "b"})),
                ScriptedProvider::text("spawned what I could"),
            ],
            PolicyConfig::default(),
            100,
        )
        .await;

        // Drop the global cap to 1 by pre-filling: spawn one run directly.
        // (The second spawn through the loop must come back as error text.)
        let spawn_tool = crate::tools::subagent::SessionsSpawnTool::new(Arc::new(
            SubagentManager::load(
                SubagentsConfig { max_concurrent: 0, ..SubagentsConfig::default() },
                fixture._dirs.1.path().join("other.json"),
            )
            .await
            .expect("manager"),
        ));
        let text = spawn_tool
            .execute(&crate::tools::test_ctx(), serde_json::json!({"task": "x"}))
            .await
            .expect("execute");
        assert!(text.starts_with("error:"));
    }
}

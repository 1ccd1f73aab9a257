//! Skiff binary: wire the runtime together and run until interrupted.

use clap::{Parser, Subcommand};
use skiff::agent::runner::{AgentDeps, AgentLoop};
use skiff::agent::session::SessionManager;
use skiff::approval::ApprovalManager;
use skiff::bus::MessageBus;
use skiff::config::Config;
use skiff::context::ContextBuilder;
use skiff::delivery::{DeliveryWorker, LedgerDeliveryReporter};
use skiff::error::{ConfigError, Result};
use skiff::group::broker::{BrokerClient, HttpBrokerClient, LargeArtifactClient};
use skiff::group::{GroupManager, GroupRouter};
use skiff::ledger::Ledger;
use skiff::llm::{ChatProvider, LlmClient};
use skiff::memory::{HttpEmbedder, MemoryIndexer, MemoryService};
use skiff::observer::Observer;
use skiff::policy::PolicyEngine;
use skiff::settings::SettingsStore;
use skiff::subagents::SubagentManager;
use skiff::tools::ToolRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Parser)]
#[command(name = "skiff", version, about = "Personal AI-assistant runtime")]
struct Cli {
    /// Config file path (defaults to the user config location).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the assistant (default).
    Run,
    /// Print the resolved configuration file path and exit.
    ConfigPath,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Some(Command::ConfigPath)) {
        println!("{}", Config::default_config_path().display());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    let _log_guard = init_tracing(&config);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "skiff starting");

    run(config).await?;
    Ok(())
}

/// Console + rolling file logging.
fn init_tracing(config: &Config) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(config.log_dir(), "skiff.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();
    guard
}

async fn run(config: Config) -> Result<()> {
    let cancel = CancellationToken::new();

    // Ledger first: everything durable hangs off it.
    let ledger = Arc::new(Ledger::open(&config.ledger_path()).await?);
    let settings = Arc::new(SettingsStore::load(ledger.clone()).await?);

    let work_repo = settings
        .get()
        .work_repo_path
        .clone()
        .unwrap_or_else(|| config.paths.work_repo.clone());
    std::fs::create_dir_all(&config.paths.workspace)?;
    std::fs::create_dir_all(&work_repo)?;

    let bus = Arc::new(MessageBus::default());

    // Startup sweeps: stale approvals time out, orphaned sub-agent runs fail.
    let approvals = Arc::new(ApprovalManager::new(ledger.clone(), bus.clone()));
    approvals.startup_sweep().await?;
    let subagents = Arc::new(
        SubagentManager::load(config.subagents.clone(), config.subagent_state_path()).await?,
    );
    subagents.archive_sweep().await?;

    // LLM provider: first configured provider wins; "openai" is the
    // conventional name for any OpenAI-compatible endpoint.
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(120))
        .build()
        .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {e}")))?;

    let (provider_name, provider) = config
        .providers
        .get_key_value("openai")
        .or_else(|| config.providers.iter().next())
        .ok_or_else(|| ConfigError::MissingKey("providers".into()))?;

    let llm: Arc<dyn ChatProvider> = Arc::new(LlmClient::new(
        http.clone(),
        provider_name.clone(),
        provider.base_url.clone(),
        provider.api_key.clone(),
        config.model.name.clone(),
        config.model.max_tokens,
        config.model.temperature,
    ));

    let embedder = Arc::new(HttpEmbedder::new(
        http.clone(),
        provider.base_url.clone(),
        provider.api_key.clone(),
        "text-embedding-3-small",
    ));
    let memory = Arc::new(MemoryService::new(ledger.clone(), embedder));
    let (indexer, indexer_worker) = MemoryIndexer::new(memory.clone(), cancel.clone());
    tokio::spawn(indexer_worker);

    let observer = Arc::new(Observer::new(ledger.clone(), config.observer.clone()));
    let (recorder, observer_worker) = observer.clone().start(cancel.clone());
    tokio::spawn(observer_worker);

    // Tool registry: registered at startup, immutable thereafter.
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(skiff::tools::file::ReadFileTool))?;
    registry.register(Arc::new(skiff::tools::file::WriteFileTool::new(work_repo.clone())))?;
    registry.register(Arc::new(skiff::tools::file::EditFileTool::new(work_repo.clone())))?;
    registry.register(Arc::new(skiff::tools::file::ListDirTool))?;
    registry.register(Arc::new(skiff::tools::file::ResolvePathTool::new(work_repo.clone())))?;
    registry.register(Arc::new(skiff::tools::exec::ExecTool::new(
        config.exec.clone(),
        config.paths.workspace.clone(),
        work_repo.clone(),
    )))?;
    registry.register(Arc::new(skiff::tools::memory::RememberTool::new(memory.clone())))?;
    registry.register(Arc::new(skiff::tools::memory::RecallTool::new(memory.clone())))?;
    registry.register(Arc::new(skiff::tools::memory::WorkingMemoryTool::new(ledger.clone())))?;
    registry.register(Arc::new(skiff::tools::subagent::SessionsSpawnTool::new(subagents.clone())))?;
    registry.register(Arc::new(skiff::tools::subagent::SubagentsTool::new(subagents.clone())))?;
    registry.register(Arc::new(skiff::tools::subagent::AgentsListTool::new(ledger.clone())))?;
    let registry = Arc::new(registry);

    let policy = Arc::new(PolicyEngine::new(config.policy.clone(), ledger.clone()));
    let sessions = Arc::new(SessionManager::new(config.sessions_dir()));
    let context = Arc::new(ContextBuilder::new(
        config.group.agent_name.clone(),
        config.paths.workspace.clone(),
        work_repo.clone(),
    )?);

    // Outbound dispatcher + delivery worker.
    let reporter = Arc::new(LedgerDeliveryReporter::new(ledger.clone()));
    {
        let bus = bus.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { bus.dispatch_outbound(cancel, reporter).await });
    }
    let delivery_nudge = Arc::new(Notify::new());
    {
        let worker = DeliveryWorker::new(
            ledger.clone(),
            bus.clone(),
            settings.clone(),
            delivery_nudge.clone(),
        );
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await });
    }

    // Console channel.
    bus.subscribe(skiff::console::CHANNEL, Arc::new(skiff::console::ConsoleSink)).await;
    {
        let bus = bus.clone();
        let cancel = cancel.clone();
        let sender = config
            .policy
            .sender_allowlist
            .first()
            .cloned()
            .unwrap_or_else(|| "operator".into());
        tokio::spawn(async move {
            if let Err(error) = skiff::console::run_stdin_loop(bus, sender, cancel).await {
                tracing::warn!(%error, "console loop ended");
            }
        });
    }

    // Group fabric, when enabled (and not overridden off at runtime).
    let group_active = settings.get().group_active.unwrap_or(config.group.enabled);
    if group_active {
        let broker: Arc<dyn BrokerClient> = Arc::new(HttpBrokerClient::new(
            http.clone(),
            config.group.brokers.clone(),
            config.group.broker_user.clone(),
            config.group.broker_password.clone(),
            config.group.consumer_group.clone(),
        ));
        let artifact = config.group.large_artifact_url.as_ref().map(|url| {
            LargeArtifactClient::new(http.clone(), url.clone(), config.group.broker_password.clone())
        });
        let tool_names = registry.names().map(String::from).collect();
        let manager = Arc::new(GroupManager::new(
            config.group.clone(),
            broker.clone(),
            ledger.clone(),
            artifact,
            tool_names,
        ));
        manager.set_memory_indexer(indexer.clone());
        manager.join().await?;

        {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.heartbeat_loop(cancel).await });
        }
        {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.stale_sweep_loop(cancel).await });
        }
        bus.subscribe(
            "group",
            Arc::new(skiff::group::router::GroupChannelSink::new(
                ledger.clone(),
                manager.clone(),
            )),
        )
        .await;
        {
            let router = GroupRouter::new(
                broker,
                ledger.clone(),
                bus.clone(),
                manager,
                recorder.clone(),
            );
            let cancel = cancel.clone();
            tokio::spawn(async move { router.run(cancel).await });
        }
    }

    // The agent loop runs in the foreground task.
    let deps = AgentDeps {
        bus: bus.clone(),
        ledger: ledger.clone(),
        registry,
        policy,
        approvals,
        sessions,
        context,
        llm,
        memory,
        indexer,
        observer,
        recorder,
        delivery_nudge,
    };
    let agent = Arc::new(AgentLoop::new(
        deps,
        config.model.clone(),
        config.policy.clone(),
        config.session_scope,
    ));

    let loop_cancel = cancel.clone();
    let agent_task = tokio::spawn(async move { agent.run(loop_cancel).await });

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown requested");
    cancel.cancel();
    agent_task.await.ok();

    Ok(())
}

//! Configuration loading and validation.
//!
//! Precedence: `SKIFF_*` environment variables, then the JSON config file at
//! the user config path, then built-in defaults. Runtime-mutable settings
//! (work repo, group toggle, silent mode) live in the ledger settings table
//! and override these where noted.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "SKIFF_";

/// Skiff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory (ledger, sessions, logs).
    pub data_dir: PathBuf,

    pub paths: PathsConfig,
    pub model: ModelConfig,
    /// Per-provider base URL and API key, keyed by provider name.
    pub providers: HashMap<String, ProviderConfig>,
    pub gateway: GatewayConfig,
    pub exec: ExecConfig,
    pub group: GroupConfig,
    pub policy: PolicyConfig,
    pub subagents: SubagentsConfig,
    pub observer: ObserverConfig,
    /// Session-scope policy: "room" (default), "thread", or "user".
    pub session_scope: SessionScope,
}

/// Workspace path layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root workspace holding soul files, skills, and scratch space.
    pub workspace: PathBuf,
    /// Repository the write tools are confined to.
    pub work_repo: PathBuf,
    /// Read-only system repository (templates, defaults).
    pub system_repo: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            workspace: home.join("skiff"),
            work_repo: home.join("skiff").join("work"),
            system_repo: None,
        }
    }
}

/// Model selection and completion limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Upper bound on LLM+tool iterations per message.
    pub max_tool_iterations: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "gpt-4.1".into(),
            max_tokens: 4096,
            temperature: 0.7,
            max_tool_iterations: 20,
        }
    }
}

/// A single LLM provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

/// Local gateway surface (API + dashboard are external collaborators; only
/// the bind parameters live here).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub api_port: u16,
    pub dashboard_port: u16,
    pub auth_token: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            api_port: 8471,
            dashboard_port: 8472,
            auth_token: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

/// Shell execution guard settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Wall-clock bound for one command.
    pub timeout_secs: u64,
    /// When true only a small read-only/VCS prefix set is runnable.
    pub strict_allow_list: bool,
    /// When true the working directory must resolve inside the workspace or
    /// work repo.
    pub restrict_to_workspace: bool,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            strict_allow_list: false,
            restrict_to_workspace: true,
        }
    }
}

/// Multi-agent group fabric settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub enabled: bool,
    pub group_name: String,
    /// Stable identity within the group. Defaults to a generated id.
    pub agent_id: String,
    pub agent_name: String,
    pub consumer_group: String,
    /// Broker bridge endpoints.
    pub brokers: Vec<String>,
    pub broker_user: Option<String>,
    pub broker_password: Option<String>,
    /// Large-artifact upload endpoint for payloads exceeding topic limits.
    pub large_artifact_url: Option<String>,
    /// "open" or "gated".
    pub onboard_mode: OnboardMode,
    pub max_delegation_depth: u32,
    /// Broker poll cadence. Heartbeats run at 15x this interval.
    pub poll_interval_ms: u64,
    pub role: String,
    pub zone_id: Option<String>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group_name: "default".into(),
            agent_id: format!("agent-{}", uuid::Uuid::new_v4().simple()),
            agent_name: "skiff".into(),
            consumer_group: "skiff".into(),
            brokers: Vec::new(),
            broker_user: None,
            broker_password: None,
            large_artifact_url: None,
            onboard_mode: OnboardMode::Open,
            max_delegation_depth: 3,
            poll_interval_ms: 2_000,
            role: "worker".into(),
            zone_id: None,
        }
    }
}

/// Group onboarding handshake policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnboardMode {
    /// New members are admitted on request.
    Open,
    /// New members must answer a capability challenge first.
    Gated,
}

/// Tool authorization policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Highest tier internal messages may run without approval.
    pub max_auto_tier: u8,
    /// Highest tier external messages may run at all.
    pub external_max_tier: u8,
    /// Senders treated as the owner. Empty means no sender restriction.
    pub sender_allowlist: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_auto_tier: 2,
            external_max_tier: 0,
            sender_allowlist: Vec::new(),
        }
    }
}

/// Sub-agent spawn limits and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubagentsConfig {
    pub max_spawn_depth: u32,
    pub max_children: usize,
    pub max_concurrent: usize,
    /// Finished runs stay resolvable for this long.
    pub archive_after_minutes: i64,
    /// Run registry state file. Defaults under data_dir when unset.
    pub state_path: Option<PathBuf>,
}

impl Default for SubagentsConfig {
    fn default() -> Self {
        Self {
            max_spawn_depth: 3,
            max_children: 5,
            max_concurrent: 8,
            archive_after_minutes: 60,
            state_path: None,
        }
    }
}

/// Observation compression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    pub enabled: bool,
    /// Queued raw observations that trigger a compression pass.
    pub message_threshold: usize,
    /// Cap on retained compressed observations.
    pub max_observations: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            message_threshold: 20,
            max_observations: 50,
        }
    }
}

/// Conversation-history isolation key shape.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionScope {
    /// `{channel}:{account}:{room}`
    Room,
    /// `{channel}:{account}:{room}:{thread}`
    Thread,
    /// `{channel}:{account}:{room}:{user}`
    User,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .map(|d| d.join("skiff"))
                .unwrap_or_else(|| PathBuf::from("./data")),
            paths: PathsConfig::default(),
            model: ModelConfig::default(),
            providers: HashMap::new(),
            gateway: GatewayConfig::default(),
            exec: ExecConfig::default(),
            group: GroupConfig::default(),
            policy: PolicyConfig::default(),
            subagents: SubagentsConfig::default(),
            observer: ObserverConfig::default(),
            session_scope: SessionScope::Room,
        }
    }
}

impl Config {
    /// Well-known user-scoped config file path.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("skiff").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("./skiff-config.json"))
    }

    /// Load configuration from the default path plus environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::default_config_path())
    }

    /// Load from a specific file path. A missing file falls back to defaults;
    /// a malformed file is a fatal error.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            serde_json::from_str(&raw).map_err(|e| ConfigError::Load {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
        } else {
            Config::default()
        };

        config.apply_env();
        config.validate()?;

        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("failed to create data directory: {}", config.data_dir.display()))?;

        Ok(config)
    }

    /// Apply `SKIFF_*` environment overrides on top of file values.
    fn apply_env(&mut self) {
        if let Some(v) = env_var("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("WORKSPACE") {
            self.paths.workspace = PathBuf::from(v);
        }
        if let Some(v) = env_var("WORK_REPO") {
            self.paths.work_repo = PathBuf::from(v);
        }
        if let Some(v) = env_var("MODEL") {
            self.model.name = v;
        }
        if let Some(v) = env_var("MAX_TOKENS").and_then(|v| v.parse().ok()) {
            self.model.max_tokens = v;
        }
        if let Some(v) = env_var("MAX_TOOL_ITERATIONS").and_then(|v| v.parse().ok()) {
            self.model.max_tool_iterations = v;
        }
        if let Some(v) = env_var("OPENAI_BASE_URL") {
            let entry = self
                .providers
                .entry("openai".into())
                .or_insert_with(|| ProviderConfig {
                    base_url: String::new(),
                    api_key: None,
                });
            entry.base_url = v;
        }
        if let Some(v) = env_var("OPENAI_API_KEY") {
            let entry = self
                .providers
                .entry("openai".into())
                .or_insert_with(|| ProviderConfig {
                    base_url: "https://api.openai.com/v1".into(),
                    api_key: None,
                });
            entry.api_key = Some(v);
        }
        if let Some(v) = env_var("EXEC_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.exec.timeout_secs = v;
        }
        if let Some(v) = env_var("EXEC_STRICT_ALLOW_LIST").and_then(|v| parse_bool(&v)) {
            self.exec.strict_allow_list = v;
        }
        if let Some(v) = env_var("GROUP_ENABLED").and_then(|v| parse_bool(&v)) {
            self.group.enabled = v;
        }
        if let Some(v) = env_var("GROUP_NAME") {
            self.group.group_name = v;
        }
        if let Some(v) = env_var("AGENT_ID") {
            self.group.agent_id = v;
        }
        if let Some(v) = env_var("BROKERS") {
            self.group.brokers = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(v) = env_var("MAX_AUTO_TIER").and_then(|v| v.parse().ok()) {
            self.policy.max_auto_tier = v;
        }
        if let Some(v) = env_var("EXTERNAL_MAX_TIER").and_then(|v| v.parse().ok()) {
            self.policy.external_max_tier = v;
        }
        if let Some(v) = env_var("SENDER_ALLOWLIST") {
            self.policy.sender_allowlist =
                v.split(',').map(|s| s.trim().to_string()).collect();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.model.max_tool_iterations == 0 {
            return Err(ConfigError::Invalid("max_tool_iterations must be at least 1".into()).into());
        }
        if self.group.enabled && self.group.brokers.is_empty() {
            return Err(ConfigError::MissingKey("group.brokers".into()).into());
        }
        if self.policy.external_max_tier > self.policy.max_auto_tier {
            return Err(ConfigError::Invalid(
                "external_max_tier may not exceed max_auto_tier".into(),
            )
            .into());
        }
        Ok(())
    }

    /// Ledger database path.
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("skiff.db")
    }

    /// Session JSONL directory.
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Sub-agent run registry state file.
    pub fn subagent_state_path(&self) -> PathBuf {
        self.subagents
            .state_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("subagents.json"))
    }

    /// Log directory for the rolling file appender.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{suffix}")).ok().filter(|v| !v.is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.policy.max_auto_tier, 2);
        assert_eq!(config.policy.external_max_tier, 0);
        assert_eq!(config.model.max_tool_iterations, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_values_survive_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let data_dir = dir.path().join("data");
        std::fs::write(
            &path,
            serde_json::json!({
                "data_dir": data_dir,
                "model": { "name": "test-model" },
                "policy": { "external_max_tier": 0, "max_auto_tier": 1 }
            })
            .to_string(),
        )
        .expect("write config");

        let config = Config::load_from_path(&path).expect("config should load");
        assert_eq!(config.model.name, "test-model");
        assert_eq!(config.policy.max_auto_tier, 1);
        // Unset groups fall back to defaults.
        assert_eq!(config.exec.timeout_secs, 60);
    }

    #[test]
    fn group_enabled_requires_brokers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "data_dir": dir.path().join("data"),
                "group": { "enabled": true }
            })
            .to_string(),
        )
        .expect("write config");

        let error = Config::load_from_path(&path).expect_err("must fail without brokers");
        assert!(error.to_string().contains("group.brokers"));
    }
}

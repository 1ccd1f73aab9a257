//! Top-level error types for Skiff.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Group(#[from] GroupError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Ledger (SQLite) connection and operation errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("failed to open ledger: {0}")]
    Open(String),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("invalid task status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("approval {id} is already {status}")]
    ApprovalTerminal { id: String, status: String },

    #[error("row not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// LLM provider and completion errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("missing API key for provider: {0}")]
    MissingProviderKey(String),

    #[error("provider request failed: {0}")]
    ProviderRequest(String),

    #[error("provider returned status {status}: {body}")]
    ProviderStatus { status: u16, body: String },

    #[error("embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("could not parse completion response: {0}")]
    CompletionParse(String),

    #[error("completion cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Tool registration and execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("tool {name} already registered")]
    Duplicate { name: String },

    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("tool {tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("tool execution cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Group fabric (broker, router, membership) errors.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("broker request failed: {0}")]
    Broker(String),

    #[error("malformed envelope on {topic}: {reason}")]
    MalformedEnvelope { topic: String, reason: String },

    #[error("delegation depth {depth} exceeds max {max}")]
    DelegationDepthExceeded { depth: u32, max: u32 },

    #[error("subagent limit reached: {0}")]
    SubagentLimit(String),

    #[error("ambiguous subagent target '{token}': matches {candidates}")]
    AmbiguousTarget { token: String, candidates: String },

    #[error("no subagent run matches '{0}'")]
    TargetNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LlmError {
    /// Whether a failed provider call is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::ProviderRequest(_) => true,
            LlmError::ProviderStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

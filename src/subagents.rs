//! Sub-agent run registry: spawn limits, cascade kill, JSON persistence.
//!
//! Runs persist to a single JSON state file. On restart any run that never
//! ended is marked failed, because the process that owned it is gone.

use crate::config::SubagentsConfig;
use crate::error::{GroupError, Result};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// Lifecycle of one sub-agent run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Accepted,
    Running,
    Completed,
    Failed,
    Killed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Accepted => "accepted",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Killed => "killed",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Accepted | RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happens to the child session when the run ends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Cleanup {
    #[default]
    Keep,
    Delete,
}

/// One registered sub-agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentRun {
    pub run_id: String,
    pub parent_session: String,
    pub root_session: String,
    pub child_session_key: String,
    pub task: String,
    pub label: Option<String>,
    pub model: Option<String>,
    pub thinking: Option<String>,
    #[serde(default)]
    pub cleanup: Cleanup,
    pub status: RunStatus,
    pub depth: u32,
    #[serde(default)]
    pub announced: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub fail_reason: Option<String>,
}

/// Input for registering a spawn.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub parent_session: String,
    pub root_session: String,
    pub task: String,
    pub label: Option<String>,
    pub model: Option<String>,
    pub thinking: Option<String>,
    pub cleanup: Cleanup,
    pub depth: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    runs: Vec<SubagentRun>,
}

/// Registry enforcing spawn depth, children-per-parent, and global
/// concurrency caps.
pub struct SubagentManager {
    config: SubagentsConfig,
    state_path: PathBuf,
    runs: RwLock<HashMap<String, SubagentRun>>,
}

impl SubagentManager {
    /// Load state from disk. Any run still active belongs to a previous
    /// process and is marked failed.
    pub async fn load(config: SubagentsConfig, state_path: PathBuf) -> Result<Self> {
        let mut runs = HashMap::new();
        if state_path.exists() {
            let raw = tokio::fs::read_to_string(&state_path)
                .await
                .with_context(|| format!("failed to read {}", state_path.display()))?;
            let state: StateFile = serde_json::from_str(&raw).unwrap_or_default();
            let now = chrono::Utc::now();
            for mut run in state.runs {
                if run.status.is_active() {
                    run.status = RunStatus::Failed;
                    run.finished_at = Some(now);
                    run.fail_reason = Some("restarted before completion".into());
                    tracing::info!(run_id = %run.run_id, "marked orphaned run failed");
                }
                runs.insert(run.run_id.clone(), run);
            }
        }

        let manager = Self { config, state_path, runs: RwLock::new(runs) };
        manager.persist().await?;
        Ok(manager)
    }

    /// Register a new run after checking every limit.
    pub async fn register_spawn(&self, request: SpawnRequest) -> Result<SubagentRun> {
        if request.depth > self.config.max_spawn_depth {
            return Err(GroupError::SubagentLimit(format!(
                "spawn depth {} exceeds max {}",
                request.depth, self.config.max_spawn_depth
            ))
            .into());
        }

        let mut runs = self.runs.write().await;

        let active_total = runs.values().filter(|r| r.status.is_active()).count();
        if active_total >= self.config.max_concurrent {
            return Err(GroupError::SubagentLimit(format!(
                "{active_total} runs already active (max {})",
                self.config.max_concurrent
            ))
            .into());
        }

        let siblings = runs
            .values()
            .filter(|r| r.status.is_active() && r.parent_session == request.parent_session)
            .count();
        if siblings >= self.config.max_children {
            return Err(GroupError::SubagentLimit(format!(
                "parent already has {siblings} active children (max {})",
                self.config.max_children
            ))
            .into());
        }

        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let run = SubagentRun {
            run_id: run_id.clone(),
            parent_session: request.parent_session,
            root_session: request.root_session,
            child_session_key: format!("sub:{run_id}"),
            task: request.task,
            label: request.label,
            model: request.model,
            thinking: request.thinking,
            cleanup: request.cleanup,
            status: RunStatus::Accepted,
            depth: request.depth,
            announced: false,
            created_at: chrono::Utc::now(),
            finished_at: None,
            fail_reason: None,
        };
        runs.insert(run_id, run.clone());
        drop(runs);

        self.persist().await?;
        tracing::info!(run_id = %run.run_id, depth = run.depth, "sub-agent run registered");
        Ok(run)
    }

    pub async fn mark_running(&self, run_id: &str) -> Result<()> {
        {
            let mut runs = self.runs.write().await;
            let run = runs
                .get_mut(run_id)
                .ok_or_else(|| GroupError::TargetNotFound(run_id.to_string()))?;
            run.status = RunStatus::Running;
        }
        self.persist().await
    }

    pub async fn mark_finished(
        &self,
        run_id: &str,
        status: RunStatus,
        reason: Option<String>,
    ) -> Result<()> {
        {
            let mut runs = self.runs.write().await;
            let run = runs
                .get_mut(run_id)
                .ok_or_else(|| GroupError::TargetNotFound(run_id.to_string()))?;
            run.status = status;
            run.finished_at = Some(chrono::Utc::now());
            run.fail_reason = reason;
        }
        self.persist().await
    }

    pub async fn mark_announced(&self, run_id: &str) -> Result<()> {
        {
            let mut runs = self.runs.write().await;
            if let Some(run) = runs.get_mut(run_id) {
                run.announced = true;
            }
        }
        self.persist().await
    }

    /// Kill a run and every transitive descendant, depth-first. Returns the
    /// killed run ids, target first.
    pub async fn kill(&self, run_id: &str) -> Result<Vec<String>> {
        let mut killed = Vec::new();
        {
            let mut runs = self.runs.write().await;
            if !runs.contains_key(run_id) {
                return Err(GroupError::TargetNotFound(run_id.to_string()).into());
            }

            let mut stack = vec![run_id.to_string()];
            let now = chrono::Utc::now();
            while let Some(current) = stack.pop() {
                let child_key = match runs.get(&current) {
                    Some(run) => run.child_session_key.clone(),
                    None => continue,
                };
                let children: Vec<String> = runs
                    .values()
                    .filter(|r| r.parent_session == child_key && r.status.is_active())
                    .map(|r| r.run_id.clone())
                    .collect();
                stack.extend(children);

                if let Some(run) = runs.get_mut(&current) {
                    if run.status.is_active() {
                        run.status = RunStatus::Killed;
                        run.finished_at = Some(now);
                    }
                    killed.push(current);
                }
            }
        }
        self.persist().await?;
        tracing::info!(count = killed.len(), "killed sub-agent subtree");
        Ok(killed)
    }

    /// Drop finished runs older than the archive window.
    pub async fn archive_sweep(&self) -> Result<u64> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::minutes(self.config.archive_after_minutes);
        let removed = {
            let mut runs = self.runs.write().await;
            let before = runs.len();
            runs.retain(|_, run| {
                run.status.is_active() || run.finished_at.map(|t| t > cutoff).unwrap_or(true)
            });
            (before - runs.len()) as u64
        };
        if removed > 0 {
            self.persist().await?;
            tracing::debug!(count = removed, "archived finished sub-agent runs");
        }
        Ok(removed)
    }

    pub async fn get(&self, run_id: &str) -> Option<SubagentRun> {
        self.runs.read().await.get(run_id).cloned()
    }

    /// All runs, newest first.
    pub async fn list(&self) -> Vec<SubagentRun> {
        let mut runs: Vec<SubagentRun> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    /// Resolve a user-supplied target token to a run id. Tried in order:
    /// exact run id, numeric index over recent runs (1 = newest), exact
    /// label, label prefix, run-id prefix, child-session key. Ambiguous
    /// prefixes are an explicit error.
    pub async fn resolve_target(&self, token: &str) -> Result<String> {
        let runs = self.list().await;

        if let Some(run) = runs.iter().find(|r| r.run_id == token) {
            return Ok(run.run_id.clone());
        }

        if let Ok(index) = token.parse::<usize>() {
            if index >= 1 && index <= runs.len() {
                return Ok(runs[index - 1].run_id.clone());
            }
            return Err(GroupError::TargetNotFound(token.to_string()).into());
        }

        if let Some(run) = runs
            .iter()
            .find(|r| r.label.as_deref() == Some(token))
        {
            return Ok(run.run_id.clone());
        }

        let label_matches: Vec<&SubagentRun> = runs
            .iter()
            .filter(|r| r.label.as_deref().map(|l| l.starts_with(token)).unwrap_or(false))
            .collect();
        match label_matches.len() {
            1 => return Ok(label_matches[0].run_id.clone()),
            n if n > 1 => {
                return Err(GroupError::AmbiguousTarget {
                    token: token.to_string(),
                    candidates: label_matches
                        .iter()
                        .filter_map(|r| r.label.clone())
                        .collect::<Vec<_>>()
                        .join(", "),
                }
                .into());
            }
            _ => {}
        }

        let id_matches: Vec<&SubagentRun> =
            runs.iter().filter(|r| r.run_id.starts_with(token)).collect();
        match id_matches.len() {
            1 => return Ok(id_matches[0].run_id.clone()),
            n if n > 1 => {
                return Err(GroupError::AmbiguousTarget {
                    token: token.to_string(),
                    candidates: id_matches
                        .iter()
                        .map(|r| r.run_id.clone())
                        .collect::<Vec<_>>()
                        .join(", "),
                }
                .into());
            }
            _ => {}
        }

        if let Some(run) = runs.iter().find(|r| r.child_session_key == token) {
            return Ok(run.run_id.clone());
        }

        Err(GroupError::TargetNotFound(token.to_string()).into())
    }

    async fn persist(&self) -> Result<()> {
        let state = StateFile { runs: self.runs.read().await.values().cloned().collect() };
        let raw = serde_json::to_string_pretty(&state)
            .with_context(|| "failed to serialize sub-agent state")?;

        if let Some(parent) = self.state_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.state_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.state_path)
            .await
            .with_context(|| format!("failed to replace {}", self.state_path.display()))?;
        Ok(())
    }
}

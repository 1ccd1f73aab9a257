//! Shell execution tool behind a layered guard.
//!
//! Guard order: strict allow-list (when enabled), deny-pattern pass,
//! traversal check, working-directory containment. Nothing reaches the OS
//! until every stage passes.

use crate::config::ExecConfig;
use crate::error::Result;
use crate::tools::{Tier, Tool, ToolCtx};
use async_trait::async_trait;
use regex::RegexBuilder;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::process::Command;

/// Stable refusal prefix. Tests and operators match on this.
pub const BLOCKED_SENTINEL: &str = "command blocked by safety guard";

/// Case-insensitive command prefixes runnable in strict allow-list mode.
/// Read-only inspection and VCS tools only.
const ALLOW_PREFIXES: &[&str] = &[
    "ls", "cat", "head", "tail", "grep", "rg", "wc", "pwd", "echo", "which", "file", "stat",
    "du", "df", "ps", "env", "date", "uname", "git status", "git log", "git diff", "git show",
    "git branch", "git remote",
];

/// Destructive command patterns. Matched case-insensitively against the raw
/// command line before any process is spawned.
static DENY_PATTERNS: LazyLock<Vec<regex::Regex>> = LazyLock::new(|| {
    [
        // Destructive deletion
        r"\brm\s+(-[a-z]*\s+)*-[a-z]*r[a-z]*f",
        r"\brm\s+(-[a-z]*\s+)*-[a-z]*f[a-z]*r",
        r"\brm\s+-r\b.*\s+(/|\.)(\s|$)",
        r"\brm\s+(-[a-z]+\s+)*\*",
        r"\bgit\s+rm\b",
        r"\bfind\b.*-delete\b",
        // Disk destruction
        r"\bdd\b.*\bof=/dev/",
        r"\bmkfs\b",
        r"\bfdisk\b",
        r"\bformat\b\s+[a-z]?:?",
        // Device redirection (writing to block devices)
        r">\s*/dev/(sd|hd|nvme|mmcblk)",
        // Permission bombs on / or home
        r"\bchmod\s+([0-7]+|[ugoa+rwx-]+)\s+(/|~)(\s|$)",
        r"\bchown\s+\S+\s+(/|~)(\s|$)",
        // Fork bomb
        r":\s*\(\s*\)\s*\{.*\|.*&.*\}\s*;?\s*:",
        // Shutdown and friends
        r"\b(shutdown|reboot|halt|poweroff)\b",
        r"\binit\s+[06]\b",
        r"\bsystemctl\s+(stop|disable|mask|halt|poweroff|reboot)\b",
    ]
    .iter()
    .map(|pattern| {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .unwrap_or_else(|e| panic!("invalid deny pattern {pattern}: {e}"))
    })
    .collect()
});

/// Why the guard refused a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    Allowed,
    NotOnAllowList,
    DenyPattern(String),
    Traversal,
    WorkingDirOutsideWorkspace(String),
}

/// Apply every guard stage to `command` with the resolved working directory.
pub fn guard_command(
    config: &ExecConfig,
    workspace: &Path,
    work_repo: &Path,
    command: &str,
    working_dir: &Path,
) -> GuardVerdict {
    let trimmed = command.trim();

    if config.strict_allow_list {
        let lowered = trimmed.to_ascii_lowercase();
        let allowed = ALLOW_PREFIXES.iter().any(|prefix| {
            lowered.starts_with(prefix)
                && lowered[prefix.len()..]
                    .chars()
                    .next()
                    .map(|c| c.is_whitespace())
                    .unwrap_or(true)
        });
        if !allowed {
            return GuardVerdict::NotOnAllowList;
        }
    }

    for pattern in DENY_PATTERNS.iter() {
        if pattern.is_match(trimmed) {
            return GuardVerdict::DenyPattern(pattern.as_str().to_string());
        }
    }

    if trimmed.contains("../") || trimmed.contains("..\\") {
        return GuardVerdict::Traversal;
    }

    if config.restrict_to_workspace {
        let resolved = working_dir
            .canonicalize()
            .unwrap_or_else(|_| working_dir.to_path_buf());
        let workspace = workspace.canonicalize().unwrap_or_else(|_| workspace.to_path_buf());
        let work_repo = work_repo.canonicalize().unwrap_or_else(|_| work_repo.to_path_buf());
        if !resolved.starts_with(&workspace) && !resolved.starts_with(&work_repo) {
            return GuardVerdict::WorkingDirOutsideWorkspace(resolved.display().to_string());
        }
    }

    GuardVerdict::Allowed
}

/// Shell command execution. Tier 2.
pub struct ExecTool {
    config: ExecConfig,
    workspace: PathBuf,
    work_repo: PathBuf,
}

impl ExecTool {
    pub fn new(config: ExecConfig, workspace: PathBuf, work_repo: PathBuf) -> Self {
        Self { config, workspace, work_repo }
    }

    async fn run_guarded(&self, command: &str, working_dir: Option<&str>, ctx: &ToolCtx) -> String {
        let working_dir = working_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| self.work_repo.clone());

        match guard_command(&self.config, &self.workspace, &self.work_repo, command, &working_dir) {
            GuardVerdict::Allowed => {}
            GuardVerdict::NotOnAllowList => {
                return format!("{BLOCKED_SENTINEL}: not on the strict allow-list");
            }
            GuardVerdict::DenyPattern(_) => {
                return format!("{BLOCKED_SENTINEL}: destructive pattern");
            }
            GuardVerdict::Traversal => {
                return format!("{BLOCKED_SENTINEL}: path traversal");
            }
            GuardVerdict::WorkingDirOutsideWorkspace(dir) => {
                return format!("{BLOCKED_SENTINEL}: working directory {dir} is outside the workspace");
            }
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let timeout = std::time::Duration::from_secs(self.config.timeout_secs);
        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return "command cancelled".to_string();
            }
            output = tokio::time::timeout(timeout, cmd.output()) => output,
        };

        match output {
            Err(_) => format!(
                "command timed out after {}s and was killed",
                self.config.timeout_secs
            ),
            Ok(Err(e)) => format!("error: failed to spawn command: {e}"),
            Ok(Ok(output)) => {
                let mut rendered = String::new();
                let code = output.status.code().unwrap_or(-1);
                rendered.push_str(&format!("Exit code: {code}\n"));
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stdout.is_empty() {
                    rendered.push_str("\nSTDOUT:\n");
                    rendered.push_str(&stdout);
                }
                if !stderr.is_empty() {
                    rendered.push_str("\nSTDERR:\n");
                    rendered.push_str(&stderr);
                }
                rendered
            }
        }
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Run a shell command inside the workspace. Destructive commands are refused."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Shell command line" },
                "working_dir": { "type": "string", "description": "Optional working directory" }
            },
            "required": ["command"]
        })
    }

    fn tier(&self) -> Tier {
        Tier::HighRisk
    }

    async fn execute(&self, ctx: &ToolCtx, params: serde_json::Value) -> Result<String> {
        let Some(command) = params.get("command").and_then(|v| v.as_str()) else {
            return Ok("error: missing required parameter 'command'".into());
        };
        let working_dir = params.get("working_dir").and_then(|v| v.as_str());
        Ok(self.run_guarded(command, working_dir, ctx).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_ctx;

    fn open_config() -> ExecConfig {
        ExecConfig { timeout_secs: 5, strict_allow_list: false, restrict_to_workspace: true }
    }

    fn verdict(command: &str) -> GuardVerdict {
        let dir = std::env::temp_dir();
        guard_command(&open_config(), &dir, &dir, command, &dir)
    }

    #[test]
    fn deny_corpus_is_refused() {
        let corpus = [
            "rm -rf /",
            "rm -fr /home",
            "sudo rm -rf --no-preserve-root /",
            "rm -r .",
            "rm *",
            "git rm -r src",
            "find . -name '*.log' -delete",
            "dd if=/dev/zero of=/dev/sda",
            "mkfs.ext4 /dev/sda1",
            "fdisk /dev/sda",
            "chmod 777 /",
            "chown nobody /",
            ":(){ :|:& };:",
            "shutdown -h now",
            "reboot",
            "halt",
            "init 0",
            "systemctl stop sshd",
            "systemctl disable firewalld",
        ];
        for command in corpus {
            assert!(
                matches!(verdict(command), GuardVerdict::DenyPattern(_)),
                "expected deny for: {command}"
            );
        }
    }

    #[test]
    fn benign_commands_pass() {
        for command in ["ls -la", "cat Cargo.toml", "git status", "echo hello", "grep -r fn src"] {
            assert_eq!(verdict(command), GuardVerdict::Allowed, "expected allow for: {command}");
        }
    }

    #[test]
    fn traversal_is_refused() {
        assert_eq!(verdict("cat ../../etc/passwd"), GuardVerdict::Traversal);
        assert_eq!(verdict("type ..\\..\\secrets.txt"), GuardVerdict::Traversal);
    }

    #[test]
    fn strict_allow_list_blocks_everything_else() {
        let config = ExecConfig { strict_allow_list: true, ..open_config() };
        let dir = std::env::temp_dir();
        assert_eq!(
            guard_command(&config, &dir, &dir, "ls -la", &dir),
            GuardVerdict::Allowed
        );
        assert_eq!(
            guard_command(&config, &dir, &dir, "git status", &dir),
            GuardVerdict::Allowed
        );
        assert_eq!(
            guard_command(&config, &dir, &dir, "curl http://example.com", &dir),
            GuardVerdict::NotOnAllowList
        );
        // Prefix must end on a word boundary.
        assert_eq!(
            guard_command(&config, &dir, &dir, "lsblk", &dir),
            GuardVerdict::NotOnAllowList
        );
    }

    #[test]
    fn working_dir_outside_workspace_is_refused() {
        let workspace = tempfile::tempdir().expect("tempdir");
        let config = open_config();
        let verdict = guard_command(
            &config,
            workspace.path(),
            workspace.path(),
            "ls",
            Path::new("/"),
        );
        assert!(matches!(verdict, GuardVerdict::WorkingDirOutsideWorkspace(_)));
    }

    #[tokio::test]
    async fn blocked_command_reports_sentinel_without_spawning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = ExecTool::new(open_config(), dir.path().to_path_buf(), dir.path().to_path_buf());

        let result = tool
            .execute(&test_ctx(), serde_json::json!({"command": "rm -rf /"}))
            .await
            .expect("execute");
        assert!(result.starts_with(BLOCKED_SENTINEL));
        assert!(!result.contains("Exit code"));
    }

    #[tokio::test]
    async fn successful_command_reports_exit_code_and_stdout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = ExecTool::new(open_config(), dir.path().to_path_buf(), dir.path().to_path_buf());

        let result = tool
            .execute(&test_ctx(), serde_json::json!({"command": "echo hi"}))
            .await
            .expect("execute");
        assert!(result.starts_with("Exit code: 0"));
        assert!(result.contains("hi"));
    }

    #[tokio::test]
    async fn timeout_yields_distinct_message() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ExecConfig { timeout_secs: 1, ..open_config() };
        let tool = ExecTool::new(config, dir.path().to_path_buf(), dir.path().to_path_buf());

        let result = tool
            .execute(&test_ctx(), serde_json::json!({"command": "sleep 5"}))
            .await
            .expect("execute");
        assert!(result.contains("timed out after 1s"));
    }
}

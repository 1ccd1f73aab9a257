//! Filesystem tools: reads anywhere, writes confined to the work repo.

use crate::error::Result;
use crate::tools::{Tier, Tool, ToolCtx};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if raw == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(raw)
}

/// Resolve `raw` against `root` and verify containment. Rejects traversal
/// lexically, then through a canonical-path prefix test so symlinks can't
/// escape either. Returns the absolute path to operate on.
pub fn resolve_in_root(root: &Path, raw: &str) -> std::result::Result<PathBuf, String> {
    let expanded = expand_tilde(raw);
    let joined = if expanded.is_absolute() { expanded } else { root.join(expanded) };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => return Err(format!("path escapes allowed root: {raw}")),
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }

    let canonical_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let check_target = if normalized.exists() {
        normalized.canonicalize().map_err(|e| format!("cannot resolve {raw}: {e}"))?
    } else {
        // The file may not exist yet; anchor the check on the nearest
        // existing ancestor.
        let parent = normalized.parent().unwrap_or(&normalized);
        match parent.canonicalize() {
            Ok(parent) => parent.join(normalized.file_name().unwrap_or_default()),
            Err(_) => normalized.clone(),
        }
    };

    if !check_target.starts_with(&canonical_root) {
        return Err(format!("path escapes allowed root: {raw}"));
    }
    Ok(normalized)
}

/// Read a file's contents. Tier 0: any readable path is fair game.
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file's contents. Accepts absolute paths and ~ expansion."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path to read" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, _ctx: &ToolCtx, params: serde_json::Value) -> Result<String> {
        let Some(raw) = params.get("path").and_then(|v| v.as_str()) else {
            return Ok("error: missing required parameter 'path'".into());
        };
        let path = expand_tilde(raw);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(format!("error: file not found: {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Ok(format!("error: permission denied: {}", path.display()))
            }
            Err(e) => Ok(format!("error: failed to read {}: {e}", path.display())),
        }
    }
}

/// Write a file inside the work repo. Tier 1.
pub struct WriteFileTool {
    work_repo: PathBuf,
}

impl WriteFileTool {
    pub fn new(work_repo: PathBuf) -> Self {
        Self { work_repo }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file inside the work repository."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the work repo" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        })
    }

    fn tier(&self) -> Tier {
        Tier::Write
    }

    async fn execute(&self, _ctx: &ToolCtx, params: serde_json::Value) -> Result<String> {
        let Some(raw) = params.get("path").and_then(|v| v.as_str()) else {
            return Ok("error: missing required parameter 'path'".into());
        };
        let content = params.get("content").and_then(|v| v.as_str()).unwrap_or_default();

        let path = match resolve_in_root(&self.work_repo, raw) {
            Ok(path) => path,
            Err(reason) => return Ok(format!("error: {reason}")),
        };

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Ok(format!("error: failed to create {}: {e}", parent.display()));
            }
        }
        match tokio::fs::write(&path, content).await {
            Ok(()) => Ok(format!("wrote {} bytes to {}", content.len(), path.display())),
            Err(e) => Ok(format!("error: failed to write {}: {e}", path.display())),
        }
    }
}

/// String-replace edit within the work repo. Tier 1.
pub struct EditFileTool {
    work_repo: PathBuf,
}

impl EditFileTool {
    pub fn new(work_repo: PathBuf) -> Self {
        Self { work_repo }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace an exact text fragment in a file inside the work repository."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "old_text": { "type": "string" },
                "new_text": { "type": "string" }
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    fn tier(&self) -> Tier {
        Tier::Write
    }

    async fn execute(&self, _ctx: &ToolCtx, params: serde_json::Value) -> Result<String> {
        let Some(raw) = params.get("path").and_then(|v| v.as_str()) else {
            return Ok("error: missing required parameter 'path'".into());
        };
        let Some(old_text) = params.get("old_text").and_then(|v| v.as_str()) else {
            return Ok("error: missing required parameter 'old_text'".into());
        };
        let new_text = params.get("new_text").and_then(|v| v.as_str()).unwrap_or_default();

        let path = match resolve_in_root(&self.work_repo, raw) {
            Ok(path) => path,
            Err(reason) => return Ok(format!("error: {reason}")),
        };

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => return Ok(format!("error: failed to read {}: {e}", path.display())),
        };

        if !content.contains(old_text) {
            return Ok(format!("error: old_text not found in {}", path.display()));
        }
        let updated = content.replacen(old_text, new_text, 1);
        match tokio::fs::write(&path, updated).await {
            Ok(()) => Ok(format!("edited {}", path.display())),
            Err(e) => Ok(format!("error: failed to write {}: {e}", path.display())),
        }
    }
}

/// Directory listing. Tier 0.
pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List entries in a directory."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, _ctx: &ToolCtx, params: serde_json::Value) -> Result<String> {
        let Some(raw) = params.get("path").and_then(|v| v.as_str()) else {
            return Ok("error: missing required parameter 'path'".into());
        };
        let path = expand_tilde(raw);

        let mut reader = match tokio::fs::read_dir(&path).await {
            Ok(reader) => reader,
            Err(e) => return Ok(format!("error: failed to list {}: {e}", path.display())),
        };

        let mut lines = Vec::new();
        while let Ok(Some(entry)) = reader.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let suffix = match entry.file_type().await {
                Ok(t) if t.is_dir() => "/",
                _ => "",
            };
            lines.push(format!("{name}{suffix}"));
        }
        lines.sort();
        if lines.is_empty() {
            Ok(format!("{} is empty", path.display()))
        } else {
            Ok(lines.join("\n"))
        }
    }
}

/// Well-known locations inside the work repo. Tier 0.
pub struct ResolvePathTool {
    work_repo: PathBuf,
}

impl ResolvePathTool {
    pub fn new(work_repo: PathBuf) -> Self {
        Self { work_repo }
    }

    const KINDS: &'static [&'static str] = &["notes", "drafts", "exports", "scratch"];
}

#[async_trait]
impl Tool for ResolvePathTool {
    fn name(&self) -> &str {
        "resolve_path"
    }

    fn description(&self) -> &str {
        "Resolve the canonical path for a well-known file kind in the work repository."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "kind": { "type": "string", "enum": Self::KINDS },
                "filename": { "type": "string" }
            },
            "required": ["kind", "filename"]
        })
    }

    async fn execute(&self, _ctx: &ToolCtx, params: serde_json::Value) -> Result<String> {
        let kind = params.get("kind").and_then(|v| v.as_str()).unwrap_or_default();
        let filename = params.get("filename").and_then(|v| v.as_str()).unwrap_or_default();

        if !Self::KINDS.contains(&kind) {
            return Ok(format!(
                "error: unknown kind '{kind}', expected one of: {}",
                Self::KINDS.join(", ")
            ));
        }
        if filename.is_empty() || filename.contains('/') || filename.contains('\\') {
            return Ok("error: filename must be a bare name".into());
        }
        Ok(self.work_repo.join(kind).join(filename).display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_ctx;

    #[tokio::test]
    async fn read_missing_file_returns_typed_error_string() {
        let result = ReadFileTool
            .execute(&test_ctx(), serde_json::json!({"path": "/definitely/not/here.txt"}))
            .await
            .expect("execute");
        assert!(result.starts_with("error: file not found"));
    }

    #[tokio::test]
    async fn write_rejects_traversal_out_of_work_repo() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = WriteFileTool::new(dir.path().to_path_buf());

        let result = tool
            .execute(
                &test_ctx(),
                serde_json::json!({"path": "../outside.txt", "content": "nope"}),
            )
            .await
            .expect("execute");
        assert!(result.contains("escapes allowed root"));
        assert!(!dir.path().parent().expect("parent").join("outside.txt").exists());
    }

    #[tokio::test]
    async fn write_then_edit_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let write = WriteFileTool::new(dir.path().to_path_buf());
        let edit = EditFileTool::new(dir.path().to_path_buf());

        write
            .execute(
                &test_ctx(),
                serde_json::json!({"path": "notes/a.txt", "content": "hello world"}),
            )
            .await
            .expect("write");

        let result = edit
            .execute(
                &test_ctx(),
                serde_json::json!({"path": "notes/a.txt", "old_text": "world", "new_text": "there"}),
            )
            .await
            .expect("edit");
        assert!(result.starts_with("edited"));

        let content = std::fs::read_to_string(dir.path().join("notes/a.txt")).expect("read");
        assert_eq!(content, "hello there");
    }

    #[tokio::test]
    async fn edit_fails_when_old_text_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.txt"), "abc").expect("seed");
        let edit = EditFileTool::new(dir.path().to_path_buf());

        let result = edit
            .execute(
                &test_ctx(),
                serde_json::json!({"path": "a.txt", "old_text": "zzz", "new_text": "y"}),
            )
            .await
            .expect("edit");
        assert!(result.contains("old_text not found"));
    }

    #[tokio::test]
    async fn resolve_path_joins_known_kinds() {
        let tool = ResolvePathTool::new(PathBuf::from("/work"));
        let result = tool
            .execute(&test_ctx(), serde_json::json!({"kind": "notes", "filename": "x.md"}))
            .await
            .expect("execute");
        assert_eq!(result, "/work/notes/x.md");

        let result = tool
            .execute(&test_ctx(), serde_json::json!({"kind": "secrets", "filename": "x"}))
            .await
            .expect("execute");
        assert!(result.starts_with("error: unknown kind"));
    }
}

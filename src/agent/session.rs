//! Conversation sessions: scope keys, bounded history, JSONL persistence.
//!
//! A session file is one JSONL document: the first line is a metadata map,
//! every following line one chat message.

use crate::config::SessionScope;
use crate::error::Result;
use crate::llm::ChatMessage;
use crate::InboundMessage;
use anyhow::Context as _;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default cap on retained messages per session.
pub const DEFAULT_MAX_HISTORY: usize = 80;

/// Build the stable session-scope key for a message.
///
/// Default shape is `{channel}:{account}:{room}`; the thread and user
/// variants append one more segment. The account segment comes from channel
/// metadata and falls back to `default`.
pub fn scope_key(policy: SessionScope, message: &InboundMessage) -> String {
    let account = message.meta_str("account").unwrap_or("default");
    let base = format!("{}:{}:{}", message.channel, account, message.chat_id);
    match policy {
        SessionScope::Room => base,
        SessionScope::Thread => match &message.thread_id {
            Some(thread) => format!("{base}:{thread}"),
            None => base,
        },
        SessionScope::User => format!("{base}:{}", message.sender_id),
    }
}

/// One conversation's bounded history.
pub struct Session {
    pub key: String,
    pub metadata: HashMap<String, String>,
    messages: Vec<ChatMessage>,
    max_history: usize,
}

impl Session {
    fn new(key: String, max_history: usize) -> Self {
        Self { key, metadata: HashMap::new(), messages: Vec::new(), max_history }
    }

    pub fn append(&mut self, message: ChatMessage) {
        self.messages.push(message);
        if self.messages.len() > self.max_history {
            let excess = self.messages.len() - self.max_history;
            self.messages.drain(..excess);
        }
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }
}

/// Loads, caches, and persists sessions keyed by scope.
pub struct SessionManager {
    dir: PathBuf,
    max_history: usize,
    cache: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionManager {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, max_history: DEFAULT_MAX_HISTORY, cache: Mutex::new(HashMap::new()) }
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    /// Get or load the session for a scope key.
    pub async fn resolve(&self, key: &str) -> Result<Arc<Mutex<Session>>> {
        let mut cache = self.cache.lock().await;
        if let Some(session) = cache.get(key) {
            return Ok(session.clone());
        }

        let mut session = Session::new(key.to_string(), self.max_history);
        let path = self.session_path(key);
        if path.exists() {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read session {}", path.display()))?;
            let mut lines = raw.lines();
            if let Some(first) = lines.next() {
                session.metadata = serde_json::from_str(first).unwrap_or_default();
            }
            for line in lines {
                match serde_json::from_str::<ChatMessage>(line) {
                    Ok(message) => session.append(message),
                    Err(error) => {
                        tracing::warn!(%error, key, "skipping malformed session line");
                    }
                }
            }
        }

        let session = Arc::new(Mutex::new(session));
        cache.insert(key.to_string(), session.clone());
        Ok(session)
    }

    /// Write a session back to its JSONL file.
    pub async fn persist(&self, session: &Session) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let mut out = String::new();
        out.push_str(
            &serde_json::to_string(&session.metadata)
                .with_context(|| "failed to serialize session metadata")?,
        );
        out.push('\n');
        for message in session.history() {
            out.push_str(
                &serde_json::to_string(message)
                    .with_context(|| "failed to serialize session message")?,
            );
            out.push('\n');
        }

        let path = self.session_path(&session.key);
        tokio::fs::write(&path, out)
            .await
            .with_context(|| format!("failed to write session {}", path.display()))?;
        Ok(())
    }

    fn session_path(&self, key: &str) -> PathBuf {
        // Scope keys contain ':' which is unfriendly to filesystems.
        let safe: String = key
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(channel: &str, sender: &str, chat: &str, thread: Option<&str>) -> InboundMessage {
        let mut m = InboundMessage::new(channel, sender, chat, "hi");
        m.thread_id = thread.map(Into::into);
        m
    }

    #[test]
    fn scope_key_variants() {
        let m = message("console", "alice", "room-1", Some("th-7"));
        assert_eq!(scope_key(SessionScope::Room, &m), "console:default:room-1");
        assert_eq!(scope_key(SessionScope::Thread, &m), "console:default:room-1:th-7");
        assert_eq!(scope_key(SessionScope::User, &m), "console:default:room-1:alice");

        let no_thread = message("console", "alice", "room-1", None);
        assert_eq!(scope_key(SessionScope::Thread, &no_thread), "console:default:room-1");
    }

    #[test]
    fn history_is_bounded() {
        let mut session = Session::new("k".into(), 3);
        for i in 0..5 {
            session.append(ChatMessage::user(format!("m{i}")));
        }
        let contents: Vec<&str> = session
            .history()
            .iter()
            .filter_map(|m| m.content.as_deref())
            .collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn jsonl_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::new(dir.path().to_path_buf());

        {
            let session = manager.resolve("console:default:room-1").await.expect("resolve");
            let mut session = session.lock().await;
            session.metadata.insert("channel".into(), "console".into());
            session.append(ChatMessage::user("hello"));
            session.append(ChatMessage::assistant("hi there"));
            manager.persist(&session).await.expect("persist");
        }

        // Fresh manager forces a disk load.
        let manager = SessionManager::new(dir.path().to_path_buf());
        let session = manager.resolve("console:default:room-1").await.expect("resolve");
        let session = session.lock().await;
        assert_eq!(session.metadata.get("channel").map(String::as_str), Some("console"));
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.history()[1].content.as_deref(), Some("hi there"));
    }
}

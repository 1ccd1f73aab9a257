//! System prompt assembly.
//!
//! Sections are concatenated in a fixed order: runtime identity, soul files,
//! working memory, observations, skills, semantic recall. The first four are
//! stable across turns of a conversation so providers can cache the prefix;
//! recall and history vary per turn.

use crate::error::Result;
use crate::llm::{ChatMessage, Role};
use crate::memory::MemoryHit;
use anyhow::Context as _;
use minijinja::{Environment, context};
use std::path::PathBuf;

/// Canonical ordered soul/bootstrap file list loaded from the workspace.
pub const SOUL_FILES: &[&str] = &["SOUL.md", "IDENTITY.md", "USER.md", "AGENTS.md"];

const SYSTEM_TEMPLATE: &str = r#"You are {{ agent_name }}, a personal assistant runtime v{{ version }}.
Today is {{ date }}.
Workspace: {{ workspace }}
Work repo: {{ work_repo }}
{%- if soul %}

{{ soul }}
{%- endif %}
{%- if working_memory %}

## Working memory
{{ working_memory }}
{%- endif %}
{%- if observations %}

## Recent observations
{%- for observation in observations %}
- {{ observation }}
{%- endfor %}
{%- endif %}
{%- if skills %}

## Tools
{{ skills }}
{%- endif %}
{%- if recalled %}

## Relevant memories
{%- for memory in recalled %}
- [{{ memory.source }}] {{ memory.content }}
{%- endfor %}
{%- endif %}
"#;

/// Per-turn variable inputs.
#[derive(Debug, Default)]
pub struct ContextInputs {
    pub working_memory: Option<String>,
    pub observations: Vec<String>,
    pub skills_summary: String,
    pub skill_notes: Vec<String>,
    pub recalled: Vec<MemoryHit>,
}

/// Assembles system prompts and the final message list.
pub struct ContextBuilder {
    agent_name: String,
    workspace: PathBuf,
    work_repo: PathBuf,
    env: Environment<'static>,
}

impl ContextBuilder {
    pub fn new(agent_name: impl Into<String>, workspace: PathBuf, work_repo: PathBuf) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .with_context(|| "failed to compile system prompt template")?;
        Ok(Self { agent_name: agent_name.into(), workspace, work_repo, env })
    }

    /// Read the soul files that exist, in canonical order.
    async fn load_soul(&self) -> String {
        let mut sections = Vec::new();
        for name in SOUL_FILES {
            let path = self.workspace.join(name);
            match tokio::fs::read_to_string(&path).await {
                Ok(content) if !content.trim().is_empty() => {
                    sections.push(content.trim_end().to_string());
                }
                _ => {}
            }
        }
        sections.join("\n\n")
    }

    /// Load optional skill markdown from the workspace `skills/` directory.
    pub async fn load_skill_notes(&self) -> Vec<String> {
        let skills_dir = self.workspace.join("skills");
        let mut notes = Vec::new();
        let Ok(mut reader) = tokio::fs::read_dir(&skills_dir).await else {
            return notes;
        };
        let mut paths = Vec::new();
        while let Ok(Some(entry)) = reader.next_entry().await {
            let path = entry.path();
            if path.extension().map(|e| e == "md").unwrap_or(false) {
                paths.push(path);
            }
        }
        paths.sort();
        for path in paths {
            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                notes.push(content.trim_end().to_string());
            }
        }
        notes
    }

    /// Render the full system prompt.
    pub async fn system_prompt(&self, inputs: &ContextInputs) -> Result<String> {
        let soul = self.load_soul().await;

        let mut skills = inputs.skills_summary.clone();
        if !inputs.skill_notes.is_empty() {
            skills.push_str("\n\n");
            skills.push_str(&inputs.skill_notes.join("\n\n"));
        }

        let recalled: Vec<minijinja::Value> = inputs
            .recalled
            .iter()
            .map(|hit| context! { source => hit.source.clone(), content => hit.content.clone() })
            .collect();

        let template = self
            .env
            .get_template("system")
            .with_context(|| "system template missing")?;
        let rendered = template
            .render(context! {
                agent_name => self.agent_name.clone(),
                version => env!("CARGO_PKG_VERSION"),
                date => chrono::Utc::now().format("%Y-%m-%d").to_string(),
                workspace => self.workspace.display().to_string(),
                work_repo => self.work_repo.display().to_string(),
                soul => soul,
                working_memory => inputs.working_memory.clone(),
                observations => inputs.observations.clone(),
                skills => skills,
                recalled => recalled,
            })
            .with_context(|| "failed to render system prompt")?;
        Ok(rendered)
    }

    /// Final message list for the provider: system + history + current user
    /// message. The current message is already in the session by contract,
    /// so it is not repeated when it is the session's last entry.
    pub fn build_messages(
        system_prompt: &str,
        history: &[ChatMessage],
        current_user_text: &str,
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend_from_slice(history);

        let duplicated = history
            .last()
            .map(|last| last.role == Role::User && last.content.as_deref() == Some(current_user_text))
            .unwrap_or(false);
        if !duplicated {
            messages.push(ChatMessage::user(current_user_text));
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    async fn builder(dir: &tempfile::TempDir) -> ContextBuilder {
        ContextBuilder::new(
            "skiff",
            dir.path().to_path_buf(),
            dir.path().join("work"),
        )
        .expect("builder")
    }

    #[tokio::test]
    async fn sections_render_in_fixed_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("SOUL.md"),
            indoc! {"
                # Soul
                Be kind.
            "},
        )
        .expect("soul");
        std::fs::write(dir.path().join("USER.md"), "The user is Sam.").expect("user");

        let builder = builder(&dir).await;
        let inputs = ContextInputs {
            working_memory: Some("draft: pick a venue".into()),
            observations: vec!["user prefers mornings".into()],
            skills_summary: "- exec (tier 2): run commands".into(),
            skill_notes: Vec::new(),
            recalled: vec![MemoryHit {
                id: "m1".into(),
                content: "birthday in june".into(),
                source: "chat:console".into(),
                score: 0.9,
            }],
        };
        let prompt = builder.system_prompt(&inputs).await.expect("render");

        let soul_pos = prompt.find("Be kind.").expect("soul present");
        let user_pos = prompt.find("The user is Sam.").expect("user present");
        let wm_pos = prompt.find("draft: pick a venue").expect("working memory present");
        let obs_pos = prompt.find("user prefers mornings").expect("observation present");
        let skills_pos = prompt.find("run commands").expect("skills present");
        let recall_pos = prompt.find("birthday in june").expect("recall present");

        // Soul files in canonical order, then the variable sections.
        assert!(soul_pos < user_pos);
        assert!(user_pos < wm_pos);
        assert!(wm_pos < obs_pos);
        assert!(obs_pos < skills_pos);
        assert!(skills_pos < recall_pos);
    }

    #[tokio::test]
    async fn missing_sections_are_omitted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let builder = builder(&dir).await;
        let prompt = builder
            .system_prompt(&ContextInputs::default())
            .await
            .expect("render");
        assert!(!prompt.contains("## Working memory"));
        assert!(!prompt.contains("## Relevant memories"));
        assert!(prompt.contains("personal assistant runtime"));
    }

    #[test]
    fn current_message_is_not_repeated() {
        let history = vec![
            ChatMessage::user("earlier"),
            ChatMessage::assistant("sure"),
            ChatMessage::user("what now?"),
        ];
        let messages = ContextBuilder::build_messages("sys", &history, "what now?");
        assert_eq!(messages.len(), 4);
        let user_count = messages
            .iter()
            .filter(|m| m.role == Role::User && m.content.as_deref() == Some("what now?"))
            .count();
        assert_eq!(user_count, 1);

        // A different current message is appended.
        let messages = ContextBuilder::build_messages("sys", &history, "something else");
        assert_eq!(messages.len(), 5);
    }
}

//! In-band command interception: approval replies and task-tracking
//! mnemonics are handled before any LLM dispatch.

use crate::ledger::{Ledger, TaskRow};
use crate::error::Result;

/// A recognized in-band command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `approve:<id>`
    Approve(String),
    /// `deny:<id>`
    Deny(String),
    /// `!tasks`: recent task summary.
    Tasks,
    /// `!task <id-prefix>`: one task's detail.
    Task(String),
    /// `!usage`: token rollups by provider.
    Usage,
}

/// Parse a message body into a command, if it is one.
pub fn parse(content: &str) -> Option<Command> {
    let trimmed = content.trim();

    if let Some(id) = trimmed.strip_prefix("approve:") {
        let id = id.trim();
        if !id.is_empty() && !id.contains(char::is_whitespace) {
            return Some(Command::Approve(id.to_string()));
        }
    }
    if let Some(id) = trimmed.strip_prefix("deny:") {
        let id = id.trim();
        if !id.is_empty() && !id.contains(char::is_whitespace) {
            return Some(Command::Deny(id.to_string()));
        }
    }

    match trimmed {
        "!tasks" => return Some(Command::Tasks),
        "!usage" => return Some(Command::Usage),
        _ => {}
    }
    if let Some(rest) = trimmed.strip_prefix("!task ") {
        let id = rest.trim();
        if !id.is_empty() {
            return Some(Command::Task(id.to_string()));
        }
    }

    None
}

/// Render the `!tasks` summary.
pub async fn render_tasks(ledger: &Ledger) -> Result<String> {
    let tasks = ledger.recent_tasks(10).await?;
    if tasks.is_empty() {
        return Ok("no tasks yet".into());
    }
    Ok(tasks
        .iter()
        .map(|task| {
            format!(
                "{} [{}/{}] {} — {}",
                &task.task_id[..8.min(task.task_id.len())],
                task.status,
                task.delivery_status,
                task.channel,
                first_line(&task.content_in, 60),
            )
        })
        .collect::<Vec<_>>()
        .join("\n"))
}

/// Render one task's detail for `!task <id>`.
pub async fn render_task(ledger: &Ledger, id_prefix: &str) -> Result<String> {
    let tasks = ledger.recent_tasks(100).await?;
    let matches: Vec<&TaskRow> = tasks
        .iter()
        .filter(|t| t.task_id.starts_with(id_prefix))
        .collect();
    match matches.as_slice() {
        [] => Ok(format!("no task matching '{id_prefix}'")),
        [task] => Ok(format!(
            "task {}\nstatus: {} (delivery {}, {} attempts)\nchannel: {} chat: {}\nin: {}\nout: {}\nerror: {}\ntokens: {}+{}",
            task.task_id,
            task.status,
            task.delivery_status,
            task.delivery_attempts,
            task.channel,
            task.chat_id,
            first_line(&task.content_in, 200),
            task.content_out.as_deref().map(|c| first_line(c, 200)).unwrap_or_else(|| "-".into()),
            task.error.as_deref().unwrap_or("-"),
            task.prompt_tokens,
            task.completion_tokens,
        )),
        many => Ok(format!(
            "'{id_prefix}' is ambiguous ({} matches); use more characters",
            many.len()
        )),
    }
}

/// Render the `!usage` rollup.
pub async fn render_usage(ledger: &Ledger) -> Result<String> {
    let by_provider = ledger.usage_by_provider().await?;
    if by_provider.is_empty() {
        return Ok("no completed tasks yet".into());
    }
    let mut lines = vec!["token usage by provider:".to_string()];
    for rollup in &by_provider {
        lines.push(format!(
            "  {}: {} prompt + {} completion over {} task(s)",
            rollup.bucket, rollup.prompt_tokens, rollup.completion_tokens, rollup.task_count,
        ));
    }
    let by_day = ledger.usage_by_day(7).await?;
    if !by_day.is_empty() {
        lines.push("last days:".into());
        for rollup in &by_day {
            lines.push(format!(
                "  {}: {} prompt + {} completion",
                rollup.bucket, rollup.prompt_tokens, rollup.completion_tokens,
            ));
        }
    }
    Ok(lines.join("\n"))
}

fn first_line(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.len() <= max {
        line.to_string()
    } else {
        format!("{}…", &line[..line.floor_char_boundary(max)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_approval_replies() {
        assert_eq!(parse("approve:abc123"), Some(Command::Approve("abc123".into())));
        assert_eq!(parse("  deny:xyz  "), Some(Command::Deny("xyz".into())));
        assert_eq!(parse("approve:"), None);
        assert_eq!(parse("approve: two words"), None);
        assert_eq!(parse("please approve: this"), None);
    }

    #[test]
    fn parses_task_mnemonics() {
        assert_eq!(parse("!tasks"), Some(Command::Tasks));
        assert_eq!(parse("!task abc1"), Some(Command::Task("abc1".into())));
        assert_eq!(parse("!usage"), Some(Command::Usage));
        assert_eq!(parse("!task "), None);
        assert_eq!(parse("hello there"), None);
    }
}

//! OpenAI-compatible chat completion client.
//!
//! One shared reqwest client, provider base URL + key from configuration.
//! Calls are cancellation-aware; transient failures surface as retryable
//! provider errors.

use crate::error::{LlmError, Result};
use crate::llm::{ChatMessage, ChatProvider, ChatResponse, Role, TokenUsage, ToolCall};
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

/// Completion client for a single provider endpoint.
pub struct LlmClient {
    client: reqwest::Client,
    provider: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

impl LlmClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: reqwest::Client,
        provider: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            client,
            provider: provider.into(),
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            max_tokens,
            temperature,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ChatProvider for LlmClient {
    fn provider(&self) -> &str {
        &self.provider
    }

    /// One chat completion round. `tools` are function-tool definitions; an
    /// empty slice omits the field entirely.
    async fn chat(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
    ) -> Result<ChatResponse> {
        let endpoint = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(tools.to_vec());
        }

        let mut request = self.client.post(&endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(LlmError::Cancelled.into()),
            response = request.send() => {
                response.map_err(|e| LlmError::ProviderRequest(e.to_string()))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::ProviderStatus {
                status: status.as_u16(),
                body: truncate(&body, 500),
            }
            .into());
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| LlmError::CompletionParse(e.to_string()))?;
        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::CompletionParse("response had no choices".into()))?;

        let usage = wire
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(ChatResponse {
            content: choice.message.content,
            tool_calls: choice
                .message
                .tool_calls
                .into_iter()
                .map(|call| ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments,
                })
                .collect(),
            usage,
        })
    }
}

/// Serialize a chat message into the provider wire shape.
fn wire_message(message: &ChatMessage) -> serde_json::Value {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut value = serde_json::json!({ "role": role });
    if let Some(content) = &message.content {
        value["content"] = serde_json::json!(content);
    }
    if !message.tool_calls.is_empty() {
        value["tool_calls"] = serde_json::json!(
            message
                .tool_calls
                .iter()
                .map(|call| {
                    serde_json::json!({
                        "id": call.id,
                        "type": "function",
                        "function": { "name": call.name, "arguments": call.arguments }
                    })
                })
                .collect::<Vec<_>>()
        );
    }
    if let Some(tool_call_id) = &message.tool_call_id {
        value["tool_call_id"] = serde_json::json!(tool_call_id);
    }
    value
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        format!("{}…", &text[..text.floor_char_boundary(max)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_message_shapes() {
        let assistant = ChatMessage::assistant_tool_calls(vec![ToolCall {
            id: "call-1".into(),
            name: "exec".into(),
            arguments: r#"{"command":"ls"}"#.into(),
        }]);
        let value = wire_message(&assistant);
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["tool_calls"][0]["function"]["name"], "exec");
        assert!(value.get("content").is_none());

        let tool = ChatMessage::tool_result("call-1", "Exit code: 0");
        let value = wire_message(&tool);
        assert_eq!(value["role"], "tool");
        assert_eq!(value["tool_call_id"], "call-1");
        assert_eq!(value["content"], "Exit code: 0");
    }

    #[test]
    fn parses_tool_call_response() {
        let raw = serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call-9",
                        "type": "function",
                        "function": { "name": "recall", "arguments": "{\"query\":\"x\"}" }
                    }]
                }
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 7 }
        });
        let wire: WireResponse = serde_json::from_value(raw).expect("parse");
        assert_eq!(wire.choices[0].message.tool_calls[0].function.name, "recall");
        assert_eq!(wire.usage.as_ref().expect("usage").prompt_tokens, 12);
    }
}

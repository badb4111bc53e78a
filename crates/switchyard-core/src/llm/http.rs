//! HTTP chat model — OpenAI-compatible `chat/completions` and
//! Anthropic-compatible `v1/messages`, both with tool calling.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ChatMessage, ChatModel, ChatRequest, Role, ToolCall, ToolDefinition};
use crate::config::ModelSettings;
use crate::error::{EngineError, Result};

/// Calls a hosted language model over HTTP.
pub struct HttpChatModel {
    client: reqwest::Client,
    settings: ModelSettings,
}

impl HttpChatModel {
    pub fn new(settings: ModelSettings) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(settings.timeout_secs))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            settings,
        }
    }

    /// POST {base_url}/chat/completions
    async fn call_openai(&self, request: &ChatRequest) -> Result<ChatMessage> {
        let url = format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );
        let body = openai_body(&self.settings, request);

        tracing::debug!(
            "[HttpChatModel] Calling OpenAI-compatible API: {} (model: {})",
            url,
            self.settings.model
        );

        let json = self
            .post_json(
                self.client
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", self.settings.api_key)),
                &body,
            )
            .await?;
        parse_openai_response(&json)
    }

    /// POST {base_url}/v1/messages
    async fn call_anthropic(&self, request: &ChatRequest) -> Result<ChatMessage> {
        let url = format!("{}/v1/messages", self.settings.base_url.trim_end_matches('/'));
        let body = anthropic_body(&self.settings, request);

        tracing::debug!(
            "[HttpChatModel] Calling Anthropic API: {} (model: {})",
            url,
            self.settings.model
        );

        let json = self
            .post_json(
                self.client
                    .post(&url)
                    .header("x-api-key", &self.settings.api_key)
                    .header("anthropic-version", "2023-06-01"),
                &body,
            )
            .await?;
        parse_anthropic_response(&json)
    }

    async fn post_json(&self, builder: reqwest::RequestBuilder, body: &Value) -> Result<Value> {
        let response = builder
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::Model(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| EngineError::Model(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(EngineError::Model(format!("API returned {}: {}", status, text)));
        }

        serde_json::from_str(&text)
            .map_err(|e| EngineError::Model(format!("Failed to parse response JSON: {}", e)))
    }
}

#[async_trait]
impl ChatModel for HttpChatModel {
    fn name(&self) -> &str {
        &self.settings.model
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatMessage> {
        match self.settings.adapter.as_str() {
            "openai" | "opencode" => self.call_openai(&request).await,
            "anthropic" | "claude" => self.call_anthropic(&request).await,
            other => Err(EngineError::Model(format!("Unknown adapter type: '{}'", other))),
        }
    }
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or_else(|| Value::from(0))
}

fn openai_body(settings: &ModelSettings, request: &ChatRequest) -> Value {
    let messages: Vec<Value> = request.messages.iter().map(openai_message).collect();
    let mut body = json!({
        "model": settings.model,
        "max_tokens": settings.max_tokens,
        "messages": messages,
    });
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect(),
        );
    }
    if let Some(temp) = settings.temperature {
        body["temperature"] = number(temp);
    }
    body
}

fn openai_message(message: &ChatMessage) -> Value {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut out = json!({ "role": role, "content": message.content });
    if !message.tool_calls.is_empty() {
        out["tool_calls"] = Value::Array(
            message
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments.to_string() },
                    })
                })
                .collect(),
        );
    }
    if let Some(id) = &message.tool_call_id {
        out["tool_call_id"] = Value::String(id.clone());
    }
    out
}

fn parse_openai_response(json: &Value) -> Result<ChatMessage> {
    let message = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| EngineError::Model("response has no choices".to_string()))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(|t| t.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    let arguments = function
                        .get("arguments")
                        .and_then(|a| a.as_str())
                        .and_then(|a| serde_json::from_str(a).ok())
                        .unwrap_or_else(|| json!({}));
                    Some(ToolCall {
                        id: call.get("id")?.as_str()?.to_string(),
                        name: function.get("name")?.as_str()?.to_string(),
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ChatMessage::assistant(content).with_tool_calls(tool_calls))
}

fn anthropic_body(settings: &ModelSettings, request: &ChatRequest) -> Value {
    let system: Vec<&str> = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();

    // Tool results travel as user turns; adjacent ones share a single turn.
    let mut messages: Vec<Value> = Vec::new();
    for message in request.messages.iter().filter(|m| m.role != Role::System) {
        match message.role {
            Role::Tool => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": message.tool_call_id,
                    "content": message.content,
                });
                let merged = messages.last_mut().and_then(|last| {
                    let is_result_turn = last["role"] == "user"
                        && last["content"]
                            .as_array()
                            .map(|blocks| blocks.iter().all(|b| b["type"] == "tool_result"))
                            .unwrap_or(false);
                    if is_result_turn {
                        last["content"].as_array_mut()
                    } else {
                        None
                    }
                });
                match merged {
                    Some(blocks) => blocks.push(block),
                    None => messages.push(json!({ "role": "user", "content": [block] })),
                }
            }
            Role::Assistant if !message.tool_calls.is_empty() => {
                let mut blocks = Vec::new();
                if !message.content.is_empty() {
                    blocks.push(json!({ "type": "text", "text": message.content }));
                }
                for call in &message.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                messages.push(json!({ "role": "assistant", "content": blocks }));
            }
            Role::Assistant => {
                messages.push(json!({ "role": "assistant", "content": message.content }))
            }
            _ => messages.push(json!({ "role": "user", "content": message.content })),
        }
    }

    let mut body = json!({
        "model": settings.model,
        "max_tokens": settings.max_tokens,
        "messages": messages,
    });
    if !system.is_empty() {
        body["system"] = Value::String(system.join("\n\n"));
    }
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(request.tools.iter().map(anthropic_tool).collect());
    }
    if let Some(temp) = settings.temperature {
        body["temperature"] = number(temp);
    }
    body
}

fn anthropic_tool(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

fn parse_anthropic_response(json: &Value) -> Result<ChatMessage> {
    let blocks = json
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| EngineError::Model("response has no content".to_string()))?;

    let mut text = Vec::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                    text.push(t.to_string());
                }
            }
            Some("tool_use") => {
                let id = block.get("id").and_then(|v| v.as_str());
                let name = block.get("name").and_then(|v| v.as_str());
                if let (Some(id), Some(name)) = (id, name) {
                    tool_calls.push(ToolCall {
                        id: id.to_string(),
                        name: name.to_string(),
                        arguments: block.get("input").cloned().unwrap_or_else(|| json!({})),
                    });
                }
            }
            _ => {}
        }
    }

    Ok(ChatMessage::assistant(text.join("\n")).with_tool_calls(tool_calls))
}

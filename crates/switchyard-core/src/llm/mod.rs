//! Language-model seam.
//!
//! Assistants are bound to a [`ChatModel`]; which model that is comes from a
//! [`ModelProvider`], the settings collaborator. The engine never inspects
//! model selection beyond handing settings through.

pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::AssistantSpec;
use crate::results::ToolEnvelope;

pub use http::HttpChatModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on tool messages: the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Assistant name on assistant messages, tool name on tool messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Envelope of a plugin tool result. Kept with the thread, never sent
    /// to the model; `content` carries its model text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ToolEnvelope>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            artifact: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn tool_result(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call.id.clone()),
            name: Some(call.name.clone()),
            artifact: None,
        }
    }

    pub fn with_artifact(mut self, envelope: ToolEnvelope) -> Self {
        self.artifact = Some(envelope);
        self
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }
}

/// A tool advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// A chat-completion capable language model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model identifier, for logs.
    fn name(&self) -> &str;

    /// Produce the next assistant message for the conversation.
    async fn complete(&self, request: ChatRequest) -> Result<ChatMessage>;
}

/// Supplies the language model each assistant is bound to.
pub trait ModelProvider: Send + Sync {
    /// Model used by the single-node fallback graph.
    fn default_model(&self) -> Arc<dyn ChatModel>;

    fn model_for(&self, _assistant: &AssistantSpec) -> Arc<dyn ChatModel> {
        self.default_model()
    }
}

/// Binds every assistant to one shared model.
pub struct StaticModelProvider {
    model: Arc<dyn ChatModel>,
}

impl StaticModelProvider {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

impl ModelProvider for StaticModelProvider {
    fn default_model(&self) -> Arc<dyn ChatModel> {
        self.model.clone()
    }
}

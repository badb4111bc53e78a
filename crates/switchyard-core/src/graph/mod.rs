//! Compiled, runnable graphs.
//!
//! Two shapes exist. The fallback graph is a single `chat` node that runs the
//! default model over the thread's history. The multi-agent graph is
//! `entry -> router -> exit`: the router runs the active assistant, executes
//! its tool calls, and follows handoff tools until an assistant answers
//! without calling tools or the step budget runs out.

pub mod compiler;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::assistant::{AssistantRuntime, ToolTarget};
use crate::error::{EngineError, Result};
use crate::llm::{ChatMessage, ChatModel, ChatRequest, ToolCall};
use crate::results::ToolEnvelope;
use crate::scope::ResourceScope;
use crate::store::{CheckpointStore, ThreadState};

pub use compiler::{BuildOutcome, BuiltGraph, GraphBuilder, WorkflowCompiler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphKind {
    Fallback,
    MultiAgent,
}

pub enum Topology {
    Fallback {
        model: Arc<dyn ChatModel>,
    },
    MultiAgent {
        assistants: BTreeMap<String, Arc<AssistantRuntime>>,
        default_assistant: String,
    },
}

/// Messages produced by one invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunOutput {
    pub messages: Vec<ChatMessage>,
    pub active_assistant: Option<String>,
    /// Envelopes of every plugin tool call made during the run.
    pub artifacts: Vec<ToolEnvelope>,
}

impl RunOutput {
    /// Text of the last assistant message, if any.
    pub fn reply(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::llm::Role::Assistant && !m.content.is_empty())
            .map(|m| m.content.as_str())
    }
}

pub struct CompiledRuntime {
    workflow_id: String,
    topology: Topology,
    checkpoints: CheckpointStore,
    max_steps: usize,
    fallback_reason: Option<String>,
    built_at: DateTime<Utc>,
    /// Resources of this graph once it has been replaced or evicted while
    /// callers still held it. Released when the last holder drops.
    retired: Mutex<Option<ResourceScope>>,
}

impl CompiledRuntime {
    pub fn fallback(
        workflow_id: impl Into<String>,
        model: Arc<dyn ChatModel>,
        checkpoints: CheckpointStore,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            topology: Topology::Fallback { model },
            checkpoints,
            max_steps: 1,
            fallback_reason: Some(reason.into()),
            built_at: Utc::now(),
            retired: Mutex::new(None),
        }
    }

    pub fn multi_agent(
        workflow_id: impl Into<String>,
        assistants: BTreeMap<String, Arc<AssistantRuntime>>,
        default_assistant: impl Into<String>,
        checkpoints: CheckpointStore,
        max_steps: usize,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            topology: Topology::MultiAgent {
                assistants,
                default_assistant: default_assistant.into(),
            },
            checkpoints,
            max_steps: max_steps.max(1),
            fallback_reason: None,
            built_at: Utc::now(),
            retired: Mutex::new(None),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn kind(&self) -> GraphKind {
        match self.topology {
            Topology::Fallback { .. } => GraphKind::Fallback,
            Topology::MultiAgent { .. } => GraphKind::MultiAgent,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Why this graph is the fallback, when it is.
    pub fn fallback_reason(&self) -> Option<&str> {
        self.fallback_reason.as_deref()
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn nodes(&self) -> Vec<&'static str> {
        match self.topology {
            Topology::Fallback { .. } => vec!["chat"],
            Topology::MultiAgent { .. } => vec!["entry", "router", "exit"],
        }
    }

    pub fn assistants(&self) -> Option<&BTreeMap<String, Arc<AssistantRuntime>>> {
        match &self.topology {
            Topology::MultiAgent { assistants, .. } => Some(assistants),
            Topology::Fallback { .. } => None,
        }
    }

    pub fn default_assistant(&self) -> Option<&str> {
        match &self.topology {
            Topology::MultiAgent {
                default_assistant, ..
            } => Some(default_assistant),
            Topology::Fallback { .. } => None,
        }
    }

    /// Hand over the graph's resources to be released when the last
    /// `Arc` to this runtime is dropped.
    pub(crate) fn defer_release(&self, scope: ResourceScope) {
        let mut retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut previous) = retired.replace(scope) {
            tokio::spawn(async move { previous.close().await });
        }
    }

    /// Run one user turn on a thread and persist the resulting state.
    pub async fn invoke(&self, thread_id: &str, user_text: &str) -> Result<RunOutput> {
        let mut state = self
            .checkpoints
            .load_latest(thread_id)
            .await?
            .unwrap_or_default();
        let first_new = state.messages.len();
        state.messages.push(ChatMessage::user(user_text));

        let mut artifacts = Vec::new();
        match &self.topology {
            Topology::Fallback { model } => {
                let reply = model
                    .complete(ChatRequest {
                        messages: state.messages.clone(),
                        tools: Vec::new(),
                    })
                    .await?;
                state.messages.push(reply);
            }
            Topology::MultiAgent {
                assistants,
                default_assistant,
            } => {
                let active = self
                    .route(assistants, default_assistant, &mut state, &mut artifacts)
                    .await?;
                state.active_assistant = Some(active);
            }
        }

        self.checkpoints.save(thread_id, &state).await?;
        Ok(RunOutput {
            messages: state.messages[first_new..].to_vec(),
            active_assistant: state.active_assistant,
            artifacts,
        })
    }

    /// The router loop. Returns the assistant holding control at exit.
    async fn route(
        &self,
        assistants: &BTreeMap<String, Arc<AssistantRuntime>>,
        default_assistant: &str,
        state: &mut ThreadState,
        artifacts: &mut Vec<ToolEnvelope>,
    ) -> Result<String> {
        let mut active = state
            .active_assistant
            .clone()
            .filter(|name| assistants.contains_key(name))
            .unwrap_or_else(|| default_assistant.to_string());

        for _ in 0..self.max_steps {
            let assistant = assistants.get(&active).ok_or_else(|| {
                EngineError::Internal(format!("active assistant '{}' is not in the graph", active))
            })?;

            let mut messages = Vec::with_capacity(state.messages.len() + 1);
            if !assistant.instructions.is_empty() {
                messages.push(ChatMessage::system(assistant.instructions.clone()));
            }
            messages.extend(state.messages.iter().cloned());

            let mut reply = assistant
                .model()
                .complete(ChatRequest {
                    messages,
                    tools: assistant.tool_definitions(),
                })
                .await?;
            reply.name = Some(assistant.name.clone());
            let calls = reply.tool_calls.clone();
            state.messages.push(reply);

            if calls.is_empty() {
                return Ok(active);
            }

            let mut transfer: Option<String> = None;
            for call in &calls {
                let (content, artifact) = self.execute_tool(assistant, call, &mut transfer).await;
                let mut message = ChatMessage::tool_result(call, content);
                if let Some(envelope) = artifact {
                    artifacts.push(envelope.clone());
                    message = message.with_artifact(envelope);
                }
                state.messages.push(message);
            }

            if let Some(destination) = transfer {
                tracing::debug!(
                    workflow_id = %self.workflow_id,
                    "[Router] Handoff {} -> {}",
                    active,
                    destination
                );
                active = destination;
            }
        }

        tracing::warn!(
            workflow_id = %self.workflow_id,
            "[Router] Step budget of {} exhausted; ending turn with '{}'",
            self.max_steps,
            active
        );
        Ok(active)
    }

    /// Run one tool call. Returns the visible tool output and, for plugin
    /// calls, the result envelope.
    async fn execute_tool(
        &self,
        assistant: &AssistantRuntime,
        call: &ToolCall,
        transfer: &mut Option<String>,
    ) -> (String, Option<ToolEnvelope>) {
        match assistant.resolve_tool(&call.name) {
            Some(ToolTarget::Handoff(handoff)) => {
                if let Some(pending) = transfer.as_deref() {
                    let skipped = format!(
                        "Transfer to {} skipped: already transferring to {}",
                        handoff.destination, pending
                    );
                    return (skipped, None);
                }
                *transfer = Some(handoff.destination.clone());
                (handoff.acknowledgement(), None)
            }
            Some(ToolTarget::Plugin(plugin)) => {
                match plugin.call_tool(&call.name, call.arguments.clone()).await {
                    Ok(result) => (result.content, Some(result.envelope)),
                    Err(e) => (format!("Error: {}", e), None),
                }
            }
            None => (format!("Error: unknown tool '{}'", call.name), None),
        }
    }
}

impl Drop for CompiledRuntime {
    fn drop(&mut self) {
        let retired = self
            .retired
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut scope) = retired else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(
                    workflow_id = %self.workflow_id,
                    "[CompiledRuntime] Last holder gone; releasing retired graph"
                );
                handle.spawn(async move { scope.close().await });
            }
            Err(_) => tracing::warn!(
                workflow_id = %self.workflow_id,
                "[CompiledRuntime] No async runtime to release retired graph"
            ),
        }
    }
}

impl std::fmt::Debug for CompiledRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledRuntime")
            .field("workflow_id", &self.workflow_id)
            .field("kind", &self.kind())
            .field("fallback_reason", &self.fallback_reason)
            .finish()
    }
}

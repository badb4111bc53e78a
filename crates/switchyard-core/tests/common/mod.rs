//! Shared doubles for the engine integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use switchyard_core::config::EngineConfig;
use switchyard_core::error::{EngineError, Result};
use switchyard_core::graph::{BuildOutcome, GraphBuilder};
use switchyard_core::llm::{ChatMessage, ChatModel, ChatRequest, Role, StaticModelProvider, ToolCall};
use switchyard_core::models::{AssistantSpec, PluginRef, WorkflowEdge, WorkflowNode, WorkflowSpec, EdgeMode};
use switchyard_core::plugins::{ToolInfo, ToolServerConnection, ToolServerConnector, TransportSpec};
use switchyard_core::results::RawToolOutput;
use switchyard_core::store::MemoryWorkflowSource;
use switchyard_core::{EngineContext, EngineContextInner, WorkflowCompiler};

// ── Tool servers ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct FakeServer {
    pub tools: Vec<ToolInfo>,
    pub delay: Duration,
    pub fail: bool,
}

impl FakeServer {
    pub fn with_tools(names: &[&str]) -> Self {
        Self {
            tools: names
                .iter()
                .map(|n| ToolInfo {
                    name: n.to_string(),
                    description: format!("{} tool", n),
                    input_schema: json!({ "type": "object" }),
                })
                .collect(),
            delay: Duration::ZERO,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::with_tools(&[])
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::with_tools(&["slow_tool"])
        }
    }
}

/// Serves fake tool servers keyed by URL, counting connects and closes.
#[derive(Default)]
pub struct FakeConnector {
    servers: Mutex<HashMap<String, FakeServer>>,
    pub connects: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    pub calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, server: FakeServer) {
        self.servers.lock().unwrap().insert(url.to_string(), server);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolServerConnector for FakeConnector {
    async fn connect(&self, spec: &TransportSpec) -> Result<Box<dyn ToolServerConnection>> {
        let url = match spec {
            TransportSpec::StreamableHttp { url } => url.clone(),
            other => {
                return Err(EngineError::Handshake(format!(
                    "fake connector only serves http, got {}",
                    other.describe()
                )))
            }
        };
        let server = self
            .servers
            .lock()
            .unwrap()
            .get(&url)
            .cloned()
            .ok_or_else(|| EngineError::Handshake(format!("connection refused: {}", url)))?;

        tokio::time::sleep(server.delay).await;
        if server.fail {
            return Err(EngineError::Handshake(format!("server crashed: {}", url)));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            tools: server.tools,
            closed: AtomicBool::new(false),
            closes: self.closes.clone(),
            calls: self.calls.clone(),
        }))
    }
}

struct FakeConnection {
    tools: Vec<ToolInfo>,
    closed: AtomicBool,
    closes: Arc<AtomicUsize>,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
}

#[async_trait]
impl ToolServerConnection for FakeConnection {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<RawToolOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments.clone()));
        let rows = json!([
            { "city": "Oslo", "temp": 3 },
            { "city": "Lima", "temp": 19 }
        ]);
        Ok(RawToolOutput {
            text: vec![rows.to_string()],
            structured: None,
            is_error: false,
        })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ── Language model ──────────────────────────────────────────────────────

type Rule = dyn Fn(&ChatRequest) -> ChatMessage + Send + Sync;

/// Answers every request through a rule closure, counting calls.
pub struct RuleModel {
    rule: Box<Rule>,
    latency: Duration,
    pub calls: AtomicUsize,
}

impl RuleModel {
    pub fn new<F>(rule: F) -> Arc<Self>
    where
        F: Fn(&ChatRequest) -> ChatMessage + Send + Sync + 'static,
    {
        Arc::new(Self {
            rule: Box::new(rule),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    /// Replies with a fixed text after sleeping for `latency`.
    pub fn slow_echo(text: &'static str, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            rule: Box::new(move |_| ChatMessage::assistant(text)),
            latency,
            calls: AtomicUsize::new(0),
        })
    }

    /// Replies with a fixed text.
    pub fn echo(text: &'static str) -> Arc<Self> {
        Self::new(move |_| ChatMessage::assistant(text))
    }
}

#[async_trait]
impl ChatModel for RuleModel {
    fn name(&self) -> &str {
        "rule-model"
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatMessage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok((self.rule)(&request))
    }
}

pub fn tool_call(name: &str, arguments: Value) -> ToolCall {
    ToolCall {
        id: format!("call_{}", name),
        name: name.to_string(),
        arguments,
    }
}

/// True when the last message is the user's, i.e. no tool has answered yet.
pub fn fresh_turn(request: &ChatRequest) -> bool {
    request
        .messages
        .last()
        .map(|m| m.role == Role::User)
        .unwrap_or(false)
}

// ── Engine ──────────────────────────────────────────────────────────────

pub struct Harness {
    pub ctx: EngineContext,
    pub source: Arc<MemoryWorkflowSource>,
    pub connector: Arc<FakeConnector>,
    pub plugin_dir: TempDir,
}

pub fn remote_manifest(id: &str, extra: &str) -> String {
    format!(
        "id: {id}\ndisplay_name: {id}\nexecution:\n  mode: remote\n  url: http://fake/{id}/mcp\n{extra}"
    )
}

pub fn plugin_url(id: &str) -> String {
    format!("http://fake/{}/mcp", id)
}

/// Engine wired to fakes. `manifests` are `(directory, file content)` pairs
/// written under a temporary plugin directory before the registry loads.
pub fn harness(model: Arc<dyn ChatModel>, manifests: &[(&str, String)]) -> Harness {
    let plugin_dir = tempfile::tempdir().unwrap();
    for (dir, content) in manifests {
        write_manifest(plugin_dir.path(), dir, content);
    }

    let config = EngineConfig {
        checkpoint_db: ":memory:".to_string(),
        plugin_dirs: vec![plugin_dir.path().to_path_buf()],
        handshake_timeout_ms: 200,
        rebuild_debounce_ms: 50,
        ..EngineConfig::default()
    };
    let source = Arc::new(MemoryWorkflowSource::new());
    let connector = FakeConnector::new();
    let ctx = Arc::new(
        EngineContextInner::new(
            config,
            source.clone(),
            Arc::new(StaticModelProvider::new(model)),
            connector.clone(),
        )
        .unwrap(),
    );
    Harness {
        ctx,
        source,
        connector,
        plugin_dir,
    }
}

pub fn write_manifest(root: &Path, dir: &str, content: &str) {
    let path = root.join(dir);
    std::fs::create_dir_all(&path).unwrap();
    std::fs::write(path.join("plugin.yaml"), content).unwrap();
}

pub fn assistant(id: &str, name: &str, plugins: Vec<PluginRef>) -> AssistantSpec {
    AssistantSpec {
        id: id.to_string(),
        name: name.to_string(),
        instructions: format!("You are {}.", name),
        plugins,
    }
}

/// Workflow over `(node id, assistant id, is_start)` nodes.
pub fn workflow(id: &str, nodes: &[(&str, &str, bool)], edges: &[(&str, &str, EdgeMode)]) -> WorkflowSpec {
    WorkflowSpec {
        id: id.to_string(),
        name: id.to_string(),
        nodes: nodes
            .iter()
            .map(|(node, assistant, start)| WorkflowNode {
                id: node.to_string(),
                assistant_id: assistant.to_string(),
                position: None,
                is_start: *start,
            })
            .collect(),
        edges: edges
            .iter()
            .map(|(s, t, mode)| WorkflowEdge {
                source: s.to_string(),
                target: t.to_string(),
                mode: *mode,
            })
            .collect(),
    }
}

/// Counts how often the wrapped compiler runs.
pub struct CountingBuilder {
    pub inner: Arc<WorkflowCompiler>,
    pub builds: AtomicUsize,
    pub delay: Duration,
}

impl CountingBuilder {
    pub fn new(inner: Arc<WorkflowCompiler>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner,
            builds: AtomicUsize::new(0),
            delay,
        })
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GraphBuilder for CountingBuilder {
    async fn build(&self, workflow_id: &str) -> Result<BuildOutcome> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.compile(workflow_id).await
    }
}

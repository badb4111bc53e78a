//! Tool-server connections.
//!
//! [`ToolServerConnector`] is the seam between plugin runtimes and the wire:
//! production code uses [`McpConnector`] (Model Context Protocol over a child
//! process or streamable HTTP, via `rmcp`); tests substitute their own.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rmcp::service::{Peer, RoleClient, RunningService};
use rmcp::ServiceExt;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::error::{EngineError, Result};
use crate::results::RawToolOutput;

/// How to reach a tool server.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSpec {
    /// Launch a subprocess and speak over its stdin/stdout.
    Stdio {
        command: String,
        args: Vec<String>,
        env: Vec<(String, String)>,
        cwd: Option<PathBuf>,
    },
    StreamableHttp {
        url: String,
    },
    Sse {
        url: String,
    },
}

impl TransportSpec {
    /// Pick the remote sub-protocol from the URL suffix.
    pub fn remote(url: &str) -> Self {
        let url = url.to_string();
        if url.trim_end_matches('/').ends_with("/sse") {
            TransportSpec::Sse { url }
        } else {
            TransportSpec::StreamableHttp { url }
        }
    }

    /// Launch a script, choosing the interpreter from its extension.
    pub fn script(
        script: &Path,
        args: &[String],
        env: Vec<(String, String)>,
        cwd: Option<PathBuf>,
    ) -> Self {
        let script_arg = script.to_string_lossy().to_string();
        let launcher = match script.extension().and_then(|e| e.to_str()) {
            Some("py") => Some("python3"),
            Some("js") | Some("mjs") | Some("cjs") => Some("node"),
            _ => None,
        };
        let (command, mut full_args) = match launcher {
            Some(l) => (l.to_string(), vec![script_arg]),
            None => (script_arg, Vec::new()),
        };
        full_args.extend(args.iter().cloned());
        TransportSpec::Stdio {
            command,
            args: full_args,
            env,
            cwd,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            TransportSpec::Stdio { command, args, .. } => {
                format!("stdio: {} {}", command, args.join(" ")).trim_end().to_string()
            }
            TransportSpec::StreamableHttp { url } => format!("http: {}", url),
            TransportSpec::Sse { url } => format!("sse: {}", url),
        }
    }
}

/// A tool as reported by a tool server.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolInfo {
    fn from_json(value: &Value) -> Option<Self> {
        Some(Self {
            name: value.get("name")?.as_str()?.to_string(),
            description: value
                .get("description")
                .and_then(|d| d.as_str())
                .unwrap_or("")
                .to_string(),
            input_schema: value
                .get("inputSchema")
                .cloned()
                .unwrap_or_else(|| json!({ "type": "object" })),
        })
    }
}

/// A live connection to one tool server.
#[async_trait]
pub trait ToolServerConnection: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<RawToolOutput>;

    /// Terminate the connection (and its subprocess, if any). Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait ToolServerConnector: Send + Sync {
    async fn connect(&self, spec: &TransportSpec) -> Result<Box<dyn ToolServerConnection>>;
}

/// Connects over the Model Context Protocol.
#[derive(Debug, Default, Clone)]
pub struct McpConnector;

impl McpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ToolServerConnector for McpConnector {
    async fn connect(&self, spec: &TransportSpec) -> Result<Box<dyn ToolServerConnection>> {
        let service = match spec {
            TransportSpec::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(args).kill_on_drop(true);
                for (key, value) in env {
                    cmd.env(key, value);
                }
                if let Some(dir) = cwd {
                    cmd.current_dir(dir);
                }
                let transport = rmcp::transport::TokioChildProcess::new(cmd).map_err(|e| {
                    EngineError::Handshake(format!("Failed to spawn '{}': {}", command, e))
                })?;
                ().serve(transport)
                    .await
                    .map_err(|e| EngineError::Handshake(format!("{}: {}", spec.describe(), e)))?
            }
            TransportSpec::StreamableHttp { url } => {
                let transport =
                    rmcp::transport::StreamableHttpClientTransport::from_uri(url.as_str());
                ().serve(transport)
                    .await
                    .map_err(|e| EngineError::Handshake(format!("{}: {}", spec.describe(), e)))?
            }
            TransportSpec::Sse { url } => {
                return Err(EngineError::Handshake(format!(
                    "SSE transport is not supported for '{}'; expose a streamable HTTP endpoint instead",
                    url
                )));
            }
        };

        tracing::debug!("[McpConnector] Connected to {}", spec.describe());
        Ok(Box::new(McpConnection {
            label: spec.describe(),
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
        }))
    }
}

struct McpConnection {
    label: String,
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
}

#[async_trait]
impl ToolServerConnection for McpConnection {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let tools = self
            .peer
            .list_all_tools()
            .await
            .map_err(|e| EngineError::Handshake(format!("{}: list_tools failed: {}", self.label, e)))?;

        let mut out = Vec::with_capacity(tools.len());
        for tool in tools {
            let value = serde_json::to_value(&tool)?;
            if let Some(info) = ToolInfo::from_json(&value) {
                out.push(info);
            }
        }
        Ok(out)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<RawToolOutput> {
        let arguments = match arguments {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(EngineError::Tool(format!(
                    "arguments for '{}' must be an object, got {}",
                    name, other
                )))
            }
        };
        let params = serde_json::from_value(json!({ "name": name, "arguments": arguments }))?;
        let result = self
            .peer
            .call_tool(params)
            .await
            .map_err(|e| EngineError::Tool(format!("{}: call '{}' failed: {}", self.label, name, e)))?;

        Ok(raw_output(&serde_json::to_value(&result)?))
    }

    async fn close(&self) {
        if let Some(service) = self.service.lock().await.take() {
            if let Err(e) = service.cancel().await {
                tracing::debug!("[McpConnector] Error closing {}: {}", self.label, e);
            }
        }
    }
}

/// Flatten an MCP `CallToolResult` into text blocks and structured content.
fn raw_output(result: &Value) -> RawToolOutput {
    let text = result
        .get("content")
        .and_then(|c| c.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| match b.get("type").and_then(|t| t.as_str()) {
                    Some("text") => b.get("text").and_then(|t| t.as_str()).map(str::to_string),
                    Some("resource") => b
                        .pointer("/resource/text")
                        .and_then(|t| t.as_str())
                        .map(str::to_string),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    RawToolOutput {
        text,
        structured: result
            .get("structuredContent")
            .filter(|v| !v.is_null())
            .cloned(),
        is_error: result
            .get("isError")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    }
}

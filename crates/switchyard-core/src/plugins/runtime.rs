//! Live plugin runtimes and their exposed tool surface.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use super::connection::{ToolInfo, ToolServerConnection};
use crate::error::{EngineError, Result};
use crate::models::PluginRef;
use crate::results::{ResourceRecord, ResultCache, ToolEnvelope};
use crate::scope::ScopedResource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Active,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// Shared, config-free instance memoized by registry id.
    Singleton,
    /// Built for one assistant's plugin link.
    PerLink,
}

/// A tool as an assistant sees it, after link overrides.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExposedTool {
    pub exposed_name: String,
    /// Name to call on the tool server.
    pub original_name: String,
    pub description: String,
    pub input_schema: Value,
    pub enabled: bool,
}

/// Apply a link's visibility rules to a server's tool list.
///
/// With `tools_default_enabled = false` every base tool starts disabled.
/// Overrides are then applied by original name, in order. A rename exposes
/// the alias and keeps the original name present but disabled, so it cannot
/// be invoked alongside the alias. A rename onto a name another tool already
/// exposes is ignored.
pub fn apply_tool_visibility(base: &[ToolInfo], link: &PluginRef) -> Vec<ExposedTool> {
    let mut tools: Vec<ExposedTool> = base
        .iter()
        .map(|t| ExposedTool {
            exposed_name: t.name.clone(),
            original_name: t.name.clone(),
            description: t.description.clone(),
            input_schema: t.input_schema.clone(),
            enabled: link.tools_default_enabled,
        })
        .collect();

    for o in &link.tools {
        let Some(info) = base.iter().find(|t| t.name == o.name) else {
            tracing::warn!(
                "[PluginRuntime] Override for unknown tool '{}' on plugin '{}'",
                o.name,
                link.registry_id
            );
            continue;
        };
        let enabled = o.enabled.unwrap_or(true);
        let description = o.description.clone().unwrap_or_else(|| info.description.clone());

        match o.rename.as_deref().filter(|r| *r != o.name) {
            Some(alias) => {
                if let Some(taken) = tools
                    .iter()
                    .find(|t| t.exposed_name == alias && t.original_name != info.name)
                {
                    tracing::warn!(
                        "[PluginRuntime] Rename of '{}' to '{}' on plugin '{}' ignored: name belongs to '{}'",
                        o.name,
                        alias,
                        link.registry_id,
                        taken.original_name
                    );
                    continue;
                }
                if let Some(original) = tools.iter_mut().find(|t| t.exposed_name == o.name) {
                    original.enabled = false;
                }
                let aliased = ExposedTool {
                    exposed_name: alias.to_string(),
                    original_name: info.name.clone(),
                    description,
                    input_schema: info.input_schema.clone(),
                    enabled,
                };
                match tools.iter_mut().find(|t| t.exposed_name == alias) {
                    Some(existing) => *existing = aliased,
                    None => tools.push(aliased),
                }
            }
            None => {
                if let Some(tool) = tools.iter_mut().find(|t| t.exposed_name == o.name) {
                    tool.enabled = enabled;
                    tool.description = description;
                }
            }
        }
    }
    tools
}

/// Result of one intercepted tool call.
#[derive(Debug, Clone)]
pub struct InterceptedCall {
    pub envelope: ToolEnvelope,
    /// Visible tool output: the envelope's model text.
    pub content: String,
}

/// Normalizes every raw tool result into a [`ResourceRecord`], stores it in
/// the shared [`ResultCache`], and hands back only the envelope and its
/// short model text.
#[derive(Clone)]
pub struct ResultInterceptor {
    cache: Arc<ResultCache>,
}

impl ResultInterceptor {
    pub fn new(cache: Arc<ResultCache>) -> Self {
        Self { cache }
    }

    pub async fn call(
        &self,
        connection: &dyn ToolServerConnection,
        tool: &str,
        arguments: Value,
    ) -> Result<InterceptedCall> {
        let started = Instant::now();
        let raw = connection.call_tool(tool, arguments).await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let record = ResourceRecord::from_raw(&raw)
            .with_metadata("latency_ms", Value::from(latency_ms))
            .with_metadata("tool", Value::String(tool.to_string()));
        let model_text = record.model_text.clone();
        let artifact_id = self.cache.register(record);

        let envelope = ToolEnvelope::new(artifact_id, model_text.clone());
        Ok(InterceptedCall {
            envelope,
            content: model_text,
        })
    }
}

/// One plugin's live tool server, bound either to the process (singleton) or
/// to one assistant's link.
pub struct PluginRuntime {
    registry_id: String,
    kind: RuntimeKind,
    status: PluginStatus,
    error: Option<String>,
    tools: Vec<ExposedTool>,
    connection: RwLock<Option<Arc<dyn ToolServerConnection>>>,
    interceptor: ResultInterceptor,
}

impl PluginRuntime {
    pub fn active(
        registry_id: impl Into<String>,
        kind: RuntimeKind,
        connection: Arc<dyn ToolServerConnection>,
        tools: Vec<ExposedTool>,
        interceptor: ResultInterceptor,
    ) -> Self {
        Self {
            registry_id: registry_id.into(),
            kind,
            status: PluginStatus::Active,
            error: None,
            tools,
            connection: RwLock::new(Some(connection)),
            interceptor,
        }
    }

    pub fn failed(
        registry_id: impl Into<String>,
        kind: RuntimeKind,
        error: impl Into<String>,
        interceptor: ResultInterceptor,
    ) -> Self {
        Self {
            registry_id: registry_id.into(),
            kind,
            status: PluginStatus::Error,
            error: Some(error.into()),
            tools: Vec::new(),
            connection: RwLock::new(None),
            interceptor,
        }
    }

    pub fn registry_id(&self) -> &str {
        &self.registry_id
    }

    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    pub fn status(&self) -> PluginStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.status == PluginStatus::Active
    }

    pub fn is_closed(&self) -> bool {
        self.connection.read().map(|c| c.is_none()).unwrap_or(true)
    }

    /// Every tool, including disabled mirrors.
    pub fn all_tools(&self) -> &[ExposedTool] {
        &self.tools
    }

    /// Tools an assistant may call.
    pub fn list_tools(&self) -> Vec<ExposedTool> {
        self.tools.iter().filter(|t| t.enabled).cloned().collect()
    }

    pub async fn call_tool(&self, exposed_name: &str, arguments: Value) -> Result<InterceptedCall> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.exposed_name == exposed_name)
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "tool '{}' on plugin '{}'",
                    exposed_name, self.registry_id
                ))
            })?;
        if !tool.enabled {
            return Err(EngineError::Tool(format!(
                "tool '{}' is disabled on plugin '{}'",
                exposed_name, self.registry_id
            )));
        }

        let connection = self
            .connection
            .read()
            .map_err(|e| EngineError::Internal(format!("Lock poisoned: {}", e)))?
            .clone()
            .ok_or_else(|| {
                EngineError::Tool(format!("plugin '{}' is not connected", self.registry_id))
            })?;

        self.interceptor
            .call(connection.as_ref(), &tool.original_name, arguments)
            .await
    }

    /// Close the tool-server connection. Idempotent.
    pub async fn close(&self) {
        let connection = match self.connection.write() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(connection) = connection {
            tracing::debug!("[PluginRuntime] Closing plugin '{}'", self.registry_id);
            connection.close().await;
        }
    }
}

impl std::fmt::Debug for PluginRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRuntime")
            .field("registry_id", &self.registry_id)
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("tools", &self.tools.len())
            .finish()
    }
}

#[async_trait]
impl ScopedResource for PluginRuntime {
    fn label(&self) -> String {
        format!("plugin '{}'", self.registry_id)
    }

    async fn release(&self) {
        self.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ToolOverride;
    use crate::results::RawToolOutput;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn info(name: &str) -> ToolInfo {
        ToolInfo {
            name: name.to_string(),
            description: format!("{} tool", name),
            input_schema: json!({ "type": "object" }),
        }
    }

    fn over(name: &str, enabled: Option<bool>, rename: Option<&str>) -> ToolOverride {
        ToolOverride {
            name: name.to_string(),
            enabled,
            rename: rename.map(str::to_string),
            description: None,
        }
    }

    fn visible(tools: &[ExposedTool]) -> Vec<&str> {
        tools
            .iter()
            .filter(|t| t.enabled)
            .map(|t| t.exposed_name.as_str())
            .collect()
    }

    #[test]
    fn test_default_disabled_mirrors_every_tool() {
        let mut link = PluginRef::new("sql");
        link.tools_default_enabled = false;
        link.tools = vec![over("query", None, None)];

        let tools = apply_tool_visibility(&[info("query"), info("drop")], &link);
        assert_eq!(tools.len(), 2);
        assert_eq!(visible(&tools), vec!["query"]);
    }

    #[test]
    fn test_rename_disables_original_name() {
        let mut link = PluginRef::new("sql");
        link.tools = vec![over("run_query", None, Some("query"))];

        let tools = apply_tool_visibility(&[info("run_query"), info("schema")], &link);
        assert_eq!(visible(&tools), vec!["schema", "query"]);
        let original = tools.iter().find(|t| t.exposed_name == "run_query").unwrap();
        assert!(!original.enabled);
        let alias = tools.iter().find(|t| t.exposed_name == "query").unwrap();
        assert_eq!(alias.original_name, "run_query");
    }

    #[test]
    fn test_rename_onto_another_tool_is_ignored() {
        let mut link = PluginRef::new("sql");
        link.tools = vec![
            over("run_query", None, Some("schema")),
            over("explain", None, Some("plan")),
            over("describe", None, Some("plan")),
        ];

        let tools = apply_tool_visibility(
            &[info("run_query"), info("schema"), info("explain"), info("describe")],
            &link,
        );
        assert_eq!(visible(&tools), vec!["run_query", "schema", "describe", "plan"]);
        let schema = tools.iter().find(|t| t.exposed_name == "schema").unwrap();
        assert_eq!(schema.original_name, "schema");
        let plan = tools.iter().find(|t| t.exposed_name == "plan").unwrap();
        assert_eq!(plan.original_name, "explain");
    }

    #[test]
    fn test_explicit_disable_and_unknown_override() {
        let mut link = PluginRef::new("fs");
        link.tools = vec![over("delete", Some(false), None), over("ghost", Some(true), None)];

        let tools = apply_tool_visibility(&[info("read"), info("delete")], &link);
        assert_eq!(visible(&tools), vec!["read"]);
        assert_eq!(tools.len(), 2);
    }

    struct Echo {
        calls: AtomicUsize,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl ToolServerConnection for Echo {
        async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
            Ok(vec![info("echo")])
        }

        async fn call_tool(&self, name: &str, arguments: Value) -> Result<RawToolOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RawToolOutput {
                text: vec![format!("{} {}", name, arguments)],
                structured: None,
                is_error: false,
            })
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_calls_are_intercepted_into_result_cache() {
        let cache = Arc::new(ResultCache::new(8));
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        let mut link = PluginRef::new("echo");
        link.tools = vec![over("echo", None, Some("say"))];
        let runtime = PluginRuntime::active(
            "echo",
            RuntimeKind::PerLink,
            echo.clone(),
            apply_tool_visibility(&[info("echo")], &link),
            ResultInterceptor::new(cache.clone()),
        );

        let call = runtime.call_tool("say", json!({ "text": "hi" })).await.unwrap();
        assert_eq!(call.envelope.version, "1");
        let stored = cache.get(&call.envelope.artifact_id).unwrap();
        assert_eq!(stored.model_text, call.envelope.model_text);
        assert!(stored.metadata.contains_key("latency_ms"));
        assert_eq!(call.content, call.envelope.model_text);
        assert!(!call.content.contains(&call.envelope.artifact_id));

        assert!(runtime.call_tool("echo", json!({})).await.is_err());
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);

        runtime.release().await;
        runtime.release().await;
        assert_eq!(echo.closes.load(Ordering::SeqCst), 1);
        assert!(runtime.is_closed());
        assert!(runtime.call_tool("say", json!({})).await.is_err());
    }
}

//! Plugin runtime construction.
//!
//! Two paths: a process-wide singleton per config-free plugin, memoized by
//! registry id, and a per-link instance built from an assistant's
//! [`PluginRef`]. Neither path returns an error: a failed handshake, a
//! timeout or a bad manifest yields a runtime whose status is
//! [`PluginStatus::Error`](super::PluginStatus::Error).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use super::config_model::{ConfigModel, ValidatedConfig};
use super::connection::{ToolInfo, ToolServerConnection, ToolServerConnector, TransportSpec};
use super::registry::PluginRegistry;
use super::runtime::{apply_tool_visibility, PluginRuntime, ResultInterceptor, RuntimeKind};
use crate::error::{EngineError, Result};
use crate::models::{ExecutionMode, PluginManifest, PluginRef, ServerDescriptor};
use crate::results::ResultCache;

pub struct PluginRuntimeFactory {
    registry: Arc<PluginRegistry>,
    connector: Arc<dyn ToolServerConnector>,
    interceptor: ResultInterceptor,
    handshake_timeout: Duration,
    singletons: Arc<RwLock<HashMap<String, Arc<PluginRuntime>>>>,
    /// Per registry id, so concurrent first calls build a singleton once.
    singleton_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl PluginRuntimeFactory {
    pub fn new(
        registry: Arc<PluginRegistry>,
        connector: Arc<dyn ToolServerConnector>,
        results: Arc<ResultCache>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            connector,
            interceptor: ResultInterceptor::new(results),
            handshake_timeout,
            singletons: Arc::new(RwLock::new(HashMap::new())),
            singleton_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Runtime for an assistant's plugin link: the shared singleton when the
    /// plugin takes no configuration and the link leaves its tools untouched,
    /// a dedicated instance otherwise.
    pub async fn runtime_for_link(
        &self,
        manifest: &Arc<PluginManifest>,
        link: &PluginRef,
    ) -> Arc<PluginRuntime> {
        if manifest.is_config_free() && link.is_plain() {
            self.get_or_create_singleton(&manifest.id).await
        } else {
            self.create_for_link(manifest, link).await
        }
    }

    /// Shared runtime for a config-free plugin, built on first use.
    pub async fn get_or_create_singleton(&self, registry_id: &str) -> Arc<PluginRuntime> {
        if let Some(runtime) = self.singletons.read().await.get(registry_id) {
            return runtime.clone();
        }

        let lock = self.get_lock(registry_id).await;
        let _guard = lock.lock().await;

        // Another caller may have finished while we waited.
        if let Some(runtime) = self.singletons.read().await.get(registry_id) {
            return runtime.clone();
        }

        let runtime = Arc::new(match self.registry.get(registry_id) {
            Some(manifest) => match singleton_transport(&manifest) {
                Ok(transport) => {
                    let link = PluginRef::new(registry_id);
                    self.connect(registry_id, RuntimeKind::Singleton, &transport, &link)
                        .await
                }
                Err(e) => self.failed(registry_id, RuntimeKind::Singleton, e),
            },
            None => self.failed(
                registry_id,
                RuntimeKind::Singleton,
                EngineError::NotFound(format!("plugin manifest '{}'", registry_id)),
            ),
        });

        self.singletons
            .write()
            .await
            .insert(registry_id.to_string(), runtime.clone());
        runtime
    }

    /// Dedicated runtime for one assistant's plugin link.
    pub async fn create_for_link(
        &self,
        manifest: &Arc<PluginManifest>,
        link: &PluginRef,
    ) -> Arc<PluginRuntime> {
        let model = ConfigModel::from_schema(&manifest.config_schema);
        let config = match model.validate(&link.config) {
            Ok(config) => config,
            Err(errors) => {
                let details: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                tracing::warn!(
                    plugin = %manifest.id,
                    "[PluginFactory] Invalid config for '{}' ({}); using raw values",
                    manifest.id,
                    details.join("; ")
                );
                ValidatedConfig::raw(&link.config, &manifest.config_schema)
            }
        };
        tracing::debug!(
            "[PluginFactory] Creating '{}' with config {}",
            manifest.id,
            config.redacted()
        );

        let runtime = match link_transport(manifest, &config) {
            Ok(transport) => {
                self.connect(&manifest.id, RuntimeKind::PerLink, &transport, link)
                    .await
            }
            Err(e) => self.failed(&manifest.id, RuntimeKind::PerLink, e),
        };
        Arc::new(runtime)
    }

    /// Close and forget every singleton.
    pub async fn close_singletons(&self) {
        let drained: Vec<Arc<PluginRuntime>> =
            self.singletons.write().await.drain().map(|(_, r)| r).collect();
        for runtime in drained {
            runtime.close().await;
        }
    }

    pub async fn singleton_count(&self) -> usize {
        self.singletons.read().await.len()
    }

    async fn connect(
        &self,
        registry_id: &str,
        kind: RuntimeKind,
        transport: &TransportSpec,
        link: &PluginRef,
    ) -> PluginRuntime {
        let attempt = tokio::time::timeout(self.handshake_timeout, self.connect_and_probe(transport)).await;
        let outcome = match attempt {
            Ok(result) => result,
            Err(_) => Err(EngineError::Handshake(format!(
                "timed out after {:?} connecting to {}",
                self.handshake_timeout,
                transport.describe()
            ))),
        };

        match outcome {
            Ok((connection, base_tools)) => {
                let tools = apply_tool_visibility(&base_tools, link);
                tracing::info!(
                    "[PluginFactory] Plugin '{}' active with {} tool(s)",
                    registry_id,
                    tools.iter().filter(|t| t.enabled).count()
                );
                PluginRuntime::active(registry_id, kind, connection, tools, self.interceptor.clone())
            }
            Err(e) => self.failed(registry_id, kind, e),
        }
    }

    async fn connect_and_probe(
        &self,
        transport: &TransportSpec,
    ) -> Result<(Arc<dyn ToolServerConnection>, Vec<ToolInfo>)> {
        let connection: Arc<dyn ToolServerConnection> =
            Arc::from(self.connector.connect(transport).await?);
        match connection.list_tools().await {
            Ok(tools) => Ok((connection, tools)),
            Err(e) => {
                connection.close().await;
                Err(e)
            }
        }
    }

    fn failed(&self, registry_id: &str, kind: RuntimeKind, error: EngineError) -> PluginRuntime {
        tracing::warn!(
            plugin = %registry_id,
            "[PluginFactory] Plugin '{}' unavailable: {}",
            registry_id,
            error
        );
        PluginRuntime::failed(registry_id, kind, error.to_string(), self.interceptor.clone())
    }

    async fn get_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.singleton_locks.lock().await;
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Transport for the shared instance: the first named server, else the
/// execution descriptor.
fn singleton_transport(manifest: &PluginManifest) -> Result<TransportSpec> {
    match manifest.servers.values().next() {
        Some(server) => server_transport(manifest, server, Vec::new()),
        None => execution_transport(manifest, Vec::new()),
    }
}

/// Transport for a per-link instance; validated config travels as env vars.
fn link_transport(manifest: &PluginManifest, config: &ValidatedConfig) -> Result<TransportSpec> {
    let env = config.to_env();
    let has_execution_target = match manifest.execution.mode {
        ExecutionMode::Local => manifest.execution.script_path.is_some(),
        ExecutionMode::Remote => manifest.execution.url.is_some(),
    };
    match manifest.servers.values().next() {
        Some(server) if !has_execution_target => server_transport(manifest, server, env),
        _ => execution_transport(manifest, env),
    }
}

fn execution_transport(manifest: &PluginManifest, env: Vec<(String, String)>) -> Result<TransportSpec> {
    let execution = &manifest.execution;
    match execution.mode {
        ExecutionMode::Local => {
            let script = execution.script_path.as_deref().ok_or_else(|| {
                EngineError::Manifest(format!("plugin '{}' has no script_path", manifest.id))
            })?;
            Ok(TransportSpec::script(
                &manifest.resolve_path(script),
                &execution.args,
                env,
                Some(manifest.base_dir.clone()),
            ))
        }
        ExecutionMode::Remote => {
            let url = execution.url.as_deref().ok_or_else(|| {
                EngineError::Manifest(format!("plugin '{}' has no url", manifest.id))
            })?;
            Ok(TransportSpec::remote(url))
        }
    }
}

fn server_transport(
    manifest: &PluginManifest,
    server: &ServerDescriptor,
    extra_env: Vec<(String, String)>,
) -> Result<TransportSpec> {
    if let Some(url) = &server.url {
        return Ok(TransportSpec::remote(url));
    }
    let command = server.command.as_deref().ok_or_else(|| {
        EngineError::Manifest(format!(
            "plugin '{}' server entry has neither command nor url",
            manifest.id
        ))
    })?;

    let mut env: Vec<(String, String)> = server
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.sort();
    env.extend(extra_env);

    let args: Vec<String> = server
        .args
        .iter()
        .map(|arg| resolve_relative_arg(manifest, arg))
        .collect();
    let cwd = Some(manifest.base_dir.clone());

    if is_script(command) {
        Ok(TransportSpec::script(&manifest.resolve_path(command), &args, env, cwd))
    } else {
        Ok(TransportSpec::Stdio {
            command: command.to_string(),
            args,
            env,
            cwd,
        })
    }
}

fn is_script(command: &str) -> bool {
    matches!(
        Path::new(command).extension().and_then(|e| e.to_str()),
        Some("py") | Some("js") | Some("mjs") | Some("cjs")
    )
}

/// Relative arguments naming a file next to the manifest become absolute.
fn resolve_relative_arg(manifest: &PluginManifest, arg: &str) -> String {
    if arg.starts_with('-') || Path::new(arg).is_absolute() {
        return arg.to_string();
    }
    let candidate = manifest.base_dir.join(arg);
    if candidate.exists() {
        candidate.to_string_lossy().to_string()
    } else {
        arg.to_string()
    }
}

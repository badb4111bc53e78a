//! Engine context: every long-lived component, constructed once at startup.

use std::sync::Arc;

use crate::assistant::AssistantRuntimeAssembler;
use crate::cache::RuntimeCache;
use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::Result;
use crate::graph::WorkflowCompiler;
use crate::llm::{HttpChatModel, ModelProvider, StaticModelProvider};
use crate::plugins::{McpConnector, PluginRegistry, PluginRuntimeFactory, ToolServerConnector};
use crate::results::ResultCache;
use crate::store::{WorkflowSource, YamlWorkflowSource};

/// Shared engine state handed to the serving layer.
pub struct EngineContextInner {
    pub config: EngineConfig,
    pub db: Database,
    pub source: Arc<dyn WorkflowSource>,
    pub results: Arc<ResultCache>,
    pub registry: Arc<PluginRegistry>,
    pub plugins: Arc<PluginRuntimeFactory>,
    pub compiler: Arc<WorkflowCompiler>,
    pub runtimes: RuntimeCache,
}

pub type EngineContext = Arc<EngineContextInner>;

impl EngineContextInner {
    /// Wire the engine from its collaborators. Failing to open the
    /// checkpoint database is fatal.
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn WorkflowSource>,
        models: Arc<dyn ModelProvider>,
        connector: Arc<dyn ToolServerConnector>,
    ) -> Result<Self> {
        let db = Database::open(&config.checkpoint_db)?;
        let results = Arc::new(ResultCache::new(config.result_cache_capacity));
        let registry = Arc::new(PluginRegistry::load(config.plugin_dirs.clone()));
        let plugins = Arc::new(PluginRuntimeFactory::new(
            registry.clone(),
            connector,
            results.clone(),
            config.handshake_timeout(),
        ));
        let assembler = AssistantRuntimeAssembler::new(
            source.clone(),
            plugins.clone(),
            models.clone(),
            config.allow_self_handoff,
        );
        let compiler = Arc::new(WorkflowCompiler::new(
            source.clone(),
            assembler,
            models,
            db.clone(),
            config.max_agent_steps,
        ));
        let runtimes = RuntimeCache::new(compiler.clone());

        tracing::info!(
            "[Engine] Ready: {} plugin(s), checkpoints at {}",
            registry.len(),
            config.checkpoint_db
        );

        Ok(Self {
            config,
            db,
            source,
            results,
            registry,
            plugins,
            compiler,
            runtimes,
        })
    }

    /// Production wiring: YAML workflow directory, HTTP chat model, MCP tool servers.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let source: Arc<dyn WorkflowSource> =
            Arc::new(YamlWorkflowSource::new(config.workflow_dir_or_default()));
        let models: Arc<dyn ModelProvider> = Arc::new(StaticModelProvider::new(Arc::new(
            HttpChatModel::new(config.model.clone()),
        )));
        Self::new(config, source, models, Arc::new(McpConnector::new()))
    }

    /// Release every cached graph and shared plugin instance.
    pub async fn shutdown(&self) {
        self.runtimes.close_all().await;
        self.plugins.close_singletons().await;
        tracing::info!("[Engine] Shut down");
    }
}

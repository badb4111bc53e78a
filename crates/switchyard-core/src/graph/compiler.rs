//! Workflow compilation.
//!
//! A build ends in one of two outcomes: the full multi-agent graph, or the
//! single-node fallback together with the reason it was chosen. The fallback
//! is also what a failed workflow build degrades to, so a workflow id is
//! always served. The only error that escapes is a checkpoint store that
//! cannot be opened even for the fallback.

use std::sync::Arc;

use async_trait::async_trait;

use super::CompiledRuntime;
use crate::assistant::AssistantRuntimeAssembler;
use crate::db::Database;
use crate::error::{EngineError, Result};
use crate::llm::ModelProvider;
use crate::models::{WorkflowSpec, FALLBACK_WORKFLOW_ID};
use crate::scope::ResourceScope;
use crate::store::{CheckpointStore, WorkflowSource};

/// A compiled graph together with everything opened to build it.
#[derive(Debug)]
pub struct BuiltGraph {
    pub runtime: Arc<CompiledRuntime>,
    pub scope: ResourceScope,
}

#[derive(Debug)]
pub enum BuildOutcome {
    Workflow(BuiltGraph),
    Fallback { graph: BuiltGraph, reason: String },
}

impl BuildOutcome {
    pub fn runtime(&self) -> &Arc<CompiledRuntime> {
        match self {
            BuildOutcome::Workflow(graph) | BuildOutcome::Fallback { graph, .. } => &graph.runtime,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, BuildOutcome::Fallback { .. })
    }

    pub fn into_graph(self) -> BuiltGraph {
        match self {
            BuildOutcome::Workflow(graph) | BuildOutcome::Fallback { graph, .. } => graph,
        }
    }
}

/// Builds graphs by workflow id; the seam the runtime cache compiles through.
#[async_trait]
pub trait GraphBuilder: Send + Sync {
    async fn build(&self, workflow_id: &str) -> Result<BuildOutcome>;
}

pub struct WorkflowCompiler {
    source: Arc<dyn WorkflowSource>,
    assembler: AssistantRuntimeAssembler,
    models: Arc<dyn ModelProvider>,
    db: Database,
    max_steps: usize,
}

impl WorkflowCompiler {
    pub fn new(
        source: Arc<dyn WorkflowSource>,
        assembler: AssistantRuntimeAssembler,
        models: Arc<dyn ModelProvider>,
        db: Database,
        max_steps: usize,
    ) -> Self {
        Self {
            source,
            assembler,
            models,
            db,
            max_steps,
        }
    }

    pub async fn compile(&self, workflow_id: &str) -> Result<BuildOutcome> {
        if workflow_id == FALLBACK_WORKFLOW_ID {
            return self.build_fallback(workflow_id, "fallback workflow requested").await;
        }

        let spec = match self.source.workflow(workflow_id).await {
            Ok(Some(spec)) => spec,
            Ok(None) => {
                return self
                    .build_fallback(workflow_id, &format!("workflow '{}' not found", workflow_id))
                    .await;
            }
            Err(e) => return self.build_fallback(workflow_id, &e.to_string()).await,
        };

        let mut scope = ResourceScope::new(workflow_id);
        match self.build_workflow(&spec, &mut scope).await {
            Ok(runtime) => {
                tracing::info!(
                    workflow_id = %workflow_id,
                    "[WorkflowCompiler] Built workflow '{}' ({} resource(s))",
                    workflow_id,
                    scope.len()
                );
                Ok(BuildOutcome::Workflow(BuiltGraph {
                    runtime: Arc::new(runtime),
                    scope,
                }))
            }
            Err(e) => {
                tracing::error!(
                    workflow_id = %workflow_id,
                    "[WorkflowCompiler] Build of '{}' failed, serving fallback: {}",
                    workflow_id,
                    e
                );
                scope.close().await;
                self.build_fallback(workflow_id, &e.to_string()).await
            }
        }
    }

    async fn build_workflow(
        &self,
        spec: &WorkflowSpec,
        scope: &mut ResourceScope,
    ) -> Result<CompiledRuntime> {
        spec.validate()?;
        let start = spec.start_node()?;

        let checkpoints = CheckpointStore::open(self.db.clone(), spec.id.clone()).await?;
        scope.push(Arc::new(checkpoints.clone()));

        let assembled = self.assembler.build(spec, scope).await?;
        let default_assistant = assembled
            .assistant_for_node(&start.id)
            .map(|a| a.name.clone())
            .ok_or_else(|| {
                EngineError::Build(format!("start node '{}' has no assistant", start.id))
            })?;

        Ok(CompiledRuntime::multi_agent(
            spec.id.clone(),
            assembled.assistants,
            default_assistant,
            checkpoints,
            self.max_steps,
        ))
    }

    /// Always a fresh scope; never reuses anything from a failed attempt.
    async fn build_fallback(&self, workflow_id: &str, reason: &str) -> Result<BuildOutcome> {
        let checkpoints = CheckpointStore::open(self.db.clone(), workflow_id)
            .await
            .map_err(|e| {
                tracing::error!(
                    "[WorkflowCompiler] Cannot open checkpoint store for fallback: {}",
                    e
                );
                e
            })?;

        let mut scope = ResourceScope::new(workflow_id);
        scope.push(Arc::new(checkpoints.clone()));
        let runtime = CompiledRuntime::fallback(
            workflow_id,
            self.models.default_model(),
            checkpoints,
            reason,
        );
        tracing::info!(
            workflow_id = %workflow_id,
            "[WorkflowCompiler] Built fallback graph for '{}': {}",
            workflow_id,
            reason
        );
        Ok(BuildOutcome::Fallback {
            graph: BuiltGraph {
                runtime: Arc::new(runtime),
                scope,
            },
            reason: reason.to_string(),
        })
    }
}

#[async_trait]
impl GraphBuilder for WorkflowCompiler {
    async fn build(&self, workflow_id: &str) -> Result<BuildOutcome> {
        self.compile(workflow_id).await
    }
}

//! Read-only access to workflow and assistant definitions.
//!
//! Persistence of these documents belongs to the host application; the
//! engine only looks them up by id when compiling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::models::{AssistantSpec, WorkflowSpec};

#[async_trait]
pub trait WorkflowSource: Send + Sync {
    async fn workflow(&self, id: &str) -> Result<Option<WorkflowSpec>>;

    async fn assistant(&self, id: &str) -> Result<Option<AssistantSpec>>;
}

/// In-memory source, for embedding hosts and tests.
#[derive(Default)]
pub struct MemoryWorkflowSource {
    workflows: RwLock<HashMap<String, WorkflowSpec>>,
    assistants: RwLock<HashMap<String, AssistantSpec>>,
}

impl MemoryWorkflowSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_workflow(&self, spec: WorkflowSpec) {
        if let Ok(mut map) = self.workflows.write() {
            map.insert(spec.id.clone(), spec);
        }
    }

    pub fn upsert_assistant(&self, spec: AssistantSpec) {
        if let Ok(mut map) = self.assistants.write() {
            map.insert(spec.id.clone(), spec);
        }
    }

    pub fn remove_workflow(&self, id: &str) -> Option<WorkflowSpec> {
        self.workflows.write().ok().and_then(|mut map| map.remove(id))
    }
}

#[async_trait]
impl WorkflowSource for MemoryWorkflowSource {
    async fn workflow(&self, id: &str) -> Result<Option<WorkflowSpec>> {
        Ok(self
            .workflows
            .read()
            .map_err(|e| EngineError::Internal(format!("Lock poisoned: {}", e)))?
            .get(id)
            .cloned())
    }

    async fn assistant(&self, id: &str) -> Result<Option<AssistantSpec>> {
        Ok(self
            .assistants
            .read()
            .map_err(|e| EngineError::Internal(format!("Lock poisoned: {}", e)))?
            .get(id)
            .cloned())
    }
}

/// One YAML document in a workflow directory.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Document {
    Workflow(WorkflowSpec),
    Assistant(AssistantSpec),
}

/// Reads `*.yaml` / `*.yml` documents from a directory on every lookup, so
/// edits are picked up by the next rebuild without a reload step.
///
/// ```yaml
/// kind: workflow
/// id: support
/// name: Support desk
/// nodes:
///   - { id: triage, assistant_id: triage, is_start: true }
///   - { id: billing, assistant_id: billing }
/// edges:
///   - { source: triage, target: billing, mode: bidirectional }
/// ```
pub struct YamlWorkflowSource {
    dir: PathBuf,
}

#[derive(Default)]
struct Documents {
    workflows: HashMap<String, WorkflowSpec>,
    assistants: HashMap<String, AssistantSpec>,
}

impl YamlWorkflowSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether `path` names a definition document this source would read.
    pub fn is_document(path: &Path) -> bool {
        path.extension()
            .map(|ext| ext == "yaml" || ext == "yml")
            .unwrap_or(false)
    }

    /// Ids of every workflow currently defined in the directory.
    pub async fn workflow_ids(&self) -> Result<Vec<String>> {
        let docs = self.load().await?;
        let mut ids: Vec<String> = docs.workflows.into_keys().collect();
        ids.sort();
        Ok(ids)
    }

    async fn load(&self) -> Result<Documents> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || load_documents(&dir))
            .await
            .map_err(|e| EngineError::Internal(format!("Task join error: {}", e)))
    }
}

#[async_trait]
impl WorkflowSource for YamlWorkflowSource {
    async fn workflow(&self, id: &str) -> Result<Option<WorkflowSpec>> {
        Ok(self.load().await?.workflows.remove(id))
    }

    async fn assistant(&self, id: &str) -> Result<Option<AssistantSpec>> {
        Ok(self.load().await?.assistants.remove(id))
    }
}

fn yaml_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && YamlWorkflowSource::is_document(p))
        .collect();
    files.sort();
    files
}

fn load_documents(dir: &Path) -> Documents {
    let mut docs = Documents::default();
    for path in yaml_files(dir) {
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("[WorkflowSource] Failed to read {}: {}", path.display(), e);
                continue;
            }
        };
        match serde_yaml::from_str::<Document>(&content) {
            Ok(Document::Workflow(spec)) => {
                docs.workflows.insert(spec.id.clone(), spec);
            }
            Ok(Document::Assistant(spec)) => {
                docs.assistants.insert(spec.id.clone(), spec);
            }
            Err(e) => {
                tracing::warn!("[WorkflowSource] Skipping {}: {}", path.display(), e);
            }
        }
    }
    docs
}

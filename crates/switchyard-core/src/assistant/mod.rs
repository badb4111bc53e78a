//! Assistant runtimes: one runnable, model-bound unit per workflow node.
//!
//! Every runtime is built fresh for one workflow build. Destinations are
//! computed from that build's edges only and never mutated afterwards, so
//! routes from one workflow cannot leak into another.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;

use crate::error::{EngineError, Result};
use crate::llm::{ChatModel, ModelProvider, ToolDefinition};
use crate::models::{AssistantSpec, EdgeMode, WorkflowSpec};
use crate::plugins::{PluginRuntime, PluginRuntimeFactory, RuntimeKind};
use crate::scope::ResourceScope;
use crate::store::WorkflowSource;

const HANDOFF_PREFIX: &str = "transfer_to_";
/// Longest tool name chat providers accept.
const MAX_TOOL_NAME_LEN: usize = 64;

/// A synthesized tool that hands control to another assistant.
#[derive(Debug, Clone, PartialEq)]
pub struct HandoffTool {
    pub name: String,
    /// Assistant name control passes to.
    pub destination: String,
    pub description: String,
}

impl HandoffTool {
    pub fn new(destination: &str) -> Self {
        Self::named(handoff_tool_name(destination), destination)
    }

    fn named(name: String, destination: &str) -> Self {
        Self {
            name,
            destination: destination.to_string(),
            description: format!("Transfer the conversation to {}.", destination),
        }
    }

    /// Acknowledgement recorded as the handoff call's tool message.
    pub fn acknowledgement(&self) -> String {
        format!("Successfully transferred to {}", self.destination)
    }
}

/// Base handoff tool name for a destination.
///
/// ASCII letters and digits are lowercased, other ASCII becomes `_`, and
/// non-ASCII characters are spelled as `u` plus their hex code point, so
/// `客服` and `销售` stay distinct. Names that differ only in case or
/// punctuation still share a base; [`handoff_tools`] suffixes those.
pub fn handoff_tool_name(destination: &str) -> String {
    let mut slug = String::new();
    for c in destination.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if c.is_ascii() {
            slug.push('_');
        } else {
            slug.push_str(&format!("u{:x}", c as u32));
        }
    }
    if slug.is_empty() {
        slug.push_str("assistant");
    }
    let mut name = format!("{}{}", HANDOFF_PREFIX, slug);
    name.truncate(MAX_TOOL_NAME_LEN);
    name
}

/// One handoff tool per destination, with names unique among themselves
/// and against `taken`. Later collisions get `_2`, `_3`, ... in
/// destination order.
pub fn handoff_tools<'a>(
    destinations: &[String],
    taken: impl IntoIterator<Item = &'a String>,
) -> Vec<HandoffTool> {
    let mut used: HashSet<String> = taken.into_iter().cloned().collect();
    destinations
        .iter()
        .map(|destination| {
            let base = handoff_tool_name(destination);
            let mut name = base.clone();
            let mut n = 2;
            while used.contains(&name) {
                let suffix = format!("_{}", n);
                let keep = base.len().min(MAX_TOOL_NAME_LEN - suffix.len());
                name = format!("{}{}", &base[..keep], suffix);
                n += 1;
            }
            used.insert(name.clone());
            HandoffTool::named(name, destination)
        })
        .collect()
}

/// What a tool name resolves to inside one assistant.
pub enum ToolTarget<'a> {
    Plugin(&'a Arc<PluginRuntime>),
    Handoff(&'a HandoffTool),
}

pub struct AssistantRuntime {
    pub id: String,
    pub name: String,
    pub instructions: String,
    /// Active plugins by registry id.
    pub plugins: BTreeMap<String, Arc<PluginRuntime>>,
    /// Linked plugins that failed to start, with their errors.
    pub unavailable: BTreeMap<String, String>,
    /// Assistant names reachable by handoff in this workflow.
    pub destinations: Vec<String>,
    pub handoffs: Vec<HandoffTool>,
    model: Arc<dyn ChatModel>,
    /// Exposed tool name to owning plugin id.
    tool_index: HashMap<String, String>,
}

impl AssistantRuntime {
    pub fn new(
        spec: &AssistantSpec,
        model: Arc<dyn ChatModel>,
        plugins: Vec<Arc<PluginRuntime>>,
        destinations: Vec<String>,
    ) -> Self {
        let mut tool_index = HashMap::new();
        let mut by_id = BTreeMap::new();
        let mut unavailable = BTreeMap::new();
        for plugin in plugins {
            if !plugin.is_active() {
                unavailable.insert(
                    plugin.registry_id().to_string(),
                    plugin.error().unwrap_or("unavailable").to_string(),
                );
                continue;
            }
            for tool in plugin.list_tools() {
                if let Some(owner) = tool_index.get(&tool.exposed_name) {
                    tracing::warn!(
                        "[Assistant] '{}': tool '{}' from '{}' shadowed by '{}'",
                        spec.name,
                        tool.exposed_name,
                        plugin.registry_id(),
                        owner
                    );
                    continue;
                }
                tool_index.insert(tool.exposed_name.clone(), plugin.registry_id().to_string());
            }
            by_id.insert(plugin.registry_id().to_string(), plugin);
        }

        let handoffs = handoff_tools(&destinations, tool_index.keys());
        for handoff in &handoffs {
            if handoff.name != handoff_tool_name(&handoff.destination) {
                tracing::warn!(
                    "[Assistant] '{}': handoff to '{}' renamed to '{}' to stay unique",
                    spec.name,
                    handoff.destination,
                    handoff.name
                );
            }
        }
        Self {
            id: spec.id.clone(),
            name: spec.name.clone(),
            instructions: spec.instructions.clone(),
            plugins: by_id,
            unavailable,
            destinations,
            handoffs,
            model,
            tool_index,
        }
    }

    pub fn model(&self) -> &Arc<dyn ChatModel> {
        &self.model
    }

    /// Tool surface advertised to the model: plugin tools, then handoffs.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = Vec::new();
        for (registry_id, plugin) in &self.plugins {
            for tool in plugin.list_tools() {
                if self.tool_index.get(&tool.exposed_name) == Some(registry_id) {
                    defs.push(ToolDefinition {
                        name: tool.exposed_name,
                        description: tool.description,
                        parameters: tool.input_schema,
                    });
                }
            }
        }
        for handoff in &self.handoffs {
            defs.push(ToolDefinition {
                name: handoff.name.clone(),
                description: handoff.description.clone(),
                parameters: json!({ "type": "object", "properties": {} }),
            });
        }
        defs
    }

    pub fn resolve_tool(&self, name: &str) -> Option<ToolTarget<'_>> {
        if let Some(handoff) = self.handoffs.iter().find(|h| h.name == name) {
            return Some(ToolTarget::Handoff(handoff));
        }
        self.tool_index
            .get(name)
            .and_then(|id| self.plugins.get(id))
            .map(ToolTarget::Plugin)
    }
}

impl std::fmt::Debug for AssistantRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssistantRuntime")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .field("destinations", &self.destinations)
            .finish()
    }
}

/// Destination adjacency by node id.
///
/// Each edge adds its target to the source's set; a bidirectional edge also
/// adds the source to the target's set. A single edge is one-way: its
/// target cannot hand control back unless another edge says so. Self-loops
/// are dropped unless `allow_self` is set. Every node gets an entry,
/// possibly empty.
pub fn compute_destinations(
    spec: &WorkflowSpec,
    allow_self: bool,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut adjacency: BTreeMap<String, BTreeSet<String>> = spec
        .nodes
        .iter()
        .map(|n| (n.id.clone(), BTreeSet::new()))
        .collect();

    let mut link = |from: &str, to: &str| {
        if from == to && !allow_self {
            return;
        }
        adjacency
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
    };

    for edge in &spec.edges {
        link(&edge.source, &edge.target);
        if edge.mode == EdgeMode::Bidirectional {
            link(&edge.target, &edge.source);
        }
    }
    adjacency
}

/// Output of one assembly.
#[derive(Debug)]
pub struct AssembledWorkflow {
    /// Runtimes keyed by assistant name.
    pub assistants: BTreeMap<String, Arc<AssistantRuntime>>,
    /// Node id to assistant name, for nodes whose assistant resolved.
    pub node_assistants: BTreeMap<String, String>,
}

impl AssembledWorkflow {
    pub fn assistant_for_node(&self, node_id: &str) -> Option<&Arc<AssistantRuntime>> {
        self.node_assistants
            .get(node_id)
            .and_then(|name| self.assistants.get(name))
    }
}

pub struct AssistantRuntimeAssembler {
    source: Arc<dyn WorkflowSource>,
    factory: Arc<PluginRuntimeFactory>,
    models: Arc<dyn ModelProvider>,
    allow_self_handoff: bool,
}

impl AssistantRuntimeAssembler {
    pub fn new(
        source: Arc<dyn WorkflowSource>,
        factory: Arc<PluginRuntimeFactory>,
        models: Arc<dyn ModelProvider>,
        allow_self_handoff: bool,
    ) -> Self {
        Self {
            source,
            factory,
            models,
            allow_self_handoff,
        }
    }

    /// Build one runtime per distinct assistant in the workflow.
    ///
    /// Per-link plugin runtimes are pushed into `scope` as soon as they are
    /// created, so a failure later in the build still releases them. A
    /// plugin that fails to start contributes no tools and is reported under
    /// the assistant's `unavailable` map.
    pub async fn build(
        &self,
        spec: &WorkflowSpec,
        scope: &mut ResourceScope,
    ) -> Result<AssembledWorkflow> {
        let start = spec.start_node()?;

        let mut specs: BTreeMap<String, AssistantSpec> = BTreeMap::new();
        let mut node_assistants = BTreeMap::new();
        for node in &spec.nodes {
            match self.source.assistant(&node.assistant_id).await? {
                Some(assistant) => {
                    node_assistants.insert(node.id.clone(), assistant.name.clone());
                    specs.entry(assistant.name.clone()).or_insert(assistant);
                }
                None if node.id == start.id => {
                    return Err(EngineError::NotFound(format!(
                        "assistant '{}' for start node '{}'",
                        node.assistant_id, node.id
                    )));
                }
                None => {
                    tracing::warn!(
                        workflow_id = %spec.id,
                        "[Assembler] Node '{}' references unknown assistant '{}'; skipping",
                        node.id,
                        node.assistant_id
                    );
                }
            }
        }

        // Node adjacency lifted to assistant names; unresolved nodes drop out.
        let mut destinations: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (from, targets) in compute_destinations(spec, self.allow_self_handoff) {
            let Some(from_name) = node_assistants.get(&from) else {
                continue;
            };
            let set = destinations.entry(from_name.clone()).or_default();
            for to in targets {
                if let Some(to_name) = node_assistants.get(&to) {
                    if to_name != from_name || self.allow_self_handoff {
                        set.insert(to_name.clone());
                    }
                }
            }
        }

        let mut assistants = BTreeMap::new();
        for (name, assistant) in &specs {
            let plugins = self.build_plugins(assistant, scope).await;
            let runtime = AssistantRuntime::new(
                assistant,
                self.models.model_for(assistant),
                plugins,
                destinations
                    .get(name)
                    .map(|s| s.iter().cloned().collect())
                    .unwrap_or_default(),
            );
            tracing::debug!(
                workflow_id = %spec.id,
                "[Assembler] Assistant '{}' ready: {} plugin(s), destinations {:?}",
                name,
                runtime.plugins.len(),
                runtime.destinations
            );
            assistants.insert(name.clone(), Arc::new(runtime));
        }

        Ok(AssembledWorkflow {
            assistants,
            node_assistants,
        })
    }

    async fn build_plugins(
        &self,
        assistant: &AssistantSpec,
        scope: &mut ResourceScope,
    ) -> Vec<Arc<PluginRuntime>> {
        let mut plugins = Vec::new();
        for link in assistant.plugins.iter().filter(|l| l.enabled) {
            let Some(manifest) = self.factory.registry().get(&link.registry_id) else {
                tracing::warn!(
                    "[Assembler] Assistant '{}' links unknown plugin '{}'",
                    assistant.name,
                    link.registry_id
                );
                continue;
            };

            let runtime = self.factory.runtime_for_link(&manifest, link).await;
            if runtime.kind() == RuntimeKind::PerLink {
                scope.push(runtime.clone());
            }
            if !runtime.is_active() {
                tracing::warn!(
                    "[Assembler] Assistant '{}' continues without plugin '{}': {}",
                    assistant.name,
                    link.registry_id,
                    runtime.error().unwrap_or("unknown error")
                );
            }
            plugins.push(runtime);
        }
        plugins
    }
}

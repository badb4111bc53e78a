//! Assistant definitions and their per-assistant plugin links.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantSpec {
    pub id: String,

    /// Display name; also the routing name used by handoff tools.
    pub name: String,

    /// System instructions handed to the language model.
    #[serde(default)]
    pub instructions: String,

    /// Ordered plugin links.
    #[serde(default)]
    pub plugins: Vec<PluginRef>,
}

/// Link between an assistant and a registered plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginRef {
    /// Registry id of the plugin manifest.
    #[serde(alias = "registryId")]
    pub registry_id: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// When false every tool starts disabled and only overrides enable them.
    #[serde(default = "default_true")]
    pub tools_default_enabled: bool,

    /// Tool-level overrides, applied in order.
    #[serde(default)]
    pub tools: Vec<ToolOverride>,

    /// User-supplied configuration values, validated against the manifest schema.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl PluginRef {
    pub fn new(registry_id: impl Into<String>) -> Self {
        Self {
            registry_id: registry_id.into(),
            enabled: true,
            tools_default_enabled: true,
            tools: Vec::new(),
            config: serde_json::Map::new(),
        }
    }

    /// True when the link neither configures nor reshapes the plugin's tools.
    pub fn is_plain(&self) -> bool {
        self.tools_default_enabled && self.tools.is_empty() && self.config.is_empty()
    }
}

/// Per-tool override on a plugin link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolOverride {
    /// Name of the tool as the tool server reports it.
    pub name: String,

    /// Explicit enable/disable; an override without this flag enables the tool.
    #[serde(default)]
    pub enabled: Option<bool>,

    /// Alias under which the tool is exposed instead of its original name.
    #[serde(default)]
    pub rename: Option<String>,

    #[serde(default)]
    pub description: Option<String>,
}

impl AssistantSpec {
    /// Parse an assistant definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            EngineError::InvalidSpec(format!("Failed to parse assistant YAML: {}", e))
        })
    }
}

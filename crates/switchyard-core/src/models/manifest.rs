//! Plugin manifests — static, registry-sourced plugin definitions.
//!
//! ```yaml
//! id: sql
//! display_name: "SQL Explorer"
//! version: "1.2.0"
//! config_schema:
//!   - name: dsn
//!     type: string
//!     required: true
//!     secret: true
//!   - name: pool_size
//!     type: integer
//!     default: 4
//! execution:
//!   mode: local
//!   script_path: server.py
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Primitive type of a configuration field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    #[serde(alias = "int")]
    Integer,
    #[serde(alias = "number")]
    Float,
    #[serde(alias = "boolean")]
    Bool,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "string"),
            FieldType::Integer => write!(f, "integer"),
            FieldType::Float => write!(f, "float"),
            FieldType::Bool => write!(f, "bool"),
        }
    }
}

/// One entry of a manifest's configuration schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigField {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Secret values never appear in rendered output.
    #[serde(default)]
    pub secret: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Local,
    Remote,
}

/// How the plugin's tool server is reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub mode: ExecutionMode,
    /// Script launched as a subprocess (local mode), relative to the manifest.
    #[serde(default)]
    pub script_path: Option<String>,
    /// Extra arguments passed to the script.
    #[serde(default)]
    pub args: Vec<String>,
    /// Tool-server endpoint (remote mode).
    #[serde(default)]
    pub url: Option<String>,
}

/// A named server entry used by config-free (singleton) plugins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServerDescriptor {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginManifest {
    /// Registry id; defaults to the manifest's directory name when empty.
    #[serde(default)]
    pub id: String,

    #[serde(alias = "displayName")]
    pub display_name: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default, alias = "configSchema")]
    pub config_schema: Vec<ConfigField>,

    pub execution: Execution,

    /// Optional named servers; the first entry backs the shared instance.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerDescriptor>,

    /// Directory the manifest was loaded from.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

impl PluginManifest {
    /// Parse a manifest from YAML (JSON documents parse as well).
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let manifest: Self = serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::Manifest(format!("Failed to parse manifest: {}", e)))?;
        manifest.check()?;
        Ok(manifest)
    }

    /// Load a manifest file, filling `base_dir` and a missing `id`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Manifest(format!("Failed to read manifest '{}': {}", path.display(), e))
        })?;
        let mut manifest = Self::from_yaml(&content)
            .map_err(|e| EngineError::Manifest(format!("{} ({})", e, path.display())))?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        if manifest.id.is_empty() {
            manifest.id = base_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| manifest.display_name.clone());
        }
        manifest.base_dir = base_dir;
        Ok(manifest)
    }

    fn check(&self) -> Result<()> {
        match self.execution.mode {
            ExecutionMode::Local if self.execution.script_path.is_none() && self.servers.is_empty() => {
                Err(EngineError::Manifest(format!(
                    "plugin '{}' is local but declares no script_path",
                    self.display_name
                )))
            }
            ExecutionMode::Remote if self.execution.url.is_none() && self.servers.is_empty() => {
                Err(EngineError::Manifest(format!(
                    "plugin '{}' is remote but declares no url",
                    self.display_name
                )))
            }
            _ => Ok(()),
        }
    }

    /// Plugins without a configuration schema can share one process-wide instance.
    pub fn is_config_free(&self) -> bool {
        self.config_schema.is_empty()
    }

    /// Resolve a path relative to the manifest's directory.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }
}

//! Engine configuration loaded from YAML.
//!
//! ```yaml
//! checkpoint_db: "${SWITCHYARD_HOME:-.}/switchyard.db"
//! plugin_dirs:
//!   - ./plugins
//! workflow_dir: ./workflows
//! result_cache_capacity: 256
//! handshake_timeout_ms: 10000
//! rebuild_debounce_ms: 200
//! model:
//!   adapter: openai
//!   base_url: "${OPENAI_BASE_URL:-https://api.openai.com/v1}"
//!   api_key: "${OPENAI_API_KEY}"
//!   model: gpt-4o-mini
//! ```
//!
//! Every string supports `${ENV_VAR}` and `${ENV_VAR:-default}` references.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite file backing conversation checkpoints (`:memory:` is accepted).
    #[serde(default = "default_checkpoint_db")]
    pub checkpoint_db: String,

    /// Directories scanned for plugin manifests.
    #[serde(default = "default_plugin_dirs")]
    pub plugin_dirs: Vec<PathBuf>,

    /// Directory holding workflow and assistant YAML documents.
    #[serde(default)]
    pub workflow_dir: Option<PathBuf>,

    /// Maximum number of tool results kept in the result cache.
    #[serde(default = "default_result_cache_capacity")]
    pub result_cache_capacity: usize,

    /// Upper bound on connecting to and probing a tool server.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Default delay for coalesced rebuild requests.
    #[serde(default = "default_rebuild_debounce_ms")]
    pub rebuild_debounce_ms: u64,

    /// Maximum model turns per request inside a multi-agent graph.
    #[serde(default = "default_max_agent_steps")]
    pub max_agent_steps: usize,

    /// Whether an edge from a node to itself produces a handoff tool.
    #[serde(default)]
    pub allow_self_handoff: bool,

    /// Language-model settings handed to the model provider.
    #[serde(default)]
    pub model: ModelSettings,
}

fn default_checkpoint_db() -> String {
    "switchyard.db".to_string()
}

fn default_plugin_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![PathBuf::from("plugins")];
    if let Some(home) = dirs::home_dir() {
        dirs.push(home.join(".switchyard").join("plugins"));
    }
    dirs
}

fn default_result_cache_capacity() -> usize {
    crate::results::cache::DEFAULT_CAPACITY
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_rebuild_debounce_ms() -> u64 {
    200
}

fn default_max_agent_steps() -> usize {
    16
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_db: default_checkpoint_db(),
            plugin_dirs: default_plugin_dirs(),
            workflow_dir: None,
            result_cache_capacity: default_result_cache_capacity(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            rebuild_debounce_ms: default_rebuild_debounce_ms(),
            max_agent_steps: default_max_agent_steps(),
            allow_self_handoff: false,
            model: ModelSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from a YAML string, expanding env references first.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(&resolve_env_vars(yaml))
            .map_err(|e| EngineError::Config(format!("Failed to parse engine config: {}", e)))
    }

    /// Load a configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read config file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn rebuild_debounce(&self) -> Duration {
        Duration::from_millis(self.rebuild_debounce_ms)
    }

    /// Workflow document directory, `./workflows` when unset.
    pub fn workflow_dir_or_default(&self) -> PathBuf {
        self.workflow_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("workflows"))
    }
}

/// Language-model selection, consumed opaquely by the model provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Adapter type: "openai" (chat/completions) or "anthropic" (v1/messages)
    #[serde(default = "default_adapter")]
    pub adapter: String,

    /// API base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key / auth token
    #[serde(default)]
    pub api_key: String,

    /// Model ID
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default)]
    pub temperature: Option<f64>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

fn default_adapter() -> String {
    "openai".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_request_timeout() -> u64 {
    300
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            adapter: default_adapter(),
            base_url: default_base_url(),
            api_key: String::new(),
            model: default_model(),
            temperature: None,
            max_tokens: default_max_tokens(),
            timeout_secs: default_request_timeout(),
        }
    }
}

/// Resolve environment variable references in a string.
/// Supports `${ENV_VAR}` and `${ENV_VAR:-default}` syntax.
pub fn resolve_env_vars(input: &str) -> String {
    static ENV_REF: OnceLock<regex::Regex> = OnceLock::new();
    let re = ENV_REF.get_or_init(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("valid env pattern"));
    re.replace_all(input, |caps: &regex::Captures| {
        let var_expr = &caps[1];
        if let Some(idx) = var_expr.find(":-") {
            let var_name = &var_expr[..idx];
            let default_val = &var_expr[idx + 2..];
            std::env::var(var_name).unwrap_or_else(|_| default_val.to_string())
        } else {
            std::env::var(var_expr).unwrap_or_else(|_| format!("${{{}}}", var_expr))
        }
    })
    .to_string()
}

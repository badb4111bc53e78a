//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and works on the
//! shared `EngineContext`.

pub mod chat;
pub mod inspect;
pub mod plugins;
pub mod watch;

use std::path::Path;
use std::sync::Arc;

use switchyard_core::{EngineConfig, EngineContext, EngineContextInner};

/// Load the engine configuration. A missing file means defaults; a file that
/// exists but does not parse is an error.
pub fn load_config(path: &str, db_override: Option<&str>) -> Result<EngineConfig, String> {
    let mut config = if Path::new(path).exists() {
        EngineConfig::from_file(path).map_err(|e| e.to_string())?
    } else {
        tracing::debug!("Config file '{}' not found; using defaults", path);
        EngineConfig::default()
    };
    if let Some(db) = db_override {
        config.checkpoint_db = db.to_string();
    }
    Ok(config)
}

/// Build the engine context or exit.
pub fn init_context(config_path: &str, db_override: Option<&str>) -> EngineContext {
    let config = load_config(config_path, db_override).unwrap_or_else(|e| {
        eprintln!("Failed to load config '{}': {}", config_path, e);
        std::process::exit(1);
    });

    let ctx = EngineContextInner::from_config(config).unwrap_or_else(|e| {
        eprintln!("Failed to start engine: {}", e);
        std::process::exit(1);
    });
    Arc::new(ctx)
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

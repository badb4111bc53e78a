//! Core error type for the Switchyard engine.
//!
//! `EngineError` is used throughout the crate. Plugin and workflow failures
//! are normally absorbed at their component boundary (plugin status, compiler
//! fallback); the variants here are what remains visible to callers.

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow spec: {0}")]
    InvalidSpec(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("Build failed: {0}")]
    Build(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Checkpoint(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Internal(format!("JSON error: {}", e))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Internal(format!("I/O error: {}", e))
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(e: serde_yaml::Error) -> Self {
        EngineError::InvalidSpec(format!("YAML error: {}", e))
    }
}

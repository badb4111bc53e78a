//! Switchyard Core — compiles declarative workflow definitions into live
//! multi-agent runtimes and keeps them current as configuration changes.
//!
//! The crate is transport-agnostic: it never speaks HTTP to clients and never
//! persists workflow definitions itself. A serving layer asks the
//! [`RuntimeCache`] for a runnable graph and registers a rebuild callback to
//! hot-swap it when the underlying workflow changes.
//!
//! ```text
//! config change ──► RuntimeCache ──► WorkflowCompiler ──► AssistantRuntimeAssembler
//!                        │                                       │
//!                  rebuild callbacks                     PluginRuntimeFactory ──► rmcp tool servers
//!                                                                │
//!                                                           ResultCache
//! ```

pub mod assistant;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod graph;
pub mod llm;
pub mod models;
pub mod plugins;
pub mod results;
pub mod scope;
pub mod state;
pub mod store;

// Convenience re-exports
pub use cache::{EntryState, RuntimeCache};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use graph::{BuildOutcome, CompiledRuntime, WorkflowCompiler};
pub use results::ResultCache;
pub use state::{EngineContext, EngineContextInner};

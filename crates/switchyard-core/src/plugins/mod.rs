//! Plugins: manifest discovery, tool-server connections, and the factory
//! that turns manifests plus per-assistant links into live runtimes.

pub mod config_model;
pub mod connection;
pub mod factory;
pub mod registry;
pub mod runtime;

pub use config_model::{ConfigModel, FieldError, ValidatedConfig};
pub use connection::{
    McpConnector, ToolInfo, ToolServerConnection, ToolServerConnector, TransportSpec,
};
pub use factory::PluginRuntimeFactory;
pub use registry::PluginRegistry;
pub use runtime::{
    apply_tool_visibility, ExposedTool, InterceptedCall, PluginRuntime, PluginStatus,
    ResultInterceptor, RuntimeKind,
};

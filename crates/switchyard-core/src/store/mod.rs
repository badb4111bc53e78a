pub mod checkpoint_store;
pub mod workflow_source;

pub use checkpoint_store::{CheckpointStore, ThreadState};
pub use workflow_source::{MemoryWorkflowSource, WorkflowSource, YamlWorkflowSource};

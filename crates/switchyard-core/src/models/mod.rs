pub mod assistant;
pub mod manifest;
pub mod workflow;

pub use assistant::*;
pub use manifest::*;
pub use workflow::*;

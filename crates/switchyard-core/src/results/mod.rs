//! Tool results decoupled from model context.
//!
//! Full tool output lands in the [`ResultCache`]; the language model only
//! sees a short summary plus an opaque artifact id.

pub mod cache;
pub mod record;

pub use cache::ResultCache;
pub use record::{DisplayPayload, RawToolOutput, ResourceRecord, ToolEnvelope};

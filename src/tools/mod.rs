//! Tool catalog and definitions
//!
//! - `definition`: tool kinds, catalog entries, resolved specs
//! - `catalog`: builtin and YAML-loaded tool definitions

pub mod catalog;
pub mod definition;

pub use catalog::ToolCatalog;
pub use definition::{ToolDefinition, ToolKind, ToolSpec};

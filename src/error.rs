//! Error types for toolmeister
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur while coordinating tools
#[derive(Debug, Error)]
pub enum ToolMeisterError {
    /// A (group, host, tool) binding is already registered
    #[error("Duplicate binding: {tool} already registered on {host} in group {group}")]
    DuplicateBinding { group: String, host: String, tool: String },

    /// Group, binding, run, sample or tool does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Group, host or tool name cannot be used on disk
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Group is referenced by an active run
    #[error("Tool group in use: {0}")]
    GroupInUse(String),

    /// A sample of the run is starting or stopping
    #[error("Run in progress: {0}")]
    RunInProgress(String),

    /// Invalid state transition or operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Install check predicate failed
    #[error("Tool not installed: {tool}: {detail}")]
    ToolNotInstalled { tool: String, detail: String },

    /// OS-level launch failure
    #[error("Spawn error: {tool}: {detail}")]
    SpawnError { tool: String, detail: String },

    /// Tool Meister could not be reached
    #[error("Host unreachable: {host}: {detail}")]
    HostUnreachable { host: String, detail: String },

    /// Wire protocol failure
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Storage/persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Bad configuration or catalog
    #[error("Config error: {0}")]
    Config(String),

    /// Result tree or packaging failure
    #[error("Assembly error: {0}")]
    Assembly(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid trigger pattern
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

/// Result type alias for toolmeister operations
pub type Result<T> = std::result::Result<T, ToolMeisterError>;

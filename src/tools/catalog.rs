//! Tool catalog loading from YAML configuration
//!
//! Ships a builtin set of sysstat and procfs collectors; a catalog file can add
//! tools or override builtins by name.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, ToolMeisterError};

use super::definition::{ToolDefinition, ToolKind, ToolSpec};

/// YAML representation of a tool definition
#[derive(Debug, Deserialize)]
struct YamlTool {
    name: String,
    kind: Option<String>,
    command: String,
    install_check: Option<String>,
    interval: Option<u64>,
    description: Option<String>,
}

/// YAML file structure
#[derive(Debug, Deserialize)]
struct YamlCatalog {
    #[serde(default)]
    tools: Vec<YamlTool>,
}

/// Catalog of known tool definitions
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: HashMap<String, ToolDefinition>,
}

impl ToolCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the builtin collectors
    pub fn builtin() -> Self {
        let persistent = |name: &str, command: &str, binary: &str| {
            ToolDefinition::new(name, ToolKind::PersistentDatalog, command)
                .with_install_check(format!("command -v {}", binary))
        };
        let periodic = |name: &str, file: &str| {
            ToolDefinition::new(name, ToolKind::PeriodicSample, format!("cat {}", file))
                .with_install_check(format!("test -r {}", file))
        };

        let mut catalog = Self::new();
        for def in [
            persistent(
                "sar",
                r#"exec sar -A -o "$TOOL_OUTPUT_DIR/sar.data" "$TOOL_INTERVAL""#,
                "sar",
            )
            .with_description("system activity reporter"),
            persistent("iostat", r#"exec iostat -t -y -x -m "$TOOL_INTERVAL""#, "iostat")
                .with_description("block device statistics"),
            persistent("mpstat", r#"exec mpstat -P ALL "$TOOL_INTERVAL""#, "mpstat")
                .with_description("per-CPU utilization"),
            persistent("vmstat", r#"exec vmstat -t "$TOOL_INTERVAL""#, "vmstat")
                .with_description("virtual memory statistics"),
            persistent("pidstat", r#"exec pidstat -l -w -u -h -d -r "$TOOL_INTERVAL""#, "pidstat")
                .with_description("per-process statistics"),
            periodic("proc-interrupts", "/proc/interrupts").with_description("interrupt counters"),
            periodic("proc-vmstat", "/proc/vmstat").with_description("kernel memory counters"),
            ToolDefinition::new("lscpu", ToolKind::SingleShot, "lscpu")
                .with_install_check("command -v lscpu")
                .with_description("CPU topology snapshot"),
        ] {
            catalog.insert(def);
        }
        catalog
    }

    /// Load catalog from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ToolMeisterError::Config(format!("Failed to read catalog {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Load catalog from YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let catalog: YamlCatalog = serde_yaml::from_str(content)
            .map_err(|e| ToolMeisterError::Config(format!("Failed to parse catalog: {}", e)))?;

        let mut tools = HashMap::new();
        for yaml_tool in catalog.tools {
            let tool = Self::convert_yaml_tool(yaml_tool)?;
            tools.insert(tool.name.clone(), tool);
        }

        Ok(Self { tools })
    }

    fn convert_yaml_tool(yaml_tool: YamlTool) -> Result<ToolDefinition> {
        let kind = match yaml_tool.kind.as_deref() {
            None => ToolKind::default(),
            Some(k) => ToolKind::from_str(k).ok_or_else(|| {
                ToolMeisterError::Config(format!("Invalid kind '{}' for tool '{}'", k, yaml_tool.name))
            })?,
        };

        let mut tool = ToolDefinition::new(yaml_tool.name, kind, yaml_tool.command);
        if let Some(check) = yaml_tool.install_check {
            tool = tool.with_install_check(check);
        }
        if let Some(interval) = yaml_tool.interval {
            if interval == 0 {
                return Err(ToolMeisterError::Config(format!(
                    "Interval for tool '{}' must be > 0",
                    tool.name
                )));
            }
            tool = tool.with_interval(interval);
        }
        if let Some(description) = yaml_tool.description {
            tool = tool.with_description(description);
        }
        Ok(tool)
    }

    /// Add or replace a definition
    pub fn insert(&mut self, tool: ToolDefinition) {
        self.tools.insert(tool.name.clone(), tool);
    }

    /// Overlay another catalog; its entries win
    pub fn merge(mut self, other: ToolCatalog) -> Self {
        self.tools.extend(other.tools);
        self
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    /// List all tool names, sorted
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Resolve a binding into a runnable spec
    pub fn resolve(&self, tool: &str, params: &BTreeMap<String, String>) -> Result<ToolSpec> {
        self.get(tool)
            .map(|def| def.resolve(params))
            .ok_or_else(|| ToolMeisterError::NotFound(format!("tool '{}' is not in the catalog", tool)))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

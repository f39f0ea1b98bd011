//! Tool definitions and kind classification
//!
//! A `ToolDefinition` is what the catalog knows about a tool. A `ToolSpec` is
//! a definition resolved against the parameters of one registry binding, which
//! is what a Tool Meister actually runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How a tool behaves over the lifetime of a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolKind {
    /// Long-running collector that writes until told to stop
    PersistentDatalog,
    /// Command re-run every interval until told to stop
    PeriodicSample,
    /// Command run once when the sample starts
    SingleShot,
}

impl Default for ToolKind {
    fn default() -> Self {
        Self::PersistentDatalog
    }
}

impl ToolKind {
    /// Parse from string representation
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "persistent-datalog" | "persistent" | "datalog" => Some(Self::PersistentDatalog),
            "periodic-sample" | "periodic" | "transient" => Some(Self::PeriodicSample),
            "single-shot" | "once" => Some(Self::SingleShot),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PersistentDatalog => "persistent-datalog",
            Self::PeriodicSample => "periodic-sample",
            Self::SingleShot => "single-shot",
        }
    }
}

/// Parameter key that overrides a tool's sampling interval
pub const INTERVAL_PARAM: &str = "interval";

/// A catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (e.g., "sar", "iostat")
    pub name: String,
    /// Lifecycle classification
    #[serde(default)]
    pub kind: ToolKind,
    /// Shell command line; sees TOOL_OUTPUT_DIR, TOOL_INTERVAL and TOOL_PARAM_* in its environment
    pub command: String,
    /// Shell predicate that must exit 0 for the tool to be considered installed
    #[serde(default)]
    pub install_check: Option<String>,
    /// Default sampling interval in seconds
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub description: String,
}

fn default_interval() -> u64 {
    3
}

impl ToolDefinition {
    /// Create a new tool definition
    pub fn new(name: impl Into<String>, kind: ToolKind, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            command: command.into(),
            install_check: None,
            interval: default_interval(),
            description: String::new(),
        }
    }

    /// Set install check predicate
    pub fn with_install_check(mut self, check: impl Into<String>) -> Self {
        self.install_check = Some(check.into());
        self
    }

    /// Set default interval
    pub fn with_interval(mut self, secs: u64) -> Self {
        self.interval = secs;
        self
    }

    /// Set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Resolve against the parameters of one binding
    ///
    /// An `interval` parameter that parses as a positive integer overrides the
    /// default interval; everything else is passed through to the environment.
    pub fn resolve(&self, params: &BTreeMap<String, String>) -> ToolSpec {
        let interval = params
            .get(INTERVAL_PARAM)
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(self.interval);

        ToolSpec {
            name: self.name.clone(),
            kind: self.kind,
            command: self.command.clone(),
            install_check: self.install_check.clone(),
            interval,
            params: params.clone(),
        }
    }
}

/// A tool ready to run on a host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub kind: ToolKind,
    pub command: String,
    #[serde(default)]
    pub install_check: Option<String>,
    /// Sampling interval in seconds
    pub interval: u64,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl ToolSpec {
    /// Environment exported to the tool process
    pub fn env(&self, output_dir: &std::path::Path) -> Vec<(String, String)> {
        let mut env = vec![
            ("TOOL_NAME".to_string(), self.name.clone()),
            ("TOOL_OUTPUT_DIR".to_string(), output_dir.display().to_string()),
            ("TOOL_INTERVAL".to_string(), self.interval.to_string()),
        ];
        for (key, value) in &self.params {
            env.push((param_env_name(key), value.clone()));
        }
        env
    }
}

/// `TOOL_PARAM_<KEY>` with the key upper-cased and non-alphanumerics mapped to `_`
pub fn param_env_name(key: &str) -> String {
    let key: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("TOOL_PARAM_{}", key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_tool_kind_from_str() {
        assert_eq!(ToolKind::from_str("persistent-datalog"), Some(ToolKind::PersistentDatalog));
        assert_eq!(ToolKind::from_str("Periodic"), Some(ToolKind::PeriodicSample));
        assert_eq!(ToolKind::from_str("single-shot"), Some(ToolKind::SingleShot));
        assert_eq!(ToolKind::from_str("bogus"), None);
    }

    #[test]
    fn test_tool_kind_serde_kebab_case() {
        let json = serde_json::to_string(&ToolKind::PeriodicSample).unwrap();
        assert_eq!(json, "\"periodic-sample\"");
    }

    #[test]
    fn test_definition_builder() {
        let def = ToolDefinition::new("iostat", ToolKind::PersistentDatalog, "iostat -x $TOOL_INTERVAL")
            .with_install_check("command -v iostat")
            .with_interval(5)
            .with_description("block device statistics");
        assert_eq!(def.install_check.as_deref(), Some("command -v iostat"));
        assert_eq!(def.interval, 5);
    }

    #[test]
    fn test_resolve_interval_override() {
        let def = ToolDefinition::new("sar", ToolKind::PersistentDatalog, "sar");
        let mut params = BTreeMap::new();
        params.insert("interval".to_string(), "10".to_string());
        let spec = def.resolve(&params);
        assert_eq!(spec.interval, 10);
        assert_eq!(spec.params.len(), 1);
    }

    #[test]
    fn test_resolve_ignores_bad_interval() {
        let def = ToolDefinition::new("sar", ToolKind::PersistentDatalog, "sar").with_interval(7);
        let mut params = BTreeMap::new();
        params.insert("interval".to_string(), "0".to_string());
        assert_eq!(def.resolve(&params).interval, 7);
        params.insert("interval".to_string(), "soon".to_string());
        assert_eq!(def.resolve(&params).interval, 7);
    }

    #[test]
    fn test_spec_env() {
        let def = ToolDefinition::new("pidstat", ToolKind::PersistentDatalog, "pidstat");
        let mut params = BTreeMap::new();
        params.insert("patterns-file".to_string(), "/tmp/p".to_string());
        let spec = def.resolve(&params);
        let env = spec.env(Path::new("/out/pidstat"));
        assert!(env.contains(&("TOOL_OUTPUT_DIR".to_string(), "/out/pidstat".to_string())));
        assert!(env.contains(&("TOOL_INTERVAL".to_string(), "3".to_string())));
        assert!(env.contains(&("TOOL_PARAM_PATTERNS_FILE".to_string(), "/tmp/p".to_string())));
    }
}

//! Persistent tool group registry
//!
//! Layout under the registry root:
//!
//! ```text
//! tools-v1-<group>/
//!     __order__        "<host> <tool>" per line, insertion order
//!     __trigger__      optional YAML start/stop/mode
//!     <host>/
//!         __label__    optional host label
//!         <tool>       YAML mapping of parameters
//! ```
//!
//! Every file is plain text so a registration can be diffed and edited by hand.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Result, ToolMeisterError};
use crate::trigger::Trigger;

pub const GROUP_PREFIX: &str = "tools-v1-";
const ORDER_FILE: &str = "__order__";
const TRIGGER_FILE: &str = "__trigger__";
const LABEL_FILE: &str = "__label__";

/// One (host, tool) binding in a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub host: String,
    pub tool: String,
    pub params: BTreeMap<String, String>,
}

/// Registry rooted at a directory
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    root: PathBuf,
}

/// Reject names that would escape or collide with registry files
pub fn validate_name(what: &str, name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.starts_with("__")
        || name.chars().any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control());
    if bad {
        return Err(ToolMeisterError::InvalidName(format!("{} name '{}'", what, name)));
    }
    Ok(())
}

impl ToolRegistry {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            ToolMeisterError::Storage(format!("Cannot create registry {}: {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn group_dir(&self, group: &str) -> PathBuf {
        self.root.join(format!("{}{}", GROUP_PREFIX, group))
    }

    fn existing_group_dir(&self, group: &str) -> Result<PathBuf> {
        validate_name("group", group)?;
        let dir = self.group_dir(group);
        if !dir.is_dir() {
            return Err(ToolMeisterError::NotFound(format!("tool group '{}'", group)));
        }
        Ok(dir)
    }

    fn read_order(&self, group_dir: &Path) -> Result<Vec<(String, String)>> {
        let path = group_dir.join(ORDER_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)?;
        let mut order = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once(' ') {
                Some((host, tool)) => order.push((host.to_string(), tool.trim().to_string())),
                None => {
                    return Err(ToolMeisterError::Storage(format!(
                        "Malformed line in {}: '{}'",
                        path.display(),
                        line
                    )));
                }
            }
        }
        Ok(order)
    }

    fn write_order(&self, group_dir: &Path, order: &[(String, String)]) -> Result<()> {
        let mut content = String::new();
        for (host, tool) in order {
            content.push_str(host);
            content.push(' ');
            content.push_str(tool);
            content.push('\n');
        }
        write_atomic(&group_dir.join(ORDER_FILE), content.as_bytes())
    }

    /// Bind a tool to a host in a group, creating the group if needed
    ///
    /// An existing binding is an error unless `force` is set, in which case
    /// its parameters are replaced and it keeps its position.
    pub fn register(
        &self,
        group: &str,
        host: &str,
        tool: &str,
        params: &BTreeMap<String, String>,
        force: bool,
    ) -> Result<()> {
        validate_name("group", group)?;
        validate_name("host", host)?;
        validate_name("tool", tool)?;

        let group_dir = self.group_dir(group);
        fs::create_dir_all(group_dir.join(host))?;

        let mut order = self.read_order(&group_dir)?;
        let exists = order.iter().any(|(h, t)| h == host && t == tool);
        if exists && !force {
            return Err(ToolMeisterError::DuplicateBinding {
                group: group.to_string(),
                host: host.to_string(),
                tool: tool.to_string(),
            });
        }

        let yaml = serde_yaml::to_string(params)?;
        write_atomic(&group_dir.join(host).join(tool), yaml.as_bytes())?;

        if !exists {
            order.push((host.to_string(), tool.to_string()));
            self.write_order(&group_dir, &order)?;
        }
        log::info!(
            "registered {} on {} in group {}{}",
            tool,
            host,
            group,
            if exists { " (replaced)" } else { "" }
        );
        Ok(())
    }

    /// Remove one binding; the host directory goes with its last tool
    pub fn unregister(&self, group: &str, host: &str, tool: &str) -> Result<()> {
        let group_dir = self.existing_group_dir(group)?;
        validate_name("host", host)?;
        validate_name("tool", tool)?;

        let mut order = self.read_order(&group_dir)?;
        let before = order.len();
        order.retain(|(h, t)| !(h == host && t == tool));
        if order.len() == before {
            return Err(ToolMeisterError::NotFound(format!(
                "binding {} on {} in group {}",
                tool, host, group
            )));
        }

        let param_file = group_dir.join(host).join(tool);
        if param_file.exists() {
            fs::remove_file(&param_file)?;
        }
        if !order.iter().any(|(h, _)| h == host) {
            let host_dir = group_dir.join(host);
            if host_dir.exists() {
                fs::remove_dir_all(&host_dir)?;
            }
        }
        self.write_order(&group_dir, &order)?;
        log::info!("unregistered {} on {} in group {}", tool, host, group);
        Ok(())
    }

    /// Bindings in insertion order
    pub fn list_group(&self, group: &str) -> Result<Vec<Binding>> {
        let group_dir = self.existing_group_dir(group)?;
        let mut bindings = Vec::new();
        for (host, tool) in self.read_order(&group_dir)? {
            let path = group_dir.join(&host).join(&tool);
            let content = fs::read_to_string(&path).map_err(|e| {
                ToolMeisterError::Storage(format!("Cannot read {}: {}", path.display(), e))
            })?;
            let params: BTreeMap<String, String> = if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_yaml::from_str(&content)?
            };
            bindings.push(Binding { host, tool, params });
        }
        Ok(bindings)
    }

    /// Hosts of a group, ordered by first binding
    pub fn hosts(&self, group: &str) -> Result<Vec<String>> {
        let group_dir = self.existing_group_dir(group)?;
        let mut hosts: Vec<String> = Vec::new();
        for (host, _) in self.read_order(&group_dir)? {
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        Ok(hosts)
    }

    /// All group names, sorted
    pub fn list_groups(&self) -> Result<Vec<String>> {
        let mut groups = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str().and_then(|n| n.strip_prefix(GROUP_PREFIX)) {
                groups.push(name.to_string());
            }
        }
        groups.sort();
        Ok(groups)
    }

    /// Destroy a group unless an active run references it
    pub fn delete_group(&self, group: &str, active_groups: &[String]) -> Result<()> {
        let group_dir = self.existing_group_dir(group)?;
        if active_groups.iter().any(|g| g == group) {
            return Err(ToolMeisterError::GroupInUse(group.to_string()));
        }
        fs::remove_dir_all(&group_dir)?;
        log::info!("deleted tool group {}", group);
        Ok(())
    }

    pub fn set_trigger(&self, group: &str, trigger: &Trigger) -> Result<()> {
        let group_dir = self.existing_group_dir(group)?;
        let yaml = serde_yaml::to_string(trigger)?;
        write_atomic(&group_dir.join(TRIGGER_FILE), yaml.as_bytes())
    }

    pub fn trigger(&self, group: &str) -> Result<Option<Trigger>> {
        let path = self.existing_group_dir(group)?.join(TRIGGER_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_yaml::from_str(&fs::read_to_string(path)?)?))
    }

    pub fn set_label(&self, group: &str, host: &str, label: &str) -> Result<()> {
        let group_dir = self.existing_group_dir(group)?;
        validate_name("host", host)?;
        let host_dir = group_dir.join(host);
        if !host_dir.is_dir() {
            return Err(ToolMeisterError::NotFound(format!("host {} in group {}", host, group)));
        }
        write_atomic(&host_dir.join(LABEL_FILE), format!("{}\n", label.trim()).as_bytes())
    }

    pub fn label(&self, group: &str, host: &str) -> Result<Option<String>> {
        let path = self.existing_group_dir(group)?.join(host).join(LABEL_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let label = fs::read_to_string(path)?.trim().to_string();
        Ok(if label.is_empty() { None } else { Some(label) })
    }

    /// Copy the group directory into `dest`, returning the copy's path
    pub fn archive(&self, group: &str, dest: &Path) -> Result<PathBuf> {
        let group_dir = self.existing_group_dir(group)?;
        let target = dest.join(format!("{}{}", GROUP_PREFIX, group));
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        copy_tree(&group_dir, &target)?;
        Ok(target)
    }
}

/// Write through a sibling temporary so readers never see a partial file
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ToolMeisterError::Storage(format!("Bad path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Recursive copy in sorted order
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(|e| ToolMeisterError::Io(e.into()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| ToolMeisterError::Storage(e.to_string()))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::TriggerMode;
    use tempfile::TempDir;

    fn registry() -> (ToolRegistry, TempDir) {
        let dir = TempDir::new().unwrap();
        (ToolRegistry::new(dir.path()).unwrap(), dir)
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_register_and_list_preserves_order() {
        let (reg, _dir) = registry();
        reg.register("default", "h2", "sar", &params(&[]), false).unwrap();
        reg.register("default", "h1", "iostat", &params(&[("interval", "5")]), false).unwrap();
        reg.register("default", "h1", "sar", &params(&[]), false).unwrap();

        let bindings = reg.list_group("default").unwrap();
        let pairs: Vec<(&str, &str)> = bindings.iter().map(|b| (b.host.as_str(), b.tool.as_str())).collect();
        assert_eq!(pairs, vec![("h2", "sar"), ("h1", "iostat"), ("h1", "sar")]);
        assert_eq!(bindings[1].params.get("interval").map(String::as_str), Some("5"));
        assert_eq!(reg.hosts("default").unwrap(), vec!["h2", "h1"]);
    }

    #[test]
    fn test_register_duplicate_rejected() {
        let (reg, _dir) = registry();
        reg.register("default", "h1", "sar", &params(&[]), false).unwrap();
        let err = reg.register("default", "h1", "sar", &params(&[]), false).unwrap_err();
        assert!(matches!(err, ToolMeisterError::DuplicateBinding { .. }));
    }

    #[test]
    fn test_register_force_replaces_in_place() {
        let (reg, _dir) = registry();
        reg.register("default", "h1", "sar", &params(&[("interval", "1")]), false).unwrap();
        reg.register("default", "h1", "iostat", &params(&[]), false).unwrap();
        reg.register("default", "h1", "sar", &params(&[("interval", "9")]), true).unwrap();

        let bindings = reg.list_group("default").unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].tool, "sar");
        assert_eq!(bindings[0].params.get("interval").map(String::as_str), Some("9"));
    }

    #[test]
    fn test_unregister() {
        let (reg, _dir) = registry();
        reg.register("default", "h1", "sar", &params(&[]), false).unwrap();
        reg.register("default", "h2", "sar", &params(&[]), false).unwrap();
        reg.unregister("default", "h1", "sar").unwrap();

        assert_eq!(reg.hosts("default").unwrap(), vec!["h2"]);
        assert!(!reg.group_dir("default").join("h1").exists());
    }

    #[test]
    fn test_unregister_missing() {
        let (reg, _dir) = registry();
        reg.register("default", "h1", "sar", &params(&[]), false).unwrap();
        let err = reg.unregister("default", "h1", "iostat").unwrap_err();
        assert!(matches!(err, ToolMeisterError::NotFound(_)));
        let err = reg.unregister("nope", "h1", "sar").unwrap_err();
        assert!(matches!(err, ToolMeisterError::NotFound(_)));
    }

    #[test]
    fn test_delete_group_in_use() {
        let (reg, _dir) = registry();
        reg.register("default", "h1", "sar", &params(&[]), false).unwrap();
        let err = reg.delete_group("default", &["default".to_string()]).unwrap_err();
        assert!(matches!(err, ToolMeisterError::GroupInUse(_)));
        reg.delete_group("default", &[]).unwrap();
        assert!(reg.list_groups().unwrap().is_empty());
    }

    #[test]
    fn test_list_groups_sorted() {
        let (reg, dir) = registry();
        reg.register("zeta", "h1", "sar", &params(&[]), false).unwrap();
        reg.register("alpha", "h1", "sar", &params(&[]), false).unwrap();
        fs::create_dir_all(dir.path().join("unrelated")).unwrap();
        assert_eq!(reg.list_groups().unwrap(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_invalid_names() {
        let (reg, _dir) = registry();
        for bad in ["", "../etc", "a/b", ".hidden", "__order__", "with space"] {
            let err = reg.register(bad, "h1", "sar", &params(&[]), false).unwrap_err();
            assert!(matches!(err, ToolMeisterError::InvalidName(_)), "{}", bad);
        }
        let err = reg.register("default", "h1", "__label__", &params(&[]), false).unwrap_err();
        assert!(matches!(err, ToolMeisterError::InvalidName(_)));
    }

    #[test]
    fn test_trigger_and_label() {
        let (reg, _dir) = registry();
        reg.register("default", "h1", "sar", &params(&[]), false).unwrap();
        assert_eq!(reg.trigger("default").unwrap(), None);

        let trigger = Trigger::new("Running", "Done", TriggerMode::Substring);
        reg.set_trigger("default", &trigger).unwrap();
        assert_eq!(reg.trigger("default").unwrap(), Some(trigger));

        reg.set_label("default", "h1", "client").unwrap();
        assert_eq!(reg.label("default", "h1").unwrap().as_deref(), Some("client"));
        assert!(reg.set_label("default", "h9", "server").is_err());
    }

    #[test]
    fn test_layout_is_plain_text() {
        let (reg, _dir) = registry();
        reg.register("default", "h1", "sar", &params(&[("interval", "3")]), false).unwrap();
        let order = fs::read_to_string(reg.group_dir("default").join("__order__")).unwrap();
        assert_eq!(order, "h1 sar\n");
        let param_file = fs::read_to_string(reg.group_dir("default").join("h1").join("sar")).unwrap();
        assert!(param_file.contains("interval"));
    }

    #[test]
    fn test_archive_copies_group() {
        let (reg, _dir) = registry();
        reg.register("default", "h1", "sar", &params(&[]), false).unwrap();
        reg.set_label("default", "h1", "client").unwrap();
        let dest = TempDir::new().unwrap();

        let archived = reg.archive("default", dest.path()).unwrap();
        assert_eq!(archived, dest.path().join("tools-v1-default"));
        assert!(archived.join("__order__").exists());
        assert!(archived.join("h1").join("sar").exists());
        assert!(archived.join("h1").join("__label__").exists());
    }
}

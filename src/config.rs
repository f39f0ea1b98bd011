use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    /// Root of the tool group registry
    pub registry_dir: PathBuf,
    /// Root under which run result trees are assembled
    pub results_dir: PathBuf,
    /// Controller run/sample records; defaults to `<results_dir>/.toolmeister-state`
    pub state_dir: Option<PathBuf>,
    /// Extra tool catalog merged over the builtins
    pub catalog: Option<PathBuf>,
    pub controller: ControllerConfig,
    pub meister: MeisterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// T_start: bound on the start barrier
    pub start_timeout_ms: u64,
    /// T_stop: bound on the stop barrier
    pub stop_timeout_ms: u64,
    /// Bound on output transfer after stop
    pub collect_timeout_ms: u64,
    /// Bound on registration and install checks at run begin
    pub register_timeout_ms: u64,
    /// Bound on status polls
    pub status_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Port used for hosts without an explicit address
    pub default_port: u16,
    /// Host name to `addr:port` overrides
    pub hosts: BTreeMap<String, String>,
    pub max_message_bytes: usize,
    /// System information items gathered at run begin and end; empty skips it
    pub sysinfo: Vec<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: 30_000,
            stop_timeout_ms: 60_000,
            collect_timeout_ms: 120_000,
            register_timeout_ms: 60_000,
            status_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            default_port: 17001,
            hosts: BTreeMap::new(),
            max_message_bytes: 256 * 1024 * 1024,
            sysinfo: Vec::new(),
        }
    }
}

impl ControllerConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn collect_timeout(&self) -> Duration {
        Duration::from_millis(self.collect_timeout_ms)
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    /// Address of a host's Tool Meister
    pub fn address_of(&self, host: &str) -> String {
        self.hosts
            .get(host)
            .cloned()
            .unwrap_or_else(|| format!("{}:{}", host, self.default_port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeisterConfig {
    pub listen: String,
    /// Name reported to the controller; the system hostname when unset
    pub hostname: Option<String>,
    /// Where tools write their raw output
    pub output_dir: PathBuf,
    /// Per-tool graceful stop period before escalation
    pub grace_timeout_ms: u64,
    pub install_check_timeout_ms: u64,
    pub max_clients: usize,
    pub max_message_bytes: usize,
    pub shell: String,
    /// Raw bytes of output per COLLECT page
    pub collect_chunk_bytes: usize,
    /// Sysinfo item name to the shell command that produces it
    pub sysinfo: BTreeMap<String, String>,
    pub sysinfo_timeout_ms: u64,
}

/// Items every Meister knows unless its config replaces them
pub fn default_sysinfo() -> BTreeMap<String, String> {
    [
        ("kernel", "uname -a"),
        ("cpuinfo", "cat /proc/cpuinfo"),
        ("meminfo", "cat /proc/meminfo"),
        ("mounts", "cat /proc/mounts"),
        ("topology", "lscpu"),
        ("block", "lsblk"),
        ("security_mitigations", "grep -r . /sys/devices/system/cpu/vulnerabilities"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Default for MeisterConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:17001".to_string(),
            hostname: None,
            output_dir: std::env::temp_dir().join("toolmeister"),
            grace_timeout_ms: 5_000,
            install_check_timeout_ms: 10_000,
            max_clients: 16,
            max_message_bytes: 256 * 1024 * 1024,
            shell: "/bin/sh".to_string(),
            collect_chunk_bytes: 4 * 1024 * 1024,
            sysinfo: default_sysinfo(),
            sysinfo_timeout_ms: 60_000,
        }
    }
}

impl MeisterConfig {
    pub fn grace_timeout(&self) -> Duration {
        Duration::from_millis(self.grace_timeout_ms)
    }

    pub fn install_check_timeout(&self) -> Duration {
        Duration::from_millis(self.install_check_timeout_ms)
    }

    pub fn sysinfo_timeout(&self) -> Duration {
        Duration::from_millis(self.sysinfo_timeout_ms)
    }

    /// Configured hostname, else the system hostname
    pub fn resolved_hostname(&self) -> String {
        if let Some(name) = &self.hostname {
            return name.clone();
        }
        match nix::unistd::gethostname() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(e) => {
                log::warn!("gethostname failed: {}, using localhost", e);
                "localhost".to_string()
            }
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(env!("CARGO_PKG_NAME"));
        Self {
            log_level: Some("info".to_string()),
            registry_dir: data_dir.join("registry"),
            results_dir: data_dir.join("results"),
            state_dir: None,
            catalog: None,
            controller: ControllerConfig::default(),
            meister: MeisterConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let project_name = env!("CARGO_PKG_NAME");

        // Project-local ./<project>.yml first
        let local_config = PathBuf::from(format!("{}.yml", project_name));
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Then ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let c = &self.controller;
        if c.start_timeout_ms == 0 || c.stop_timeout_ms == 0 || c.collect_timeout_ms == 0 {
            eyre::bail!("controller timeouts must be > 0");
        }
        if c.connect_timeout_ms == 0 {
            eyre::bail!("controller.connect_timeout_ms must be > 0");
        }
        if c.default_port == 0 {
            eyre::bail!("controller.default_port must be > 0");
        }
        if self.meister.grace_timeout_ms == 0 {
            eyre::bail!("meister.grace_timeout_ms must be > 0");
        }
        if self.meister.max_clients == 0 {
            eyre::bail!("meister.max_clients must be > 0");
        }
        if self.meister.max_message_bytes < 1024 || c.max_message_bytes < 1024 {
            eyre::bail!("max_message_bytes must be at least 1024");
        }
        // base64 grows a page by a third, plus the JSON envelope
        let page_limit = self.meister.max_message_bytes.min(c.max_message_bytes) / 2;
        if self.meister.collect_chunk_bytes == 0 || self.meister.collect_chunk_bytes > page_limit {
            eyre::bail!("meister.collect_chunk_bytes must be between 1 and {}", page_limit);
        }
        if let Some(item) = c.sysinfo.iter().find(|item| item.is_empty()) {
            eyre::bail!("controller.sysinfo has an empty item name: {:?}", item);
        }
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.results_dir.join(".toolmeister-state"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.controller.start_timeout(), Duration::from_secs(30));
        assert_eq!(config.controller.stop_timeout(), Duration::from_secs(60));
        assert_eq!(config.meister.grace_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_partial_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("toolmeister.yml");
        fs::write(
            &path,
            "results_dir: /srv/results\ncontroller:\n  start_timeout_ms: 1500\n  hosts:\n    h1: 10.0.0.1:18000\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.results_dir, PathBuf::from("/srv/results"));
        assert_eq!(config.controller.start_timeout_ms, 1500);
        assert_eq!(config.controller.stop_timeout_ms, 60_000);
        assert_eq!(config.controller.address_of("h1"), "10.0.0.1:18000");
        assert_eq!(config.controller.address_of("h2"), "h2:17001");
        assert_eq!(config.state_dir(), PathBuf::from("/srv/results/.toolmeister-state"));
    }

    #[test]
    fn test_load_missing_explicit_path() {
        let result = Config::load(Some(&PathBuf::from("/nonexistent/toolmeister.yml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = Config::default();
        config.controller.start_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_collect_page() {
        let mut config = Config::default();
        config.meister.collect_chunk_bytes = config.meister.max_message_bytes;
        assert!(config.validate().is_err());
        config.meister.collect_chunk_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sysinfo_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("toolmeister.yml");
        fs::write(
            &path,
            "controller:\n  sysinfo: [kernel, block]\nmeister:\n  sysinfo:\n    kernel: uname -r\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.controller.sysinfo, vec!["kernel", "block"]);
        assert_eq!(config.meister.sysinfo.len(), 1);
        assert_eq!(config.meister.sysinfo["kernel"], "uname -r");
        assert!(Config::default().meister.sysinfo.contains_key("cpuinfo"));
    }

    #[test]
    fn test_resolved_hostname_prefers_config() {
        let mut meister = MeisterConfig::default();
        meister.hostname = Some("h1".to_string());
        assert_eq!(meister.resolved_hostname(), "h1");
        meister.hostname = None;
        assert!(!meister.resolved_hostname().is_empty());
    }
}

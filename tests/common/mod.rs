//! Shared fixtures: a controller wired to in-process Tool Meisters

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use toolmeister::config::ControllerConfig;
use toolmeister::controller::{Controller, InProcessTransport};
use toolmeister::meister::ToolMeister;
use toolmeister::registry::ToolRegistry;
use toolmeister::storage::JsonlStorage;
use toolmeister::supervisor::LocalToolSupervisor;
use toolmeister::tools::{ToolCatalog, ToolDefinition, ToolKind};

/// Tools with predictable behaviour
pub fn catalog() -> ToolCatalog {
    let mut catalog = ToolCatalog::new();
    catalog.insert(ToolDefinition::new(
        "sar",
        ToolKind::PersistentDatalog,
        "trap 'exit 0' TERM; while true; do echo sample; sleep 0.1; done",
    ));
    catalog.insert(
        ToolDefinition::new("iostat", ToolKind::PersistentDatalog, "sleep 60").with_install_check("exit 1"),
    );
    catalog.insert(ToolDefinition::new(
        "stubborn",
        ToolKind::PersistentDatalog,
        "trap '' TERM; sleep 60",
    ));
    catalog.insert(ToolDefinition::new("vmstat", ToolKind::PeriodicSample, "echo vm").with_interval(1));
    catalog
}

pub fn controller_config() -> ControllerConfig {
    ControllerConfig {
        start_timeout_ms: 2_000,
        stop_timeout_ms: 10_000,
        collect_timeout_ms: 10_000,
        register_timeout_ms: 5_000,
        status_timeout_ms: 1_000,
        ..ControllerConfig::default()
    }
}

pub struct Fleet {
    pub dir: TempDir,
    pub controller: Controller,
    pub transport: Arc<InProcessTransport>,
}

impl Fleet {
    /// Meisters are created only for `up`; other hosts are unreachable
    pub async fn new(up: &[&str], config: ControllerConfig, grace: Duration) -> Self {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(InProcessTransport::new());
        for host in up {
            let meister = ToolMeister::new(
                *host,
                dir.path().join("hosts").join(host),
                grace,
                LocalToolSupervisor::default(),
            );
            transport.add(host, Arc::new(meister)).await;
        }
        let controller = Controller::new(
            ToolRegistry::new(dir.path().join("registry")).unwrap(),
            catalog(),
            JsonlStorage::new(dir.path().join("state")).unwrap(),
            transport.clone(),
            dir.path().join("results"),
            config,
        );
        Self {
            dir,
            controller,
            transport,
        }
    }

    pub fn results(&self) -> PathBuf {
        self.dir.path().join("results")
    }

    pub fn register(&self, group: &str, hosts: &[&str], tools: &[&str]) {
        for host in hosts {
            for tool in tools {
                self.controller
                    .register_tool(group, host, tool, &BTreeMap::new(), false, None)
                    .unwrap();
            }
        }
    }
}

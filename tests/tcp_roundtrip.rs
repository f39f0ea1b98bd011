//! Controller and Tool Meister talking over real TCP

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use toolmeister::config::ControllerConfig;
use toolmeister::controller::{Controller, TcpTransport};
use toolmeister::domain::{HostOutcome, SampleId, SampleState};
use toolmeister::ipc::{MeisterServer, MeisterServerConfig};
use toolmeister::meister::ToolMeister;
use toolmeister::registry::ToolRegistry;
use toolmeister::storage::JsonlStorage;
use toolmeister::supervisor::LocalToolSupervisor;
use toolmeister::tools::{ToolCatalog, ToolDefinition, ToolKind};

#[tokio::test]
async fn test_sample_over_tcp() {
    let dir = TempDir::new().unwrap();
    let meister = Arc::new(ToolMeister::new(
        "h1",
        dir.path().join("host"),
        Duration::from_secs(2),
        LocalToolSupervisor::default(),
    ));
    let server = MeisterServer::bind(MeisterServerConfig::default().with_listen("127.0.0.1:0"))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = meister.shutdown_signal();
    let serving = tokio::spawn(server.run(Arc::clone(&meister), shutdown));

    let mut config = ControllerConfig::default();
    config.hosts.insert("h1".to_string(), addr.to_string());
    let mut catalog = ToolCatalog::new();
    catalog.insert(ToolDefinition::new("pidstat", ToolKind::PeriodicSample, "echo tick").with_interval(1));

    let controller = Controller::new(
        ToolRegistry::new(dir.path().join("registry")).unwrap(),
        catalog,
        JsonlStorage::new(dir.path().join("state")).unwrap(),
        Arc::new(TcpTransport::new(config.clone())),
        dir.path().join("results"),
        config,
    );
    controller
        .register_tool("default", "h1", "pidstat", &BTreeMap::new(), false, None)
        .unwrap();

    let sample = SampleId::new("Run", 1, 1);
    let start = controller.start_sample("default", &sample).await.unwrap();
    assert_eq!(start.hosts["h1"], HostOutcome::Acknowledged);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    controller.stop_sample(&sample).await.unwrap();
    let collected = controller.collect_sample(&sample).await.unwrap();
    assert_eq!(collected.command.state, Some(SampleState::Collected));

    let out = dir.path().join("results/Run/1/1/h1/pidstat/pidstat-stdout.txt");
    let text = std::fs::read_to_string(out).unwrap();
    assert!(text.contains("tick"));
    assert!(text.starts_with("--- "));

    let status = controller.status("default").await.unwrap();
    let report = status.results["h1"].ack().unwrap();
    assert_eq!(report.samples["Run/1/1"].to_string(), "DONE");

    let end = controller.end_run("Run", true).await.unwrap();
    assert_eq!(end.hosts["h1"], HostOutcome::Acknowledged);
    tokio::time::timeout(Duration::from_secs(10), serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

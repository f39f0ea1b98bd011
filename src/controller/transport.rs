//! How the controller reaches Tool Meisters

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::ControllerConfig;
use crate::error::{Result, ToolMeisterError};
use crate::ipc::{Command, CommandKind, MeisterClient, MeisterClientConfig, MeisterRequest, MeisterResponse};
use crate::ipc::server::RequestHandler;
use crate::meister::ToolMeister;

/// Delivers one command to one host's Meister
///
/// A host that cannot be contacted at all must surface as
/// `ToolMeisterError::HostUnreachable`.
#[async_trait]
pub trait MeisterTransport: Send + Sync {
    async fn send(&self, host: &str, command: Command) -> Result<MeisterResponse>;
}

/// One TCP connection per command
pub struct TcpTransport {
    config: ControllerConfig,
}

impl TcpTransport {
    pub fn new(config: ControllerConfig) -> Self {
        Self { config }
    }

    fn request_timeout_ms(&self, kind: CommandKind) -> u64 {
        let c = &self.config;
        match kind {
            CommandKind::Register => c.register_timeout_ms,
            CommandKind::Start => c.start_timeout_ms,
            CommandKind::Stop | CommandKind::Terminate => c.stop_timeout_ms,
            CommandKind::Status => c.status_timeout_ms,
            CommandKind::Collect | CommandKind::Sysinfo => c.collect_timeout_ms,
        }
    }
}

#[async_trait]
impl MeisterTransport for TcpTransport {
    async fn send(&self, host: &str, command: Command) -> Result<MeisterResponse> {
        let config = MeisterClientConfig {
            addr: self.config.address_of(host),
            connect_timeout_ms: self.config.connect_timeout_ms,
            request_timeout_ms: self.request_timeout_ms(command.kind()),
            max_message_bytes: self.config.max_message_bytes,
        };
        let client = MeisterClient::connect(host, config).await?;
        client.request(command).await
    }
}

/// Meisters living in the controller's process, keyed by host name
///
/// Hosts can be stalled to model a Meister that accepts a command and never
/// answers.
#[derive(Default)]
pub struct InProcessTransport {
    meisters: RwLock<HashMap<String, Arc<ToolMeister>>>,
    stalled: RwLock<HashSet<String>>,
    next_id: AtomicU64,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, host: &str, meister: Arc<ToolMeister>) {
        self.meisters.write().await.insert(host.to_string(), meister);
    }

    pub async fn stall(&self, host: &str) {
        self.stalled.write().await.insert(host.to_string());
    }

    pub async fn unstall(&self, host: &str) {
        self.stalled.write().await.remove(host);
    }
}

#[async_trait]
impl MeisterTransport for InProcessTransport {
    async fn send(&self, host: &str, command: Command) -> Result<MeisterResponse> {
        if self.stalled.read().await.contains(host) {
            std::future::pending::<()>().await;
        }
        let meister = self.meisters.read().await.get(host).cloned();
        let Some(meister) = meister else {
            return Err(ToolMeisterError::HostUnreachable {
                host: host.to_string(),
                detail: "no meister for host".to_string(),
            });
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(meister.handle(MeisterRequest::new(id, command)).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::StatusReport;
    use crate::supervisor::LocalToolSupervisor;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_in_process_routing() {
        let dir = TempDir::new().unwrap();
        let transport = InProcessTransport::new();
        let meister = ToolMeister::new("h1", dir.path(), Duration::from_secs(1), LocalToolSupervisor::default());
        transport.add("h1", Arc::new(meister)).await;

        let status: StatusReport = transport.send("h1", Command::Status).await.unwrap().into_result().unwrap();
        assert_eq!(status.host, "h1");

        let err = transport.send("h2", Command::Status).await.unwrap_err();
        assert!(matches!(err, ToolMeisterError::HostUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_tcp_transport_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = ControllerConfig::default();
        config.hosts.insert("h2".to_string(), addr.to_string());
        let transport = TcpTransport::new(config);
        let err = transport.send("h2", Command::Status).await.unwrap_err();
        assert!(matches!(err, ToolMeisterError::HostUnreachable { .. }));
    }

    #[test]
    fn test_request_timeouts_follow_kind() {
        let transport = TcpTransport::new(ControllerConfig::default());
        assert_eq!(transport.request_timeout_ms(CommandKind::Start), 30_000);
        assert_eq!(transport.request_timeout_ms(CommandKind::Terminate), 60_000);
        assert_eq!(transport.request_timeout_ms(CommandKind::Collect), 120_000);
    }
}

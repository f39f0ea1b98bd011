//! Tool Meister TCP server
//!
//! Provides:
//! - TCP listener bound once so the real port is known before serving
//! - Per-connection framed request/response loop
//! - Cooperative shutdown through a watch channel

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;

use crate::error::{Result, ToolMeisterError};
use crate::ipc::codec::{DEFAULT_MAX_LENGTH, NdJsonCodec};
use crate::ipc::messages::{MeisterError, MeisterRequest, MeisterResponse};

/// Bound on flushing in-flight replies after shutdown
const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Configuration for the Meister server
#[derive(Debug, Clone)]
pub struct MeisterServerConfig {
    /// `addr:port` to listen on; port 0 picks a free port
    pub listen: String,
    /// Maximum number of concurrent connections
    pub max_clients: usize,
    pub max_message_bytes: usize,
}

impl Default for MeisterServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:17001".to_string(),
            max_clients: 16,
            max_message_bytes: DEFAULT_MAX_LENGTH,
        }
    }
}

impl MeisterServerConfig {
    pub fn with_listen(mut self, listen: impl Into<String>) -> Self {
        self.listen = listen.into();
        self
    }
}

/// Handler trait for processing requests
pub trait RequestHandler: Send + Sync {
    /// Handle a request and return a response
    fn handle(&self, request: MeisterRequest) -> impl std::future::Future<Output = MeisterResponse> + Send;
}

pub struct MeisterServer {
    config: MeisterServerConfig,
    listener: TcpListener,
}

impl MeisterServer {
    pub async fn bind(config: MeisterServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen)
            .await
            .map_err(|e| ToolMeisterError::Ipc(format!("Failed to bind {}: {}", config.listen, e)))?;
        Ok(Self { config, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` flips (or its sender is dropped)
    pub async fn run<H: RequestHandler + 'static>(
        self,
        handler: Arc<H>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut connections = JoinSet::new();
        let mut next_client_id: u64 = 1;
        log::info!("tool meister listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            while connections.try_join_next().is_some() {}
                            if connections.len() >= self.config.max_clients {
                                log::warn!("rejecting {}: {} clients connected", peer, connections.len());
                                continue;
                            }

                            let client_id = next_client_id;
                            next_client_id += 1;
                            log::debug!("client {} connected from {}", client_id, peer);

                            connections.spawn(handle_client(
                                stream,
                                client_id,
                                Arc::clone(&handler),
                                self.config.max_message_bytes,
                                shutdown.clone(),
                            ));
                        }
                        Err(e) => {
                            log::error!("accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }

        log::info!("tool meister shutting down, draining {} connection(s)", connections.len());
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            connections.abort_all();
        }
        Ok(())
    }
}

/// Handle a single client connection
async fn handle_client<H: RequestHandler>(
    stream: TcpStream,
    client_id: u64,
    handler: Arc<H>,
    max_message_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let mut framed = Framed::new(stream, NdJsonCodec::<MeisterRequest>::with_max_length(max_message_bytes));

    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = shutdown.changed() => break,
        };

        let response = match frame {
            None => break,
            Some(Ok(request)) => {
                log::debug!("client {}: {} #{}", client_id, request.command.kind(), request.id);
                handler.handle(request).await
            }
            Some(Err(e)) => {
                // The decoder cannot resync after a bad frame, so answer and hang up.
                log::warn!("client {}: bad frame: {}", client_id, e);
                let response = MeisterResponse::error(0, MeisterError::parse_error(format!("Parse error: {}", e)));
                let _ = framed.send(response).await;
                break;
            }
        };

        if let Err(e) = framed.send(response).await {
            log::warn!("client {}: write failed: {}", client_id, e);
            break;
        }
    }

    log::debug!("client {} disconnected", client_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::messages::Command;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct EchoHandler;

    impl RequestHandler for EchoHandler {
        fn handle(&self, request: MeisterRequest) -> impl std::future::Future<Output = MeisterResponse> + Send {
            async move { MeisterResponse::success(request.id, serde_json::json!({ "kind": request.command.kind() })) }
        }
    }

    async fn start_echo() -> (SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<Result<()>>) {
        let server = MeisterServer::bind(MeisterServerConfig::default().with_listen("127.0.0.1:0"))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(server.run(Arc::new(EchoHandler), rx));
        (addr, tx, task)
    }

    #[test]
    fn test_server_config_builder() {
        let config = MeisterServerConfig::default().with_listen("127.0.0.1:9000");
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.max_clients, 16);
    }

    #[tokio::test]
    async fn test_request_response_over_tcp() {
        let (addr, shutdown, task) = start_echo().await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer
            .write_all(b"{\"id\":11,\"command\":{\"kind\":\"status\"}}\n")
            .await
            .unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let resp: MeisterResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(resp.id, 11);
        assert_eq!(resp.result.unwrap()["kind"], "status");

        shutdown.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_parse_error_reply() {
        let (addr, shutdown, task) = start_echo().await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"{oops\n").await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let resp: MeisterResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(resp.error.unwrap().code, crate::ipc::messages::ErrorCode::PARSE_ERROR);
        assert!(lines.next_line().await.unwrap().is_none());

        shutdown.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_ipc_error() {
        let err = MeisterServer::bind(MeisterServerConfig::default().with_listen("missing-port"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ToolMeisterError::Ipc(_)));
    }

    #[test]
    fn test_command_kind_display() {
        assert_eq!(Command::Terminate.kind().to_string(), "terminate");
    }
}

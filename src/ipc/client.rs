//! Controller-side client for one Tool Meister.
//!
//! One TCP connection, requests multiplexed by id: a reader task routes each
//! response to the oneshot registered by its request.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::error::{Result, ToolMeisterError};
use crate::ipc::codec::{DEFAULT_MAX_LENGTH, NdJsonCodec};
use crate::ipc::messages::{Command, MeisterRequest, MeisterResponse};

type ResponseSink = SplitSink<Framed<TcpStream, NdJsonCodec<MeisterResponse>>, MeisterRequest>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<MeisterResponse>>>>;

/// Configuration for a Meister client.
#[derive(Debug, Clone)]
pub struct MeisterClientConfig {
    /// `addr:port` of the Meister
    pub addr: String,
    pub connect_timeout_ms: u64,
    /// Request timeout in milliseconds.
    pub request_timeout_ms: u64,
    pub max_message_bytes: usize,
}

impl MeisterClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout_ms: 5_000,
            request_timeout_ms: 120_000,
            max_message_bytes: DEFAULT_MAX_LENGTH,
        }
    }
}

pub struct MeisterClient {
    host: String,
    config: MeisterClientConfig,
    sink: Mutex<ResponseSink>,
    pending: Pending,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl MeisterClient {
    /// Connect to the Meister serving `host`
    ///
    /// Any connect failure is `HostUnreachable`.
    pub async fn connect(host: &str, config: MeisterClientConfig) -> Result<Self> {
        let unreachable = |detail: String| ToolMeisterError::HostUnreachable {
            host: host.to_string(),
            detail,
        };

        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&config.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(unreachable(format!("connect {}: {}", config.addr, e))),
            Err(_) => return Err(unreachable(format!("connect {} timed out after {:?}", config.addr, timeout))),
        };
        let _ = stream.set_nodelay(true);

        let framed = Framed::new(
            stream,
            NdJsonCodec::<MeisterResponse>::with_max_length(config.max_message_bytes),
        );
        let (sink, mut responses) = framed.split();

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let reader = {
            let pending = Arc::clone(&pending);
            let connected = Arc::clone(&connected);
            let host = host.to_string();
            tokio::spawn(async move {
                while let Some(frame) = responses.next().await {
                    match frame {
                        Ok(response) => {
                            let waiter = pending.lock().await.remove(&response.id);
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send(response);
                                }
                                None => log::debug!("{}: unsolicited response #{}", host, response.id),
                            }
                        }
                        Err(e) => {
                            log::warn!("{}: bad frame from meister: {}", host, e);
                            break;
                        }
                    }
                }
                connected.store(false, Ordering::SeqCst);
                // Dropping the senders wakes every waiter with an error.
                pending.lock().await.clear();
            })
        };

        Ok(Self {
            host: host.to_string(),
            config,
            sink: Mutex::new(sink),
            pending,
            next_id: AtomicU64::new(1),
            connected,
            reader,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a command and wait for its response.
    pub async fn request(&self, command: Command) -> Result<MeisterResponse> {
        if !self.is_connected() {
            return Err(ToolMeisterError::Ipc(format!("{}: connection closed", self.host)));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let kind = command.kind();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.send(MeisterRequest::new(id, command)).await {
                self.pending.lock().await.remove(&id);
                return Err(ToolMeisterError::Ipc(format!("{}: failed to send {}: {}", self.host, kind, e)));
            }
        }

        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ToolMeisterError::Ipc(format!(
                "{}: connection closed before {} reply",
                self.host, kind
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ToolMeisterError::Ipc(format!(
                    "{}: {} #{} timed out after {:?}",
                    self.host, kind, id, timeout
                )))
            }
        }
    }

    /// Send a command and decode the success payload
    pub async fn call<T: DeserializeOwned>(&self, command: Command) -> Result<T> {
        self.request(command).await?.into_result()
    }
}

impl Drop for MeisterClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::server::{MeisterServer, MeisterServerConfig, RequestHandler};
    use tokio::sync::watch;

    struct SlowHandler;

    impl RequestHandler for SlowHandler {
        fn handle(&self, request: MeisterRequest) -> impl std::future::Future<Output = MeisterResponse> + Send {
            async move {
                if request.command == Command::Terminate {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                MeisterResponse::success(request.id, serde_json::json!({ "kind": request.command.kind() }))
            }
        }
    }

    #[tokio::test]
    async fn test_connect_refused_is_unreachable() {
        // Bind then drop to get a port with nothing listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = MeisterClient::connect("h2", MeisterClientConfig::new(addr.to_string()))
            .await
            .err()
            .unwrap();
        match err {
            ToolMeisterError::HostUnreachable { host, .. } => assert_eq!(host, "h2"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_and_timeout() {
        let server = MeisterServer::bind(MeisterServerConfig::default().with_listen("127.0.0.1:0"))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(server.run(Arc::new(SlowHandler), rx));

        let mut config = MeisterClientConfig::new(addr.to_string());
        config.request_timeout_ms = 300;
        let client = MeisterClient::connect("h1", config).await.unwrap();

        let value: serde_json::Value = client.call(Command::Status).await.unwrap();
        assert_eq!(value["kind"], "status");

        let err = client.request(Command::Terminate).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));

        drop(client);
        shutdown.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}

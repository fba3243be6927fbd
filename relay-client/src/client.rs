use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio_tungstenite::client_async_with_config;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tracing::{debug, info, instrument};

use relay_core::{
    ErrorSink, ExecutorCtx, Role, SendError, SessionHandle, SessionRegistry, WsHandler, protocol_config,
};

use crate::config::ClientConfig;
use crate::errors::ConnectError;

/// Client side of the WebSocket layer.
///
/// Owns at most one session at a time, driven by the same state machine as
/// server-side sessions. Lifecycle mirrors the server: connect, use, then
/// [`WsClient::shutdown`] followed by [`WsClient::join`].
pub struct WsClient {
    config: ClientConfig,
    handler: Arc<dyn WsHandler>,
    error_sink: Arc<dyn ErrorSink>,
    executor: ExecutorCtx,
    registry: Arc<SessionRegistry>,
    shutdown: AtomicBool,
    connect_lock: tokio::sync::Mutex<()>,
}

impl WsClient {
    pub fn new(config: ClientConfig, handler: Arc<dyn WsHandler>, error_sink: Arc<dyn ErrorSink>) -> Self {
        let executor = ExecutorCtx::new();
        let registry = Arc::new(SessionRegistry::new(executor.tracker(), executor.shutdown_token()));
        handler.attach(registry.clone());

        Self {
            config,
            handler,
            error_sink,
            executor,
            registry,
            shutdown: AtomicBool::new(false),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Resolve, connect and handshake. A no-op if already connected; an
    /// error after shutdown.
    #[instrument(skip_all, fields(%host, port, resource))]
    pub async fn connect(&self, host: &str, port: u16, resource: &str) -> Result<(), ConnectError> {
        let _guard = self.connect_lock.lock().await;

        if self.is_connected() {
            return Ok(());
        }
        if self.shutdown.load(Ordering::SeqCst) || self.executor.is_stopped() {
            return Err(ConnectError::Shutdown);
        }

        let resource = if resource.is_empty() { "/" } else { resource };

        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(ConnectError::Resolve)?;

        // Try every resolved endpoint in order until one accepts.
        let mut stream = None;
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(connected) => {
                    debug!(target: "client", %addr, "connected");
                    stream = Some(connected);
                    break;
                }
                Err(error) => last_error = Some(error),
            }
        }
        let stream = stream.ok_or_else(|| {
            ConnectError::Io(last_error.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "host resolved to no addresses")
            }))
        })?;
        let _ = stream.set_nodelay(true);

        let url = format!("ws://{}:{}{}", host, port, resource);
        let (ws, _response) =
            client_async_with_config(url, stream, Some(protocol_config(self.config.max_read_message_size)))
                .await?;

        let id = self
            .registry
            .spawn(
                ws,
                Role::Client,
                resource,
                self.handler.clone(),
                self.error_sink.clone(),
                self.config.session_options(),
            )
            .map_err(|_| ConnectError::Shutdown)?;
        info!(target: "client", %id, "session started");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        !self.registry.is_empty()
    }

    fn session(&self) -> Result<SessionHandle, SendError> {
        let id = *self.registry.ids().first().ok_or(SendError::NotConnected)?;
        self.registry.get(id).ok_or(SendError::NotConnected)
    }

    pub fn send_text(&self, text: impl Into<Utf8Bytes>) -> Result<(), SendError> {
        self.session()?.send_text(text)
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), SendError> {
        self.session()?.send_binary(data)
    }

    /// Schedule an orderly close of the current session.
    pub fn close(&self, reason: &str) -> Result<(), SendError> {
        self.session()?.close(reason);
        Ok(())
    }

    /// Close the session with reason "shutdown" and release the work guard.
    /// Idempotent and non-blocking.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.close("shutdown");
        self.executor.stop();
    }

    /// Wait for the session tasks to finish.
    pub async fn join(&self) {
        self.executor.join().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_core::LogErrorSink;
    use relay_server::{NotFoundHandler, Server, ServerConfig, WsRoute};
    use test_log::test;

    struct Nop;

    #[async_trait]
    impl WsHandler for Nop {}

    async fn echo_server() -> Server {
        Server::bind(
            ServerConfig::new("127.0.0.1".parse().unwrap(), 0),
            Arc::new(NotFoundHandler),
            Some(WsRoute::Service(Arc::new(Nop))),
            Arc::new(LogErrorSink),
        )
        .await
        .expect("bind")
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn test_connect_is_idempotent() {
        let server = echo_server().await;
        let port = server.local_addr().port();

        let client = WsClient::new(ClientConfig::default(), Arc::new(Nop), Arc::new(LogErrorSink));
        assert!(!client.is_connected());
        assert!(matches!(client.send_text("x"), Err(SendError::NotConnected)));

        client.connect("127.0.0.1", port, "/").await.unwrap();
        assert!(client.is_connected());
        assert_eq!(client.registry.len(), 1);

        // The server registers its side right after answering the handshake.
        for _ in 0..100 {
            if server.sessions().len() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(server.sessions().len(), 1);

        // Connecting again is a no-op.
        client.connect("127.0.0.1", port, "/").await.unwrap();
        assert_eq!(client.registry.len(), 1);

        client.shutdown();
        client.join().await;
        server.stop();
        server.join().await;
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn test_connect_after_shutdown_fails() {
        let server = echo_server().await;
        let port = server.local_addr().port();

        let client = WsClient::new(ClientConfig::default(), Arc::new(Nop), Arc::new(LogErrorSink));
        client.shutdown();
        client.shutdown();

        let result = client.connect("127.0.0.1", port, "/").await;
        assert!(matches!(result, Err(ConnectError::Shutdown)));

        client.join().await;
        server.stop();
        server.join().await;
    }
}

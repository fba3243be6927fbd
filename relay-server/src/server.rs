use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, instrument};

use relay_core::{ErrorSink, ExecutorCtx, SessionRegistry};

use crate::config::ServerConfig;
use crate::http::{HttpContext, HttpHandler, PipelineGauge};
use crate::listener;
use crate::router::WsRoute;

/// An HTTP and WebSocket server.
///
/// User code supplies the handlers and drives the lifecycle: bind, then at
/// some point [`Server::stop`] followed by [`Server::join`]. After `join`
/// returns no worker task is running and no callback will fire. The library
/// installs no signal handlers.
pub struct Server {
    executor: ExecutorCtx,
    registry: Arc<SessionRegistry>,
    gauge: Arc<PipelineGauge>,
    local_addr: SocketAddr,
}

impl Server {
    /// Open the acceptor and start serving.
    ///
    /// Bind failures surface here; once `bind` returns the accept loop is
    /// running on the caller's runtime.
    #[instrument(skip_all, fields(address = %config.address, port = config.port))]
    pub async fn bind(
        config: ServerConfig,
        http: Arc<dyn HttpHandler>,
        ws: Option<WsRoute>,
        error_sink: Arc<dyn ErrorSink>,
    ) -> std::io::Result<Server> {
        let executor = ExecutorCtx::new();
        let registry = Arc::new(SessionRegistry::new(executor.tracker(), executor.shutdown_token()));
        if let Some(route) = &ws {
            route.attach(&registry);
        }

        let gauge = Arc::new(PipelineGauge::default());
        let ctx = Arc::new(HttpContext {
            http,
            ws,
            error_sink,
            registry: registry.clone(),
            request_timeout: config.request_timeout(),
            response_queue_limit: config.response_queue_limit,
            max_read_message_size: config.max_read_message_size,
            session_options: config.session_options(),
            gauge: gauge.clone(),
        });

        let listener = TcpListener::bind(SocketAddr::new(config.address, config.port)).await?;
        let local_addr = listener.local_addr()?;

        executor.spawn(listener::run(listener, ctx, executor.clone()));
        info!(target: "server", %local_addr, "listening");

        Ok(Server {
            executor,
            registry,
            gauge,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The live WebSocket sessions, for broadcast and targeted sends.
    pub fn sessions(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Stop accepting, close every session, stop all tasks. Idempotent and
    /// non-blocking; call [`Server::join`] to wait for completion.
    #[instrument(skip_all)]
    pub fn stop(&self) {
        info!(target: "server", "stopping");
        self.registry.shutdown();
        self.executor.stop();
    }

    /// Block until every task has finished.
    pub async fn join(&self) {
        self.executor.join().await;
        info!(target: "server", "stopped");
    }

    /// Test hook: highest observed depth of the HTTP response queue.
    pub fn response_queue_high_watermark(&self) -> usize {
        self.gauge.high_watermark()
    }
}

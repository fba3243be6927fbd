use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use relay_core::prelude::*;
use relay_server::prelude::*;

/// Echoes every received frame to all connected sessions.
#[derive(Default)]
struct MirrorService {
    sessions: OnceLock<Arc<SessionRegistry>>,
}

#[async_trait]
impl WsHandler for MirrorService {
    fn attach(&self, registry: Arc<SessionRegistry>) {
        let _ = self.sessions.set(registry);
    }

    async fn on_open(&self, id: SessionId, _resource: &str) {
        info!("open session {}", id);
    }

    async fn on_close(&self, id: SessionId, _resource: &str) {
        info!("{} closed", id);
    }

    async fn on_text(&self, id: SessionId, _resource: &str, text: Utf8Bytes) {
        info!("{} received text message: {}", id, text);
        if let Some(sessions) = self.sessions.get() {
            sessions.send_text(Target::All, text);
        }
    }

    async fn on_binary(&self, id: SessionId, _resource: &str, data: Bytes) {
        info!("{} received binary message", id);
        if let Some(sessions) = self.sessions.get() {
            sessions.send_binary(Target::All, data);
        }
    }
}

fn print_help(exec_name: &str) {
    eprintln!("Usage: {} <address> <port> <doc_root> <thread_count>", exec_name);
    eprintln!("Example:");
    eprintln!("    {} 0.0.0.0 8080 http_root_directory 1", exec_name);
}

fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 5 {
        print_help(&args[0]);
        std::process::exit(1);
    }

    let mut config = ServerConfig::new(
        args[1].parse().context("invalid address")?,
        args[2].parse().context("invalid port")?,
    );
    let doc_root = args[3].clone();
    config.thread_count = args[4].parse().context("invalid thread count")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.thread_count)
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let server = Server::bind(
            config,
            Arc::new(FileRequestHandler::new(doc_root)),
            Some(WsRoute::Service(Arc::new(MirrorService::default()))),
            Arc::new(LogErrorSink),
        )
        .await
        .context("bind failed")?;

        tokio::signal::ctrl_c().await?;
        info!("interrupted, shutting down");
        server.stop();
        server.join().await;
        Ok(())
    })
}

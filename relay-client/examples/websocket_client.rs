use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use relay_client::prelude::*;
use relay_core::prelude::*;

/// Prints whatever the server sends.
struct PrintingService;

#[async_trait]
impl WsHandler for PrintingService {
    async fn on_open(&self, id: SessionId, resource: &str) {
        info!("session {} open on {}", id, resource);
    }

    async fn on_close(&self, id: SessionId, _resource: &str) {
        info!("session {} closed", id);
    }

    async fn on_text(&self, _id: SessionId, _resource: &str, text: Utf8Bytes) {
        info!("received text message: {}", text);
    }

    async fn on_binary(&self, _id: SessionId, _resource: &str, data: Bytes) {
        info!("received binary message of {} bytes", data.len());
    }
}

fn print_help(exec_name: &str) {
    eprintln!("Usage: {} <host> <port> <message>", exec_name);
    eprintln!("Example:");
    eprintln!("    {} 127.0.0.1 8080 hello", exec_name);
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 4 {
        print_help(&args[0]);
        std::process::exit(1);
    }

    let host = &args[1];
    let port: u16 = args[2].parse().context("invalid port")?;

    let client = WsClient::new(
        ClientConfig::default(),
        Arc::new(PrintingService),
        Arc::new(LogErrorSink),
    );
    client.connect(host, port, "/").await.context("connect failed")?;
    client.send_text(args[3].clone())?;

    tokio::signal::ctrl_c().await?;
    info!("interrupted, shutting down");
    client.shutdown();
    client.join().await;
    Ok(())
}

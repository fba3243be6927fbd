use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, info};

use relay_core::ExecutorCtx;

use crate::http::{self, HttpContext};

/// Accept loop: every connection becomes an HTTP session task. Per-connection
/// failures are reported and accepting continues; fatal acceptor errors stop
/// the loop.
pub(crate) async fn run(listener: TcpListener, ctx: Arc<HttpContext>, executor: ExecutorCtx) {
    let shutdown = executor.shutdown_token();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    debug!(target: "listener", %peer, "connection accepted");
                    executor.spawn(http::run(stream, ctx.clone(), shutdown.clone()));
                }
                Err(error) => {
                    ctx.error_sink.on_accept_error(&error);
                    if is_fatal(&error) {
                        break;
                    }
                    // Transient resource exhaustion (EMFILE and friends):
                    // back off briefly, then accept again.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }

    info!(target: "listener", "accept loop stopped");
}

fn is_fatal(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::AddrNotAvailable
    )
}

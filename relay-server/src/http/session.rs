use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use futures::FutureExt;
use http::Method;
use http::header::SEC_WEBSOCKET_KEY;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role as WireRole;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use relay_core::{ErrorSink, HttpLocation, Role, SessionOptions, SessionRegistry, panic_message, protocol_config};

use super::request::{HttpRequest, read_request};
use super::response::{HttpResponse, Responder, bad_request, dropped_responder_fallback, not_found};
use super::HttpHandler;
use crate::router::WsRoute;

/// Everything an HTTP session needs from its server, shared by all
/// connections.
pub(crate) struct HttpContext {
    pub http: Arc<dyn HttpHandler>,
    pub ws: Option<WsRoute>,
    pub error_sink: Arc<dyn ErrorSink>,
    pub registry: Arc<SessionRegistry>,
    pub request_timeout: Duration,
    pub response_queue_limit: usize,
    pub max_read_message_size: usize,
    pub session_options: SessionOptions,
    pub gauge: Arc<PipelineGauge>,
}

/// Test hook: depth of the response queue across all connections, with a
/// high-water mark.
#[derive(Debug, Default)]
pub struct PipelineGauge {
    depth: AtomicUsize,
    high: AtomicUsize,
}

impl PipelineGauge {
    fn enqueued(&self) {
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        self.high.fetch_max(depth, Ordering::SeqCst);
    }

    fn dequeued(&self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn high_watermark(&self) -> usize {
        self.high.load(Ordering::SeqCst)
    }
}

struct ResponseSlot {
    rx: oneshot::Receiver<HttpResponse>,
    keep_alive: bool,
    head_only: bool,
    version: http::Version,
}

enum ReaderOutcome {
    Done,
    Upgrade(HttpRequest, OwnedReadHalf),
}

/// Drive one HTTP connection: read pipelined requests, dispatch them, write
/// the responses back in order. Reader and writer run concurrently within
/// this task; the bounded response channel pauses reads while the full
/// queue's worth of responses is outstanding.
pub(crate) async fn run(stream: TcpStream, ctx: Arc<HttpContext>, shutdown: CancellationToken) {
    let peer = stream.peer_addr().ok();
    trace!(target: "http", ?peer, "session started");

    let (read_half, write_half) = stream.into_split();
    let (resp_tx, resp_rx) = mpsc::channel::<ResponseSlot>(ctx.response_queue_limit);
    let writer_done = CancellationToken::new();

    let reader = read_loop(read_half, resp_tx, &ctx, &shutdown, &writer_done);
    let writer = write_loop(write_half, resp_rx, &ctx, &shutdown, &writer_done);
    let (reader_outcome, writer_half) = tokio::join!(reader, writer);

    if let ReaderOutcome::Upgrade(request, read_half) = reader_outcome {
        let Some(write_half) = writer_half else {
            return;
        };
        let Ok(stream) = read_half.reunite(write_half) else {
            return;
        };
        upgrade(stream, request, &ctx).await;
    }
    trace!(target: "http", ?peer, "session finished");
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    resp_tx: mpsc::Sender<ResponseSlot>,
    ctx: &Arc<HttpContext>,
    shutdown: &CancellationToken,
    writer_done: &CancellationToken,
) -> ReaderOutcome {
    let mut buf = BytesMut::with_capacity(8 * 1024);

    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => return ReaderOutcome::Done,
            _ = writer_done.cancelled() => return ReaderOutcome::Done,
            result = timeout(ctx.request_timeout, read_request(&mut read_half, &mut buf)) => match result {
                // Timer expiry closes the session; everything pending ends
                // on the cancelled path.
                Err(_) => {
                    debug!(target: "http", "request timed out");
                    return ReaderOutcome::Done;
                }
                Ok(Ok(Some(request))) => request,
                // Peer sent FIN between requests: clean close.
                Ok(Ok(None)) => return ReaderOutcome::Done,
                Ok(Err(error)) => {
                    ctx.http.on_error(HttpLocation::Read, &error).await;
                    if error.is_client_fault() {
                        let (tx, rx) = oneshot::channel();
                        let _ = tx.send(bad_request_raw(&error.to_string()));
                        ctx.gauge.enqueued();
                        let _ = resp_tx
                            .send(ResponseSlot {
                                rx,
                                keep_alive: false,
                                head_only: false,
                                version: http::Version::HTTP_11,
                            })
                            .await;
                    }
                    return ReaderOutcome::Done;
                }
            },
        };

        if ctx.ws.is_some() && request.is_websocket_upgrade() {
            // The WebSocket layer takes over the socket once all queued
            // responses have left.
            return ReaderOutcome::Upgrade(request, read_half);
        }

        let (tx, rx) = oneshot::channel();
        let slot = ResponseSlot {
            rx,
            keep_alive: request.keep_alive(),
            head_only: request.method() == Method::HEAD,
            version: request.version(),
        };
        let responder = Responder::new(tx);

        let dispatch = ctx.http.handle(request, responder);
        tokio::select! {
            // Abandoning the dispatch drops the responder, which resolves
            // the slot with a 500.
            _ = shutdown.cancelled() => return ReaderOutcome::Done,
            result = AssertUnwindSafe(dispatch).catch_unwind() => {
                if let Err(panic) = result {
                    ctx.error_sink.on_panic("http handler", &panic_message(panic.as_ref()));
                }
            }
        }

        ctx.gauge.enqueued();
        if resp_tx.send(slot).await.is_err() {
            ctx.gauge.dequeued();
            return ReaderOutcome::Done;
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut resp_rx: mpsc::Receiver<ResponseSlot>,
    ctx: &Arc<HttpContext>,
    shutdown: &CancellationToken,
    writer_done: &CancellationToken,
) -> Option<OwnedWriteHalf> {
    loop {
        let slot = tokio::select! {
            _ = shutdown.cancelled() => return None,
            slot = resp_rx.recv() => match slot {
                Some(slot) => slot,
                None => return Some(write_half),
            },
        };

        let response = tokio::select! {
            _ = shutdown.cancelled() => {
                ctx.gauge.dequeued();
                return None;
            }
            result = slot.rx => result.unwrap_or_else(|_| dropped_responder_fallback()),
        };
        ctx.gauge.dequeued();

        let need_eof = !slot.keep_alive || response.wants_close();
        let bytes = response.serialize(slot.version, need_eof, !slot.head_only);

        if let Err(error) = write_half.write_all(&bytes).await {
            ctx.http.on_error(HttpLocation::Write, &error.into()).await;
            writer_done.cancel();
            return None;
        }

        if need_eof {
            // Connection-close semantics: half-close our side and stop.
            let _ = write_half.shutdown().await;
            writer_done.cancel();
            return None;
        }
    }
}

/// Hand the connection to the WebSocket layer: resolve the resource, answer
/// the handshake, register the session.
async fn upgrade(mut stream: TcpStream, request: HttpRequest, ctx: &Arc<HttpContext>) {
    let Some(route) = &ctx.ws else { return };
    let resource = request.target().to_string();

    let Some(handler) = route.resolve(&resource) else {
        // Unknown resource: the connecting client sees its handshake fail.
        debug!(target: "http", %resource, "upgrade to unknown service");
        let response = not_found(&request, &resource);
        let _ = stream
            .write_all(&response.serialize(request.version(), true, true))
            .await;
        return;
    };

    if ctx.registry.is_shutting_down() {
        return;
    }

    let Some(key) = request.header(SEC_WEBSOCKET_KEY) else {
        let response = bad_request(&request, "missing Sec-WebSocket-Key");
        let _ = stream
            .write_all(&response.serialize(request.version(), true, true))
            .await;
        return;
    };

    let accept = derive_accept_key(key.as_bytes());
    let handshake = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         connection: Upgrade\r\n\
         upgrade: websocket\r\n\
         sec-websocket-accept: {}\r\n\r\n",
        accept
    );
    if stream.write_all(handshake.as_bytes()).await.is_err() {
        return;
    }

    let ws = WebSocketStream::from_raw_socket(
        stream,
        WireRole::Server,
        Some(protocol_config(ctx.max_read_message_size)),
    )
    .await;

    match ctx.registry.spawn(
        ws,
        Role::Server,
        resource.as_str(),
        handler,
        ctx.error_sink.clone(),
        ctx.session_options.clone(),
    ) {
        Ok(id) => debug!(target: "http", %id, %resource, "upgraded to websocket"),
        Err(error) => warn!(target: "http", %resource, "upgrade rejected: {}", error),
    }
}

fn bad_request_raw(why: &str) -> HttpResponse {
    HttpResponse::html(http::StatusCode::BAD_REQUEST, why.to_string())
}

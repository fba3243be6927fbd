use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{FutureExt, SinkExt, StreamExt};
use strum::Display;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message, WebSocketConfig};
use tokio_tungstenite::tungstenite::{self, Utf8Bytes};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::errors::{SendError, SessionError};
use crate::handler::{ErrorSink, WsHandler, WsLocation, panic_message};
use crate::identifier::SessionId;
use crate::registry::SessionRegistry;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(15_000);
pub const DEFAULT_MAX_READ_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_WRITE_LIST_LIMIT: usize = 64;

/// Close reasons travel in a close frame, whose reason field is capped by
/// RFC 6455 at 123 bytes.
const MAX_CLOSE_REASON: usize = 123;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    Server,
    Client,
}

/// Per-session tuning, taken from the owning server or client config.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub ping_interval: Duration,
    pub write_list_limit: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            write_list_limit: DEFAULT_WRITE_LIST_LIMIT,
        }
    }
}

/// Protocol configuration shared by the server upgrade path and the client
/// handshake: permessage-deflate stays off, the read cap applies to whole
/// messages and to single frames.
pub fn protocol_config(max_read_message_size: usize) -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(max_read_message_size))
        .max_frame_size(Some(max_read_message_size))
}

#[derive(Debug)]
pub(crate) enum Command {
    Text(Utf8Bytes),
    Binary(Bytes),
}

#[derive(Debug)]
pub(crate) enum Event {
    Open,
    Text(Utf8Bytes),
    Binary(Bytes),
    Error(WsLocation, SessionError),
    Close,
}

/// Cheap cloneable reference to a live session, held by the registry.
///
/// Sends are non-blocking: they append to the session's bounded write list
/// and fail synchronously with [`SendError::BufferFull`] when the list is at
/// capacity. A pending close halts new sends; the first close reason wins.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    resource: Arc<str>,
    cmd_tx: mpsc::Sender<Command>,
    close_tx: mpsc::Sender<Utf8Bytes>,
    events_tx: mpsc::UnboundedSender<Event>,
    closing: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn send_text(&self, text: impl Into<Utf8Bytes>) -> Result<(), SendError> {
        self.send(Command::Text(text.into()))
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), SendError> {
        self.send(Command::Binary(data.into()))
    }

    fn send(&self, command: Command) -> Result<(), SendError> {
        // Messages sent after a close was scheduled are dropped, not errors.
        if self.is_closing() {
            return Ok(());
        }

        match self.cmd_tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::BufferFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Schedule an orderly close. Queued writes drain first, then the close
    /// frame goes out. Idempotent: the first reason wins.
    pub fn close(&self, reason: impl Into<Utf8Bytes>) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.close_tx.try_send(truncate_reason(reason.into()));
    }

    /// Route a send-path failure through the session's handler strand.
    pub(crate) fn report_send_error(&self, error: SessionError) {
        let _ = self.events_tx.send(Event::Error(WsLocation::Send, error));
    }
}

fn truncate_reason(reason: Utf8Bytes) -> Utf8Bytes {
    if reason.as_str().len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut cut = MAX_CLOSE_REASON;
    while cut > 0 && !reason.as_str().is_char_boundary(cut) {
        cut -= 1;
    }
    reason.as_str()[..cut].to_string().into()
}

pub(crate) struct SessionContext {
    pub id: SessionId,
    pub role: Role,
    pub resource: Arc<str>,
    pub handler: Arc<dyn WsHandler>,
    pub error_sink: Arc<dyn ErrorSink>,
    pub registry: Arc<SessionRegistry>,
    pub options: SessionOptions,
    pub shutdown: CancellationToken,
}

/// Build the handle and both session tasks.
///
/// The I/O task is the session's I/O strand: it alone touches the stream and
/// the liveness timer. The handler task is the handler strand: it alone
/// invokes user callbacks, in event order. The stream must already be past
/// its handshake (accepted server-side or connected client-side). The caller
/// registers the handle before starting either future, so the erase at the
/// end of the I/O task always finds its entry.
pub(crate) fn build_session<S>(
    ctx: SessionContext,
    stream: WebSocketStream<S>,
) -> (
    SessionHandle,
    impl Future<Output = ()> + Send + 'static,
    impl Future<Output = ()> + Send + 'static,
)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(ctx.options.write_list_limit);
    let (close_tx, close_rx) = mpsc::channel(1);
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let handle = SessionHandle {
        id: ctx.id,
        resource: ctx.resource.clone(),
        cmd_tx,
        close_tx,
        events_tx: events_tx.clone(),
        closing: Arc::new(AtomicBool::new(false)),
    };

    let handler_task = run_handler(ctx.id, ctx.resource.clone(), ctx.handler, ctx.error_sink, events_rx);
    let state = IoState {
        registry: ctx.registry,
        closing: handle.closing.clone(),
        ping_interval: ctx.options.ping_interval,
        shutdown: ctx.shutdown,
    };
    let io_task = run_io(ctx.id, ctx.role, stream, events_tx, cmd_rx, close_rx, state);

    (handle, io_task, handler_task)
}

struct IoState {
    registry: Arc<SessionRegistry>,
    closing: Arc<AtomicBool>,
    ping_interval: Duration,
    shutdown: CancellationToken,
}

async fn run_io<S>(
    id: SessionId,
    role: Role,
    stream: WebSocketStream<S>,
    events_tx: mpsc::UnboundedSender<Event>,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut close_rx: mpsc::Receiver<Utf8Bytes>,
    state: IoState,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!(target: "session", %id, %role, "session started");
    let (mut sink, mut stream) = stream.split();

    let _ = events_tx.send(Event::Open);

    let mut wait_on_pong = false;
    let mut ping_counter: u64 = 0;
    let mut close_reason: Option<Utf8Bytes> = None;
    let mut close_sent = false;
    let mut deadline = Instant::now() + state.ping_interval;

    // A peer that stops draining its socket must not stall the I/O strand
    // past the liveness window; writes that exceed it tear the session down.
    let write_deadline = 2 * state.ping_interval;

    loop {
        if close_reason.is_some() && !close_sent {
            // A close is pending: halt new sends, drain the write list, then
            // issue the close frame. Reads continue below until the peer
            // acknowledges or the timer gives up on it.
            state.closing.store(true, Ordering::SeqCst);
            if !drain_and_close(&mut sink, &mut cmd_rx, close_reason.clone(), &events_tx, write_deadline).await {
                break;
            }
            close_sent = true;
        }

        tokio::select! {
            _ = state.shutdown.cancelled(), if close_reason.is_none() => {
                close_reason = Some("shutdown".into());
            }

            Some(reason) = close_rx.recv(), if close_reason.is_none() => {
                close_reason = Some(reason);
            }

            Some(command) = cmd_rx.recv(), if close_reason.is_none() => {
                match timeout(write_deadline, write_frame(&mut sink, command)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        let _ = events_tx.send(Event::Error(WsLocation::Write, error.into()));
                        close_reason = Some("write error".into());
                    }
                    Err(_) => {
                        debug!(target: "session", %id, "write stalled, closing socket");
                        break;
                    }
                }
            }

            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        wait_on_pong = false;
                        deadline = Instant::now() + state.ping_interval;
                        let _ = events_tx.send(Event::Text(text));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        wait_on_pong = false;
                        deadline = Instant::now() + state.ping_interval;
                        let _ = events_tx.send(Event::Binary(data));
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {
                        // Control frames count as activity; pings are answered
                        // by the protocol layer.
                        wait_on_pong = false;
                        deadline = Instant::now() + state.ping_interval;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        trace!(target: "session", %id, ?frame, "peer sent close");
                        if !close_sent {
                            let _ = timeout(write_deadline, sink.send(Message::Close(None))).await;
                        }
                        break;
                    }
                    Some(Err(tungstenite::Error::ConnectionClosed))
                    | Some(Err(tungstenite::Error::AlreadyClosed))
                    | None => break,
                    Some(Err(error)) => {
                        if close_sent {
                            break;
                        }
                        let _ = events_tx.send(Event::Error(WsLocation::Read, error.into()));
                        if close_reason.is_none() {
                            // Attempt an orderly close; reading continues so
                            // the close frame can be written and acknowledged.
                            close_reason = Some("read error".into());
                        } else {
                            break;
                        }
                    }
                }
            }

            _ = sleep_until(deadline) => {
                if close_sent {
                    // The peer never acknowledged our close frame.
                    debug!(target: "session", %id, "close handshake timed out");
                    break;
                }
                if !wait_on_pong {
                    wait_on_pong = true;
                    deadline = Instant::now() + state.ping_interval;
                    let payload = Bytes::from(ping_counter.to_string());
                    ping_counter += 1;
                    match timeout(write_deadline, sink.send(Message::Ping(payload))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(error)) => {
                            let _ = events_tx.send(Event::Error(WsLocation::Ping, error.into()));
                            if close_reason.is_none() {
                                close_reason = Some("ping error".into());
                            }
                        }
                        Err(_) => break,
                    }
                } else {
                    // No pong and no other activity for two intervals: the
                    // peer is gone. Dropping the stream aborts everything
                    // outstanding on this connection.
                    debug!(target: "session", %id, "liveness timeout, closing socket");
                    break;
                }
            }
        }
    }

    state.closing.store(true, Ordering::SeqCst);
    state.registry.erase(id);
    let _ = events_tx.send(Event::Close);
    debug!(target: "session", %id, "session finished");
}

/// Write out everything still queued, then the close frame. Returns false if
/// the connection broke underneath and the session should tear down hard.
async fn drain_and_close<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    cmd_rx: &mut mpsc::Receiver<Command>,
    reason: Option<Utf8Bytes>,
    events_tx: &mpsc::UnboundedSender<Event>,
    write_deadline: Duration,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Ok(command) = cmd_rx.try_recv() {
        match timeout(write_deadline, write_frame(sink, command)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                let _ = events_tx.send(Event::Error(WsLocation::Write, error.into()));
                return false;
            }
            Err(_) => return false,
        }
    }

    let frame = reason.map(|reason| CloseFrame {
        code: CloseCode::Normal,
        reason,
    });
    match timeout(write_deadline, sink.send(Message::Close(frame))).await {
        Ok(Ok(())) => true,
        Ok(Err(error)) => {
            match error {
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {}
                error => {
                    let _ = events_tx.send(Event::Error(WsLocation::Close, error.into()));
                }
            }
            false
        }
        Err(_) => false,
    }
}

async fn write_frame<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    command: Command,
) -> Result<(), tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match command {
        Command::Text(text) => sink.send(Message::Text(text)).await,
        Command::Binary(data) => sink.send(Message::Binary(data)).await,
    }
}

/// The handler strand: user callbacks run here, serialized per session, in
/// the order the I/O strand produced the events. A panicking callback is
/// contained and re-entered through `on_panic`; a panic inside `on_panic`
/// goes to the error sink as last resort.
async fn run_handler(
    id: SessionId,
    resource: Arc<str>,
    handler: Arc<dyn WsHandler>,
    error_sink: Arc<dyn ErrorSink>,
    mut events_rx: mpsc::UnboundedReceiver<Event>,
) {
    while let Some(event) = events_rx.recv().await {
        // Close is terminal: handles cloned out of the registry may outlive
        // the session, so the strand ends on the event, not on sender drop.
        let last = matches!(event, Event::Close);

        let dispatch = async {
            match &event {
                Event::Open => handler.on_open(id, &resource).await,
                Event::Text(text) => handler.on_text(id, &resource, text.clone()).await,
                Event::Binary(data) => handler.on_binary(id, &resource, data.clone()).await,
                Event::Error(location, error) => handler.on_error(id, &resource, *location, error).await,
                Event::Close => handler.on_close(id, &resource).await,
            }
        };

        if let Err(panic) = AssertUnwindSafe(dispatch).catch_unwind().await {
            let message = panic_message(panic.as_ref());
            let reentry = std::panic::catch_unwind(AssertUnwindSafe(|| {
                handler.on_panic(id, &resource, &message);
            }));
            if reentry.is_err() {
                error_sink.on_panic("ws handler", &message);
            }
        }

        if last {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = SessionOptions::default();
        assert_eq!(options.ping_interval, Duration::from_millis(15_000));
        assert_eq!(options.write_list_limit, 64);
    }

    #[test]
    fn test_close_reason_is_truncated_to_frame_limit() {
        let reason = truncate_reason("x".repeat(200).into());
        assert_eq!(reason.as_str().len(), 123);

        let reason = truncate_reason("shutdown".into());
        assert_eq!(reason.as_str(), "shutdown");
    }

}

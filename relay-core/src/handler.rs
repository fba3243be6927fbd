use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use strum::Display;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tracing::error;

use crate::errors::SessionError;
use crate::identifier::SessionId;
use crate::registry::SessionRegistry;

/// Operation that produced a session error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum WsLocation {
    Handshake,
    Read,
    Write,
    Close,
    Ping,
    Timer,
    Send,
}

/// Operation that produced an HTTP session error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum HttpLocation {
    Read,
    Write,
    Timer,
}

/// User-facing callbacks of the WebSocket layer.
///
/// All methods run on the session's handler strand: they arrive in event
/// order (open, then messages, then close) and never concurrently for the
/// same session. Every method defaults to a no-op.
///
/// A handler that panics does not tear down the session; the panic is caught
/// and re-entered through [`WsHandler::on_panic`].
#[async_trait]
pub trait WsHandler: Send + Sync {
    /// Called once when the server (or client) wires this handler to its
    /// session registry, before any session exists.
    fn attach(&self, registry: Arc<SessionRegistry>) {
        let _ = registry;
    }

    async fn on_open(&self, id: SessionId, resource: &str) {
        let _ = (id, resource);
    }

    async fn on_close(&self, id: SessionId, resource: &str) {
        let _ = (id, resource);
    }

    async fn on_text(&self, id: SessionId, resource: &str, text: Utf8Bytes) {
        let _ = (id, resource, text);
    }

    async fn on_binary(&self, id: SessionId, resource: &str, data: Bytes) {
        let _ = (id, resource, data);
    }

    async fn on_error(&self, id: SessionId, resource: &str, location: WsLocation, error: &SessionError) {
        let _ = (id, resource, location, error);
    }

    fn on_panic(&self, id: SessionId, resource: &str, message: &str) {
        let _ = (id, resource, message);
    }
}

/// Sink for server-level failures that have no session to report through.
pub trait ErrorSink: Send + Sync {
    fn on_accept_error(&self, error: &std::io::Error) {
        let _ = error;
    }

    fn on_panic(&self, context: &str, message: &str) {
        let _ = (context, message);
    }
}

/// Default sink that writes everything to the tracing subscriber.
#[derive(Debug, Default)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn on_accept_error(&self, error: &std::io::Error) {
        error!(target: "listener", "accept failed: {}", error);
    }

    fn on_panic(&self, context: &str, message: &str) {
        error!(target: "server", "panic in {}: {}", context, message);
    }
}

/// Best-effort extraction of a panic payload's message.
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

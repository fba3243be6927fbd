use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors surfaced synchronously by the send paths.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("write buffer is full")]
    BufferFull,

    #[error("session is closed")]
    Closed,

    #[error("client is not connected")]
    NotConnected,
}

/// Errors reported to `WsHandler::on_error` for a running session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("websocket protocol error: {0}")]
    Protocol(#[from] tungstenite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("write buffer is full")]
    WriteBufferFull,
}

impl SessionError {
    /// True if the peer sent a message larger than `max_read_message_size`.
    pub fn is_size_violation(&self) -> bool {
        matches!(
            self,
            SessionError::Protocol(tungstenite::Error::Capacity(
                tungstenite::error::CapacityError::MessageTooLong { .. }
            ))
        )
    }
}

/// Errors from session registry and service router management.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("service({0}) already exists")]
    DuplicateService(String),

    #[error("service({0}) doesn't exist")]
    UnknownService(String),

    #[error("registry is shutting down")]
    ShuttingDown,
}

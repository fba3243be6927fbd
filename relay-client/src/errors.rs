use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors of the outbound connect path.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("address resolution failed: {0}")]
    Resolve(#[source] std::io::Error),

    #[error("connection failed: {0}")]
    Io(#[source] std::io::Error),

    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),

    #[error("client is shut down")]
    Shutdown,
}

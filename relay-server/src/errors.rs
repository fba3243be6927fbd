use thiserror::Error;

/// Errors of the HTTP request pipeline.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed request: {0}")]
    Parse(#[from] httparse::Error),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("request head too large")]
    HeadTooLarge,

    #[error("unsupported transfer encoding")]
    UnsupportedTransferEncoding,

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl HttpError {
    /// True for errors the peer caused with a malformed request, which are
    /// answered with a 400 before the connection closes. I/O class errors
    /// have no one left to answer.
    pub fn is_client_fault(&self) -> bool {
        !matches!(self, HttpError::Io(_) | HttpError::UnexpectedEof)
    }
}

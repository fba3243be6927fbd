mod request;
mod response;
mod session;

pub use request::*;
pub use response::*;
pub use session::*;

use async_trait::async_trait;
use relay_core::HttpLocation;

use crate::errors::HttpError;

/// The HTTP request pipeline's user-facing contract.
///
/// `handle` receives each parsed request together with a move-only responder
/// that must be consumed exactly once; responses leave the connection in the
/// order the requests arrived, however late the handler answers.
#[async_trait]
pub trait HttpHandler: Send + Sync {
    async fn handle(&self, request: HttpRequest, responder: Responder);

    async fn on_error(&self, location: HttpLocation, error: &HttpError) {
        let _ = (location, error);
    }
}

/// Default pipeline handler: answers every request with 404.
#[derive(Debug, Default)]
pub struct NotFoundHandler;

#[async_trait]
impl HttpHandler for NotFoundHandler {
    async fn handle(&self, request: HttpRequest, responder: Responder) {
        let target = request.target().to_string();
        responder.send(not_found(&request, &target));
    }
}

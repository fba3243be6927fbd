use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, SERVER};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version};
use tokio::sync::oneshot;

use super::request::HttpRequest;

pub(crate) const SERVER_NAME: &str = concat!("relay/", env!("CARGO_PKG_VERSION"));

/// An HTTP response queued for a pipeline slot.
#[derive(Debug)]
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Self {
        Self::new(status)
            .header(CONTENT_TYPE, content_type)
            .body(body)
    }

    pub fn html(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self::with_body(status, "text/html", body)
    }

    pub fn header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// True if the response itself asks for connection-close semantics.
    pub(crate) fn wants_close(&self) -> bool {
        self.headers
            .get(CONNECTION)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("close"))
    }

    /// Serialize status line, headers and body. `include_body` is false for
    /// HEAD responses, which still advertise the length.
    pub(crate) fn serialize(&self, version: Version, need_eof: bool, include_body: bool) -> Bytes {
        let mut out = BytesMut::with_capacity(256 + self.body.len());

        let version = match version {
            Version::HTTP_10 => "HTTP/1.0",
            _ => "HTTP/1.1",
        };
        out.put_slice(version.as_bytes());
        out.put_slice(b" ");
        out.put_slice(self.status.as_str().as_bytes());
        out.put_slice(b" ");
        out.put_slice(self.status.canonical_reason().unwrap_or("Unknown").as_bytes());
        out.put_slice(b"\r\n");

        for (name, value) in self.headers.iter() {
            if name == CONNECTION || name == CONTENT_LENGTH || name == SERVER {
                continue;
            }
            out.put_slice(name.as_str().as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }

        out.put_slice(b"server: ");
        out.put_slice(SERVER_NAME.as_bytes());
        out.put_slice(b"\r\n");
        out.put_slice(b"content-length: ");
        out.put_slice(self.body.len().to_string().as_bytes());
        out.put_slice(b"\r\n");
        out.put_slice(b"connection: ");
        out.put_slice(if need_eof { b"close" as &[u8] } else { b"keep-alive" });
        out.put_slice(b"\r\n\r\n");

        if include_body {
            out.put_slice(&self.body);
        }
        out.freeze()
    }
}

/// Canonical 400 with the failure reason in the body.
pub fn bad_request(req: &HttpRequest, why: &str) -> HttpResponse {
    canonical(req, StatusCode::BAD_REQUEST, why.to_string())
}

/// Canonical 404 naming the missing resource.
pub fn not_found(req: &HttpRequest, target: &str) -> HttpResponse {
    canonical(
        req,
        StatusCode::NOT_FOUND,
        format!("The resource '{}' was not found.", target),
    )
}

/// Canonical 500 naming the failure.
pub fn server_error(req: &HttpRequest, what: &str) -> HttpResponse {
    canonical(
        req,
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("An error occurred: '{}'", what),
    )
}

fn canonical(req: &HttpRequest, status: StatusCode, body: String) -> HttpResponse {
    let response = HttpResponse::html(status, body);
    if req.keep_alive() {
        response
    } else {
        response.header(CONNECTION, "close")
    }
}

/// One-shot response sink handed to the HTTP handler.
///
/// Consuming it is enforced by move semantics; a responder dropped without
/// an answer resolves its pipeline slot with a 500 so the connection never
/// stalls on a forgotten request.
#[derive(Debug)]
pub struct Responder {
    tx: Option<oneshot::Sender<HttpResponse>>,
}

impl Responder {
    pub(crate) fn new(tx: oneshot::Sender<HttpResponse>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn send(mut self, response: HttpResponse) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(response);
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(dropped_responder_fallback());
        }
    }
}

pub(crate) fn dropped_responder_fallback() -> HttpResponse {
    HttpResponse::html(
        StatusCode::INTERNAL_SERVER_ERROR,
        "An error occurred: 'the request was not answered'",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use test_log::test;

    async fn request(raw: &str) -> HttpRequest {
        let mut reader = std::io::Cursor::new(raw.as_bytes().to_vec());
        let mut buf = BytesMut::new();
        crate::http::read_request(&mut reader, &mut buf)
            .await
            .unwrap()
            .unwrap()
    }

    #[test(tokio::test)]
    async fn test_serialize_sets_length_server_and_connection() {
        let response = HttpResponse::html(StatusCode::OK, "hello");
        let bytes = response.serialize(Version::HTTP_11, false, true);
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-type: text/html\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.contains(&format!("server: {}\r\n", SERVER_NAME)));
        assert!(text.contains("connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test(tokio::test)]
    async fn test_head_serialization_omits_body_keeps_length() {
        let response = HttpResponse::html(StatusCode::OK, "hello");
        let bytes = response.serialize(Version::HTTP_11, true, false);
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test(tokio::test)]
    async fn test_canonical_responses_preserve_keep_alive() {
        let req = request("GET /missing HTTP/1.1\r\n\r\n").await;
        let response = not_found(&req, req.target());
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(!response.wants_close());

        let req = request("GET /missing HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        let response = bad_request(&req, "nope");
        assert!(response.wants_close());
    }

    #[test(tokio::test)]
    async fn test_dropped_responder_resolves_slot() {
        let (tx, rx) = oneshot::channel();
        drop(Responder::new(tx));
        let response = rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

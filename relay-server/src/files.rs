use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};

use crate::http::{HttpHandler, HttpRequest, HttpResponse, Responder, bad_request, not_found, server_error};

/// Serves files below a document root over GET and HEAD.
pub struct FileRequestHandler {
    doc_root: PathBuf,
}

impl FileRequestHandler {
    pub fn new(doc_root: impl Into<PathBuf>) -> Self {
        Self {
            doc_root: doc_root.into(),
        }
    }

    pub fn doc_root(&self) -> &PathBuf {
        &self.doc_root
    }
}

#[async_trait]
impl HttpHandler for FileRequestHandler {
    async fn handle(&self, request: HttpRequest, responder: Responder) {
        if request.method() != Method::GET && request.method() != Method::HEAD {
            responder.send(bad_request(&request, "Unknown HTTP-method"));
            return;
        }

        let target = request.target();
        if target.is_empty() || !target.starts_with('/') || target.contains("..") {
            responder.send(bad_request(&request, "Illegal request-target"));
            return;
        }

        let mut path = self.doc_root.join(&target[1..]);
        if target.ends_with('/') {
            path.push("index.html");
        }

        match tokio::fs::read(&path).await {
            Ok(contents) => {
                let mime = mime_type(&path.to_string_lossy());
                responder.send(HttpResponse::with_body(StatusCode::OK, mime, Bytes::from(contents)));
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                let target = target.to_string();
                responder.send(not_found(&request, &target));
            }
            Err(error) => {
                responder.send(server_error(&request, &error.to_string()));
            }
        }
    }
}

/// MIME type from the path's extension.
pub fn mime_type(path: &str) -> &'static str {
    let ext = match path.rfind('.') {
        Some(pos) => &path[pos + 1..],
        None => return "application/text",
    };

    match ext.to_ascii_lowercase().as_str() {
        "htm" | "html" | "php" => "text/html",
        "css" => "text/css",
        "txt" => "text/plain",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "swf" => "application/x-shockwave-flash",
        "flv" => "video/x-flv",
        "png" => "image/png",
        "jpe" | "jpeg" | "jpg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "ico" => "image/vnd.microsoft.icon",
        "tiff" | "tif" => "image/tiff",
        "svg" | "svgz" => "image/svg+xml",
        _ => "application/text",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use test_log::test;
    use tokio::sync::oneshot;

    async fn request(raw: &str) -> HttpRequest {
        let mut reader = std::io::Cursor::new(raw.as_bytes().to_vec());
        let mut buf = BytesMut::new();
        crate::http::read_request(&mut reader, &mut buf)
            .await
            .unwrap()
            .unwrap()
    }

    async fn roundtrip(handler: &FileRequestHandler, raw: &str) -> HttpResponse {
        let req = request(raw).await;
        let (tx, rx) = oneshot::channel();
        handler.handle(req, Responder::new(tx)).await;
        rx.await.unwrap()
    }

    #[test]
    fn test_mime_table() {
        assert_eq!(mime_type("/srv/index.html"), "text/html");
        assert_eq!(mime_type("logo.SVG"), "image/svg+xml");
        assert_eq!(mime_type("data.json"), "application/json");
        assert_eq!(mime_type("unknown.zzz"), "application/text");
        assert_eq!(mime_type("no_extension"), "application/text");
    }

    #[test(tokio::test)]
    async fn test_rejects_illegal_targets() {
        let handler = FileRequestHandler::new("/tmp");

        let response = roundtrip(&handler, "GET /../etc/passwd HTTP/1.1\r\n\r\n").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = roundtrip(&handler, "DELETE /x HTTP/1.1\r\n\r\n").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test(tokio::test)]
    async fn test_serves_and_misses_files() {
        let dir = std::env::temp_dir().join(format!("relay-files-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("hello.txt"), b"hi there").await.unwrap();

        let handler = FileRequestHandler::new(&dir);

        let response = roundtrip(&handler, "GET /hello.txt HTTP/1.1\r\n\r\n").await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = roundtrip(&handler, "GET /missing.txt HTTP/1.1\r\n\r\n").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}

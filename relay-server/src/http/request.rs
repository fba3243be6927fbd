use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, SEC_WEBSOCKET_KEY, TRANSFER_ENCODING, UPGRADE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Version};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::errors::HttpError;

/// Request heads larger than this are rejected outright.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Cap on `Content-Length` bodies.
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

const MAX_HEADERS: usize = 64;

/// A parsed HTTP/1.x request.
#[derive(Debug)]
pub struct HttpRequest {
    method: Method,
    target: String,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
}

impl HttpRequest {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn keep_alive(&self) -> bool {
        let connection = self.header(CONNECTION).unwrap_or("");
        if self.version == Version::HTTP_10 {
            token_list_contains(connection, "keep-alive")
        } else {
            !token_list_contains(connection, "close")
        }
    }

    /// RFC 6455 upgrade detection: a GET whose Connection header carries the
    /// `upgrade` token, whose Upgrade header names `websocket`, and which
    /// offers a key.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.method == Method::GET
            && token_list_contains(self.header(CONNECTION).unwrap_or(""), "upgrade")
            && self
                .header(UPGRADE)
                .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
            && self.headers.contains_key(SEC_WEBSOCKET_KEY)
    }
}

fn token_list_contains(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

/// Read one request from the connection, consuming parsed bytes from `buf`.
///
/// Returns `Ok(None)` on a clean end of stream between requests. Bytes of a
/// pipelined follow-up request stay in `buf` for the next call.
pub(crate) async fn read_request<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Option<HttpRequest>, HttpError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some((mut request, head_len, content_length)) = parse_head(buf)? {
            buf.advance(head_len);
            while buf.len() < content_length {
                if reader.read_buf(buf).await? == 0 {
                    return Err(HttpError::UnexpectedEof);
                }
            }
            request.body = buf.split_to(content_length).freeze();
            return Ok(Some(request));
        }

        if buf.len() > MAX_HEAD_SIZE {
            return Err(HttpError::HeadTooLarge);
        }

        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(HttpError::UnexpectedEof);
        }
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<(HttpRequest, usize, usize)>, HttpError> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut header_storage);

    let head_len = match parsed.parse(buf)? {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(len) => len,
    };

    let method = Method::from_bytes(parsed.method.unwrap_or("").as_bytes())
        .map_err(|_| HttpError::Invalid("bad method".into()))?;
    let target = parsed.path.unwrap_or("").to_string();
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| HttpError::Invalid(format!("bad header name: {}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| HttpError::Invalid(format!("bad value for header {}", header.name)))?;
        headers.append(name, value);
    }

    if headers
        .get(TRANSFER_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| token_list_contains(value, "chunked"))
    {
        return Err(HttpError::UnsupportedTransferEncoding);
    }

    let content_length = match headers.get(CONTENT_LENGTH) {
        None => 0,
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .ok_or_else(|| HttpError::Invalid("bad content-length".into()))?,
    };
    if content_length > MAX_BODY_SIZE {
        return Err(HttpError::Invalid("body too large".into()));
    }

    let request = HttpRequest {
        method,
        target,
        version,
        headers,
        body: Bytes::new(),
    };
    Ok(Some((request, head_len, content_length)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    async fn parse(raw: &str) -> Result<Option<HttpRequest>, HttpError> {
        let mut reader = std::io::Cursor::new(raw.as_bytes().to_vec());
        let mut buf = BytesMut::new();
        read_request(&mut reader, &mut buf).await
    }

    #[test(tokio::test)]
    async fn test_parses_simple_get() {
        let request = parse("GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.method(), &Method::GET);
        assert_eq!(request.target(), "/index.html");
        assert_eq!(request.version(), Version::HTTP_11);
        assert!(request.keep_alive());
        assert!(!request.is_websocket_upgrade());
    }

    #[test(tokio::test)]
    async fn test_reads_content_length_body() {
        let request = parse("POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.body().as_ref(), b"hello");
    }

    #[test(tokio::test)]
    async fn test_pipelined_requests_stay_buffered() {
        let raw = "GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let mut reader = std::io::Cursor::new(raw.as_bytes().to_vec());
        let mut buf = BytesMut::new();

        let first = read_request(&mut reader, &mut buf).await.unwrap().unwrap();
        assert_eq!(first.target(), "/a");
        let second = read_request(&mut reader, &mut buf).await.unwrap().unwrap();
        assert_eq!(second.target(), "/b");
        assert!(read_request(&mut reader, &mut buf).await.unwrap().is_none());
    }

    #[test(tokio::test)]
    async fn test_connection_close_and_http10_defaults() {
        let request = parse("GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert!(!request.keep_alive());

        let request = parse("GET / HTTP/1.0\r\n\r\n").await.unwrap().unwrap();
        assert!(!request.keep_alive());

        let request = parse("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert!(request.keep_alive());
    }

    #[test(tokio::test)]
    async fn test_detects_websocket_upgrade() {
        let request = parse(
            "GET /chat HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive, Upgrade\r\n\
             Upgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap()
        .unwrap();
        assert!(request.is_websocket_upgrade());
    }

    #[test(tokio::test)]
    async fn test_rejects_chunked_and_truncated() {
        let result = parse("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n").await;
        assert!(matches!(result, Err(HttpError::UnsupportedTransferEncoding)));

        let result = parse("GET / HTTP/1.1\r\nHos").await;
        assert!(matches!(result, Err(HttpError::UnexpectedEof)));
    }
}

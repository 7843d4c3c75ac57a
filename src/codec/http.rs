//! HTTP/1.1 request framing and response building (§4.8.1).

use crate::buffer::Buffer;
use crate::error::CodecError;

use super::{try_frame_text_request, RawTextRequest};

/// A fully framed HTTP/1.1 request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpRequest {
    /// Request method, e.g. `GET`.
    pub method: String,
    /// Request target including any query string.
    pub path: String,
    /// Headers in the order they appeared, names case-preserved.
    pub headers: Vec<(String, String)>,
    /// `Content-Type` header value, if present.
    pub content_type: Option<String>,
    /// Request body, empty when `Content-Length` is absent or zero.
    pub body: Vec<u8>,
    /// Peer address, filled in by the connection layer after framing.
    pub remote_ip: String,
}

impl HttpRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether this request asks for a WebSocket upgrade per RFC 6455:
    /// `Upgrade: websocket` and a `Sec-WebSocket-Key` header present.
    pub fn wants_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
            && self.header("sec-websocket-key").is_some()
    }
}

/// HTTP/1.1 framing state. Stateless between requests; one instance handles
/// an unbounded number of pipelined requests on a keep-alive connection.
#[derive(Debug, Default)]
pub struct HttpCodec;

impl HttpCodec {
    /// Creates a fresh codec.
    pub fn new() -> Self {
        HttpCodec
    }

    /// Frames as many complete requests as `buf` currently holds.
    pub fn feed(&mut self, buf: &mut Buffer) -> Result<Vec<HttpRequest>, CodecError> {
        let mut out = Vec::new();
        loop {
            let framed = try_frame_text_request(buf)?;
            let (raw, consumed) = match framed {
                Some(v) => v,
                None => break,
            };

            if !is_http_method(raw.method) || !raw.version.starts_with("HTTP/") {
                return Err(CodecError::BadRequest("http"));
            }

            out.push(to_http_request(&raw));
            buf.consume(consumed);
        }
        Ok(out)
    }
}

fn is_http_method(method: &str) -> bool {
    matches!(
        method,
        "GET" | "POST" | "PUT" | "DELETE" | "HEAD" | "OPTIONS" | "PATCH"
    )
}

fn to_http_request(raw: &RawTextRequest<'_>) -> HttpRequest {
    let headers: Vec<(String, String)> = raw
        .headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let content_type = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        .map(|(_, v)| v.clone());

    HttpRequest {
        method: raw.method.to_string(),
        path: raw.target.to_string(),
        headers,
        content_type,
        body: raw.body.to_vec(),
        remote_ip: String::new(),
    }
}

/// Reason phrase for the handful of statuses this server emits.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Builds a complete HTTP/1.1 response: status line, `Content-Type`,
/// `Content-Length` (auto-filled if the caller didn't set one in `headers`),
/// any extra `headers`, `Connection: keep-alive`, a permissive CORS header,
/// blank line, body.
pub fn build_response(
    status: u16,
    content_type: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 256);
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status)).as_bytes());
    out.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());

    if !headers
        .iter()
        .any(|(k, _)| k.eq_ignore_ascii_case("content-length"))
    {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    for (name, value) in headers {
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(b"Connection: keep-alive\r\n");
    out.extend_from_slice(b"Access-Control-Allow-Origin: *\r\n");
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn feeds_a_single_get_request_with_no_body() {
        let mut buf = Buffer::new();
        buf.append(b"GET /users HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut codec = HttpCodec::new();
        let reqs = codec.feed(&mut buf).unwrap();
        assert_eq!(1, reqs.len());
        assert_eq!("GET", reqs[0].method);
        assert_eq!("/users", reqs[0].path);
        assert_eq!(0, buf.readable());
    }

    #[test]
    fn feeds_pipelined_requests_in_one_call() {
        let mut buf = Buffer::new();
        buf.append(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        let mut codec = HttpCodec::new();
        let reqs = codec.feed(&mut buf).unwrap();
        assert_eq!(2, reqs.len());
        assert_eq!("/a", reqs[0].path);
        assert_eq!("/b", reqs[1].path);
    }

    #[test]
    fn rejects_unknown_method() {
        let mut buf = Buffer::new();
        buf.append(b"FROB / HTTP/1.1\r\n\r\n");
        let mut codec = HttpCodec::new();
        assert!(codec.feed(&mut buf).is_err());
    }

    #[test]
    fn detects_websocket_upgrade_request() {
        let req = HttpRequest {
            headers: vec![
                ("Upgrade".into(), "websocket".into()),
                ("Sec-WebSocket-Key".into(), "dGhlIHNhbXBsZSBub25jZQ==".into()),
            ],
            ..Default::default()
        };
        assert!(req.wants_websocket_upgrade());
    }

    #[test]
    fn build_response_autofills_content_length() {
        let bytes = build_response(200, "application/json", &[], b"{}");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("{}"));
    }
}

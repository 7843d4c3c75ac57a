//! Stream-to-message parsers and message-to-stream builders for every wire
//! protocol this crate speaks, unified behind one tagged union so
//! `ProtocolRouter` never needs a trait object: the variant set is closed.

pub mod ftp;
pub mod http;
pub mod rtsp;
pub mod sip;
pub mod websocket;

use crate::buffer::Buffer;
use crate::error::CodecError;

/// One fully framed request/line recognized by a codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A complete HTTP/1.1 request.
    Http(http::HttpRequest),
    /// A complete WebSocket frame.
    WebSocket(websocket::Frame),
    /// A complete RTSP request.
    Rtsp(rtsp::RtspRequest),
    /// A complete SIP request.
    Sip(sip::SipRequest),
    /// One CRLF-terminated FTP control line.
    Ftp(ftp::FtpLine),
}

/// A tagged union over the per-protocol codec state. `feed` owns advancing
/// the buffer's read cursor for whatever it consumes.
#[derive(Debug)]
pub enum Codec {
    /// HTTP/1.1 request framing.
    Http(http::HttpCodec),
    /// RFC 6455 WebSocket framing (post-handshake).
    WebSocket(websocket::WebSocketCodec),
    /// RTSP/1.0 request framing.
    Rtsp(rtsp::RtspCodec),
    /// SIP/2.0 request framing.
    Sip(sip::SipCodec),
    /// FTP control-channel line framing.
    Ftp(ftp::FtpCodec),
}

impl Codec {
    /// Feeds whatever is newly readable in `buf` to the active codec.
    /// Returns every message fully framed this call; consumed bytes are
    /// already removed from `buf`. A `CodecError` means the connection must
    /// close; partial input is not an error and simply yields no messages.
    pub fn feed(&mut self, buf: &mut Buffer) -> Result<Vec<Message>, CodecError> {
        match self {
            Codec::Http(c) => c.feed(buf).map(|v| v.into_iter().map(Message::Http).collect()),
            Codec::WebSocket(c) => c
                .feed(buf)
                .map(|v| v.into_iter().map(Message::WebSocket).collect()),
            Codec::Rtsp(c) => c.feed(buf).map(|v| v.into_iter().map(Message::Rtsp).collect()),
            Codec::Sip(c) => c.feed(buf).map(|v| v.into_iter().map(Message::Sip).collect()),
            Codec::Ftp(c) => c.feed(buf).map(|v| v.into_iter().map(Message::Ftp).collect()),
        }
    }
}

/// A borrowed view over one parsed `METHOD TARGET VERSION` request line plus
/// its headers and body, shared by HTTP, RTSP and SIP framing (§4.8.1,
/// §4.8.3): all three share "request line, CRLF headers, blank line, body of
/// exactly `Content-Length` bytes".
pub(crate) struct RawTextRequest<'a> {
    pub method: &'a str,
    pub target: &'a str,
    pub version: &'a str,
    pub headers: Vec<(&'a str, &'a str)>,
    pub body: &'a [u8],
}

/// Attempts to frame one text request out of `buf`'s readable region.
/// Returns `Ok(None)` if the header terminator hasn't arrived yet, or if it
/// has but the declared body isn't fully buffered. Does not mutate `buf`;
/// the caller re-borrows on success to consume the framed length.
pub(crate) fn try_frame_text_request(buf: &Buffer) -> Result<Option<(RawTextRequest<'_>, usize)>, CodecError> {
    let data = buf.peek();
    let header_end = match find_subslice(data, b"\r\n\r\n") {
        Some(pos) => pos,
        None => return Ok(None),
    };

    let header_block = &data[..header_end];
    let mut lines = header_block.split(|&b| b == b'\n').map(strip_cr);

    let request_line = lines.next().ok_or(CodecError::BadRequest("text"))?;
    let request_line =
        std::str::from_utf8(request_line).map_err(|_| CodecError::BadRequest("text"))?;
    let mut parts = request_line.splitn(3, ' ');
    let method = parts.next().filter(|s| !s.is_empty());
    let target = parts.next().filter(|s| !s.is_empty());
    let version = parts.next().filter(|s| !s.is_empty());
    let (method, target, version) = match (method, target, version) {
        (Some(m), Some(t), Some(v)) => (m, t, v),
        _ => return Err(CodecError::BadRequest("text")),
    };

    let mut headers = Vec::new();
    let mut content_length = 0usize;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let line = std::str::from_utf8(line).map_err(|_| CodecError::BadRequest("text"))?;
        let (name, value) = line
            .split_once(':')
            .ok_or(CodecError::BadRequest("text"))?;
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse().map_err(|_| CodecError::BadRequest("text"))?;
        }
        headers.push((name, value));
    }

    let body_start = header_end + 4;
    let total_len = body_start + content_length;
    if data.len() < total_len {
        return Ok(None);
    }

    let body = &data[body_start..total_len];
    Ok(Some((
        RawTextRequest {
            method,
            target,
            version,
            headers,
            body,
        },
        total_len,
    )))
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.split_last() {
        Some((b'\r', rest)) => rest,
        _ => line,
    }
}

pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn try_frame_text_request_returns_none_without_header_terminator() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert!(try_frame_text_request(&buf).unwrap().is_none());
    }

    #[test]
    fn try_frame_text_request_waits_for_full_body() {
        let mut buf = Buffer::new();
        buf.append(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhi");
        assert!(try_frame_text_request(&buf).unwrap().is_none());
    }

    #[test]
    fn try_frame_text_request_parses_method_target_version_and_body() {
        let mut buf = Buffer::new();
        buf.append(b"POST /send HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi");
        let (req, consumed) = try_frame_text_request(&buf).unwrap().unwrap();
        assert_eq!("POST", req.method);
        assert_eq!("/send", req.target);
        assert_eq!("HTTP/1.1", req.version);
        assert_eq!(b"hi", req.body);
        assert_eq!(buf.peek().len(), consumed);
    }
}

//! Per-connection protocol classification and codec ownership (§4.9).
//!
//! Exactly one codec owns the byte stream at any time. Classification reads
//! only the request line and never mutates the buffer's read cursor until a
//! codec is chosen, so a partially buffered classification attempt can be
//! retried once more bytes arrive.

use crate::buffer::Buffer;
use crate::codec::{
    ftp::FtpCodec, http::HttpCodec, rtsp::RtspCodec, rtsp::looks_like_rtsp, sip::SipCodec,
    sip::looks_like_sip, websocket, websocket::WebSocketCodec, Codec, Message,
};
use crate::error::CodecError;

/// Which protocol a connection has been classified as speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    /// HTTP/1.1 request/response.
    Http,
    /// RFC 6455 WebSocket, reached only via an HTTP upgrade.
    WebSocket,
    /// RTSP/1.0.
    Rtsp,
    /// SIP/2.0.
    Sip,
    /// FTP control channel.
    Ftp,
}

/// Result of feeding bytes through the router: any fully framed messages,
/// plus a handshake response to write immediately if this call triggered an
/// HTTP→WebSocket upgrade.
#[derive(Debug, Default)]
pub struct RouterOutput {
    /// Messages framed by whichever codec is currently active, handed to
    /// the application. WebSocket `Ping`/`Close` frames are intercepted
    /// here and never reach this list.
    pub messages: Vec<Message>,
    /// Set when this call observed an upgrade request; the caller must
    /// write these bytes before anything else queued for this connection.
    pub handshake_response: Option<Vec<u8>>,
    /// Bytes the router decided to write on its own (currently: `Pong`
    /// replies to `Ping` frames), in order, after `handshake_response`.
    pub auto_replies: Vec<Vec<u8>>,
    /// Set when a WebSocket `Close` frame was observed; the caller should
    /// close the connection once any queued output drains.
    pub should_close: bool,
}

/// Per-connection state machine selecting exactly one codec.
#[derive(Debug)]
pub struct ProtocolRouter {
    codec: Option<Codec>,
    closed: bool,
}

impl Default for ProtocolRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolRouter {
    /// Creates a router with no codec chosen yet.
    pub fn new() -> Self {
        ProtocolRouter {
            codec: None,
            closed: false,
        }
    }

    /// The classified protocol, if classification has happened yet.
    pub fn protocol(&self) -> Option<ProtocolKind> {
        self.codec.as_ref().map(|c| match c {
            Codec::Http(_) => ProtocolKind::Http,
            Codec::WebSocket(_) => ProtocolKind::WebSocket,
            Codec::Rtsp(_) => ProtocolKind::Rtsp,
            Codec::Sip(_) => ProtocolKind::Sip,
            Codec::Ftp(_) => ProtocolKind::Ftp,
        })
    }

    /// Marks the router closed; further `feed` calls are a no-op.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Feeds newly readable bytes in `buf` through classification (if not
    /// done yet) and then the active codec, handling the HTTP→WebSocket
    /// upgrade transition inline so leftover buffered bytes from the same
    /// call land on the new codec.
    pub fn feed(&mut self, buf: &mut Buffer) -> Result<RouterOutput, CodecError> {
        let mut out = RouterOutput::default();
        if self.closed {
            return Ok(out);
        }

        loop {
            if self.codec.is_none() {
                match classify(buf)? {
                    Some(kind) => self.codec = Some(new_codec(kind)),
                    None => break,
                }
            }

            let batch = self.codec.as_mut().unwrap().feed(buf)?;
            if batch.is_empty() {
                break;
            }

            for message in batch {
                match &message {
                    Message::Http(req) if req.wants_websocket_upgrade() => {
                        let key = req.header("sec-websocket-key").unwrap_or("");
                        out.handshake_response = Some(websocket::build_handshake_response(key));
                        self.codec = Some(Codec::WebSocket(WebSocketCodec::new()));
                        out.messages.push(message);
                    }
                    Message::WebSocket(frame) if frame.opcode == websocket::Opcode::Ping => {
                        out.auto_replies.push(websocket::build_frame(
                            true,
                            websocket::Opcode::Pong,
                            &frame.payload,
                        ));
                    }
                    Message::WebSocket(frame) if frame.opcode == websocket::Opcode::Close => {
                        out.should_close = true;
                    }
                    _ => out.messages.push(message),
                }
            }
        }

        Ok(out)
    }
}

fn new_codec(kind: ProtocolKind) -> Codec {
    match kind {
        ProtocolKind::Http => Codec::Http(HttpCodec::new()),
        ProtocolKind::WebSocket => Codec::WebSocket(WebSocketCodec::new()),
        ProtocolKind::Rtsp => Codec::Rtsp(RtspCodec::new()),
        ProtocolKind::Sip => Codec::Sip(SipCodec::new()),
        ProtocolKind::Ftp => Codec::Ftp(FtpCodec::new()),
    }
}

/// Classifies the connection from its first request line. Returns `Ok(None)`
/// if a full line hasn't arrived yet.
fn classify(buf: &Buffer) -> Result<Option<ProtocolKind>, CodecError> {
    let data = buf.peek();

    if data.starts_with(b"USER ") {
        return Ok(Some(ProtocolKind::Ftp));
    }

    let line_end = match crate::codec::find_subslice(data, b"\r\n") {
        Some(pos) => pos,
        None => return Ok(None),
    };

    let line = std::str::from_utf8(&data[..line_end]).map_err(|_| CodecError::BadRequest("request line"))?;
    let mut parts = line.splitn(3, ' ');
    let method = parts.next().unwrap_or("");
    let _target = parts.next();
    let version = parts.next().unwrap_or("");

    if looks_like_rtsp(method, version) {
        return Ok(Some(ProtocolKind::Rtsp));
    }
    if looks_like_sip(method, version) {
        return Ok(Some(ProtocolKind::Sip));
    }

    Ok(Some(ProtocolKind::Http))
}

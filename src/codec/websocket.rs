//! RFC 6455 WebSocket framing and handshake key derivation (§4.8.2).

use base64::Engine;
use sha1::{Digest, Sha1};

use crate::buffer::Buffer;
use crate::error::CodecError;

/// The fixed GUID RFC 6455 mandates XOR'ing into the handshake key, bit-exact.
const MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Frame opcode, restricted to the values RFC 6455 defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Continuation of a fragmented message.
    Continuation,
    /// UTF-8 text payload.
    Text,
    /// Arbitrary binary payload.
    Binary,
    /// Connection close, optionally carrying a status code and reason.
    Close,
    /// Keepalive ping.
    Ping,
    /// Keepalive pong.
    Pong,
}

impl Opcode {
    fn from_nibble(n: u8) -> Result<Self, CodecError> {
        match n {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            _ => Err(CodecError::BadFrame),
        }
    }

    fn as_nibble(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }
}

/// One parsed or to-be-built WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Whether this is the final fragment of a message.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Whether the frame was masked on the wire (always true for
    /// client→server, always false for server→client).
    pub masked: bool,
    /// Unmasked payload bytes.
    pub payload: Vec<u8>,
}

/// Derives `Sec-WebSocket-Accept` from a client's `Sec-WebSocket-Key`:
/// `Base64(SHA1(key ++ MAGIC_GUID))`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(MAGIC_GUID.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Builds the `101 Switching Protocols` handshake response.
pub fn build_handshake_response(client_key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(client_key)
    )
    .into_bytes()
}

/// Post-handshake frame codec.
#[derive(Debug, Default)]
pub struct WebSocketCodec;

impl WebSocketCodec {
    /// Creates a fresh codec.
    pub fn new() -> Self {
        WebSocketCodec
    }

    /// Frames as many complete frames as `buf` currently holds.
    pub fn feed(&mut self, buf: &mut Buffer) -> Result<Vec<Frame>, CodecError> {
        let mut out = Vec::new();
        loop {
            match parse_frame(buf.peek())? {
                Some((frame, consumed)) => {
                    buf.consume(consumed);
                    out.push(frame);
                }
                None => break,
            }
        }
        Ok(out)
    }
}

/// Parses one frame from `data`. Returns `Ok(None)` if more bytes are
/// needed; never mutates the caller's buffer.
fn parse_frame(data: &[u8]) -> Result<Option<(Frame, usize)>, CodecError> {
    if data.len() < 2 {
        return Ok(None);
    }

    let byte0 = data[0];
    let byte1 = data[1];
    let fin = byte0 & 0x80 != 0;
    let opcode = Opcode::from_nibble(byte0 & 0x0F)?;
    let masked = byte1 & 0x80 != 0;
    let len7 = byte1 & 0x7F;

    let mut pos = 2usize;
    let payload_len: u64 = match len7 {
        126 => {
            if data.len() < pos + 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([data[pos], data[pos + 1]]) as u64;
            pos += 2;
            len
        }
        127 => {
            if data.len() < pos + 8 {
                return Ok(None);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[pos..pos + 8]);
            pos += 8;
            u64::from_be_bytes(bytes)
        }
        n => n as u64,
    };

    let mask = if masked {
        if data.len() < pos + 4 {
            return Ok(None);
        }
        let mut m = [0u8; 4];
        m.copy_from_slice(&data[pos..pos + 4]);
        pos += 4;
        Some(m)
    } else {
        None
    };

    let payload_len = usize::try_from(payload_len).map_err(|_| CodecError::BadFrame)?;
    if data.len() < pos + payload_len {
        return Ok(None);
    }

    let mut payload = data[pos..pos + payload_len].to_vec();
    if let Some(mask) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    Ok(Some((
        Frame {
            fin,
            opcode,
            masked,
            payload,
        },
        pos + payload_len,
    )))
}

/// Builds an unmasked server→client frame, choosing the 7/7+16/7+64 length
/// encoding based on payload size.
pub fn build_frame(fin: bool, opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    let byte0 = (if fin { 0x80 } else { 0x00 }) | opcode.as_nibble();
    out.push(byte0);

    let len = payload.len();
    if len <= 125 {
        out.push(len as u8);
    } else if len <= u16::MAX as usize {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_example() {
        assert_eq!(
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=",
            accept_key("dGhlIHNhbXBsZSBub25jZQ==")
        );
    }

    #[test]
    fn parses_masked_hello_frame_from_rfc6455_example() {
        let bytes = [0x81, 0x85, 37, 0xfa, 0x21, 0x3d, 0x7F, 0x9F, 0x4D, 0x51, 0x58];
        let (frame, consumed) = parse_frame(&bytes).unwrap().unwrap();
        assert_eq!(bytes.len(), consumed);
        assert!(frame.fin);
        assert_eq!(Opcode::Text, frame.opcode);
        assert!(frame.masked);
        assert_eq!(b"Hello", frame.payload.as_slice());
    }

    #[test]
    fn build_then_parse_round_trips_text_payload() {
        let built = build_frame(true, Opcode::Text, b"round trip");
        let (frame, consumed) = parse_frame(&built).unwrap().unwrap();
        assert_eq!(built.len(), consumed);
        assert!(frame.fin);
        assert!(!frame.masked);
        assert_eq!(Opcode::Text, frame.opcode);
        assert_eq!(b"round trip", frame.payload.as_slice());
    }

    #[test]
    fn parse_frame_returns_none_when_header_incomplete() {
        assert!(parse_frame(&[0x81]).unwrap().is_none());
    }

    #[test]
    fn parse_frame_returns_none_when_payload_not_fully_buffered() {
        let bytes = [0x81, 0x05, b'h', b'e'];
        assert!(parse_frame(&bytes).unwrap().is_none());
    }

    #[test]
    fn build_frame_uses_16_bit_length_for_medium_payloads() {
        let payload = vec![0u8; 200];
        let built = build_frame(true, Opcode::Binary, &payload);
        assert_eq!(126, built[1]);
    }
}

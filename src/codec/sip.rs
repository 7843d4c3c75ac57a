//! SIP/2.0 request framing (§4.8.3): same request-line/headers/body shape as
//! RTSP, but responses copy `Via`/`From`/`To`/`Call-ID`/`CSeq` from the
//! request rather than tracking a single sequence number.

use crate::buffer::Buffer;
use crate::error::CodecError;

use super::http::reason_phrase;
use super::try_frame_text_request;

const COPIED_HEADERS: &[&str] = &["via", "from", "to", "call-id", "cseq"];

/// A fully framed SIP request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SipRequest {
    /// Request method, e.g. `INVITE`.
    pub method: String,
    /// Request URI.
    pub uri: String,
    /// Headers in original order, names case-preserved.
    pub headers: Vec<(String, String)>,
    /// Request body, if any.
    pub body: Vec<u8>,
}

impl SipRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

const SIP_METHODS: &[&str] = &["REGISTER", "INVITE", "ACK", "BYE", "CANCEL", "OPTIONS"];

/// Whether `method`/`version` look like a SIP request line, per the
/// router's classification rule.
pub fn looks_like_sip(method: &str, version: &str) -> bool {
    SIP_METHODS.contains(&method) && version == "SIP/2.0"
}

/// SIP framing state.
#[derive(Debug, Default)]
pub struct SipCodec;

impl SipCodec {
    /// Creates a fresh codec.
    pub fn new() -> Self {
        SipCodec
    }

    /// Frames as many complete requests as `buf` currently holds.
    pub fn feed(&mut self, buf: &mut Buffer) -> Result<Vec<SipRequest>, CodecError> {
        let mut out = Vec::new();
        loop {
            let framed = try_frame_text_request(buf)?;
            let (raw, consumed) = match framed {
                Some(v) => v,
                None => break,
            };

            let headers: Vec<(String, String)> = raw
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();

            out.push(SipRequest {
                method: raw.method.to_string(),
                uri: raw.target.to_string(),
                headers,
                body: raw.body.to_vec(),
            });
            buf.consume(consumed);
        }
        Ok(out)
    }
}

/// Builds a SIP response, copying `Via`/`From`/`To`/`Call-ID`/`CSeq` from
/// `request` when present.
pub fn build_response(status: u16, request: &SipRequest, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 256);
    out.extend_from_slice(format!("SIP/2.0 {} {}\r\n", status, reason_phrase(status)).as_bytes());

    for name in COPIED_HEADERS {
        if let Some(value) = request.header(name) {
            out.extend_from_slice(format!("{}: {}\r\n", title_case(name), value).as_bytes());
        }
    }

    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

fn title_case(name: &str) -> String {
    match name {
        "call-id" => "Call-ID".to_string(),
        _ => name
            .split('-')
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(c) => c.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join("-"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn feeds_register_request() {
        let mut buf = Buffer::new();
        buf.append(b"REGISTER sip:example.com SIP/2.0\r\nVia: SIP/2.0/UDP x\r\nFrom: <sip:a>\r\nTo: <sip:a>\r\nCall-ID: abc\r\nCSeq: 1 REGISTER\r\n\r\n");
        let mut codec = SipCodec::new();
        let reqs = codec.feed(&mut buf).unwrap();
        assert_eq!(1, reqs.len());
        assert_eq!("REGISTER", reqs[0].method);
        assert_eq!(Some("abc"), reqs[0].header("call-id"));
    }

    #[test]
    fn build_response_copies_dialog_headers() {
        let req = SipRequest {
            method: "REGISTER".into(),
            uri: "sip:example.com".into(),
            headers: vec![
                ("Via".into(), "SIP/2.0/UDP x".into()),
                ("Call-ID".into(), "abc".into()),
            ],
            body: Vec::new(),
        };
        let bytes = build_response(200, &req, b"");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Via: SIP/2.0/UDP x\r\n"));
        assert!(text.contains("Call-ID: abc\r\n"));
    }

    #[test]
    fn looks_like_sip_requires_known_method_and_version() {
        assert!(looks_like_sip("INVITE", "SIP/2.0"));
        assert!(!looks_like_sip("INVITE", "RTSP/1.0"));
    }
}

//! RTSP/1.0 request framing (§4.8.3): same shape as HTTP, plus a tracked
//! `CSeq` integer header that responses must echo back.

use crate::buffer::Buffer;
use crate::error::CodecError;

use super::http::reason_phrase;
use super::try_frame_text_request;

/// A fully framed RTSP request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtspRequest {
    /// Request method, e.g. `DESCRIBE`.
    pub method: String,
    /// Request URI.
    pub url: String,
    /// Headers in original order, names case-preserved.
    pub headers: Vec<(String, String)>,
    /// Parsed `CSeq` header, if present and numeric.
    pub cseq: Option<u64>,
    /// Request body, if any.
    pub body: Vec<u8>,
}

const RTSP_METHODS: &[&str] = &["OPTIONS", "DESCRIBE", "SETUP", "PLAY", "PAUSE", "TEARDOWN"];

/// Whether `method`/`version` look like an RTSP request line, per the
/// router's classification rule.
pub fn looks_like_rtsp(method: &str, version: &str) -> bool {
    RTSP_METHODS.contains(&method) && version == "RTSP/1.0"
}

/// RTSP framing state.
#[derive(Debug, Default)]
pub struct RtspCodec;

impl RtspCodec {
    /// Creates a fresh codec.
    pub fn new() -> Self {
        RtspCodec
    }

    /// Frames as many complete requests as `buf` currently holds.
    pub fn feed(&mut self, buf: &mut Buffer) -> Result<Vec<RtspRequest>, CodecError> {
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
            let cseq = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("cseq"))
                .and_then(|(_, v)| v.parse().ok());

            out.push(RtspRequest {
                method: raw.method.to_string(),
                url: raw.target.to_string(),
                headers,
                cseq,
                body: raw.body.to_vec(),
            });
            buf.consume(consumed);
        }
        Ok(out)
    }
}

/// Builds an RTSP/1.0 response, echoing `cseq` when known and writing any
/// `extra_headers` (e.g. `Public`, `Content-Type`) before `Content-Length`.
pub fn build_response(status: u16, cseq: Option<u64>, extra_headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 128);
    out.extend_from_slice(format!("RTSP/1.0 {} {}\r\n", status, reason_phrase(status)).as_bytes());
    if let Some(cseq) = cseq {
        out.extend_from_slice(format!("CSeq: {}\r\n", cseq).as_bytes());
    }
    for (name, value) in extra_headers {
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn feeds_options_request_and_tracks_cseq() {
        let mut buf = Buffer::new();
        buf.append(b"OPTIONS rtsp://x/y RTSP/1.0\r\nCSeq: 7\r\n\r\n");
        let mut codec = RtspCodec::new();
        let reqs = codec.feed(&mut buf).unwrap();
        assert_eq!(1, reqs.len());
        assert_eq!("OPTIONS", reqs[0].method);
        assert_eq!(Some(7), reqs[0].cseq);
    }

    #[test]
    fn build_response_echoes_cseq() {
        let bytes = build_response(200, Some(7), &[], b"");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(text.contains("CSeq: 7\r\n"));
    }

    #[test]
    fn build_response_writes_extra_headers_before_content_length() {
        let bytes = build_response(200, Some(1), &[("Public", "OPTIONS, DESCRIBE")], b"");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Public: OPTIONS, DESCRIBE\r\n"));
    }

    #[test]
    fn looks_like_rtsp_requires_known_method_and_version() {
        assert!(looks_like_rtsp("DESCRIBE", "RTSP/1.0"));
        assert!(!looks_like_rtsp("DESCRIBE", "HTTP/1.1"));
        assert!(!looks_like_rtsp("GET", "RTSP/1.0"));
    }
}

//! FTP control-channel line framing (§4.8.4). The codec only frames CRLF
//! lines into a verb and the rest of the line; command semantics belong to
//! the `ftp_service` handler collaborator.

use crate::buffer::Buffer;
use crate::error::CodecError;

use super::find_subslice;

/// One CRLF-terminated control line, split into its leading verb (uppercased
/// per FTP convention) and the remainder of the line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FtpLine {
    /// First whitespace-delimited token, uppercased.
    pub verb: String,
    /// Everything after the verb, trimmed, empty if there was no argument.
    pub args: String,
}

/// FTP control-channel line framing state.
#[derive(Debug, Default)]
pub struct FtpCodec;

impl FtpCodec {
    /// Creates a fresh codec.
    pub fn new() -> Self {
        FtpCodec
    }

    /// Frames as many complete lines as `buf` currently holds.
    pub fn feed(&mut self, buf: &mut Buffer) -> Result<Vec<FtpLine>, CodecError> {
        let mut out = Vec::new();
        loop {
            let data = buf.peek();
            let pos = match find_subslice(data, b"\r\n") {
                Some(p) => p,
                None => break,
            };

            let line = std::str::from_utf8(&data[..pos]).map_err(|_| CodecError::BadRequest("ftp"))?;
            let mut parts = line.splitn(2, ' ');
            let verb = parts.next().unwrap_or("").to_ascii_uppercase();
            let args = parts.next().unwrap_or("").trim().to_string();
            let consumed = pos + 2;

            out.push(FtpLine { verb, args });
            buf.consume(consumed);
        }
        Ok(out)
    }
}

/// Builds one CRLF-terminated response line: `<code> <text>\r\n`.
pub fn build_line(code: u16, text: &str) -> Vec<u8> {
    format!("{} {}\r\n", code, text).into_bytes()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn feeds_user_command_with_argument() {
        let mut buf = Buffer::new();
        buf.append(b"USER anonymous\r\n");
        let mut codec = FtpCodec::new();
        let lines = codec.feed(&mut buf).unwrap();
        assert_eq!(1, lines.len());
        assert_eq!("USER", lines[0].verb);
        assert_eq!("anonymous", lines[0].args);
    }

    #[test]
    fn feeds_bare_command_with_no_argument() {
        let mut buf = Buffer::new();
        buf.append(b"QUIT\r\n");
        let mut codec = FtpCodec::new();
        let lines = codec.feed(&mut buf).unwrap();
        assert_eq!("QUIT", lines[0].verb);
        assert_eq!("", lines[0].args);
    }

    #[test]
    fn waits_for_full_line() {
        let mut buf = Buffer::new();
        buf.append(b"USER ano");
        let mut codec = FtpCodec::new();
        assert!(codec.feed(&mut buf).unwrap().is_empty());
        assert_eq!(8, buf.readable());
    }

    #[test]
    fn build_line_formats_code_and_text() {
        let bytes = build_line(331, "User name okay, need password.");
        assert_eq!(b"331 User name okay, need password.\r\n", bytes.as_slice());
    }
}

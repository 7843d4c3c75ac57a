//! Typed error hierarchy, one enum per layer that can fail in a
//! caller-distinguishable way.

use thiserror::Error;

/// Errors a protocol codec can return while parsing a byte stream.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CodecError {
    /// The request line, a header, or a frame header violated the wire
    /// format and cannot be recovered from.
    #[error("malformed {0} request")]
    BadRequest(&'static str),
    /// A WebSocket frame's header was internally inconsistent (e.g. a
    /// control frame marked as fragmented).
    #[error("malformed websocket frame")]
    BadFrame,
    /// Buffered input exceeded the oversized-request ceiling before framing
    /// completed.
    #[error("request exceeds maximum size")]
    TooLarge,
}

/// Errors surfaced by the connection layer.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The underlying transport failed for a reason other than "would
    /// block".
    #[error("i/o error on connection: {0}")]
    Io(#[from] std::io::Error),
    /// A codec-level parse error occurred and the connection was closed.
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),
}

/// Application-facing error codes, mirrored from the reference
/// implementation's `ErrorCode` enum so HTTP error bodies stay wire-compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[repr(u16)]
pub enum ErrorCode {
    /// No error.
    Success = 0,
    /// Request could not be parsed or was missing required fields.
    InvalidRequest = 1001,
    /// Username failed the validation rules.
    InvalidUsername = 1002,
    /// Message content failed the validation rules.
    InvalidMessage = 1003,
    /// Caller exceeded the configured rate limit.
    RateLimited = 1004,
    /// Username is already bound to a live session.
    UsernameTaken = 1005,
    /// Request body exceeded the size ceiling.
    PayloadTooLarge = 1006,
    /// Worker pool could not accept more work.
    ServerBusy = 1007,
    /// Unexpected internal failure.
    InternalError = 5000,
    /// Fallback for error conditions with no dedicated code.
    UnknownError = 9999,
}

/// An application error paired with the HTTP status and message it renders
/// as when delivered through the HTTP façade.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct AppError {
    /// Machine-readable error code returned in the JSON envelope.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// HTTP status line code to send.
    pub http_status: u16,
}

impl AppError {
    /// Builds an `AppError` from a code using the reference implementation's
    /// fixed code→(message, status) table.
    pub fn from_code(code: ErrorCode) -> Self {
        let (message, http_status) = match code {
            ErrorCode::Success => ("Success", 200),
            ErrorCode::InvalidRequest => ("Invalid request format", 400),
            ErrorCode::InvalidUsername => {
                ("Invalid username (1-32 chars, alphanumeric and underscore only)", 400)
            }
            ErrorCode::InvalidMessage => {
                ("Invalid message content (1-1024 chars, no control chars)", 400)
            }
            ErrorCode::RateLimited => ("Too Many Requests", 429),
            ErrorCode::UsernameTaken => ("Username already taken", 409),
            ErrorCode::PayloadTooLarge => ("Request entity too large", 413),
            ErrorCode::ServerBusy => ("Server Busy, try again later", 503),
            ErrorCode::InternalError => ("Internal Server Error", 500),
            ErrorCode::UnknownError => ("Unknown Error", 500),
        };

        AppError {
            code,
            message: message.to_string(),
            http_status,
        }
    }

    /// Same as [`AppError::from_code`] but with a caller-supplied message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        let base = Self::from_code(code);
        AppError {
            code,
            message: message.into(),
            http_status: base.http_status,
        }
    }

    /// Renders the `{success:false, error_code, error}` JSON envelope used
    /// by every HTTP error response.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error_code": self.code as u16,
            "error": self.message,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn username_taken_maps_to_409() {
        let err = AppError::from_code(ErrorCode::UsernameTaken);
        assert_eq!(409, err.http_status);
        assert_eq!(ErrorCode::UsernameTaken, err.code);
    }

    #[test]
    fn to_json_marks_success_false() {
        let err = AppError::from_code(ErrorCode::RateLimited);
        let json = err.to_json();
        assert_eq!(Some(false), json["success"].as_bool());
        assert_eq!(Some(1004), json["error_code"].as_i64());
    }
}

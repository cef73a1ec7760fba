//! Protocol error types.

use thiserror::Error;

/// Errors raised while parsing or formatting wire frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown protocol verb: {0:?}")]
    UnknownVerb(String),

    #[error("malformed control line: {0}")]
    BadControlLine(String),

    #[error("control line too long: {len} bytes (max {max})")]
    ControlLineTooLong { len: usize, max: usize },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed header block: {0}")]
    BadHeaderBlock(String),

    #[error("payload not terminated by CRLF")]
    BadPayloadTerminator,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid UTF-8 in frame")]
    InvalidUtf8,
}

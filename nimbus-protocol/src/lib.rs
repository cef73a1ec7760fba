//! # nimbus-protocol
//!
//! Wire protocol implementation for nimbus (text verbs over TCP).
//!
//! This crate provides:
//! - A streaming parser for inbound server frames that tolerates arbitrary
//!   read boundaries
//! - An encoder that formats outbound client frames into a buffered writer
//! - Header block parsing/encoding with status-line support
//! - Typed `INFO`/`CONNECT` records and protocol constants

pub mod error;
pub mod headers;
pub mod parser;
pub mod types;
pub mod writer;

pub use error::ProtocolError;
pub use headers::{HeaderMap, StatusCode};
pub use parser::{FrameDecoder, ServerFrame};
pub use types::{ConnectInfo, Message, ServerInfo};
pub use writer::{encode, ClientFrame};

/// Protocol level advertised in `CONNECT`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default broker port.
pub const DEFAULT_PORT: u16 = 4222;

/// Maximum payload the client assumes before the first `INFO` arrives.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Maximum accepted control line length (guards against garbage input).
pub const MAX_CONTROL_LINE: usize = 4096;

/// Hard cap on a single frame's declared payload length.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Returns whether `subject` is valid for publishing (no wildcard tokens).
pub fn is_valid_publish_subject(subject: &str) -> bool {
    !subject.is_empty()
        && subject.split('.').all(|token| {
            !token.is_empty()
                && token != "*"
                && token != ">"
                && token.bytes().all(|b| b.is_ascii_graphic())
        })
}

/// Returns whether `subject` is a valid subscription pattern (wildcards
/// allowed; `>` only as the final token).
pub fn is_valid_subscribe_subject(subject: &str) -> bool {
    if subject.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = subject.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() || !token.bytes().all(|b| b.is_ascii_graphic()) {
            return false;
        }
        if *token == ">" && i != tokens.len() - 1 {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_subject_validation() {
        assert!(is_valid_publish_subject("foo"));
        assert!(is_valid_publish_subject("foo.bar.baz"));
        assert!(!is_valid_publish_subject(""));
        assert!(!is_valid_publish_subject("foo..bar"));
        assert!(!is_valid_publish_subject("foo.*"));
        assert!(!is_valid_publish_subject("foo.>"));
        assert!(!is_valid_publish_subject("foo bar"));
    }

    #[test]
    fn test_subscribe_subject_validation() {
        assert!(is_valid_subscribe_subject("foo.*.baz"));
        assert!(is_valid_subscribe_subject("foo.>"));
        assert!(!is_valid_subscribe_subject("foo.>.bar"));
        assert!(!is_valid_subscribe_subject(".foo"));
        assert!(!is_valid_subscribe_subject(""));
    }
}

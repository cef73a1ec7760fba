//! Message headers and status codes.
//!
//! A header block starts with the fixed version line `NATS/1.0`, optionally
//! followed by a three-digit status code and a free-text description. The
//! remaining lines are `Key: Value` pairs terminated by a blank line. Keys
//! may repeat; insertion order is preserved.

use crate::error::ProtocolError;
use bytes::{BufMut, BytesMut};
use std::fmt;

/// Fixed first line of every header block.
pub const HEADER_VERSION: &str = "NATS/1.0";

/// Three-digit status carried on control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    /// Idle heartbeat emitted by the broker while a pull is quiet.
    pub const IDLE_HEARTBEAT: StatusCode = StatusCode(100);
    /// No messages available for a `no_wait` pull.
    pub const NO_MESSAGES: StatusCode = StatusCode(404);
    /// A pull request expired on the broker.
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    /// Pull rejected (consumer deleted, limits exceeded, ...).
    pub const CONFLICT: StatusCode = StatusCode(409);
    /// Request had no responders.
    pub const NO_RESPONDERS: StatusCode = StatusCode(503);

    /// Returns whether the code signals an error condition (4xx/5xx).
    pub fn is_error(&self) -> bool {
        self.0 >= 400
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered multimap of message headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all values for `key` with a single value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.entries.retain(|(k, _)| *k != key);
        self.entries.push((key, value.into()));
    }

    /// Appends an additional value for `key`, keeping existing ones.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Returns the first value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns all values for `key` in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Size of the encoded block, including the version line and terminator.
    pub fn encoded_len(&self) -> usize {
        let mut len = HEADER_VERSION.len() + 2;
        for (k, v) in &self.entries {
            len += k.len() + 2 + v.len() + 2;
        }
        len + 2
    }

    /// Writes the encoded block (version line, pairs, blank line) into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(HEADER_VERSION.as_bytes());
        buf.put_slice(b"\r\n");
        for (k, v) in &self.entries {
            buf.put_slice(k.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(v.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
    }
}

/// A parsed header block: optional status line plus the header pairs.
#[derive(Debug, Clone, Default)]
pub struct HeaderBlock {
    pub status: Option<StatusCode>,
    pub description: Option<String>,
    pub headers: HeaderMap,
}

impl HeaderBlock {
    /// Parses a complete header block (`NATS/1.0...` through the blank line).
    pub fn parse(block: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(block).map_err(|_| ProtocolError::InvalidUtf8)?;
        let mut lines = text.split("\r\n");

        let version_line = lines
            .next()
            .ok_or_else(|| ProtocolError::BadHeaderBlock("empty block".into()))?;
        if !version_line.starts_with(HEADER_VERSION) {
            return Err(ProtocolError::BadHeaderBlock(format!(
                "bad version line: {version_line:?}"
            )));
        }

        let mut parsed = Self::default();
        let rest = version_line[HEADER_VERSION.len()..].trim_start();
        if !rest.is_empty() {
            let (code, description) = match rest.split_once(' ') {
                Some((code, description)) => (code, Some(description.trim().to_string())),
                None => (rest, None),
            };
            let code: u16 = code.parse().map_err(|_| {
                ProtocolError::BadHeaderBlock(format!("bad status code: {code:?}"))
            })?;
            parsed.status = Some(StatusCode(code));
            parsed.description = description;
        }

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| {
                ProtocolError::BadHeaderBlock(format!("bad header line: {line:?}"))
            })?;
            parsed
                .headers
                .append(key.trim().to_string(), value.trim().to_string());
        }

        Ok(parsed)
    }
}

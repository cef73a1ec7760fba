//! Client error types.

use nimbus_protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced by connection-level operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation canceled")]
    Canceled,

    #[error("invalid usage: {0}")]
    Usage(String),

    #[error("payload of {size} bytes exceeds server limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("no responders for request subject")]
    NoResponders,

    #[error("connection closed")]
    ConnectionClosed,
}

impl ClientError {
    /// Returns whether retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_)
                | ClientError::Timeout
                | ClientError::Canceled
                | ClientError::NoResponders
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::Canceled.is_retryable());
        assert!(ClientError::NoResponders.is_retryable());
        assert!(!ClientError::Auth("nope".into()).is_retryable());
        assert!(!ClientError::Usage("bad".into()).is_retryable());
        assert!(!ClientError::PayloadTooLarge { size: 2, max: 1 }.is_retryable());
    }
}

//! Typed wire records: messages and the handshake JSON bodies.

use crate::headers::{HeaderMap, StatusCode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A message delivered to a subscription sink.
///
/// Immutable on the receive path. `status`/`description` are populated for
/// control messages (heartbeats, pull statuses) carried as a header block
/// with no payload.
#[derive(Debug, Clone)]
pub struct Message {
    /// Subject the message was published to.
    pub subject: String,
    /// Reply subject for request/reply correlation.
    pub reply: Option<String>,
    /// Ordered message headers, if the frame carried a header block.
    pub headers: Option<HeaderMap>,
    /// Status code from the header block, if any.
    pub status: Option<StatusCode>,
    /// Status description from the header block, if any.
    pub description: Option<String>,
    /// Message payload.
    pub payload: Bytes,
    /// On-wire size of the frame (subject, reply, headers and payload).
    pub length: usize,
}

impl Message {
    /// Returns whether this is a payload-less status control message.
    pub fn is_status(&self) -> bool {
        self.status.is_some() && self.payload.is_empty()
    }
}

/// Server `INFO` body, received at connect time and on topology changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Unique server identifier.
    #[serde(default)]
    pub server_id: String,
    /// Server version string.
    #[serde(default)]
    pub version: String,
    /// Protocol level spoken by the server.
    #[serde(default)]
    pub proto: i32,
    /// Connection id assigned by the server.
    #[serde(default)]
    pub client_id: u64,
    /// Largest payload the server accepts on a publish.
    #[serde(default)]
    pub max_payload: usize,
    /// Server demands authentication.
    #[serde(default)]
    pub auth_required: bool,
    /// Server demands TLS before `CONNECT`.
    #[serde(default)]
    pub tls_required: bool,
    /// Server supports a TLS upgrade.
    #[serde(default)]
    pub tls_available: bool,
    /// Other cluster members the client may connect to.
    #[serde(default)]
    pub connect_urls: Vec<String>,
    /// Server understands header frames.
    #[serde(default)]
    pub headers: bool,
}

/// Client `CONNECT` body, sent once per established transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectInfo {
    /// Ask the server to echo `+OK` for every command.
    pub verbose: bool,
    /// Ask the server for strict subject checking.
    pub pedantic: bool,
    /// Client is about to (or did) upgrade the transport to TLS.
    pub tls_required: bool,
    /// Optional client name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Implementation language, always "rust".
    pub lang: String,
    /// Client library version.
    pub version: String,
    /// Protocol level supported by the client.
    pub protocol: u8,
    /// Client understands header frames.
    pub headers: bool,
    /// Client wants `503` statuses for requests nobody answers.
    pub no_responders: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,
}

impl Default for ConnectInfo {
    fn default() -> Self {
        Self {
            verbose: false,
            pedantic: false,
            tls_required: false,
            name: None,
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: crate::PROTOCOL_VERSION,
            headers: true,
            no_responders: true,
            auth_token: None,
            user: None,
            pass: None,
            jwt: None,
            sig: None,
            nkey: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_info_decode_ignores_unknown_fields() {
        let json = r#"{"server_id":"S1","version":"2.10.0","proto":1,"client_id":7,
            "max_payload":1048576,"tls_required":false,"headers":true,
            "connect_urls":["10.0.0.2:4222"],"cluster":"c1","gateway":"g"}"#;
        let info: ServerInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.server_id, "S1");
        assert_eq!(info.max_payload, 1048576);
        assert_eq!(info.connect_urls, vec!["10.0.0.2:4222"]);
        assert!(info.headers);
    }

    #[test]
    fn test_connect_info_skips_unset_auth() {
        let connect = ConnectInfo::default();
        let json = serde_json::to_string(&connect).unwrap();
        assert!(!json.contains("auth_token"));
        assert!(!json.contains("user"));
        assert!(json.contains(r#""no_responders":true"#));
        assert!(json.contains(r#""lang":"rust""#));
    }

    #[test]
    fn test_status_message_detection() {
        let msg = Message {
            subject: "x".into(),
            reply: None,
            headers: Some(HeaderMap::new()),
            status: Some(StatusCode::IDLE_HEARTBEAT),
            description: Some("Idle Heartbeat".into()),
            payload: Bytes::new(),
            length: 1,
        };
        assert!(msg.is_status());
    }
}

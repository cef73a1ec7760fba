//! Observable connection lifecycle events.

use std::fmt;

/// Events published on the client's broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// First successful handshake completed.
    Connected,
    /// The transport was lost.
    Disconnected,
    /// A reconnect attempt is about to start.
    Reconnecting,
    /// A handshake after a disconnect completed; subscriptions were replayed.
    Reconnected,
    /// The connection was disposed and will not come back.
    Closed,
    /// A subscription sink was dropped without an explicit unsubscribe.
    SubscriptionDropped(u64),
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::Connected => write!(f, "connected"),
            ClientEvent::Disconnected => write!(f, "disconnected"),
            ClientEvent::Reconnecting => write!(f, "reconnecting"),
            ClientEvent::Reconnected => write!(f, "reconnected"),
            ClientEvent::Closed => write!(f, "closed"),
            ClientEvent::SubscriptionDropped(sid) => write!(f, "subscription {sid} dropped"),
        }
    }
}

/// Connection supervisor states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    Closed = 0,
    Connecting = 1,
    Handshaking = 2,
    Open = 3,
    Reconnecting = 4,
}

impl From<u8> for ConnectionStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Handshaking,
            3 => ConnectionStatus::Open,
            4 => ConnectionStatus::Reconnecting,
            _ => ConnectionStatus::Closed,
        }
    }
}

//! Subscription registry.
//!
//! Maps server-assigned subscription ids to client-side sinks. The registry
//! survives reconnects: on each new transport the supervisor replays a `SUB`
//! for every live entry before any queued command is written. Abandoned
//! sinks are observed through closed delivery channels, either lazily at
//! delivery time or by the periodic sweep.

use nimbus_protocol::Message;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Where messages for a subscription go.
#[derive(Debug)]
pub(crate) enum SubscriptionSink {
    /// A user subscription backed by a bounded channel.
    Channel(mpsc::Sender<Message>),
    /// The connection-wide inbox wildcard; routed by the multiplexer.
    Inbox,
}

#[derive(Debug)]
pub(crate) struct SubscriptionEntry {
    pub(crate) subject: String,
    pub(crate) queue_group: Option<String>,
    /// Auto-unsubscribe after this many deliveries in total.
    pub(crate) max_msgs: Option<u64>,
    pub(crate) delivered: u64,
    pub(crate) sink: SubscriptionSink,
}

impl SubscriptionEntry {
    /// Deliveries still expected before an auto-unsubscribe limit is hit.
    fn remaining(&self) -> Option<u64> {
        self.max_msgs.map(|max| max.saturating_sub(self.delivered))
    }
}

/// Outcome of routing one inbound message.
#[derive(Debug)]
pub(crate) enum Delivery {
    /// Message handed to a live sink (or dropped by a full one).
    Delivered,
    /// The sid belongs to the inbox wildcard; caller routes via multiplexer.
    Inbox(Message),
    /// The sink was gone; entry removed, caller should issue a lazy `UNSUB`.
    Dead,
    /// No entry for this sid.
    Unknown,
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_sid: u64,
    entries: HashMap<u64, SubscriptionEntry>,
    inbox_sid: Option<u64>,
}

/// Shared sid-to-sink map. All critical sections are constant-time.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a channel-backed subscription under a fresh sid.
    ///
    /// Sids are strictly increasing for the lifetime of the connection.
    pub(crate) fn register(
        &self,
        subject: String,
        queue_group: Option<String>,
        capacity: usize,
    ) -> (u64, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        let mut inner = self.inner.lock().unwrap();
        inner.next_sid += 1;
        let sid = inner.next_sid;
        inner.entries.insert(
            sid,
            SubscriptionEntry {
                subject,
                queue_group,
                max_msgs: None,
                delivered: 0,
                sink: SubscriptionSink::Channel(tx),
            },
        );
        (sid, rx)
    }

    /// Registers the inbox wildcard subscription on first use.
    ///
    /// Returns `Some(sid)` exactly once; later calls return `None`.
    pub(crate) fn register_inbox(&self, wildcard_subject: String) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap();
        if inner.inbox_sid.is_some() {
            return None;
        }
        inner.next_sid += 1;
        let sid = inner.next_sid;
        inner.entries.insert(
            sid,
            SubscriptionEntry {
                subject: wildcard_subject,
                queue_group: None,
                max_msgs: None,
                delivered: 0,
                sink: SubscriptionSink::Inbox,
            },
        );
        inner.inbox_sid = Some(sid);
        Some(sid)
    }

    /// Removes an entry. Safe to call for a sid that was never registered or
    /// was already removed (e.g. a subscribe canceled before its barrier).
    pub(crate) fn remove(&self, sid: u64) -> bool {
        self.inner.lock().unwrap().entries.remove(&sid).is_some()
    }

    /// Records an auto-unsubscribe limit (total deliveries).
    pub(crate) fn set_max_msgs(&self, sid: u64, max: u64) {
        if let Some(entry) = self.inner.lock().unwrap().entries.get_mut(&sid) {
            entry.max_msgs = Some(max);
        }
    }

    /// Routes one message to the sink registered for `sid`.
    pub(crate) fn deliver(&self, sid: u64, message: Message) -> Delivery {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.entries.get_mut(&sid) else {
            return Delivery::Unknown;
        };
        match &entry.sink {
            SubscriptionSink::Inbox => Delivery::Inbox(message),
            SubscriptionSink::Channel(tx) => match tx.try_send(message) {
                Ok(()) => {
                    entry.delivered += 1;
                    if entry.remaining() == Some(0) {
                        // Limit reached; the broker stops on its own side.
                        inner.entries.remove(&sid);
                    }
                    Delivery::Delivered
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(sid, "slow subscription sink, dropping message");
                    entry.delivered += 1;
                    Delivery::Delivered
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    inner.entries.remove(&sid);
                    Delivery::Dead
                }
            },
        }
    }

    /// Removes entries whose sink receiver was dropped without an explicit
    /// unsubscribe, returning their sids so the caller can `UNSUB` them.
    pub(crate) fn sweep(&self) -> Vec<u64> {
        let mut inner = self.inner.lock().unwrap();
        let dead: Vec<u64> = inner
            .entries
            .iter()
            .filter(|(_, entry)| match &entry.sink {
                SubscriptionSink::Channel(tx) => tx.is_closed(),
                SubscriptionSink::Inbox => false,
            })
            .map(|(sid, _)| *sid)
            .collect();
        for sid in &dead {
            inner.entries.remove(sid);
        }
        dead
    }

    /// Emits `SUB` (and `UNSUB <sid> <remaining>` where a limit is set) for
    /// every live entry, for replay on a fresh transport. Holds the registry
    /// lock for the duration, which also excludes a concurrent sweep.
    pub(crate) fn replay(&self, writer: &mut crate::writer::FrameWriter) -> Result<(), crate::error::ClientError> {
        let inner = self.inner.lock().unwrap();
        for (sid, entry) in &inner.entries {
            if let SubscriptionSink::Channel(tx) = &entry.sink {
                if tx.is_closed() {
                    continue;
                }
            }
            writer.push(&nimbus_protocol::ClientFrame::Subscribe {
                sid: *sid,
                subject: entry.subject.clone(),
                queue_group: entry.queue_group.clone(),
            })?;
            if let Some(remaining) = entry.remaining() {
                writer.push(&nimbus_protocol::ClientFrame::Unsubscribe {
                    sid: *sid,
                    max_msgs: Some(remaining),
                })?;
            }
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn message(subject: &str) -> Message {
        Message {
            subject: subject.to_string(),
            reply: None,
            headers: None,
            status: None,
            description: None,
            payload: Bytes::from_static(b"x"),
            length: subject.len() + 1,
        }
    }

    #[test]
    fn test_sids_strictly_increasing() {
        let registry = SubscriptionRegistry::new();
        let (a, _rx_a) = registry.register("a".into(), None, 4);
        let (b, _rx_b) = registry.register("b".into(), None, 4);
        registry.remove(a);
        let (c, _rx_c) = registry.register("c".into(), None, 4);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let (sid, _rx) = registry.register("a".into(), None, 4);
        assert!(registry.remove(sid));
        assert!(!registry.remove(sid));
        assert!(!registry.remove(9999));
    }

    #[test]
    fn test_deliver_and_max_msgs() {
        let registry = SubscriptionRegistry::new();
        let (sid, mut rx) = registry.register("a".into(), None, 4);
        registry.set_max_msgs(sid, 2);

        assert!(matches!(registry.deliver(sid, message("a")), Delivery::Delivered));
        assert!(matches!(registry.deliver(sid, message("a")), Delivery::Delivered));
        // Limit reached; entry gone.
        assert!(matches!(registry.deliver(sid, message("a")), Delivery::Unknown));
        assert_eq!(registry.len(), 0);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dead_sink_detected_at_delivery() {
        let registry = SubscriptionRegistry::new();
        let (sid, rx) = registry.register("a".into(), None, 4);
        drop(rx);
        assert!(matches!(registry.deliver(sid, message("a")), Delivery::Dead));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_sweep_reaps_dropped_sinks() {
        let registry = SubscriptionRegistry::new();
        let (dead, rx_dead) = registry.register("a".into(), None, 4);
        let (_live, _rx_live) = registry.register("b".into(), None, 4);
        drop(rx_dead);

        let swept = registry.sweep();
        assert_eq!(swept, vec![dead]);
        assert_eq!(registry.len(), 1);
        assert!(registry.sweep().is_empty());
    }

    #[test]
    fn test_inbox_registered_once() {
        let registry = SubscriptionRegistry::new();
        let first = registry.register_inbox("_INBOX.x.*".into());
        assert!(first.is_some());
        assert!(registry.register_inbox("_INBOX.x.*".into()).is_none());

        let sid = first.unwrap();
        assert!(matches!(registry.deliver(sid, message("_INBOX.x.t")), Delivery::Inbox(_)));
    }

    #[test]
    fn test_replay_emits_sub_and_remaining() {
        let registry = SubscriptionRegistry::new();
        let (sid, _rx) = registry.register("orders.*".into(), Some("grp".into()), 4);
        registry.set_max_msgs(sid, 5);
        assert!(matches!(registry.deliver(sid, message("orders.1")), Delivery::Delivered));

        let mut writer = crate::writer::FrameWriter::new(1);
        registry.replay(&mut writer).unwrap();
        assert!(!writer.is_empty());
        // One delivery consumed, four remaining.
        let encoded = format!("SUB orders.* grp {sid}\r\nUNSUB {sid} 4\r\n");
        assert_eq!(writer.pending_bytes(), encoded.as_bytes());
    }
}

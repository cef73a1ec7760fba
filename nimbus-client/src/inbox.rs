//! Inbox multiplexer.
//!
//! One real subscription on `<prefix>*` serves every reply subject the
//! connection ever uses. Individual waiters attach to an in-memory router
//! keyed by the final subject token, so routing is a single map lookup and
//! no per-request subscription traffic hits the wire.

use nimbus_protocol::Message;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// A registered reply destination.
#[derive(Debug)]
enum InboxSink {
    /// Single reply; removed on first delivery.
    Once(oneshot::Sender<Message>),
    /// Long-lived stream of deliveries (pull consumers).
    Stream(mpsc::Sender<Message>),
}

/// Token-keyed router behind the connection's single inbox subscription.
#[derive(Debug)]
pub(crate) struct InboxMultiplexer {
    prefix: String,
    sinks: Mutex<HashMap<String, InboxSink>>,
}

impl InboxMultiplexer {
    pub(crate) fn new(user_prefix: &str) -> Self {
        let prefix = format!("{}.{}.", user_prefix, uuid::Uuid::new_v4().simple());
        Self {
            prefix,
            sinks: Mutex::new(HashMap::new()),
        }
    }

    /// The connection-wide inbox prefix, ending with `.`.
    pub(crate) fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The pattern for the single real subscription.
    pub(crate) fn wildcard(&self) -> String {
        format!("{}*", self.prefix)
    }

    /// Allocates a fresh per-request token.
    pub(crate) fn new_token(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    pub(crate) fn subject_for(&self, token: &str) -> String {
        format!("{}{}", self.prefix, token)
    }

    pub(crate) fn register_once(&self, token: String, tx: oneshot::Sender<Message>) {
        self.sinks.lock().unwrap().insert(token, InboxSink::Once(tx));
    }

    pub(crate) fn register_stream(&self, token: String, tx: mpsc::Sender<Message>) {
        self.sinks
            .lock()
            .unwrap()
            .insert(token, InboxSink::Stream(tx));
    }

    /// Best-effort idempotent removal.
    pub(crate) fn deregister(&self, token: &str) {
        self.sinks.lock().unwrap().remove(token);
    }

    /// Routes a delivery by its final subject token.
    pub(crate) fn route(&self, message: Message) {
        let Some(token) = message.subject.strip_prefix(&self.prefix) else {
            tracing::debug!(subject = %message.subject, "inbox delivery outside prefix");
            return;
        };
        let token = token.to_string();
        let mut sinks = self.sinks.lock().unwrap();
        match sinks.get(&token) {
            Some(InboxSink::Once(_)) => {
                let Some(InboxSink::Once(tx)) = sinks.remove(&token) else {
                    unreachable!()
                };
                let _ = tx.send(message);
            }
            Some(InboxSink::Stream(tx)) => match tx.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(%token, "inbox stream full, dropping delivery");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    sinks.remove(&token);
                }
            },
            None => {
                tracing::debug!(%token, "inbox delivery with no waiter");
            }
        }
    }
}

/// A long-lived inbox delivery stream, deregistered on drop.
///
/// Used by pull consumers to receive batches and status frames on a private
/// reply subject.
#[derive(Debug)]
pub struct InboxStream {
    subject: String,
    token: String,
    receiver: mpsc::Receiver<Message>,
    mux: Arc<InboxMultiplexer>,
}

impl InboxStream {
    pub(crate) fn new(
        subject: String,
        token: String,
        receiver: mpsc::Receiver<Message>,
        mux: Arc<InboxMultiplexer>,
    ) -> Self {
        Self {
            subject,
            token,
            receiver,
            mux,
        }
    }

    /// The reply subject deliveries are routed from.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Receives the next delivery; `None` after the connection closes.
    pub async fn next(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

impl Drop for InboxStream {
    fn drop(&mut self) {
        self.mux.deregister(&self.token);
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
            payload: Bytes::new(),
            length: subject.len(),
        }
    }

    #[test]
    fn test_once_sink_fires_and_deregisters() {
        let mux = InboxMultiplexer::new("_INBOX");
        let token = mux.new_token();
        let (tx, mut rx) = oneshot::channel();
        mux.register_once(token.clone(), tx);

        mux.route(message(&mux.subject_for(&token)));
        assert!(rx.try_recv().is_ok());

        // A second delivery for the same token has no waiter.
        mux.route(message(&mux.subject_for(&token)));
        assert!(mux.sinks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_stream_sink_receives_many() {
        let mux = InboxMultiplexer::new("_INBOX");
        let token = mux.new_token();
        let (tx, mut rx) = mpsc::channel(8);
        mux.register_stream(token.clone(), tx);

        let subject = mux.subject_for(&token);
        mux.route(message(&subject));
        mux.route(message(&subject));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_stream_is_reaped() {
        let mux = InboxMultiplexer::new("_INBOX");
        let token = mux.new_token();
        let (tx, rx) = mpsc::channel(1);
        mux.register_stream(token.clone(), tx);
        drop(rx);

        mux.route(message(&mux.subject_for(&token)));
        assert!(mux.sinks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_prefixes_are_connection_unique() {
        let a = InboxMultiplexer::new("_INBOX");
        let b = InboxMultiplexer::new("_INBOX");
        assert_ne!(a.prefix(), b.prefix());
        assert!(a.wildcard().ends_with(".*") || a.wildcard().ends_with("*"));
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let mux = InboxMultiplexer::new("_INBOX");
        mux.deregister("never-registered");
    }
}

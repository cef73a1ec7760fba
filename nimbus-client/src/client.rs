//! High-level client API.

use crate::connection::{ConnectionDriver, SharedState};
use crate::error::ClientError;
use crate::events::{ClientEvent, ConnectionStatus};
use crate::inbox::InboxStream;
use crate::options::{ConnectOptions, ServerAddr};
use crate::writer::Command;
use bytes::Bytes;
use nimbus_protocol::{HeaderMap, Message, ServerInfo, StatusCode};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

/// A handle to a long-lived, auto-reconnecting connection.
///
/// Cheap to clone; all clones share one transport and one subscription
/// registry. The connection closes when [`Client::close`] is called or every
/// handle is dropped.
#[derive(Debug, Clone)]
pub struct Client {
    commands: mpsc::Sender<Command>,
    state: Arc<SharedState>,
    request_timeout: Duration,
    flush_timeout: Duration,
    subscription_capacity: usize,
}

impl Client {
    /// Connects to the server list in `options`.
    ///
    /// Resolves after the first handshake completes; later disconnects are
    /// handled by the supervisor with backoff and subscription replay.
    pub async fn connect(options: ConnectOptions) -> Result<Self, ClientError> {
        let mut servers = Vec::with_capacity(options.urls.len());
        for url in &options.urls {
            servers.push(ServerAddr::parse(url)?);
        }
        if servers.is_empty() {
            return Err(ClientError::Usage("no server URLs given".into()));
        }

        let state = Arc::new(SharedState::new(&options));
        let (commands, commands_rx) = mpsc::channel(options.command_buffer_size);
        let client = Self {
            commands,
            state: state.clone(),
            request_timeout: options.request_timeout,
            flush_timeout: options.ping_timeout,
            subscription_capacity: options.subscription_capacity,
        };

        let driver = ConnectionDriver::new(options, commands_rx, state, servers);
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(driver.run(ready_tx));
        ready_rx
            .await
            .map_err(|_| ClientError::ConnectionClosed)??;
        Ok(client)
    }

    /// Publishes `payload` to `subject`.
    ///
    /// Suspends only while the command queue is full; dropping the future
    /// before it resolves leaves nothing on the queue.
    pub async fn publish(
        &self,
        subject: impl Into<String>,
        payload: Bytes,
    ) -> Result<(), ClientError> {
        self.publish_message(subject.into(), None, None, payload)
            .await
    }

    /// Publishes with headers.
    pub async fn publish_with_headers(
        &self,
        subject: impl Into<String>,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<(), ClientError> {
        self.publish_message(subject.into(), None, Some(headers), payload)
            .await
    }

    /// Publishes with an explicit reply subject.
    pub async fn publish_with_reply(
        &self,
        subject: impl Into<String>,
        reply: impl Into<String>,
        payload: Bytes,
    ) -> Result<(), ClientError> {
        self.publish_message(subject.into(), Some(reply.into()), None, payload)
            .await
    }

    async fn publish_message(
        &self,
        subject: String,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    ) -> Result<(), ClientError> {
        if !nimbus_protocol::is_valid_publish_subject(&subject) {
            return Err(ClientError::Usage(format!(
                "invalid publish subject: {subject:?}"
            )));
        }
        let max = self.state.max_payload.load(Ordering::Relaxed);
        if payload.len() > max {
            return Err(ClientError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }
        self.send(Command::Publish {
            subject,
            reply,
            headers,
            payload,
        })
        .await
    }

    /// Subscribes to `subject` (wildcards allowed).
    ///
    /// Returns once the broker has acknowledged the round trip, so messages
    /// published afterwards on the same connection are guaranteed to be seen.
    pub async fn subscribe(&self, subject: impl Into<String>) -> Result<Subscriber, ClientError> {
        self.subscribe_inner(subject.into(), None).await
    }

    /// Subscribes as a member of `queue_group`; the broker delivers each
    /// message to one member of the group.
    pub async fn queue_subscribe(
        &self,
        subject: impl Into<String>,
        queue_group: impl Into<String>,
    ) -> Result<Subscriber, ClientError> {
        self.subscribe_inner(subject.into(), Some(queue_group.into()))
            .await
    }

    async fn subscribe_inner(
        &self,
        subject: String,
        queue_group: Option<String>,
    ) -> Result<Subscriber, ClientError> {
        if !nimbus_protocol::is_valid_subscribe_subject(&subject) {
            return Err(ClientError::Usage(format!(
                "invalid subscription subject: {subject:?}"
            )));
        }
        if queue_group.is_some() && subject.starts_with(self.state.inbox.prefix()) {
            return Err(ClientError::Usage(
                "queue groups cannot be used on inbox subjects".into(),
            ));
        }

        let (sid, receiver) = self.state.registry.register(
            subject.clone(),
            queue_group.clone(),
            self.subscription_capacity,
        );
        // Cancellation before the barrier must leave no registration behind.
        let mut guard = RegistrationGuard {
            state: &self.state,
            commands: &self.commands,
            sid,
            armed: true,
        };

        self.send(Command::Subscribe {
            sid,
            subject: subject.clone(),
            queue_group,
        })
        .await?;
        self.flush().await?;

        guard.armed = false;
        Ok(Subscriber {
            sid,
            subject,
            receiver,
            commands: self.commands.clone(),
            state: self.state.clone(),
            unsubscribed: false,
        })
    }

    /// Publishes to `subject` and awaits the first reply.
    pub async fn request(
        &self,
        subject: impl Into<String>,
        payload: Bytes,
    ) -> Result<Message, ClientError> {
        self.request_with_timeout(subject, payload, self.request_timeout)
            .await
    }

    /// Publishes to `subject` and awaits the first reply within `timeout`.
    pub async fn request_with_timeout(
        &self,
        subject: impl Into<String>,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        self.ensure_inbox_subscribed().await?;

        let token = self.state.inbox.new_token();
        let (tx, rx) = oneshot::channel();
        self.state.inbox.register_once(token.clone(), tx);
        let _guard = InboxGuard {
            state: &self.state,
            token: &token,
        };

        let reply = self.state.inbox.subject_for(&token);
        self.publish_message(subject.into(), Some(reply), None, payload)
            .await?;

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(ClientError::Timeout),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Ok(Ok(message)) => {
                if message.status == Some(StatusCode::NO_RESPONDERS) {
                    return Err(ClientError::NoResponders);
                }
                Ok(message)
            }
        }
    }

    /// Opens a long-lived inbox delivery stream for pull-style consumers.
    pub async fn inbox_stream(&self, capacity: usize) -> Result<InboxStream, ClientError> {
        self.ensure_inbox_subscribed().await?;
        let token = self.state.inbox.new_token();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.state.inbox.register_stream(token.clone(), tx);
        let subject = self.state.inbox.subject_for(&token);
        Ok(InboxStream::new(
            subject,
            token,
            rx,
            self.state.inbox.clone(),
        ))
    }

    /// Returns a fresh reply subject under the connection's inbox prefix.
    pub fn new_inbox(&self) -> String {
        self.state
            .inbox
            .subject_for(&self.state.inbox.new_token())
    }

    async fn ensure_inbox_subscribed(&self) -> Result<(), ClientError> {
        let wildcard = self.state.inbox.wildcard();
        if let Some(sid) = self.state.registry.register_inbox(wildcard.clone()) {
            self.send(Command::Subscribe {
                sid,
                subject: wildcard,
                queue_group: None,
            })
            .await?;
        }
        Ok(())
    }

    /// Round-trips a `PING` to confirm everything queued so far reached the
    /// broker.
    pub async fn flush(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Flush { done: tx }).await?;
        match tokio::time::timeout(self.flush_timeout, rx).await {
            Err(_) => Err(ClientError::Timeout),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Ok(Ok(result)) => result,
        }
    }

    /// Disposes the connection. Pending waiters observe closure.
    pub async fn close(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Close { done: tx }).await?;
        let _ = rx.await;
        Ok(())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    /// Subscribes to connection lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.state.events.subscribe()
    }

    /// The most recent `INFO` received from the server.
    pub fn server_info(&self) -> ServerInfo {
        self.state.server_info.lock().unwrap().clone()
    }

    /// The current server-imposed publish size limit.
    pub fn max_payload(&self) -> usize {
        self.state.max_payload.load(Ordering::Relaxed)
    }

    async fn send(&self, cmd: Command) -> Result<(), ClientError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }
}

/// Removes a half-registered subscription if `subscribe` is canceled or
/// fails before its acknowledgement barrier.
struct RegistrationGuard<'a> {
    state: &'a Arc<SharedState>,
    commands: &'a mpsc::Sender<Command>,
    sid: u64,
    armed: bool,
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.state.registry.remove(self.sid) {
            let _ = self.commands.try_send(Command::Unsubscribe {
                sid: self.sid,
                max_msgs: None,
            });
        }
    }
}

/// Deregisters a request waiter on every exit path.
struct InboxGuard<'a> {
    state: &'a Arc<SharedState>,
    token: &'a str,
}

impl Drop for InboxGuard<'_> {
    fn drop(&mut self) {
        self.state.inbox.deregister(self.token);
    }
}

/// An active subscription.
///
/// Dropping the subscriber unsubscribes lazily; the registry's periodic
/// sweep catches handles leaked without a drop.
#[derive(Debug)]
pub struct Subscriber {
    sid: u64,
    subject: String,
    receiver: mpsc::Receiver<Message>,
    commands: mpsc::Sender<Command>,
    state: Arc<SharedState>,
    unsubscribed: bool,
}

impl Subscriber {
    /// The connection-unique subscription id.
    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Receives the next message in broker order. `None` once the
    /// subscription has ended.
    pub async fn next(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Explicitly unsubscribes.
    pub async fn unsubscribe(mut self) -> Result<(), ClientError> {
        self.unsubscribed = true;
        self.state.registry.remove(self.sid);
        self.commands
            .send(Command::Unsubscribe {
                sid: self.sid,
                max_msgs: None,
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Unsubscribes automatically after `max` total deliveries. Messages
    /// already buffered locally are still readable.
    pub async fn unsubscribe_after(&mut self, max: u64) -> Result<(), ClientError> {
        self.state.registry.set_max_msgs(self.sid, max);
        self.commands
            .send(Command::Unsubscribe {
                sid: self.sid,
                max_msgs: Some(max),
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if !self.unsubscribed && self.state.registry.remove(self.sid) {
            let _ = self.commands.try_send(Command::Unsubscribe {
                sid: self.sid,
                max_msgs: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const TEST_INFO: &[u8] =
        b"INFO {\"server_id\":\"test\",\"version\":\"0.0.0\",\"proto\":1,\"max_payload\":1048576,\"headers\":true}\r\n";

    /// Minimal in-process broker: single session at a time, exact-match and
    /// trailing-`*` subjects, echoes request payloads back to their reply
    /// subject. Closing the session on a `__kill` publish exercises
    /// reconnects.
    async fn run_broker(listener: TcpListener) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            serve_session(stream).await;
        }
    }

    async fn serve_session(mut stream: TcpStream) {
        if stream.write_all(TEST_INFO).await.is_err() {
            return;
        }
        let mut buf = Vec::new();
        let mut subs: Vec<(String, u64)> = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let Ok(n) = stream.read(&mut chunk).await else {
                return;
            };
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);

            loop {
                let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") else {
                    break;
                };
                let line = String::from_utf8(buf[..pos].to_vec()).unwrap();
                buf.drain(..pos + 2);
                let mut parts = line.split_ascii_whitespace();
                match parts.next().unwrap_or("") {
                    "CONNECT" => {}
                    "PING" => stream.write_all(b"PONG\r\n").await.unwrap(),
                    "UNSUB" => {}
                    "SUB" => {
                        let tokens: Vec<&str> = parts.collect();
                        let subject = tokens[0].to_string();
                        let sid: u64 = tokens.last().unwrap().parse().unwrap();
                        subs.push((subject, sid));
                    }
                    "PUB" => {
                        let tokens: Vec<&str> = parts.collect();
                        let subject = tokens[0].to_string();
                        let reply = (tokens.len() == 3).then(|| tokens[1].to_string());
                        let len: usize = tokens.last().unwrap().parse().unwrap();
                        while buf.len() < len + 2 {
                            let n = stream.read(&mut chunk).await.unwrap();
                            assert!(n > 0);
                            buf.extend_from_slice(&chunk[..n]);
                        }
                        let payload = buf[..len].to_vec();
                        buf.drain(..len + 2);

                        if subject == "__kill" {
                            return;
                        }
                        let mut targets: Vec<(String, u64)> = Vec::new();
                        for (pattern, sid) in &subs {
                            if matches(pattern, &subject) {
                                targets.push((subject.clone(), *sid));
                            }
                        }
                        // Echo requests straight back to their inbox.
                        if let Some(reply) = reply {
                            if subject != "blackhole" {
                                for (pattern, sid) in &subs {
                                    if matches(pattern, &reply) {
                                        targets.push((reply.clone(), *sid));
                                    }
                                }
                            }
                        }
                        for (subject, sid) in targets {
                            let head = format!("MSG {subject} {sid} {len}\r\n");
                            stream.write_all(head.as_bytes()).await.unwrap();
                            stream.write_all(&payload).await.unwrap();
                            stream.write_all(b"\r\n").await.unwrap();
                        }
                    }
                    other => panic!("broker got unexpected verb {other:?}"),
                }
            }
        }
    }

    fn matches(pattern: &str, subject: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            subject.starts_with(prefix)
        } else {
            pattern == subject
        }
    }

    async fn start_broker() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_broker(listener));
        format!("nats://{addr}")
    }

    #[tokio::test]
    async fn test_publish_subscribe_roundtrip() {
        let url = start_broker().await;
        let client = Client::connect(ConnectOptions::new(url)).await.unwrap();

        let mut sub = client.subscribe("greetings").await.unwrap();
        client
            .publish("greetings", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        client.publish("greetings", Bytes::new()).await.unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(&first.payload[..], b"hello");
        assert_eq!(first.subject, "greetings");

        // Empty payloads are valid messages.
        let second = sub.next().await.unwrap();
        assert!(second.payload.is_empty());
    }

    #[tokio::test]
    async fn test_publish_order_preserved() {
        let url = start_broker().await;
        let client = Client::connect(ConnectOptions::new(url)).await.unwrap();

        let mut sub = client.subscribe("seq").await.unwrap();
        for i in 0u32..64 {
            client
                .publish("seq", Bytes::from(i.to_le_bytes().to_vec()))
                .await
                .unwrap();
        }
        for i in 0u32..64 {
            let msg = sub.next().await.unwrap();
            let got = u32::from_le_bytes(msg.payload[..4].try_into().unwrap());
            assert_eq!(got, i);
        }
    }

    #[tokio::test]
    async fn test_request_reply() {
        let url = start_broker().await;
        let client = Client::connect(ConnectOptions::new(url)).await.unwrap();

        let reply = client
            .request("service.echo", Bytes::from_static(b"ping!"))
            .await
            .unwrap();
        assert_eq!(&reply.payload[..], b"ping!");
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let url = start_broker().await;
        let client = Client::connect(ConnectOptions::new(url)).await.unwrap();

        let result = client
            .request_with_timeout(
                "blackhole",
                Bytes::from_static(b"?"),
                Duration::from_millis(100),
            )
            .await;
        assert!(matches!(result, Err(ClientError::Timeout)));
    }

    #[tokio::test]
    async fn test_oversize_publish_fails_locally() {
        let url = start_broker().await;
        let client = Client::connect(ConnectOptions::new(url)).await.unwrap();

        let payload = Bytes::from(vec![0u8; 2 * 1024 * 1024]);
        let result = client.publish("big", payload).await;
        assert!(matches!(
            result,
            Err(ClientError::PayloadTooLarge { max: 1048576, .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_subjects_rejected() {
        let url = start_broker().await;
        let client = Client::connect(ConnectOptions::new(url)).await.unwrap();

        assert!(matches!(
            client.publish("foo.*", Bytes::new()).await,
            Err(ClientError::Usage(_))
        ));
        assert!(matches!(
            client.subscribe("foo..bar").await,
            Err(ClientError::Usage(_))
        ));
    }

    #[tokio::test]
    async fn test_queue_group_on_inbox_is_usage_error() {
        let url = start_broker().await;
        let client = Client::connect(ConnectOptions::new(url)).await.unwrap();

        let inbox = client.new_inbox();
        let result = client.queue_subscribe(inbox, "workers").await;
        assert!(matches!(result, Err(ClientError::Usage(_))));
    }

    #[tokio::test]
    async fn test_reconnect_replays_subscriptions() {
        let url = start_broker().await;
        let options = ConnectOptions::new(url)
            .with_reconnect_delay(Duration::from_millis(10), Duration::from_millis(50))
            .with_reconnect_jitter(Duration::ZERO);
        let client = Client::connect(options).await.unwrap();
        let mut events = client.events();

        let mut sub = client.subscribe("durable.topic").await.unwrap();

        // Make the broker drop the session.
        client.publish("__kill", Bytes::new()).await.unwrap();
        loop {
            match events.recv().await.unwrap() {
                ClientEvent::Reconnected => break,
                _ => continue,
            }
        }

        // The replayed SUB must be live on the new session.
        client
            .publish("durable.topic", Bytes::from_static(b"after"))
            .await
            .unwrap();
        let msg = sub.next().await.unwrap();
        assert_eq!(&msg.payload[..], b"after");
    }

    #[tokio::test]
    async fn test_close_fails_later_operations() {
        let url = start_broker().await;
        let client = Client::connect(ConnectOptions::new(url)).await.unwrap();

        client.close().await.unwrap();
        let result = client.publish("foo", Bytes::new()).await;
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));
        assert_eq!(client.status(), ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn test_subscriber_drop_unsubscribes() {
        let url = start_broker().await;
        let client = Client::connect(ConnectOptions::new(url)).await.unwrap();

        let sub = client.subscribe("short.lived").await.unwrap();
        let sid = sub.sid();
        drop(sub);
        // Registered entry is gone immediately; the wire UNSUB is lazy.
        let sub2 = client.subscribe("short.lived2").await.unwrap();
        assert!(sub2.sid() > sid);
        client.flush().await.unwrap();
    }
}

//! Consumer configuration, the consumer facade and the pull engine.
//!
//! The pull engine converts a "consume N messages / B bytes" intent into a
//! sequence of broker pull requests: one initial pull for the full credit,
//! then delta refills whenever outstanding credit falls to the configured
//! threshold. Idle heartbeats from the broker feed a watchdog; terminal
//! statuses end the stream.

use crate::api::Context;
use crate::error::Error;
use crate::message::StreamMessage;
use chrono::{DateTime, Utc};
use nimbus_protocol::{Message, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Batch size used when a pull is bounded by bytes only.
pub(crate) const BYTE_MODE_BATCH: usize = 1_000_000;

/// Default credit when neither a message nor a byte limit is configured.
pub(crate) const DEFAULT_MAX_MSGS: usize = 1_000;

const MIN_EXPIRES: Duration = Duration::from_secs(1);
const MAX_EXPIRES: Duration = Duration::from_secs(300);
const MIN_IDLE_HEARTBEAT: Duration = Duration::from_millis(500);
const MAX_IDLE_HEARTBEAT: Duration = Duration::from_secs(30);

/// Acknowledgement mode of a consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    /// No acknowledgements.
    None,
    /// Acknowledging a message acknowledges everything before it.
    All,
    /// Every message is acknowledged individually.
    #[default]
    Explicit,
}

/// Replay pacing for replayed messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
    /// As fast as the consumer pulls.
    #[default]
    Instant,
    /// At the original publish cadence.
    Original,
}

/// Where the consumer's cursor starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "deliver_policy", rename_all = "snake_case")]
pub enum DeliverPolicy {
    /// From the first available message.
    #[default]
    All,
    /// From the last message.
    Last,
    /// Only messages published after creation.
    New,
    /// From an explicit stream sequence.
    ByStartSequence {
        #[serde(rename = "opt_start_seq")]
        start_sequence: u64,
    },
    /// From an explicit point in time.
    ByStartTime {
        #[serde(rename = "opt_start_time")]
        start_time: DateTime<Utc>,
    },
    /// The last message for each matched subject.
    LastPerSubject,
}

/// Consumer configuration, serialized for the admin API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Name for ephemeral named consumers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Name for durable consumers; survives disconnects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Present on push consumers only; pull consumers leave it unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_subjects: Vec<String>,
    #[serde(default)]
    pub ack_policy: AckPolicy,
    #[serde(default, with = "crate::nanos", skip_serializing_if = "Duration::is_zero")]
    pub ack_wait: Duration,
    /// -1 means unlimited redeliveries.
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub max_deliver: i64,
    #[serde(default)]
    pub replay_policy: ReplayPolicy,
    #[serde(default, with = "crate::nanos", skip_serializing_if = "Duration::is_zero")]
    pub inactive_threshold: Duration,
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub num_replicas: usize,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub mem_storage: bool,
    #[serde(flatten)]
    pub deliver_policy: DeliverPolicy,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub headers_only: bool,
}

fn is_zero_i64(value: &i64) -> bool {
    *value == 0
}

fn is_zero_usize(value: &usize) -> bool {
    *value == 0
}

impl ConsumerConfig {
    /// The name this consumer is addressed by, durable name preferred.
    pub fn consumer_name(&self) -> Option<&str> {
        self.durable_name.as_deref().or(self.name.as_deref())
    }
}

/// Cursor positions reported with `CONSUMER.INFO`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SequenceInfo {
    #[serde(default)]
    pub consumer_seq: u64,
    #[serde(default)]
    pub stream_seq: u64,
}

/// Consumer metadata returned by the admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub stream_name: String,
    pub name: String,
    pub created: DateTime<Utc>,
    pub config: ConsumerConfig,
    #[serde(default)]
    pub delivered: SequenceInfo,
    #[serde(default)]
    pub ack_floor: SequenceInfo,
    #[serde(default)]
    pub num_ack_pending: usize,
    #[serde(default)]
    pub num_redelivered: usize,
    #[serde(default)]
    pub num_waiting: usize,
    #[serde(default)]
    pub num_pending: u64,
}

/// One pull request as sent to `CONSUMER.MSG.NEXT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PullRequest {
    pub(crate) batch: usize,
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub(crate) max_bytes: usize,
    #[serde(with = "crate::nanos")]
    pub(crate) expires: Duration,
    #[serde(default, with = "crate::nanos", skip_serializing_if = "Duration::is_zero")]
    pub(crate) idle_heartbeat: Duration,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub(crate) no_wait: bool,
}

/// Per-consume tuning.
#[derive(Debug, Clone)]
pub struct ConsumeConfig {
    /// Message credit per pull. Mutually exclusive with `max_bytes`.
    pub max_msgs: Option<usize>,
    /// Byte credit per pull. Mutually exclusive with `max_msgs`.
    pub max_bytes: Option<usize>,
    /// Refill when message credit drops to this level (default: half of max).
    pub threshold_msgs: Option<usize>,
    /// Refill when byte credit drops to this level (default: half of max).
    pub threshold_bytes: Option<usize>,
    /// Server-side pull lifetime; clamped to [1 s, 300 s].
    pub expires: Duration,
    /// Expected heartbeat cadence; clamped to [0.5 s, 30 s].
    pub idle_heartbeat: Duration,
}

impl Default for ConsumeConfig {
    fn default() -> Self {
        Self {
            max_msgs: None,
            max_bytes: None,
            threshold_msgs: None,
            threshold_bytes: None,
            expires: Duration::from_secs(30),
            idle_heartbeat: Duration::from_secs(15),
        }
    }
}

impl ConsumeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_msgs(mut self, max: usize) -> Self {
        self.max_msgs = Some(max);
        self
    }

    pub fn with_max_bytes(mut self, max: usize) -> Self {
        self.max_bytes = Some(max);
        self
    }

    pub fn with_threshold_msgs(mut self, threshold: usize) -> Self {
        self.threshold_msgs = Some(threshold);
        self
    }

    pub fn with_threshold_bytes(mut self, threshold: usize) -> Self {
        self.threshold_bytes = Some(threshold);
        self
    }

    pub fn with_expires(mut self, expires: Duration) -> Self {
        self.expires = expires;
        self
    }

    pub fn with_idle_heartbeat(mut self, idle_heartbeat: Duration) -> Self {
        self.idle_heartbeat = idle_heartbeat;
        self
    }
}

pub(crate) fn clamp_expires(value: Duration) -> Duration {
    value.clamp(MIN_EXPIRES, MAX_EXPIRES)
}

pub(crate) fn clamp_idle_heartbeat(value: Duration) -> Duration {
    value.clamp(MIN_IDLE_HEARTBEAT, MAX_IDLE_HEARTBEAT)
}

/// Outstanding credit granted to the broker.
///
/// Invariant: `pending_msgs <= max_msgs`, and `pending_bytes <= max_bytes`
/// whenever byte-limited.
#[derive(Debug, Clone)]
pub(crate) struct Credit {
    max_msgs: usize,
    max_bytes: usize,
    threshold_msgs: usize,
    threshold_bytes: usize,
    pending_msgs: usize,
    pending_bytes: usize,
    byte_limited: bool,
}

impl Credit {
    pub(crate) fn new(config: &ConsumeConfig) -> Result<Self, Error> {
        if config.max_msgs.is_some() && config.max_bytes.is_some() {
            return Err(Error::Usage(
                "max_msgs and max_bytes are mutually exclusive".into(),
            ));
        }
        let byte_limited = config.max_bytes.is_some();
        let max_msgs = if byte_limited {
            BYTE_MODE_BATCH
        } else {
            config.max_msgs.unwrap_or(DEFAULT_MAX_MSGS).max(1)
        };
        let max_bytes = config.max_bytes.unwrap_or(0);
        let threshold_msgs = config
            .threshold_msgs
            .unwrap_or(max_msgs / 2)
            .min(max_msgs);
        let threshold_bytes = if byte_limited {
            config
                .threshold_bytes
                .unwrap_or(max_bytes / 2)
                .min(max_bytes)
        } else {
            0
        };
        Ok(Self {
            max_msgs,
            max_bytes,
            threshold_msgs,
            threshold_bytes,
            pending_msgs: 0,
            pending_bytes: 0,
            byte_limited,
        })
    }

    pub(crate) fn pending_msgs(&self) -> usize {
        self.pending_msgs
    }

    pub(crate) fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub(crate) fn max_msgs(&self) -> usize {
        self.max_msgs
    }

    /// One message consumed credit.
    pub(crate) fn note_message(&mut self, wire_size: usize) {
        self.pending_msgs = self.pending_msgs.saturating_sub(1);
        if self.byte_limited {
            self.pending_bytes = self.pending_bytes.saturating_sub(wire_size);
        }
    }

    pub(crate) fn needs_refill(&self) -> bool {
        self.pending_msgs <= self.threshold_msgs
            || (self.byte_limited && self.pending_bytes <= self.threshold_bytes)
    }

    /// Forgets outstanding credit (expired or abandoned pulls).
    pub(crate) fn reset(&mut self) {
        self.pending_msgs = 0;
        self.pending_bytes = 0;
    }

    /// Computes the delta pull that restores credit to max, and applies it.
    pub(crate) fn refill(&mut self) -> PullSize {
        let size = if self.byte_limited {
            PullSize {
                batch: BYTE_MODE_BATCH,
                max_bytes: self.max_bytes - self.pending_bytes,
            }
        } else {
            PullSize {
                batch: self.max_msgs - self.pending_msgs,
                max_bytes: 0,
            }
        };
        self.pending_msgs = self.max_msgs;
        self.pending_bytes = self.max_bytes;
        size
    }
}

/// Size of one pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PullSize {
    pub(crate) batch: usize,
    pub(crate) max_bytes: usize,
}

/// Lifecycle notifications emitted alongside the message stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerNotification {
    /// A full pull was issued.
    Pulled { batch: usize, max_bytes: usize },
    /// A delta refill was issued.
    Refilled { batch: usize, max_bytes: usize },
    /// The broker reported a pull expiry.
    TimedOut,
    /// No heartbeat arrived within twice the configured cadence.
    HeartbeatLost,
    /// A terminal status ended the consume call.
    Terminated { status: u16, description: String },
}

/// How the engine reacts to a status control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusAction {
    Heartbeat,
    EmptyBatch,
    PullExpired,
    Terminal,
    Ignore,
}

fn classify_status(status: StatusCode) -> StatusAction {
    match status {
        StatusCode::IDLE_HEARTBEAT => StatusAction::Heartbeat,
        StatusCode::NO_MESSAGES => StatusAction::EmptyBatch,
        StatusCode::REQUEST_TIMEOUT => StatusAction::PullExpired,
        status if status.is_error() => StatusAction::Terminal,
        _ => StatusAction::Ignore,
    }
}

/// Ordered message stream returned by [`Consumer::consume`].
///
/// Dropping the stream cancels the consume call; the engine drains and
/// stops.
#[derive(Debug)]
pub struct MessageStream {
    receiver: mpsc::Receiver<Result<StreamMessage, Error>>,
}

impl MessageStream {
    /// The next message in server order, or a terminal error. `None` once
    /// the stream has ended.
    pub async fn next(&mut self) -> Option<Result<StreamMessage, Error>> {
        self.receiver.recv().await
    }
}

/// Facade over one pull consumer.
#[derive(Debug, Clone)]
pub struct Consumer {
    context: Context,
    info: ConsumerInfo,
}

impl Consumer {
    pub(crate) fn new(context: Context, info: ConsumerInfo) -> Self {
        Self { context, info }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn stream_name(&self) -> &str {
        &self.info.stream_name
    }

    pub fn cached_info(&self) -> &ConsumerInfo {
        &self.info
    }

    /// Refreshes and returns the consumer info.
    pub async fn info(&mut self) -> Result<&ConsumerInfo, Error> {
        self.info = self
            .context
            .consumer_info(&self.info.stream_name, &self.info.name)
            .await?;
        Ok(&self.info)
    }

    /// Starts a continuous consume call.
    ///
    /// Returns the ordered message stream and the lifecycle notification
    /// channel. The engine keeps the broker supplied with credit until the
    /// stream is dropped or a terminal status arrives.
    pub async fn consume(
        &self,
        config: ConsumeConfig,
    ) -> Result<(MessageStream, mpsc::Receiver<ConsumerNotification>), Error> {
        let credit = Credit::new(&config)?;
        let channel_depth = credit.max_msgs().clamp(64, 8192);
        let inbox = self.context.client().inbox_stream(channel_depth).await?;

        let (deliveries_tx, deliveries_rx) = mpsc::channel(channel_depth);
        let (notify_tx, notify_rx) = mpsc::channel(64);

        let engine = PullEngine {
            context: self.context.clone(),
            pull_subject: self.context.api_subject(&format!(
                "CONSUMER.MSG.NEXT.{}.{}",
                self.info.stream_name, self.info.name
            )),
            inbox,
            deliveries: deliveries_tx,
            notifications: notify_tx,
            credit,
            expires: clamp_expires(config.expires),
            idle_heartbeat: clamp_idle_heartbeat(config.idle_heartbeat),
        };
        tokio::spawn(engine.run());

        Ok((
            MessageStream {
                receiver: deliveries_rx,
            },
            notify_rx,
        ))
    }

    /// Retrieves up to `batch` messages that are immediately available.
    ///
    /// A `no_wait` pull: the broker answers with what it has and a
    /// `404 No Messages` status once the batch is done.
    pub async fn fetch(&self, batch: usize) -> Result<Vec<StreamMessage>, Error> {
        if batch == 0 {
            return Err(Error::Usage("fetch batch must be at least 1".into()));
        }
        let mut inbox = self
            .context
            .client()
            .inbox_stream(batch.clamp(64, 8192))
            .await?;

        let expires = clamp_expires(Duration::from_secs(30));
        let request = PullRequest {
            batch,
            max_bytes: 0,
            expires,
            idle_heartbeat: Duration::ZERO,
            no_wait: true,
        };
        let payload = serde_json::to_vec(&request)?;
        self.context
            .client()
            .publish_with_reply(
                self.context.api_subject(&format!(
                    "CONSUMER.MSG.NEXT.{}.{}",
                    self.info.stream_name, self.info.name
                )),
                inbox.subject().to_string(),
                payload.into(),
            )
            .await?;

        let deadline = Instant::now() + expires + Duration::from_millis(100);
        let mut messages = Vec::new();
        while messages.len() < batch {
            let next = tokio::time::timeout_at(deadline, inbox.next()).await;
            let message = match next {
                Err(_) | Ok(None) => break,
                Ok(Some(message)) => message,
            };
            if let Some(status) = message.status {
                match classify_status(status) {
                    StatusAction::EmptyBatch | StatusAction::PullExpired => break,
                    StatusAction::Terminal => {
                        return Err(Error::ConsumerTerminated {
                            status: status.0,
                            description: message
                                .description
                                .unwrap_or_else(|| "terminal status".into()),
                        });
                    }
                    StatusAction::Heartbeat | StatusAction::Ignore => continue,
                }
            }
            messages.push(StreamMessage::new(message, self.context.clone()));
        }
        Ok(messages)
    }
}

/// The per-consume pull engine task.
struct PullEngine {
    context: Context,
    pull_subject: String,
    inbox: nimbus_client::InboxStream,
    deliveries: mpsc::Sender<Result<StreamMessage, Error>>,
    notifications: mpsc::Sender<ConsumerNotification>,
    credit: Credit,
    expires: Duration,
    idle_heartbeat: Duration,
}

impl PullEngine {
    async fn run(mut self) {
        let size = self.credit.refill();
        if let Err(err) = self.send_pull(size).await {
            let _ = self.deliveries.send(Err(err)).await;
            return;
        }
        self.notify(ConsumerNotification::Pulled {
            batch: size.batch,
            max_bytes: size.max_bytes,
        });

        let watchdog = self.idle_heartbeat * 2;
        let mut heartbeat_deadline = Instant::now() + watchdog;

        loop {
            tokio::select! {
                biased;
                // User dropped the message stream: drain and stop.
                _ = self.deliveries.closed() => {
                    tracing::debug!("message stream dropped, ending consume");
                    return;
                }
                delivery = self.inbox.next() => {
                    let Some(message) = delivery else {
                        let _ = self.deliveries.send(Err(
                            nimbus_client::ClientError::ConnectionClosed.into(),
                        )).await;
                        return;
                    };
                    // Any inbound traffic proves the broker is alive.
                    heartbeat_deadline = Instant::now() + watchdog;
                    if !self.handle_delivery(message).await {
                        return;
                    }
                }
                _ = tokio::time::sleep_until(heartbeat_deadline) => {
                    tracing::warn!("missed idle heartbeats, restarting pull");
                    self.notify(ConsumerNotification::HeartbeatLost);
                    // Outstanding pulls are presumed lost with their credit.
                    self.credit.reset();
                    let size = self.credit.refill();
                    if let Err(err) = self.send_pull(size).await {
                        let _ = self.deliveries.send(Err(err)).await;
                        return;
                    }
                    self.notify(ConsumerNotification::Pulled {
                        batch: size.batch,
                        max_bytes: size.max_bytes,
                    });
                    heartbeat_deadline = Instant::now() + watchdog;
                }
            }
        }
    }

    /// Returns false when the consume call must end.
    async fn handle_delivery(&mut self, message: Message) -> bool {
        if let Some(status) = message.status {
            return self.handle_status(status, message.description).await;
        }

        let wire_size = message.length;
        let delivery = StreamMessage::new(message, self.context.clone());
        if self.deliveries.send(Ok(delivery)).await.is_err() {
            return false;
        }
        self.credit.note_message(wire_size);

        if self.credit.needs_refill() {
            let size = self.credit.refill();
            if let Err(err) = self.send_pull(size).await {
                let _ = self.deliveries.send(Err(err)).await;
                return false;
            }
            self.notify(ConsumerNotification::Refilled {
                batch: size.batch,
                max_bytes: size.max_bytes,
            });
        }
        true
    }

    async fn handle_status(&mut self, status: StatusCode, description: Option<String>) -> bool {
        match classify_status(status) {
            StatusAction::Heartbeat => true,
            StatusAction::Ignore => true,
            action @ (StatusAction::EmptyBatch | StatusAction::PullExpired) => {
                if action == StatusAction::PullExpired {
                    self.notify(ConsumerNotification::TimedOut);
                }
                // That pull is finished; whatever credit it still carried is
                // gone on the broker side.
                self.credit.reset();
                let size = self.credit.refill();
                if let Err(err) = self.send_pull(size).await {
                    let _ = self.deliveries.send(Err(err)).await;
                    return false;
                }
                self.notify(ConsumerNotification::Refilled {
                    batch: size.batch,
                    max_bytes: size.max_bytes,
                });
                true
            }
            StatusAction::Terminal => {
                let description = description.unwrap_or_else(|| "terminal status".into());
                tracing::warn!(code = status.0, %description, "consumer terminated");
                self.notify(ConsumerNotification::Terminated {
                    status: status.0,
                    description: description.clone(),
                });
                let _ = self
                    .deliveries
                    .send(Err(Error::ConsumerTerminated {
                        status: status.0,
                        description,
                    }))
                    .await;
                false
            }
        }
    }

    async fn send_pull(&self, size: PullSize) -> Result<(), Error> {
        let request = PullRequest {
            batch: size.batch,
            max_bytes: size.max_bytes,
            expires: self.expires,
            idle_heartbeat: self.idle_heartbeat,
            no_wait: false,
        };
        let payload = serde_json::to_vec(&request)?;
        self.context
            .client()
            .publish_with_reply(
                self.pull_subject.clone(),
                self.inbox.subject().to_string(),
                payload.into(),
            )
            .await?;
        Ok(())
    }

    fn notify(&self, notification: ConsumerNotification) {
        // Notifications are advisory; a full channel drops them.
        let _ = self.notifications.try_send(notification);
    }
}

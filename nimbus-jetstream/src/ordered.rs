//! Ordered consumer: gapless delivery with transparent recovery.
//!
//! Backed by an auto-created ephemeral consumer (memory storage, single
//! replica, no acks). The task tracks the stream sequence of the last
//! delivered message; on any gap it deletes the consumer and recreates it
//! at `deliver_by_start_sequence = last + 1`, invisibly to the caller.

use crate::api::Context;
use crate::consumer::{AckPolicy, ConsumeConfig, ConsumerConfig, DeliverPolicy};
use crate::error::Error;
use crate::message::StreamMessage;
use crate::stream::Stream;
use std::time::Duration;
use tokio::sync::mpsc;

const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Tuning for an ordered consume call.
#[derive(Debug, Clone, Default)]
pub struct OrderedConfig {
    /// Restrict delivery to subjects matching this pattern.
    pub filter_subject: Option<String>,
}

impl OrderedConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter_subject(mut self, filter: impl Into<String>) -> Self {
        self.filter_subject = Some(filter.into());
        self
    }
}

/// Gapless message stream returned by [`Stream::ordered_consume`].
#[derive(Debug)]
pub struct OrderedStream {
    receiver: mpsc::Receiver<Result<StreamMessage, Error>>,
}

impl OrderedStream {
    /// The next message, in stream-sequence order without gaps. `None` once
    /// the stream has ended.
    pub async fn next(&mut self) -> Option<Result<StreamMessage, Error>> {
        self.receiver.recv().await
    }
}

impl Stream {
    /// Starts an ordered consume call over this stream.
    pub async fn ordered_consume(&self, config: OrderedConfig) -> Result<OrderedStream, Error> {
        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(run_ordered(
            self.context().clone(),
            self.name().to_string(),
            config,
            tx,
        ));
        Ok(OrderedStream { receiver: rx })
    }
}

fn ordered_consumer_config(config: &OrderedConfig, last_sequence: u64) -> ConsumerConfig {
    ConsumerConfig {
        name: Some(format!("ord_{}", uuid::Uuid::new_v4().simple())),
        ack_policy: AckPolicy::None,
        mem_storage: true,
        num_replicas: 1,
        inactive_threshold: Duration::from_secs(300),
        filter_subject: config.filter_subject.clone(),
        deliver_policy: if last_sequence == 0 {
            DeliverPolicy::All
        } else {
            DeliverPolicy::ByStartSequence {
                start_sequence: last_sequence + 1,
            }
        },
        ..Default::default()
    }
}

async fn run_ordered(
    context: Context,
    stream_name: String,
    config: OrderedConfig,
    out: mpsc::Sender<Result<StreamMessage, Error>>,
) {
    let mut last_sequence: u64 = 0;
    let mut failures: u32 = 0;

    loop {
        let consumer_config = ordered_consumer_config(&config, last_sequence);
        let name = consumer_config
            .consumer_name()
            .unwrap_or_default()
            .to_string();

        let session = async {
            let consumer = context
                .create_consumer_on(&stream_name, consumer_config.clone())
                .await?;
            consumer.consume(ConsumeConfig::default()).await
        }
        .await;

        let (mut messages, _notifications) = match session {
            Ok(pair) => {
                failures = 0;
                pair
            }
            Err(err) => {
                failures += 1;
                if failures > MAX_CONSECUTIVE_FAILURES {
                    let _ = out.send(Err(err)).await;
                    return;
                }
                tracing::debug!(error = %err, failures, "ordered consumer setup failed");
                tokio::time::sleep(Duration::from_millis(100 * u64::from(failures))).await;
                continue;
            }
        };

        'deliver: loop {
            tokio::select! {
                biased;
                _ = out.closed() => {
                    let _ = context.delete_consumer(&stream_name, &name).await;
                    return;
                }
                next = messages.next() => match next {
                    None | Some(Err(_)) => {
                        // Consumer deleted, heartbeats lost or connection
                        // trouble: recreate at the next expected sequence.
                        tracing::debug!(last_sequence, "ordered consumer interrupted, recreating");
                        break 'deliver;
                    }
                    Some(Ok(message)) => {
                        let Ok(info) = message.info() else {
                            break 'deliver;
                        };
                        let sequence = info.stream_sequence;
                        if last_sequence != 0 && sequence <= last_sequence {
                            continue;
                        }
                        if last_sequence != 0 && sequence != last_sequence + 1 {
                            tracing::debug!(
                                expected = last_sequence + 1,
                                got = sequence,
                                "sequence gap detected"
                            );
                            break 'deliver;
                        }
                        last_sequence = sequence;
                        if out.send(Ok(message)).await.is_err() {
                            let _ = context.delete_consumer(&stream_name, &name).await;
                            return;
                        }
                    }
                }
            }
        }

        drop(messages);
        let _ = context.delete_consumer(&stream_name, &name).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_ordered_consumer_starts_at_all() {
        let config = ordered_consumer_config(&OrderedConfig::new(), 0);
        assert_eq!(config.deliver_policy, DeliverPolicy::All);
        assert!(config.mem_storage);
        assert_eq!(config.num_replicas, 1);
        assert_eq!(config.ack_policy, AckPolicy::None);
        assert!(config.name.as_deref().unwrap().starts_with("ord_"));
    }

    #[test]
    fn test_recovery_resumes_after_last_sequence() {
        let config = ordered_consumer_config(&OrderedConfig::new(), 41);
        assert_eq!(
            config.deliver_policy,
            DeliverPolicy::ByStartSequence { start_sequence: 42 }
        );
    }

    #[test]
    fn test_generated_names_are_unique() {
        let a = ordered_consumer_config(&OrderedConfig::new(), 0);
        let b = ordered_consumer_config(&OrderedConfig::new(), 0);
        assert_ne!(a.name, b.name);
    }

    #[test]
    fn test_filter_subject_is_forwarded() {
        let config = ordered_consumer_config(
            &OrderedConfig::new().with_filter_subject("orders.eu.>"),
            0,
        );
        assert_eq!(config.filter_subject.as_deref(), Some("orders.eu.>"));
    }
}

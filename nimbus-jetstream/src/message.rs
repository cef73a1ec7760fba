//! Messages delivered from a stream, with acknowledgement support.

use crate::api::Context;
use crate::error::Error;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use nimbus_protocol::{HeaderMap, Message};

/// Acknowledgement variants a consumer can reply with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Processed; advance the consumer.
    Ack,
    /// Processing failed; redeliver.
    Nak,
    /// Still working; reset the ack timer.
    InProgress,
    /// Unprocessable; never redeliver.
    Term,
}

impl AckKind {
    fn payload(&self) -> Bytes {
        match self {
            AckKind::Ack => Bytes::from_static(b"+ACK"),
            AckKind::Nak => Bytes::from_static(b"-NAK"),
            AckKind::InProgress => Bytes::from_static(b"+WPI"),
            AckKind::Term => Bytes::from_static(b"+TERM"),
        }
    }
}

/// A message delivered through a consumer.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    message: Message,
    context: Context,
}

impl StreamMessage {
    pub(crate) fn new(message: Message, context: Context) -> Self {
        Self { message, context }
    }

    pub fn subject(&self) -> &str {
        &self.message.subject
    }

    pub fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    pub fn headers(&self) -> Option<&HeaderMap> {
        self.message.headers.as_ref()
    }

    /// The underlying wire message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Delivery metadata parsed from the acknowledgement reply subject.
    pub fn info(&self) -> Result<MessageInfo, Error> {
        let reply = self
            .message
            .reply
            .as_deref()
            .ok_or_else(|| Error::Usage("message carries no ack reply subject".into()))?;
        MessageInfo::parse(reply)
    }

    /// Acknowledges processing.
    pub async fn ack(&self) -> Result<(), Error> {
        self.ack_with(AckKind::Ack).await
    }

    /// Replies with an explicit acknowledgement variant.
    pub async fn ack_with(&self, kind: AckKind) -> Result<(), Error> {
        let reply = self
            .message
            .reply
            .as_deref()
            .ok_or_else(|| Error::Usage("message carries no ack reply subject".into()))?;
        self.context
            .client()
            .publish(reply.to_string(), kind.payload())
            .await?;
        Ok(())
    }
}

/// Delivery metadata encoded in the ack reply subject:
/// `$JS.ACK.<stream>.<consumer>.<delivered>.<stream seq>.<consumer seq>.<time>.<pending>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    pub stream: String,
    pub consumer: String,
    /// How many times this message has been delivered.
    pub delivered: u64,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    pub published: DateTime<Utc>,
    /// Messages still pending for the consumer after this one.
    pub pending: u64,
}

impl MessageInfo {
    pub(crate) fn parse(reply: &str) -> Result<Self, Error> {
        let tokens: Vec<&str> = reply.split('.').collect();
        let bad = || Error::Usage(format!("unparsable ack subject: {reply:?}"));

        // 9 tokens for the v1 form, 12 when domain and account hash are
        // present; the trailing 7 fields are identical.
        if tokens.first() != Some(&"$JS") || tokens.get(1) != Some(&"ACK") {
            return Err(bad());
        }
        let fields: &[&str] = match tokens.len() {
            9 => &tokens[2..],
            12 => &tokens[5..],
            _ => return Err(bad()),
        };

        let number = |index: usize| -> Result<u64, Error> {
            fields[index].parse().map_err(|_| bad())
        };
        let published_nanos: i64 = fields[5].parse().map_err(|_| bad())?;

        Ok(Self {
            stream: fields[0].to_string(),
            consumer: fields[1].to_string(),
            delivered: number(2)?,
            stream_sequence: number(3)?,
            consumer_sequence: number(4)?,
            published: DateTime::from_timestamp_nanos(published_nanos),
            pending: number(6)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_v1_ack_subject() {
        let info = MessageInfo::parse("$JS.ACK.ORDERS.processor.1.42.17.1700000000000000000.5")
            .unwrap();
        assert_eq!(info.stream, "ORDERS");
        assert_eq!(info.consumer, "processor");
        assert_eq!(info.delivered, 1);
        assert_eq!(info.stream_sequence, 42);
        assert_eq!(info.consumer_sequence, 17);
        assert_eq!(info.pending, 5);
    }

    #[test]
    fn test_parse_v2_ack_subject_with_domain() {
        let info = MessageInfo::parse(
            "$JS.ACK.hub.acctHash.ORDERS.processor.2.100.90.1700000000000000000.0",
        );
        // 11 tokens is not a valid form.
        assert!(info.is_err());

        let info = MessageInfo::parse(
            "$JS.ACK.hub.acctHash.extra.ORDERS.processor.2.100.90.1700000000000000000.0",
        )
        .unwrap();
        assert_eq!(info.stream, "ORDERS");
        assert_eq!(info.stream_sequence, 100);
    }

    #[test]
    fn test_parse_rejects_foreign_subjects() {
        assert!(MessageInfo::parse("foo.bar").is_err());
        assert!(MessageInfo::parse("$JS.API.STREAM.INFO.X").is_err());
        assert!(MessageInfo::parse("$JS.ACK.ORDERS.c.notanumber.1.1.1.1").is_err());
    }
}

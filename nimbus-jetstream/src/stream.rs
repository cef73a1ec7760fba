//! Stream configuration records and the stream facade.

use crate::api::{validate_name, Context};
use crate::consumer::{Consumer, ConsumerConfig, ConsumerInfo};
use crate::error::Error;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How messages leave a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Age out by the configured limits only.
    #[default]
    Limits,
    /// Remove once every interested consumer has acknowledged.
    Interest,
    /// Remove on first acknowledgement.
    #[serde(rename = "workqueue")]
    WorkQueue,
}

/// Backing storage for a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// What happens when a limit is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscardPolicy {
    /// Drop the oldest messages.
    #[default]
    Old,
    /// Refuse new messages.
    New,
}

/// Stream configuration, serialized for the admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub storage: StorageType,
    #[serde(default = "default_replicas")]
    pub num_replicas: usize,
    /// -1 means unlimited.
    #[serde(default = "unlimited", rename = "max_msgs")]
    pub max_messages: i64,
    /// -1 means unlimited.
    #[serde(default = "unlimited")]
    pub max_bytes: i64,
    /// -1 means unlimited.
    #[serde(default = "unlimited")]
    pub max_consumers: i64,
    /// 0 means unlimited.
    #[serde(default, with = "crate::nanos")]
    pub max_age: Duration,
    /// -1 means unlimited.
    #[serde(default = "unlimited_msg_size")]
    pub max_msg_size: i32,
    #[serde(default)]
    pub discard: DiscardPolicy,
    #[serde(default, with = "crate::nanos", skip_serializing_if = "Duration::is_zero")]
    pub duplicate_window: Duration,
}

fn default_replicas() -> usize {
    1
}

fn unlimited() -> i64 {
    -1
}

fn unlimited_msg_size() -> i32 {
    -1
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            subjects: Vec::new(),
            retention: RetentionPolicy::default(),
            storage: StorageType::default(),
            num_replicas: 1,
            max_messages: -1,
            max_bytes: -1,
            max_consumers: -1,
            max_age: Duration::ZERO,
            max_msg_size: -1,
            discard: DiscardPolicy::default(),
            duplicate_window: Duration::ZERO,
        }
    }
}

/// Live counters reported with `STREAM.INFO`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamState {
    #[serde(default)]
    pub messages: u64,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub first_seq: u64,
    #[serde(default)]
    pub last_seq: u64,
    #[serde(default)]
    pub consumer_count: usize,
}

/// Stream metadata returned by the admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub state: StreamState,
}

/// A message read directly out of a stream.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub subject: String,
    pub sequence: u64,
    pub payload: Bytes,
    pub published: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawMessageResponse {
    message: RawMessageBody,
}

#[derive(Debug, Deserialize)]
struct RawMessageBody {
    subject: String,
    seq: u64,
    #[serde(default)]
    data: Option<String>,
    time: DateTime<Utc>,
}

impl TryFrom<RawMessageBody> for RawMessage {
    type Error = Error;

    fn try_from(body: RawMessageBody) -> Result<Self, Error> {
        let payload = match body.data {
            Some(data) => base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|e| Error::Usage(format!("undecodable message body: {e}")))?
                .into(),
            None => Bytes::new(),
        };
        Ok(RawMessage {
            subject: body.subject,
            sequence: body.seq,
            payload,
            published: body.time,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PurgeResponse {
    #[serde(default)]
    purged: u64,
}

#[derive(Debug, Deserialize)]
struct SuccessResponse {
    #[serde(default)]
    success: bool,
}

/// Facade over one stream: cached info plus the context handle.
#[derive(Debug, Clone)]
pub struct Stream {
    context: Context,
    info: StreamInfo,
}

impl Stream {
    pub(crate) fn new(context: Context, info: StreamInfo) -> Self {
        Self { context, info }
    }

    pub fn name(&self) -> &str {
        &self.info.config.name
    }

    /// Info as of the last API round trip.
    pub fn cached_info(&self) -> &StreamInfo {
        &self.info
    }

    /// Refreshes and returns the stream info.
    pub async fn info(&mut self) -> Result<&StreamInfo, Error> {
        self.info = self
            .context
            .request(
                &format!("STREAM.INFO.{}", self.name()),
                &serde_json::json!({}),
            )
            .await?;
        Ok(&self.info)
    }

    /// Removes all messages. Returns how many were purged.
    pub async fn purge(&self) -> Result<u64, Error> {
        let response: PurgeResponse = self
            .context
            .request(
                &format!("STREAM.PURGE.{}", self.name()),
                &serde_json::json!({}),
            )
            .await?;
        Ok(response.purged)
    }

    /// Removes messages on subjects matching `filter`.
    pub async fn purge_subject(&self, filter: impl AsRef<str>) -> Result<u64, Error> {
        let response: PurgeResponse = self
            .context
            .request(
                &format!("STREAM.PURGE.{}", self.name()),
                &serde_json::json!({ "filter": filter.as_ref() }),
            )
            .await?;
        Ok(response.purged)
    }

    /// Reads one message by stream sequence.
    pub async fn get_raw_message(&self, sequence: u64) -> Result<RawMessage, Error> {
        let response: RawMessageResponse = self
            .context
            .request(
                &format!("STREAM.MSG.GET.{}", self.name()),
                &serde_json::json!({ "seq": sequence }),
            )
            .await?;
        response.message.try_into()
    }

    /// Reads the newest message on `subject`.
    pub async fn get_last_raw_message_by_subject(
        &self,
        subject: impl AsRef<str>,
    ) -> Result<RawMessage, Error> {
        let response: RawMessageResponse = self
            .context
            .request(
                &format!("STREAM.MSG.GET.{}", self.name()),
                &serde_json::json!({ "last_by_subj": subject.as_ref() }),
            )
            .await?;
        response.message.try_into()
    }

    /// Erases one message by stream sequence.
    pub async fn delete_message(&self, sequence: u64) -> Result<bool, Error> {
        let response: SuccessResponse = self
            .context
            .request(
                &format!("STREAM.MSG.DELETE.{}", self.name()),
                &serde_json::json!({ "seq": sequence }),
            )
            .await?;
        Ok(response.success)
    }

    /// Asks the current stream leader to step down.
    pub async fn leader_stepdown(&self) -> Result<bool, Error> {
        let response: SuccessResponse = self
            .context
            .request(
                &format!("STREAM.LEADER.STEPDOWN.{}", self.name()),
                &serde_json::json!({}),
            )
            .await?;
        Ok(response.success)
    }

    /// Removes a peer from the stream's replica group.
    pub async fn peer_remove(&self, peer: impl AsRef<str>) -> Result<bool, Error> {
        let response: SuccessResponse = self
            .context
            .request(
                &format!("STREAM.PEER.REMOVE.{}", self.name()),
                &serde_json::json!({ "peer": peer.as_ref() }),
            )
            .await?;
        Ok(response.success)
    }

    /// Creates (or updates) a consumer on this stream.
    pub async fn create_consumer(&self, config: ConsumerConfig) -> Result<Consumer, Error> {
        self.context.create_consumer_on(self.name(), config).await
    }

    /// Looks up an existing consumer.
    pub async fn consumer(&self, name: impl AsRef<str>) -> Result<Consumer, Error> {
        let name = name.as_ref();
        validate_name(name, "consumer")?;
        let info = self.context.consumer_info(self.name(), name).await?;
        Ok(Consumer::new(self.context.clone(), info))
    }

    pub async fn consumer_info(&self, name: impl AsRef<str>) -> Result<ConsumerInfo, Error> {
        self.context.consumer_info(self.name(), name.as_ref()).await
    }

    pub async fn delete_consumer(&self, name: impl AsRef<str>) -> Result<bool, Error> {
        self.context.delete_consumer(self.name(), name.as_ref()).await
    }

    pub async fn list_consumers(&self) -> Result<Vec<ConsumerInfo>, Error> {
        self.context.list_consumers(self.name()).await
    }

    pub(crate) fn context(&self) -> &Context {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_config_defaults_serialize() {
        let config = StreamConfig {
            name: "ORDERS".into(),
            subjects: vec!["orders.>".into()],
            ..Default::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["name"], "ORDERS");
        assert_eq!(json["retention"], "limits");
        assert_eq!(json["storage"], "file");
        assert_eq!(json["max_msgs"], -1);
        assert_eq!(json["discard"], "old");
        // Zero-valued duplicate window is omitted.
        assert!(json.get("duplicate_window").is_none());
    }

    #[test]
    fn test_stream_info_decode() {
        let raw = r#"{
            "config": {"name":"ORDERS","subjects":["orders.>"],"retention":"workqueue",
                       "storage":"memory","num_replicas":3,"max_msgs":-1,"max_bytes":-1,
                       "max_consumers":-1,"max_age":0,"max_msg_size":-1,"discard":"new"},
            "created": "2025-11-03T12:00:00Z",
            "state": {"messages":42,"bytes":1337,"first_seq":1,"last_seq":42,"consumer_count":2}
        }"#;
        let info: StreamInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.config.retention, RetentionPolicy::WorkQueue);
        assert_eq!(info.config.storage, StorageType::Memory);
        assert_eq!(info.config.discard, DiscardPolicy::New);
        assert_eq!(info.state.messages, 42);
    }

    #[test]
    fn test_raw_message_base64_decode() {
        let body = RawMessageBody {
            subject: "orders.1".into(),
            seq: 7,
            data: Some(base64::engine::general_purpose::STANDARD.encode(b"payload")),
            time: Utc::now(),
        };
        let message: RawMessage = body.try_into().unwrap();
        assert_eq!(&message.payload[..], b"payload");
        assert_eq!(message.sequence, 7);
    }
}

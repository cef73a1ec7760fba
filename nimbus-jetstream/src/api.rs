//! Typed JSON request/response client for the broker's admin API.

use crate::consumer::{Consumer, ConsumerConfig, ConsumerInfo};
use crate::error::{ApiError, Error};
use crate::stream::{Stream, StreamConfig, StreamInfo};
use nimbus_client::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default subject prefix for the admin API.
pub const DEFAULT_API_PREFIX: &str = "$JS.API";

/// Entry point for stream-layer operations.
///
/// Cheap to clone; holds a [`Client`] handle, the API subject prefix and the
/// per-request timeout.
#[derive(Debug, Clone)]
pub struct Context {
    client: Client,
    prefix: String,
    timeout: Duration,
}

/// Every API response is either the expected payload or an `error` object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ApiResponse<T> {
    Err { error: ApiError },
    Ok(T),
}

#[derive(Debug, Serialize)]
struct PagedRequest {
    offset: usize,
}

#[derive(Debug, Deserialize)]
struct StreamListResponse {
    #[serde(default)]
    streams: Option<Vec<StreamInfo>>,
    #[serde(default)]
    total: usize,
}

#[derive(Debug, Deserialize)]
struct ConsumerListResponse {
    #[serde(default)]
    consumers: Option<Vec<ConsumerInfo>>,
    #[serde(default)]
    total: usize,
}

#[derive(Debug, Deserialize)]
struct SuccessResponse {
    #[serde(default)]
    success: bool,
}

#[derive(Debug, Serialize)]
struct CreateConsumerRequest<'a> {
    stream_name: &'a str,
    config: &'a ConsumerConfig,
}

impl Context {
    /// Creates a context with the default `$JS.API.` prefix.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            prefix: DEFAULT_API_PREFIX.to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Overrides the API subject prefix (e.g. for import/export setups).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The underlying connection.
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn api_subject(&self, suffix: &str) -> String {
        format!("{}.{}", self.prefix, suffix)
    }

    /// One JSON round trip; decodes the embedded error object if present.
    pub(crate) async fn request<T, B>(&self, suffix: &str, body: &B) -> Result<T, Error>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(body)?;
        let reply = self
            .client
            .request_with_timeout(self.api_subject(suffix), payload.into(), self.timeout)
            .await?;
        match serde_json::from_slice(&reply.payload)? {
            ApiResponse::Err { error } => Err(Error::Api(error)),
            ApiResponse::Ok(value) => Ok(value),
        }
    }

    /// Creates a stream and returns its facade.
    pub async fn create_stream(&self, config: StreamConfig) -> Result<Stream, Error> {
        validate_name(&config.name, "stream")?;
        let info: StreamInfo = self
            .request(&format!("STREAM.CREATE.{}", config.name), &config)
            .await?;
        Ok(Stream::new(self.clone(), info))
    }

    /// Looks up an existing stream.
    pub async fn get_stream(&self, name: impl AsRef<str>) -> Result<Stream, Error> {
        let name = name.as_ref();
        validate_name(name, "stream")?;
        let info: StreamInfo = self
            .request(&format!("STREAM.INFO.{name}"), &serde_json::json!({}))
            .await?;
        Ok(Stream::new(self.clone(), info))
    }

    /// Updates a stream's configuration in place.
    pub async fn update_stream(&self, config: StreamConfig) -> Result<StreamInfo, Error> {
        validate_name(&config.name, "stream")?;
        self.request(&format!("STREAM.UPDATE.{}", config.name), &config)
            .await
    }

    pub async fn delete_stream(&self, name: impl AsRef<str>) -> Result<bool, Error> {
        let name = name.as_ref();
        validate_name(name, "stream")?;
        let response: SuccessResponse = self
            .request(&format!("STREAM.DELETE.{name}"), &serde_json::json!({}))
            .await?;
        Ok(response.success)
    }

    /// Lists all streams, following the API's offset paging.
    pub async fn list_streams(&self) -> Result<Vec<StreamInfo>, Error> {
        let mut streams = Vec::new();
        loop {
            let page: StreamListResponse = self
                .request(
                    "STREAM.LIST",
                    &PagedRequest {
                        offset: streams.len(),
                    },
                )
                .await?;
            let batch = page.streams.unwrap_or_default();
            if batch.is_empty() {
                break;
            }
            streams.extend(batch);
            if streams.len() >= page.total {
                break;
            }
        }
        Ok(streams)
    }

    pub(crate) async fn create_consumer_on(
        &self,
        stream_name: &str,
        config: ConsumerConfig,
    ) -> Result<Consumer, Error> {
        let body = CreateConsumerRequest {
            stream_name,
            config: &config,
        };
        let suffix = match config.consumer_name() {
            Some(name) => {
                validate_name(name, "consumer")?;
                match config.filter_subject.as_deref() {
                    Some(filter) if filter != ">" => {
                        format!("CONSUMER.CREATE.{stream_name}.{name}.{filter}")
                    }
                    _ => format!("CONSUMER.CREATE.{stream_name}.{name}"),
                }
            }
            None => format!("CONSUMER.CREATE.{stream_name}"),
        };
        let info: ConsumerInfo = self.request(&suffix, &body).await?;
        Ok(Consumer::new(self.clone(), info))
    }

    pub(crate) async fn consumer_info(
        &self,
        stream_name: &str,
        consumer_name: &str,
    ) -> Result<ConsumerInfo, Error> {
        self.request(
            &format!("CONSUMER.INFO.{stream_name}.{consumer_name}"),
            &serde_json::json!({}),
        )
        .await
    }

    pub(crate) async fn delete_consumer(
        &self,
        stream_name: &str,
        consumer_name: &str,
    ) -> Result<bool, Error> {
        let response: SuccessResponse = self
            .request(
                &format!("CONSUMER.DELETE.{stream_name}.{consumer_name}"),
                &serde_json::json!({}),
            )
            .await?;
        Ok(response.success)
    }

    pub(crate) async fn list_consumers(
        &self,
        stream_name: &str,
    ) -> Result<Vec<ConsumerInfo>, Error> {
        let mut consumers = Vec::new();
        loop {
            let page: ConsumerListResponse = self
                .request(
                    &format!("CONSUMER.LIST.{stream_name}"),
                    &PagedRequest {
                        offset: consumers.len(),
                    },
                )
                .await?;
            let batch = page.consumers.unwrap_or_default();
            if batch.is_empty() {
                break;
            }
            consumers.extend(batch);
            if consumers.len() >= page.total {
                break;
            }
        }
        Ok(consumers)
    }
}

/// Stream and consumer names become subject tokens, so they must not contain
/// token or wildcard characters.
pub(crate) fn validate_name(name: &str, kind: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::Usage(format!("{kind} name cannot be empty")));
    }
    if name
        .chars()
        .any(|c| c == '.' || c == '*' || c == '>' || c == '/' || c == '\\' || c.is_whitespace())
    {
        return Err(Error::Usage(format!("invalid {kind} name: {name:?}")));
    }
    Ok(())
}

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_kinesis::error::DisplayErrorContext;
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::types::ShardIteratorType;
use thiserror::Error;
use tracing::{debug, info};

use crate::decode::WireRecord;

pub const DEFAULT_SHARD_ID: &str = "shardId-000000000000";
pub const DEFAULT_BATCH_LIMIT: i32 = 10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("failed to open an iterator on {stream}/{shard}: {message}")]
    IteratorError {
        stream: String,
        shard: String,
        message: String,
    },
    #[error("failed to fetch records from {stream}: {message}")]
    FetchError { stream: String, message: String },
    #[error("failed to publish to {stream}: {message}")]
    PublishError { stream: String, message: String },
}

/// Records returned by one fetch, with the cursor to resume from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamBatch {
    pub records: Vec<WireRecord>,
    pub next_cursor: Option<String>,
}

/// A message stream we read ride events from and publish predictions to.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Fetch the next batch of records. Without a cursor, reading starts at the tip of the stream.
    async fn fetch_batch(
        &self,
        stream: &str,
        cursor: Option<&str>,
    ) -> Result<StreamBatch, StreamError>;

    async fn publish(
        &self,
        stream: &str,
        payload: &str,
        partition_key: &str,
    ) -> Result<(), StreamError>;
}

/// `StreamClient` backed by Kinesis. Reads a single shard.
#[derive(Clone)]
pub struct KinesisStream {
    client: aws_sdk_kinesis::Client,
    shard_id: String,
    batch_limit: i32,
}

impl KinesisStream {
    pub fn new(client: aws_sdk_kinesis::Client, shard_id: &str, batch_limit: i32) -> Self {
        Self {
            client,
            shard_id: shard_id.to_owned(),
            batch_limit,
        }
    }

    /// Build a client from the ambient AWS configuration, optionally pointed at a custom endpoint.
    pub async fn from_env(endpoint: Option<&str>, shard_id: &str, batch_limit: i32) -> Self {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest());
        if let Some(endpoint) = endpoint {
            info!("using kinesis endpoint {}", endpoint);
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }
        let aws_config = aws_config_builder.load().await;

        Self::new(
            aws_sdk_kinesis::Client::new(&aws_config),
            shard_id,
            batch_limit,
        )
    }

    async fn open_iterator(&self, stream: &str) -> Result<String, StreamError> {
        let iterator_error = |message: String| StreamError::IteratorError {
            stream: stream.to_owned(),
            shard: self.shard_id.clone(),
            message,
        };

        let output = self
            .client
            .get_shard_iterator()
            .stream_name(stream)
            .shard_id(&self.shard_id)
            .shard_iterator_type(ShardIteratorType::Latest)
            .send()
            .await
            .map_err(|e| iterator_error(DisplayErrorContext(&e).to_string()))?;

        output
            .shard_iterator()
            .map(ToOwned::to_owned)
            .ok_or_else(|| iterator_error("no shard iterator returned".to_owned()))
    }
}

#[async_trait]
impl StreamClient for KinesisStream {
    async fn fetch_batch(
        &self,
        stream: &str,
        cursor: Option<&str>,
    ) -> Result<StreamBatch, StreamError> {
        let iterator = match cursor {
            Some(cursor) => cursor.to_owned(),
            None => self.open_iterator(stream).await?,
        };

        let output = self
            .client
            .get_records()
            .shard_iterator(iterator)
            .limit(self.batch_limit)
            .send()
            .await
            .map_err(|e| StreamError::FetchError {
                stream: stream.to_owned(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        // Bytes are passed on untouched, decoding happens per record in the service.
        let records: Vec<WireRecord> = output
            .records()
            .iter()
            .map(|record| WireRecord::from_bytes(record.data().as_ref()))
            .collect();
        debug!("fetched {} records from {}", records.len(), stream);

        Ok(StreamBatch {
            records,
            next_cursor: output.next_shard_iterator().map(ToOwned::to_owned),
        })
    }

    async fn publish(
        &self,
        stream: &str,
        payload: &str,
        partition_key: &str,
    ) -> Result<(), StreamError> {
        self.client
            .put_record()
            .stream_name(stream)
            .data(Blob::new(payload.as_bytes()))
            .partition_key(partition_key)
            .send()
            .await
            .map_err(|e| StreamError::PublishError {
                stream: stream.to_owned(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(())
    }
}

/// A record published through a `MockStream`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedRecord {
    pub stream: String,
    pub payload: String,
    pub partition_key: String,
}

#[derive(Default)]
struct MockStreamState {
    fetches: VecDeque<Result<Vec<WireRecord>, StreamError>>,
    cursors_seen: Vec<Option<String>>,
    published: Vec<PublishedRecord>,
    publish_error: Option<StreamError>,
}

/// In-memory `StreamClient` for tests. Clones share their state.
///
/// Fetches return the scripted batches in order, then empty batches forever. Every fetch hands
/// out a fresh cursor, `cursor-<n>`.
#[derive(Clone, Default)]
pub struct MockStream {
    state: Arc<Mutex<MockStreamState>>,
}

impl MockStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch(self, records: Vec<WireRecord>) -> Self {
        self.lock().fetches.push_back(Ok(records));
        self
    }

    pub fn with_fetch_error(self, error: StreamError) -> Self {
        self.lock().fetches.push_back(Err(error));
        self
    }

    pub fn with_publish_error(self, error: StreamError) -> Self {
        self.lock().publish_error = Some(error);
        self
    }

    /// The cursor passed to each fetch so far, in order.
    pub fn cursors_seen(&self) -> Vec<Option<String>> {
        self.lock().cursors_seen.clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.lock().cursors_seen.len()
    }

    pub fn published(&self) -> Vec<PublishedRecord> {
        self.lock().published.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockStreamState> {
        self.state.lock().expect("poisoned MockStream mutex")
    }
}

#[async_trait]
impl StreamClient for MockStream {
    async fn fetch_batch(
        &self,
        _stream: &str,
        cursor: Option<&str>,
    ) -> Result<StreamBatch, StreamError> {
        let mut state = self.lock();
        state.cursors_seen.push(cursor.map(ToOwned::to_owned));
        let next_cursor = Some(format!("cursor-{}", state.cursors_seen.len()));

        match state.fetches.pop_front() {
            Some(Ok(records)) => Ok(StreamBatch {
                records,
                next_cursor,
            }),
            Some(Err(e)) => Err(e),
            None => Ok(StreamBatch {
                records: vec![],
                next_cursor,
            }),
        }
    }

    async fn publish(
        &self,
        stream: &str,
        payload: &str,
        partition_key: &str,
    ) -> Result<(), StreamError> {
        let mut state = self.lock();
        if let Some(error) = &state.publish_error {
            return Err(error.clone());
        }

        state.published.push(PublishedRecord {
            stream: stream.to_owned(),
            payload: payload.to_owned(),
            partition_key: partition_key.to_owned(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_stream_scripted_fetches() {
        let stream = MockStream::new()
            .with_batch(vec![WireRecord::raw("{}")])
            .with_fetch_error(StreamError::FetchError {
                stream: "ride-events".to_owned(),
                message: "throttled".to_owned(),
            });

        let first = stream.fetch_batch("ride-events", None).await.unwrap();
        assert_eq!(first.records.len(), 1);
        assert_eq!(first.next_cursor.as_deref(), Some("cursor-1"));

        assert!(stream.fetch_batch("ride-events", Some("cursor-1")).await.is_err());

        let third = stream.fetch_batch("ride-events", Some("cursor-1")).await.unwrap();
        assert!(third.records.is_empty());
        assert_eq!(third.next_cursor.as_deref(), Some("cursor-3"));

        assert_eq!(
            stream.cursors_seen(),
            vec![None, Some("cursor-1".to_owned()), Some("cursor-1".to_owned())]
        );
    }

    #[tokio::test]
    async fn test_mock_stream_publish() {
        let stream = MockStream::new();
        let clone = stream.clone();

        clone
            .publish("ride_predictions", r#"{"a": 1}"#, "ride-1")
            .await
            .unwrap();

        assert_eq!(
            stream.published(),
            vec![PublishedRecord {
                stream: "ride_predictions".to_owned(),
                payload: r#"{"a": 1}"#.to_owned(),
                partition_key: "ride-1".to_owned(),
            }]
        );

        let failing = MockStream::new().with_publish_error(StreamError::PublishError {
            stream: "ride_predictions".to_owned(),
            message: "unavailable".to_owned(),
        });
        assert!(failing.publish("ride_predictions", "{}", "1").await.is_err());
        assert!(failing.published().is_empty());
    }
}

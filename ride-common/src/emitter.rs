use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::events::PredictionEvent;
use crate::stream::{StreamClient, StreamError};

#[derive(Error, Debug)]
pub enum EmitError {
    #[error("failed to serialize prediction: {0}")]
    SerializeError(#[from] serde_json::Error),
    #[error(transparent)]
    StreamError(#[from] StreamError),
}

/// A destination for prediction events.
#[async_trait]
pub trait PredictionSink: Send + Sync {
    async fn send(&self, event: &PredictionEvent) -> Result<(), EmitError>;
}

/// Publishes predictions to an output stream, keyed by ride id.
pub struct StreamSink {
    client: Arc<dyn StreamClient>,
    stream: String,
}

impl StreamSink {
    pub fn new(client: Arc<dyn StreamClient>, stream: &str) -> Self {
        Self {
            client,
            stream: stream.to_owned(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }
}

#[async_trait]
impl PredictionSink for StreamSink {
    async fn send(&self, event: &PredictionEvent) -> Result<(), EmitError> {
        let payload = serde_json::to_string(event)?;
        self.client
            .publish(&self.stream, &payload, &event.partition_key())
            .await?;

        info!(
            "sent prediction for ride {} to {}",
            event.ride_id(),
            self.stream
        );
        Ok(())
    }
}

/// Logs predictions instead of publishing them. Used in test runs.
pub struct LogSink {
    stream: String,
}

impl LogSink {
    pub fn new(stream: &str) -> Self {
        Self {
            stream: stream.to_owned(),
        }
    }
}

#[async_trait]
impl PredictionSink for LogSink {
    async fn send(&self, event: &PredictionEvent) -> Result<(), EmitError> {
        let payload = serde_json::to_string(event)?;
        info!(
            "TEST_RUN: would send prediction for ride {} to {}: {}",
            event.ride_id(),
            self.stream,
            payload
        );
        Ok(())
    }
}

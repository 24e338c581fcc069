use std::future::Future;
use std::sync::Arc;
use std::time;

use ride_common::events::PredictionEvent;
use ride_common::health::HealthHandle;
use ride_common::service::ModelService;
use ride_common::stream::StreamClient;
use tracing::{error, info};

use crate::error::ConsumerError;

pub const DEFAULT_EMPTY_POLL_INTERVAL: time::Duration = time::Duration::from_secs(1);
pub const DEFAULT_ERROR_BACKOFF: time::Duration = time::Duration::from_secs(5);

/// What a single poll of the input stream found.
#[derive(Debug, PartialEq)]
pub enum PollOutcome {
    Empty,
    Processed(Vec<PredictionEvent>),
}

/// Pulls batches of ride events from a stream and runs them through a `ModelService`.
pub struct StreamConsumer {
    client: Arc<dyn StreamClient>,
    service: Arc<ModelService>,
    /// The stream we read ride events from.
    stream: String,
    /// Where the next fetch resumes. `None` opens a fresh iterator at the tip of the stream.
    cursor: Option<String>,
    empty_poll_interval: time::Duration,
    error_backoff: time::Duration,
    liveness: HealthHandle,
}

impl StreamConsumer {
    pub fn new(
        client: Arc<dyn StreamClient>,
        service: Arc<ModelService>,
        stream: &str,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            client,
            service,
            stream: stream.to_owned(),
            cursor: None,
            empty_poll_interval: DEFAULT_EMPTY_POLL_INTERVAL,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            liveness,
        }
    }

    pub fn empty_poll_interval(mut self, interval: time::Duration) -> Self {
        self.empty_poll_interval = interval;
        self
    }

    pub fn error_backoff(mut self, backoff: time::Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Fetch the next batch and process every record in it.
    pub async fn poll(&mut self) -> Result<PollOutcome, ConsumerError> {
        let batch = self
            .client
            .fetch_batch(&self.stream, self.cursor.as_deref())
            .await?;
        self.cursor = batch.next_cursor;

        if batch.records.is_empty() {
            return Ok(PollOutcome::Empty);
        }

        info!("processing {} records", batch.records.len());
        let predictions = self.service.handle_batch(&batch.records).await;
        Ok(PollOutcome::Processed(predictions))
    }

    /// Poll until `shutdown` resolves.
    ///
    /// Empty polls wait `empty_poll_interval` before the next fetch. Failed polls are logged and
    /// wait `error_backoff`, then resume from a fresh iterator.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        info!("starting stream consumer on {}", self.stream);

        loop {
            self.liveness.report_healthy();

            let outcome = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                outcome = self.poll() => outcome,
            };

            let pause = match outcome {
                Ok(PollOutcome::Processed(_)) => continue,
                Ok(PollOutcome::Empty) => self.empty_poll_interval,
                Err(e) => {
                    error!("stream consumer error, retrying in {:?}: {}", self.error_backoff, e);
                    metrics::counter!("ride_consumer_fetch_errors_total").increment(1);
                    self.cursor = None;
                    self.error_backoff
                }
            };

            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("stream consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose, Engine as _};
    use ride_common::decode::{KinesisData, WireRecord};
    use ride_common::emitter::StreamSink;
    use ride_common::events::RideId;
    use ride_common::health::HealthRegistry;
    use ride_common::predictor::{ConstantModel, FallbackPolicy, Predictor};
    use ride_common::stream::{MockStream, StreamError};

    fn ride(ride_id: &str) -> WireRecord {
        let body = format!(
            r#"{{"ride": {{"PULocationID": 161, "DOLocationID": 236, "trip_distance": 3.5}}, "ride_id": "{}"}}"#,
            ride_id
        );
        WireRecord::Kinesis {
            kinesis: KinesisData {
                data: general_purpose::STANDARD.encode(body),
            },
        }
    }

    fn consumer(stream: &MockStream) -> StreamConsumer {
        let client: Arc<dyn StreamClient> = Arc::new(stream.clone());
        let service = ModelService::new(
            Predictor::raw(ConstantModel { value: 21.3 }, FallbackPolicy::DistanceHeuristic),
            Some("test-v1".to_owned()),
        )
        .with_sink(StreamSink::new(client.clone(), "ride_predictions"));
        let liveness = HealthRegistry::new("liveness")
            .register("stream_consumer", ::time::Duration::seconds(30));

        StreamConsumer::new(client, Arc::new(service), "ride-events", liveness)
    }

    fn fetch_error() -> StreamError {
        StreamError::FetchError {
            stream: "ride-events".to_owned(),
            message: "ProvisionedThroughputExceededException".to_owned(),
        }
    }

    #[tokio::test]
    async fn test_poll_processes_batch_and_advances_cursor() {
        let stream = MockStream::new().with_batch(vec![ride("a"), WireRecord::raw("{"), ride("b")]);
        let mut consumer = consumer(&stream);

        let predictions = match consumer.poll().await.unwrap() {
            PollOutcome::Processed(predictions) => predictions,
            PollOutcome::Empty => panic!("expected a processed batch"),
        };
        let ids: Vec<&RideId> = predictions.iter().map(|p| p.ride_id()).collect();
        assert_eq!(ids, vec![&RideId::from("a"), &RideId::from("b")]);
        assert_eq!(consumer.cursor(), Some("cursor-1"));
        assert_eq!(stream.published().len(), 2);

        assert_eq!(consumer.poll().await.unwrap(), PollOutcome::Empty);
        assert_eq!(stream.cursors_seen(), vec![None, Some("cursor-1".to_owned())]);
        assert_eq!(consumer.cursor(), Some("cursor-2"));
    }

    #[tokio::test]
    async fn test_poll_skips_records_that_are_not_utf8() {
        let mut corrupted =
            br#"{"ride": {"PULocationID": 161, "DOLocationID": 236, "trip_distance": 3.5}, "ride_id": "ab"#
                .to_vec();
        corrupted.extend_from_slice(b"\xffcd\"}");
        let valid = br#"{"ride": {"PULocationID": 1, "DOLocationID": 2, "trip_distance": 1.0}, "ride_id": "ok"}"#;
        let stream = MockStream::new().with_batch(vec![
            WireRecord::from_bytes(&corrupted),
            WireRecord::from_bytes(valid),
        ]);
        let mut consumer = consumer(&stream);

        let predictions = match consumer.poll().await.unwrap() {
            PollOutcome::Processed(predictions) => predictions,
            PollOutcome::Empty => panic!("expected a processed batch"),
        };

        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].ride_id(), &RideId::from("ok"));
        let keys: Vec<String> = stream
            .published()
            .into_iter()
            .map(|record| record.partition_key)
            .collect();
        assert_eq!(keys, vec!["ok"]);
    }

    #[tokio::test]
    async fn test_poll_surfaces_fetch_errors() {
        let stream = MockStream::new().with_fetch_error(fetch_error());
        let mut consumer = consumer(&stream);

        assert!(matches!(
            consumer.poll().await,
            Err(ConsumerError::FetchError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_poll_sleeps_before_next_fetch() {
        let stream = MockStream::new();

        consumer(&stream)
            .run(tokio::time::sleep(time::Duration::from_millis(999)))
            .await;
        assert_eq!(stream.fetch_count(), 1);

        let stream = MockStream::new();
        consumer(&stream)
            .run(tokio::time::sleep(time::Duration::from_millis(1500)))
            .await;
        assert_eq!(stream.fetch_count(), 2);
        assert!(stream.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_processed_batch_fetches_again_immediately() {
        let stream = MockStream::new().with_batch(vec![ride("a")]);

        consumer(&stream)
            .run(tokio::time::sleep(time::Duration::from_millis(500)))
            .await;

        assert_eq!(stream.cursors_seen(), vec![None, Some("cursor-1".to_owned())]);
        assert_eq!(stream.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_error_backs_off_and_resumes() {
        let stream = MockStream::new()
            .with_fetch_error(fetch_error())
            .with_batch(vec![ride("after_error")]);

        consumer(&stream)
            .run(tokio::time::sleep(time::Duration::from_millis(4900)))
            .await;
        assert_eq!(stream.fetch_count(), 1);

        let stream = MockStream::new()
            .with_batch(vec![ride("before_error")])
            .with_fetch_error(fetch_error())
            .with_batch(vec![ride("after_error")]);

        consumer(&stream)
            .run(tokio::time::sleep(time::Duration::from_millis(5100)))
            .await;

        // The failed fetch drops the cursor, so the retry opens a fresh iterator.
        assert_eq!(
            stream.cursors_seen(),
            vec![None, Some("cursor-1".to_owned()), None, Some("cursor-3".to_owned())]
        );
        let keys: Vec<String> = stream
            .published()
            .into_iter()
            .map(|record| record.partition_key)
            .collect();
        assert_eq!(keys, vec!["before_error", "after_error"]);
    }
}

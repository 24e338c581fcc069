use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use crate::decode::{decode_record, DecodeError, WireRecord};
use crate::emitter::PredictionSink;
use crate::events::PredictionEvent;
use crate::features::{FeatureError, FeatureSet};
use crate::predictor::Predictor;

/// Why a record was left out of a batch.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("record does not match any known shape: {0}")]
    UnknownShape(serde_json::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Features(#[from] FeatureError),
}

impl RecordError {
    /// Label used for the skipped records metric.
    pub fn reason(&self) -> &'static str {
        match self {
            RecordError::UnknownShape(_) => "shape",
            RecordError::Decode(_) => "decode",
            RecordError::Features(_) => "features",
        }
    }
}

/// A batch pushed to us by an event source.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InvocationEvent {
    /// Kept loosely typed so one unrecognized record doesn't reject the whole batch.
    #[serde(rename = "Records", default)]
    pub records: Vec<Value>,
}

impl InvocationEvent {
    pub fn from_records(records: &[WireRecord]) -> Result<Self, serde_json::Error> {
        Ok(Self {
            records: records
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<_, _>>()?,
        })
    }
}

/// How batch results are wrapped when returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseShape {
    #[default]
    Predictions,
    Envelope,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseResponseShapeError(String);

impl fmt::Display for ParseResponseShapeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} is not a valid response shape", self.0)
    }
}

impl FromStr for ResponseShape {
    type Err = ParseResponseShapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_ref() {
            "predictions" => Ok(ResponseShape::Predictions),
            "envelope" => Ok(ResponseShape::Envelope),
            invalid => Err(ParseResponseShapeError(invalid.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchResponse {
    Envelope {
        #[serde(rename = "statusCode")]
        status_code: u16,
        body: Vec<PredictionEvent>,
    },
    Predictions {
        predictions: Vec<PredictionEvent>,
    },
}

impl BatchResponse {
    pub fn new(shape: ResponseShape, predictions: Vec<PredictionEvent>) -> Self {
        match shape {
            ResponseShape::Predictions => BatchResponse::Predictions { predictions },
            ResponseShape::Envelope => BatchResponse::Envelope {
                status_code: 200,
                body: predictions,
            },
        }
    }

    pub fn predictions(&self) -> &[PredictionEvent] {
        match self {
            BatchResponse::Predictions { predictions } => predictions,
            BatchResponse::Envelope { body, .. } => body,
        }
    }
}

/// Turns inbound ride records into prediction events and hands them to the configured sinks.
///
/// Built once at startup and shared by every invocation.
pub struct ModelService {
    predictor: Predictor,
    version: Option<String>,
    feature_set: FeatureSet,
    response_shape: ResponseShape,
    sinks: Vec<Box<dyn PredictionSink>>,
}

impl ModelService {
    pub fn new(predictor: Predictor, version: Option<String>) -> Self {
        Self {
            predictor,
            version,
            feature_set: FeatureSet::default(),
            response_shape: ResponseShape::default(),
            sinks: vec![],
        }
    }

    pub fn with_feature_set(mut self, feature_set: FeatureSet) -> Self {
        self.feature_set = feature_set;
        self
    }

    pub fn with_response_shape(mut self, response_shape: ResponseShape) -> Self {
        self.response_shape = response_shape;
        self
    }

    pub fn with_sink(mut self, sink: impl PredictionSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn predictor(&self) -> &Predictor {
        &self.predictor
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Decode, featurize and predict a single record, then emit the result.
    ///
    /// Prediction failures never surface here: the predictor substitutes its fallback. Emit
    /// failures are logged and don't affect the returned event.
    pub async fn process_record(&self, record: &WireRecord) -> Result<PredictionEvent, RecordError> {
        let event = decode_record(record)?;
        let features = self.feature_set.prepare(&event.ride)?;
        let duration = self.predictor.predict(&features);

        let prediction = PredictionEvent::new(self.version(), event.ride_id, duration);
        debug!(
            "predicted {} minutes for ride {}",
            duration,
            prediction.ride_id()
        );
        self.emit(&prediction).await;

        metrics::counter!("ride_predictions_total").increment(1);
        Ok(prediction)
    }

    /// Process records in order, leaving out the ones that can't be decoded or featurized.
    pub async fn handle_batch(&self, records: &[WireRecord]) -> Vec<PredictionEvent> {
        let start = Instant::now();
        metrics::histogram!("ride_batch_size").record(records.len() as f64);

        let mut predictions = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            match self.process_record(record).await {
                Ok(prediction) => predictions.push(prediction),
                Err(e) => skip(index, &e),
            }
        }

        metrics::histogram!("ride_batch_processing_duration_seconds")
            .record(start.elapsed().as_secs_f64());
        predictions
    }

    /// Handle a pushed batch, shaping the response as configured.
    pub async fn handle_event(&self, event: &InvocationEvent) -> BatchResponse {
        let mut records = Vec::with_capacity(event.records.len());
        for (index, record) in event.records.iter().enumerate() {
            match serde_json::from_value::<WireRecord>(record.clone()) {
                Ok(record) => records.push(record),
                Err(e) => skip(index, &RecordError::UnknownShape(e)),
            }
        }

        BatchResponse::new(self.response_shape, self.handle_batch(&records).await)
    }

    async fn emit(&self, prediction: &PredictionEvent) {
        for sink in &self.sinks {
            if let Err(e) = sink.send(prediction).await {
                error!(
                    "failed to emit prediction for ride {}: {}",
                    prediction.ride_id(),
                    e
                );
                metrics::counter!("ride_emit_failures_total").increment(1);
            }
        }
    }
}

fn skip(index: usize, e: &RecordError) {
    error!("skipping record {}: {}", index, e);
    metrics::counter!("ride_records_skipped_total", "reason" => e.reason()).increment(1);
}

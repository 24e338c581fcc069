use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name stamped on every prediction event we produce.
pub const MODEL_NAME: &str = "ride_duration_prediction_model";

/// Placeholder id for flattened ride bodies that carry no `ride_id`.
pub const UNKNOWN_RIDE_ID: &str = "unknown";

/// Identifier of a ride as sent by producers.
///
/// Producers send either strings or integers, and we echo back whichever we got, so both shapes
/// are kept as they are instead of being coerced into a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RideId {
    Number(i64),
    Text(String),
}

impl Default for RideId {
    fn default() -> Self {
        RideId::Text(UNKNOWN_RIDE_ID.to_owned())
    }
}

impl fmt::Display for RideId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RideId::Number(n) => write!(f, "{}", n),
            RideId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for RideId {
    fn from(value: &str) -> Self {
        RideId::Text(value.to_owned())
    }
}

impl From<String> for RideId {
    fn from(value: String) -> Self {
        RideId::Text(value)
    }
}

impl From<i64> for RideId {
    fn from(value: i64) -> Self {
        RideId::Number(value)
    }
}

/// A single taxi trip as described by producers of the ride events stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    #[serde(rename = "PULocationID")]
    pub pu_location_id: i64,
    #[serde(rename = "DOLocationID")]
    pub do_location_id: i64,
    pub trip_distance: f64,
}

/// A decoded inbound event.
///
/// The ride is kept as the raw JSON object it arrived as: checking that the required fields are
/// there is the job of feature preparation, which reports exactly which one is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideEvent {
    pub ride_id: RideId,
    pub ride: Map<String, Value>,
}

impl RideEvent {
    pub fn new(ride_id: impl Into<RideId>, ride: &Ride) -> Self {
        let ride = match serde_json::to_value(ride) {
            Ok(Value::Object(map)) => map,
            // A struct of plain numbers always serializes to an object.
            _ => Map::new(),
        };

        Self {
            ride_id: ride_id.into(),
            ride,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub ride_duration: f64,
    pub ride_id: RideId,
}

/// The event we return to callers and forward to the predictions stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionEvent {
    pub model: String,
    pub version: Option<String>,
    pub prediction: Prediction,
}

impl PredictionEvent {
    pub fn new(version: Option<&str>, ride_id: RideId, ride_duration: f64) -> Self {
        Self {
            model: MODEL_NAME.to_owned(),
            version: version.map(ToOwned::to_owned),
            prediction: Prediction {
                ride_duration,
                ride_id,
            },
        }
    }

    pub fn ride_id(&self) -> &RideId {
        &self.prediction.ride_id
    }

    /// Partition key used when publishing this event: the ride id in string form.
    pub fn partition_key(&self) -> String {
        self.prediction.ride_id.to_string()
    }
}

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::events::{RideEvent, RideId};

/// Enumeration of errors for records we could not turn into a `RideEvent`.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("record data is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("record data is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("record data is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("ride event must be a JSON object")]
    NotAnObject,
    #[error("ride event field 'ride' must be a JSON object")]
    RideNotAnObject,
    #[error("ride event is missing required field 'ride_id'")]
    MissingRideId,
    #[error("{0} is not a valid ride_id")]
    InvalidRideId(String),
}

/// Payload of a record as delivered by a Kinesis event source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KinesisData {
    /// Base64 encoded JSON body.
    pub data: String,
}

/// One inbound record, in either of the shapes we accept.
///
/// Any additional keys a record carries (event source metadata, sequence numbers...) are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireRecord {
    Kinesis { kinesis: KinesisData },
    Raw {
        #[serde(rename = "Data")]
        data: String,
    },
}

impl WireRecord {
    /// Wrap an already decoded JSON body, as read straight off a stream.
    pub fn raw(data: impl Into<String>) -> Self {
        WireRecord::Raw { data: data.into() }
    }

    /// Wrap record bytes as read off a stream. The bytes are kept as they are, so that a body
    /// that isn't valid UTF-8 fails to decode instead of being patched up.
    pub fn from_bytes(data: &[u8]) -> Self {
        WireRecord::Kinesis {
            kinesis: KinesisData {
                data: general_purpose::STANDARD.encode(data),
            },
        }
    }

    fn body(&self) -> Result<Vec<u8>, DecodeError> {
        match self {
            WireRecord::Kinesis { kinesis } => Ok(general_purpose::STANDARD.decode(&kinesis.data)?),
            WireRecord::Raw { data } => Ok(data.as_bytes().to_vec()),
        }
    }
}

/// Decode a transport record into a `RideEvent`.
pub fn decode_record(record: &WireRecord) -> Result<RideEvent, DecodeError> {
    let body = String::from_utf8(record.body()?)?;
    decode_body(&body)
}

/// Parse a JSON ride event body.
///
/// Accepts `{"ride": {...}, "ride_id": ...}`, or a flattened ride object whose `ride_id` defaults
/// to `"unknown"` when absent.
pub fn decode_body(body: &str) -> Result<RideEvent, DecodeError> {
    let mut event = match serde_json::from_str::<Value>(body)? {
        Value::Object(map) => map,
        _ => return Err(DecodeError::NotAnObject),
    };

    match event.remove("ride") {
        Some(Value::Object(ride)) => match event.remove("ride_id") {
            None | Some(Value::Null) => Err(DecodeError::MissingRideId),
            Some(ride_id) => Ok(RideEvent {
                ride_id: parse_ride_id(ride_id)?,
                ride,
            }),
        },
        Some(_) => Err(DecodeError::RideNotAnObject),
        None => {
            let ride_id = match event.get("ride_id") {
                None | Some(Value::Null) => RideId::default(),
                Some(value) => parse_ride_id(value.clone())?,
            };
            Ok(RideEvent {
                ride_id,
                ride: event,
            })
        }
    }
}

/// Encode a `RideEvent` as a Kinesis style record.
pub fn encode_record(event: &RideEvent) -> Result<WireRecord, DecodeError> {
    let body = serde_json::to_vec(event)?;
    Ok(WireRecord::Kinesis {
        kinesis: KinesisData {
            data: general_purpose::STANDARD.encode(body),
        },
    })
}

fn parse_ride_id(value: Value) -> Result<RideId, DecodeError> {
    let display = value.to_string();
    serde_json::from_value(value).map_err(|_| DecodeError::InvalidRideId(display))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Ride;
    use serde_json::json;

    fn kinesis(body: &str) -> WireRecord {
        WireRecord::Kinesis {
            kinesis: KinesisData {
                data: general_purpose::STANDARD.encode(body),
            },
        }
    }

    #[test]
    fn test_decode_kinesis_record() {
        let record = kinesis(
            r#"{"ride": {"PULocationID": 161, "DOLocationID": 236, "trip_distance": 3.5}, "ride_id": "test_ride_123"}"#,
        );

        let event = decode_record(&record).unwrap();

        assert_eq!(event.ride_id, RideId::Text("test_ride_123".to_owned()));
        assert_eq!(event.ride["PULocationID"], json!(161));
        assert_eq!(event.ride["trip_distance"], json!(3.5));
    }

    #[test]
    fn test_decode_raw_record() {
        let record = WireRecord::raw(
            r#"{"ride": {"PULocationID": 43, "DOLocationID": 151, "trip_distance": 1.2}, "ride_id": 256}"#,
        );

        let event = decode_record(&record).unwrap();

        assert_eq!(event.ride_id, RideId::Number(256));
        assert_eq!(event.ride["DOLocationID"], json!(151));
    }

    #[test]
    fn test_decode_flattened_ride() {
        let event =
            decode_body(r#"{"PULocationID": 1, "DOLocationID": 2, "trip_distance": 0.5}"#).unwrap();
        assert_eq!(event.ride_id, RideId::Text("unknown".to_owned()));
        assert_eq!(event.ride["PULocationID"], json!(1));

        let event = decode_body(
            r#"{"PULocationID": 1, "DOLocationID": 2, "trip_distance": 0.5, "ride_id": "flat"}"#,
        )
        .unwrap();
        assert_eq!(event.ride_id, RideId::Text("flat".to_owned()));
    }

    #[test]
    fn test_record_shapes_deserialize() {
        let records: Vec<WireRecord> = serde_json::from_value(json!([
            {"kinesis": {"data": "e30=", "partitionKey": "1"}, "eventSource": "aws:kinesis"},
            {"Data": "{}"}
        ]))
        .unwrap();

        assert!(matches!(records[0], WireRecord::Kinesis { .. }));
        assert!(matches!(records[1], WireRecord::Raw { .. }));
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            decode_record(&WireRecord::Kinesis {
                kinesis: KinesisData {
                    data: "not base64!".to_owned()
                }
            }),
            Err(DecodeError::Base64(_))
        ));
        assert!(matches!(
            decode_record(&kinesis("not json")),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            decode_record(&WireRecord::raw("[1, 2]")),
            Err(DecodeError::NotAnObject)
        ));
        assert!(matches!(
            decode_body(r#"{"ride": 3, "ride_id": "x"}"#),
            Err(DecodeError::RideNotAnObject)
        ));
        assert!(matches!(
            decode_body(r#"{"ride": {}}"#),
            Err(DecodeError::MissingRideId)
        ));
        assert!(matches!(
            decode_body(r#"{"ride": {}, "ride_id": [1]}"#),
            Err(DecodeError::InvalidRideId(_))
        ));
    }

    #[test]
    fn test_null_ride_id() {
        let event = decode_body(
            r#"{"PULocationID": 1, "DOLocationID": 2, "trip_distance": 0.5, "ride_id": null}"#,
        )
        .unwrap();
        assert_eq!(event.ride_id, RideId::default());

        assert!(matches!(
            decode_body(r#"{"ride": {}, "ride_id": null}"#),
            Err(DecodeError::MissingRideId)
        ));
    }

    #[test]
    fn test_record_from_bytes() {
        let body = br#"{"ride": {"PULocationID": 1, "DOLocationID": 2, "trip_distance": 0.5}, "ride_id": "ab"}"#;
        let event = decode_record(&WireRecord::from_bytes(body)).unwrap();
        assert_eq!(event.ride_id, RideId::from("ab"));

        let mut corrupted = br#"{"ride": {}, "ride_id": "ab"#.to_vec();
        corrupted.extend_from_slice(b"\xffcd\"}");
        assert!(matches!(
            decode_record(&WireRecord::from_bytes(&corrupted)),
            Err(DecodeError::Utf8(_))
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let record = WireRecord::Kinesis {
            kinesis: KinesisData {
                data: general_purpose::STANDARD.encode([0u8, 159, 146, 150]),
            },
        };

        assert!(matches!(decode_record(&record), Err(DecodeError::Utf8(_))));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let ride = Ride {
            pu_location_id: 161,
            do_location_id: 236,
            trip_distance: 3.5,
        };
        for ride_id in [RideId::from("test_ride_001"), RideId::from(256)] {
            let event = RideEvent::new(ride_id, &ride);

            let decoded = decode_record(&encode_record(&event).unwrap()).unwrap();

            assert_eq!(decoded, event);
        }
    }
}

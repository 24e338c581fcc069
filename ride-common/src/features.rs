use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::events::Ride;

const PU_LOCATION_ID: &str = "PULocationID";
const DO_LOCATION_ID: &str = "DOLocationID";
const TRIP_DISTANCE: &str = "trip_distance";
const PU_DO: &str = "PU_DO";

/// Enumeration of errors raised while turning a ride into model features.
#[derive(Error, Debug, PartialEq)]
pub enum FeatureError {
    #[error("ride is missing required field {0}")]
    MissingField(&'static str),
    #[error("ride field {field} is not a valid {expected}: {value}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// The flat features fed to the regression model for one ride.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureMap {
    #[serde(rename = "PU_DO")]
    pub pu_do: String,
    pub trip_distance: f64,
    #[serde(rename = "PULocationID", skip_serializing_if = "Option::is_none")]
    pub pu_location_id: Option<i64>,
    #[serde(rename = "DOLocationID", skip_serializing_if = "Option::is_none")]
    pub do_location_id: Option<i64>,
}

/// A single feature value, as a vectorizer sees it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeatureValue<'a> {
    Text(&'a str),
    Number(f64),
}

impl FeatureMap {
    /// Iterate over (name, value) pairs in a stable order.
    pub fn entries(&self) -> Vec<(&'static str, FeatureValue<'_>)> {
        let mut entries = vec![
            (PU_DO, FeatureValue::Text(&self.pu_do)),
            (TRIP_DISTANCE, FeatureValue::Number(self.trip_distance)),
        ];
        if let Some(id) = self.pu_location_id {
            entries.push((PU_LOCATION_ID, FeatureValue::Number(id as f64)));
        }
        if let Some(id) = self.do_location_id {
            entries.push((DO_LOCATION_ID, FeatureValue::Number(id as f64)));
        }
        entries
    }
}

/// Which flavour of features the service computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeatureSet {
    /// `PU_DO` and `trip_distance` only.
    #[default]
    Basic,
    /// Basic features plus the raw location ids.
    Extended,
}

impl FeatureSet {
    pub fn prepare(&self, ride: &Map<String, Value>) -> Result<FeatureMap, FeatureError> {
        match self {
            FeatureSet::Basic => prepare_features(ride),
            FeatureSet::Extended => prepare_extended_features(ride),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseFeatureSetError(String);

impl fmt::Display for ParseFeatureSetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} is not a valid feature set", self.0)
    }
}

impl FromStr for FeatureSet {
    type Err = ParseFeatureSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "basic" => Ok(FeatureSet::Basic),
            "extended" => Ok(FeatureSet::Extended),
            invalid => Err(ParseFeatureSetError(invalid.to_owned())),
        }
    }
}

/// Build the `PU_DO` + `trip_distance` features out of a ride object.
pub fn prepare_features(ride: &Map<String, Value>) -> Result<FeatureMap, FeatureError> {
    let ride = parse_ride(ride)?;

    Ok(FeatureMap {
        pu_do: format!("{}_{}", ride.pu_location_id, ride.do_location_id),
        trip_distance: ride.trip_distance,
        pu_location_id: None,
        do_location_id: None,
    })
}

/// Same as `prepare_features`, also keeping the raw location ids.
pub fn prepare_extended_features(ride: &Map<String, Value>) -> Result<FeatureMap, FeatureError> {
    let ride = parse_ride(ride)?;

    Ok(FeatureMap {
        pu_do: format!("{}_{}", ride.pu_location_id, ride.do_location_id),
        trip_distance: ride.trip_distance,
        pu_location_id: Some(ride.pu_location_id),
        do_location_id: Some(ride.do_location_id),
    })
}

fn parse_ride(ride: &Map<String, Value>) -> Result<Ride, FeatureError> {
    Ok(Ride {
        pu_location_id: integer_field(ride, PU_LOCATION_ID)?,
        do_location_id: integer_field(ride, DO_LOCATION_ID)?,
        trip_distance: number_field(ride, TRIP_DISTANCE)?,
    })
}

fn required<'a>(ride: &'a Map<String, Value>, field: &'static str) -> Result<&'a Value, FeatureError> {
    match ride.get(field) {
        None | Some(Value::Null) => Err(FeatureError::MissingField(field)),
        Some(value) => Ok(value),
    }
}

fn integer_field(ride: &Map<String, Value>, field: &'static str) -> Result<i64, FeatureError> {
    let value = required(ride, field)?;
    // Integral floats such as `161.0` are accepted as location ids.
    let integral_float = || {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
            .map(|f| f as i64)
    };
    value
        .as_i64()
        .or_else(integral_float)
        .ok_or_else(|| FeatureError::InvalidField {
            field,
            expected: "integer",
            value: value.to_string(),
        })
}

fn number_field(ride: &Map<String, Value>, field: &'static str) -> Result<f64, FeatureError> {
    let value = required(ride, field)?;
    value.as_f64().ok_or_else(|| FeatureError::InvalidField {
        field,
        expected: "number",
        value: value.to_string(),
    })
}

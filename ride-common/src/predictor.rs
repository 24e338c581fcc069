use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use crate::features::{FeatureMap, FeatureValue};

/// Duration returned when a prediction fails and no other policy was configured.
pub const DEFAULT_FALLBACK_MINUTES: f64 = 10.0;
/// Minutes per mile used by the distance heuristic.
const MINUTES_PER_MILE: f64 = 3.0;
/// Lower bound of the distance heuristic.
const MINIMUM_HEURISTIC_MINUTES: f64 = 1.0;

/// Enumeration of errors for model inference. None of these reach the batch caller: the
/// `Predictor` turns them into its fallback value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PredictionError {
    #[error("no model is available for prediction")]
    ModelUnavailable,
    #[error("model expects {expected} features but received {actual}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("model returned no prediction")]
    EmptyOutput,
    #[error("model returned a non-finite prediction: {0}")]
    NonFinite(f64),
    #[error("model failed: {0}")]
    Model(String),
}

/// A model consuming numeric feature rows.
pub trait Regressor: Send + Sync {
    fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, PredictionError>;
}

/// A model consuming feature maps directly, one per row.
pub trait FrameModel: Send + Sync {
    fn predict_frame(&self, rows: &[FeatureMap]) -> Result<Vec<f64>, PredictionError>;
}

/// One-hot encodes string features and passes numeric features through, column names being
/// `name=value` and `name` respectively. Features without a matching column are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "VectorizerArtifact", into = "VectorizerArtifact")]
pub struct DictVectorizer {
    feature_names: Vec<String>,
    vocabulary: HashMap<String, usize>,
}

#[derive(Serialize, Deserialize)]
struct VectorizerArtifact {
    feature_names: Vec<String>,
}

impl From<VectorizerArtifact> for DictVectorizer {
    fn from(artifact: VectorizerArtifact) -> Self {
        DictVectorizer::new(artifact.feature_names)
    }
}

impl From<DictVectorizer> for VectorizerArtifact {
    fn from(vectorizer: DictVectorizer) -> Self {
        VectorizerArtifact {
            feature_names: vectorizer.feature_names,
        }
    }
}

impl DictVectorizer {
    pub fn new(feature_names: Vec<String>) -> Self {
        let vocabulary = feature_names
            .iter()
            .enumerate()
            .map(|(index, name)| (name.clone(), index))
            .collect();

        Self {
            feature_names,
            vocabulary,
        }
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn transform(&self, rows: &[FeatureMap]) -> Vec<Vec<f64>> {
        rows.iter().map(|row| self.transform_one(row)).collect()
    }

    fn transform_one(&self, row: &FeatureMap) -> Vec<f64> {
        let mut vector = vec![0.0; self.feature_names.len()];

        for (name, value) in row.entries() {
            let (column, value) = match value {
                FeatureValue::Text(text) => (format!("{}={}", name, text), 1.0),
                FeatureValue::Number(number) => (name.to_owned(), number),
            };
            if let Some(index) = self.vocabulary.get(&column) {
                vector[*index] = value;
            }
        }

        vector
    }
}

/// Ordinary least squares weights, one coefficient per vectorizer column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearRegression {
    pub intercept: f64,
    pub coef: Vec<f64>,
}

impl Regressor for LinearRegression {
    fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, PredictionError> {
        rows.iter()
            .map(|row| {
                if row.len() != self.coef.len() {
                    return Err(PredictionError::ShapeMismatch {
                        expected: self.coef.len(),
                        actual: row.len(),
                    });
                }
                Ok(self.intercept + row.iter().zip(&self.coef).map(|(x, w)| x * w).sum::<f64>())
            })
            .collect()
    }
}

/// Always predicts the same duration. Backs test runs, where no trained model is deployed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConstantModel {
    pub value: f64,
}

impl Regressor for ConstantModel {
    fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, PredictionError> {
        Ok(vec![self.value; rows.len()])
    }
}

impl FrameModel for ConstantModel {
    fn predict_frame(&self, rows: &[FeatureMap]) -> Result<Vec<f64>, PredictionError> {
        Ok(vec![self.value; rows.len()])
    }
}

/// Regressors that can be stored on their own or inside a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegressorArtifact {
    LinearRegression(LinearRegression),
    Constant(ConstantModel),
}

impl Regressor for RegressorArtifact {
    fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, PredictionError> {
        match self {
            RegressorArtifact::LinearRegression(model) => model.predict(rows),
            RegressorArtifact::Constant(model) => model.predict(rows),
        }
    }
}

/// A vectorizer and a regressor bundled together, consuming feature maps as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub vectorizer: DictVectorizer,
    pub regressor: RegressorArtifact,
}

impl FrameModel for Pipeline {
    fn predict_frame(&self, rows: &[FeatureMap]) -> Result<Vec<f64>, PredictionError> {
        self.regressor.predict(&self.vectorizer.transform(rows))
    }
}

/// Top level model artifact as stored next to a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelArtifact {
    LinearRegression(LinearRegression),
    Constant(ConstantModel),
    Pipeline(Pipeline),
}

/// How a `Predictor` reaches a model. Chosen once, when the predictor is built.
pub enum Strategy {
    /// The model takes feature maps directly.
    Raw(Box<dyn FrameModel>),
    /// Feature maps go through a vectorizer before reaching the model.
    Vectorized {
        vectorizer: DictVectorizer,
        model: Box<dyn Regressor>,
    },
    /// No model could be loaded: every prediction is a fallback.
    Unavailable,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Raw(_) => "raw",
            Strategy::Vectorized { .. } => "vectorized",
            Strategy::Unavailable => "unavailable",
        }
    }
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Strategy::{}", self.name())
    }
}

/// What to predict when the model fails.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FallbackPolicy {
    /// A fixed duration in minutes.
    Fixed(f64),
    /// Three minutes per mile, never under a minute.
    DistanceHeuristic,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        FallbackPolicy::Fixed(DEFAULT_FALLBACK_MINUTES)
    }
}

impl FallbackPolicy {
    pub fn value(&self, features: &FeatureMap) -> f64 {
        match self {
            FallbackPolicy::Fixed(minutes) => *minutes,
            FallbackPolicy::DistanceHeuristic => {
                (features.trip_distance * MINUTES_PER_MILE).max(MINIMUM_HEURISTIC_MINUTES)
            }
        }
    }
}

impl fmt::Display for FallbackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FallbackPolicy::Fixed(minutes) => write!(f, "fixed:{}", minutes),
            FallbackPolicy::DistanceHeuristic => write!(f, "distance"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseFallbackPolicyError(String);

impl fmt::Display for ParseFallbackPolicyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} is not a valid fallback policy, expected 'distance' or 'fixed:<minutes>'",
            self.0
        )
    }
}

/// Parses `distance`, `fixed` or `fixed:<minutes>`.
impl FromStr for FallbackPolicy {
    type Err = ParseFallbackPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseFallbackPolicyError(s.to_owned());
        let normalized = s.trim().to_ascii_lowercase();

        match normalized.as_str() {
            "distance" => Ok(FallbackPolicy::DistanceHeuristic),
            "fixed" => Ok(FallbackPolicy::default()),
            other => match other.split_once(':') {
                Some(("fixed", minutes)) => match minutes.parse::<f64>() {
                    Ok(minutes) if minutes.is_finite() => Ok(FallbackPolicy::Fixed(minutes)),
                    _ => Err(invalid()),
                },
                _ => Err(invalid()),
            },
        }
    }
}

/// Turns feature maps into ride durations, degrading to a fallback value instead of failing.
#[derive(Debug)]
pub struct Predictor {
    strategy: Strategy,
    fallback: FallbackPolicy,
}

impl Predictor {
    pub fn new(strategy: Strategy, fallback: FallbackPolicy) -> Self {
        Self { strategy, fallback }
    }

    pub fn raw(model: impl FrameModel + 'static, fallback: FallbackPolicy) -> Self {
        Self::new(Strategy::Raw(Box::new(model)), fallback)
    }

    pub fn vectorized(
        vectorizer: DictVectorizer,
        model: impl Regressor + 'static,
        fallback: FallbackPolicy,
    ) -> Self {
        Self::new(
            Strategy::Vectorized {
                vectorizer,
                model: Box::new(model),
            },
            fallback,
        )
    }

    pub fn unavailable(fallback: FallbackPolicy) -> Self {
        Self::new(Strategy::Unavailable, fallback)
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn fallback(&self) -> FallbackPolicy {
        self.fallback
    }

    /// Run the model, surfacing any failure.
    pub fn try_predict(&self, features: &FeatureMap) -> Result<f64, PredictionError> {
        let rows = std::slice::from_ref(features);

        let output = match &self.strategy {
            Strategy::Raw(model) => model.predict_frame(rows)?,
            Strategy::Vectorized { vectorizer, model } => {
                model.predict(&vectorizer.transform(rows))?
            }
            Strategy::Unavailable => return Err(PredictionError::ModelUnavailable),
        };

        match output.first() {
            Some(value) if value.is_finite() => Ok(*value),
            Some(value) => Err(PredictionError::NonFinite(*value)),
            None => Err(PredictionError::EmptyOutput),
        }
    }

    /// Predict a duration in minutes. Failures are logged and replaced by the fallback value.
    pub fn predict(&self, features: &FeatureMap) -> f64 {
        match self.try_predict(features) {
            Ok(value) => value,
            Err(e) => {
                let fallback = self.fallback.value(features);
                match e {
                    PredictionError::ModelUnavailable => {
                        warn!("no model available for prediction, using {}", fallback)
                    }
                    _ => error!("prediction failed, using {}: {}", fallback, e),
                }
                metrics::counter!(
                    "ride_prediction_fallbacks_total",
                    "strategy" => self.strategy.name()
                )
                .increment(1);
                fallback
            }
        }
    }
}

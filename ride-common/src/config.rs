use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use tracing::info;

use crate::artifacts::{self, ArtifactLocation, LocalArtifactStore, S3ArtifactStore};
use crate::features::FeatureSet;
use crate::predictor::{ConstantModel, FallbackPolicy, Predictor};

/// Where the model comes from and how it is fed.
#[derive(Envconfig, Clone, Debug)]
pub struct ModelConfig {
    #[envconfig(from = "RUN_ID")]
    pub run_id: Option<NonEmptyString>,

    #[envconfig(from = "MODEL_BUCKET", default = "mlflow-models-rll")]
    pub model_bucket: String,

    #[envconfig(from = "MLFLOW_EXPERIMENT_ID", default = "1")]
    pub experiment_id: String,

    #[envconfig(from = "MLFLOW_S3_ENDPOINT_URL")]
    pub s3_endpoint_url: Option<NonEmptyString>,

    #[envconfig(from = "MODEL_DIR", default = "models")]
    pub model_dir: String,

    #[envconfig(from = "MODEL_VERSION")]
    pub model_version: Option<NonEmptyString>,

    /// When set, skip loading artifacts and always predict this many minutes.
    #[envconfig(from = "STUB_PREDICTION")]
    pub stub_prediction: Option<f64>,

    #[envconfig(from = "FEATURE_SET", default = "basic")]
    pub feature_set: FeatureSet,
}

impl ModelConfig {
    /// Version stamped on predictions: the explicit model version, else the training run id.
    pub fn version(&self) -> Option<String> {
        self.model_version
            .as_ref()
            .or(self.run_id.as_ref())
            .map(|version| version.as_str().to_owned())
    }

    /// Artifacts of the configured run in the model bucket, else the local model directory.
    pub fn artifact_location(&self) -> ArtifactLocation {
        match &self.run_id {
            Some(run_id) => ArtifactLocation::for_run(
                &self.model_bucket,
                &self.experiment_id,
                run_id.as_str(),
            ),
            None => ArtifactLocation::local(&self.model_dir),
        }
    }

    pub async fn load_predictor(&self, fallback: FallbackPolicy) -> Predictor {
        if let Some(value) = self.stub_prediction {
            info!("using stub model predicting {} minutes", value);
            return Predictor::raw(ConstantModel { value }, fallback);
        }

        let location = self.artifact_location();
        match &self.run_id {
            Some(_) => {
                let store =
                    S3ArtifactStore::from_env(self.s3_endpoint_url.as_ref().map(|u| u.as_str()))
                        .await;
                artifacts::load_predictor(&store, &location, fallback).await
            }
            None => artifacts::load_predictor(&LocalArtifactStore, &location, fallback).await,
        }
    }
}

/// Connection settings for the stream service.
#[derive(Envconfig, Clone, Debug)]
pub struct StreamConfig {
    #[envconfig(from = "KINESIS_ENDPOINT_URL")]
    pub endpoint_url: Option<NonEmptyString>,
}

impl StreamConfig {
    pub fn endpoint_url(&self) -> Option<&str> {
        self.endpoint_url.as_ref().map(|url| url.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(trimmed.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::features::FeatureMap;
    use crate::predictor::Strategy;

    fn model_config(vars: &[(&str, &str)]) -> ModelConfig {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ModelConfig::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn test_model_config_defaults() {
        let config = model_config(&[]);

        assert_eq!(config.model_bucket, "mlflow-models-rll");
        assert_eq!(config.experiment_id, "1");
        assert_eq!(config.feature_set, FeatureSet::Basic);
        assert_eq!(config.version(), None);
        assert_eq!(
            config.artifact_location(),
            ArtifactLocation::local("models")
        );
    }

    #[test]
    fn test_version_prefers_model_version() {
        let config = model_config(&[("RUN_ID", "abc123")]);
        assert_eq!(config.version().as_deref(), Some("abc123"));
        assert_eq!(
            config.artifact_location().model,
            "s3://mlflow-models-rll/1/abc123/artifacts/model/model.json"
        );

        let config = model_config(&[("RUN_ID", "abc123"), ("MODEL_VERSION", "test-v1")]);
        assert_eq!(config.version().as_deref(), Some("test-v1"));
    }

    #[tokio::test]
    async fn test_stub_prediction_skips_artifacts() {
        let config = model_config(&[("STUB_PREDICTION", "21.3"), ("RUN_ID", "abc123")]);
        let predictor = config.load_predictor(FallbackPolicy::default()).await;

        assert!(matches!(predictor.strategy(), Strategy::Raw(_)));
        let features = FeatureMap {
            pu_do: "161_236".to_owned(),
            trip_distance: 3.5,
            pu_location_id: None,
            do_location_id: None,
        };
        assert_eq!(predictor.predict(&features), 21.3);
    }

    #[tokio::test]
    async fn test_missing_local_model_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let config = model_config(&[("MODEL_DIR", dir.path().to_str().unwrap())]);

        let predictor = config.load_predictor(FallbackPolicy::Fixed(7.0)).await;

        assert!(matches!(predictor.strategy(), Strategy::Unavailable));
    }

    #[test]
    fn test_parse_env_values() {
        assert_eq!(
            "1500".parse::<EnvMsDuration>(),
            Ok(EnvMsDuration(time::Duration::from_millis(1500)))
        );
        assert!("1.5s".parse::<EnvMsDuration>().is_err());
        assert!("  ".parse::<NonEmptyString>().is_err());
        assert_eq!(
            "run".parse::<NonEmptyString>(),
            Ok(NonEmptyString("run".to_owned()))
        );
    }
}

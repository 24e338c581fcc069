//! Loading of trained model artifacts.
//!
//! Artifacts are JSON documents stored either in object storage, laid out the way the training
//! pipeline logs them (`s3://<bucket>/<experiment>/<run>/artifacts/...`), or in a local
//! directory. Storage goes through the `ArtifactStore` trait so that tests can swap in
//! `MockArtifactStore`.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::Client as AwsS3SdkClient;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::predictor::{DictVectorizer, FallbackPolicy, ModelArtifact, Predictor, Strategy};

const MODEL_FILE: &str = "model.json";
const VECTORIZER_FILE: &str = "dict_vectorizer.json";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    NotFound(String),
    #[error("{0} is not a valid s3:// uri")]
    InvalidUri(String),
    #[error("failed to read artifact {uri}: {message}")]
    ReadFailed { uri: String, message: String },
    #[error("failed to parse artifact {uri}: {message}")]
    ParseFailed { uri: String, message: String },
    #[error("model {0} needs a vectorizer but none was found")]
    MissingVectorizer(String),
    #[error("model expects {model} features but the vectorizer produces {vectorizer}")]
    IncompatibleArtifacts { model: usize, vectorizer: usize },
}

/// Read-only access to stored artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn get_bytes(&self, uri: &str) -> Result<Vec<u8>, ArtifactError>;
}

/// Artifacts stored in S3 (or any S3 compatible endpoint, such as LocalStack or MinIO).
pub struct S3ArtifactStore {
    client: AwsS3SdkClient,
}

impl S3ArtifactStore {
    pub fn new(client: AwsS3SdkClient) -> Self {
        Self { client }
    }

    /// Build a client from the ambient AWS configuration, optionally pointed at a custom endpoint.
    pub async fn from_env(endpoint: Option<&str>) -> Self {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest());
        if let Some(endpoint) = endpoint {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }
        let aws_config = aws_config_builder.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if endpoint.is_some() {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Self::new(AwsS3SdkClient::from_conf(s3_config_builder.build()))
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn get_bytes(&self, uri: &str) -> Result<Vec<u8>, ArtifactError> {
        let (bucket, key) = parse_s3_uri(uri)?;

        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let message = DisplayErrorContext(&e).to_string();
                if let aws_sdk_s3::operation::get_object::GetObjectError::NoSuchKey(_) =
                    e.into_service_error()
                {
                    ArtifactError::NotFound(uri.to_owned())
                } else {
                    ArtifactError::ReadFailed {
                        uri: uri.to_owned(),
                        message,
                    }
                }
            })?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| ArtifactError::ReadFailed {
                uri: uri.to_owned(),
                message: e.to_string(),
            })?;

        Ok(body.to_vec())
    }
}

/// Artifacts stored on the local filesystem; uris are plain paths.
#[derive(Clone, Copy, Default)]
pub struct LocalArtifactStore;

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn get_bytes(&self, uri: &str) -> Result<Vec<u8>, ArtifactError> {
        tokio::fs::read(uri).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ArtifactError::NotFound(uri.to_owned()),
            _ => ArtifactError::ReadFailed {
                uri: uri.to_owned(),
                message: e.to_string(),
            },
        })
    }
}

/// In-memory store for tests.
#[derive(Clone, Default)]
pub struct MockArtifactStore {
    objects: HashMap<String, Result<Vec<u8>, ArtifactError>>,
}

impl MockArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(mut self, uri: &str, body: impl Into<Vec<u8>>) -> Self {
        self.objects.insert(uri.to_owned(), Ok(body.into()));
        self
    }

    pub fn with_error(mut self, uri: &str, error: ArtifactError) -> Self {
        self.objects.insert(uri.to_owned(), Err(error));
        self
    }
}

#[async_trait]
impl ArtifactStore for MockArtifactStore {
    async fn get_bytes(&self, uri: &str) -> Result<Vec<u8>, ArtifactError> {
        match self.objects.get(uri) {
            Some(response) => response.clone(),
            None => Err(ArtifactError::NotFound(uri.to_owned())),
        }
    }
}

/// Where to find the model and its vectorizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLocation {
    pub model: String,
    pub vectorizer: String,
}

impl ArtifactLocation {
    /// Artifacts logged by a training run.
    pub fn for_run(bucket: &str, experiment_id: &str, run_id: &str) -> Self {
        let root = format!("s3://{}/{}/{}/artifacts", bucket, experiment_id, run_id);
        Self {
            model: format!("{}/model/{}", root, MODEL_FILE),
            vectorizer: format!("{}/{}", root, VECTORIZER_FILE),
        }
    }

    /// Artifacts copied into a local directory.
    pub fn local(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            model: dir.join(MODEL_FILE).to_string_lossy().into_owned(),
            vectorizer: dir.join(VECTORIZER_FILE).to_string_lossy().into_owned(),
        }
    }
}

/// Split `s3://bucket/some/key` into its bucket and key.
pub fn parse_s3_uri(uri: &str) -> Result<(&str, &str), ArtifactError> {
    uri.strip_prefix("s3://")
        .and_then(|rest| rest.split_once('/'))
        .filter(|(bucket, key)| !bucket.is_empty() && !key.is_empty())
        .ok_or_else(|| ArtifactError::InvalidUri(uri.to_owned()))
}

/// Build a `Predictor` from stored artifacts.
///
/// Loading never fails: when the artifacts are missing or unusable the error is logged and the
/// predictor falls back on every call.
pub async fn load_predictor(
    store: &dyn ArtifactStore,
    location: &ArtifactLocation,
    fallback: FallbackPolicy,
) -> Predictor {
    match load_strategy(store, location).await {
        Ok(strategy) => {
            info!(
                "loaded {} model from {} (fallback: {})",
                strategy.name(),
                location.model,
                fallback
            );
            Predictor::new(strategy, fallback)
        }
        Err(e) => {
            error!("failed to load model artifacts: {}", e);
            Predictor::unavailable(fallback)
        }
    }
}

/// Pick a strategy from whatever artifacts are available. The vectorizer is optional: pipelines
/// and constant models work without one.
pub async fn load_strategy(
    store: &dyn ArtifactStore,
    location: &ArtifactLocation,
) -> Result<Strategy, ArtifactError> {
    let model: ModelArtifact = fetch_json(store, &location.model).await?;

    let vectorizer: Option<DictVectorizer> = match fetch_json(store, &location.vectorizer).await {
        Ok(vectorizer) => Some(vectorizer),
        Err(ArtifactError::NotFound(_)) => None,
        Err(e) => {
            warn!("could not load vectorizer, continuing without it: {}", e);
            None
        }
    };

    match (model, vectorizer) {
        (ModelArtifact::Pipeline(pipeline), _) => Ok(Strategy::Raw(Box::new(pipeline))),
        (ModelArtifact::Constant(model), None) => Ok(Strategy::Raw(Box::new(model))),
        (ModelArtifact::Constant(model), Some(vectorizer)) => Ok(Strategy::Vectorized {
            vectorizer,
            model: Box::new(model),
        }),
        (ModelArtifact::LinearRegression(model), Some(vectorizer)) => {
            if model.coef.len() != vectorizer.feature_names().len() {
                return Err(ArtifactError::IncompatibleArtifacts {
                    model: model.coef.len(),
                    vectorizer: vectorizer.feature_names().len(),
                });
            }
            Ok(Strategy::Vectorized {
                vectorizer,
                model: Box::new(model),
            })
        }
        (ModelArtifact::LinearRegression(_), None) => {
            Err(ArtifactError::MissingVectorizer(location.model.clone()))
        }
    }
}

async fn fetch_json<T: DeserializeOwned>(
    store: &dyn ArtifactStore,
    uri: &str,
) -> Result<T, ArtifactError> {
    let bytes = store.get_bytes(uri).await?;
    serde_json::from_slice(&bytes).map_err(|e| ArtifactError::ParseFailed {
        uri: uri.to_owned(),
        message: e.to_string(),
    })
}

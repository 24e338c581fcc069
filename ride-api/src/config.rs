use envconfig::Envconfig;

use ride_common::config::{ModelConfig, NonEmptyString, StreamConfig};
use ride_common::predictor::FallbackPolicy;
use ride_common::service::ResponseShape;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(from = "TEST_RUN", default = "false")]
    pub test_run: bool,

    #[envconfig(from = "PREDICTIONS_STREAM_NAME", default = "ride_predictions")]
    pub predictions_stream_name: NonEmptyString,

    #[envconfig(from = "RESPONSE_SHAPE", default = "predictions")]
    pub response_shape: ResponseShape,

    #[envconfig(from = "PREDICTION_FALLBACK", default = "fixed:10.0")]
    pub prediction_fallback: FallbackPolicy,

    #[envconfig(default = "6000000")]
    pub max_body_size: usize,

    #[envconfig(default = "1")]
    pub concurrency_limit: usize,

    #[envconfig(nested = true)]
    pub model: ModelConfig,

    #[envconfig(nested = true)]
    pub stream: StreamConfig,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

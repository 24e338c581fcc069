use envconfig::Envconfig;

use ride_common::config::{EnvMsDuration, ModelConfig, NonEmptyString, StreamConfig};
use ride_common::predictor::FallbackPolicy;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    /// Log predictions instead of publishing them.
    #[envconfig(from = "TEST_RUN", default = "false")]
    pub test_run: bool,

    #[envconfig(from = "INPUT_STREAM_NAME", default = "ride-events")]
    pub input_stream_name: NonEmptyString,

    #[envconfig(from = "OUTPUT_STREAM_NAME", default = "ride_predictions")]
    pub output_stream_name: NonEmptyString,

    #[envconfig(from = "SHARD_ID", default = "shardId-000000000000")]
    pub shard_id: NonEmptyString,

    #[envconfig(from = "BATCH_LIMIT", default = "10")]
    pub batch_limit: i32,

    #[envconfig(from = "EMPTY_POLL_INTERVAL", default = "1000")]
    pub empty_poll_interval: EnvMsDuration,

    #[envconfig(from = "ERROR_BACKOFF", default = "5000")]
    pub error_backoff: EnvMsDuration,

    #[envconfig(from = "PREDICTION_FALLBACK", default = "distance")]
    pub prediction_fallback: FallbackPolicy,

    #[envconfig(nested = true)]
    pub model: ModelConfig,

    #[envconfig(nested = true)]
    pub stream: StreamConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

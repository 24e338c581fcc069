use std::sync::Arc;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;
use tracing::info;

use ride_common::emitter::{LogSink, StreamSink};
use ride_common::metrics::{setup_metrics_recorder, setup_metrics_routes};
use ride_common::service::ModelService;
use ride_common::stream::{KinesisStream, DEFAULT_BATCH_LIMIT, DEFAULT_SHARD_ID};

mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env()?;

    let predictor = config
        .model
        .load_predictor(config.prediction_fallback)
        .await;
    let service = ModelService::new(predictor, config.model.version())
        .with_feature_set(config.model.feature_set)
        .with_response_shape(config.response_shape);

    let stream_name = config.predictions_stream_name.as_str();
    let service = if config.test_run {
        service.with_sink(LogSink::new(stream_name))
    } else {
        let client = KinesisStream::from_env(
            config.stream.endpoint_url(),
            DEFAULT_SHARD_ID,
            DEFAULT_BATCH_LIMIT,
        )
        .await;
        service.with_sink(StreamSink::new(Arc::new(client), stream_name))
    };

    let app = handlers::add_routes(
        Router::new(),
        Arc::new(service),
        config.max_body_size,
        config.concurrency_limit,
    );
    let app = setup_metrics_routes(app, setup_metrics_recorder()?);

    info!("ride-api listening on {}", config.bind());
    listen(app, config.bind()).await
}

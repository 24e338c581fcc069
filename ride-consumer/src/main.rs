//! Consume ride events from a stream and publish duration predictions.
use std::future::ready;
use std::sync::Arc;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use ride_common::emitter::{LogSink, StreamSink};
use ride_common::health::HealthRegistry;
use ride_common::metrics::{serve, setup_metrics_recorder, setup_metrics_routes};
use ride_common::service::ModelService;
use ride_common::stream::{KinesisStream, StreamClient};
use ride_consumer::config::Config;
use ride_consumer::consumer::StreamConsumer;
use ride_consumer::error::ConsumerError;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

async fn shutdown() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("failed to install SIGTERM handler: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for SIGINT: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = term.recv() => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<(), ConsumerError> {
    setup_tracing();

    let config = Config::init_from_env().expect("Invalid configuration:");
    info!(
        "starting ride consumer: {} -> {} (test run: {})",
        config.input_stream_name.as_str(),
        config.output_stream_name.as_str(),
        config.test_run
    );

    let liveness = HealthRegistry::new("liveness");
    let consumer_liveness = liveness.register("stream_consumer", time::Duration::seconds(30));

    let recorder_handle = setup_metrics_recorder()?;
    let router = Router::new().route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router, recorder_handle);
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve metrics on {}: {}", bind, e);
        }
    });

    let predictor = config.model.load_predictor(config.prediction_fallback).await;
    let client: Arc<dyn StreamClient> = Arc::new(
        KinesisStream::from_env(
            config.stream.endpoint_url(),
            config.shard_id.as_str(),
            config.batch_limit,
        )
        .await,
    );

    let service = ModelService::new(predictor, config.model.version())
        .with_feature_set(config.model.feature_set);
    let service = if config.test_run {
        service.with_sink(LogSink::new(config.output_stream_name.as_str()))
    } else {
        service.with_sink(StreamSink::new(
            client.clone(),
            config.output_stream_name.as_str(),
        ))
    };

    StreamConsumer::new(
        client,
        Arc::new(service),
        config.input_stream_name.as_str(),
        consumer_liveness,
    )
    .empty_poll_interval(config.empty_poll_interval.0)
    .error_backoff(config.error_backoff.0)
    .run(shutdown())
    .await;

    Ok(())
}

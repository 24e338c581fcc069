use metrics_exporter_prometheus::BuildError;
use ride_common::stream::StreamError;
use thiserror::Error;

/// Enumeration of errors raised while consuming the ride events stream.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("failed to fetch ride events: {0}")]
    FetchError(#[from] StreamError),
    #[error("failed to install the metrics recorder: {0}")]
    MetricsError(#[from] BuildError),
}

use std::sync::Arc;

use axum::{extract::State, Json};
use tracing::debug;

use ride_common::service::{BatchResponse, InvocationEvent, ModelService};

/// Run a pushed batch of ride records through the model.
///
/// Records that can't be decoded are left out of the response rather than failing the request.
pub async fn post_invocation(
    State(service): State<Arc<ModelService>>,
    Json(event): Json<InvocationEvent>,
) -> Json<BatchResponse> {
    debug!("received invocation with {} records", event.records.len());

    Json(service.handle_event(&event).await)
}

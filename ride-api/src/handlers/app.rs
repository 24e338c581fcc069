use std::convert::Infallible;
use std::sync::Arc;

use axum::{extract::DefaultBodyLimit, routing, Router};
use tower::limit::ConcurrencyLimitLayer;

use ride_common::service::ModelService;

use super::invocation;

/// Path the Lambda runtime interface emulator forwards invocations to.
const LAMBDA_INVOCATIONS: &str = "/2015-03-31/functions/function/invocations";

pub fn add_routes(
    router: Router,
    service: Arc<ModelService>,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    let invoke = routing::post(invocation::post_invocation)
        .with_state(service)
        .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit))
        .layer(DefaultBodyLimit::max(max_body_size));

    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index)) // No async loop, just check axum health
        .route(LAMBDA_INVOCATIONS, invoke.clone())
        .route("/invocations", invoke)
}

pub async fn index() -> &'static str {
    "ride-api"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt; // for `collect`
    use ride_common::metrics::{setup_metrics_recorder, setup_metrics_routes};
    use ride_common::predictor::{FallbackPolicy, Predictor};
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    #[tokio::test]
    async fn index() {
        let service = Arc::new(ModelService::new(
            Predictor::unavailable(FallbackPolicy::default()),
            None,
        ));

        for uri in ["/", "/_readiness", "/_liveness"] {
            let app = add_routes(Router::new(), service.clone(), 1_000_000, 1);

            let response = app
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);

            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], b"ride-api");
        }
    }

    #[tokio::test]
    async fn metrics_track_invocations() {
        let service = Arc::new(ModelService::new(
            Predictor::unavailable(FallbackPolicy::default()),
            None,
        ));
        let app = add_routes(Router::new(), service, 1_000_000, 1);
        let app = setup_metrics_routes(app, setup_metrics_recorder().unwrap());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/invocations")
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"Records": []}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let rendered = std::str::from_utf8(&body).unwrap();
        let invocations = rendered.lines().find(|line| {
            line.starts_with("http_requests_total") && line.contains(r#"path="/invocations""#)
        });
        assert!(invocations.is_some(), "no invocation counter in:\n{}", rendered);
    }
}

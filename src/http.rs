//! Liveness, readiness, and metrics endpoints
//!
//! A small plaintext HTTP server beside the gRPC transport: `/health` and
//! `/ready` answer `ok`, `/metrics` serves the Prometheus exposition.

use std::net::SocketAddr;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{AuthzError, Result};

/// Build the telemetry router
pub fn router(metrics_handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/ready", get(|| async { "ok" }))
        .route("/metrics", get(render_metrics))
        .with_state(metrics_handle)
}

async fn render_metrics(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

/// Serve the telemetry endpoints until the shutdown token fires
pub async fn serve(addr: SocketAddr, router: Router, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AuthzError::transport(format!("failed to bind {addr}: {e}")))?;

    info!(addr = %addr, "starting telemetry HTTP server");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| AuthzError::transport(format!("telemetry server error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    fn test_router() -> Router {
        // A standalone recorder; the process-global one is not touched
        router(PrometheusBuilder::new().build_recorder().handle())
    }

    #[tokio::test]
    async fn test_health_endpoints_answer_ok() {
        for path in ["/health", "/ready"] {
            let response = test_router()
                .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{path}");

            let body = axum::body::to_bytes(response.into_body(), 16).await.unwrap();
            assert_eq!(&body[..], b"ok", "{path}");
        }
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_exposition() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

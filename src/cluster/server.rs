//! Cluster HTTP API
//!
//! The owning instance exposes the run lifecycle over HTTP so peers can
//! delegate to it, plus health and metrics endpoints for operators.
//! Every API response uses the [`ApiResponse`] envelope.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::cluster::client::{ApiResponse, RunDelegate, StartRequest, StopRequest};
use crate::error::ClusterError;
use crate::queue::DirtyQueue;
use crate::run::RunStatusView;

/// Shared state for the cluster API.
#[derive(Clone)]
pub struct AppState {
    pub delegate: Arc<dyn RunDelegate>,
    pub queue: Arc<DirtyQueue>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/run/start", post(start_run))
        .route("/api/run/stop", post(stop_run))
        .route("/api/run/status", get(run_status))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve the cluster API until the process exits.
pub async fn serve(state: AppState, listen_addr: &str) -> Result<(), ClusterError> {
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .map_err(|e| ClusterError::Init(format!("bind {listen_addr}: {e}")))?;
    tracing::info!(addr = %listen_addr, "cluster API listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| ClusterError::Init(e.to_string()))
}

async fn start_run(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> Json<ApiResponse<Uuid>> {
    match state.delegate.start(request.force).await {
        Ok(run_id) => Json(ApiResponse::ok(run_id)),
        Err(e) => {
            tracing::warn!(error = %e, "start request rejected");
            Json(ApiResponse::err(e.to_string()))
        }
    }
}

async fn stop_run(
    State(state): State<AppState>,
    Json(request): Json<StopRequest>,
) -> Json<ApiResponse<serde_json::Value>> {
    match state.delegate.stop(request.block).await {
        Ok(()) => Json(ApiResponse::ok(serde_json::json!({ "stopped": true }))),
        Err(e) => Json(ApiResponse::err(e.to_string())),
    }
}

async fn run_status(State(state): State<AppState>) -> Json<ApiResponse<RunStatusView>> {
    match state.delegate.status().await {
        Ok(view) => Json(ApiResponse::ok(view)),
        Err(e) => Json(ApiResponse::err(e.to_string())),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = crate::metrics::global();
    match state.queue.count() {
        Ok(count) => metrics.queue_entries.set(count as i64),
        Err(e) => tracing::warn!(error = %e, "failed to sample queue size"),
    }
    (StatusCode::OK, metrics.gather())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::client::LocalDelegate;
    use crate::config::QueueConfig;
    use crate::error::Result;
    use crate::models::{RunReport, RunStatus};
    use crate::publish::AllowAllGate;
    use crate::queue::MockQueueStore;
    use crate::run::{RunContext, RunController, RunPipeline, RunState};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serial_test::serial;
    use tower::ServiceExt;

    struct InstantPipeline;

    #[async_trait]
    impl RunPipeline for InstantPipeline {
        async fn execute(&self, ctx: RunContext) -> Result<RunReport> {
            ctx.set_running()?;
            Ok(RunReport::new(ctx.run_id, RunStatus::Succeeded))
        }
    }

    fn test_state() -> (Arc<RunController>, AppState) {
        let controller = Arc::new(RunController::new(Arc::new(InstantPipeline)));
        let queue = Arc::new(DirtyQueue::new(
            Arc::new(MockQueueStore::new()),
            Arc::new(AllowAllGate),
            &QueueConfig::default(),
        ));
        let state = AppState {
            delegate: Arc::new(LocalDelegate::new(controller.clone())),
            queue,
        };
        (controller, state)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let (_controller, state) = test_state();
        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/run/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["state"], "stopped");
    }

    #[tokio::test]
    async fn test_start_endpoint_runs_pipeline() {
        let (controller, state) = test_state();
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/run/start")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"force":false}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert!(json["data"].is_string());

        controller.join().await;
        assert_eq!(controller.state(), RunState::Stopped);
    }

    #[tokio::test]
    #[serial(metrics_registry)]
    async fn test_health_and_metrics_endpoints() {
        let (_controller, state) = test_state();
        let app = router(state);

        let health = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let metrics = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(metrics.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(metrics.into_body(), usize::MAX)
            .await
            .unwrap();
        // the empty mock queue samples to a zero gauge
        assert!(String::from_utf8(bytes.to_vec())
            .unwrap()
            .contains("pressline_queue_entries 0"));
    }
}

use super::{ApiResponse, error_response, ok};
use crate::server::AppState;
use axum::extract::Path;
use axum::routing::{get, post};
use axum::{Extension, Json};
use gate_core::RequestId;
use gate_platform::UserId;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DecisionRequest {
    approved: bool,
    /// Recorded as the deciding operator.
    operator_id: i64,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/gk/requests/stuck", get(list_stuck))
        .route("/api/v1/gk/requests/pending", get(list_pending))
        .route("/api/v1/gk/requests/{id}/decision", post(decide))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_stuck(Extension(state): Extension<Arc<AppState>>) -> ApiResponse {
    match state.engine.stuck_requests().await {
        Ok(requests) => ok(serde_json::json!({ "status": "ok", "requests": requests })),
        Err(e) => error_response(&e),
    }
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_pending(Extension(state): Extension<Arc<AppState>>) -> ApiResponse {
    match state.engine.pending_reviews().await {
        Ok(requests) => ok(serde_json::json!({ "status": "ok", "requests": requests })),
        Err(e) => error_response(&e),
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn decide(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<DecisionRequest>,
) -> ApiResponse {
    match state
        .engine
        .decide(RequestId::new(id), req.approved, UserId::new(req.operator_id))
        .await
    {
        Ok(request) => ok(serde_json::json!({ "status": "ok", "request": request })),
        Err(e) => error_response(&e),
    }
}

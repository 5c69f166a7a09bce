use super::{ApiResponse, error_response, ok};
use crate::server::AppState;
use axum::Extension;
use axum::extract::Path;
use axum::routing::{get, post};
use gate_platform::UserId;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/gk/rate-limits", get(list_blocked))
        .route("/api/v1/gk/rate-limits/{user_id}/unblock", post(unblock))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_blocked(Extension(state): Extension<Arc<AppState>>) -> ApiResponse {
    match state.engine.limiter().list_blocked().await {
        Ok(blocked) => ok(serde_json::json!({ "status": "ok", "blocked": blocked })),
        Err(e) => error_response(&e),
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn unblock(Extension(state): Extension<Arc<AppState>>, Path(user_id): Path<i64>) -> ApiResponse {
    match state.engine.unblock_rate_limit(UserId::new(user_id)).await {
        Ok(cleared) => ok(serde_json::json!({ "status": "ok", "cleared": cleared })),
        Err(e) => error_response(&e),
    }
}

use super::{ApiResponse, error_response, ok};
use crate::server::AppState;
use axum::Extension;
use axum::extract::Path;
use axum::routing::{get, post};
use gate_core::DelegateId;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/gk/delegates", get(list_delegates))
        .route("/api/v1/gk/delegates/rotate", post(rotate))
        .route("/api/v1/gk/delegates/{id}/deactivate", post(deactivate))
        .route("/api/v1/gk/delegates/{id}/reactivate", post(reactivate))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_delegates(Extension(state): Extension<Arc<AppState>>) -> ApiResponse {
    let pool = state.engine.pool();
    let (delegates, status) = match (pool.list_all().await, pool.status().await) {
        (Ok(delegates), Ok(status)) => (delegates, status),
        (Err(e), _) | (_, Err(e)) => return error_response(&e),
    };
    ok(serde_json::json!({
        "status": "ok",
        "pool": status,
        "delegates": delegates,
    }))
}

#[tracing::instrument(level = "info", skip_all)]
async fn rotate(Extension(state): Extension<Arc<AppState>>) -> ApiResponse {
    match state.engine.force_rotate_delegate().await {
        Ok(account) => ok(serde_json::json!({ "status": "ok", "bound": account })),
        Err(e) => error_response(&e),
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn deactivate(Extension(state): Extension<Arc<AppState>>, Path(id): Path<i64>) -> ApiResponse {
    match state.engine.pool().deactivate(DelegateId::new(id)).await {
        Ok(changed) => ok(serde_json::json!({ "status": "ok", "changed": changed })),
        Err(e) => error_response(&e),
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn reactivate(Extension(state): Extension<Arc<AppState>>, Path(id): Path<i64>) -> ApiResponse {
    match state.engine.pool().reactivate(DelegateId::new(id)).await {
        Ok(changed) => ok(serde_json::json!({ "status": "ok", "changed": changed })),
        Err(e) => error_response(&e),
    }
}

use super::{ApiResponse, error_response, ok};
use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AutoAdmitRequest {
    enabled: bool,
}

pub fn router() -> axum::Router {
    axum::Router::new().route(
        "/api/v1/gk/settings/auto-admit",
        get(get_auto_admit).post(set_auto_admit),
    )
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_auto_admit(Extension(state): Extension<Arc<AppState>>) -> ApiResponse {
    match state.engine.auto_admit().await {
        Ok(enabled) => ok(serde_json::json!({ "status": "ok", "enabled": enabled })),
        Err(e) => error_response(&e),
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn set_auto_admit(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<AutoAdmitRequest>,
) -> ApiResponse {
    match state.engine.toggle_auto_admit(req.enabled).await {
        Ok(()) => ok(serde_json::json!({ "status": "ok", "enabled": req.enabled })),
        Err(e) => error_response(&e),
    }
}

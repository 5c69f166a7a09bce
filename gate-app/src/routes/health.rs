use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use gate_core::RequestStatus;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/gk/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let pool = state.engine.pool().status().await;
    let outstanding = state
        .engine
        .store()
        .list_requests(&RequestStatus::OUTSTANDING)
        .await
        .map(|requests| requests.len());
    let auto_admit = state.engine.auto_admit().await;

    let store_ok = outstanding.is_ok() && auto_admit.is_ok();
    let delegates_ok = pool
        .as_ref()
        .is_ok_and(|status| status.active_accounts > 0);

    Json(serde_json::json!({
        "status": if store_ok && delegates_ok { "ok" } else { "degraded" },
        "ready": store_ok && delegates_ok,
        "checked_at": Utc::now(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "checks": {
            "store": {
                "ok": store_ok,
                "outstanding_requests": outstanding.as_ref().ok(),
                "auto_admit": auto_admit.as_ref().ok(),
            },
            "delegates": match &pool {
                Ok(status) => serde_json::json!({ "ok": delegates_ok, "pool": status }),
                Err(e) => serde_json::json!({ "ok": false, "error": e.to_string() }),
            },
        }
    }))
}

pub mod delegates;
pub mod health;
pub mod rate_limits;
pub mod requests;
pub mod settings;

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use gate_core::AdmissionError;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(requests::router())
        .merge(delegates::router())
        .merge(settings::router())
        .merge(rate_limits::router())
}

pub(crate) type ApiResponse = (StatusCode, Json<serde_json::Value>);

pub(crate) fn ok(body: serde_json::Value) -> ApiResponse {
    (StatusCode::OK, Json(body))
}

pub(crate) fn error_response(error: &AdmissionError) -> ApiResponse {
    let status = match error {
        AdmissionError::RequestNotFound(_)
        | AdmissionError::DelegateNotFound(_)
        | AdmissionError::UnknownSpace(_) => StatusCode::NOT_FOUND,
        AdmissionError::AlreadyResolved { .. }
        | AdmissionError::NotInReview(_)
        | AdmissionError::DuplicateRequest(_) => {
            StatusCode::CONFLICT
        }
        AdmissionError::Blocked(_) => StatusCode::TOO_MANY_REQUESTS,
        AdmissionError::PoolExhausted
        | AdmissionError::NoDelegateAvailable
        | AdmissionError::TemporarilyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::warn!(error = %error, "control api request failed");
    }
    (
        status,
        Json(serde_json::json!({
            "status": "error",
            "error": error.to_string(),
        })),
    )
}

use crate::config::GatekeepConfig;
use axum::Json;
use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, Clone, Default)]
pub struct MutatingAuthPolicy {
    pub control_api_key: Option<String>,
    /// Without a key, mutating calls are only accepted when the server listens on loopback.
    pub allow_insecure_mutating_requests: bool,
}

impl MutatingAuthPolicy {
    pub fn from_config(cfg: &GatekeepConfig) -> Self {
        let control_api_key = cfg.control_api_key().map(str::to_string);
        let loopback = cfg
            .bind_addr()
            .map(|addr| addr.ip().is_loopback())
            .unwrap_or(false);
        Self {
            allow_insecure_mutating_requests: control_api_key.is_none() && loopback,
            control_api_key,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MutatingAuthPolicyExt(pub MutatingAuthPolicy);

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn parse_bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let mut parts = raw.trim().splitn(2, char::is_whitespace);
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = parts.next()?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Length-independent comparison so response timing doesn't leak key prefixes.
fn tokens_match(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    let mut diff = provided.len() ^ expected.len();
    for (i, byte) in expected.iter().enumerate() {
        diff |= usize::from(byte ^ provided.get(i).copied().unwrap_or(0));
    }
    diff == 0
}

fn unauthorized(code: &str, message: impl Into<String>) -> Response {
    let message = message.into();
    tracing::warn!(error_code = code, error = %message, "mutating auth rejected");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "status": "error",
            "error": message,
            "error_code": code,
        })),
    )
        .into_response()
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn require_mutating_auth(req: Request<Body>, next: Next) -> Response {
    if !is_mutating(req.method()) {
        return next.run(req).await;
    }

    let policy = req
        .extensions()
        .get::<MutatingAuthPolicyExt>()
        .map(|v| v.0.clone())
        .unwrap_or_default();

    if let Some(expected) = policy.control_api_key.as_deref() {
        let Some(provided) = parse_bearer_token(req.headers()) else {
            return unauthorized("missing_bearer_token", "missing bearer token");
        };
        if !tokens_match(&provided, expected) {
            return unauthorized("invalid_bearer_token", "invalid bearer token");
        }
        return next.run(req).await;
    }

    if policy.allow_insecure_mutating_requests {
        return next.run(req).await;
    }

    unauthorized(
        "missing_control_api_auth_config",
        "mutating requests on a non-loopback bind require runtime.control_api_key",
    )
}

//! Delegate sessions served by an out-of-process MTProto bridge speaking JSON over HTTP.
//!
//! Failures arrive as `{"error": {"code", "message", "retry_after_secs"}}` and are
//! classified here so nothing past this module sees raw platform text.

use crate::classify::{classify, classify_error};
use crate::error::{PlatformError, PlatformErrorKind, Result};
use crate::traits::{DelegateSession, PlatformConnector};
use crate::types::{
    DelegateCredential, DelegateProfile, InviteConstraints, InviteLink, SpaceId, UserId,
};
use anyhow::anyhow;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct HttpBridgeConnector {
    inner: Arc<BridgeClient>,
}

struct BridgeClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpBridgeConnector {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        Self::with_options(base_url, None, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_options(
        base_url: &str,
        auth_token: Option<String>,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let base_url = normalize_http_url(base_url, "bridge.base_url")?;
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        let auth_token = auth_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned);
        Ok(Self {
            inner: Arc::new(BridgeClient {
                http,
                base_url,
                auth_token,
            }),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Reachability probe used by `doctor`.
    pub async fn health(&self) -> Result<()> {
        let response = self
            .inner
            .authorized_request(self.inner.http.get(self.inner.url("/v1/health")))
            .send()
            .await?;
        read_json::<serde_json::Value>(response).await.map(|_| ())
    }
}

#[async_trait::async_trait]
impl PlatformConnector for HttpBridgeConnector {
    async fn authenticate(
        &self,
        credential: &DelegateCredential,
    ) -> Result<Arc<dyn DelegateSession>> {
        let payload = serde_json::json!({ "session": credential.expose() });
        let response = self
            .inner
            .authorized_request(self.inner.http.post(self.inner.url("/v1/sessions")))
            .json(&payload)
            .send()
            .await?;
        let opened: OpenedSession = read_json(response).await?;
        let session_id = opened.session_id.trim().to_string();
        if session_id.is_empty() {
            return Err(PlatformError::new(
                PlatformErrorKind::Unauthorized,
                "bridge returned an empty session id",
            ));
        }
        tracing::debug!(
            session_id = %session_id,
            delegate = %opened.profile.external_id,
            "bridge session opened"
        );
        Ok(Arc::new(HttpBridgeSession {
            client: self.inner.clone(),
            session_id,
            profile: opened.profile,
        }))
    }
}

pub struct HttpBridgeSession {
    client: Arc<BridgeClient>,
    session_id: String,
    profile: DelegateProfile,
}

impl HttpBridgeSession {
    fn session_url(&self, suffix: &str) -> String {
        self.client
            .url(&format!("/v1/sessions/{}{suffix}", self.session_id))
    }
}

#[async_trait::async_trait]
impl DelegateSession for HttpBridgeSession {
    fn profile(&self) -> &DelegateProfile {
        &self.profile
    }

    async fn add_member(&self, space_id: SpaceId, user_id: UserId) -> Result<()> {
        let payload = serde_json::json!({ "space_id": space_id, "user_id": user_id });
        let response = self
            .client
            .authorized_request(self.client.http.post(self.session_url("/members/add")))
            .json(&payload)
            .send()
            .await?;
        read_json::<serde_json::Value>(response).await.map(|_| ())
    }

    async fn create_invite(
        &self,
        space_id: SpaceId,
        constraints: &InviteConstraints,
    ) -> Result<InviteLink> {
        let payload = serde_json::json!({
            "space_id": space_id,
            "expire_secs": constraints.expires_in.map(|d| d.as_secs()),
            "member_limit": constraints.member_limit,
            "name": constraints.name,
        });
        let response = self
            .client
            .authorized_request(self.client.http.post(self.session_url("/invites")))
            .json(&payload)
            .send()
            .await?;
        let link: InviteLink = read_json(response).await?;
        if link.url.trim().is_empty() {
            return Err(PlatformError::new(
                PlatformErrorKind::Other,
                "bridge returned an empty invite url",
            ));
        }
        Ok(link)
    }

    async fn list_members(&self, space_id: SpaceId) -> Result<Vec<UserId>> {
        let response = self
            .client
            .authorized_request(
                self.client
                    .http
                    .get(self.session_url(&format!("/spaces/{space_id}/members"))),
            )
            .send()
            .await?;
        let body: serde_json::Value = read_json(response).await?;
        Ok(extract_member_ids(body))
    }

    async fn register_contact(&self, user_id: UserId, display_name: &str) -> Result<()> {
        let payload = serde_json::json!({ "user_id": user_id, "display_name": display_name });
        let response = self
            .client
            .authorized_request(self.client.http.post(self.session_url("/contacts")))
            .json(&payload)
            .send()
            .await?;
        read_json::<serde_json::Value>(response).await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        let response = self
            .client
            .authorized_request(self.client.http.delete(self.session_url("")))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        read_json::<serde_json::Value>(response).await.map(|_| ())
    }
}

impl BridgeClient {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    fn authorized_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenedSession {
    session_id: String,
    profile: DelegateProfile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BridgeErrorEnvelope {
    error: Option<BridgeErrorBody>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BridgeErrorBody {
    code: Option<String>,
    message: Option<String>,
    retry_after_secs: Option<u64>,
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(error_from_response(status, &body));
    }
    let body = if body.trim().is_empty() { "null" } else { body.as_str() };
    serde_json::from_str(body).map_err(|e| {
        PlatformError::new(
            PlatformErrorKind::Other,
            format!("bridge returned malformed body: {e}"),
        )
    })
}

fn error_from_response(status: StatusCode, body: &str) -> PlatformError {
    let envelope: BridgeErrorEnvelope = serde_json::from_str(body).unwrap_or_default();
    if let Some(error) = envelope.error {
        let message = error.message.unwrap_or_default();
        let classified = classify_error(
            error.code.as_deref(),
            &message,
            error.retry_after_secs.map(Duration::from_secs),
        );
        if classified.kind != PlatformErrorKind::Other {
            return classified;
        }
        return PlatformError {
            kind: kind_from_status(status).unwrap_or(PlatformErrorKind::Other),
            ..classified
        };
    }

    let kind = kind_from_status(status).unwrap_or_else(|| classify(None, body));
    PlatformError::new(kind, format!("status={status} body={}", body.trim()))
}

fn kind_from_status(status: StatusCode) -> Option<PlatformErrorKind> {
    match status {
        StatusCode::TOO_MANY_REQUESTS => Some(PlatformErrorKind::RateLimited),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Some(PlatformErrorKind::Unauthorized),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            Some(PlatformErrorKind::Timeout)
        }
        s if s.is_server_error() => Some(PlatformErrorKind::Unavailable),
        _ => None,
    }
}

fn extract_member_ids(body: serde_json::Value) -> Vec<UserId> {
    let items = match body {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => match map.remove("members") {
            Some(serde_json::Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|item| match item {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::Object(map) => map.get("user_id").and_then(|v| v.as_i64()),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .map(UserId::new)
        .collect()
}

pub(crate) fn normalize_http_url(raw: &str, field: &str) -> anyhow::Result<String> {
    let normalized = raw.trim().to_string();
    if normalized.is_empty() {
        return Err(anyhow!("{field} is required"));
    }
    let parsed = Url::parse(&normalized).map_err(|e| anyhow!("invalid {field}: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(normalized),
        other => Err(anyhow!("invalid {field} scheme: {other}")),
    }
}

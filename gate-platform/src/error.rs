use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlatformError>;

/// Closed set of failure kinds the admission core is allowed to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformErrorKind {
    AlreadyMember,
    PrivacyRestricted,
    RateLimited,
    MutualContactRequired,
    /// The delegate session or its credential was rejected by the platform.
    Unauthorized,
    Timeout,
    /// Transport-level failure or a server-side error on the bridge.
    Unavailable,
    Other,
}

impl PlatformErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyMember => "already_member",
            Self::PrivacyRestricted => "privacy_restricted",
            Self::RateLimited => "rate_limited",
            Self::MutualContactRequired => "mutual_contact_required",
            Self::Unauthorized => "unauthorized",
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::Other => "other",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable)
    }
}

impl fmt::Display for PlatformErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified platform failure.
///
/// `detail` carries the raw platform text for logs only; it is never shown to users.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("platform error ({kind}): {detail}")]
pub struct PlatformError {
    pub kind: PlatformErrorKind,
    pub detail: String,
    pub retry_after: Option<Duration>,
}

impl PlatformError {
    pub fn new(kind: PlatformErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            retry_after: None,
        }
    }

    pub fn timeout(operation: &str, after: Duration) -> Self {
        Self::new(
            PlatformErrorKind::Timeout,
            format!("{operation} did not complete within {}ms", after.as_millis()),
        )
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn kind(&self) -> PlatformErrorKind {
        self.kind
    }
}

impl From<reqwest::Error> for PlatformError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            PlatformErrorKind::Timeout
        } else if e.is_connect() || e.is_request() || e.is_body() {
            PlatformErrorKind::Unavailable
        } else {
            PlatformErrorKind::Other
        };
        Self::new(kind, e.to_string())
    }
}

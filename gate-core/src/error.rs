use crate::types::{DelegateId, RequestId, RequestStatus};
use gate_platform::{PlatformError, SpaceId, UserId};
use gate_vault::VaultError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AdmissionError>;

#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Vault or authentication failure for one delegate. Fatal for that delegate only.
    #[error("delegate credential unavailable: {0}")]
    Credential(String),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("delegate pool exhausted: no active delegate accounts remain")]
    PoolExhausted,

    #[error("no delegate available")]
    NoDelegateAvailable,

    #[error("admission temporarily unavailable")]
    TemporarilyUnavailable,

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("user {0} is blocked by the rate limiter")]
    Blocked(UserId),

    #[error("user already has outstanding request {0}")]
    DuplicateRequest(RequestId),

    #[error("join request {0} not found")]
    RequestNotFound(RequestId),

    #[error("join request {id} already resolved as {status}")]
    AlreadyResolved { id: RequestId, status: RequestStatus },

    /// The request is still inside an automatic attempt and cannot be decided yet.
    #[error("join request {0} is still being processed")]
    NotInReview(RequestId),

    #[error("space {0} is not configured")]
    UnknownSpace(SpaceId),

    #[error("delegate {0} not found")]
    DelegateNotFound(DelegateId),
}

impl From<rusqlite::Error> for AdmissionError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<VaultError> for AdmissionError {
    fn from(e: VaultError) -> Self {
        Self::Credential(e.to_string())
    }
}

impl From<tokio::task::JoinError> for AdmissionError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Persistence(format!("store task failed: {e}"))
    }
}

impl From<chrono::ParseError> for AdmissionError {
    fn from(e: chrono::ParseError) -> Self {
        Self::Persistence(format!("invalid persisted timestamp: {e}"))
    }
}

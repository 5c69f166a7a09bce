//! Join-request admission for gatekeep.
//!
//! Users ask to join a configured space; a pool of delegate accounts performs the
//! membership change on the platform, with invite links, contact exchange and
//! operator review as fallbacks. All state lives in SQLite.

mod admission;
mod error;
mod notify;
mod pool;
mod rate_limit;
mod settings;
mod store;
mod types;

#[cfg(test)]
mod testing;

pub use admission::{AdmissionConfig, AdmissionEngine, DEFAULT_INVITE_EXPIRY};
pub use error::{AdmissionError, Result};
pub use notify::{Notifier, NotifyError, OperatorNotice, UserNotice};
pub use pool::{
    DEFAULT_CALL_TIMEOUT, DEFAULT_MAX_ADMISSIONS_PER_DAY, DelegateLease, DelegatePool, PoolConfig,
    PoolStatus, RetireReason,
};
pub use rate_limit::{
    AdmitOutcome, BlockExpiry, DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW, DuplicatePolicy,
    RateLimitDecision, RateLimitPolicy, RateLimiter,
};
pub use settings::{AUTO_ADMIT_KEY, Settings, SqliteSettings};
pub use store::{Store, Transition};
pub use types::{
    AdmissionAction, AdmissionLogEntry, DecidedBy, DelegateAccount, DelegateId, JoinRequest,
    LogContext, OutcomeDetail, RateLimitRecord, RequestId, RequestStatus, Space,
};

use chrono::{DateTime, NaiveDate, Utc};
use gate_platform::{SpaceId, UserId, id_newtype};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

id_newtype!(RequestId);
id_newtype!(DelegateId);

/// A group space users can ask to join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub id: SpaceId,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    LinkSent,
    ManualCheck,
    ContactSent,
}

impl RequestStatus {
    pub const OUTSTANDING: [RequestStatus; 2] = [RequestStatus::Pending, RequestStatus::ManualCheck];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::LinkSent => "link_sent",
            Self::ManualCheck => "manual_check",
            Self::ContactSent => "contact_sent",
        }
    }

    /// `pending` and `manual_check` still expect a decision.
    pub fn is_outstanding(self) -> bool {
        matches!(self, Self::Pending | Self::ManualCheck)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "link_sent" => Ok(Self::LinkSent),
            "manual_check" => Ok(Self::ManualCheck),
            "contact_sent" => Ok(Self::ContactSent),
            other => Err(format!("unknown request status: {other}")),
        }
    }
}

/// Machine-readable reason attached to a request's current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeDetail {
    Verified,
    AlreadyMember,
    InviteSent,
    /// `add_member` reported success but the user was not in the member list.
    InviteAfterUnverifiedAdd,
    ContactExchange,
    AwaitingOperator,
    InviteFailed,
    ContactFailed,
    PoolExhausted,
    NoDelegate,
    TemporarilyUnavailable,
    PlatformError,
    OperatorRejected,
    Recovered,
}

impl OutcomeDetail {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::AlreadyMember => "already_member",
            Self::InviteSent => "invite_sent",
            Self::InviteAfterUnverifiedAdd => "invite_after_unverified_add",
            Self::ContactExchange => "contact_exchange",
            Self::AwaitingOperator => "awaiting_operator",
            Self::InviteFailed => "invite_failed",
            Self::ContactFailed => "contact_failed",
            Self::PoolExhausted => "pool_exhausted",
            Self::NoDelegate => "no_delegate",
            Self::TemporarilyUnavailable => "temporarily_unavailable",
            Self::PlatformError => "platform_error",
            Self::OperatorRejected => "operator_rejected",
            Self::Recovered => "recovered",
        }
    }
}

impl fmt::Display for OutcomeDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutcomeDetail {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let detail = match s {
            "verified" => Self::Verified,
            "already_member" => Self::AlreadyMember,
            "invite_sent" => Self::InviteSent,
            "invite_after_unverified_add" => Self::InviteAfterUnverifiedAdd,
            "contact_exchange" => Self::ContactExchange,
            "awaiting_operator" => Self::AwaitingOperator,
            "invite_failed" => Self::InviteFailed,
            "contact_failed" => Self::ContactFailed,
            "pool_exhausted" => Self::PoolExhausted,
            "no_delegate" => Self::NoDelegate,
            "temporarily_unavailable" => Self::TemporarilyUnavailable,
            "platform_error" => Self::PlatformError,
            "operator_rejected" => Self::OperatorRejected,
            "recovered" => Self::Recovered,
            other => return Err(format!("unknown outcome detail: {other}")),
        };
        Ok(detail)
    }
}

/// Who moved a request out of an outstanding state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum DecidedBy {
    System,
    Operator(UserId),
}

impl DecidedBy {
    pub(crate) fn to_db(self) -> String {
        match self {
            Self::System => "system".to_string(),
            Self::Operator(id) => format!("operator:{id}"),
        }
    }

    pub(crate) fn from_db(value: &str) -> Option<Self> {
        if value == "system" {
            return Some(Self::System);
        }
        value
            .strip_prefix("operator:")
            .and_then(|id| id.parse().ok())
            .map(Self::Operator)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinRequest {
    pub id: RequestId,
    pub user_id: UserId,
    pub space_id: SpaceId,
    pub display_name: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub decided_by: Option<DecidedBy>,
    pub decided_at: Option<DateTime<Utc>>,
    pub delegate_id: Option<DelegateId>,
    pub detail: Option<OutcomeDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DelegateAccount {
    pub id: DelegateId,
    /// Platform identity the credential belongs to (phone number or account handle).
    pub external_ref: String,
    #[serde(skip_serializing)]
    pub sealed_credential: String,
    pub active: bool,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub daily_count: u32,
    pub daily_reset_on: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl DelegateAccount {
    /// Admissions performed on `today`, treating a stale reset date as zero.
    pub fn admissions_on(&self, today: NaiveDate) -> u32 {
        match self.daily_reset_on {
            Some(day) if day == today => self.daily_count,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitRecord {
    pub user_id: UserId,
    pub active: bool,
    pub blocked_at: DateTime<Utc>,
    pub reason: String,
    pub cleared_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionAction {
    Requested,
    Admitted,
    AlreadyMember,
    InviteSent,
    ContactSent,
    SentToReview,
    Rejected,
    OperatorApproved,
    OperatorRejected,
    DelegateRotated,
    DelegateRetired,
    UserBlocked,
    UserUnblocked,
}

impl AdmissionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Admitted => "admitted",
            Self::AlreadyMember => "already_member",
            Self::InviteSent => "invite_sent",
            Self::ContactSent => "contact_sent",
            Self::SentToReview => "sent_to_review",
            Self::Rejected => "rejected",
            Self::OperatorApproved => "operator_approved",
            Self::OperatorRejected => "operator_rejected",
            Self::DelegateRotated => "delegate_rotated",
            Self::DelegateRetired => "delegate_retired",
            Self::UserBlocked => "user_blocked",
            Self::UserUnblocked => "user_unblocked",
        }
    }
}

/// One row of the append-only audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionLogEntry {
    pub id: i64,
    pub action: String,
    pub user_id: Option<UserId>,
    pub space_id: Option<SpaceId>,
    pub delegate_id: Option<DelegateId>,
    pub request_id: Option<RequestId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogContext {
    pub user_id: Option<UserId>,
    pub space_id: Option<SpaceId>,
    pub delegate_id: Option<DelegateId>,
    pub request_id: Option<RequestId>,
}

impl LogContext {
    pub fn for_request(request: &JoinRequest) -> Self {
        Self {
            user_id: Some(request.user_id),
            space_id: Some(request.space_id),
            delegate_id: request.delegate_id,
            request_id: Some(request.id),
        }
    }

    pub fn for_delegate(delegate_id: DelegateId) -> Self {
        Self {
            delegate_id: Some(delegate_id),
            ..Self::default()
        }
    }
}

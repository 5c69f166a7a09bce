//! The join-request state machine.
//!
//! Every status change is persisted through a conditional update before any
//! notification goes out. A transition whose source status no longer matches is
//! dropped silently, so a late duplicate can never overwrite a resolved request.

use crate::error::{AdmissionError, Result};
use crate::notify::{Notifier, OperatorNotice, UserNotice};
use crate::pool::{DelegateLease, DelegatePool, RetireReason};
use crate::rate_limit::{AdmitOutcome, RateLimiter};
use crate::settings::{AUTO_ADMIT_KEY, Settings};
use crate::store::{Store, Transition};
use crate::types::{
    AdmissionAction, DecidedBy, DelegateAccount, DelegateId, JoinRequest, LogContext,
    OutcomeDetail, RequestId, RequestStatus, Space,
};
use chrono::Utc;
use gate_platform::{
    DelegateSession, InviteConstraints, PlatformError, PlatformErrorKind, SpaceId, UserId,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_INVITE_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionConfig {
    pub spaces: Vec<Space>,
    pub invite_expiry: Duration,
    /// Used when the `auto_admit` setting has never been written.
    pub default_auto_admit: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            spaces: Vec::new(),
            invite_expiry: DEFAULT_INVITE_EXPIRY,
            default_auto_admit: true,
        }
    }
}

/// How a request leaves its current state, and who hears about it.
struct Settlement {
    to: RequestStatus,
    detail: OutcomeDetail,
    action: AdmissionAction,
    decided_by: Option<DecidedBy>,
    delegate_id: Option<DelegateId>,
    user_notice: Option<UserNotice>,
    operator_notice: Option<OperatorEvent>,
}

enum OperatorEvent {
    Review(&'static str),
    Admitted(String),
}

struct EngineInner {
    store: Store,
    pool: DelegatePool,
    limiter: RateLimiter,
    settings: Arc<dyn Settings>,
    notifier: Arc<dyn Notifier>,
    config: AdmissionConfig,
}

#[derive(Clone)]
pub struct AdmissionEngine {
    inner: Arc<EngineInner>,
}

impl AdmissionEngine {
    pub fn new(
        store: Store,
        pool: DelegatePool,
        limiter: RateLimiter,
        settings: Arc<dyn Settings>,
        notifier: Arc<dyn Notifier>,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                pool,
                limiter,
                settings,
                notifier,
                config,
            }),
        }
    }

    pub fn spaces(&self) -> &[Space] {
        &self.inner.config.spaces
    }

    pub fn pool(&self) -> &DelegatePool {
        &self.inner.pool
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Entry point for a user asking to join `space_id`.
    #[tracing::instrument(level = "info", skip_all, fields(user_id = %user_id, space_id = %space_id))]
    pub async fn request_admission(
        &self,
        user_id: UserId,
        space_id: SpaceId,
        display_name: &str,
    ) -> Result<JoinRequest> {
        let space = self.space(space_id)?;
        let outcome = self
            .inner
            .limiter
            .admit(user_id, space_id, display_name, Utc::now())
            .await?;
        let request = match outcome {
            AdmitOutcome::Created(request) => request,
            AdmitOutcome::Reused(request) => {
                self.notify_user(
                    user_id,
                    UserNotice::DuplicatePending {
                        space_name: space.name.clone(),
                    },
                )
                .await;
                return Ok(request);
            }
            AdmitOutcome::Duplicate(request) => {
                self.notify_user(
                    user_id,
                    UserNotice::DuplicatePending {
                        space_name: space.name.clone(),
                    },
                )
                .await;
                return Err(AdmissionError::DuplicateRequest(request.id));
            }
            AdmitOutcome::Blocked { newly_blocked } => {
                self.notify_user(user_id, UserNotice::RateLimited).await;
                if newly_blocked {
                    self.notify_operators(OperatorNotice::UserBlocked {
                        user_id,
                        reason: format!(
                            "more than {} requests within {}s",
                            self.inner.limiter.policy().max_requests,
                            self.inner.limiter.policy().window.as_secs()
                        ),
                    })
                    .await;
                }
                return Err(AdmissionError::Blocked(user_id));
            }
        };
        tracing::info!(request_id = %request.id, "join request accepted");

        if !self.auto_admit().await? {
            return self
                .park(
                    &request,
                    &space,
                    &[RequestStatus::Pending],
                    OutcomeDetail::AwaitingOperator,
                    "auto-admit is disabled",
                    Some(UserNotice::AwaitingReview {
                        space_name: space.name.clone(),
                    }),
                )
                .await;
        }

        let mut lease = match self.inner.pool.acquire().await {
            Ok(lease) => lease,
            Err(error) => {
                return self
                    .handle_pool_error(&request, &space, &[RequestStatus::Pending], error)
                    .await;
            }
        };
        self.attempt(
            &mut lease,
            &request,
            &space,
            &[RequestStatus::Pending],
            DecidedBy::System,
        )
        .await
    }

    /// Operator verdict on a request in `manual_check`.
    ///
    /// Approval runs exactly one platform attempt: the request is re-checked under
    /// the pool lease, so a second approval finds it already resolved. A `pending`
    /// request belongs to its in-flight attempt and is refused either way.
    #[tracing::instrument(level = "info", skip_all, fields(request_id = %request_id, approved, operator_id = %operator_id))]
    pub async fn decide(
        &self,
        request_id: RequestId,
        approved: bool,
        operator_id: UserId,
    ) -> Result<JoinRequest> {
        let request = self.load_request(request_id).await?;
        let space = self.space_or_placeholder(request.space_id);
        let decided_by = DecidedBy::Operator(operator_id);
        awaiting_review(&request)?;

        if !approved {
            let _held = self.inner.pool.hold().await;
            let current = self.load_request(request_id).await?;
            awaiting_review(&current)?;
            return self
                .settle(
                    &current,
                    &[RequestStatus::ManualCheck],
                    Settlement {
                        to: RequestStatus::Rejected,
                        detail: OutcomeDetail::OperatorRejected,
                        action: AdmissionAction::OperatorRejected,
                        decided_by: Some(decided_by),
                        delegate_id: None,
                        user_notice: Some(UserNotice::Rejected {
                            space_name: space.name.clone(),
                        }),
                        operator_notice: None,
                    },
                )
                .await;
        }

        let mut lease = match self.inner.pool.acquire().await {
            Ok(lease) => lease,
            Err(error) => {
                return self
                    .handle_pool_error(&request, &space, &[RequestStatus::ManualCheck], error)
                    .await;
            }
        };
        let current = self.load_request(request_id).await?;
        awaiting_review(&current)?;
        self.append_log(AdmissionAction::OperatorApproved, LogContext::for_request(&current))
            .await;
        self.attempt(
            &mut lease,
            &current,
            &space,
            &[RequestStatus::ManualCheck],
            decided_by,
        )
        .await
    }

    pub async fn force_rotate_delegate(&self) -> Result<DelegateAccount> {
        self.inner.pool.force_rotate().await
    }

    pub async fn toggle_auto_admit(&self, enabled: bool) -> Result<()> {
        self.inner
            .settings
            .set(AUTO_ADMIT_KEY, if enabled { "true" } else { "false" })
            .await?;
        tracing::info!(enabled, "auto-admit toggled");
        Ok(())
    }

    pub async fn auto_admit(&self) -> Result<bool> {
        self.inner
            .settings
            .get_bool(AUTO_ADMIT_KEY, self.inner.config.default_auto_admit)
            .await
    }

    pub async fn unblock_rate_limit(&self, user_id: UserId) -> Result<bool> {
        let cleared = self.inner.limiter.unblock(user_id, Utc::now()).await?;
        if cleared {
            tracing::info!(user_id = %user_id, "rate-limit block lifted");
        }
        Ok(cleared)
    }

    pub async fn pending_reviews(&self) -> Result<Vec<JoinRequest>> {
        self.inner
            .store
            .list_requests(&[RequestStatus::ManualCheck])
            .await
    }

    pub async fn stuck_requests(&self) -> Result<Vec<JoinRequest>> {
        self.inner
            .store
            .list_requests(&RequestStatus::OUTSTANDING)
            .await
    }

    /// Startup sweep: requests left `pending` by a crash move to review, and operators
    /// hear about every request still waiting for a decision.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn recover(&self) -> Result<usize> {
        let stuck = self.stuck_requests().await?;
        let mut reported = 0;
        for request in stuck {
            let request = if request.status == RequestStatus::Pending {
                match self
                    .inner
                    .store
                    .transition_request(
                        request.id,
                        &[RequestStatus::Pending],
                        Transition {
                            to: RequestStatus::ManualCheck,
                            decided_by: None,
                            delegate_id: None,
                            detail: Some(OutcomeDetail::Recovered),
                        },
                        Utc::now(),
                    )
                    .await?
                {
                    Some(updated) => updated,
                    None => continue,
                }
            } else {
                request
            };
            let space = self.space_or_placeholder(request.space_id);
            self.notify_operators(OperatorNotice::StuckRequest {
                request,
                space_name: space.name,
            })
            .await;
            reported += 1;
        }
        if reported > 0 {
            tracing::info!(reported, "re-notified operators about unfinished requests");
        }
        Ok(reported)
    }

    /// Drives one request through the platform with the leased delegate.
    async fn attempt(
        &self,
        lease: &mut DelegateLease,
        request: &JoinRequest,
        space: &Space,
        from: &[RequestStatus],
        decided_by: DecidedBy,
    ) -> Result<JoinRequest> {
        // One transparent retry on a fresh delegate, whatever retired the first.
        let mut rotated = false;
        let mut retried_transient = false;

        loop {
            let session = lease.session()?;
            let delegate_id = lease.delegate_id();
            let delegate_ref = lease
                .delegate()
                .map(|account| account.external_ref.clone())
                .unwrap_or_default();

            let error = match self
                .call("add_member", session.add_member(space.id, request.user_id))
                .await
            {
                Ok(()) => {
                    lease.record_admission().await?;
                    return self
                        .verify_membership(
                            session.as_ref(),
                            request,
                            space,
                            from,
                            decided_by,
                            delegate_id,
                            delegate_ref,
                        )
                        .await;
                }
                Err(error) => error,
            };

            tracing::info!(
                request_id = %request.id,
                delegate_id = ?delegate_id,
                kind = %error.kind,
                detail = %error.detail,
                retry_after_secs = ?error.retry_after.map(|wait| wait.as_secs()),
                "add_member failed"
            );
            match error.kind {
                PlatformErrorKind::AlreadyMember => {
                    return self
                        .settle(
                            request,
                            from,
                            Settlement {
                                to: RequestStatus::Approved,
                                detail: OutcomeDetail::AlreadyMember,
                                action: AdmissionAction::AlreadyMember,
                                decided_by: Some(decided_by),
                                delegate_id,
                                user_notice: Some(UserNotice::AlreadyMember {
                                    space_name: space.name.clone(),
                                }),
                                operator_notice: None,
                            },
                        )
                        .await;
                }
                PlatformErrorKind::PrivacyRestricted => {
                    return self
                        .send_invite(
                            session.as_ref(),
                            request,
                            space,
                            from,
                            decided_by,
                            delegate_id,
                            OutcomeDetail::InviteSent,
                        )
                        .await;
                }
                PlatformErrorKind::MutualContactRequired => {
                    return self
                        .exchange_contact(session.as_ref(), request, space, from, decided_by, delegate_id)
                        .await;
                }
                PlatformErrorKind::RateLimited | PlatformErrorKind::Unauthorized => {
                    let reason = if error.kind == PlatformErrorKind::RateLimited {
                        RetireReason::RateLimited
                    } else {
                        RetireReason::CredentialRejected
                    };
                    let already_retried = std::mem::replace(&mut rotated, true);
                    let rebound = lease.retire_and_rebind(reason).await;
                    if already_retried {
                        if let Err(error) = rebound {
                            tracing::warn!(%error, "rotation after repeated failure did not bind a delegate");
                        }
                        return self
                            .reject_unavailable(request, space, from, decided_by, delegate_id)
                            .await;
                    }
                    if let Err(error) = rebound {
                        return self.handle_pool_error(request, space, from, error).await;
                    }
                }
                PlatformErrorKind::Timeout | PlatformErrorKind::Unavailable => {
                    if retried_transient {
                        return self
                            .reject_unavailable(request, space, from, decided_by, delegate_id)
                            .await;
                    }
                    retried_transient = true;
                }
                PlatformErrorKind::Other => {
                    return self
                        .settle(
                            request,
                            from,
                            Settlement {
                                to: RequestStatus::Rejected,
                                detail: OutcomeDetail::PlatformError,
                                action: AdmissionAction::Rejected,
                                decided_by: Some(decided_by),
                                delegate_id,
                                user_notice: Some(UserNotice::Rejected {
                                    space_name: space.name.clone(),
                                }),
                                operator_notice: None,
                            },
                        )
                        .await;
                }
            }
        }
    }

    /// `add_member` returning Ok is not trusted until the member list agrees.
    #[allow(clippy::too_many_arguments)]
    async fn verify_membership(
        &self,
        session: &dyn DelegateSession,
        request: &JoinRequest,
        space: &Space,
        from: &[RequestStatus],
        decided_by: DecidedBy,
        delegate_id: Option<DelegateId>,
        delegate_ref: String,
    ) -> Result<JoinRequest> {
        match self.call("list_members", session.list_members(space.id)).await {
            Ok(members) if members.contains(&request.user_id) => {
                self.settle(
                    request,
                    from,
                    Settlement {
                        to: RequestStatus::Approved,
                        detail: OutcomeDetail::Verified,
                        action: AdmissionAction::Admitted,
                        decided_by: Some(decided_by),
                        delegate_id,
                        user_notice: Some(UserNotice::Approved {
                            space_name: space.name.clone(),
                        }),
                        operator_notice: Some(OperatorEvent::Admitted(delegate_ref)),
                    },
                )
                .await
            }
            Ok(_) => {
                tracing::warn!(
                    request_id = %request.id,
                    "add_member succeeded but user is not listed; falling back to invite"
                );
                self.send_invite(
                    session,
                    request,
                    space,
                    from,
                    decided_by,
                    delegate_id,
                    OutcomeDetail::InviteAfterUnverifiedAdd,
                )
                .await
            }
            Err(error) => {
                tracing::warn!(
                    request_id = %request.id,
                    kind = %error.kind,
                    "membership verification failed; falling back to invite"
                );
                self.send_invite(
                    session,
                    request,
                    space,
                    from,
                    decided_by,
                    delegate_id,
                    OutcomeDetail::InviteAfterUnverifiedAdd,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_invite(
        &self,
        session: &dyn DelegateSession,
        request: &JoinRequest,
        space: &Space,
        from: &[RequestStatus],
        decided_by: DecidedBy,
        delegate_id: Option<DelegateId>,
        detail: OutcomeDetail,
    ) -> Result<JoinRequest> {
        let constraints = InviteConstraints {
            name: Some(format!("request-{}", request.id)),
            ..InviteConstraints::single_use(self.inner.config.invite_expiry)
        };
        match self
            .call("create_invite", session.create_invite(space.id, &constraints))
            .await
        {
            Ok(link) => {
                self.settle(
                    request,
                    from,
                    Settlement {
                        to: RequestStatus::LinkSent,
                        detail,
                        action: AdmissionAction::InviteSent,
                        decided_by: Some(decided_by),
                        delegate_id,
                        user_notice: Some(UserNotice::InviteLink {
                            space_name: space.name.clone(),
                            url: link.url,
                        }),
                        operator_notice: None,
                    },
                )
                .await
            }
            Err(error) => {
                tracing::warn!(request_id = %request.id, kind = %error.kind, "invite creation failed");
                self.park(
                    request,
                    space,
                    from,
                    OutcomeDetail::InviteFailed,
                    "privacy settings block adding and no invite could be created",
                    Some(UserNotice::PrivacyRestricted {
                        space_name: space.name.clone(),
                    }),
                )
                .await
            }
        }
    }

    async fn exchange_contact(
        &self,
        session: &dyn DelegateSession,
        request: &JoinRequest,
        space: &Space,
        from: &[RequestStatus],
        decided_by: DecidedBy,
        delegate_id: Option<DelegateId>,
    ) -> Result<JoinRequest> {
        match self
            .call(
                "register_contact",
                session.register_contact(request.user_id, &request.display_name),
            )
            .await
        {
            Ok(()) => {
                self.settle(
                    request,
                    from,
                    Settlement {
                        to: RequestStatus::ContactSent,
                        detail: OutcomeDetail::ContactExchange,
                        action: AdmissionAction::ContactSent,
                        decided_by: Some(decided_by),
                        delegate_id,
                        user_notice: Some(UserNotice::ContactExchange {
                            space_name: space.name.clone(),
                            contact: session.profile().clone(),
                        }),
                        operator_notice: None,
                    },
                )
                .await
            }
            Err(error) => {
                tracing::warn!(request_id = %request.id, kind = %error.kind, "contact registration failed");
                self.park(
                    request,
                    space,
                    from,
                    OutcomeDetail::ContactFailed,
                    "mutual contact required and registration failed",
                    Some(UserNotice::AwaitingReview {
                        space_name: space.name.clone(),
                    }),
                )
                .await
            }
        }
    }

    async fn reject_unavailable(
        &self,
        request: &JoinRequest,
        space: &Space,
        from: &[RequestStatus],
        decided_by: DecidedBy,
        delegate_id: Option<DelegateId>,
    ) -> Result<JoinRequest> {
        tracing::debug!(space_id = %space.id, "rejecting as temporarily unavailable");
        self.settle(
            request,
            from,
            Settlement {
                to: RequestStatus::Rejected,
                detail: OutcomeDetail::TemporarilyUnavailable,
                action: AdmissionAction::Rejected,
                decided_by: Some(decided_by),
                delegate_id,
                user_notice: Some(UserNotice::TemporarilyUnavailable),
                operator_notice: None,
            },
        )
        .await
    }

    /// Maps a failure to obtain a delegate onto the request, then reports it.
    async fn handle_pool_error(
        &self,
        request: &JoinRequest,
        space: &Space,
        from: &[RequestStatus],
        error: AdmissionError,
    ) -> Result<JoinRequest> {
        let first_time = request.status == RequestStatus::Pending;
        let awaiting = first_time.then(|| UserNotice::AwaitingReview {
            space_name: space.name.clone(),
        });
        match error {
            AdmissionError::PoolExhausted => {
                self.park(
                    request,
                    space,
                    from,
                    OutcomeDetail::PoolExhausted,
                    "delegate pool exhausted",
                    awaiting,
                )
                .await?;
                Err(AdmissionError::PoolExhausted)
            }
            AdmissionError::NoDelegateAvailable => {
                self.park(
                    request,
                    space,
                    from,
                    OutcomeDetail::NoDelegate,
                    "no delegate available",
                    awaiting,
                )
                .await?;
                Err(AdmissionError::NoDelegateAvailable)
            }
            AdmissionError::TemporarilyUnavailable => {
                self.reject_unavailable(request, space, from, DecidedBy::System, None)
                    .await
            }
            other => Err(other),
        }
    }

    /// Moves a request to `manual_check` and asks operators to decide.
    async fn park(
        &self,
        request: &JoinRequest,
        space: &Space,
        from: &[RequestStatus],
        detail: OutcomeDetail,
        reason: &'static str,
        user_notice: Option<UserNotice>,
    ) -> Result<JoinRequest> {
        tracing::debug!(space_id = %space.id, reason, "sending request to review");
        self.settle(
            request,
            from,
            Settlement {
                to: RequestStatus::ManualCheck,
                detail,
                action: AdmissionAction::SentToReview,
                decided_by: None,
                delegate_id: None,
                user_notice,
                operator_notice: Some(OperatorEvent::Review(reason)),
            },
        )
        .await
    }

    /// Persists the transition, then notifies. Nothing is sent if the update did not apply.
    async fn settle(
        &self,
        request: &JoinRequest,
        from: &[RequestStatus],
        settlement: Settlement,
    ) -> Result<JoinRequest> {
        let transition = Transition {
            to: settlement.to,
            decided_by: settlement.decided_by,
            delegate_id: settlement.delegate_id,
            detail: Some(settlement.detail),
        };
        let Some(updated) = self
            .inner
            .store
            .transition_request(request.id, from, transition, Utc::now())
            .await?
        else {
            let current = self.load_request(request.id).await?;
            tracing::info!(
                request_id = %current.id,
                status = %current.status,
                attempted = %settlement.to,
                "request already resolved; transition dropped"
            );
            return Err(AdmissionError::AlreadyResolved {
                id: current.id,
                status: current.status,
            });
        };

        tracing::info!(
            request_id = %updated.id,
            status = %updated.status,
            detail = %settlement.detail,
            delegate_id = ?updated.delegate_id,
            "join request updated"
        );
        self.append_log(settlement.action, LogContext::for_request(&updated))
            .await;

        if let Some(notice) = settlement.user_notice {
            self.notify_user(updated.user_id, notice).await;
        }
        match settlement.operator_notice {
            Some(OperatorEvent::Review(reason)) => {
                let space = self.space_or_placeholder(updated.space_id);
                self.notify_operators(OperatorNotice::ReviewRequested {
                    request: updated.clone(),
                    space_name: space.name,
                    reason: reason.to_string(),
                })
                .await;
            }
            Some(OperatorEvent::Admitted(delegate_ref)) => {
                let space = self.space_or_placeholder(updated.space_id);
                self.notify_operators(OperatorNotice::Admitted {
                    request: updated.clone(),
                    space_name: space.name,
                    delegate_ref,
                })
                .await;
            }
            None => {}
        }
        Ok(updated)
    }

    async fn call<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = std::result::Result<T, PlatformError>>,
    ) -> std::result::Result<T, PlatformError> {
        let timeout = self.inner.pool.config().call_timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(PlatformError::timeout(operation, timeout)),
        }
    }

    async fn load_request(&self, id: RequestId) -> Result<JoinRequest> {
        self.inner
            .store
            .get_request(id)
            .await?
            .ok_or(AdmissionError::RequestNotFound(id))
    }

    fn space(&self, id: SpaceId) -> Result<Space> {
        self.inner
            .config
            .spaces
            .iter()
            .find(|space| space.id == id)
            .cloned()
            .ok_or(AdmissionError::UnknownSpace(id))
    }

    /// Requests may outlive a space's removal from config; keep them decidable.
    fn space_or_placeholder(&self, id: SpaceId) -> Space {
        self.space(id).unwrap_or_else(|_| Space {
            id,
            name: format!("space {id}"),
            description: String::new(),
        })
    }

    async fn append_log(&self, action: AdmissionAction, context: LogContext) {
        if let Err(error) = self.inner.store.append_log(action, context).await {
            tracing::warn!(%error, "failed to append admission log entry");
        }
    }

    async fn notify_user(&self, user_id: UserId, notice: UserNotice) {
        if let Err(error) = self.inner.notifier.notify_user(user_id, notice).await {
            tracing::warn!(%error, user_id = %user_id, "user notification failed");
        }
    }

    async fn notify_operators(&self, notice: OperatorNotice) {
        if let Err(error) = self.inner.notifier.notify_operators(notice).await {
            tracing::warn!(%error, "operator notification failed");
        }
    }
}

/// Only `manual_check` requests take operator decisions.
fn awaiting_review(request: &JoinRequest) -> Result<()> {
    match request.status {
        RequestStatus::ManualCheck => Ok(()),
        RequestStatus::Pending => Err(AdmissionError::NotInReview(request.id)),
        status => Err(AdmissionError::AlreadyResolved {
            id: request.id,
            status,
        }),
    }
}

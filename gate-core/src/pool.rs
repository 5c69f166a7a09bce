//! Delegate account pool.
//!
//! Exactly one delegate is bound at a time. All use of it goes through a
//! [`DelegateLease`], which owns the pool mutex until dropped, so rotation can
//! never happen underneath an admission that is still using the session.

use crate::error::{AdmissionError, Result};
use crate::notify::{Notifier, OperatorNotice};
use crate::store::Store;
use crate::types::{AdmissionAction, DelegateAccount, DelegateId, LogContext};
use chrono::Utc;
use gate_platform::{DelegateCredential, DelegateSession, PlatformConnector};
use gate_vault::CredentialVault;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub const DEFAULT_MAX_ADMISSIONS_PER_DAY: u32 = 40;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Re-select after the bound delegate has served this many admissions.
    pub rotate_after_admissions: Option<u32>,
    pub max_admissions_per_day: u32,
    pub call_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            rotate_after_admissions: None,
            max_admissions_per_day: DEFAULT_MAX_ADMISSIONS_PER_DAY,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    RateLimited,
    CredentialRejected,
}

impl RetireReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate limited by the platform",
            Self::CredentialRejected => "session or credential rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub bound_delegate: Option<DelegateId>,
    pub bound_external_ref: Option<String>,
    pub admissions_served: u32,
    pub active_accounts: usize,
    pub total_accounts: usize,
}

struct Binding {
    account: DelegateAccount,
    session: Arc<dyn DelegateSession>,
    admissions_served: u32,
}

#[derive(Default)]
struct PoolState {
    binding: Option<Binding>,
}

struct PoolInner {
    store: Store,
    vault: CredentialVault,
    connector: Arc<dyn PlatformConnector>,
    notifier: Arc<dyn Notifier>,
    config: PoolConfig,
}

enum SessionFailure {
    /// The account itself is unusable and must be deactivated.
    Retire(String),
    Transient(String),
}

#[derive(Clone)]
pub struct DelegatePool {
    inner: Arc<PoolInner>,
    state: Arc<Mutex<PoolState>>,
}

impl DelegatePool {
    pub fn new(
        store: Store,
        vault: CredentialVault,
        connector: Arc<dyn PlatformConnector>,
        notifier: Arc<dyn Notifier>,
        config: PoolConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                store,
                vault,
                connector,
                notifier,
                config,
            }),
            state: Arc::new(Mutex::new(PoolState::default())),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Checks out the bound delegate, binding one first if needed.
    pub async fn acquire(&self) -> Result<DelegateLease> {
        let mut lease = DelegateLease {
            pool: self.clone(),
            state: self.state.clone().lock_owned().await,
        };
        lease.ensure_bound().await?;
        Ok(lease)
    }

    /// Takes the pool without binding, so the holder waits out any in-flight attempt.
    pub async fn hold(&self) -> DelegateLease {
        DelegateLease {
            pool: self.clone(),
            state: self.state.clone().lock_owned().await,
        }
    }

    /// Moves the binding to the next least-used delegate. The current one stays active.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn force_rotate(&self) -> Result<DelegateAccount> {
        let mut lease = DelegateLease {
            pool: self.clone(),
            state: self.state.clone().lock_owned().await,
        };
        let previous = lease.delegate_id();
        let exclude = previous.into_iter().collect();
        let account = lease.bind_next(exclude).await?;
        self.record_rotation(previous, account.id, "operator request")
            .await;
        Ok(account)
    }

    pub async fn list_active(&self) -> Result<Vec<DelegateAccount>> {
        self.inner.store.list_delegates(true).await
    }

    pub async fn list_all(&self) -> Result<Vec<DelegateAccount>> {
        self.inner.store.list_delegates(false).await
    }

    /// Deactivates an account, unbinding it if it is the current delegate.
    pub async fn deactivate(&self, id: DelegateId) -> Result<bool> {
        let mut state = self.state.clone().lock_owned().await;
        let changed = self.inner.store.set_delegate_active(id, false).await?;
        if state
            .binding
            .as_ref()
            .is_some_and(|binding| binding.account.id == id)
        {
            if let Some(binding) = state.binding.take() {
                close_quietly(binding.session, self.inner.config.call_timeout).await;
            }
        }
        if changed {
            tracing::info!(delegate_id = %id, "delegate deactivated by operator");
            self.append_log(AdmissionAction::DelegateRetired, id).await;
        }
        Ok(changed)
    }

    pub async fn reactivate(&self, id: DelegateId) -> Result<bool> {
        let changed = self.inner.store.set_delegate_active(id, true).await?;
        if changed {
            tracing::info!(delegate_id = %id, "delegate reactivated");
        }
        Ok(changed)
    }

    /// Seals and stores a delegate credential. Re-registering an identity replaces it.
    pub async fn register(
        &self,
        external_ref: &str,
        credential: &DelegateCredential,
    ) -> Result<DelegateAccount> {
        if external_ref.trim().is_empty() {
            return Err(AdmissionError::Credential(
                "delegate identity is required".to_string(),
            ));
        }
        let sealed = self.inner.vault.encrypt(credential.expose().as_bytes())?;
        let account = self.inner.store.insert_delegate(external_ref, &sealed).await?;
        tracing::info!(delegate_id = %account.id, "delegate registered");
        Ok(account)
    }

    pub async fn status(&self) -> Result<PoolStatus> {
        let all = self.inner.store.list_delegates(false).await?;
        let state = self.state.lock().await;
        let binding = state.binding.as_ref();
        Ok(PoolStatus {
            bound_delegate: binding.map(|b| b.account.id),
            bound_external_ref: binding.map(|b| b.account.external_ref.clone()),
            admissions_served: binding.map(|b| b.admissions_served).unwrap_or_default(),
            active_accounts: all.iter().filter(|account| account.active).count(),
            total_accounts: all.len(),
        })
    }

    async fn open_session(
        &self,
        account: &DelegateAccount,
    ) -> std::result::Result<Arc<dyn DelegateSession>, SessionFailure> {
        let blob = self
            .inner
            .vault
            .decrypt(&account.sealed_credential)
            .map_err(|e| SessionFailure::Retire(e.to_string()))?;
        let credential = DelegateCredential::from_utf8(blob.into_inner()).ok_or_else(|| {
            SessionFailure::Retire("stored credential is not valid text".to_string())
        })?;

        let timeout = self.inner.config.call_timeout;
        match tokio::time::timeout(timeout, self.inner.connector.authenticate(&credential)).await {
            Err(_) => Err(SessionFailure::Transient(format!(
                "authentication did not complete within {}ms",
                timeout.as_millis()
            ))),
            Ok(Ok(session)) => Ok(session),
            Ok(Err(error)) if error.kind.is_retryable() => {
                Err(SessionFailure::Transient(error.detail))
            }
            Ok(Err(error)) => Err(SessionFailure::Retire(format!(
                "authentication failed ({})",
                error.kind
            ))),
        }
    }

    async fn record_rotation(&self, from: Option<DelegateId>, to: DelegateId, reason: &str) {
        tracing::info!(from = ?from, to = %to, reason, "delegate rotated");
        self.append_log(AdmissionAction::DelegateRotated, to).await;
        self.notify(OperatorNotice::Rotated {
            from,
            to,
            reason: reason.to_string(),
        })
        .await;
    }

    async fn append_log(&self, action: AdmissionAction, delegate_id: DelegateId) {
        if let Err(error) = self
            .inner
            .store
            .append_log(action, LogContext::for_delegate(delegate_id))
            .await
        {
            tracing::warn!(%error, "failed to append admission log entry");
        }
    }

    async fn notify(&self, notice: OperatorNotice) {
        if let Err(error) = self.inner.notifier.notify_operators(notice).await {
            tracing::warn!(%error, "operator notification failed");
        }
    }
}

/// Exclusive use of the bound delegate. Dropping the lease releases the pool.
pub struct DelegateLease {
    pool: DelegatePool,
    state: OwnedMutexGuard<PoolState>,
}

impl DelegateLease {
    pub fn delegate(&self) -> Option<&DelegateAccount> {
        self.state.binding.as_ref().map(|binding| &binding.account)
    }

    pub fn delegate_id(&self) -> Option<DelegateId> {
        self.delegate().map(|account| account.id)
    }

    pub fn session(&self) -> Result<Arc<dyn DelegateSession>> {
        self.state
            .binding
            .as_ref()
            .map(|binding| binding.session.clone())
            .ok_or(AdmissionError::NoDelegateAvailable)
    }

    /// Counts a completed platform admission against the bound delegate.
    pub async fn record_admission(&mut self) -> Result<()> {
        let today = Utc::now().date_naive();
        let Some(binding) = self.state.binding.as_mut() else {
            return Ok(());
        };
        binding.admissions_served = binding.admissions_served.saturating_add(1);
        let id = binding.account.id;
        let daily = self.pool.inner.store.record_admission(id, today).await?;
        if let Some(binding) = self.state.binding.as_mut() {
            binding.account.daily_count = daily;
            binding.account.daily_reset_on = Some(today);
        }
        Ok(())
    }

    /// Deactivates the bound delegate and binds the next one.
    ///
    /// Returns [`AdmissionError::PoolExhausted`] when no active account remains.
    #[tracing::instrument(level = "info", skip_all, fields(reason = reason.as_str()))]
    pub async fn retire_and_rebind(&mut self, reason: RetireReason) -> Result<DelegateAccount> {
        let retired = match self.state.binding.take() {
            Some(binding) => {
                let id = binding.account.id;
                close_quietly(binding.session, self.pool.inner.config.call_timeout).await;
                self.pool.inner.store.set_delegate_active(id, false).await?;
                self.pool
                    .append_log(AdmissionAction::DelegateRetired, id)
                    .await;
                tracing::warn!(delegate_id = %id, "delegate retired");
                Some(id)
            }
            None => None,
        };

        match self.bind_next(Vec::new()).await {
            Ok(account) => {
                self.pool
                    .record_rotation(retired, account.id, reason.as_str())
                    .await;
                Ok(account)
            }
            Err(AdmissionError::PoolExhausted) => {
                tracing::error!(last = ?retired, "delegate pool exhausted");
                self.pool
                    .notify(OperatorNotice::PoolExhausted { last: retired })
                    .await;
                Err(AdmissionError::PoolExhausted)
            }
            Err(error) => {
                if let Some(id) = retired {
                    self.pool
                        .notify(OperatorNotice::DelegateRetired {
                            delegate_id: id,
                            reason: reason.as_str().to_string(),
                        })
                        .await;
                }
                Err(error)
            }
        }
    }

    async fn ensure_bound(&mut self) -> Result<()> {
        let config = self.pool.inner.config;
        let today = Utc::now().date_naive();
        let Some(bound_id) = self.delegate_id() else {
            return self.bind_next(Vec::new()).await.map(|_| ());
        };

        // Another process (the operator CLI) may have deactivated the account.
        match self.pool.inner.store.get_delegate(bound_id).await? {
            Some(account) if account.active => {
                if let Some(binding) = self.state.binding.as_mut() {
                    binding.account = account;
                }
            }
            _ => {
                tracing::info!(delegate_id = %bound_id, "bound delegate is no longer active; rebinding");
                if let Some(binding) = self.state.binding.take() {
                    close_quietly(binding.session, config.call_timeout).await;
                }
                let account = self.bind_next(Vec::new()).await?;
                self.pool
                    .record_rotation(Some(bound_id), account.id, "delegate deactivated")
                    .await;
                return Ok(());
            }
        }
        let Some(binding) = self.state.binding.as_mut() else {
            return self.bind_next(Vec::new()).await.map(|_| ());
        };

        let capped = binding.account.admissions_on(today) >= config.max_admissions_per_day;
        let threshold_reached = config
            .rotate_after_admissions
            .is_some_and(|limit| binding.admissions_served >= limit);
        if !capped && !threshold_reached {
            return Ok(());
        }

        let previous = binding.account.id;
        let reason = if capped {
            "daily admission cap reached"
        } else {
            "usage threshold reached"
        };
        match self.bind_next(vec![previous]).await {
            Ok(account) => {
                self.pool
                    .record_rotation(Some(previous), account.id, reason)
                    .await;
                Ok(())
            }
            Err(AdmissionError::NoDelegateAvailable | AdmissionError::PoolExhausted)
                if !capped =>
            {
                // No alternative; keep the current delegate and start a fresh count.
                if let Some(binding) = self.state.binding.as_mut() {
                    binding.admissions_served = 0;
                }
                Ok(())
            }
            Err(error) => {
                if capped {
                    if let Some(binding) = self.state.binding.take() {
                        close_quietly(binding.session, config.call_timeout).await;
                    }
                }
                Err(error)
            }
        }
    }

    /// Selects, authenticates and binds the least-used eligible delegate.
    ///
    /// A credential failure retires that account and tries one more candidate.
    /// The previous binding is only replaced on success.
    async fn bind_next(&mut self, mut exclude: Vec<DelegateId>) -> Result<DelegateAccount> {
        let inner = self.pool.inner.clone();
        let mut credential_failures = 0u32;
        loop {
            let today = Utc::now().date_naive();
            let candidate = inner
                .store
                .next_delegate_candidate(today, inner.config.max_admissions_per_day, exclude.clone())
                .await?;
            let Some(account) = candidate else {
                return Err(self.no_candidate_error().await?);
            };

            match self.pool.open_session(&account).await {
                Ok(session) => {
                    let account = inner.store.record_selection(account.id, Utc::now()).await?;
                    if let Some(previous) = self.state.binding.take() {
                        close_quietly(previous.session, inner.config.call_timeout).await;
                    }
                    tracing::info!(
                        delegate_id = %account.id,
                        usage_count = account.usage_count,
                        "delegate bound"
                    );
                    self.state.binding = Some(Binding {
                        account: account.clone(),
                        session,
                        admissions_served: 0,
                    });
                    return Ok(account);
                }
                Err(SessionFailure::Transient(detail)) => {
                    tracing::warn!(delegate_id = %account.id, %detail, "delegate sign-in unavailable");
                    return Err(AdmissionError::TemporarilyUnavailable);
                }
                Err(SessionFailure::Retire(reason)) => {
                    tracing::warn!(delegate_id = %account.id, %reason, "delegate credential unusable; retiring");
                    inner.store.set_delegate_active(account.id, false).await?;
                    self.pool
                        .append_log(AdmissionAction::DelegateRetired, account.id)
                        .await;
                    self.pool
                        .notify(OperatorNotice::DelegateRetired {
                            delegate_id: account.id,
                            reason: RetireReason::CredentialRejected.as_str().to_string(),
                        })
                        .await;
                    credential_failures += 1;
                    exclude.push(account.id);
                    if credential_failures >= 2 {
                        return Err(self.no_candidate_error().await?);
                    }
                }
            }
        }
    }

    async fn no_candidate_error(&self) -> Result<AdmissionError> {
        if self.pool.inner.store.count_active_delegates().await? == 0 {
            Ok(AdmissionError::PoolExhausted)
        } else {
            Ok(AdmissionError::NoDelegateAvailable)
        }
    }
}

async fn close_quietly(session: Arc<dyn DelegateSession>, timeout: Duration) {
    match tokio::time::timeout(timeout, session.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => tracing::debug!(%error, "delegate session close failed"),
        Err(_) => tracing::debug!("delegate session close timed out"),
    }
}

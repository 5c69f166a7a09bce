//! Scripted platform doubles and a recording notifier for unit tests.

use crate::notify::{Notifier, NotifyError, OperatorNotice, UserNotice};
use crate::pool::{DelegatePool, PoolConfig};
use crate::settings::SqliteSettings;
use crate::store::Store;
use crate::types::DelegateAccount;
use async_trait::async_trait;
use gate_platform::{
    DelegateCredential, DelegateProfile, DelegateSession, InviteConstraints, InviteLink,
    PlatformConnector, PlatformError, PlatformErrorKind, SpaceId, UserId,
};
use gate_vault::CredentialVault;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) const TEST_SECRET: &str = "unit-test-secret-0123456789";

pub(crate) fn platform_error(kind: PlatformErrorKind) -> PlatformError {
    PlatformError::new(kind, format!("scripted {kind}"))
}

pub(crate) struct ScriptedSession {
    profile: DelegateProfile,
    add_results: Mutex<VecDeque<Result<(), PlatformError>>>,
    invite_results: Mutex<VecDeque<Result<InviteLink, PlatformError>>>,
    contact_results: Mutex<VecDeque<Result<(), PlatformError>>>,
    members: Mutex<HashSet<UserId>>,
    hide_added_members: AtomicBool,
    add_delay: Mutex<Option<Duration>>,
    add_calls: AtomicUsize,
    invite_calls: AtomicUsize,
    contact_calls: AtomicUsize,
    list_calls: AtomicUsize,
}

impl ScriptedSession {
    fn new(name: &str) -> Self {
        Self {
            profile: DelegateProfile {
                external_id: format!("id-{name}"),
                username: Some(format!("delegate_{name}")),
                display_name: format!("Delegate {name}"),
                phone: None,
            },
            add_results: Mutex::new(VecDeque::new()),
            invite_results: Mutex::new(VecDeque::new()),
            contact_results: Mutex::new(VecDeque::new()),
            members: Mutex::new(HashSet::new()),
            hide_added_members: AtomicBool::new(false),
            add_delay: Mutex::new(None),
            add_calls: AtomicUsize::new(0),
            invite_calls: AtomicUsize::new(0),
            contact_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
        }
    }

    /// Queues the next `add_member` outcome. Unscripted calls succeed.
    pub(crate) fn push_add(&self, result: Result<(), PlatformErrorKind>) {
        self.add_results
            .lock()
            .expect("lock")
            .push_back(result.map_err(platform_error));
    }

    pub(crate) fn push_invite(&self, result: Result<(), PlatformErrorKind>) {
        let result = result
            .map(|()| InviteLink {
                url: "https://t.me/+scripted".to_string(),
                expires_at: None,
            })
            .map_err(platform_error);
        self.invite_results.lock().expect("lock").push_back(result);
    }

    pub(crate) fn push_contact(&self, result: Result<(), PlatformErrorKind>) {
        self.contact_results
            .lock()
            .expect("lock")
            .push_back(result.map_err(platform_error));
    }

    /// `add_member` succeeds but the user never shows up in the member list.
    pub(crate) fn hide_added_members(&self) {
        self.hide_added_members.store(true, Ordering::SeqCst);
    }

    pub(crate) fn delay_adds(&self, delay: Duration) {
        *self.add_delay.lock().expect("lock") = Some(delay);
    }

    pub(crate) fn adds(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn invites(&self) -> usize {
        self.invite_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn contacts(&self) -> usize {
        self.contact_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn member_checks(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DelegateSession for ScriptedSession {
    fn profile(&self) -> &DelegateProfile {
        &self.profile
    }

    async fn add_member(&self, _space_id: SpaceId, user_id: UserId) -> Result<(), PlatformError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.add_delay.lock().expect("lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = self
            .add_results
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or(Ok(()));
        if result.is_ok() && !self.hide_added_members.load(Ordering::SeqCst) {
            self.members.lock().expect("lock").insert(user_id);
        }
        result
    }

    async fn create_invite(
        &self,
        _space_id: SpaceId,
        constraints: &InviteConstraints,
    ) -> Result<InviteLink, PlatformError> {
        self.invite_calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(constraints.member_limit, Some(1), "invites must be single use");
        self.invite_results
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| {
                Ok(InviteLink {
                    url: "https://t.me/+scripted".to_string(),
                    expires_at: None,
                })
            })
    }

    async fn list_members(&self, _space_id: SpaceId) -> Result<Vec<UserId>, PlatformError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.members.lock().expect("lock").iter().copied().collect())
    }

    async fn register_contact(
        &self,
        _user_id: UserId,
        _display_name: &str,
    ) -> Result<(), PlatformError> {
        self.contact_calls.fetch_add(1, Ordering::SeqCst);
        self.contact_results
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

/// Hands out one scripted session per credential string.
#[derive(Default)]
pub(crate) struct ScriptedConnector {
    sessions: Mutex<HashMap<String, Arc<ScriptedSession>>>,
    auth_failures: Mutex<HashMap<String, PlatformErrorKind>>,
    auth_calls: AtomicUsize,
}

impl ScriptedConnector {
    pub(crate) fn session_for(&self, credential: &str) -> Arc<ScriptedSession> {
        self.sessions
            .lock()
            .expect("lock")
            .entry(credential.to_string())
            .or_insert_with(|| Arc::new(ScriptedSession::new(credential)))
            .clone()
    }

    pub(crate) fn fail_auth(&self, credential: &str, kind: PlatformErrorKind) {
        self.auth_failures
            .lock()
            .expect("lock")
            .insert(credential.to_string(), kind);
    }

    pub(crate) fn auth_calls(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformConnector for ScriptedConnector {
    async fn authenticate(
        &self,
        credential: &DelegateCredential,
    ) -> Result<Arc<dyn DelegateSession>, PlatformError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self
            .auth_failures
            .lock()
            .expect("lock")
            .get(credential.expose())
            .copied();
        if let Some(kind) = failure {
            return Err(platform_error(kind));
        }
        let session: Arc<dyn DelegateSession> = self.session_for(credential.expose());
        Ok(session)
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    users: Mutex<Vec<(UserId, UserNotice)>>,
    operators: Mutex<Vec<OperatorNotice>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub(crate) fn user_notices(&self) -> Vec<(UserId, UserNotice)> {
        self.users.lock().expect("lock").clone()
    }

    pub(crate) fn operator_notices(&self) -> Vec<OperatorNotice> {
        self.operators.lock().expect("lock").clone()
    }

    pub(crate) fn fail_deliveries(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_user(&self, user_id: UserId, notice: UserNotice) -> Result<(), NotifyError> {
        self.users.lock().expect("lock").push((user_id, notice));
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError("scripted delivery failure".to_string()));
        }
        Ok(())
    }

    async fn notify_operators(&self, notice: OperatorNotice) -> Result<(), NotifyError> {
        self.operators.lock().expect("lock").push(notice);
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError("scripted delivery failure".to_string()));
        }
        Ok(())
    }
}

pub(crate) struct Harness {
    pub(crate) store: Store,
    pub(crate) vault: CredentialVault,
    pub(crate) connector: Arc<ScriptedConnector>,
    pub(crate) notifier: Arc<RecordingNotifier>,
    pub(crate) settings: Arc<SqliteSettings>,
    pub(crate) pool: DelegatePool,
}

impl Harness {
    pub(crate) fn new(config: PoolConfig) -> Self {
        let store = Store::open_in_memory().expect("store");
        let vault = CredentialVault::from_secret(TEST_SECRET).expect("vault");
        let connector = Arc::new(ScriptedConnector::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let settings = Arc::new(SqliteSettings::new(store.clone()));
        let pool = DelegatePool::new(
            store.clone(),
            vault.clone(),
            connector.clone(),
            notifier.clone(),
            config,
        );
        Self {
            store,
            vault,
            connector,
            notifier,
            settings,
            pool,
        }
    }

    /// Registers a delegate whose credential is `name` and returns its scripted session.
    pub(crate) async fn add_delegate(&self, name: &str) -> (DelegateAccount, Arc<ScriptedSession>) {
        let account = self
            .pool
            .register(&format!("+1555{name}"), &DelegateCredential::new(name))
            .await
            .expect("register");
        (account, self.connector.session_for(name))
    }
}

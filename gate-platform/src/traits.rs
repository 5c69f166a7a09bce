use crate::error::Result;
use crate::types::{
    DelegateCredential, DelegateProfile, InviteConstraints, InviteLink, SpaceId, UserId,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Opens authenticated sessions for delegate accounts.
#[async_trait]
pub trait PlatformConnector: Send + Sync {
    async fn authenticate(&self, credential: &DelegateCredential)
    -> Result<Arc<dyn DelegateSession>>;
}

/// Capabilities of one authenticated delegate account.
///
/// Every error is already classified into [`crate::PlatformErrorKind`].
#[async_trait]
pub trait DelegateSession: Send + Sync {
    fn profile(&self) -> &DelegateProfile;

    async fn add_member(&self, space_id: SpaceId, user_id: UserId) -> Result<()>;

    async fn create_invite(
        &self,
        space_id: SpaceId,
        constraints: &InviteConstraints,
    ) -> Result<InviteLink>;

    async fn list_members(&self, space_id: SpaceId) -> Result<Vec<UserId>>;

    async fn register_contact(&self, user_id: UserId, display_name: &str) -> Result<()>;

    /// Release the session. Sessions that hold no remote state keep the default.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

//! Platform adapters for gatekeep.
//!
//! Two surfaces live here: delegate sessions (user accounts that add members to
//! spaces) and the Telegram bot that talks to users and operators. Delegate
//! failures leave this crate already classified into [`PlatformErrorKind`].

mod classify;
mod error;
mod http_bridge;
mod telegram;
mod traits;
mod types;

pub use classify::{classify, classify_error};
pub use error::{PlatformError, PlatformErrorKind, Result};
pub use http_bridge::{HttpBridgeConnector, HttpBridgeSession};
pub use telegram::{BotUpdate, BotUser, InlineButton, TelegramBot};
pub use traits::{DelegateSession, PlatformConnector};
pub use types::{
    DelegateCredential, DelegateProfile, InviteConstraints, InviteLink, SpaceId, UserId,
};

//! Outbound notices and the delivery seam.
//!
//! Notices are plain data; rendering to text happens here so every delivery
//! channel shows users the same wording. Rendered user text never carries ids,
//! delegate identities (other than the contact card a user must add) or raw
//! platform errors.

use crate::types::{DelegateId, JoinRequest, RequestId};
use async_trait::async_trait;
use gate_platform::{DelegateProfile, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_user(&self, user_id: UserId, notice: UserNotice) -> Result<(), NotifyError>;

    /// Fan-out to every configured operator.
    async fn notify_operators(&self, notice: OperatorNotice) -> Result<(), NotifyError>;
}

const PRIVACY_STEPS: [&str; 3] = [
    "1. Open Telegram Settings.",
    "2. Go to Privacy and Security.",
    "3. Under Groups & Channels, allow Everybody to add you.",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserNotice {
    Approved { space_name: String },
    AlreadyMember { space_name: String },
    InviteLink { space_name: String, url: String },
    ContactExchange { space_name: String, contact: DelegateProfile },
    AwaitingReview { space_name: String },
    /// Invite fallback failed too; the user can fix their privacy settings and retry.
    PrivacyRestricted { space_name: String },
    Rejected { space_name: String },
    TemporarilyUnavailable,
    RateLimited,
    DuplicatePending { space_name: String },
}

impl UserNotice {
    pub fn render(&self) -> String {
        match self {
            Self::Approved { space_name } => format!("Welcome to {space_name}! You've been added."),
            Self::AlreadyMember { space_name } => {
                format!("You're already a member of {space_name}.")
            }
            Self::InviteLink { space_name, url } => format!(
                "I couldn't add you to {space_name} directly, probably because of your privacy \
                 settings. Use this one-time link to join:\n{url}"
            ),
            Self::ContactExchange {
                space_name,
                contact,
            } => {
                let mut text = format!(
                    "To join {space_name}, please add this account to your contacts and then try \
                     again:\n"
                );
                text.push_str(&render_contact_card(contact));
                text
            }
            Self::AwaitingReview { space_name } => format!(
                "Your request to join {space_name} was sent to the administrators. You'll get a \
                 message once it's reviewed."
            ),
            Self::PrivacyRestricted { space_name } => {
                let mut text = format!(
                    "I can't add you to {space_name} because of your privacy settings. An \
                     administrator will review your request. To let me add you next time:\n"
                );
                text.push_str(&PRIVACY_STEPS.join("\n"));
                text
            }
            Self::Rejected { space_name } => {
                format!("Sorry, your request to join {space_name} could not be completed.")
            }
            Self::TemporarilyUnavailable => {
                "Joining is temporarily unavailable. Please try again later.".to_string()
            }
            Self::RateLimited => {
                "You've sent too many requests. Please wait for an administrator to lift the \
                 limit."
                    .to_string()
            }
            Self::DuplicatePending { space_name } => {
                format!("You already have a request for {space_name} in progress.")
            }
        }
    }
}

fn render_contact_card(contact: &DelegateProfile) -> String {
    let mut lines = Vec::new();
    if !contact.display_name.trim().is_empty() {
        lines.push(contact.display_name.trim().to_string());
    }
    if let Some(username) = contact.username.as_deref().filter(|u| !u.trim().is_empty()) {
        lines.push(format!("@{}", username.trim().trim_start_matches('@')));
    }
    if let Some(phone) = contact.phone.as_deref().filter(|p| !p.trim().is_empty()) {
        lines.push(phone.trim().to_string());
    }
    lines.join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorNotice {
    /// Carries approve/reject controls when the delivery channel supports them.
    ReviewRequested {
        request: JoinRequest,
        space_name: String,
        reason: String,
    },
    Admitted {
        request: JoinRequest,
        space_name: String,
        delegate_ref: String,
    },
    Rotated {
        from: Option<DelegateId>,
        to: DelegateId,
        reason: String,
    },
    DelegateRetired {
        delegate_id: DelegateId,
        reason: String,
    },
    PoolExhausted {
        last: Option<DelegateId>,
    },
    UserBlocked {
        user_id: UserId,
        reason: String,
    },
    StuckRequest {
        request: JoinRequest,
        space_name: String,
    },
}

impl OperatorNotice {
    /// The request an approve/reject control should target, if any.
    pub fn review_target(&self) -> Option<RequestId> {
        match self {
            Self::ReviewRequested { request, .. } | Self::StuckRequest { request, .. } => {
                Some(request.id)
            }
            _ => None,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Self::ReviewRequested {
                request,
                space_name,
                reason,
            } => format!(
                "Review needed: {} (user {}) wants to join {space_name}. Request #{} ({reason}).",
                request.display_name, request.user_id, request.id
            ),
            Self::Admitted {
                request,
                space_name,
                delegate_ref,
            } => format!(
                "New member: {} (user {}) added to {space_name} via delegate {delegate_ref}.",
                request.display_name, request.user_id
            ),
            Self::Rotated { from, to, reason } => match from {
                Some(from) => format!("Delegate rotated: #{from} -> #{to} ({reason})."),
                None => format!("Delegate #{to} is now active ({reason})."),
            },
            Self::DelegateRetired {
                delegate_id,
                reason,
            } => format!("Delegate #{delegate_id} was deactivated: {reason}."),
            Self::PoolExhausted { last } => match last {
                Some(last) => format!(
                    "Delegate pool exhausted after deactivating #{last}. No active accounts \
                     remain; automatic admission is stopped until a delegate is reactivated."
                ),
                None => "Delegate pool exhausted. No active accounts remain; automatic admission \
                         is stopped until a delegate is added or reactivated."
                    .to_string(),
            },
            Self::UserBlocked { user_id, reason } => {
                format!("User {user_id} was rate limited: {reason}. Use /unblock {user_id} to lift it.")
            }
            Self::StuckRequest {
                request,
                space_name,
            } => format!(
                "Unfinished request #{} from {} (user {}) for {space_name} is waiting for a \
                 decision.",
                request.id, request.display_name, request.user_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_text_never_leaks_ids() {
        let notice = UserNotice::Rejected {
            space_name: "Rust Club".to_string(),
        };
        let text = notice.render();
        assert!(text.contains("Rust Club"));
        assert!(!text.contains("PEER_FLOOD"));

        let privacy = UserNotice::PrivacyRestricted {
            space_name: "Rust Club".to_string(),
        }
        .render();
        assert!(privacy.contains("Privacy and Security"));
    }

    #[test]
    fn contact_card_lists_available_fields() {
        let notice = UserNotice::ContactExchange {
            space_name: "Rust Club".to_string(),
            contact: DelegateProfile {
                external_id: "1001".to_string(),
                username: Some("@helper".to_string()),
                display_name: "Club Helper".to_string(),
                phone: None,
            },
        };
        let text = notice.render();
        assert!(text.contains("Club Helper"));
        assert!(text.contains("@helper"));
        assert!(!text.contains("@@helper"));
        assert!(!text.contains("1001"));
    }

    #[test]
    fn pool_exhausted_reads_distinctly_from_rotation() {
        let exhausted = OperatorNotice::PoolExhausted {
            last: Some(DelegateId::new(3)),
        };
        let rotated = OperatorNotice::Rotated {
            from: Some(DelegateId::new(3)),
            to: DelegateId::new(4),
            reason: "rate limited".to_string(),
        };
        assert!(exhausted.render().contains("exhausted"));
        assert!(!rotated.render().contains("exhausted"));
        assert_eq!(exhausted.review_target(), None);
    }
}

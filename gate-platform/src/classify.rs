//! Maps raw platform error codes and messages onto [`PlatformErrorKind`].
//!
//! This is the only place free text is inspected. Typed codes win; substring
//! matching is a fallback for bridges that only forward a message.

use crate::error::{PlatformError, PlatformErrorKind};
use std::time::Duration;

const ALREADY_MEMBER_CODES: &[&str] = &["USER_ALREADY_PARTICIPANT", "ALREADY_MEMBER"];
const PRIVACY_CODES: &[&str] = &["USER_PRIVACY_RESTRICTED", "PRIVACY_RESTRICTED"];
const MUTUAL_CONTACT_CODES: &[&str] = &["USER_NOT_MUTUAL_CONTACT", "MUTUAL_CONTACT_REQUIRED"];
const RATE_LIMIT_CODES: &[&str] = &["PEER_FLOOD", "FLOOD_WAIT", "SLOWMODE_WAIT", "RATE_LIMITED"];
const UNAUTHORIZED_CODES: &[&str] = &[
    "AUTH_KEY_UNREGISTERED",
    "AUTH_KEY_INVALID",
    "AUTH_KEY_DUPLICATED",
    "SESSION_REVOKED",
    "SESSION_EXPIRED",
    "USER_DEACTIVATED",
    "USER_DEACTIVATED_BAN",
    "UNAUTHORIZED",
];

pub fn classify(code: Option<&str>, message: &str) -> PlatformErrorKind {
    if let Some(kind) = code.and_then(classify_code) {
        return kind;
    }
    classify_message(message)
}

/// Builds a [`PlatformError`] from a bridge error envelope, including any flood-wait hint.
pub fn classify_error(code: Option<&str>, message: &str, retry_after: Option<Duration>) -> PlatformError {
    let kind = classify(code, message);
    let retry_after = retry_after.or_else(|| code.and_then(flood_wait_duration));
    let detail = match code {
        Some(code) if !code.trim().is_empty() => format!("{}: {}", code.trim(), message.trim()),
        _ => message.trim().to_string(),
    };
    PlatformError::new(kind, detail).with_retry_after(retry_after)
}

fn classify_code(code: &str) -> Option<PlatformErrorKind> {
    let normalized = code.trim().to_ascii_uppercase();
    if normalized.is_empty() {
        return None;
    }
    let matches = |codes: &[&str]| codes.iter().any(|candidate| normalized.starts_with(candidate));
    if matches(ALREADY_MEMBER_CODES) {
        return Some(PlatformErrorKind::AlreadyMember);
    }
    if matches(MUTUAL_CONTACT_CODES) {
        return Some(PlatformErrorKind::MutualContactRequired);
    }
    if matches(PRIVACY_CODES) {
        return Some(PlatformErrorKind::PrivacyRestricted);
    }
    if matches(RATE_LIMIT_CODES) {
        return Some(PlatformErrorKind::RateLimited);
    }
    if matches(UNAUTHORIZED_CODES) {
        return Some(PlatformErrorKind::Unauthorized);
    }
    None
}

fn classify_message(message: &str) -> PlatformErrorKind {
    let lowered = message.to_lowercase();
    if lowered.contains("already") && (lowered.contains("participant") || lowered.contains("member"))
    {
        return PlatformErrorKind::AlreadyMember;
    }
    // Mutual-contact wording often also mentions restrictions; check it first.
    if lowered.contains("mutual") {
        return PlatformErrorKind::MutualContactRequired;
    }
    if lowered.contains("privacy") || lowered.contains("restricted") {
        return PlatformErrorKind::PrivacyRestricted;
    }
    if lowered.contains("flood") || lowered.contains("too many requests") {
        return PlatformErrorKind::RateLimited;
    }
    PlatformErrorKind::Other
}

/// `FLOOD_WAIT_37` carries the wait in seconds as a suffix.
fn flood_wait_duration(code: &str) -> Option<Duration> {
    let normalized = code.trim().to_ascii_uppercase();
    let suffix = normalized.strip_prefix("FLOOD_WAIT_")?;
    suffix.parse::<u64>().ok().map(Duration::from_secs)
}

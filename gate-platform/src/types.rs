use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Declares an `i64`-backed identifier newtype.
///
/// Platform identifiers (users, spaces) and store row ids share this shape.
#[macro_export]
macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            ::serde::Serialize,
            ::serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for i64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = ::std::num::ParseIntError;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                s.trim().parse::<i64>().map(Self::new)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(SpaceId);

/// Session material for a delegate account, as handed to [`crate::PlatformConnector`].
#[derive(Clone, PartialEq, Eq)]
pub struct DelegateCredential(String);

impl DelegateCredential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_utf8(bytes: Vec<u8>) -> Option<Self> {
        String::from_utf8(bytes).ok().map(Self)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DelegateCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Who the delegate is on the platform. Shared with users during contact exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateProfile {
    pub external_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InviteConstraints {
    pub expires_in: Option<Duration>,
    pub member_limit: Option<u32>,
    pub name: Option<String>,
}

impl InviteConstraints {
    /// A link that admits exactly one member.
    pub fn single_use(expires_in: Duration) -> Self {
        Self {
            expires_in: Some(expires_in),
            member_limit: Some(1),
            name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteLink {
    pub url: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_parse_and_display_round_trip() {
        let user: UserId = " 42 ".parse().expect("parse");
        assert_eq!(user, UserId::new(42));
        assert_eq!(user.to_string(), "42");
        let space = SpaceId::from(-1002698797779);
        assert_eq!(i64::from(space), -1002698797779);
        assert!("abc".parse::<UserId>().is_err());
    }

    #[test]
    fn credential_debug_is_redacted() {
        let credential = DelegateCredential::new("1BVtsOHgBu3Hk0dZ");
        assert_eq!(format!("{credential:?}"), "[REDACTED]");
        assert!(DelegateCredential::from_utf8(vec![0xff, 0xfe]).is_none());
    }

    #[test]
    fn single_use_invite_caps_members() {
        let constraints = InviteConstraints::single_use(Duration::from_secs(3600));
        assert_eq!(constraints.member_limit, Some(1));
        assert_eq!(constraints.expires_in, Some(Duration::from_secs(3600)));
    }
}

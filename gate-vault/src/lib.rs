//! Credential custody for delegate accounts.
//!
//! Delegate session blobs are sealed with AES-256-GCM under a key derived from the
//! operator-configured secret. Plaintext only ever leaves this crate wrapped in
//! [`CredentialBlob`], whose formatting is redacted.

mod error;
mod vault;

pub use error::{Result, VaultError};
pub use vault::{CredentialBlob, CredentialVault, MIN_SECRET_LEN};

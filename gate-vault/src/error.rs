use thiserror::Error;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VaultError {
    #[error("invalid vault secret: {0}")]
    InvalidSecret(String),

    #[error("credential blob is empty")]
    EmptyBlob,

    #[error("credential encryption failed")]
    Encrypt,

    /// Every decrypt-side failure collapses into this variant so callers cannot
    /// distinguish a tampered payload from a wrong key.
    #[error("credential unavailable: {0}")]
    CredentialUnavailable(&'static str),
}

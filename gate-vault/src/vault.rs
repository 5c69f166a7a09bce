use crate::error::{Result, VaultError};
use aes_gcm::aead::rand_core::RngCore as _;
use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use sha2::{Digest, Sha256};
use std::fmt;

pub const MIN_SECRET_LEN: usize = 16;

const SEALED_PREFIX: &str = "enc:v1:";
const NONCE_BYTES: usize = 12;
const TAG_BYTES: usize = 16;
const ASSOCIATED_DATA: &[u8] = b"gatekeep-delegate-credential-v1";

/// Symmetric sealing of delegate credential blobs.
///
/// The key is derived once at construction; there is no rotation path. Sealed values
/// are text (`enc:v1:<base64(nonce || ciphertext || tag)>`) so they fit a TEXT column.
#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl CredentialVault {
    pub fn from_secret(secret: &str) -> Result<Self> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(VaultError::InvalidSecret("secret is required".to_string()));
        }
        if secret.len() < MIN_SECRET_LEN {
            return Err(VaultError::InvalidSecret(format!(
                "secret must be at least {MIN_SECRET_LEN} characters"
            )));
        }
        let key_material = derive_key_material(secret);
        let cipher = Aes256Gcm::new_from_slice(&key_material)
            .map_err(|_| VaultError::InvalidSecret("derived key has invalid length".to_string()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, blob: &[u8]) -> Result<String> {
        if blob.is_empty() {
            return Err(VaultError::EmptyBlob);
        }
        let mut nonce = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: blob,
                    aad: ASSOCIATED_DATA,
                },
            )
            .map_err(|_| VaultError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(format!("{SEALED_PREFIX}{}", BASE64_STANDARD.encode(sealed)))
    }

    pub fn decrypt(&self, sealed: &str) -> Result<CredentialBlob> {
        let encoded = sealed
            .trim()
            .strip_prefix(SEALED_PREFIX)
            .ok_or(VaultError::CredentialUnavailable("unrecognized payload format"))?;
        let raw = BASE64_STANDARD
            .decode(encoded)
            .map_err(|_| VaultError::CredentialUnavailable("payload encoding is invalid"))?;
        if raw.len() < NONCE_BYTES + TAG_BYTES + 1 {
            return Err(VaultError::CredentialUnavailable("payload is truncated"));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_BYTES);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: ASSOCIATED_DATA,
                },
            )
            .map_err(|_| VaultError::CredentialUnavailable("integrity check failed"))?;
        if plaintext.is_empty() {
            return Err(VaultError::CredentialUnavailable("payload is empty"));
        }
        Ok(CredentialBlob(plaintext))
    }
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

fn derive_key_material(secret: &str) -> [u8; 32] {
    let digest = Sha256::digest(secret.as_bytes());
    let mut material = [0u8; 32];
    material.copy_from_slice(&digest);
    material
}

/// Decrypted credential bytes. Formatting never reveals the contents.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialBlob(Vec<u8>);

impl CredentialBlob {
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for CredentialBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for CredentialBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> CredentialVault {
        CredentialVault::from_secret("correct horse battery staple").expect("vault")
    }

    #[test]
    fn decrypt_inverts_encrypt_for_varied_blobs() {
        let vault = vault();
        let blobs: Vec<Vec<u8>> = vec![
            b"x".to_vec(),
            b"1BVtsOHgBu3Hk0dZ-session-string".to_vec(),
            (0u8..=255).collect(),
            vec![0u8; 4096],
            "сессия 🔐".as_bytes().to_vec(),
        ];
        for blob in blobs {
            let sealed = vault.encrypt(&blob).expect("encrypt");
            assert!(sealed.starts_with(SEALED_PREFIX));
            let opened = vault.decrypt(&sealed).expect("decrypt");
            assert_eq!(opened.expose(), blob.as_slice());
        }
    }

    #[test]
    fn each_encryption_uses_a_fresh_nonce() {
        let vault = vault();
        let first = vault.encrypt(b"same").expect("encrypt");
        let second = vault.encrypt(b"same").expect("encrypt");
        assert_ne!(first, second);
    }

    #[test]
    fn wrong_key_fails_closed() {
        let sealed = vault().encrypt(b"session").expect("encrypt");
        let other = CredentialVault::from_secret("a different sixteen+ secret").expect("vault");
        assert_eq!(
            other.decrypt(&sealed).expect_err("must fail"),
            VaultError::CredentialUnavailable("integrity check failed")
        );
    }

    #[test]
    fn tampered_or_malformed_payloads_fail_closed() {
        let vault = vault();
        let sealed = vault.encrypt(b"session").expect("encrypt");
        let mut raw = BASE64_STANDARD
            .decode(sealed.strip_prefix(SEALED_PREFIX).expect("prefix"))
            .expect("decode");
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = format!("{SEALED_PREFIX}{}", BASE64_STANDARD.encode(raw));
        assert!(vault.decrypt(&tampered).is_err());

        assert!(vault.decrypt("session-in-plaintext").is_err());
        assert!(vault.decrypt("enc:v1:!!!").is_err());
        assert!(vault.decrypt("enc:v1:AAAA").is_err());
    }

    #[test]
    fn short_or_missing_secret_is_rejected() {
        assert!(matches!(
            CredentialVault::from_secret("   "),
            Err(VaultError::InvalidSecret(_))
        ));
        assert!(matches!(
            CredentialVault::from_secret("default_key"),
            Err(VaultError::InvalidSecret(_))
        ));
    }

    #[test]
    fn empty_blob_is_rejected() {
        assert_eq!(vault().encrypt(b"").expect_err("empty"), VaultError::EmptyBlob);
    }

    #[test]
    fn decrypted_blob_formatting_is_redacted() {
        let vault = vault();
        let sealed = vault.encrypt(b"super-secret").expect("encrypt");
        let opened = vault.decrypt(&sealed).expect("decrypt");
        assert_eq!(format!("{opened:?}"), "[REDACTED]");
        assert_eq!(opened.to_string(), "[REDACTED]");
    }
}

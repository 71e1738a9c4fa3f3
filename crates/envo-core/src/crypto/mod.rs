//! Cryptographic primitives for Envo.
//!
//! AES-256-GCM authenticated encryption over zeroize-on-drop data keys, plus
//! the token hashing helpers used for refresh tokens and exchange codes.
//!
//! # Security model
//!
//! - Every seal draws a fresh 96-bit nonce from `OsRng`.
//! - Sealed format: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! - Key types derive `Zeroize` + `ZeroizeOnDrop` and redact `Debug`.

pub mod envelope;
pub mod kms;

use std::fmt;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::EncryptionError;

/// Minimum sealed length: 12-byte nonce + 16-byte AES-GCM tag.
pub const MIN_SEALED_LEN: usize = NONCE_LEN + 16;

const NONCE_LEN: usize = 12;

/// A 256-bit data key that is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey([u8; 32]);

impl DataKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a new random key using the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    /// Build a key from a plaintext key returned by a key management backend.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::Malformed`] if `bytes` is not 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EncryptionError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| EncryptionError::Malformed {
            reason: format!("data key must be 32 bytes, got {}", bytes.len()),
        })?;
        Ok(Self(arr))
    }

    /// Derive the static local-fallback key: SHA-256 of a long-lived secret.
    #[must_use]
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Borrow the raw key bytes. The caller must not log or persist them.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Seal `plaintext` under `key` with a fresh random nonce.
///
/// # Errors
///
/// Returns [`EncryptionError::Encryption`] if the AEAD operation fails.
pub fn seal(key: &DataKey, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| EncryptionError::Encryption {
            reason: e.to_string(),
        })?;

    let mut combined = Vec::with_capacity(NONCE_LEN.saturating_add(ciphertext.len()));
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(combined)
}

/// Open a value produced by [`seal`].
///
/// # Errors
///
/// Returns [`EncryptionError::CiphertextTooShort`] below 28 bytes and
/// [`EncryptionError::Decryption`] if authentication fails.
pub fn open(key: &DataKey, combined: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    if combined.len() < MIN_SEALED_LEN {
        return Err(EncryptionError::CiphertextTooShort {
            expected: MIN_SEALED_LEN,
            actual: combined.len(),
        });
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| EncryptionError::Decryption {
            reason: e.to_string(),
        })
}

/// SHA-256 hex digest of an opaque credential. Only this is ever stored.
#[must_use]
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// A hex-encoded random value with `bytes` bytes of entropy.
#[must_use]
pub fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Compare two strings without short-circuiting on the first difference.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = DataKey::generate();
        let sealed = seal(&key, b"DATABASE_URL=postgres://").unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), b"DATABASE_URL=postgres://");
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let sealed = seal(&DataKey::generate(), b"secret").unwrap();
        assert!(matches!(
            open(&DataKey::generate(), &sealed),
            Err(EncryptionError::Decryption { .. })
        ));
    }

    #[test]
    fn open_truncated_fails() {
        let key = DataKey::generate();
        assert!(matches!(
            open(&key, &[0u8; 11]),
            Err(EncryptionError::CiphertextTooShort {
                expected: 28,
                actual: 11
            })
        ));
    }

    #[test]
    fn flipping_any_byte_is_detected() {
        let key = DataKey::generate();
        let sealed = seal(&key, b"value").unwrap();
        for i in 0..sealed.len() {
            let mut tampered = sealed.clone();
            if let Some(byte) = tampered.get_mut(i) {
                *byte ^= 0x01;
            }
            assert!(open(&key, &tampered).is_err(), "byte {i} flip went unnoticed");
        }
    }

    #[test]
    fn nonces_differ_between_seals() {
        let key = DataKey::generate();
        let a = seal(&key, b"same").unwrap();
        let b = seal(&key, b"same").unwrap();
        assert_ne!(a.get(..NONCE_LEN), b.get(..NONCE_LEN));
    }

    #[test]
    fn local_key_is_deterministic() {
        let a = DataKey::from_secret("long-lived-secret");
        let b = DataKey::from_secret("long-lived-secret");
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), DataKey::from_secret("other").as_bytes());
    }

    #[test]
    fn data_key_from_slice_checks_length() {
        assert!(DataKey::from_slice(&[0u8; 16]).is_err());
        assert!(DataKey::from_slice(&[7u8; 32]).is_ok());
    }

    #[test]
    fn debug_redacts_key() {
        let debug = format!("{:?}", DataKey::generate());
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn hash_token_is_sha256_hex() {
        let h = hash_token("abc");
        assert_eq!(h.len(), 64);
        assert_eq!(
            h,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn random_tokens_are_unique() {
        let a = random_token(32);
        assert_eq!(a.len(), 64);
        assert_ne!(a, random_token(32));
    }

    #[test]
    fn constant_time_eq_matches_equality() {
        assert!(constant_time_eq("state-1", "state-1"));
        assert!(!constant_time_eq("state-1", "state-2"));
        assert!(!constant_time_eq("state", "state-1"));
    }
}

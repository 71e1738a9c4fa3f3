//! Envelope encryption for secret values.
//!
//! Two backends can seal a value:
//!
//! - **Managed**: a [`KeyManagement`] service issues a fresh data key per
//!   value. Stored as `base64(wrapped_key) ":" base64(nonce || ct || tag)`.
//! - **Local**: a static key derived from a long-lived secret. Stored as
//!   `"local:" base64(nonce || ct || tag)`.
//!
//! New values are always sealed with the primary backend (managed when
//! configured). Decryption picks the backend named by the stored value and
//! its key method, and on failure retries once with the other configured
//! backend. Values written before the `local:` tag existed are bare base64
//! and parse as [`StoredCiphertext::LegacyLocal`].

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, warn};
use uuid::Uuid;

use super::kms::KeyManagement;
use super::{DataKey, open, seal};
use crate::error::EncryptionError;

/// Key method recorded for values sealed with the local backend.
pub const LOCAL_KEY_METHOD: &str = "local";

const LOCAL_PREFIX: &str = "local:";

/// The backend a secret row says it was sealed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMethod {
    Local,
    Managed { key_id: String },
}

impl KeyMethod {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw == LOCAL_KEY_METHOD {
            Self::Local
        } else {
            Self::Managed {
                key_id: raw.to_owned(),
            }
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Local => LOCAL_KEY_METHOD,
            Self::Managed { key_id } => key_id,
        }
    }

    const fn backend(&self) -> BackendKind {
        match self {
            Self::Local => BackendKind::Local,
            Self::Managed { .. } => BackendKind::Managed,
        }
    }
}

/// A decoded stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredCiphertext {
    /// Tagged local value.
    Local { sealed: Vec<u8> },
    /// Untagged local value from before the `local:` prefix.
    LegacyLocal { sealed: Vec<u8> },
    /// Data key wrapped by the managed backend plus the sealed value.
    Managed { wrapped_key: Vec<u8>, sealed: Vec<u8> },
}

impl StoredCiphertext {
    /// Decode a stored value.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::Malformed`] if a segment is not valid base64.
    pub fn parse(raw: &str) -> Result<Self, EncryptionError> {
        if let Some(body) = raw.strip_prefix(LOCAL_PREFIX) {
            return Ok(Self::Local {
                sealed: decode_segment(body, "local value")?,
            });
        }
        match raw.split_once(':') {
            Some((wrapped, sealed)) => Ok(Self::Managed {
                wrapped_key: decode_segment(wrapped, "wrapped key")?,
                sealed: decode_segment(sealed, "sealed value")?,
            }),
            None => Ok(Self::LegacyLocal {
                sealed: decode_segment(raw, "legacy local value")?,
            }),
        }
    }

    /// The stored string form.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Local { sealed } => format!("{LOCAL_PREFIX}{}", BASE64.encode(sealed)),
            Self::LegacyLocal { sealed } => BASE64.encode(sealed),
            Self::Managed {
                wrapped_key,
                sealed,
            } => format!("{}:{}", BASE64.encode(wrapped_key), BASE64.encode(sealed)),
        }
    }
}

fn decode_segment(segment: &str, what: &str) -> Result<Vec<u8>, EncryptionError> {
    BASE64
        .decode(segment)
        .map_err(|e| EncryptionError::Malformed {
            reason: format!("{what} is not valid base64: {e}"),
        })
}

/// One of the two encryption backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Managed,
}

impl BackendKind {
    #[must_use]
    pub const fn alternate(self) -> Self {
        match self {
            Self::Local => Self::Managed,
            Self::Managed => Self::Local,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Managed => "managed",
        }
    }
}

/// What a bulk decrypt does with an entry no backend can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecryptFailureMode {
    /// Log a warning, leave the entry out, keep going.
    #[default]
    SkipAndLog,
    /// Abort the whole batch with the entry's error.
    FailFast,
}

impl std::str::FromStr for DecryptFailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "skip" => Ok(Self::SkipAndLog),
            "fail" => Ok(Self::FailFast),
            other => Err(format!("unknown decrypt failure mode: {other} (expected skip or fail)")),
        }
    }
}

/// A stored value plus the row it came from, for batch decryption.
#[derive(Debug, Clone)]
pub struct SealedValue {
    pub id: Uuid,
    pub ciphertext: String,
    pub key_method: String,
}

/// A successfully decrypted batch entry.
#[derive(Debug, Clone)]
pub struct DecryptedValue {
    pub id: Uuid,
    pub plaintext: String,
}

/// Result of [`EnvelopeCipher::decrypt_many`].
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub decrypted: Vec<DecryptedValue>,
    pub skipped: Vec<Uuid>,
}

/// The envelope encryption service.
#[derive(Clone)]
pub struct EnvelopeCipher {
    managed: Option<Arc<dyn KeyManagement>>,
    local: Option<DataKey>,
}

impl EnvelopeCipher {
    /// # Errors
    ///
    /// Returns [`EncryptionError::NotConfigured`] if neither backend is given.
    pub fn new(
        managed: Option<Arc<dyn KeyManagement>>,
        local: Option<DataKey>,
    ) -> Result<Self, EncryptionError> {
        if managed.is_none() && local.is_none() {
            return Err(EncryptionError::NotConfigured {
                method: "no encryption backend configured".to_owned(),
            });
        }
        Ok(Self { managed, local })
    }

    /// A cipher with only the local fallback backend.
    #[must_use]
    pub fn local_only(key: DataKey) -> Self {
        Self {
            managed: None,
            local: Some(key),
        }
    }

    /// The backend new values are sealed with.
    #[must_use]
    pub fn primary(&self) -> BackendKind {
        if self.managed.is_some() {
            BackendKind::Managed
        } else {
            BackendKind::Local
        }
    }

    #[must_use]
    pub fn managed(&self) -> Option<&Arc<dyn KeyManagement>> {
        self.managed.as_ref()
    }

    const fn is_configured(&self, backend: BackendKind) -> bool {
        match backend {
            BackendKind::Local => self.local.is_some(),
            BackendKind::Managed => self.managed.is_some(),
        }
    }

    /// Seal `plaintext` with the primary backend.
    ///
    /// Returns the stored ciphertext and the key method to record with it.
    ///
    /// # Errors
    ///
    /// Returns an [`EncryptionError`] if the key service fails or sealing
    /// fails. There is no fallback to the other backend on encrypt.
    pub async fn encrypt(&self, plaintext: &str) -> Result<(String, String), EncryptionError> {
        if let Some(kms) = &self.managed {
            let data_key = kms.generate_data_key().await?;
            let sealed = seal(&data_key.plaintext, plaintext.as_bytes())?;
            let stored = StoredCiphertext::Managed {
                wrapped_key: data_key.wrapped,
                sealed,
            };
            return Ok((stored.encode(), kms.key_id().to_owned()));
        }

        let key = self.local_key()?;
        let stored = StoredCiphertext::Local {
            sealed: seal(key, plaintext.as_bytes())?,
        };
        Ok((stored.encode(), LOCAL_KEY_METHOD.to_owned()))
    }

    /// Open a stored value.
    ///
    /// # Errors
    ///
    /// Returns an [`EncryptionError`] if neither configured backend can
    /// open it. No partial plaintext is ever returned.
    pub async fn decrypt(&self, ciphertext: &str, key_method: &str) -> Result<String, EncryptionError> {
        let stored = StoredCiphertext::parse(ciphertext)?;
        let preferred = match &stored {
            StoredCiphertext::Local { .. } => BackendKind::Local,
            StoredCiphertext::LegacyLocal { .. } | StoredCiphertext::Managed { .. } => {
                KeyMethod::parse(key_method).backend()
            }
        };

        let first = match self.open_with(preferred, &stored).await {
            Ok(plaintext) => return Ok(plaintext),
            Err(e) => e,
        };

        let alternate = preferred.alternate();
        if !self.is_configured(alternate) {
            return Err(first);
        }

        debug!(
            preferred = preferred.as_str(),
            alternate = alternate.as_str(),
            error = %first,
            "retrying decryption with alternate backend"
        );
        match self.open_with(alternate, &stored).await {
            Ok(plaintext) => Ok(plaintext),
            Err(second) => match first {
                EncryptionError::Malformed { .. } | EncryptionError::NotConfigured { .. } => {
                    Err(second)
                }
                other => Err(other),
            },
        }
    }

    /// Decrypt a batch, handling unrecoverable entries per `mode`.
    ///
    /// # Errors
    ///
    /// In [`DecryptFailureMode::FailFast`], returns the first entry's error.
    /// [`DecryptFailureMode::SkipAndLog`] never fails.
    pub async fn decrypt_many(
        &self,
        values: &[SealedValue],
        mode: DecryptFailureMode,
    ) -> Result<BatchOutcome, EncryptionError> {
        let mut outcome = BatchOutcome::default();
        for value in values {
            match self.decrypt(&value.ciphertext, &value.key_method).await {
                Ok(plaintext) => outcome.decrypted.push(DecryptedValue {
                    id: value.id,
                    plaintext,
                }),
                Err(e) => match mode {
                    DecryptFailureMode::FailFast => return Err(e),
                    DecryptFailureMode::SkipAndLog => {
                        warn!(secret_id = %value.id, error = %e, "skipping undecryptable secret");
                        outcome.skipped.push(value.id);
                    }
                },
            }
        }
        Ok(outcome)
    }

    async fn open_with(
        &self,
        backend: BackendKind,
        stored: &StoredCiphertext,
    ) -> Result<String, EncryptionError> {
        let raw = match (backend, stored) {
            (
                BackendKind::Local,
                StoredCiphertext::Local { sealed } | StoredCiphertext::LegacyLocal { sealed },
            ) => open(self.local_key()?, sealed)?,
            (
                BackendKind::Managed,
                StoredCiphertext::Managed {
                    wrapped_key,
                    sealed,
                },
            ) => {
                let kms = self.managed.as_ref().ok_or_else(|| EncryptionError::NotConfigured {
                    method: BackendKind::Managed.as_str().to_owned(),
                })?;
                let data_key = kms.unwrap_key(wrapped_key).await?;
                open(&data_key, sealed)?
            }
            (backend, _) => {
                return Err(EncryptionError::Malformed {
                    reason: format!("value was not sealed by the {} backend", backend.as_str()),
                });
            }
        };

        String::from_utf8(raw).map_err(|_| EncryptionError::Decryption {
            reason: "plaintext is not valid UTF-8".to_owned(),
        })
    }

    fn local_key(&self) -> Result<&DataKey, EncryptionError> {
        self.local.as_ref().ok_or_else(|| EncryptionError::NotConfigured {
            method: LOCAL_KEY_METHOD.to_owned(),
        })
    }
}

impl std::fmt::Debug for EnvelopeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCipher")
            .field("managed", &self.managed.as_ref().map(|k| k.key_id().to_owned()))
            .field("local", &self.local.is_some())
            .finish()
    }
}

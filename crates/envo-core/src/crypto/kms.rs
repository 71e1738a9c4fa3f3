//! Key management backends.
//!
//! A [`KeyManagement`] backend issues a fresh data key per sealed value and
//! later unwraps it. The plaintext data key never leaves the process; only
//! the wrapped form is stored next to the ciphertext.

use async_trait::async_trait;

use super::{DataKey, open, seal};
use crate::error::EncryptionError;

/// A freshly issued data key: plaintext for sealing, wrapped for storage.
#[derive(Debug)]
pub struct GeneratedDataKey {
    pub plaintext: DataKey,
    pub wrapped: Vec<u8>,
}

/// Result of the backend health check.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct KeyDescription {
    pub key_id: String,
    pub enabled: bool,
}

/// External key management service.
#[async_trait]
pub trait KeyManagement: Send + Sync {
    /// Identifier of the master key, stored as the secret's key method.
    fn key_id(&self) -> &str;

    /// # Errors
    ///
    /// Returns [`EncryptionError::BackendUnavailable`] if the service fails.
    async fn generate_data_key(&self) -> Result<GeneratedDataKey, EncryptionError>;

    /// # Errors
    ///
    /// Returns an [`EncryptionError`] if the service is unreachable or the
    /// wrapped key was not issued by this master key.
    async fn unwrap_key(&self, wrapped: &[u8]) -> Result<DataKey, EncryptionError>;

    /// # Errors
    ///
    /// Returns [`EncryptionError::BackendUnavailable`] if the service fails.
    async fn describe_key(&self) -> Result<KeyDescription, EncryptionError>;
}

/// In-process backend that wraps data keys under a master key.
///
/// Used for development and tests where no managed service is available.
pub struct InMemoryKms {
    key_id: String,
    master: DataKey,
}

impl InMemoryKms {
    #[must_use]
    pub fn new(key_id: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            master: DataKey::generate(),
        }
    }

    #[must_use]
    pub fn with_master_key(key_id: impl Into<String>, master: DataKey) -> Self {
        Self {
            key_id: key_id.into(),
            master,
        }
    }
}

#[async_trait]
impl KeyManagement for InMemoryKms {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn generate_data_key(&self) -> Result<GeneratedDataKey, EncryptionError> {
        let plaintext = DataKey::generate();
        let wrapped = seal(&self.master, plaintext.as_bytes())?;
        Ok(GeneratedDataKey { plaintext, wrapped })
    }

    async fn unwrap_key(&self, wrapped: &[u8]) -> Result<DataKey, EncryptionError> {
        let raw = open(&self.master, wrapped)?;
        DataKey::from_slice(&raw)
    }

    async fn describe_key(&self) -> Result<KeyDescription, EncryptionError> {
        Ok(KeyDescription {
            key_id: self.key_id.clone(),
            enabled: true,
        })
    }
}

impl std::fmt::Debug for InMemoryKms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryKms")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "aws-kms")]
pub use aws::AwsKms;

#[cfg(feature = "aws-kms")]
mod aws {
    use async_trait::async_trait;
    use aws_sdk_kms::error::DisplayErrorContext;
    use aws_sdk_kms::primitives::Blob;
    use aws_sdk_kms::types::DataKeySpec;
    use tracing::debug;

    use super::{GeneratedDataKey, KeyDescription, KeyManagement};
    use crate::crypto::DataKey;
    use crate::error::EncryptionError;

    /// AWS KMS backend. Credentials and region come from the default
    /// provider chain.
    #[derive(Debug, Clone)]
    pub struct AwsKms {
        client: aws_sdk_kms::Client,
        key_id: String,
    }

    impl AwsKms {
        /// Load the shared AWS config and build a client for `key_id`.
        pub async fn connect(key_id: impl Into<String>) -> Self {
            let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            Self {
                client: aws_sdk_kms::Client::new(&config),
                key_id: key_id.into(),
            }
        }
    }

    fn unavailable(op: &str, err: impl std::error::Error) -> EncryptionError {
        EncryptionError::BackendUnavailable {
            reason: format!("KMS {op} failed: {}", DisplayErrorContext(err)),
        }
    }

    #[async_trait]
    impl KeyManagement for AwsKms {
        fn key_id(&self) -> &str {
            &self.key_id
        }

        async fn generate_data_key(&self) -> Result<GeneratedDataKey, EncryptionError> {
            let out = self
                .client
                .generate_data_key()
                .key_id(&self.key_id)
                .key_spec(DataKeySpec::Aes256)
                .send()
                .await
                .map_err(|e| unavailable("GenerateDataKey", e))?;

            let plaintext = out.plaintext().ok_or_else(|| EncryptionError::BackendUnavailable {
                reason: "GenerateDataKey returned no plaintext key".to_owned(),
            })?;
            let wrapped = out
                .ciphertext_blob()
                .ok_or_else(|| EncryptionError::BackendUnavailable {
                    reason: "GenerateDataKey returned no wrapped key".to_owned(),
                })?;

            debug!(key_id = %self.key_id, "generated data key");
            Ok(GeneratedDataKey {
                plaintext: DataKey::from_slice(plaintext.as_ref())?,
                wrapped: wrapped.as_ref().to_vec(),
            })
        }

        async fn unwrap_key(&self, wrapped: &[u8]) -> Result<DataKey, EncryptionError> {
            let out = self
                .client
                .decrypt()
                .key_id(&self.key_id)
                .ciphertext_blob(Blob::new(wrapped))
                .send()
                .await
                .map_err(|e| unavailable("Decrypt", e))?;

            let plaintext = out.plaintext().ok_or_else(|| EncryptionError::Decryption {
                reason: "KMS Decrypt returned no plaintext".to_owned(),
            })?;
            DataKey::from_slice(plaintext.as_ref())
        }

        async fn describe_key(&self) -> Result<KeyDescription, EncryptionError> {
            let out = self
                .client
                .describe_key()
                .key_id(&self.key_id)
                .send()
                .await
                .map_err(|e| unavailable("DescribeKey", e))?;

            Ok(KeyDescription {
                key_id: self.key_id.clone(),
                enabled: out.key_metadata().is_some_and(aws_sdk_kms::types::KeyMetadata::enabled),
            })
        }
    }
}

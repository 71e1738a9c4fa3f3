//! Error types for `envo-core`.
//!
//! [`CoreError`] is the taxonomy every service returns; the HTTP layer maps
//! each variant to one status code. Encryption errors never include key
//! material or plaintext, only backend names and operation descriptions.

use envo_storage::StorageError;

/// Errors from the envelope encryption service and key management backends.
///
/// Every failure mode (backend unreachable, truncated ciphertext, tag
/// mismatch) collapses into this one kind at the [`CoreError`] level.
#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    /// The key management backend could not be reached or refused the call.
    #[error("key management backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    /// Ciphertext is too short to contain a nonce and tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },

    /// AES-256-GCM decryption failed (wrong key, corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// The stored value could not be decoded.
    #[error("malformed ciphertext: {reason}")]
    Malformed { reason: String },

    /// The backend the value was sealed with is not configured here.
    #[error("encryption backend not configured: {method}")]
    NotConfigured { method: String },
}

/// Errors from audit backends. Never surfaced past the audit logger.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// A specific audit backend failed.
    #[error("audit backend '{name}' failed: {reason}")]
    BackendFailure { name: String, reason: String },

    /// The entry could not be serialized.
    #[error("audit entry serialization failed: {reason}")]
    Serialization { reason: String },
}

/// The error taxonomy shared by every core service.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Missing, invalid or expired credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The caller is authenticated but lacks the required permission.
    #[error("permission denied: {0}")]
    Authorization(String),

    /// A tier limit blocks the creation.
    #[error("{resource} limit reached ({limit}) for the current tier")]
    QuotaExceeded { resource: &'static str, limit: i64 },

    /// Encryption or decryption failed.
    #[error("encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    /// Malformed input.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The referenced resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness rule rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Misconfiguration or an unexpected internal state.
    #[error("internal error: {0}")]
    Internal(String),

    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict { .. } => Self::Conflict(err.to_string()),
            StorageError::NotFound { .. } => Self::NotFound(err.to_string()),
            other => Self::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_conflict_maps_to_conflict() {
        let err: CoreError = StorageError::Conflict {
            entity: "org member",
            detail: "user already in organization".to_owned(),
        }
        .into();
        assert!(matches!(err, CoreError::Conflict(msg) if msg.contains("org member")));
    }

    #[test]
    fn storage_query_failure_stays_internal() {
        let err: CoreError = StorageError::Query {
            operation: "list_secrets",
            reason: "connection reset".to_owned(),
        }
        .into();
        assert!(matches!(err, CoreError::Storage(_)));
    }

    #[test]
    fn quota_message_names_resource_and_limit() {
        let err = CoreError::QuotaExceeded {
            resource: "projects",
            limit: 1,
        };
        assert_eq!(err.to_string(), "projects limit reached (1) for the current tier");
    }
}

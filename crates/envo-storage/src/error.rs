//! Storage error types.
//!
//! Every variant carries enough context to diagnose the failure without a
//! debugger. Values stored in rows (ciphertexts, token hashes) never appear
//! in error messages.

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to connect to or migrate the backing database.
    #[error("failed to open storage: {reason}")]
    Open { reason: String },

    /// A unique constraint rejected the write.
    #[error("{entity} already exists: {detail}")]
    Conflict {
        entity: &'static str,
        detail: String,
    },

    /// A row that the write depends on does not exist.
    #[error("{entity} not found: {detail}")]
    NotFound {
        entity: &'static str,
        detail: String,
    },

    /// A query failed for a reason other than a constraint violation.
    #[error("storage query failed during {operation}: {reason}")]
    Query {
        operation: &'static str,
        reason: String,
    },

    /// Failed to begin or commit a transaction.
    #[error("transaction failed: {reason}")]
    Transaction { reason: String },
}

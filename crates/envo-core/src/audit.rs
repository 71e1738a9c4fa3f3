//! Audit logging.
//!
//! Every security-relevant mutation records an [`AuditEvent`] after the
//! mutation has committed. Recording only enqueues the entry: a drain task
//! owns the backends and writes entries in order, so request handlers never
//! wait on audit I/O. Each backend's error is logged with `tracing::warn!`
//! and dropped. An entry may therefore be missing for a committed mutation,
//! but is never written for one that failed. Entries are append-only.

use std::sync::Arc;

use chrono::Utc;
use envo_storage::Store;
use envo_storage::models::AuditLogEntry;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AuditError, CoreError};

/// Default and maximum page size for audit queries.
pub const DEFAULT_AUDIT_LIMIT: i64 = 100;
pub const MAX_AUDIT_LIMIT: i64 = 500;

/// Entries queued ahead of the drain task before `record` waits.
const QUEUE_CAPACITY: usize = 1024;

/// Action names written to the audit log.
pub mod action {
    pub const SECRET_READ: &str = "secret_read";
    pub const SECRET_CREATE: &str = "secret_create";
    pub const SECRET_UPDATE: &str = "secret_update";
    pub const SECRET_DELETE: &str = "secret_delete";
    pub const ORG_CREATE: &str = "org_create";
    pub const MEMBER_INVITE: &str = "member_invite";
    pub const MEMBER_REMOVE: &str = "member_remove";
    pub const ROLE_CHANGE: &str = "role_change";
    pub const PROJECT_CREATE: &str = "project_create";
    pub const ENVIRONMENT_CREATE: &str = "environment_create";
}

/// What happened, by whom, to what.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub actor_id: Uuid,
    pub org_id: Option<Uuid>,
    pub action: &'static str,
    pub resource_type: &'static str,
    pub resource_id: Uuid,
    pub ip_address: String,
    pub metadata: serde_json::Value,
}

impl AuditEvent {
    #[must_use]
    pub fn new(
        actor_id: Uuid,
        org_id: Option<Uuid>,
        action: &'static str,
        resource_type: &'static str,
        resource_id: Uuid,
        ip_address: &str,
    ) -> Self {
        Self {
            actor_id,
            org_id,
            action,
            resource_type,
            resource_id,
            ip_address: ip_address.to_owned(),
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A destination for audit entries.
#[async_trait::async_trait]
pub trait AuditBackend: Send + Sync {
    /// The backend's name (for error reporting).
    fn name(&self) -> &str;

    /// Persist one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry could not be persisted.
    async fn log(&self, entry: &AuditLogEntry) -> Result<(), AuditError>;
}

/// Writes entries to the relational store.
pub struct StoreAuditBackend {
    store: Arc<dyn Store>,
}

impl StoreAuditBackend {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl AuditBackend for StoreAuditBackend {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "store"
    }

    async fn log(&self, entry: &AuditLogEntry) -> Result<(), AuditError> {
        self.store
            .append_audit(entry)
            .await
            .map_err(|e| AuditError::BackendFailure {
                name: "store".to_owned(),
                reason: e.to_string(),
            })
    }
}

enum AuditCommand {
    Record(Box<AuditLogEntry>),
    Flush(oneshot::Sender<()>),
}

/// Queues audit events for a background fan-out and serves audit queries.
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn Store>,
    queue: mpsc::Sender<AuditCommand>,
    backend_names: Arc<Vec<String>>,
}

impl AuditLogger {
    /// A logger writing to the store only.
    ///
    /// # Panics
    ///
    /// Spawns the drain task, so it must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_mirrors(store, Vec::new())
    }

    /// A logger writing to the store, then to each mirror (for example a
    /// JSON-lines file).
    ///
    /// # Panics
    ///
    /// Spawns the drain task, so it must be called inside a Tokio runtime.
    #[must_use]
    pub fn with_mirrors(store: Arc<dyn Store>, mirrors: Vec<Arc<dyn AuditBackend>>) -> Self {
        let mut backends: Vec<Arc<dyn AuditBackend>> = vec![Arc::new(StoreAuditBackend::new(store.clone()))];
        backends.extend(mirrors);
        let backend_names = backends.iter().map(|b| b.name().to_owned()).collect();

        let (queue, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(drain(rx, backends));
        Self {
            store,
            queue,
            backend_names: Arc::new(backend_names),
        }
    }

    /// Enqueue an event. Never fails the caller.
    pub async fn record(&self, event: AuditEvent) {
        let entry = AuditLogEntry {
            id: Uuid::new_v4(),
            actor_id: event.actor_id,
            org_id: event.org_id,
            action: event.action.to_owned(),
            resource_type: event.resource_type.to_owned(),
            resource_id: event.resource_id,
            ip_address: event.ip_address,
            metadata: event.metadata,
            created_at: Utc::now(),
        };
        let action = entry.action.clone();
        if self.queue.send(AuditCommand::Record(Box::new(entry))).await.is_err() {
            warn!(action = %action, "audit queue closed, entry dropped");
        }
    }

    /// Wait until every event recorded before this call has reached all
    /// backends.
    pub async fn flush(&self) {
        let (done, waiter) = oneshot::channel();
        if self.queue.send(AuditCommand::Flush(done)).await.is_err() {
            return;
        }
        let _ = waiter.await;
    }

    /// Latest entries of an organization, newest first.
    ///
    /// A `limit` outside `1..=500` falls back to 100.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    pub async fn list_org_logs(&self, org_id: Uuid, limit: i64) -> Result<Vec<AuditLogEntry>, CoreError> {
        self.flush().await;
        Ok(self.store.list_org_audit(org_id, clamp_limit(limit)).await?)
    }
}

async fn drain(mut rx: mpsc::Receiver<AuditCommand>, backends: Vec<Arc<dyn AuditBackend>>) {
    while let Some(command) = rx.recv().await {
        match command {
            AuditCommand::Record(entry) => {
                for backend in &backends {
                    if let Err(e) = backend.log(&entry).await {
                        warn!(
                            backend = backend.name(),
                            action = %entry.action,
                            resource_id = %entry.resource_id,
                            error = %e,
                            "audit write failed"
                        );
                    }
                }
            }
            AuditCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("audit queue drained");
}

#[must_use]
pub fn clamp_limit(limit: i64) -> i64 {
    if (1..=MAX_AUDIT_LIMIT).contains(&limit) {
        limit
    } else {
        DEFAULT_AUDIT_LIMIT
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("backends", &self.backend_names)
            .finish_non_exhaustive()
    }
}

//! JSON-lines audit mirror.
//!
//! Appends one JSON object per [`AuditLogEntry`] to a local file, next to
//! the primary store backend. The file is only ever opened in append mode.
//! Writes are serialized through a `tokio::sync::Mutex`.

use std::path::{Path, PathBuf};

use envo_storage::models::AuditLogEntry;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::audit::AuditBackend;
use crate::error::AuditError;

const NAME: &str = "file";

/// Audit backend appending JSON lines to a file.
pub struct FileAuditBackend {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileAuditBackend {
    /// The file is created on the first write if it does not exist.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
        }
    }

    async fn append(&self, line: &[u8]) -> Result<(), AuditError> {
        let mut slot = self.file.lock().await;
        if slot.is_none() {
            let opened = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| failure(format!("cannot open '{}': {e}", self.path.display())))?;
            *slot = Some(opened);
        }
        let Some(file) = slot.as_mut() else {
            return Err(failure("audit file handle missing after open".to_owned()));
        };

        file.write_all(line)
            .await
            .map_err(|e| failure(format!("write failed: {e}")))?;
        file.flush()
            .await
            .map_err(|e| failure(format!("flush failed: {e}")))
    }
}

fn failure(reason: String) -> AuditError {
    AuditError::BackendFailure {
        name: NAME.to_owned(),
        reason,
    }
}

#[async_trait::async_trait]
impl AuditBackend for FileAuditBackend {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        NAME
    }

    async fn log(&self, entry: &AuditLogEntry) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(entry).map_err(|e| AuditError::Serialization {
            reason: e.to_string(),
        })?;
        line.push(b'\n');
        self.append(&line).await
    }
}

impl std::fmt::Debug for FileAuditBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAuditBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

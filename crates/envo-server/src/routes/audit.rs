//! Audit log routes. Read-only.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Extension, Json, Router};
use envo_core::audit::DEFAULT_AUDIT_LIMIT;
use envo_core::rbac::Permission;
use envo_storage::models::AuditLogEntry;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::CurrentUser;
use crate::state::AppState;

/// Query parameters for audit listing. Out-of-range limits fall back to
/// the default.
#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    DEFAULT_AUDIT_LIMIT
}

/// Build the audit router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/orgs/{org_id}/audit-logs", get(list_audit))
}

/// `GET /api/v1/orgs/{org_id}/audit-logs`: newest first.
async fn list_audit(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(org_id): Path<Uuid>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditLogEntry>>, AppError> {
    state
        .resolver
        .require_org_permission(user.id, org_id, Permission::AuditView)
        .await?;
    Ok(Json(state.audit.list_org_logs(org_id, query.limit).await?))
}

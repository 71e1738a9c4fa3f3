//! `GET /health`: liveness plus the key management check.
//!
//! With a managed key configured the key is described on every call; a
//! missing or disabled key reports `degraded` with 503.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::warn;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub encryption: EncryptionHealth,
}

#[derive(Debug, Serialize)]
pub struct EncryptionHealth {
    pub primary: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let mut encryption = EncryptionHealth {
        primary: state.cipher.primary().as_str(),
        key_id: None,
        key_enabled: None,
        error: None,
    };

    if let Some(kms) = state.cipher.managed() {
        encryption.key_id = Some(kms.key_id().to_owned());
        match kms.describe_key().await {
            Ok(description) => encryption.key_enabled = Some(description.enabled),
            Err(e) => {
                warn!(error = %e, "key management health check failed");
                encryption.error = Some("key management backend unavailable".to_owned());
            }
        }
    }

    let healthy = encryption.error.is_none() && encryption.key_enabled != Some(false);
    let (status, label) = if healthy {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status,
        Json(HealthResponse {
            status: label,
            encryption,
        }),
    )
}

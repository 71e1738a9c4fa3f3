//! Secret routes.
//!
//! Listing returns metadata only. Values leave the server through
//! `GET /secrets/{id}` and the environment export, both audited.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json, Router};
use envo_core::secrets::{ExportedSecrets, RevealedSecret};
use envo_storage::models::Secret;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::{ClientIp, CurrentUser};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSecretRequest {
    pub key: String,
    pub value: String,
}

/// Both fields are optional; at least one must be present.
#[derive(Debug, Deserialize)]
pub struct UpdateSecretRequest {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

/// Build the secrets router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/environments/{env_id}/secrets",
            get(list_secrets).post(create_secret),
        )
        .route("/environments/{env_id}/secrets/export", get(export_secrets))
        .route(
            "/secrets/{secret_id}",
            get(reveal_secret).patch(update_secret).delete(delete_secret),
        )
}

/// `POST /api/v1/environments/{env_id}/secrets`
async fn create_secret(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(env_id): Path<Uuid>,
    Json(body): Json<CreateSecretRequest>,
) -> Result<(StatusCode, Json<Secret>), AppError> {
    let secret = state
        .secrets
        .create(user.id, env_id, &body.key, &body.value, &ip)
        .await?;
    Ok((StatusCode::CREATED, Json(secret)))
}

/// `GET /api/v1/environments/{env_id}/secrets`
async fn list_secrets(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(env_id): Path<Uuid>,
) -> Result<Json<Vec<Secret>>, AppError> {
    Ok(Json(state.secrets.list(user.id, env_id).await?))
}

/// `GET /api/v1/environments/{env_id}/secrets/export`
async fn export_secrets(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(env_id): Path<Uuid>,
) -> Result<Json<ExportedSecrets>, AppError> {
    Ok(Json(state.secrets.export(user.id, env_id, &ip).await?))
}

/// `GET /api/v1/secrets/{secret_id}`: decrypt one value.
async fn reveal_secret(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(secret_id): Path<Uuid>,
) -> Result<Json<RevealedSecret>, AppError> {
    Ok(Json(state.secrets.reveal(user.id, secret_id, &ip).await?))
}

/// `PATCH /api/v1/secrets/{secret_id}`
async fn update_secret(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(secret_id): Path<Uuid>,
    Json(body): Json<UpdateSecretRequest>,
) -> Result<Json<Secret>, AppError> {
    let secret = state
        .secrets
        .update(user.id, secret_id, body.key.as_deref(), body.value.as_deref(), &ip)
        .await?;
    Ok(Json(secret))
}

/// `DELETE /api/v1/secrets/{secret_id}`
async fn delete_secret(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(secret_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.secrets.delete(user.id, secret_id, &ip).await?;
    Ok(StatusCode::NO_CONTENT)
}

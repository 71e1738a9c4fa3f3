//! Project and environment routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json, Router};
use envo_storage::models::{Environment, Project};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::{ClientIp, CurrentUser};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateNamedRequest {
    pub name: String,
}

/// Build the projects router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orgs/{org_id}/projects", get(list_projects).post(create_project))
        .route(
            "/projects/{project_id}/environments",
            get(list_environments).post(create_environment),
        )
}

/// `POST /api/v1/orgs/{org_id}/projects`
async fn create_project(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(org_id): Path<Uuid>,
    Json(body): Json<CreateNamedRequest>,
) -> Result<(StatusCode, Json<Project>), AppError> {
    let project = state.tenancy.create_project(user.id, org_id, &body.name, &ip).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// `GET /api/v1/orgs/{org_id}/projects`
async fn list_projects(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(org_id): Path<Uuid>,
) -> Result<Json<Vec<Project>>, AppError> {
    Ok(Json(state.tenancy.list_projects(user.id, org_id).await?))
}

/// `POST /api/v1/projects/{project_id}/environments`
async fn create_environment(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(project_id): Path<Uuid>,
    Json(body): Json<CreateNamedRequest>,
) -> Result<(StatusCode, Json<Environment>), AppError> {
    let env = state
        .tenancy
        .create_environment(user.id, project_id, &body.name, &ip)
        .await?;
    Ok((StatusCode::CREATED, Json(env)))
}

/// `GET /api/v1/projects/{project_id}/environments`
async fn list_environments(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Vec<Environment>>, AppError> {
    Ok(Json(state.tenancy.list_environments(user.id, project_id).await?))
}

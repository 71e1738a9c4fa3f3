//! Organization and membership routes.
//!
//! Authorization happens in the tenancy service: mutations need a
//! permission in the organization, listings need membership only.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch};
use axum::{Extension, Json, Router};
use envo_storage::models::{MemberDetail, OrgMember, Organization};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::{ClientIp, CurrentUser};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateOrgRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub email: String,
    pub role: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangeRoleRequest {
    pub role: String,
}

/// Build the organizations router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orgs", get(list_orgs).post(create_org))
        .route("/orgs/{org_id}", get(get_org))
        .route("/orgs/{org_id}/members", get(list_members).post(add_member))
        .route(
            "/orgs/{org_id}/members/{member_id}",
            patch(change_role).delete(remove_member),
        )
}

/// `POST /api/v1/orgs`: create an organization owned by the caller.
async fn create_org(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Json(body): Json<CreateOrgRequest>,
) -> Result<(StatusCode, Json<Organization>), AppError> {
    let org = state.tenancy.create_organization(user.id, &body.name, &ip).await?;
    Ok((StatusCode::CREATED, Json(org)))
}

/// `GET /api/v1/orgs`: organizations the caller belongs to.
async fn list_orgs(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<Vec<Organization>>, AppError> {
    Ok(Json(state.tenancy.list_organizations(user.id).await?))
}

/// `GET /api/v1/orgs/{org_id}`
async fn get_org(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(org_id): Path<Uuid>,
) -> Result<Json<Organization>, AppError> {
    Ok(Json(state.tenancy.get_organization(user.id, org_id).await?))
}

/// `GET /api/v1/orgs/{org_id}/members`
async fn list_members(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(org_id): Path<Uuid>,
) -> Result<Json<Vec<MemberDetail>>, AppError> {
    Ok(Json(state.tenancy.list_members(user.id, org_id).await?))
}

/// `POST /api/v1/orgs/{org_id}/members`: add an existing user by email.
async fn add_member(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(org_id): Path<Uuid>,
    Json(body): Json<AddMemberRequest>,
) -> Result<(StatusCode, Json<OrgMember>), AppError> {
    if !body.email.contains('@') {
        return Err(AppError::BadRequest("invalid email".to_owned()));
    }
    let member = state
        .tenancy
        .add_member(user.id, org_id, body.email.trim(), body.role.trim(), &ip)
        .await?;
    Ok((StatusCode::CREATED, Json(member)))
}

/// `PATCH /api/v1/orgs/{org_id}/members/{member_id}`
async fn change_role(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path((org_id, member_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<ChangeRoleRequest>,
) -> Result<Json<OrgMember>, AppError> {
    let member = state
        .tenancy
        .change_member_role(user.id, org_id, member_id, body.role.trim(), &ip)
        .await?;
    Ok(Json(member))
}

/// `DELETE /api/v1/orgs/{org_id}/members/{member_id}`
async fn remove_member(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path((org_id, member_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    state.tenancy.remove_member(user.id, org_id, member_id, &ip).await?;
    Ok(StatusCode::NO_CONTENT)
}

//! Bearer-token authentication middleware.
//!
//! Validates the access token, reloads the user from the store and injects
//! [`CurrentUser`] and [`ClientIp`] into the request extensions. Tokens of
//! deleted users are rejected.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use envo_storage::models::User;

use crate::error::AppError;
use crate::state::AppState;

/// The authenticated caller, as currently stored.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

/// Best-effort client address for audit entries. Empty when unknown.
#[derive(Debug, Clone, Default)]
pub struct ClientIp(pub String);

/// Axum middleware that authenticates API requests.
///
/// # Errors
///
/// Returns [`AppError::Unauthorized`] if the `Authorization` header is
/// missing, malformed, or carries an invalid or expired token.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(req.headers())?;
    let claims = state.tokens.validate_access_token(token)?;

    let user = state
        .store
        .get_user(claims.sub)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::Unauthorized("user not found".to_owned()))?;

    let ip = client_ip(req.headers(), req.extensions().get::<ConnectInfo<SocketAddr>>());
    req.extensions_mut().insert(CurrentUser(user));
    req.extensions_mut().insert(ClientIp(ip));

    Ok(next.run(req).await)
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("missing Authorization header".to_owned()))?;

    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Unauthorized("Authorization header must use Bearer scheme".to_owned()))
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<&ConnectInfo<SocketAddr>>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
    };

    header("x-forwarded-for")
        .or_else(|| header("x-real-ip"))
        .or_else(|| peer.map(|ConnectInfo(addr)| addr.ip().to_string()))
        .unwrap_or_default()
}

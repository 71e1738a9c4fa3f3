//! HTTP route handlers.
//!
//! Everything except `/health` lives under `/api/v1`. Login, refresh and
//! logout are public; all other API routes require a bearer access token.

pub mod audit;
pub mod auth;
pub mod health;
pub mod orgs;
pub mod projects;
pub mod secrets;

use std::sync::Arc;

use axum::Router;
use axum::middleware as axum_mw;

use crate::middleware::auth_middleware;
use crate::state::AppState;

/// The `/api/v1` router, authenticated and public parts merged.
pub fn api_router(state: &Arc<AppState>) -> Router<Arc<AppState>> {
    let authenticated = Router::new()
        .merge(auth::router())
        .merge(orgs::router())
        .merge(projects::router())
        .merge(secrets::router())
        .merge(audit::router())
        .route_layer(axum_mw::from_fn_with_state(Arc::clone(state), auth_middleware));

    let api = Router::new().merge(auth::login_router()).merge(authenticated);

    Router::new().nest("/api/v1", api).merge(health::router())
}

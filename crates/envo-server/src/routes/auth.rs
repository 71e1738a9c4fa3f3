//! Authentication routes: `/api/v1/auth/*`
//!
//! The login endpoints are unauthenticated. Login state survives the round
//! trip through the provider in `HttpOnly` cookies that expire with the
//! login state and are cleared on callback whatever its outcome.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::http::header::LOCATION;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Utc};
use envo_core::login::{LOGIN_STATE_TTL_SECS, LoginFlow, LoginOutcome, LoginService, PendingLogin};
use envo_core::quota::TierInfo;
use envo_core::token::TokenPair;
use envo_storage::models::Tier;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::CurrentUser;
use crate::state::AppState;

pub const STATE_COOKIE: &str = "oauth_state";
pub const FLOW_COOKIE: &str = "oauth_flow";
pub const CLI_CALLBACK_COOKIE: &str = "cli_callback";
pub const NEXT_COOKIE: &str = "post_login_next";

/// Unauthenticated login, token refresh and logout routes.
pub fn login_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/google/login", get(google_login))
        .route("/auth/cli/google/start", get(cli_start))
        .route("/auth/google/callback", get(google_callback))
        .route("/auth/cli/exchange", post(cli_exchange))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
}

/// Routes that need a valid access token.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/me", get(me))
        .route("/auth/tier-info", get(tier_info))
}

// ── Types ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WebLoginQuery {
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CliStartQuery {
    #[serde(default)]
    pub callback: String,
}

/// Query parameters returned by the provider on callback.
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeRequest {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub tier: Tier,
    pub oauth_provider: String,
    pub created_at: DateTime<Utc>,
}

// ── Handlers ─────────────────────────────────────────────────────────

/// `GET /api/v1/auth/google/login`: start a browser login.
async fn google_login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(query): Query<WebLoginQuery>,
) -> Result<(CookieJar, Response), AppError> {
    let start = login_service(&state)?.initiate_web(query.next.as_deref())?;
    let jar = remember(jar, &start.pending, state.cookie_secure);
    Ok((jar, found(&start.authorize_url)))
}

/// `GET /api/v1/auth/cli/google/start?callback=`: start a CLI login.
async fn cli_start(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(query): Query<CliStartQuery>,
) -> Result<(CookieJar, Response), AppError> {
    if query.callback.trim().is_empty() {
        return Err(AppError::BadRequest("callback is required".to_owned()));
    }
    let start = login_service(&state)?.initiate_cli(&query.callback)?;
    let jar = remember(jar, &start.pending, state.cookie_secure);
    Ok((jar, found(&start.authorize_url)))
}

/// `GET /api/v1/auth/google/callback`: finish either login flow.
async fn google_callback(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(query): Query<CallbackQuery>,
) -> (CookieJar, Response) {
    let pending = recall(&jar);
    let jar = forget(jar);
    let response = complete_login(&state, pending.as_ref(), query).await.into_response();
    (jar, response)
}

async fn complete_login(
    state: &AppState,
    pending: Option<&PendingLogin>,
    query: CallbackQuery,
) -> Result<Response, AppError> {
    if let Some(error) = query.error {
        warn!(error = %error, "identity provider returned an error");
        return Err(AppError::Unauthorized(format!("provider error: {error}")));
    }

    let outcome = login_service(state)?
        .complete(pending, &query.state, &query.code)
        .await?;

    match outcome {
        LoginOutcome::WebComplete { redirect_url, .. } => Ok(found(&redirect_url)),
        LoginOutcome::CliExchangePending { redirect_url, user_id } => {
            info!(user_id = %user_id, "CLI exchange code issued");
            Ok(found(&redirect_url))
        }
    }
}

/// `POST /api/v1/auth/cli/exchange`: trade a one-time code for tokens.
async fn cli_exchange(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExchangeRequest>,
) -> Result<Json<TokenPair>, AppError> {
    let tokens = login_service(&state)?.exchange(&body.code).await?;
    Ok(Json(tokens))
}

/// `POST /api/v1/auth/refresh`: mint a new access token.
async fn refresh(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<TokenPair>, AppError> {
    let tokens = state.tokens.rotate(&body.refresh_token).await?;
    Ok(Json(tokens))
}

/// `POST /api/v1/auth/logout`: revoke a refresh token.
async fn logout(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    state.tokens.revoke(&body.refresh_token).await?;
    Ok(Json(MessageResponse {
        message: "Logged out successfully",
    }))
}

/// `GET /api/v1/auth/me`
async fn me(Extension(CurrentUser(user)): Extension<CurrentUser>) -> Json<MeResponse> {
    Json(MeResponse {
        id: user.id,
        email: user.email,
        name: user.name,
        tier: user.tier,
        oauth_provider: user.oauth_provider,
        created_at: user.created_at,
    })
}

/// `GET /api/v1/auth/tier-info`: limits and per-organization usage.
async fn tier_info(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<TierInfo>, AppError> {
    Ok(Json(state.quota.tier_info(user.id).await?))
}

// ── Helpers ──────────────────────────────────────────────────────────

fn login_service(state: &AppState) -> Result<&LoginService, AppError> {
    state
        .login
        .as_ref()
        .ok_or_else(|| AppError::BadRequest("login is not configured".to_owned()))
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(LOCATION, location.to_owned())]).into_response()
}

fn login_cookie(name: &'static str, value: String, secure: bool) -> Cookie<'static> {
    Cookie::build((name, value))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(LOGIN_STATE_TTL_SECS))
        .build()
}

fn expired(name: &'static str) -> Cookie<'static> {
    Cookie::build(name).path("/").build()
}

/// Store a pending login in cookies, dropping leftovers of another flow.
fn remember(jar: CookieJar, pending: &PendingLogin, secure: bool) -> CookieJar {
    let jar = jar
        .add(login_cookie(STATE_COOKIE, pending.state.clone(), secure))
        .add(login_cookie(FLOW_COOKIE, pending.flow.kind().to_owned(), secure));

    match &pending.flow {
        LoginFlow::Web { next: Some(next) } => jar
            .add(login_cookie(NEXT_COOKIE, next.clone(), secure))
            .remove(expired(CLI_CALLBACK_COOKIE)),
        LoginFlow::Web { next: None } => jar.remove(expired(NEXT_COOKIE)).remove(expired(CLI_CALLBACK_COOKIE)),
        LoginFlow::Cli { callback } => jar
            .add(login_cookie(CLI_CALLBACK_COOKIE, callback.clone(), secure))
            .remove(expired(NEXT_COOKIE)),
    }
}

/// Rebuild the pending login from cookies. A CLI flow without its callback
/// is treated as missing.
fn recall(jar: &CookieJar) -> Option<PendingLogin> {
    let value = |name: &str| {
        jar.get(name)
            .map(|c| c.value().trim().to_owned())
            .filter(|v| !v.is_empty())
    };

    let state = value(STATE_COOKIE)?;
    let flow = if value(FLOW_COOKIE).as_deref() == Some("cli") {
        LoginFlow::Cli {
            callback: value(CLI_CALLBACK_COOKIE)?,
        }
    } else {
        LoginFlow::Web {
            next: value(NEXT_COOKIE),
        }
    };
    Some(PendingLogin { state, flow })
}

fn forget(jar: CookieJar) -> CookieJar {
    [STATE_COOKIE, FLOW_COOKIE, CLI_CALLBACK_COOKIE, NEXT_COOKIE]
        .into_iter()
        .fold(jar, |jar, name| jar.remove(expired(name)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn pending_login_survives_the_cookie_round_trip() {
        let web = PendingLogin {
            state: "s1".to_owned(),
            flow: LoginFlow::Web {
                next: Some("http://localhost:3000/dash".to_owned()),
            },
        };
        let jar = remember(CookieJar::new(), &web, true);
        assert_eq!(recall(&jar), Some(web));

        let cli = PendingLogin {
            state: "s2".to_owned(),
            flow: LoginFlow::Cli {
                callback: "http://127.0.0.1:53682/callback".to_owned(),
            },
        };
        let jar = remember(jar, &cli, true);
        assert_eq!(recall(&jar), Some(cli));

        let cookie = jar.get(STATE_COOKIE).unwrap();
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.max_age(), Some(time::Duration::minutes(10)));
    }

    #[test]
    fn cli_flow_without_callback_is_missing() {
        let jar = CookieJar::new()
            .add(Cookie::new(STATE_COOKIE, "s"))
            .add(Cookie::new(FLOW_COOKIE, "cli"));
        assert_eq!(recall(&jar), None);
        assert_eq!(recall(&CookieJar::new()), None);
    }

    #[test]
    fn forget_clears_every_login_cookie() {
        let pending = PendingLogin {
            state: "s".to_owned(),
            flow: LoginFlow::Web { next: None },
        };
        let jar = forget(remember(CookieJar::new(), &pending, false));
        assert_eq!(recall(&jar), None);
    }
}

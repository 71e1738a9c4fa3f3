//! OAuth login flow for browsers and the CLI.
//!
//! ```text
//! Idle ──initiate──▶ AwaitingProviderCallback ──complete──┬─▶ WebComplete
//!                                                         └─▶ CliExchangePending ──exchange──▶ done
//! ```
//!
//! The pending state ([`PendingLogin`]) lives client-side (the HTTP layer
//! keeps it in short-lived cookies). The callback must echo the exact state
//! value or the flow fails before the provider code is even exchanged.
//!
//! The CLI variant never puts tokens in the browser: it redirects to the
//! CLI's loopback listener with a single-use exchange code, which the CLI
//! trades for tokens in a direct request.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use envo_storage::Store;
use envo_storage::models::{LoginExchangeCode, NewUser};
use http::Uri;
use tracing::{info, warn};
use uuid::Uuid;

use crate::crypto::{constant_time_eq, hash_token, random_token};
use crate::error::CoreError;
use crate::token::{TokenIssuer, TokenPair};

/// How long the client-side login state stays valid, in seconds.
pub const LOGIN_STATE_TTL_SECS: i64 = 600;

/// Lifetime of a CLI exchange code, in seconds.
pub const EXCHANGE_CODE_TTL_SECS: i64 = 120;

const LOOPBACK_HOSTS: [&str; 4] = ["127.0.0.1", "localhost", "::1", "[::1]"];

/// Profile returned by the identity provider for an authorization code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub external_id: String,
    pub email: String,
    pub name: String,
}

/// An OAuth identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Provider name stored with the user identity (`google`).
    fn name(&self) -> &str;

    /// The URL the browser is sent to, carrying `state`.
    fn authorize_url(&self, state: &str) -> String;

    /// Trade an authorization code for the user's profile.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Authentication`] if the provider rejects the code.
    async fn exchange_code(&self, code: &str) -> Result<ProviderProfile, CoreError>;
}

/// Which client started the login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginFlow {
    /// Browser login; `next` overrides the default frontend callback.
    Web { next: Option<String> },
    /// CLI login; `callback` is the CLI's loopback listener.
    Cli { callback: String },
}

impl LoginFlow {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Web { .. } => "web",
            Self::Cli { .. } => "cli",
        }
    }
}

/// The `AwaitingProviderCallback` state, held by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLogin {
    pub state: String,
    pub flow: LoginFlow,
}

/// A started login: the state to persist and where to send the browser.
#[derive(Debug, Clone)]
pub struct LoginStart {
    pub pending: PendingLogin,
    pub authorize_url: String,
}

/// Result of a successful provider callback.
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    /// Tokens in the URL fragment of the frontend callback.
    WebComplete { redirect_url: String, tokens: TokenPair },
    /// Exchange code in the query of the CLI's loopback URL.
    CliExchangePending { redirect_url: String, user_id: Uuid },
}

/// Drives the login state machine.
#[derive(Clone)]
pub struct LoginService {
    store: Arc<dyn Store>,
    provider: Arc<dyn IdentityProvider>,
    tokens: TokenIssuer,
    frontend_url: String,
}

impl LoginService {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn IdentityProvider>,
        tokens: TokenIssuer,
        frontend_url: &str,
    ) -> Self {
        Self {
            store,
            provider,
            tokens,
            frontend_url: frontend_url.trim_end_matches('/').to_owned(),
        }
    }

    /// Start a browser login.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] if `next` is not an http(s) URL on
    /// the frontend's origin.
    pub fn initiate_web(&self, next: Option<&str>) -> Result<LoginStart, CoreError> {
        let next = match next.map(str::trim).filter(|n| !n.is_empty()) {
            Some(n) => {
                self.check_same_origin(n)?;
                Some(n.to_owned())
            }
            None => None,
        };
        Ok(self.start(LoginFlow::Web { next }))
    }

    /// Start a CLI login.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] unless `callback` is a plain-http
    /// URL on a loopback host without a fragment.
    pub fn initiate_cli(&self, callback: &str) -> Result<LoginStart, CoreError> {
        let callback = callback.trim();
        validate_cli_callback(callback)?;
        Ok(self.start(LoginFlow::Cli {
            callback: callback.to_owned(),
        }))
    }

    /// Handle the provider callback.
    ///
    /// `pending` is the state recorded at initiation, if the client still
    /// has it. It must be present and its state must equal `state`. The
    /// redirect target it carries came back from the client, so it is
    /// checked again here.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Authentication`] on a missing or mismatched
    /// state or a rejected code, and [`CoreError::Validation`] if the
    /// redirect target is not allowed. No user is created and no token is
    /// issued.
    pub async fn complete(
        &self,
        pending: Option<&PendingLogin>,
        state: &str,
        code: &str,
    ) -> Result<LoginOutcome, CoreError> {
        let pending = pending.ok_or_else(|| CoreError::Authentication("login state missing or expired".to_owned()))?;
        if state.is_empty() || !constant_time_eq(&pending.state, state) {
            warn!(flow = pending.flow.kind(), "login state mismatch");
            return Err(CoreError::Authentication("invalid login state".to_owned()));
        }
        if code.is_empty() {
            return Err(CoreError::Authentication("missing authorization code".to_owned()));
        }
        match &pending.flow {
            LoginFlow::Web { next: Some(next) } => self.check_same_origin(next)?,
            LoginFlow::Web { next: None } => {}
            LoginFlow::Cli { callback } => validate_cli_callback(callback)?,
        }

        let profile = self.provider.exchange_code(code).await?;
        let user = self
            .store
            .upsert_oauth_user(&NewUser {
                oauth_provider: self.provider.name().to_owned(),
                oauth_id: profile.external_id,
                email: profile.email,
                name: profile.name,
            })
            .await?;
        info!(user_id = %user.id, flow = pending.flow.kind(), "login callback accepted");

        match &pending.flow {
            LoginFlow::Web { next } => {
                let tokens = self.tokens.issue_pair(&user).await?;
                let target = next
                    .clone()
                    .unwrap_or_else(|| format!("{}/auth/callback", self.frontend_url));
                let redirect_url = format!(
                    "{target}#access_token={}&refresh_token={}&token_type=Bearer&expires_in={}",
                    tokens.access_token,
                    tokens.refresh_token.as_deref().unwrap_or_default(),
                    tokens.expires_in,
                );
                Ok(LoginOutcome::WebComplete { redirect_url, tokens })
            }
            LoginFlow::Cli { callback } => {
                let code = random_token(32);
                let now = Utc::now();
                self.store
                    .insert_exchange_code(&LoginExchangeCode {
                        id: Uuid::new_v4(),
                        code_hash: hash_token(&code),
                        user_id: user.id,
                        expires_at: now + Duration::seconds(EXCHANGE_CODE_TTL_SECS),
                        used_at: None,
                        created_at: now,
                    })
                    .await?;
                let separator = if callback.contains('?') { '&' } else { '?' };
                Ok(LoginOutcome::CliExchangePending {
                    redirect_url: format!("{callback}{separator}code={code}"),
                    user_id: user.id,
                })
            }
        }
    }

    /// Trade a CLI exchange code for tokens. A code works exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Authentication`] if the code is unknown,
    /// expired or already used.
    pub async fn exchange(&self, code: &str) -> Result<TokenPair, CoreError> {
        let invalid = || CoreError::Authentication("invalid or already used code".to_owned());
        let user_id = self
            .store
            .consume_exchange_code(&hash_token(code.trim()), Utc::now())
            .await?
            .ok_or_else(invalid)?;
        let user = self.store.get_user(user_id).await?.ok_or_else(invalid)?;
        self.tokens.issue_pair(&user).await
    }

    fn start(&self, flow: LoginFlow) -> LoginStart {
        let state = random_token(32);
        LoginStart {
            authorize_url: self.provider.authorize_url(&state),
            pending: PendingLogin { state, flow },
        }
    }

    fn check_same_origin(&self, next: &str) -> Result<(), CoreError> {
        let bad = || CoreError::Validation("next must be a URL on the frontend origin".to_owned());
        let next: Uri = next.parse().map_err(|_| bad())?;
        let frontend: Uri = self
            .frontend_url
            .parse()
            .map_err(|_| CoreError::Internal("frontend URL is not a valid URL".to_owned()))?;

        let scheme_ok = matches!(next.scheme_str(), Some("http" | "https"));
        if scheme_ok && next.scheme() == frontend.scheme() && next.authority() == frontend.authority() {
            Ok(())
        } else {
            Err(bad())
        }
    }
}

/// Accept only plain-http loopback URLs. A fragment would swallow the
/// appended `code` parameter.
fn validate_cli_callback(callback: &str) -> Result<(), CoreError> {
    if callback.contains('#') {
        return Err(CoreError::Validation("callback must not have a fragment".to_owned()));
    }
    let uri: Uri = callback
        .parse()
        .map_err(|_| CoreError::Validation("invalid callback URL".to_owned()))?;
    if uri.scheme_str() != Some("http") {
        return Err(CoreError::Validation("callback must use http".to_owned()));
    }
    match uri.host() {
        Some(host) if LOOPBACK_HOSTS.contains(&host) => Ok(()),
        _ => Err(CoreError::Validation(
            "callback host must be 127.0.0.1, localhost or ::1".to_owned(),
        )),
    }
}

impl std::fmt::Debug for LoginService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginService")
            .field("provider", &self.provider.name())
            .field("frontend_url", &self.frontend_url)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::rbac::PermissionResolver;
    use envo_storage::MemoryStore;

    struct ScriptedProvider;

    #[async_trait]
    impl IdentityProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "google"
        }

        fn authorize_url(&self, state: &str) -> String {
            format!("https://accounts.example.com/auth?state={state}")
        }

        async fn exchange_code(&self, code: &str) -> Result<ProviderProfile, CoreError> {
            match code {
                "good-code" => Ok(ProviderProfile {
                    external_id: "g-42".to_owned(),
                    email: "grace@example.com".to_owned(),
                    name: "Grace".to_owned(),
                }),
                _ => Err(CoreError::Authentication("provider rejected code".to_owned())),
            }
        }
    }

    fn service() -> (Arc<dyn Store>, LoginService) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let tokens = TokenIssuer::new(
            store.clone(),
            PermissionResolver::new(store.clone()),
            b"login-tests-secret-login-tests-secret",
            Duration::minutes(15),
            Duration::days(30),
        )
        .unwrap();
        let login = LoginService::new(store.clone(), Arc::new(ScriptedProvider), tokens, "http://localhost:3000/");
        (store, login)
    }

    fn code_from(redirect: &str) -> String {
        redirect.rsplit("code=").next().unwrap().to_owned()
    }

    #[test]
    fn initiate_generates_fresh_state() {
        let (_, login) = service();
        let a = login.initiate_web(None).unwrap();
        let b = login.initiate_web(None).unwrap();
        assert_eq!(a.pending.state.len(), 64);
        assert_ne!(a.pending.state, b.pending.state);
        assert!(a.authorize_url.ends_with(&a.pending.state));
    }

    #[test]
    fn next_must_share_frontend_origin() {
        let (_, login) = service();
        assert!(login.initiate_web(Some("http://localhost:3000/dashboard")).is_ok());
        assert!(login.initiate_web(Some("https://evil.example.com/")).is_err());
        assert!(login.initiate_web(Some("javascript:alert(1)")).is_err());
        assert!(login.initiate_web(Some("http://localhost:4000/")).is_err());
    }

    #[test]
    fn cli_callback_must_be_loopback_http() {
        let (_, login) = service();
        assert!(login.initiate_cli("http://127.0.0.1:53682/callback").is_ok());
        assert!(login.initiate_cli("http://localhost:9000/cb").is_ok());
        assert!(login.initiate_cli("http://[::1]:9000/cb").is_ok());
        assert!(login.initiate_cli("https://127.0.0.1/cb").is_err());
        assert!(login.initiate_cli("http://attacker.example.com/cb").is_err());
        assert!(login.initiate_cli("http://127.0.0.1.evil.com/cb").is_err());
        assert!(login.initiate_cli("not a url").is_err());
        assert!(login.initiate_cli("http://127.0.0.1:9/cb#x").is_err());
    }

    #[tokio::test]
    async fn tampered_redirect_target_is_refused_at_callback() {
        let (store, login) = service();
        let start = login.initiate_cli("http://127.0.0.1:8765/cb").unwrap();
        let forged_cli = PendingLogin {
            state: start.pending.state.clone(),
            flow: LoginFlow::Cli {
                callback: "https://evil.example.com/steal".to_owned(),
            },
        };
        let result = login.complete(Some(&forged_cli), &start.pending.state, "good-code").await;
        assert!(matches!(result, Err(CoreError::Validation(_))));

        let start = login.initiate_web(None).unwrap();
        let forged_web = PendingLogin {
            state: start.pending.state.clone(),
            flow: LoginFlow::Web {
                next: Some("https://evil.example.com/x".to_owned()),
            },
        };
        let result = login.complete(Some(&forged_web), &start.pending.state, "good-code").await;
        assert!(matches!(result, Err(CoreError::Validation(_))));

        assert!(store.find_user_by_email("grace@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn web_flow_redirects_with_tokens_in_fragment() {
        let (store, login) = service();
        let start = login.initiate_web(None).unwrap();
        let outcome = login
            .complete(Some(&start.pending), &start.pending.state, "good-code")
            .await
            .unwrap();

        let LoginOutcome::WebComplete { redirect_url, tokens } = outcome else {
            unreachable!("web flow must complete in the browser");
        };
        assert!(redirect_url.starts_with("http://localhost:3000/auth/callback#access_token="));
        assert!(redirect_url.contains("&token_type=Bearer&expires_in=900"));
        assert!(tokens.refresh_token.is_some());
        assert!(store.find_user_by_email("grace@example.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn state_mismatch_issues_nothing() {
        let (store, login) = service();
        let start = login.initiate_web(None).unwrap();
        let result = login.complete(Some(&start.pending), "forged-state", "good-code").await;
        assert!(matches!(result, Err(CoreError::Authentication(_))));
        assert!(store.find_user_by_email("grace@example.com").await.unwrap().is_none());

        let missing = login.complete(None, &start.pending.state, "good-code").await;
        assert!(matches!(missing, Err(CoreError::Authentication(_))));
    }

    #[tokio::test]
    async fn rejected_provider_code_fails() {
        let (_, login) = service();
        let start = login.initiate_web(None).unwrap();
        assert!(
            login
                .complete(Some(&start.pending), &start.pending.state, "bad-code")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn repeat_login_finds_same_user() {
        let (_, login) = service();
        let mut ids = Vec::new();
        for _ in 0..2 {
            let start = login.initiate_cli("http://127.0.0.1:8765/cb").unwrap();
            match login
                .complete(Some(&start.pending), &start.pending.state, "good-code")
                .await
                .unwrap()
            {
                LoginOutcome::CliExchangePending { user_id, .. } => ids.push(user_id),
                LoginOutcome::WebComplete { .. } => unreachable!("cli flow"),
            }
        }
        assert_eq!(ids.first(), ids.get(1));
    }

    #[tokio::test]
    async fn cli_code_exchanges_exactly_once() {
        let (_, login) = service();
        let start = login.initiate_cli("http://127.0.0.1:8765/cb").unwrap();
        let outcome = login
            .complete(Some(&start.pending), &start.pending.state, "good-code")
            .await
            .unwrap();
        let LoginOutcome::CliExchangePending { redirect_url, .. } = outcome else {
            unreachable!("cli flow must hand off an exchange code");
        };
        assert!(redirect_url.starts_with("http://127.0.0.1:8765/cb?code="));
        assert!(!redirect_url.contains("access_token"));

        let code = code_from(&redirect_url);
        assert!(login.exchange(&code).await.is_ok());
        let err = login.exchange(&code).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "authentication failed: invalid or already used code"
        );
    }

    #[tokio::test]
    async fn concurrent_exchanges_have_one_winner() {
        let (_, login) = service();
        let start = login.initiate_cli("http://localhost:8765/cb?session=1").unwrap();
        let LoginOutcome::CliExchangePending { redirect_url, .. } = login
            .complete(Some(&start.pending), &start.pending.state, "good-code")
            .await
            .unwrap()
        else {
            unreachable!("cli flow");
        };
        assert!(redirect_url.contains("?session=1&code="));
        let code = code_from(&redirect_url);

        let (a, b) = tokio::join!(login.exchange(&code), login.exchange(&code));
        assert_eq!(usize::from(a.is_ok()) + usize::from(b.is_ok()), 1);
    }

    #[tokio::test]
    async fn expired_code_is_rejected() {
        let (store, login) = service();
        let start = login.initiate_cli("http://127.0.0.1:1/cb").unwrap();
        let LoginOutcome::CliExchangePending { user_id, .. } = login
            .complete(Some(&start.pending), &start.pending.state, "good-code")
            .await
            .unwrap()
        else {
            unreachable!("cli flow");
        };

        let now = Utc::now();
        store
            .insert_exchange_code(&LoginExchangeCode {
                id: Uuid::new_v4(),
                code_hash: hash_token("stale"),
                user_id,
                expires_at: now - Duration::seconds(1),
                used_at: None,
                created_at: now - Duration::seconds(EXCHANGE_CODE_TTL_SECS),
            })
            .await
            .unwrap();
        assert!(matches!(
            login.exchange("stale").await,
            Err(CoreError::Authentication(_))
        ));
    }
}

//! Google as the OAuth 2.0 identity provider.
//!
//! Authorization code flow against Google's endpoints: the code is traded
//! for an access token, which is then used once to fetch the user profile.

use async_trait::async_trait;
use envo_core::CoreError;
use envo_core::login::{IdentityProvider, ProviderProfile};
use serde::Deserialize;
use tracing::warn;

use crate::config::GoogleConfig;

const AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";
const SCOPES: &str = "https://www.googleapis.com/auth/userinfo.email https://www.googleapis.com/auth/userinfo.profile";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    id: String,
    email: String,
    #[serde(default)]
    verified_email: bool,
    #[serde(default)]
    name: Option<String>,
}

/// Google identity provider.
pub struct GoogleProvider {
    config: GoogleConfig,
    http: reqwest::Client,
}

impl GoogleProvider {
    #[must_use]
    pub fn new(config: GoogleConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl IdentityProvider for GoogleProvider {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "google"
    }

    fn authorize_url(&self, state: &str) -> String {
        format!(
            "{AUTHORIZE_URL}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}&access_type=offline",
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&self.config.redirect_url),
            urlencoding::encode(SCOPES),
            urlencoding::encode(state),
        )
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderProfile, CoreError> {
        let token_res = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.config.redirect_url.as_str()),
            ])
            .send()
            .await
            .map_err(|e| CoreError::Internal(format!("google token exchange failed: {e}")))?;

        if !token_res.status().is_success() {
            let status = token_res.status();
            warn!(status = %status, "google rejected the authorization code");
            return Err(CoreError::Authentication("authorization code rejected".to_owned()));
        }

        let token: TokenResponse = token_res
            .json()
            .await
            .map_err(|e| CoreError::Internal(format!("invalid google token response: {e}")))?;

        let info: UserInfo = self
            .http
            .get(USERINFO_URL)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| CoreError::Internal(format!("google userinfo request failed: {e}")))?
            .json()
            .await
            .map_err(|e| CoreError::Internal(format!("invalid google userinfo: {e}")))?;

        if !info.verified_email {
            return Err(CoreError::Authentication("google account email not verified".to_owned()));
        }

        Ok(ProviderProfile {
            external_id: info.id,
            name: info.name.unwrap_or_else(|| info.email.clone()),
            email: info.email,
        })
    }
}

impl std::fmt::Debug for GoogleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleProvider")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

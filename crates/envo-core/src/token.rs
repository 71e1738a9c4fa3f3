//! JWT access and refresh tokens.
//!
//! Both token kinds are HS256-signed with the same secret and carry a `typ`
//! claim so one can never be accepted as the other.
//!
//! Access tokens embed a snapshot of the holder's effective permissions at
//! issuance. The snapshot is informational: authorization decisions re-read
//! live role data through the [`PermissionResolver`], so the snapshot can be
//! up to one access TTL stale without widening access.
//!
//! Refresh tokens are non-rotating. Each one has a server-side record keyed
//! by its SHA-256 hash; presenting it yields a new access token and leaves
//! it usable until it expires or is revoked at logout.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use envo_storage::Store;
use envo_storage::models::{RefreshTokenRecord, User};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::crypto::hash_token;
use crate::error::CoreError;
use crate::rbac::PermissionResolver;

/// Minimum signing secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

const ACCESS_TYP: &str = "access";
const REFRESH_TYP: &str = "refresh";

/// Claims of an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: Uuid,
    pub email: String,
    pub permissions: Vec<String>,
    pub exp: i64,
    pub iat: i64,
    pub nbf: i64,
    pub jti: Uuid,
    pub typ: String,
}

/// Claims of a refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: Uuid,
    pub jti: Uuid,
    pub exp: i64,
    pub iat: i64,
    pub typ: String,
}

/// Tokens handed to a client.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: &'static str,
    pub expires_in: i64,
}

/// Issues, validates, refreshes and revokes tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    store: Arc<dyn Store>,
    resolver: PermissionResolver,
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenIssuer {
    /// # Errors
    ///
    /// Returns [`CoreError::Internal`] if `secret` is shorter than
    /// [`MIN_SECRET_LEN`] bytes.
    pub fn new(
        store: Arc<dyn Store>,
        resolver: PermissionResolver,
        secret: &[u8],
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Result<Self, CoreError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(CoreError::Internal(format!(
                "JWT secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        Ok(Self {
            store,
            resolver,
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            access_ttl,
            refresh_ttl,
        })
    }

    /// Access token lifetime in seconds, as reported in `expires_in`.
    #[must_use]
    pub fn access_ttl_secs(&self) -> i64 {
        self.access_ttl.num_seconds()
    }

    /// Sign an access token carrying the user's current permissions.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Internal`] if signing fails.
    pub async fn issue_access_token(&self, user: &User) -> Result<String, CoreError> {
        let permissions = self
            .resolver
            .effective_permissions(user.id)
            .await?
            .into_iter()
            .map(|p| p.as_str().to_owned())
            .collect();

        let now = Utc::now();
        let claims = AccessClaims {
            sub: user.id,
            email: user.email.clone(),
            permissions,
            exp: (now + self.access_ttl).timestamp(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            jti: Uuid::new_v4(),
            typ: ACCESS_TYP.to_owned(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| CoreError::Internal(format!("failed to sign access token: {e}")))
    }

    /// Sign a refresh token and persist its hash.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Internal`] if signing fails, or a storage error.
    pub async fn issue_refresh_token(&self, user_id: Uuid) -> Result<(String, DateTime<Utc>), CoreError> {
        let now = Utc::now();
        let expires_at = now + self.refresh_ttl;
        let jti = Uuid::new_v4();
        let claims = RefreshClaims {
            sub: user_id,
            jti,
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            typ: REFRESH_TYP.to_owned(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| CoreError::Internal(format!("failed to sign refresh token: {e}")))?;

        self.store
            .insert_refresh_token(&RefreshTokenRecord {
                id: jti,
                user_id,
                token_hash: hash_token(&token),
                expires_at,
                revoked: false,
                created_at: now,
            })
            .await?;
        Ok((token, expires_at))
    }

    /// Access plus refresh token for a freshly authenticated user.
    ///
    /// # Errors
    ///
    /// See [`Self::issue_access_token`] and [`Self::issue_refresh_token`].
    pub async fn issue_pair(&self, user: &User) -> Result<TokenPair, CoreError> {
        let access_token = self.issue_access_token(user).await?;
        let (refresh_token, _) = self.issue_refresh_token(user.id).await?;
        info!(user_id = %user.id, "issued token pair");
        Ok(TokenPair {
            access_token,
            refresh_token: Some(refresh_token),
            token_type: "Bearer",
            expires_in: self.access_ttl_secs(),
        })
    }

    /// Verify signature, algorithm, expiry and token type.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Authentication`] for any invalid token.
    pub fn validate_access_token(&self, token: &str) -> Result<AccessClaims, CoreError> {
        let mut validation = strict_validation();
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "nbf", "sub"]);

        let claims = decode::<AccessClaims>(token, &self.decoding, &validation)
            .map_err(|e| {
                debug!(error = %e, "access token rejected");
                CoreError::Authentication("invalid or expired access token".to_owned())
            })?
            .claims;
        if claims.typ != ACCESS_TYP {
            return Err(CoreError::Authentication("not an access token".to_owned()));
        }
        Ok(claims)
    }

    /// Exchange a refresh token for a new access token.
    ///
    /// The refresh token stays valid; the returned pair has no refresh token.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Authentication`] if the token is invalid,
    /// unknown, revoked, expired, or its user no longer exists.
    pub async fn rotate(&self, refresh_token: &str) -> Result<TokenPair, CoreError> {
        let claims = self.validate_refresh_token(refresh_token)?;
        let record = self
            .store
            .find_refresh_token(&hash_token(refresh_token))
            .await?
            .ok_or_else(invalid_refresh)?;

        if record.revoked || record.expires_at <= Utc::now() || record.user_id != claims.sub {
            return Err(invalid_refresh());
        }

        let user = self
            .store
            .get_user(record.user_id)
            .await?
            .ok_or_else(invalid_refresh)?;

        Ok(TokenPair {
            access_token: self.issue_access_token(&user).await?,
            refresh_token: None,
            token_type: "Bearer",
            expires_in: self.access_ttl_secs(),
        })
    }

    /// Revoke a refresh token. Unknown tokens are ignored.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the update fails.
    pub async fn revoke(&self, refresh_token: &str) -> Result<(), CoreError> {
        let token_hash = hash_token(refresh_token);
        let revoked = self.store.revoke_refresh_token(&token_hash).await?;
        debug!(
            token = %token_hash.get(..8).unwrap_or_default(),
            revoked,
            "refresh token revocation"
        );
        Ok(())
    }

    fn validate_refresh_token(&self, token: &str) -> Result<RefreshClaims, CoreError> {
        let mut validation = strict_validation();
        validation.set_required_spec_claims(&["exp", "sub"]);
        let claims = decode::<RefreshClaims>(token, &self.decoding, &validation)
            .map_err(|_| invalid_refresh())?
            .claims;
        if claims.typ != REFRESH_TYP {
            return Err(invalid_refresh());
        }
        Ok(claims)
    }
}

fn strict_validation() -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation
}

fn invalid_refresh() -> CoreError {
    CoreError::Authentication("invalid or expired refresh token".to_owned())
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

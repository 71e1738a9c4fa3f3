//! Server configuration for Envo.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Only `JWT_SECRET` is required.

use std::net::SocketAddr;
use std::path::PathBuf;

use envo_core::crypto::envelope::DecryptFailureMode;
use envo_core::token::MIN_SECRET_LEN;

const DEFAULT_ACCESS_TTL_SECS: i64 = 900;
const DEFAULT_REFRESH_TTL_SECS: i64 = 30 * 24 * 3600;
const DEFAULT_FRONTEND_URL: &str = "http://localhost:3000";

/// Startup configuration errors. All of them are fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is required")]
    Missing { var: &'static str },

    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
    /// `PostgreSQL` URL. `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// HMAC key for access and refresh tokens.
    pub jwt_secret: String,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    /// Key material for the local encryption backend.
    pub local_encryption_secret: String,
    /// Managed key id. `None` means local encryption only.
    pub kms_key_id: Option<String>,
    /// Google OAuth client. `None` disables login.
    pub google: Option<GoogleConfig>,
    pub frontend_url: String,
    /// What a bulk export does with values it cannot decrypt.
    pub export_mode: DecryptFailureMode,
    /// Optional JSON-lines audit mirror.
    pub audit_file: Option<PathBuf>,
    /// `Secure` attribute on login cookies.
    pub cookie_secure: bool,
}

/// Google OAuth 2.0 client registration.
#[derive(Clone)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
}

impl ServerConfig {
    /// Load configuration from the process environment.
    ///
    /// Environment variables:
    /// - `ENVO_BIND_ADDR`: full bind address (default: `127.0.0.1:8080`)
    /// - `PORT`: port to bind on `0.0.0.0` when `ENVO_BIND_ADDR` is unset
    /// - `ENVO_LOG_LEVEL`: log filter (default: `info`)
    /// - `DATABASE_URL`: `PostgreSQL` connection string (optional)
    /// - `JWT_SECRET`: token signing key, at least 32 bytes (required)
    /// - `JWT_ACCESS_TOKEN_TTL_SECS` / `JWT_REFRESH_TOKEN_TTL_SECS`
    /// - `ENVO_LOCAL_ENCRYPTION_SECRET`: local key material (default: `JWT_SECRET`)
    /// - `AWS_KMS_KEY_ID`: managed encryption key (optional)
    /// - `GOOGLE_CLIENT_ID`, `GOOGLE_CLIENT_SECRET`, `GOOGLE_REDIRECT_URL`
    /// - `FRONTEND_URL`: web login target (default: `http://localhost:3000`)
    /// - `ENVO_EXPORT_ON_DECRYPT_FAILURE`: `skip` or `fail` (default: `skip`)
    /// - `ENVO_AUDIT_FILE`: audit mirror path (optional)
    /// - `ENVO_COOKIE_SECURE`: default `true`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `JWT_SECRET` is missing or too short, or
    /// a value cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`ServerConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        // Priority: ENVO_BIND_ADDR > PORT > default 127.0.0.1:8080
        let bind_addr = if let Some(addr) = var("ENVO_BIND_ADDR") {
            addr.parse().map_err(|e| ConfigError::Invalid {
                var: "ENVO_BIND_ADDR",
                reason: format!("{e}"),
            })?
        } else if let Some(port) = var("PORT") {
            let port: u16 = port.parse().map_err(|e| ConfigError::Invalid {
                var: "PORT",
                reason: format!("{e}"),
            })?;
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            SocketAddr::from(([127, 0, 0, 1], 8080))
        };

        let jwt_secret = var("JWT_SECRET").ok_or(ConfigError::Missing { var: "JWT_SECRET" })?;
        if jwt_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::Invalid {
                var: "JWT_SECRET",
                reason: format!("must be at least {MIN_SECRET_LEN} bytes"),
            });
        }

        let access_ttl_secs = parse_ttl(var("JWT_ACCESS_TOKEN_TTL_SECS"), "JWT_ACCESS_TOKEN_TTL_SECS", DEFAULT_ACCESS_TTL_SECS)?;
        let refresh_ttl_secs = parse_ttl(var("JWT_REFRESH_TOKEN_TTL_SECS"), "JWT_REFRESH_TOKEN_TTL_SECS", DEFAULT_REFRESH_TTL_SECS)?;

        let export_mode = match var("ENVO_EXPORT_ON_DECRYPT_FAILURE") {
            Some(mode) => mode.parse().map_err(|e: String| ConfigError::Invalid {
                var: "ENVO_EXPORT_ON_DECRYPT_FAILURE",
                reason: e,
            })?,
            None => DecryptFailureMode::default(),
        };

        let google = match (var("GOOGLE_CLIENT_ID"), var("GOOGLE_CLIENT_SECRET"), var("GOOGLE_REDIRECT_URL")) {
            (Some(client_id), Some(client_secret), Some(redirect_url)) => Some(GoogleConfig {
                client_id,
                client_secret,
                redirect_url,
            }),
            _ => None,
        };

        Ok(Self {
            bind_addr,
            log_level: var("ENVO_LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
            database_url: var("DATABASE_URL"),
            local_encryption_secret: var("ENVO_LOCAL_ENCRYPTION_SECRET").unwrap_or_else(|| jwt_secret.clone()),
            jwt_secret,
            access_ttl_secs,
            refresh_ttl_secs,
            kms_key_id: var("AWS_KMS_KEY_ID"),
            google,
            frontend_url: var("FRONTEND_URL").unwrap_or_else(|| DEFAULT_FRONTEND_URL.to_owned()),
            export_mode,
            audit_file: var("ENVO_AUDIT_FILE").map(PathBuf::from),
            cookie_secure: var("ENVO_COOKIE_SECURE").is_none_or(|v| v != "false" && v != "0"),
        })
    }
}

fn parse_ttl(raw: Option<String>, var: &'static str, default: i64) -> Result<i64, ConfigError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.parse::<i64>() {
        Ok(secs) if secs > 0 => Ok(secs),
        _ => Err(ConfigError::Invalid {
            var,
            reason: "must be a positive number of seconds".to_owned(),
        }),
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("log_level", &self.log_level)
            .field("database", &self.database_url.as_ref().map(|_| "[redacted]"))
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .field("kms_key_id", &self.kms_key_id)
            .field("google_login", &self.google.is_some())
            .field("frontend_url", &self.frontend_url)
            .field("export_mode", &self.export_mode)
            .field("audit_file", &self.audit_file)
            .field("cookie_secure", &self.cookie_secure)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for GoogleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleConfig")
            .field("client_id", &self.client_id)
            .field("redirect_url", &self.redirect_url)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
        ServerConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[("JWT_SECRET", SECRET)]).unwrap();
        assert_eq!(config.bind_addr, SocketAddr::from(([127, 0, 0, 1], 8080)));
        assert_eq!(config.access_ttl_secs, 900);
        assert_eq!(config.refresh_ttl_secs, 2_592_000);
        assert_eq!(config.local_encryption_secret, SECRET);
        assert_eq!(config.frontend_url, "http://localhost:3000");
        assert_eq!(config.export_mode, DecryptFailureMode::SkipAndLog);
        assert!(config.database_url.is_none());
        assert!(config.google.is_none());
        assert!(config.cookie_secure);
    }

    #[test]
    fn jwt_secret_is_required_and_long() {
        assert!(matches!(load(&[]), Err(ConfigError::Missing { var: "JWT_SECRET" })));
        assert!(matches!(
            load(&[("JWT_SECRET", "short")]),
            Err(ConfigError::Invalid { var: "JWT_SECRET", .. })
        ));
    }

    #[test]
    fn port_binds_all_interfaces() {
        let config = load(&[("JWT_SECRET", SECRET), ("PORT", "9000")]).unwrap();
        assert_eq!(config.bind_addr, SocketAddr::from(([0, 0, 0, 0], 9000)));

        let config = load(&[("JWT_SECRET", SECRET), ("PORT", "9000"), ("ENVO_BIND_ADDR", "10.0.0.1:7000")]).unwrap();
        assert_eq!(config.bind_addr.port(), 7000);
    }

    #[test]
    fn google_needs_all_three_values() {
        let partial = load(&[("JWT_SECRET", SECRET), ("GOOGLE_CLIENT_ID", "id")]).unwrap();
        assert!(partial.google.is_none());

        let full = load(&[
            ("JWT_SECRET", SECRET),
            ("GOOGLE_CLIENT_ID", "id"),
            ("GOOGLE_CLIENT_SECRET", "shh"),
            ("GOOGLE_REDIRECT_URL", "http://localhost:8080/api/v1/auth/google/callback"),
        ])
        .unwrap();
        assert!(full.google.is_some());
        assert!(!format!("{full:?}").contains("shh"));
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(load(&[("JWT_SECRET", SECRET), ("JWT_ACCESS_TOKEN_TTL_SECS", "0")]).is_err());
        assert!(load(&[("JWT_SECRET", SECRET), ("ENVO_EXPORT_ON_DECRYPT_FAILURE", "maybe")]).is_err());
        let strict = load(&[("JWT_SECRET", SECRET), ("ENVO_EXPORT_ON_DECRYPT_FAILURE", "fail")]).unwrap();
        assert_eq!(strict.export_mode, DecryptFailureMode::FailFast);
        let insecure = load(&[("JWT_SECRET", SECRET), ("ENVO_COOKIE_SECURE", "false")]).unwrap();
        assert!(!insecure.cookie_secure);
    }
}

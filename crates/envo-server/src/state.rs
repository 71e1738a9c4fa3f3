//! Shared application state for the Envo server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`. It owns the store handle and every core service
//! built on top of it.

use std::sync::Arc;

use envo_core::CoreError;
use envo_core::audit::{AuditBackend, AuditLogger};
use envo_core::audit_file::FileAuditBackend;
use envo_core::crypto::DataKey;
use envo_core::crypto::envelope::EnvelopeCipher;
use envo_core::crypto::kms::KeyManagement;
use envo_core::login::{IdentityProvider, LoginService};
use envo_core::quota::QuotaEnforcer;
use envo_core::rbac::PermissionResolver;
use envo_core::secrets::SecretService;
use envo_core::seed::seed_defaults;
use envo_core::tenancy::TenancyService;
use envo_core::token::TokenIssuer;
use envo_storage::Store;
use tracing::info;

use crate::config::ServerConfig;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub resolver: PermissionResolver,
    pub quota: QuotaEnforcer,
    pub tokens: TokenIssuer,
    /// `None` when no identity provider is configured.
    pub login: Option<LoginService>,
    pub tenancy: TenancyService,
    pub secrets: SecretService,
    pub audit: AuditLogger,
    pub cipher: EnvelopeCipher,
    /// `Secure` attribute on login cookies.
    pub cookie_secure: bool,
}

impl AppState {
    /// Seed the store and wire every service together.
    ///
    /// # Errors
    ///
    /// Returns an error if seeding fails or the token secret is too short.
    pub async fn build(
        config: &ServerConfig,
        store: Arc<dyn Store>,
        provider: Option<Arc<dyn IdentityProvider>>,
        managed_keys: Option<Arc<dyn KeyManagement>>,
    ) -> Result<Arc<Self>, CoreError> {
        seed_defaults(store.as_ref()).await?;

        let resolver = PermissionResolver::new(Arc::clone(&store));
        let quota = QuotaEnforcer::new(Arc::clone(&store));

        let mut mirrors: Vec<Arc<dyn AuditBackend>> = Vec::new();
        if let Some(path) = &config.audit_file {
            mirrors.push(Arc::new(FileAuditBackend::new(path)));
            info!(path = %path.display(), "file audit backend registered");
        }
        let audit = AuditLogger::with_mirrors(Arc::clone(&store), mirrors);

        let cipher = EnvelopeCipher::new(
            managed_keys,
            Some(DataKey::from_secret(&config.local_encryption_secret)),
        )?;
        info!(primary = cipher.primary().as_str(), "encryption ready");

        let tokens = TokenIssuer::new(
            Arc::clone(&store),
            resolver.clone(),
            config.jwt_secret.as_bytes(),
            chrono::Duration::seconds(config.access_ttl_secs),
            chrono::Duration::seconds(config.refresh_ttl_secs),
        )?;

        let login = provider.map(|provider| {
            LoginService::new(Arc::clone(&store), provider, tokens.clone(), &config.frontend_url)
        });
        if login.is_none() {
            info!("no identity provider configured, login routes disabled");
        }

        let tenancy = TenancyService::new(Arc::clone(&store), resolver.clone(), quota.clone(), audit.clone());
        let secrets = SecretService::new(
            Arc::clone(&store),
            resolver.clone(),
            quota.clone(),
            cipher.clone(),
            audit.clone(),
            config.export_mode,
        );

        Ok(Arc::new(Self {
            store,
            resolver,
            quota,
            tokens,
            login,
            tenancy,
            secrets,
            audit,
            cipher,
            cookie_secure: config.cookie_secure,
        }))
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

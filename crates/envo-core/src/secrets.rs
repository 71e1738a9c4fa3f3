//! Secret storage on top of the envelope cipher.
//!
//! Values are encrypted before they reach the store and decrypted only on
//! an explicit reveal or export. A single reveal fails if the value cannot
//! be decrypted; a bulk export follows the configured
//! [`DecryptFailureMode`].

use std::collections::BTreeMap;
use std::sync::Arc;

use envo_storage::Store;
use envo_storage::models::{EnvironmentScope, NewSecret, Secret};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLogger, action};
use crate::crypto::envelope::{DecryptFailureMode, EnvelopeCipher, SealedValue};
use crate::error::CoreError;
use crate::quota::{QuotaEnforcer, ResourceKind};
use crate::rbac::{Permission, PermissionResolver};

pub const MAX_KEY_LEN: usize = 256;
pub const MAX_VALUE_BYTES: usize = 1024 * 1024;

/// A secret together with its plaintext value.
#[derive(Debug, Clone, Serialize)]
pub struct RevealedSecret {
    #[serde(flatten)]
    pub secret: Secret,
    pub value: String,
}

/// Decrypted contents of an environment.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportedSecrets {
    pub secrets: BTreeMap<String, String>,
    /// Keys whose values could not be decrypted.
    pub skipped: Vec<String>,
}

/// Secret CRUD and export.
#[derive(Clone)]
pub struct SecretService {
    store: Arc<dyn Store>,
    resolver: PermissionResolver,
    quota: QuotaEnforcer,
    cipher: EnvelopeCipher,
    audit: AuditLogger,
    export_mode: DecryptFailureMode,
}

impl SecretService {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        resolver: PermissionResolver,
        quota: QuotaEnforcer,
        cipher: EnvelopeCipher,
        audit: AuditLogger,
        export_mode: DecryptFailureMode,
    ) -> Self {
        Self {
            store,
            resolver,
            quota,
            cipher,
            audit,
            export_mode,
        }
    }

    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] for a bad key or oversized value,
    /// [`CoreError::QuotaExceeded`] at the per-environment limit,
    /// [`CoreError::Conflict`] if the key exists.
    pub async fn create(
        &self,
        actor: Uuid,
        environment_id: Uuid,
        key: &str,
        value: &str,
        ip: &str,
    ) -> Result<Secret, CoreError> {
        validate_key(key)?;
        validate_value(value)?;
        let scope = self
            .authorize_env(actor, environment_id, Permission::SecretsCreate)
            .await?;
        self.quota.ensure_can_create(ResourceKind::Secret, environment_id).await?;

        let (encrypted_value, key_method) = self.cipher.encrypt(value).await?;
        let secret = self
            .store
            .insert_secret(&NewSecret {
                environment_id,
                key: key.to_owned(),
                encrypted_value,
                key_method,
                created_by: actor,
            })
            .await?;

        self.record(actor, &scope, action::SECRET_CREATE, &secret, ip).await;
        Ok(secret)
    }

    /// Secret metadata of an environment, ordered by key. No values.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Authorization`] without `secrets.read`.
    pub async fn list(&self, actor: Uuid, environment_id: Uuid) -> Result<Vec<Secret>, CoreError> {
        self.authorize_env(actor, environment_id, Permission::SecretsRead)
            .await?;
        Ok(self.store.list_secrets(environment_id).await?)
    }

    /// Decrypt one secret.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Encryption`] if no backend can decrypt it.
    pub async fn reveal(&self, actor: Uuid, secret_id: Uuid, ip: &str) -> Result<RevealedSecret, CoreError> {
        let secret = self.secret(secret_id).await?;
        let scope = self
            .authorize_env(actor, secret.environment_id, Permission::SecretsRead)
            .await?;

        let value = self
            .cipher
            .decrypt(&secret.encrypted_value, &secret.key_method)
            .await?;

        self.record(actor, &scope, action::SECRET_READ, &secret, ip).await;
        Ok(RevealedSecret { secret, value })
    }

    /// Rename and/or re-encrypt a secret. A new value is sealed with the
    /// primary backend.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] if neither field is given.
    pub async fn update(
        &self,
        actor: Uuid,
        secret_id: Uuid,
        new_key: Option<&str>,
        new_value: Option<&str>,
        ip: &str,
    ) -> Result<Secret, CoreError> {
        if new_key.is_none() && new_value.is_none() {
            return Err(CoreError::Validation("nothing to update".to_owned()));
        }
        if let Some(key) = new_key {
            validate_key(key)?;
        }
        if let Some(value) = new_value {
            validate_value(value)?;
        }

        let secret = self.secret(secret_id).await?;
        let scope = self
            .authorize_env(actor, secret.environment_id, Permission::SecretsUpdate)
            .await?;

        let (encrypted_value, key_method) = match new_value {
            Some(value) => self.cipher.encrypt(value).await?,
            None => (secret.encrypted_value.clone(), secret.key_method.clone()),
        };
        let key = new_key.unwrap_or(&secret.key);
        let updated = self
            .store
            .update_secret(secret.id, key, &encrypted_value, &key_method)
            .await?;

        self.audit
            .record(
                AuditEvent::new(actor, Some(scope.org_id), action::SECRET_UPDATE, "secret", updated.id, ip)
                    .with_metadata(json!({
                        "key": updated.key,
                        "previous_key": secret.key,
                        "value_changed": new_value.is_some(),
                    })),
            )
            .await;
        Ok(updated)
    }

    /// Soft-delete a secret.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if it is already gone.
    pub async fn delete(&self, actor: Uuid, secret_id: Uuid, ip: &str) -> Result<(), CoreError> {
        let secret = self.secret(secret_id).await?;
        let scope = self
            .authorize_env(actor, secret.environment_id, Permission::SecretsDelete)
            .await?;

        if !self.store.soft_delete_secret(secret.id).await? {
            return Err(CoreError::NotFound(format!("secret {secret_id}")));
        }
        self.record(actor, &scope, action::SECRET_DELETE, &secret, ip).await;
        Ok(())
    }

    /// Decrypt every live secret of an environment.
    ///
    /// # Errors
    ///
    /// In fail mode, returns [`CoreError::Encryption`] on the first value
    /// that cannot be decrypted.
    pub async fn export(&self, actor: Uuid, environment_id: Uuid, ip: &str) -> Result<ExportedSecrets, CoreError> {
        let scope = self
            .authorize_env(actor, environment_id, Permission::SecretsRead)
            .await?;
        let secrets = self.store.list_secrets(environment_id).await?;

        let sealed: Vec<SealedValue> = secrets
            .iter()
            .map(|s| SealedValue {
                id: s.id,
                ciphertext: s.encrypted_value.clone(),
                key_method: s.key_method.clone(),
            })
            .collect();
        let outcome = self.cipher.decrypt_many(&sealed, self.export_mode).await?;

        let key_of: BTreeMap<Uuid, &str> = secrets.iter().map(|s| (s.id, s.key.as_str())).collect();
        let mut exported = ExportedSecrets::default();
        for value in outcome.decrypted {
            if let Some(key) = key_of.get(&value.id) {
                exported.secrets.insert((*key).to_owned(), value.plaintext);
            }
        }
        exported.skipped = outcome
            .skipped
            .iter()
            .filter_map(|id| key_of.get(id).map(|k| (*k).to_owned()))
            .collect();

        self.audit
            .record(
                AuditEvent::new(actor, Some(scope.org_id), action::SECRET_READ, "environment", environment_id, ip)
                    .with_metadata(json!({
                        "export": true,
                        "count": exported.secrets.len(),
                        "skipped": exported.skipped.len(),
                    })),
            )
            .await;
        Ok(exported)
    }

    async fn secret(&self, secret_id: Uuid) -> Result<Secret, CoreError> {
        self.store
            .get_secret(secret_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("secret {secret_id}")))
    }

    async fn authorize_env(
        &self,
        actor: Uuid,
        environment_id: Uuid,
        permission: Permission,
    ) -> Result<EnvironmentScope, CoreError> {
        let scope = self
            .store
            .environment_scope(environment_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("environment {environment_id}")))?;
        self.resolver
            .require_org_permission(actor, scope.org_id, permission)
            .await?;
        Ok(scope)
    }

    async fn record(&self, actor: Uuid, scope: &EnvironmentScope, act: &'static str, secret: &Secret, ip: &str) {
        self.audit
            .record(
                AuditEvent::new(actor, Some(scope.org_id), act, "secret", secret.id, ip).with_metadata(json!({
                    "key": secret.key,
                    "environment_id": secret.environment_id,
                })),
            )
            .await;
    }
}

impl std::fmt::Debug for SecretService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretService")
            .field("cipher", &self.cipher)
            .field("export_mode", &self.export_mode)
            .finish_non_exhaustive()
    }
}

/// 1-256 characters from `[A-Za-z0-9_.-]`.
///
/// # Errors
///
/// Returns [`CoreError::Validation`] otherwise.
pub fn validate_key(key: &str) -> Result<(), CoreError> {
    let valid_chars = key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if key.is_empty() || key.len() > MAX_KEY_LEN || !valid_chars {
        return Err(CoreError::Validation(format!(
            "secret key must be 1-{MAX_KEY_LEN} characters of A-Z, a-z, 0-9, '_', '.', '-'"
        )));
    }
    Ok(())
}

fn validate_value(value: &str) -> Result<(), CoreError> {
    if value.len() > MAX_VALUE_BYTES {
        return Err(CoreError::Validation("secret value exceeds 1 MiB".to_owned()));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::DataKey;
    use crate::crypto::kms::{InMemoryKms, KeyManagement};
    use crate::seed::seed_defaults;
    use crate::tenancy::TenancyService;
    use envo_storage::MemoryStore;
    use envo_storage::models::NewUser;

    struct Fixture {
        store: Arc<dyn Store>,
        secrets: SecretService,
        tenancy: TenancyService,
        audit: AuditLogger,
        owner: Uuid,
        org_id: Uuid,
        env_id: Uuid,
    }

    async fn fixture_with(cipher: EnvelopeCipher, mode: DecryptFailureMode) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        seed_defaults(store.as_ref()).await.unwrap();
        let resolver = PermissionResolver::new(store.clone());
        let quota = QuotaEnforcer::new(store.clone());
        let audit = AuditLogger::new(store.clone());
        let tenancy = TenancyService::new(store.clone(), resolver.clone(), quota.clone(), audit.clone());
        let secrets = SecretService::new(store.clone(), resolver, quota, cipher, audit.clone(), mode);

        let owner = user(&store, "owner@example.com").await;
        let org = tenancy.create_organization(owner, "Acme", "").await.unwrap();
        let project = tenancy.create_project(owner, org.id, "api", "").await.unwrap();
        let env = tenancy.create_environment(owner, project.id, "dev", "").await.unwrap();
        Fixture {
            store,
            secrets,
            tenancy,
            audit,
            owner,
            org_id: org.id,
            env_id: env.id,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(
            EnvelopeCipher::local_only(DataKey::from_secret("secrets-tests")),
            DecryptFailureMode::SkipAndLog,
        )
        .await
    }

    async fn user(store: &Arc<dyn Store>, email: &str) -> Uuid {
        store
            .upsert_oauth_user(&NewUser {
                oauth_provider: "google".to_owned(),
                oauth_id: email.to_owned(),
                email: email.to_owned(),
                name: email.to_owned(),
            })
            .await
            .unwrap()
            .id
    }

    #[test]
    fn key_rules() {
        assert!(validate_key("DATABASE_URL").is_ok());
        assert!(validate_key("app.v2-token").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("HAS SPACE").is_err());
        assert!(validate_key("a=b").is_err());
        assert!(validate_key(&"K".repeat(257)).is_err());
        assert!(validate_value(&"v".repeat(MAX_VALUE_BYTES + 1)).is_err());
    }

    #[tokio::test]
    async fn create_reveal_roundtrip_never_stores_plaintext() {
        let f = fixture().await;
        let secret = f
            .secrets
            .create(f.owner, f.env_id, "API_KEY", "sk_live_123", "10.1.1.1")
            .await
            .unwrap();
        assert!(!secret.encrypted_value.contains("sk_live_123"));
        assert_eq!(secret.key_method, "local");

        let revealed = f.secrets.reveal(f.owner, secret.id, "10.1.1.1").await.unwrap();
        assert_eq!(revealed.value, "sk_live_123");

        let actions: Vec<String> = f
            .audit
            .list_org_logs(f.org_id, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["secret_read", "secret_create"]);
    }

    #[tokio::test]
    async fn duplicate_key_conflicts_until_deleted() {
        let f = fixture().await;
        let first = f.secrets.create(f.owner, f.env_id, "TOKEN", "a", "").await.unwrap();
        assert!(matches!(
            f.secrets.create(f.owner, f.env_id, "TOKEN", "b", "").await,
            Err(CoreError::Conflict(_))
        ));

        f.secrets.delete(f.owner, first.id, "").await.unwrap();
        assert!(matches!(
            f.secrets.reveal(f.owner, first.id, "").await,
            Err(CoreError::NotFound(_))
        ));
        assert!(f.secrets.create(f.owner, f.env_id, "TOKEN", "b", "").await.is_ok());
    }

    #[tokio::test]
    async fn update_renames_and_reencrypts() {
        let f = fixture().await;
        let secret = f.secrets.create(f.owner, f.env_id, "OLD", "v1", "").await.unwrap();

        let renamed = f.secrets.update(f.owner, secret.id, Some("NEW"), None, "").await.unwrap();
        assert_eq!(renamed.key, "NEW");
        assert_eq!(renamed.encrypted_value, secret.encrypted_value);

        let rewritten = f.secrets.update(f.owner, secret.id, None, Some("v2"), "").await.unwrap();
        assert_ne!(rewritten.encrypted_value, secret.encrypted_value);
        assert_eq!(f.secrets.reveal(f.owner, secret.id, "").await.unwrap().value, "v2");

        assert!(matches!(
            f.secrets.update(f.owner, secret.id, None, None, "").await,
            Err(CoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn listing_hides_values() {
        let f = fixture().await;
        f.secrets.create(f.owner, f.env_id, "B", "2", "").await.unwrap();
        f.secrets.create(f.owner, f.env_id, "A", "1", "").await.unwrap();

        let listed = f.secrets.list(f.owner, f.env_id).await.unwrap();
        let keys: Vec<&str> = listed.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["A", "B"]);
        let json = serde_json::to_string(&listed).unwrap();
        assert!(!json.contains("encrypted_value"));
    }

    #[tokio::test]
    async fn viewer_reads_but_cannot_write() {
        let f = fixture().await;
        let secret = f.secrets.create(f.owner, f.env_id, "K", "v", "").await.unwrap();
        let viewer = user(&f.store, "viewer@example.com").await;
        f.tenancy
            .add_member(f.owner, f.org_id, "viewer@example.com", "Viewer", "")
            .await
            .unwrap();

        assert!(f.secrets.reveal(viewer, secret.id, "").await.is_ok());
        assert!(matches!(
            f.secrets.create(viewer, f.env_id, "K2", "v", "").await,
            Err(CoreError::Authorization(_))
        ));
        assert!(matches!(
            f.secrets.delete(viewer, secret.id, "").await,
            Err(CoreError::Authorization(_))
        ));
    }

    #[tokio::test]
    async fn outsider_cannot_read() {
        let f = fixture().await;
        let secret = f.secrets.create(f.owner, f.env_id, "K", "v", "").await.unwrap();
        let outsider = user(&f.store, "out@example.com").await;
        assert!(matches!(
            f.secrets.reveal(outsider, secret.id, "").await,
            Err(CoreError::Authorization(_))
        ));
    }

    #[tokio::test]
    async fn export_skips_or_fails_on_unrecoverable_values() {
        let f = fixture().await;
        f.secrets.create(f.owner, f.env_id, "GOOD", "ok", "").await.unwrap();
        let (foreign, method) = EnvelopeCipher::local_only(DataKey::from_secret("other"))
            .encrypt("lost")
            .await
            .unwrap();
        let bad = f
            .store
            .insert_secret(&NewSecret {
                environment_id: f.env_id,
                key: "BAD".to_owned(),
                encrypted_value: foreign,
                key_method: method,
                created_by: f.owner,
            })
            .await
            .unwrap();

        let exported = f.secrets.export(f.owner, f.env_id, "").await.unwrap();
        assert_eq!(exported.secrets.get("GOOD").map(String::as_str), Some("ok"));
        assert_eq!(exported.skipped, vec!["BAD".to_owned()]);

        assert!(matches!(
            f.secrets.reveal(f.owner, bad.id, "").await,
            Err(CoreError::Encryption(_))
        ));

        let strict = SecretService {
            export_mode: DecryptFailureMode::FailFast,
            ..f.secrets.clone()
        };
        assert!(matches!(
            strict.export(f.owner, f.env_id, "").await,
            Err(CoreError::Encryption(_))
        ));
    }

    #[tokio::test]
    async fn managed_backend_records_key_id() {
        let kms: Arc<dyn KeyManagement> = Arc::new(InMemoryKms::new("alias/envo-test"));
        let cipher = EnvelopeCipher::new(Some(kms), Some(DataKey::from_secret("fallback"))).unwrap();
        let f = fixture_with(cipher, DecryptFailureMode::SkipAndLog).await;

        let secret = f.secrets.create(f.owner, f.env_id, "K", "managed", "").await.unwrap();
        assert_eq!(secret.key_method, "alias/envo-test");
        assert_eq!(f.secrets.reveal(f.owner, secret.id, "").await.unwrap().value, "managed");
    }
}

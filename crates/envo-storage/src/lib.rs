//! Persistence layer for Envo.
//!
//! This crate defines the [`Store`] trait: the relational operations the
//! access-control, encryption and audit core needs, and nothing more. It
//! knows nothing about permissions, quotas or ciphers. Values arrive here
//! already encrypted or hashed.
//!
//! Two implementations are provided:
//!
//! - [`MemoryStore`]: in-memory, for development and tests
//! - [`PostgresStore`]: production, backed by `PostgreSQL` (feature `postgres`)
//!
//! Both enforce the same unique constraints: `(oauth_provider, oauth_id)`
//! and `email` on users, `(org_id, user_id)` on memberships, live
//! `(environment_id, key)` on secrets, and the hash columns on refresh
//! tokens and exchange codes.

mod error;
mod memory;
pub mod models;
#[cfg(feature = "postgres")]
mod postgres;

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use error::StorageError;
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

use models::{
    AuditLogEntry, Environment, EnvironmentScope, LimitType, LoginExchangeCode, MemberDetail,
    NewSecret, NewUser, OrgMember, Organization, PermissionGrant, Project, RefreshTokenRecord,
    Role, Secret, Tier, User,
};

/// The relational store behind every core service.
///
/// Lookups return `Ok(None)` for missing rows; only writes that depend on a
/// missing row return [`StorageError::NotFound`]. Unique-constraint
/// violations surface as [`StorageError::Conflict`].
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    // ── Users ────────────────────────────────────────────────────────

    /// Find the user for `(oauth_provider, oauth_id)` or create it.
    ///
    /// An existing user keeps its tier; email and name are refreshed from
    /// the provider profile. The row is committed before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] if another identity already uses
    /// the email address.
    async fn upsert_oauth_user(&self, new_user: &NewUser) -> Result<User, StorageError>;

    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StorageError>;

    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StorageError>;

    /// Change a user's subscription tier.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the user does not exist.
    async fn set_user_tier(&self, user_id: Uuid, tier: Tier) -> Result<(), StorageError>;

    // ── Organizations ────────────────────────────────────────────────

    /// Insert an organization and its owner's membership in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Transaction`] if the transaction cannot be
    /// committed. Neither row exists in that case.
    async fn create_organization(
        &self,
        name: &str,
        owner_id: Uuid,
        owner_role_id: Uuid,
    ) -> Result<(Organization, OrgMember), StorageError>;

    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn get_organization(&self, org_id: Uuid) -> Result<Option<Organization>, StorageError>;

    /// Organizations the user is a member of, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn list_user_organizations(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Organization>, StorageError>;

    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn count_owned_organizations(&self, user_id: Uuid) -> Result<i64, StorageError>;

    // ── Roles ────────────────────────────────────────────────────────

    /// Create a role with an initial permission set.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] if a role with the same name
    /// already exists in the same scope.
    async fn create_role(
        &self,
        name: &str,
        org_id: Option<Uuid>,
        permissions: &[String],
    ) -> Result<Role, StorageError>;

    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn get_role(&self, role_id: Uuid) -> Result<Option<Role>, StorageError>;

    /// Find a role by name among the system roles and, when given, the
    /// custom roles of `org_id`. A system role wins over a custom role of
    /// the same name.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn find_role(&self, name: &str, org_id: Option<Uuid>)
    -> Result<Option<Role>, StorageError>;

    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<String>, StorageError>;

    /// Add a permission to a role. Granting a held permission is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the role does not exist.
    async fn grant_permission(&self, role_id: Uuid, permission: &str) -> Result<(), StorageError>;

    /// Remove a permission from a role. Returns `false` if it was not held.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn revoke_permission(&self, role_id: Uuid, permission: &str)
    -> Result<bool, StorageError>;

    // ── Members ──────────────────────────────────────────────────────

    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] if the user is already a member.
    async fn add_member(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        role_id: Uuid,
    ) -> Result<OrgMember, StorageError>;

    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn get_member(&self, member_id: Uuid) -> Result<Option<OrgMember>, StorageError>;

    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn find_membership(
        &self,
        org_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<OrgMember>, StorageError>;

    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn list_members(&self, org_id: Uuid) -> Result<Vec<MemberDetail>, StorageError>;

    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the membership does not exist.
    async fn update_member_role(
        &self,
        member_id: Uuid,
        role_id: Uuid,
    ) -> Result<OrgMember, StorageError>;

    /// Returns `false` if the membership did not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn remove_member(&self, member_id: Uuid) -> Result<bool, StorageError>;

    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn count_members(&self, org_id: Uuid) -> Result<i64, StorageError>;

    /// Every permission the user holds, across all of their memberships.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn permission_grants(&self, user_id: Uuid) -> Result<Vec<PermissionGrant>, StorageError>;

    // ── Projects and environments ────────────────────────────────────

    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the organization does not exist.
    async fn create_project(&self, org_id: Uuid, name: &str) -> Result<Project, StorageError>;

    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>, StorageError>;

    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn list_projects(&self, org_id: Uuid) -> Result<Vec<Project>, StorageError>;

    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn count_projects(&self, org_id: Uuid) -> Result<i64, StorageError>;

    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] if the project already has an
    /// environment with this name.
    async fn create_environment(
        &self,
        project_id: Uuid,
        name: &str,
    ) -> Result<Environment, StorageError>;

    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn list_environments(&self, project_id: Uuid) -> Result<Vec<Environment>, StorageError>;

    /// Resolve an environment to its project, organization and owner.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn environment_scope(
        &self,
        environment_id: Uuid,
    ) -> Result<Option<EnvironmentScope>, StorageError>;

    // ── Secrets ──────────────────────────────────────────────────────

    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] if a live secret with the same key
    /// exists in the environment.
    async fn insert_secret(&self, secret: &NewSecret) -> Result<Secret, StorageError>;

    /// Fetch a live (not soft-deleted) secret.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn get_secret(&self, secret_id: Uuid) -> Result<Option<Secret>, StorageError>;

    /// Live secrets of an environment, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn list_secrets(&self, environment_id: Uuid) -> Result<Vec<Secret>, StorageError>;

    /// Persist a new key, ciphertext and key method for a live secret.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the secret does not exist or
    /// was deleted, [`StorageError::Conflict`] if the new key collides.
    async fn update_secret(
        &self,
        secret_id: Uuid,
        key: &str,
        encrypted_value: &str,
        key_method: &str,
    ) -> Result<Secret, StorageError>;

    /// Mark a secret deleted. Returns `false` if it was not live.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn soft_delete_secret(&self, secret_id: Uuid) -> Result<bool, StorageError>;

    /// Number of live secrets in an environment.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn count_secrets(&self, environment_id: Uuid) -> Result<i64, StorageError>;

    // ── Audit ────────────────────────────────────────────────────────

    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), StorageError>;

    /// Most recent entries for an organization, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn list_org_audit(
        &self,
        org_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AuditLogEntry>, StorageError>;

    // ── Tier limits ──────────────────────────────────────────────────

    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn tier_limit(&self, tier: Tier, limit_type: LimitType)
    -> Result<Option<i64>, StorageError>;

    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn upsert_tier_limit(
        &self,
        tier: Tier,
        limit_type: LimitType,
        value: i64,
    ) -> Result<(), StorageError>;

    // ── Refresh tokens ───────────────────────────────────────────────

    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] if the hash is already stored.
    async fn insert_refresh_token(&self, record: &RefreshTokenRecord) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StorageError>;

    /// Revoke a refresh token. Revocation is permanent. Returns `false` if
    /// no token has this hash.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn revoke_refresh_token(&self, token_hash: &str) -> Result<bool, StorageError>;

    // ── Login exchange codes ─────────────────────────────────────────

    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] if the hash is already stored.
    async fn insert_exchange_code(&self, code: &LoginExchangeCode) -> Result<(), StorageError>;

    /// Atomically mark a code used if it is unused and unexpired at `now`.
    ///
    /// Returns the bound user, or `None` if the code is unknown, expired, or
    /// another caller consumed it first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] if the backend fails.
    async fn consume_exchange_code(
        &self,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, StorageError>;
}

//! Persisted records.
//!
//! Plain data types shared by every [`Store`](crate::Store) implementation.
//! All IDs are UUIDs. Secret values only ever appear here as ciphertext
//! strings; raw refresh tokens and exchange codes only as SHA-256 hashes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tier limit value meaning "no limit".
pub const UNLIMITED: i64 = -1;

// ── Users ────────────────────────────────────────────────────────────

/// Subscription tier of a user. Quotas are resolved from this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres", sqlx(type_name = "text", rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Starter,
    Team,
}

impl Tier {
    /// Every tier, in upgrade order.
    pub const ALL: [Self; 3] = [Self::Free, Self::Starter, Self::Team];

    /// The lowercase name used in storage and on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Starter => "starter",
            Self::Team => "team",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "starter" => Ok(Self::Starter),
            "team" => Ok(Self::Team),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// Billing state of a user's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres", sqlx(type_name = "text", rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Expired,
}

/// A user, created on the first successful login for a provider identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub oauth_provider: String,
    pub oauth_id: String,
    pub tier: Tier,
    pub subscription_status: SubscriptionStatus,
    pub payment_customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Identity returned by an identity provider, used to find or create a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub oauth_provider: String,
    pub oauth_id: String,
    pub email: String,
    pub name: String,
}

// ── Organizations and roles ──────────────────────────────────────────

/// An organization (tenant). Its owner's tier governs every nested quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A named permission set. `org_id` is `None` for system roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub org_id: Option<Uuid>,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
}

/// One user's membership (and role) in one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct OrgMember {
    pub id: Uuid,
    pub org_id: Uuid,
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A membership joined with its user and role, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct MemberDetail {
    pub id: Uuid,
    pub org_id: Uuid,
    pub user_id: Uuid,
    pub email: String,
    pub name: String,
    pub role_id: Uuid,
    pub role_name: String,
    pub created_at: DateTime<Utc>,
}

/// A permission a user holds through one of their memberships.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct PermissionGrant {
    pub org_id: Uuid,
    pub role_name: String,
    pub permission: String,
}

// ── Projects and environments ────────────────────────────────────────

/// A project within an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct Project {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// An environment within a project (development, staging, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct Environment {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Where an environment sits in the tenancy tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct EnvironmentScope {
    pub environment_id: Uuid,
    pub project_id: Uuid,
    pub org_id: Uuid,
    pub owner_id: Uuid,
}

// ── Secrets ──────────────────────────────────────────────────────────

/// A stored secret. `encrypted_value` is the serialized ciphertext and
/// `key_method` names the encryption backend that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct Secret {
    pub id: Uuid,
    pub environment_id: Uuid,
    pub key: String,
    #[serde(skip)]
    pub encrypted_value: String,
    pub key_method: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Fields needed to insert a secret.
#[derive(Debug, Clone)]
pub struct NewSecret {
    pub environment_id: Uuid,
    pub key: String,
    pub encrypted_value: String,
    pub key_method: String,
    pub created_by: Uuid,
}

// ── Audit ────────────────────────────────────────────────────────────

/// An immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub actor_id: Uuid,
    pub org_id: Option<Uuid>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Uuid,
    pub ip_address: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ── Credentials ──────────────────────────────────────────────────────

/// Server-side state of a refresh token. Only the hash is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

/// A one-time code handed to the CLI login callback.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct LoginExchangeCode {
    pub id: Uuid,
    pub code_hash: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl LoginExchangeCode {
    /// A code is usable until it expires or is consumed.
    #[must_use]
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.used_at.is_none() && now < self.expires_at
    }
}

// ── Tier limits ──────────────────────────────────────────────────────

/// The kinds of limit a tier can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres", sqlx(type_name = "text", rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    MaxDevs,
    MaxProjects,
    MaxOrgs,
    MaxSecretsPerEnv,
    ApiRateLimitPerHour,
    AuditRetentionDays,
}

impl LimitType {
    /// The snake-case name used in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MaxDevs => "max_devs",
            Self::MaxProjects => "max_projects",
            Self::MaxOrgs => "max_orgs",
            Self::MaxSecretsPerEnv => "max_secrets_per_env",
            Self::ApiRateLimitPerHour => "api_rate_limit_per_hour",
            Self::AuditRetentionDays => "audit_retention_days",
        }
    }
}

impl std::fmt::Display for LimitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parses_case_insensitively() {
        assert_eq!("Starter".parse::<Tier>(), Ok(Tier::Starter));
        assert!("enterprise".parse::<Tier>().is_err());
    }

    #[test]
    fn limit_type_serializes_snake_case() {
        let json = serde_json::to_string(&LimitType::MaxSecretsPerEnv).unwrap_or_default();
        assert_eq!(json, "\"max_secrets_per_env\"");
    }

    #[test]
    fn exchange_code_validity_window() {
        let now = Utc::now();
        let mut code = LoginExchangeCode {
            id: Uuid::new_v4(),
            code_hash: "h".to_owned(),
            user_id: Uuid::new_v4(),
            expires_at: now + chrono::Duration::minutes(2),
            used_at: None,
            created_at: now,
        };
        assert!(code.is_valid(now));
        assert!(!code.is_valid(now + chrono::Duration::minutes(3)));
        code.used_at = Some(now);
        assert!(!code.is_valid(now));
    }
}

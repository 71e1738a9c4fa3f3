//! Tier quotas.
//!
//! Organization creation is limited by the acting user's own tier. Projects,
//! members and secrets are limited by the tier of the owning organization's
//! owner. A limit of `-1` means unlimited; otherwise creation is allowed
//! while the live count is below the limit.
//!
//! Checks are not serialized against concurrent creators. Two requests can
//! both pass the check before either commits, leaving the scope one over
//! its limit until something is deleted.

use std::sync::Arc;

use envo_storage::Store;
use envo_storage::models::{LimitType, Tier, UNLIMITED};
use serde::Serialize;
use uuid::Uuid;

use crate::error::CoreError;

/// A quota-governed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Scope: the user creating the organization.
    Organization,
    /// Scope: the organization.
    Project,
    /// Scope: the organization.
    Member,
    /// Scope: the environment.
    Secret,
}

impl ResourceKind {
    #[must_use]
    pub const fn limit_type(self) -> LimitType {
        match self {
            Self::Organization => LimitType::MaxOrgs,
            Self::Project => LimitType::MaxProjects,
            Self::Member => LimitType::MaxDevs,
            Self::Secret => LimitType::MaxSecretsPerEnv,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Organization => "organizations",
            Self::Project => "projects",
            Self::Member => "members",
            Self::Secret => "secrets per environment",
        }
    }
}

/// The outcome of a quota lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCheck {
    pub tier: Tier,
    pub limit: i64,
    pub current: i64,
}

impl QuotaCheck {
    #[must_use]
    pub const fn allowed(&self) -> bool {
        self.limit == UNLIMITED || self.current < self.limit
    }
}

/// The creation limits of a tier, `-1` meaning unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierLimits {
    pub max_orgs: i64,
    pub max_projects: i64,
    pub max_devs: i64,
    pub max_secrets_per_env: i64,
}

/// Usage of one organization the user owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrgUsage {
    pub org_id: Uuid,
    pub name: String,
    pub projects: i64,
    pub members: i64,
}

/// A user's tier, its limits and current usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierInfo {
    pub tier: Tier,
    pub limits: TierLimits,
    pub owned_organizations: i64,
    pub organizations: Vec<OrgUsage>,
}

/// Evaluates tier limits against live counts.
#[derive(Clone)]
pub struct QuotaEnforcer {
    store: Arc<dyn Store>,
}

impl QuotaEnforcer {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Whether one more `kind` may be created in `scope_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if the scope does not exist and
    /// [`CoreError::Internal`] if the tier has no limit configured.
    pub async fn can_create(&self, kind: ResourceKind, scope_id: Uuid) -> Result<bool, CoreError> {
        Ok(self.check(kind, scope_id).await?.allowed())
    }

    /// Like [`Self::can_create`], but a blocked creation is an error.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::QuotaExceeded`] if the limit is reached.
    pub async fn ensure_can_create(&self, kind: ResourceKind, scope_id: Uuid) -> Result<(), CoreError> {
        let check = self.check(kind, scope_id).await?;
        if check.allowed() {
            Ok(())
        } else {
            Err(CoreError::QuotaExceeded {
                resource: kind.label(),
                limit: check.limit,
            })
        }
    }

    /// Resolve the governing tier, its limit and the live count.
    ///
    /// The count is skipped when the limit is unlimited.
    ///
    /// # Errors
    ///
    /// See [`Self::can_create`].
    pub async fn check(&self, kind: ResourceKind, scope_id: Uuid) -> Result<QuotaCheck, CoreError> {
        let tier = self.governing_tier(kind, scope_id).await?;
        let limit = self.limit(tier, kind.limit_type()).await?;
        if limit == UNLIMITED {
            return Ok(QuotaCheck {
                tier,
                limit,
                current: 0,
            });
        }

        let current = match kind {
            ResourceKind::Organization => self.store.count_owned_organizations(scope_id).await?,
            ResourceKind::Project => self.store.count_projects(scope_id).await?,
            ResourceKind::Member => self.store.count_members(scope_id).await?,
            ResourceKind::Secret => self.store.count_secrets(scope_id).await?,
        };
        Ok(QuotaCheck {
            tier,
            limit,
            current,
        })
    }

    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if the user does not exist.
    pub async fn tier_info(&self, user_id: Uuid) -> Result<TierInfo, CoreError> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| CoreError::NotFound("user".to_owned()))?;
        let tier = user.tier;

        let limits = TierLimits {
            max_orgs: self.limit(tier, LimitType::MaxOrgs).await?,
            max_projects: self.limit(tier, LimitType::MaxProjects).await?,
            max_devs: self.limit(tier, LimitType::MaxDevs).await?,
            max_secrets_per_env: self.limit(tier, LimitType::MaxSecretsPerEnv).await?,
        };

        let mut organizations = Vec::new();
        for org in self.store.list_user_organizations(user_id).await? {
            if org.owner_id != user_id {
                continue;
            }
            organizations.push(OrgUsage {
                org_id: org.id,
                projects: self.store.count_projects(org.id).await?,
                members: self.store.count_members(org.id).await?,
                name: org.name,
            });
        }

        Ok(TierInfo {
            tier,
            limits,
            owned_organizations: self.store.count_owned_organizations(user_id).await?,
            organizations,
        })
    }

    async fn governing_tier(&self, kind: ResourceKind, scope_id: Uuid) -> Result<Tier, CoreError> {
        let owner_id = match kind {
            ResourceKind::Organization => scope_id,
            ResourceKind::Project | ResourceKind::Member => {
                self.store
                    .get_organization(scope_id)
                    .await?
                    .ok_or_else(|| CoreError::NotFound(format!("organization {scope_id}")))?
                    .owner_id
            }
            ResourceKind::Secret => {
                self.store
                    .environment_scope(scope_id)
                    .await?
                    .ok_or_else(|| CoreError::NotFound(format!("environment {scope_id}")))?
                    .owner_id
            }
        };

        let owner = self
            .store
            .get_user(owner_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("user {owner_id}")))?;
        Ok(owner.tier)
    }

    async fn limit(&self, tier: Tier, limit_type: LimitType) -> Result<i64, CoreError> {
        self.store
            .tier_limit(tier, limit_type)
            .await?
            .ok_or_else(|| CoreError::Internal(format!("no {limit_type} limit configured for tier {tier}")))
    }
}

impl std::fmt::Debug for QuotaEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaEnforcer").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::rbac::SystemRole;
    use crate::seed::seed_defaults;
    use envo_storage::MemoryStore;
    use envo_storage::models::{NewSecret, NewUser};

    struct Fixture {
        store: Arc<dyn Store>,
        quota: QuotaEnforcer,
        owner: Uuid,
        owner_role: Uuid,
    }

    async fn fixture() -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        seed_defaults(store.as_ref()).await.unwrap();
        let owner = new_user(&store, "owner@example.com").await;
        let owner_role = store
            .find_role(SystemRole::Owner.name(), None)
            .await
            .unwrap()
            .unwrap()
            .id;
        Fixture {
            quota: QuotaEnforcer::new(store.clone()),
            store,
            owner,
            owner_role,
        }
    }

    async fn new_user(store: &Arc<dyn Store>, email: &str) -> Uuid {
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

    #[tokio::test]
    async fn free_tier_allows_one_organization() {
        let f = fixture().await;
        assert!(f.quota.can_create(ResourceKind::Organization, f.owner).await.unwrap());
        f.store.create_organization("First", f.owner, f.owner_role).await.unwrap();
        assert!(!f.quota.can_create(ResourceKind::Organization, f.owner).await.unwrap());
        assert!(matches!(
            f.quota.ensure_can_create(ResourceKind::Organization, f.owner).await,
            Err(CoreError::QuotaExceeded { resource: "organizations", limit: 1 })
        ));
    }

    #[tokio::test]
    async fn nested_quotas_follow_owner_tier() {
        let f = fixture().await;
        let (org, _) = f.store.create_organization("Org", f.owner, f.owner_role).await.unwrap();
        f.store.create_project(org.id, "api").await.unwrap();
        assert!(!f.quota.can_create(ResourceKind::Project, org.id).await.unwrap());

        f.store.set_user_tier(f.owner, Tier::Team).await.unwrap();
        assert!(f.quota.can_create(ResourceKind::Project, org.id).await.unwrap());
    }

    #[tokio::test]
    async fn member_quota_counts_the_owner() {
        let f = fixture().await;
        let (org, _) = f.store.create_organization("Org", f.owner, f.owner_role).await.unwrap();
        let dev = new_user(&f.store, "dev@example.com").await;
        f.store.add_member(org.id, dev, f.owner_role).await.unwrap();

        let check = f.quota.check(ResourceKind::Member, org.id).await.unwrap();
        assert_eq!((check.limit, check.current), (2, 2));
        assert!(!check.allowed());
    }

    #[tokio::test]
    async fn secret_quota_is_per_environment() {
        let f = fixture().await;
        let (org, _) = f.store.create_organization("Org", f.owner, f.owner_role).await.unwrap();
        let project = f.store.create_project(org.id, "api").await.unwrap();
        let env = f.store.create_environment(project.id, "dev").await.unwrap();
        f.store.upsert_tier_limit(Tier::Free, LimitType::MaxSecretsPerEnv, 1).await.unwrap();

        f.store
            .insert_secret(&NewSecret {
                environment_id: env.id,
                key: "A".to_owned(),
                encrypted_value: "local:x".to_owned(),
                key_method: "local".to_owned(),
                created_by: f.owner,
            })
            .await
            .unwrap();
        assert!(!f.quota.can_create(ResourceKind::Secret, env.id).await.unwrap());

        let other = f.store.create_environment(project.id, "prod").await.unwrap();
        assert!(f.quota.can_create(ResourceKind::Secret, other.id).await.unwrap());
    }

    #[tokio::test]
    async fn fifty_first_secret_is_denied_on_free_tier() {
        let f = fixture().await;
        let (org, _) = f.store.create_organization("Org", f.owner, f.owner_role).await.unwrap();
        let project = f.store.create_project(org.id, "api").await.unwrap();
        let env = f.store.create_environment(project.id, "dev").await.unwrap();

        for i in 0..50 {
            assert!(f.quota.can_create(ResourceKind::Secret, env.id).await.unwrap(), "secret {i}");
            f.store
                .insert_secret(&NewSecret {
                    environment_id: env.id,
                    key: format!("KEY_{i}"),
                    encrypted_value: "local:x".to_owned(),
                    key_method: "local".to_owned(),
                    created_by: f.owner,
                })
                .await
                .unwrap();
        }

        let check = f.quota.check(ResourceKind::Secret, env.id).await.unwrap();
        assert_eq!((check.limit, check.current), (50, 50));
        assert!(!check.allowed());

        f.store.upsert_tier_limit(Tier::Free, LimitType::MaxSecretsPerEnv, UNLIMITED).await.unwrap();
        assert!(f.quota.can_create(ResourceKind::Secret, env.id).await.unwrap());

        f.store.upsert_tier_limit(Tier::Free, LimitType::MaxSecretsPerEnv, 10).await.unwrap();
        assert!(!f.quota.can_create(ResourceKind::Secret, env.id).await.unwrap());
        f.store.set_user_tier(f.owner, Tier::Team).await.unwrap();
        assert!(f.quota.can_create(ResourceKind::Secret, env.id).await.unwrap());
    }

    #[tokio::test]
    async fn missing_limit_fails_closed() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let user = new_user(&store, "x@example.com").await;
        let quota = QuotaEnforcer::new(store);
        assert!(matches!(
            quota.can_create(ResourceKind::Organization, user).await,
            Err(CoreError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn unknown_scope_is_not_found() {
        let f = fixture().await;
        assert!(matches!(
            f.quota.can_create(ResourceKind::Project, Uuid::new_v4()).await,
            Err(CoreError::NotFound(_))
        ));
    }

    // Check-then-act: both creators observe room before either commits.
    #[tokio::test]
    async fn concurrent_checks_can_both_pass() {
        let f = fixture().await;
        let (org, _) = f.store.create_organization("Org", f.owner, f.owner_role).await.unwrap();
        let (a, b) = tokio::join!(
            f.quota.can_create(ResourceKind::Project, org.id),
            f.quota.can_create(ResourceKind::Project, org.id)
        );
        assert!(a.unwrap() && b.unwrap());
        f.store.create_project(org.id, "one").await.unwrap();
        f.store.create_project(org.id, "two").await.unwrap();
        assert_eq!(f.store.count_projects(org.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn tier_info_reports_owned_usage() {
        let f = fixture().await;
        let (org, _) = f.store.create_organization("Mine", f.owner, f.owner_role).await.unwrap();
        f.store.create_project(org.id, "api").await.unwrap();

        let info = f.quota.tier_info(f.owner).await.unwrap();
        assert_eq!(info.tier, Tier::Free);
        assert_eq!(info.limits.max_projects, 1);
        assert_eq!(info.owned_organizations, 1);
        assert_eq!(
            info.organizations,
            vec![OrgUsage {
                org_id: org.id,
                name: "Mine".to_owned(),
                projects: 1,
                members: 1,
            }]
        );
    }
}

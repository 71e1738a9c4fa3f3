//! Role-based access control.
//!
//! Permissions are a fixed catalog of dotted names. Roles are named sets of
//! permissions: five system roles shared by every organization, plus custom
//! roles scoped to one organization. A user's effective permissions are the
//! union of the permissions of every role they hold, across all of their
//! organizations, read fresh from storage on each call.
//!
//! The union is not scoped to an organization. Callers authorizing access to
//! an organization's resources use [`PermissionResolver::require_org_permission`],
//! which also checks membership of that organization.

use std::collections::BTreeSet;
use std::sync::Arc;

use envo_storage::Store;
use envo_storage::models::{OrgMember, Role};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::tenancy::validate_name;

/// A permission in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "secrets.read")]
    SecretsRead,
    #[serde(rename = "secrets.create")]
    SecretsCreate,
    #[serde(rename = "secrets.update")]
    SecretsUpdate,
    #[serde(rename = "secrets.delete")]
    SecretsDelete,
    #[serde(rename = "projects.manage")]
    ProjectsManage,
    #[serde(rename = "environments.manage")]
    EnvironmentsManage,
    #[serde(rename = "members.invite")]
    MembersInvite,
    #[serde(rename = "members.manage")]
    MembersManage,
    #[serde(rename = "audit.view")]
    AuditView,
    #[serde(rename = "org.manage")]
    OrgManage,
}

impl Permission {
    pub const ALL: [Self; 10] = [
        Self::SecretsRead,
        Self::SecretsCreate,
        Self::SecretsUpdate,
        Self::SecretsDelete,
        Self::ProjectsManage,
        Self::EnvironmentsManage,
        Self::MembersInvite,
        Self::MembersManage,
        Self::AuditView,
        Self::OrgManage,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SecretsRead => "secrets.read",
            Self::SecretsCreate => "secrets.create",
            Self::SecretsUpdate => "secrets.update",
            Self::SecretsDelete => "secrets.delete",
            Self::ProjectsManage => "projects.manage",
            Self::EnvironmentsManage => "environments.manage",
            Self::MembersInvite => "members.invite",
            Self::MembersManage => "members.manage",
            Self::AuditView => "audit.view",
            Self::OrgManage => "org.manage",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Permission {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("unknown permission: {s}")))
    }
}

/// The built-in roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemRole {
    Owner,
    Admin,
    SecretManager,
    Developer,
    Viewer,
}

impl SystemRole {
    pub const ALL: [Self; 5] = [
        Self::Owner,
        Self::Admin,
        Self::SecretManager,
        Self::Developer,
        Self::Viewer,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Owner => "Owner",
            Self::Admin => "Admin",
            Self::SecretManager => "Secret Manager",
            Self::Developer => "Developer",
            Self::Viewer => "Viewer",
        }
    }

    #[must_use]
    pub fn permissions(self) -> Vec<Permission> {
        use Permission as P;
        match self {
            Self::Owner => P::ALL.to_vec(),
            Self::Admin => P::ALL.into_iter().filter(|p| *p != P::OrgManage).collect(),
            Self::SecretManager => vec![
                P::SecretsRead,
                P::SecretsCreate,
                P::SecretsUpdate,
                P::SecretsDelete,
                P::AuditView,
            ],
            Self::Developer => vec![P::SecretsRead],
            Self::Viewer => vec![P::SecretsRead, P::AuditView],
        }
    }
}

/// Resolves and checks permissions against live role data.
#[derive(Clone)]
pub struct PermissionResolver {
    store: Arc<dyn Store>,
}

impl PermissionResolver {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Union of the permissions of every role the user holds, across all
    /// organizations. Stored names outside the catalog are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Storage`] if the lookup fails.
    pub async fn effective_permissions(&self, user_id: Uuid) -> Result<BTreeSet<Permission>, CoreError> {
        let grants = self.store.permission_grants(user_id).await?;
        let mut set = BTreeSet::new();
        for grant in grants {
            match grant.permission.parse::<Permission>() {
                Ok(p) => {
                    set.insert(p);
                }
                Err(_) => warn!(
                    role = %grant.role_name,
                    permission = %grant.permission,
                    "ignoring unknown stored permission"
                ),
            }
        }
        Ok(set)
    }

    /// # Errors
    ///
    /// Returns [`CoreError::Storage`] if the lookup fails.
    pub async fn has_permission(&self, user_id: Uuid, permission: Permission) -> Result<bool, CoreError> {
        Ok(self.effective_permissions(user_id).await?.contains(&permission))
    }

    /// # Errors
    ///
    /// Returns [`CoreError::Authorization`] if the user lacks `permission`.
    pub async fn require_permission(&self, user_id: Uuid, permission: Permission) -> Result<(), CoreError> {
        if self.has_permission(user_id, permission).await? {
            Ok(())
        } else {
            Err(CoreError::Authorization(format!("missing permission {permission}")))
        }
    }

    /// # Errors
    ///
    /// Returns [`CoreError::Authorization`] if the user is not a member.
    pub async fn require_org_membership(&self, user_id: Uuid, org_id: Uuid) -> Result<OrgMember, CoreError> {
        self.store
            .find_membership(org_id, user_id)
            .await?
            .ok_or_else(|| CoreError::Authorization("not a member of this organization".to_owned()))
    }

    /// Membership of `org_id` plus `permission` from the cross-org union.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Authorization`] if either check fails.
    pub async fn require_org_permission(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        permission: Permission,
    ) -> Result<OrgMember, CoreError> {
        let member = self.require_org_membership(user_id, org_id).await?;
        self.require_permission(user_id, permission).await?;
        Ok(member)
    }

    /// Create a role scoped to one organization.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] for an empty name or unknown
    /// permission, [`CoreError::Conflict`] if the name is taken.
    pub async fn create_custom_role(
        &self,
        org_id: Uuid,
        name: &str,
        permissions: &[String],
    ) -> Result<Role, CoreError> {
        let name = validate_name("role", name)?;
        let name = name.as_str();
        if SystemRole::ALL.iter().any(|r| r.name() == name) {
            return Err(CoreError::Conflict(format!("{name} is a system role")));
        }
        let parsed = permissions
            .iter()
            .map(|p| p.parse::<Permission>().map(|p| p.as_str().to_owned()))
            .collect::<Result<BTreeSet<_>, _>>()?;
        let parsed: Vec<String> = parsed.into_iter().collect();

        let role = self.store.create_role(name, Some(org_id), &parsed).await?;
        info!(role_id = %role.id, %org_id, "custom role created");
        Ok(role)
    }

    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] for system roles or unknown permissions.
    pub async fn grant(&self, role_id: Uuid, permission: &str) -> Result<(), CoreError> {
        let permission = permission.parse::<Permission>()?;
        self.mutable_role(role_id).await?;
        self.store.grant_permission(role_id, permission.as_str()).await?;
        Ok(())
    }

    /// Returns `false` if the role did not hold the permission.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] for system roles or unknown permissions.
    pub async fn revoke(&self, role_id: Uuid, permission: &str) -> Result<bool, CoreError> {
        let permission = permission.parse::<Permission>()?;
        self.mutable_role(role_id).await?;
        Ok(self.store.revoke_permission(role_id, permission.as_str()).await?)
    }

    async fn mutable_role(&self, role_id: Uuid) -> Result<Role, CoreError> {
        let role = self
            .store
            .get_role(role_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("role {role_id}")))?;
        if role.is_system {
            return Err(CoreError::Validation(format!(
                "system role {} cannot be modified",
                role.name
            )));
        }
        Ok(role)
    }
}

impl std::fmt::Debug for PermissionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionResolver").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::seed::seed_defaults;
    use envo_storage::MemoryStore;
    use envo_storage::models::NewUser;

    async fn setup() -> (Arc<dyn Store>, PermissionResolver) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        seed_defaults(store.as_ref()).await.unwrap();
        let resolver = PermissionResolver::new(store.clone());
        (store, resolver)
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

    async fn role_id(store: &Arc<dyn Store>, role: SystemRole) -> Uuid {
        store.find_role(role.name(), None).await.unwrap().unwrap().id
    }

    #[test]
    fn permission_names_roundtrip() {
        for p in Permission::ALL {
            assert_eq!(p.as_str().parse::<Permission>().unwrap(), p);
        }
        assert!("secrets.write".parse::<Permission>().is_err());
    }

    #[test]
    fn admin_lacks_only_org_manage() {
        let admin = SystemRole::Admin.permissions();
        assert_eq!(admin.len(), 9);
        assert!(!admin.contains(&Permission::OrgManage));
    }

    #[tokio::test]
    async fn user_without_memberships_has_nothing() {
        let (store, resolver) = setup().await;
        let u = user(&store, "lone@example.com").await;
        assert!(resolver.effective_permissions(u).await.unwrap().is_empty());
        assert!(matches!(
            resolver.require_permission(u, Permission::SecretsRead).await,
            Err(CoreError::Authorization(_))
        ));
    }

    #[tokio::test]
    async fn union_spans_organizations() {
        let (store, resolver) = setup().await;
        let owner_a = user(&store, "a@example.com").await;
        let owner_b = user(&store, "b@example.com").await;
        let dev = user(&store, "dev@example.com").await;
        let owner_role = role_id(&store, SystemRole::Owner).await;
        let (org_a, _) = store.create_organization("A", owner_a, owner_role).await.unwrap();
        let (org_b, _) = store.create_organization("B", owner_b, owner_role).await.unwrap();

        store
            .add_member(org_a.id, dev, role_id(&store, SystemRole::Developer).await)
            .await
            .unwrap();
        store
            .add_member(org_b.id, dev, role_id(&store, SystemRole::Viewer).await)
            .await
            .unwrap();

        let perms = resolver.effective_permissions(dev).await.unwrap();
        assert_eq!(
            perms,
            BTreeSet::from([Permission::SecretsRead, Permission::AuditView])
        );

        // audit.view comes from org B, yet the unscoped check passes for A.
        assert!(resolver.has_permission(dev, Permission::AuditView).await.unwrap());
        assert!(
            resolver
                .require_org_permission(dev, org_a.id, Permission::AuditView)
                .await
                .is_ok()
        );

        let outsider = user(&store, "out@example.com").await;
        assert!(matches!(
            resolver
                .require_org_permission(outsider, org_a.id, Permission::SecretsRead)
                .await,
            Err(CoreError::Authorization(_))
        ));
    }

    #[tokio::test]
    async fn role_edits_take_effect_immediately() {
        let (store, resolver) = setup().await;
        let owner = user(&store, "o@example.com").await;
        let dev = user(&store, "d@example.com").await;
        let (org, _) = store
            .create_organization("Org", owner, role_id(&store, SystemRole::Owner).await)
            .await
            .unwrap();
        let custom = resolver
            .create_custom_role(org.id, "Auditor", &["audit.view".to_owned()])
            .await
            .unwrap();
        store.add_member(org.id, dev, custom.id).await.unwrap();

        assert!(!resolver.has_permission(dev, Permission::SecretsRead).await.unwrap());
        resolver.grant(custom.id, "secrets.read").await.unwrap();
        assert!(resolver.has_permission(dev, Permission::SecretsRead).await.unwrap());
        assert!(resolver.revoke(custom.id, "secrets.read").await.unwrap());
        assert!(!resolver.has_permission(dev, Permission::SecretsRead).await.unwrap());
    }

    #[tokio::test]
    async fn role_name_length_counts_characters() {
        let (store, resolver) = setup().await;
        let owner = user(&store, "o@example.com").await;
        let (org, _) = store
            .create_organization("Org", owner, role_id(&store, SystemRole::Owner).await)
            .await
            .unwrap();

        let longest = "é".repeat(128);
        assert!(resolver.create_custom_role(org.id, &longest, &[]).await.is_ok());
        assert!(matches!(
            resolver.create_custom_role(org.id, &"é".repeat(129), &[]).await,
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            resolver.create_custom_role(org.id, "   ", &[]).await,
            Err(CoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn viewer_here_and_secret_manager_there_can_create() {
        let (store, resolver) = setup().await;
        let owner_role = role_id(&store, SystemRole::Owner).await;
        let owner_a = user(&store, "a@example.com").await;
        let owner_b = user(&store, "b@example.com").await;
        let (org_a, _) = store.create_organization("A", owner_a, owner_role).await.unwrap();
        let (org_b, _) = store.create_organization("B", owner_b, owner_role).await.unwrap();

        let member = user(&store, "m@example.com").await;
        store
            .add_member(org_a.id, member, role_id(&store, SystemRole::Viewer).await)
            .await
            .unwrap();
        store
            .add_member(org_b.id, member, role_id(&store, SystemRole::SecretManager).await)
            .await
            .unwrap();

        assert!(resolver.has_permission(member, Permission::SecretsCreate).await.unwrap());
        assert!(
            resolver
                .effective_permissions(member)
                .await
                .unwrap()
                .contains(&Permission::SecretsCreate)
        );
    }

    #[tokio::test]
    async fn system_roles_are_immutable() {
        let (store, resolver) = setup().await;
        let viewer = role_id(&store, SystemRole::Viewer).await;
        assert!(matches!(
            resolver.grant(viewer, "org.manage").await,
            Err(CoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn custom_role_rejects_unknown_permission() {
        let (_, resolver) = setup().await;
        let result = resolver
            .create_custom_role(Uuid::new_v4(), "Weird", &["secrets.teleport".to_owned()])
            .await;
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }
}

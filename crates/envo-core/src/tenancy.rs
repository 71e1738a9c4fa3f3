//! Organizations, members, projects and environments.
//!
//! Every operation takes the acting user and authorizes it against the
//! target organization: membership of that organization plus, for
//! mutations, the required permission. Mutations are quota-checked first
//! and audited after they commit.

use std::sync::Arc;

use envo_storage::Store;
use envo_storage::models::{Environment, MemberDetail, OrgMember, Organization, Project, Role};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLogger, action};
use crate::error::CoreError;
use crate::quota::{QuotaEnforcer, ResourceKind};
use crate::rbac::{Permission, PermissionResolver, SystemRole};

/// Maximum length of organization, project and environment names.
pub const MAX_NAME_LEN: usize = 128;

/// Tenancy operations.
#[derive(Clone)]
pub struct TenancyService {
    store: Arc<dyn Store>,
    resolver: PermissionResolver,
    quota: QuotaEnforcer,
    audit: AuditLogger,
}

impl TenancyService {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        resolver: PermissionResolver,
        quota: QuotaEnforcer,
        audit: AuditLogger,
    ) -> Self {
        Self {
            store,
            resolver,
            quota,
            audit,
        }
    }

    // ── Organizations ────────────────────────────────────────────────

    /// Create an organization owned by `actor`, who becomes its Owner member.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::QuotaExceeded`] if the actor's tier allows no
    /// more organizations, [`CoreError::Validation`] for a bad name.
    pub async fn create_organization(&self, actor: Uuid, name: &str, ip: &str) -> Result<Organization, CoreError> {
        let name = validate_name("organization", name)?;
        self.quota.ensure_can_create(ResourceKind::Organization, actor).await?;

        let owner_role = self.system_role(SystemRole::Owner).await?;
        let (org, _) = self.store.create_organization(&name, actor, owner_role.id).await?;
        info!(org_id = %org.id, owner_id = %actor, "organization created");

        self.audit
            .record(
                AuditEvent::new(actor, Some(org.id), action::ORG_CREATE, "organization", org.id, ip)
                    .with_metadata(json!({ "name": org.name })),
            )
            .await;
        Ok(org)
    }

    /// # Errors
    ///
    /// Returns a storage error if the lookup fails.
    pub async fn list_organizations(&self, actor: Uuid) -> Result<Vec<Organization>, CoreError> {
        Ok(self.store.list_user_organizations(actor).await?)
    }

    /// # Errors
    ///
    /// Returns [`CoreError::Authorization`] if the actor is not a member.
    pub async fn get_organization(&self, actor: Uuid, org_id: Uuid) -> Result<Organization, CoreError> {
        self.resolver.require_org_membership(actor, org_id).await?;
        self.organization(org_id).await
    }

    // ── Members ──────────────────────────────────────────────────────

    /// Add an existing user, found by email, with the named role.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] for an unknown email or role,
    /// [`CoreError::Conflict`] if already a member,
    /// [`CoreError::QuotaExceeded`] at the member limit.
    pub async fn add_member(
        &self,
        actor: Uuid,
        org_id: Uuid,
        email: &str,
        role_name: &str,
        ip: &str,
    ) -> Result<OrgMember, CoreError> {
        self.resolver
            .require_org_permission(actor, org_id, Permission::MembersInvite)
            .await?;
        self.quota.ensure_can_create(ResourceKind::Member, org_id).await?;

        let email = email.trim();
        let user = self
            .store
            .find_user_by_email(email)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("no user with email {email}")))?;
        let role = self.assignable_role(org_id, role_name).await?;

        let member = self.store.add_member(org_id, user.id, role.id).await?;
        self.audit
            .record(
                AuditEvent::new(actor, Some(org_id), action::MEMBER_INVITE, "org_member", member.id, ip)
                    .with_metadata(json!({ "user_id": user.id, "role": role.name })),
            )
            .await;
        Ok(member)
    }

    /// # Errors
    ///
    /// Returns [`CoreError::Authorization`] if the actor is not a member.
    pub async fn list_members(&self, actor: Uuid, org_id: Uuid) -> Result<Vec<MemberDetail>, CoreError> {
        self.resolver.require_org_membership(actor, org_id).await?;
        Ok(self.store.list_members(org_id).await?)
    }

    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] when targeting the owner's
    /// membership, [`CoreError::NotFound`] for a member of another
    /// organization or an unknown role.
    pub async fn change_member_role(
        &self,
        actor: Uuid,
        org_id: Uuid,
        member_id: Uuid,
        role_name: &str,
        ip: &str,
    ) -> Result<OrgMember, CoreError> {
        self.resolver
            .require_org_permission(actor, org_id, Permission::MembersManage)
            .await?;
        let member = self.member_of(org_id, member_id).await?;
        let role = self.assignable_role(org_id, role_name).await?;

        let updated = self.store.update_member_role(member.id, role.id).await?;
        self.audit
            .record(
                AuditEvent::new(actor, Some(org_id), action::ROLE_CHANGE, "org_member", member.id, ip)
                    .with_metadata(json!({ "from_role_id": member.role_id, "to_role": role.name })),
            )
            .await;
        Ok(updated)
    }

    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] when targeting the owner's membership.
    pub async fn remove_member(&self, actor: Uuid, org_id: Uuid, member_id: Uuid, ip: &str) -> Result<(), CoreError> {
        self.resolver
            .require_org_permission(actor, org_id, Permission::MembersManage)
            .await?;
        let member = self.member_of(org_id, member_id).await?;

        if !self.store.remove_member(member.id).await? {
            return Err(CoreError::NotFound(format!("member {member_id}")));
        }
        self.audit
            .record(
                AuditEvent::new(actor, Some(org_id), action::MEMBER_REMOVE, "org_member", member.id, ip)
                    .with_metadata(json!({ "user_id": member.user_id })),
            )
            .await;
        Ok(())
    }

    // ── Projects and environments ────────────────────────────────────

    /// # Errors
    ///
    /// Returns [`CoreError::QuotaExceeded`] at the project limit.
    pub async fn create_project(&self, actor: Uuid, org_id: Uuid, name: &str, ip: &str) -> Result<Project, CoreError> {
        let name = validate_name("project", name)?;
        self.resolver
            .require_org_permission(actor, org_id, Permission::ProjectsManage)
            .await?;
        self.quota.ensure_can_create(ResourceKind::Project, org_id).await?;

        let project = self.store.create_project(org_id, &name).await?;
        self.audit
            .record(
                AuditEvent::new(actor, Some(org_id), action::PROJECT_CREATE, "project", project.id, ip)
                    .with_metadata(json!({ "name": project.name })),
            )
            .await;
        Ok(project)
    }

    /// # Errors
    ///
    /// Returns [`CoreError::Authorization`] if the actor is not a member.
    pub async fn list_projects(&self, actor: Uuid, org_id: Uuid) -> Result<Vec<Project>, CoreError> {
        self.resolver.require_org_membership(actor, org_id).await?;
        Ok(self.store.list_projects(org_id).await?)
    }

    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] for an unknown project and
    /// [`CoreError::Conflict`] for a duplicate name.
    pub async fn create_environment(
        &self,
        actor: Uuid,
        project_id: Uuid,
        name: &str,
        ip: &str,
    ) -> Result<Environment, CoreError> {
        let name = validate_name("environment", name)?;
        let project = self.project(project_id).await?;
        self.resolver
            .require_org_permission(actor, project.org_id, Permission::EnvironmentsManage)
            .await?;

        let environment = self.store.create_environment(project.id, &name).await?;
        self.audit
            .record(
                AuditEvent::new(
                    actor,
                    Some(project.org_id),
                    action::ENVIRONMENT_CREATE,
                    "environment",
                    environment.id,
                    ip,
                )
                .with_metadata(json!({ "name": environment.name, "project_id": project.id })),
            )
            .await;
        Ok(environment)
    }

    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] for an unknown project.
    pub async fn list_environments(&self, actor: Uuid, project_id: Uuid) -> Result<Vec<Environment>, CoreError> {
        let project = self.project(project_id).await?;
        self.resolver.require_org_membership(actor, project.org_id).await?;
        Ok(self.store.list_environments(project.id).await?)
    }

    // ── Helpers ──────────────────────────────────────────────────────

    async fn organization(&self, org_id: Uuid) -> Result<Organization, CoreError> {
        self.store
            .get_organization(org_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("organization {org_id}")))
    }

    async fn project(&self, project_id: Uuid) -> Result<Project, CoreError> {
        self.store
            .get_project(project_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("project {project_id}")))
    }

    async fn system_role(&self, role: SystemRole) -> Result<Role, CoreError> {
        self.store
            .find_role(role.name(), None)
            .await?
            .ok_or_else(|| CoreError::Internal(format!("system role {} is not seeded", role.name())))
    }

    /// A membership of `org_id` that is not the owner's.
    async fn member_of(&self, org_id: Uuid, member_id: Uuid) -> Result<OrgMember, CoreError> {
        let member = self
            .store
            .get_member(member_id)
            .await?
            .filter(|m| m.org_id == org_id)
            .ok_or_else(|| CoreError::NotFound(format!("member {member_id}")))?;
        let org = self.organization(org_id).await?;
        if member.user_id == org.owner_id {
            return Err(CoreError::Validation(
                "the organization owner's membership cannot be changed".to_owned(),
            ));
        }
        Ok(member)
    }

    /// Any system or org-scoped role except Owner.
    async fn assignable_role(&self, org_id: Uuid, role_name: &str) -> Result<Role, CoreError> {
        let role_name = role_name.trim();
        if role_name == SystemRole::Owner.name() {
            return Err(CoreError::Validation("the Owner role cannot be assigned".to_owned()));
        }
        self.store
            .find_role(role_name, Some(org_id))
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("role {role_name}")))
    }
}

impl std::fmt::Debug for TenancyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenancyService").finish_non_exhaustive()
    }
}

/// Trimmed name, 1 to [`MAX_NAME_LEN`] characters.
///
/// # Errors
///
/// Returns [`CoreError::Validation`] otherwise.
pub fn validate_name(what: &str, name: &str) -> Result<String, CoreError> {
    let name = name.trim();
    let len = name.chars().count();
    if len == 0 || len > MAX_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "{what} name must be 1-{MAX_NAME_LEN} characters"
        )));
    }
    Ok(name.to_owned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::seed::seed_defaults;
    use envo_storage::MemoryStore;
    use envo_storage::models::{NewUser, Tier};

    struct Fixture {
        store: Arc<dyn Store>,
        tenancy: TenancyService,
        audit: AuditLogger,
        owner: Uuid,
    }

    async fn fixture() -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        seed_defaults(store.as_ref()).await.unwrap();
        let resolver = PermissionResolver::new(store.clone());
        let audit = AuditLogger::new(store.clone());
        let tenancy = TenancyService::new(
            store.clone(),
            resolver,
            QuotaEnforcer::new(store.clone()),
            audit.clone(),
        );
        let owner = user(&store, "owner@example.com").await;
        Fixture {
            store,
            tenancy,
            audit,
            owner,
        }
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

    #[tokio::test]
    async fn creating_an_org_makes_the_creator_owner() {
        let f = fixture().await;
        let org = f.tenancy.create_organization(f.owner, "  Acme  ", "1.2.3.4").await.unwrap();
        assert_eq!(org.name, "Acme");

        let members = f.tenancy.list_members(f.owner, org.id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members.first().map(|m| m.role_name.as_str()), Some("Owner"));

        let logs = f.audit.list_org_logs(org.id, 10).await.unwrap();
        assert_eq!(logs.first().map(|e| e.action.as_str()), Some("org_create"));
    }

    #[tokio::test]
    async fn org_quota_blocks_second_org_on_free() {
        let f = fixture().await;
        f.tenancy.create_organization(f.owner, "One", "").await.unwrap();
        assert!(matches!(
            f.tenancy.create_organization(f.owner, "Two", "").await,
            Err(CoreError::QuotaExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn name_validation() {
        let f = fixture().await;
        assert!(matches!(
            f.tenancy.create_organization(f.owner, "   ", "").await,
            Err(CoreError::Validation(_))
        ));
        assert!(validate_name("project", &"x".repeat(129)).is_err());
        assert!(validate_name("project", &"é".repeat(128)).is_ok());
    }

    #[tokio::test]
    async fn invite_change_and_remove_member() {
        let f = fixture().await;
        let org = f.tenancy.create_organization(f.owner, "Acme", "").await.unwrap();
        let dev = user(&f.store, "dev@example.com").await;

        let member = f
            .tenancy
            .add_member(f.owner, org.id, "dev@example.com", "Developer", "")
            .await
            .unwrap();
        assert_eq!(member.user_id, dev);
        assert!(matches!(
            f.tenancy.add_member(f.owner, org.id, "dev@example.com", "Viewer", "").await,
            Err(CoreError::Conflict(_) | CoreError::QuotaExceeded { .. })
        ));

        let updated = f
            .tenancy
            .change_member_role(f.owner, org.id, member.id, "Viewer", "")
            .await
            .unwrap();
        assert_ne!(updated.role_id, member.role_id);

        f.tenancy.remove_member(f.owner, org.id, member.id, "").await.unwrap();
        assert_eq!(f.tenancy.list_members(f.owner, org.id).await.unwrap().len(), 1);

        let actions: Vec<String> = f
            .audit
            .list_org_logs(org.id, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["member_remove", "role_change", "member_invite", "org_create"]);
    }

    #[tokio::test]
    async fn duplicate_membership_is_a_conflict() {
        let f = fixture().await;
        f.store.set_user_tier(f.owner, Tier::Team).await.unwrap();
        let org = f.tenancy.create_organization(f.owner, "Acme", "").await.unwrap();
        user(&f.store, "dev@example.com").await;
        f.tenancy.add_member(f.owner, org.id, "dev@example.com", "Developer", "").await.unwrap();
        assert!(matches!(
            f.tenancy.add_member(f.owner, org.id, "dev@example.com", "Developer", "").await,
            Err(CoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn owner_membership_is_protected() {
        let f = fixture().await;
        let org = f.tenancy.create_organization(f.owner, "Acme", "").await.unwrap();
        let owner_member = f.store.find_membership(org.id, f.owner).await.unwrap().unwrap();

        assert!(matches!(
            f.tenancy.remove_member(f.owner, org.id, owner_member.id, "").await,
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            f.tenancy.change_member_role(f.owner, org.id, owner_member.id, "Viewer", "").await,
            Err(CoreError::Validation(_))
        ));
        user(&f.store, "x@example.com").await;
        assert!(matches!(
            f.tenancy.add_member(f.owner, org.id, "x@example.com", "Owner", "").await,
            Err(CoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn unknown_invitee_or_role_is_not_found() {
        let f = fixture().await;
        let org = f.tenancy.create_organization(f.owner, "Acme", "").await.unwrap();
        assert!(matches!(
            f.tenancy.add_member(f.owner, org.id, "ghost@example.com", "Developer", "").await,
            Err(CoreError::NotFound(_))
        ));
        user(&f.store, "dev@example.com").await;
        assert!(matches!(
            f.tenancy.add_member(f.owner, org.id, "dev@example.com", "Wizard", "").await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn developer_cannot_manage_members_or_projects() {
        let f = fixture().await;
        let org = f.tenancy.create_organization(f.owner, "Acme", "").await.unwrap();
        let dev = user(&f.store, "dev@example.com").await;
        f.tenancy.add_member(f.owner, org.id, "dev@example.com", "Developer", "").await.unwrap();

        assert!(matches!(
            f.tenancy.create_project(dev, org.id, "api", "").await,
            Err(CoreError::Authorization(_))
        ));
        assert!(f.tenancy.list_projects(dev, org.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn permission_in_another_org_does_not_grant_access() {
        let f = fixture().await;
        let org = f.tenancy.create_organization(f.owner, "Acme", "").await.unwrap();
        let stranger = user(&f.store, "stranger@example.com").await;
        f.tenancy.create_organization(stranger, "Other", "").await.unwrap();

        assert!(matches!(
            f.tenancy.create_project(stranger, org.id, "api", "").await,
            Err(CoreError::Authorization(_))
        ));
        assert!(matches!(
            f.tenancy.get_organization(stranger, org.id).await,
            Err(CoreError::Authorization(_))
        ));
    }

    #[tokio::test]
    async fn projects_and_environments() {
        let f = fixture().await;
        let org = f.tenancy.create_organization(f.owner, "Acme", "").await.unwrap();
        let project = f.tenancy.create_project(f.owner, org.id, "api", "").await.unwrap();
        assert!(matches!(
            f.tenancy.create_project(f.owner, org.id, "web", "").await,
            Err(CoreError::QuotaExceeded { limit: 1, .. })
        ));

        f.tenancy.create_environment(f.owner, project.id, "development", "").await.unwrap();
        f.tenancy.create_environment(f.owner, project.id, "production", "").await.unwrap();
        assert!(matches!(
            f.tenancy.create_environment(f.owner, project.id, "production", "").await,
            Err(CoreError::Conflict(_))
        ));
        assert_eq!(f.tenancy.list_environments(f.owner, project.id).await.unwrap().len(), 2);
        assert!(matches!(
            f.tenancy.list_environments(f.owner, Uuid::new_v4()).await,
            Err(CoreError::NotFound(_))
        ));
    }
}

//! In-memory store for development and tests.
//!
//! All tables live behind one `RwLock`, so every trait method is atomic
//! with respect to every other: the organization transaction and the
//! conditional exchange-code update need no extra machinery. Nothing is
//! persistent; data is lost when the process exits.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    AuditLogEntry, Environment, EnvironmentScope, LimitType, LoginExchangeCode, MemberDetail,
    NewSecret, NewUser, OrgMember, Organization, PermissionGrant, Project, RefreshTokenRecord,
    Role, Secret, SubscriptionStatus, Tier, User,
};
use crate::{Store, StorageError};

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    organizations: HashMap<Uuid, Organization>,
    roles: HashMap<Uuid, Role>,
    role_permissions: HashMap<Uuid, BTreeSet<String>>,
    members: HashMap<Uuid, OrgMember>,
    projects: HashMap<Uuid, Project>,
    environments: HashMap<Uuid, Environment>,
    secrets: HashMap<Uuid, Secret>,
    audit: Vec<AuditLogEntry>,
    tier_limits: HashMap<(Tier, LimitType), i64>,
    refresh_tokens: HashMap<String, RefreshTokenRecord>,
    exchange_codes: HashMap<String, LoginExchangeCode>,
}

impl Tables {
    fn live_key_taken(&self, environment_id: Uuid, key: &str, except: Option<Uuid>) -> bool {
        self.secrets.values().any(|s| {
            s.environment_id == environment_id
                && s.key == key
                && s.deleted_at.is_none()
                && Some(s.id) != except
        })
    }
}

fn count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// An in-memory [`Store`].
///
/// Cheap to clone; clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn upsert_oauth_user(&self, new_user: &NewUser) -> Result<User, StorageError> {
        let mut t = self.tables.write().await;
        let now = Utc::now();

        let existing = t
            .users
            .values()
            .find(|u| u.oauth_provider == new_user.oauth_provider && u.oauth_id == new_user.oauth_id)
            .map(|u| u.id);

        let email_taken = t
            .users
            .values()
            .any(|u| u.email == new_user.email && Some(u.id) != existing);
        if email_taken {
            return Err(StorageError::Conflict {
                entity: "user",
                detail: "email already registered".to_owned(),
            });
        }

        if let Some(id) = existing {
            if let Some(user) = t.users.get_mut(&id) {
                user.email.clone_from(&new_user.email);
                user.name.clone_from(&new_user.name);
                user.updated_at = now;
                return Ok(user.clone());
            }
        }

        let user = User {
            id: Uuid::new_v4(),
            email: new_user.email.clone(),
            name: new_user.name.clone(),
            oauth_provider: new_user.oauth_provider.clone(),
            oauth_id: new_user.oauth_id.clone(),
            tier: Tier::Free,
            subscription_status: SubscriptionStatus::Active,
            payment_customer_id: None,
            created_at: now,
            updated_at: now,
        };
        t.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StorageError> {
        Ok(self.tables.read().await.users.get(&user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StorageError> {
        let t = self.tables.read().await;
        Ok(t.users.values().find(|u| u.email == email).cloned())
    }

    async fn set_user_tier(&self, user_id: Uuid, tier: Tier) -> Result<(), StorageError> {
        let mut t = self.tables.write().await;
        let user = t.users.get_mut(&user_id).ok_or_else(|| StorageError::NotFound {
            entity: "user",
            detail: user_id.to_string(),
        })?;
        user.tier = tier;
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn create_organization(
        &self,
        name: &str,
        owner_id: Uuid,
        owner_role_id: Uuid,
    ) -> Result<(Organization, OrgMember), StorageError> {
        let mut t = self.tables.write().await;
        if !t.users.contains_key(&owner_id) {
            return Err(StorageError::NotFound {
                entity: "user",
                detail: owner_id.to_string(),
            });
        }
        if !t.roles.contains_key(&owner_role_id) {
            return Err(StorageError::NotFound {
                entity: "role",
                detail: owner_role_id.to_string(),
            });
        }

        let now = Utc::now();
        let org = Organization {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            owner_id,
            created_at: now,
        };
        let member = OrgMember {
            id: Uuid::new_v4(),
            org_id: org.id,
            user_id: owner_id,
            role_id: owner_role_id,
            created_at: now,
        };
        t.organizations.insert(org.id, org.clone());
        t.members.insert(member.id, member.clone());
        Ok((org, member))
    }

    async fn get_organization(&self, org_id: Uuid) -> Result<Option<Organization>, StorageError> {
        Ok(self.tables.read().await.organizations.get(&org_id).cloned())
    }

    async fn list_user_organizations(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Organization>, StorageError> {
        let t = self.tables.read().await;
        let mut orgs: Vec<Organization> = t
            .members
            .values()
            .filter(|m| m.user_id == user_id)
            .filter_map(|m| t.organizations.get(&m.org_id).cloned())
            .collect();
        orgs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orgs)
    }

    async fn count_owned_organizations(&self, user_id: Uuid) -> Result<i64, StorageError> {
        let t = self.tables.read().await;
        Ok(count(
            t.organizations.values().filter(|o| o.owner_id == user_id).count(),
        ))
    }

    async fn create_role(
        &self,
        name: &str,
        org_id: Option<Uuid>,
        permissions: &[String],
    ) -> Result<Role, StorageError> {
        let mut t = self.tables.write().await;
        if t.roles.values().any(|r| r.name == name && r.org_id == org_id) {
            return Err(StorageError::Conflict {
                entity: "role",
                detail: name.to_owned(),
            });
        }
        let role = Role {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            org_id,
            is_system: org_id.is_none(),
            created_at: Utc::now(),
        };
        t.role_permissions
            .insert(role.id, permissions.iter().cloned().collect());
        t.roles.insert(role.id, role.clone());
        Ok(role)
    }

    async fn get_role(&self, role_id: Uuid) -> Result<Option<Role>, StorageError> {
        Ok(self.tables.read().await.roles.get(&role_id).cloned())
    }

    async fn find_role(
        &self,
        name: &str,
        org_id: Option<Uuid>,
    ) -> Result<Option<Role>, StorageError> {
        let t = self.tables.read().await;
        let system = t.roles.values().find(|r| r.is_system && r.name == name);
        let custom = || {
            org_id.and_then(|org| {
                t.roles
                    .values()
                    .find(|r| r.org_id == Some(org) && r.name == name)
            })
        };
        Ok(system.or_else(custom).cloned())
    }

    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<String>, StorageError> {
        let t = self.tables.read().await;
        Ok(t.role_permissions
            .get(&role_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn grant_permission(&self, role_id: Uuid, permission: &str) -> Result<(), StorageError> {
        let mut t = self.tables.write().await;
        if !t.roles.contains_key(&role_id) {
            return Err(StorageError::NotFound {
                entity: "role",
                detail: role_id.to_string(),
            });
        }
        t.role_permissions
            .entry(role_id)
            .or_default()
            .insert(permission.to_owned());
        Ok(())
    }

    async fn revoke_permission(
        &self,
        role_id: Uuid,
        permission: &str,
    ) -> Result<bool, StorageError> {
        let mut t = self.tables.write().await;
        Ok(t.role_permissions
            .get_mut(&role_id)
            .is_some_and(|set| set.remove(permission)))
    }

    async fn add_member(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        role_id: Uuid,
    ) -> Result<OrgMember, StorageError> {
        let mut t = self.tables.write().await;
        if t.members
            .values()
            .any(|m| m.org_id == org_id && m.user_id == user_id)
        {
            return Err(StorageError::Conflict {
                entity: "member",
                detail: "user is already a member of this organization".to_owned(),
            });
        }
        if !t.organizations.contains_key(&org_id) {
            return Err(StorageError::NotFound {
                entity: "organization",
                detail: org_id.to_string(),
            });
        }
        let member = OrgMember {
            id: Uuid::new_v4(),
            org_id,
            user_id,
            role_id,
            created_at: Utc::now(),
        };
        t.members.insert(member.id, member.clone());
        Ok(member)
    }

    async fn get_member(&self, member_id: Uuid) -> Result<Option<OrgMember>, StorageError> {
        Ok(self.tables.read().await.members.get(&member_id).cloned())
    }

    async fn find_membership(
        &self,
        org_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<OrgMember>, StorageError> {
        let t = self.tables.read().await;
        Ok(t.members
            .values()
            .find(|m| m.org_id == org_id && m.user_id == user_id)
            .cloned())
    }

    async fn list_members(&self, org_id: Uuid) -> Result<Vec<MemberDetail>, StorageError> {
        let t = self.tables.read().await;
        let mut members: Vec<MemberDetail> = t
            .members
            .values()
            .filter(|m| m.org_id == org_id)
            .filter_map(|m| {
                let user = t.users.get(&m.user_id)?;
                let role = t.roles.get(&m.role_id)?;
                Some(MemberDetail {
                    id: m.id,
                    org_id: m.org_id,
                    user_id: m.user_id,
                    email: user.email.clone(),
                    name: user.name.clone(),
                    role_id: role.id,
                    role_name: role.name.clone(),
                    created_at: m.created_at,
                })
            })
            .collect();
        members.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(members)
    }

    async fn update_member_role(
        &self,
        member_id: Uuid,
        role_id: Uuid,
    ) -> Result<OrgMember, StorageError> {
        let mut t = self.tables.write().await;
        let member = t
            .members
            .get_mut(&member_id)
            .ok_or_else(|| StorageError::NotFound {
                entity: "member",
                detail: member_id.to_string(),
            })?;
        member.role_id = role_id;
        Ok(member.clone())
    }

    async fn remove_member(&self, member_id: Uuid) -> Result<bool, StorageError> {
        Ok(self.tables.write().await.members.remove(&member_id).is_some())
    }

    async fn count_members(&self, org_id: Uuid) -> Result<i64, StorageError> {
        let t = self.tables.read().await;
        Ok(count(t.members.values().filter(|m| m.org_id == org_id).count()))
    }

    async fn permission_grants(&self, user_id: Uuid) -> Result<Vec<PermissionGrant>, StorageError> {
        let t = self.tables.read().await;
        let mut grants = Vec::new();
        for member in t.members.values().filter(|m| m.user_id == user_id) {
            let Some(role) = t.roles.get(&member.role_id) else {
                continue;
            };
            for permission in t.role_permissions.get(&role.id).into_iter().flatten() {
                grants.push(PermissionGrant {
                    org_id: member.org_id,
                    role_name: role.name.clone(),
                    permission: permission.clone(),
                });
            }
        }
        Ok(grants)
    }

    async fn create_project(&self, org_id: Uuid, name: &str) -> Result<Project, StorageError> {
        let mut t = self.tables.write().await;
        if !t.organizations.contains_key(&org_id) {
            return Err(StorageError::NotFound {
                entity: "organization",
                detail: org_id.to_string(),
            });
        }
        let project = Project {
            id: Uuid::new_v4(),
            org_id,
            name: name.to_owned(),
            created_at: Utc::now(),
        };
        t.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>, StorageError> {
        Ok(self.tables.read().await.projects.get(&project_id).cloned())
    }

    async fn list_projects(&self, org_id: Uuid) -> Result<Vec<Project>, StorageError> {
        let t = self.tables.read().await;
        let mut projects: Vec<Project> = t
            .projects
            .values()
            .filter(|p| p.org_id == org_id)
            .cloned()
            .collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(projects)
    }

    async fn count_projects(&self, org_id: Uuid) -> Result<i64, StorageError> {
        let t = self.tables.read().await;
        Ok(count(t.projects.values().filter(|p| p.org_id == org_id).count()))
    }

    async fn create_environment(
        &self,
        project_id: Uuid,
        name: &str,
    ) -> Result<Environment, StorageError> {
        let mut t = self.tables.write().await;
        if !t.projects.contains_key(&project_id) {
            return Err(StorageError::NotFound {
                entity: "project",
                detail: project_id.to_string(),
            });
        }
        if t.environments
            .values()
            .any(|e| e.project_id == project_id && e.name == name)
        {
            return Err(StorageError::Conflict {
                entity: "environment",
                detail: name.to_owned(),
            });
        }
        let env = Environment {
            id: Uuid::new_v4(),
            project_id,
            name: name.to_owned(),
            created_at: Utc::now(),
        };
        t.environments.insert(env.id, env.clone());
        Ok(env)
    }

    async fn list_environments(&self, project_id: Uuid) -> Result<Vec<Environment>, StorageError> {
        let t = self.tables.read().await;
        let mut envs: Vec<Environment> = t
            .environments
            .values()
            .filter(|e| e.project_id == project_id)
            .cloned()
            .collect();
        envs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(envs)
    }

    async fn environment_scope(
        &self,
        environment_id: Uuid,
    ) -> Result<Option<EnvironmentScope>, StorageError> {
        let t = self.tables.read().await;
        let scope = t.environments.get(&environment_id).and_then(|env| {
            let project = t.projects.get(&env.project_id)?;
            let org = t.organizations.get(&project.org_id)?;
            Some(EnvironmentScope {
                environment_id: env.id,
                project_id: project.id,
                org_id: org.id,
                owner_id: org.owner_id,
            })
        });
        Ok(scope)
    }

    async fn insert_secret(&self, secret: &NewSecret) -> Result<Secret, StorageError> {
        let mut t = self.tables.write().await;
        if !t.environments.contains_key(&secret.environment_id) {
            return Err(StorageError::NotFound {
                entity: "environment",
                detail: secret.environment_id.to_string(),
            });
        }
        if t.live_key_taken(secret.environment_id, &secret.key, None) {
            return Err(StorageError::Conflict {
                entity: "secret",
                detail: format!("key '{}'", secret.key),
            });
        }
        let now = Utc::now();
        let row = Secret {
            id: Uuid::new_v4(),
            environment_id: secret.environment_id,
            key: secret.key.clone(),
            encrypted_value: secret.encrypted_value.clone(),
            key_method: secret.key_method.clone(),
            created_by: secret.created_by,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        t.secrets.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_secret(&self, secret_id: Uuid) -> Result<Option<Secret>, StorageError> {
        let t = self.tables.read().await;
        Ok(t.secrets
            .get(&secret_id)
            .filter(|s| s.deleted_at.is_none())
            .cloned())
    }

    async fn list_secrets(&self, environment_id: Uuid) -> Result<Vec<Secret>, StorageError> {
        let t = self.tables.read().await;
        let mut secrets: Vec<Secret> = t
            .secrets
            .values()
            .filter(|s| s.environment_id == environment_id && s.deleted_at.is_none())
            .cloned()
            .collect();
        secrets.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(secrets)
    }

    async fn update_secret(
        &self,
        secret_id: Uuid,
        key: &str,
        encrypted_value: &str,
        key_method: &str,
    ) -> Result<Secret, StorageError> {
        let mut t = self.tables.write().await;
        let environment_id = t
            .secrets
            .get(&secret_id)
            .filter(|s| s.deleted_at.is_none())
            .map(|s| s.environment_id)
            .ok_or_else(|| StorageError::NotFound {
                entity: "secret",
                detail: secret_id.to_string(),
            })?;
        if t.live_key_taken(environment_id, key, Some(secret_id)) {
            return Err(StorageError::Conflict {
                entity: "secret",
                detail: format!("key '{key}'"),
            });
        }
        let secret = t
            .secrets
            .get_mut(&secret_id)
            .ok_or_else(|| StorageError::NotFound {
                entity: "secret",
                detail: secret_id.to_string(),
            })?;
        key.clone_into(&mut secret.key);
        encrypted_value.clone_into(&mut secret.encrypted_value);
        key_method.clone_into(&mut secret.key_method);
        secret.updated_at = Utc::now();
        Ok(secret.clone())
    }

    async fn soft_delete_secret(&self, secret_id: Uuid) -> Result<bool, StorageError> {
        let mut t = self.tables.write().await;
        match t.secrets.get_mut(&secret_id) {
            Some(secret) if secret.deleted_at.is_none() => {
                secret.deleted_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_secrets(&self, environment_id: Uuid) -> Result<i64, StorageError> {
        let t = self.tables.read().await;
        Ok(count(
            t.secrets
                .values()
                .filter(|s| s.environment_id == environment_id && s.deleted_at.is_none())
                .count(),
        ))
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), StorageError> {
        self.tables.write().await.audit.push(entry.clone());
        Ok(())
    }

    async fn list_org_audit(
        &self,
        org_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AuditLogEntry>, StorageError> {
        let t = self.tables.read().await;
        let limit = usize::try_from(limit).unwrap_or(0);
        // Appended in commit order, so reverse iteration is newest first.
        Ok(t.audit
            .iter()
            .rev()
            .filter(|e| e.org_id == Some(org_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn tier_limit(
        &self,
        tier: Tier,
        limit_type: LimitType,
    ) -> Result<Option<i64>, StorageError> {
        let t = self.tables.read().await;
        Ok(t.tier_limits.get(&(tier, limit_type)).copied())
    }

    async fn upsert_tier_limit(
        &self,
        tier: Tier,
        limit_type: LimitType,
        value: i64,
    ) -> Result<(), StorageError> {
        self.tables
            .write()
            .await
            .tier_limits
            .insert((tier, limit_type), value);
        Ok(())
    }

    async fn insert_refresh_token(&self, record: &RefreshTokenRecord) -> Result<(), StorageError> {
        let mut t = self.tables.write().await;
        if t.refresh_tokens.contains_key(&record.token_hash) {
            return Err(StorageError::Conflict {
                entity: "refresh token",
                detail: "hash already stored".to_owned(),
            });
        }
        t.refresh_tokens
            .insert(record.token_hash.clone(), record.clone());
        Ok(())
    }

    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StorageError> {
        Ok(self
            .tables
            .read()
            .await
            .refresh_tokens
            .get(token_hash)
            .cloned())
    }

    async fn revoke_refresh_token(&self, token_hash: &str) -> Result<bool, StorageError> {
        let mut t = self.tables.write().await;
        match t.refresh_tokens.get_mut(token_hash) {
            Some(record) => {
                record.revoked = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_exchange_code(&self, code: &LoginExchangeCode) -> Result<(), StorageError> {
        let mut t = self.tables.write().await;
        if t.exchange_codes.contains_key(&code.code_hash) {
            return Err(StorageError::Conflict {
                entity: "exchange code",
                detail: "hash already stored".to_owned(),
            });
        }
        t.exchange_codes.insert(code.code_hash.clone(), code.clone());
        Ok(())
    }

    async fn consume_exchange_code(
        &self,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, StorageError> {
        let mut t = self.tables.write().await;
        match t.exchange_codes.get_mut(code_hash) {
            Some(code) if code.is_valid(now) => {
                code.used_at = Some(now);
                Ok(Some(code.user_id))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn profile(id: &str, email: &str) -> NewUser {
        NewUser {
            oauth_provider: "google".to_owned(),
            oauth_id: id.to_owned(),
            email: email.to_owned(),
            name: "Test User".to_owned(),
        }
    }

    #[tokio::test]
    async fn upsert_returns_same_user_for_same_identity() {
        let store = MemoryStore::new();
        let first = store.upsert_oauth_user(&profile("g-1", "a@example.com")).await.unwrap();
        let second = store.upsert_oauth_user(&profile("g-1", "a@example.com")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.tier, Tier::Free);
    }

    #[tokio::test]
    async fn upsert_rejects_email_owned_by_other_identity() {
        let store = MemoryStore::new();
        store.upsert_oauth_user(&profile("g-1", "a@example.com")).await.unwrap();
        let err = store
            .upsert_oauth_user(&profile("g-2", "a@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { entity: "user", .. }));
    }

    #[tokio::test]
    async fn create_organization_adds_owner_membership() {
        let store = MemoryStore::new();
        let user = store.upsert_oauth_user(&profile("g-1", "a@example.com")).await.unwrap();
        let role = store.create_role("Owner", None, &["org.manage".to_owned()]).await.unwrap();
        let (org, member) = store.create_organization("acme", user.id, role.id).await.unwrap();

        assert_eq!(member.org_id, org.id);
        assert_eq!(store.count_members(org.id).await.unwrap(), 1);
        assert_eq!(store.count_owned_organizations(user.id).await.unwrap(), 1);
        let grants = store.permission_grants(user.id).await.unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].permission, "org.manage");
    }

    #[tokio::test]
    async fn create_organization_with_unknown_role_writes_nothing() {
        let store = MemoryStore::new();
        let user = store.upsert_oauth_user(&profile("g-1", "a@example.com")).await.unwrap();
        let err = store
            .create_organization("acme", user.id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { entity: "role", .. }));
        assert_eq!(store.count_owned_organizations(user.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_membership_conflicts() {
        let store = MemoryStore::new();
        let user = store.upsert_oauth_user(&profile("g-1", "a@example.com")).await.unwrap();
        let role = store.create_role("Owner", None, &[]).await.unwrap();
        let (org, _) = store.create_organization("acme", user.id, role.id).await.unwrap();
        let err = store.add_member(org.id, user.id, role.id).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
    }

    #[tokio::test]
    async fn find_role_prefers_system_then_org_custom() {
        let store = MemoryStore::new();
        let org_id = Uuid::new_v4();
        let system = store.create_role("Viewer", None, &[]).await.unwrap();
        let custom = store.create_role("Auditor", Some(org_id), &[]).await.unwrap();

        let found = store.find_role("Viewer", Some(org_id)).await.unwrap().unwrap();
        assert_eq!(found.id, system.id);
        let found = store.find_role("Auditor", Some(org_id)).await.unwrap().unwrap();
        assert_eq!(found.id, custom.id);
        assert!(store.find_role("Auditor", None).await.unwrap().is_none());
        assert!(store.find_role("Auditor", Some(Uuid::new_v4())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn soft_deleted_secret_frees_key_and_leaves_row() {
        let store = MemoryStore::new();
        let user = store.upsert_oauth_user(&profile("g-1", "a@example.com")).await.unwrap();
        let role = store.create_role("Owner", None, &[]).await.unwrap();
        let (org, _) = store.create_organization("acme", user.id, role.id).await.unwrap();
        let project = store.create_project(org.id, "api").await.unwrap();
        let env = store.create_environment(project.id, "dev").await.unwrap();

        let new = NewSecret {
            environment_id: env.id,
            key: "DB_URL".to_owned(),
            encrypted_value: "local:abc".to_owned(),
            key_method: "local".to_owned(),
            created_by: user.id,
        };
        let secret = store.insert_secret(&new).await.unwrap();
        assert!(matches!(
            store.insert_secret(&new).await,
            Err(StorageError::Conflict { .. })
        ));

        assert!(store.soft_delete_secret(secret.id).await.unwrap());
        assert!(!store.soft_delete_secret(secret.id).await.unwrap());
        assert!(store.get_secret(secret.id).await.unwrap().is_none());
        assert_eq!(store.count_secrets(env.id).await.unwrap(), 0);
        store.insert_secret(&new).await.unwrap();
        assert_eq!(store.tables.read().await.secrets.len(), 2);
    }

    #[tokio::test]
    async fn exchange_code_is_consumed_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let user_id = Uuid::new_v4();
        store
            .insert_exchange_code(&LoginExchangeCode {
                id: Uuid::new_v4(),
                code_hash: "hash".to_owned(),
                user_id,
                expires_at: now + chrono::Duration::minutes(2),
                used_at: None,
                created_at: now,
            })
            .await
            .unwrap();

        assert_eq!(store.consume_exchange_code("hash", now).await.unwrap(), Some(user_id));
        assert_eq!(store.consume_exchange_code("hash", now).await.unwrap(), None);
        assert_eq!(store.consume_exchange_code("other", now).await.unwrap(), None);
    }

    #[tokio::test]
    async fn audit_listing_is_newest_first_and_scoped() {
        let store = MemoryStore::new();
        let org_id = Uuid::new_v4();
        for action in ["first", "second", "third"] {
            store
                .append_audit(&AuditLogEntry {
                    id: Uuid::new_v4(),
                    actor_id: Uuid::new_v4(),
                    org_id: Some(org_id),
                    action: action.to_owned(),
                    resource_type: "secret".to_owned(),
                    resource_id: Uuid::new_v4(),
                    ip_address: "127.0.0.1".to_owned(),
                    metadata: serde_json::Value::Null,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let entries = store.list_org_audit(org_id, 2).await.unwrap();
        let actions: Vec<_> = entries.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, ["third", "second"]);
        assert!(store.list_org_audit(Uuid::new_v4(), 10).await.unwrap().is_empty());
    }
}

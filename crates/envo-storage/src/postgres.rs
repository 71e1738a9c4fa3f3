//! `PostgreSQL` store.
//!
//! Feature-gated behind `postgres`. Uses `sqlx` with the Tokio runtime;
//! the schema is created on connect if it does not exist. Unique violations
//! (SQLSTATE `23505`) map to [`StorageError::Conflict`] and foreign-key
//! violations (`23503`) to [`StorageError::NotFound`].

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use crate::models::{
    AuditLogEntry, Environment, EnvironmentScope, LimitType, LoginExchangeCode, MemberDetail,
    NewSecret, NewUser, OrgMember, Organization, PermissionGrant, Project, RefreshTokenRecord,
    Role, Secret, Tier, User,
};
use crate::{Store, StorageError};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS users (
    id                  UUID PRIMARY KEY,
    email               TEXT NOT NULL UNIQUE,
    name                TEXT NOT NULL,
    oauth_provider      TEXT NOT NULL,
    oauth_id            TEXT NOT NULL,
    tier                TEXT NOT NULL DEFAULT 'free',
    subscription_status TEXT NOT NULL DEFAULT 'active',
    payment_customer_id TEXT,
    created_at          TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at          TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (oauth_provider, oauth_id)
);

CREATE TABLE IF NOT EXISTS organizations (
    id         UUID PRIMARY KEY,
    name       TEXT NOT NULL,
    owner_id   UUID NOT NULL REFERENCES users (id),
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS roles (
    id         UUID PRIMARY KEY,
    name       TEXT NOT NULL,
    org_id     UUID REFERENCES organizations (id) ON DELETE CASCADE,
    is_system  BOOLEAN NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE UNIQUE INDEX IF NOT EXISTS roles_system_name ON roles (name) WHERE org_id IS NULL;
CREATE UNIQUE INDEX IF NOT EXISTS roles_org_name ON roles (org_id, name) WHERE org_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS role_permissions (
    role_id    UUID NOT NULL REFERENCES roles (id) ON DELETE CASCADE,
    permission TEXT NOT NULL,
    PRIMARY KEY (role_id, permission)
);

CREATE TABLE IF NOT EXISTS org_members (
    id         UUID PRIMARY KEY,
    org_id     UUID NOT NULL REFERENCES organizations (id) ON DELETE CASCADE,
    user_id    UUID NOT NULL REFERENCES users (id),
    role_id    UUID NOT NULL REFERENCES roles (id),
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (org_id, user_id)
);

CREATE TABLE IF NOT EXISTS projects (
    id         UUID PRIMARY KEY,
    org_id     UUID NOT NULL REFERENCES organizations (id) ON DELETE CASCADE,
    name       TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS environments (
    id         UUID PRIMARY KEY,
    project_id UUID NOT NULL REFERENCES projects (id) ON DELETE CASCADE,
    name       TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (project_id, name)
);

CREATE TABLE IF NOT EXISTS secrets (
    id              UUID PRIMARY KEY,
    environment_id  UUID NOT NULL REFERENCES environments (id),
    key             TEXT NOT NULL,
    encrypted_value TEXT NOT NULL,
    key_method      TEXT NOT NULL,
    created_by      UUID NOT NULL REFERENCES users (id),
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    deleted_at      TIMESTAMPTZ
);
CREATE UNIQUE INDEX IF NOT EXISTS secrets_live_key
    ON secrets (environment_id, key) WHERE deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS audit_logs (
    id            UUID PRIMARY KEY,
    actor_id      UUID NOT NULL,
    org_id        UUID,
    action        TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    resource_id   UUID NOT NULL,
    ip_address    TEXT NOT NULL,
    metadata      JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at    TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS audit_logs_org_created ON audit_logs (org_id, created_at DESC);

CREATE TABLE IF NOT EXISTS tier_limits (
    tier        TEXT NOT NULL,
    limit_type  TEXT NOT NULL,
    limit_value BIGINT NOT NULL,
    PRIMARY KEY (tier, limit_type)
);

CREATE TABLE IF NOT EXISTS refresh_tokens (
    id         UUID PRIMARY KEY,
    user_id    UUID NOT NULL REFERENCES users (id),
    token_hash TEXT NOT NULL UNIQUE,
    expires_at TIMESTAMPTZ NOT NULL,
    revoked    BOOLEAN NOT NULL DEFAULT false,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS login_exchange_codes (
    id         UUID PRIMARY KEY,
    code_hash  TEXT NOT NULL UNIQUE,
    user_id    UUID NOT NULL REFERENCES users (id),
    expires_at TIMESTAMPTZ NOT NULL,
    used_at    TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
";

/// Map a `sqlx` error, turning constraint violations into typed variants.
fn db_err(operation: &'static str, entity: &'static str) -> impl Fn(sqlx::Error) -> StorageError {
    move |err| {
        if let sqlx::Error::Database(db) = &err {
            match db.code().as_deref() {
                Some("23505") => {
                    return StorageError::Conflict {
                        entity,
                        detail: db.message().to_owned(),
                    };
                }
                Some("23503") => {
                    return StorageError::NotFound {
                        entity,
                        detail: db.message().to_owned(),
                    };
                }
                _ => {}
            }
        }
        StorageError::Query {
            operation,
            reason: err.to_string(),
        }
    }
}

fn tx_err(err: sqlx::Error) -> StorageError {
    StorageError::Transaction {
        reason: err.to_string(),
    }
}

/// A [`Store`] backed by `PostgreSQL`.
///
/// Thread-safe via `PgPool`. All operations are fully async.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool", &"[PgPool]")
            .finish_non_exhaustive()
    }
}

impl PostgresStore {
    /// Connect to `PostgreSQL` and create the schema if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the connection or migration fails.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Open {
                reason: e.to_string(),
            })?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| StorageError::Open {
                reason: format!("migration failed: {e}"),
            })?;

        tracing::info!("postgres schema ready");
        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl Store for PostgresStore {
    async fn upsert_oauth_user(&self, new_user: &NewUser) -> Result<User, StorageError> {
        sqlx::query_as::<_, User>(
            r"INSERT INTO users (id, email, name, oauth_provider, oauth_id)
              VALUES ($1, $2, $3, $4, $5)
              ON CONFLICT (oauth_provider, oauth_id)
              DO UPDATE SET email = EXCLUDED.email, name = EXCLUDED.name, updated_at = now()
              RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&new_user.email)
        .bind(&new_user.name)
        .bind(&new_user.oauth_provider)
        .bind(&new_user.oauth_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("upsert_oauth_user", "user"))
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StorageError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get_user", "user"))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StorageError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("find_user_by_email", "user"))
    }

    async fn set_user_tier(&self, user_id: Uuid, tier: Tier) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE users SET tier = $2, updated_at = now() WHERE id = $1")
            .bind(user_id)
            .bind(tier)
            .execute(&self.pool)
            .await
            .map_err(db_err("set_user_tier", "user"))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "user",
                detail: user_id.to_string(),
            });
        }
        Ok(())
    }

    async fn create_organization(
        &self,
        name: &str,
        owner_id: Uuid,
        owner_role_id: Uuid,
    ) -> Result<(Organization, OrgMember), StorageError> {
        let mut tx = self.pool.begin().await.map_err(tx_err)?;

        let org = sqlx::query_as::<_, Organization>(
            r"INSERT INTO organizations (id, name, owner_id)
              VALUES ($1, $2, $3)
              RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(owner_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err("create_organization", "user"))?;

        let member = sqlx::query_as::<_, OrgMember>(
            r"INSERT INTO org_members (id, org_id, user_id, role_id)
              VALUES ($1, $2, $3, $4)
              RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(org.id)
        .bind(owner_id)
        .bind(owner_role_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err("create_organization", "role"))?;

        tx.commit().await.map_err(tx_err)?;
        Ok((org, member))
    }

    async fn get_organization(&self, org_id: Uuid) -> Result<Option<Organization>, StorageError> {
        sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE id = $1")
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get_organization", "organization"))
    }

    async fn list_user_organizations(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Organization>, StorageError> {
        sqlx::query_as::<_, Organization>(
            r"SELECT o.* FROM organizations o
              JOIN org_members m ON m.org_id = o.id
              WHERE m.user_id = $1
              ORDER BY o.created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list_user_organizations", "organization"))
    }

    async fn count_owned_organizations(&self, user_id: Uuid) -> Result<i64, StorageError> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM organizations WHERE owner_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("count_owned_organizations", "organization"))
    }

    async fn create_role(
        &self,
        name: &str,
        org_id: Option<Uuid>,
        permissions: &[String],
    ) -> Result<Role, StorageError> {
        let mut tx = self.pool.begin().await.map_err(tx_err)?;

        let role = sqlx::query_as::<_, Role>(
            r"INSERT INTO roles (id, name, org_id, is_system)
              VALUES ($1, $2, $3, $4)
              RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(org_id)
        .bind(org_id.is_none())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err("create_role", "role"))?;

        for permission in permissions {
            sqlx::query(
                r"INSERT INTO role_permissions (role_id, permission)
                  VALUES ($1, $2)
                  ON CONFLICT DO NOTHING",
            )
            .bind(role.id)
            .bind(permission)
            .execute(&mut *tx)
            .await
            .map_err(db_err("create_role", "role permission"))?;
        }

        tx.commit().await.map_err(tx_err)?;
        Ok(role)
    }

    async fn get_role(&self, role_id: Uuid) -> Result<Option<Role>, StorageError> {
        sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE id = $1")
            .bind(role_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get_role", "role"))
    }

    async fn find_role(
        &self,
        name: &str,
        org_id: Option<Uuid>,
    ) -> Result<Option<Role>, StorageError> {
        sqlx::query_as::<_, Role>(
            r"SELECT * FROM roles
              WHERE name = $1 AND (org_id IS NULL OR org_id = $2)
              ORDER BY is_system DESC
              LIMIT 1",
        )
        .bind(name)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("find_role", "role"))
    }

    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<String>, StorageError> {
        sqlx::query_scalar::<_, String>(
            "SELECT permission FROM role_permissions WHERE role_id = $1 ORDER BY permission",
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("role_permissions", "role"))
    }

    async fn grant_permission(&self, role_id: Uuid, permission: &str) -> Result<(), StorageError> {
        sqlx::query(
            r"INSERT INTO role_permissions (role_id, permission)
              VALUES ($1, $2)
              ON CONFLICT DO NOTHING",
        )
        .bind(role_id)
        .bind(permission)
        .execute(&self.pool)
        .await
        .map_err(db_err("grant_permission", "role"))?;
        Ok(())
    }

    async fn revoke_permission(
        &self,
        role_id: Uuid,
        permission: &str,
    ) -> Result<bool, StorageError> {
        let result =
            sqlx::query("DELETE FROM role_permissions WHERE role_id = $1 AND permission = $2")
                .bind(role_id)
                .bind(permission)
                .execute(&self.pool)
                .await
                .map_err(db_err("revoke_permission", "role"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_member(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        role_id: Uuid,
    ) -> Result<OrgMember, StorageError> {
        sqlx::query_as::<_, OrgMember>(
            r"INSERT INTO org_members (id, org_id, user_id, role_id)
              VALUES ($1, $2, $3, $4)
              RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(org_id)
        .bind(user_id)
        .bind(role_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("add_member", "member"))
    }

    async fn get_member(&self, member_id: Uuid) -> Result<Option<OrgMember>, StorageError> {
        sqlx::query_as::<_, OrgMember>("SELECT * FROM org_members WHERE id = $1")
            .bind(member_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get_member", "member"))
    }

    async fn find_membership(
        &self,
        org_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<OrgMember>, StorageError> {
        sqlx::query_as::<_, OrgMember>(
            "SELECT * FROM org_members WHERE org_id = $1 AND user_id = $2",
        )
        .bind(org_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("find_membership", "member"))
    }

    async fn list_members(&self, org_id: Uuid) -> Result<Vec<MemberDetail>, StorageError> {
        sqlx::query_as::<_, MemberDetail>(
            r"SELECT m.id, m.org_id, m.user_id, u.email, u.name,
                     r.id AS role_id, r.name AS role_name, m.created_at
              FROM org_members m
              JOIN users u ON u.id = m.user_id
              JOIN roles r ON r.id = m.role_id
              WHERE m.org_id = $1
              ORDER BY m.created_at",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list_members", "member"))
    }

    async fn update_member_role(
        &self,
        member_id: Uuid,
        role_id: Uuid,
    ) -> Result<OrgMember, StorageError> {
        sqlx::query_as::<_, OrgMember>(
            "UPDATE org_members SET role_id = $2 WHERE id = $1 RETURNING *",
        )
        .bind(member_id)
        .bind(role_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("update_member_role", "role"))?
        .ok_or_else(|| StorageError::NotFound {
            entity: "member",
            detail: member_id.to_string(),
        })
    }

    async fn remove_member(&self, member_id: Uuid) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM org_members WHERE id = $1")
            .bind(member_id)
            .execute(&self.pool)
            .await
            .map_err(db_err("remove_member", "member"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_members(&self, org_id: Uuid) -> Result<i64, StorageError> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM org_members WHERE org_id = $1")
            .bind(org_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("count_members", "member"))
    }

    async fn permission_grants(&self, user_id: Uuid) -> Result<Vec<PermissionGrant>, StorageError> {
        sqlx::query_as::<_, PermissionGrant>(
            r"SELECT m.org_id, r.name AS role_name, rp.permission
              FROM org_members m
              JOIN roles r ON r.id = m.role_id
              JOIN role_permissions rp ON rp.role_id = r.id
              WHERE m.user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("permission_grants", "member"))
    }

    async fn create_project(&self, org_id: Uuid, name: &str) -> Result<Project, StorageError> {
        sqlx::query_as::<_, Project>(
            r"INSERT INTO projects (id, org_id, name)
              VALUES ($1, $2, $3)
              RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(org_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("create_project", "organization"))
    }

    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>, StorageError> {
        sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get_project", "project"))
    }

    async fn list_projects(&self, org_id: Uuid) -> Result<Vec<Project>, StorageError> {
        sqlx::query_as::<_, Project>(
            "SELECT * FROM projects WHERE org_id = $1 ORDER BY created_at DESC",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list_projects", "project"))
    }

    async fn count_projects(&self, org_id: Uuid) -> Result<i64, StorageError> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM projects WHERE org_id = $1")
            .bind(org_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("count_projects", "project"))
    }

    async fn create_environment(
        &self,
        project_id: Uuid,
        name: &str,
    ) -> Result<Environment, StorageError> {
        sqlx::query_as::<_, Environment>(
            r"INSERT INTO environments (id, project_id, name)
              VALUES ($1, $2, $3)
              RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("create_environment", "environment"))
    }

    async fn list_environments(&self, project_id: Uuid) -> Result<Vec<Environment>, StorageError> {
        sqlx::query_as::<_, Environment>(
            "SELECT * FROM environments WHERE project_id = $1 ORDER BY created_at",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list_environments", "environment"))
    }

    async fn environment_scope(
        &self,
        environment_id: Uuid,
    ) -> Result<Option<EnvironmentScope>, StorageError> {
        sqlx::query_as::<_, EnvironmentScope>(
            r"SELECT e.id AS environment_id, p.id AS project_id, o.id AS org_id, o.owner_id
              FROM environments e
              JOIN projects p ON p.id = e.project_id
              JOIN organizations o ON o.id = p.org_id
              WHERE e.id = $1",
        )
        .bind(environment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("environment_scope", "environment"))
    }

    async fn insert_secret(&self, secret: &NewSecret) -> Result<Secret, StorageError> {
        sqlx::query_as::<_, Secret>(
            r"INSERT INTO secrets (id, environment_id, key, encrypted_value, key_method, created_by)
              VALUES ($1, $2, $3, $4, $5, $6)
              RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(secret.environment_id)
        .bind(&secret.key)
        .bind(&secret.encrypted_value)
        .bind(&secret.key_method)
        .bind(secret.created_by)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("insert_secret", "secret"))
    }

    async fn get_secret(&self, secret_id: Uuid) -> Result<Option<Secret>, StorageError> {
        sqlx::query_as::<_, Secret>(
            "SELECT * FROM secrets WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(secret_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get_secret", "secret"))
    }

    async fn list_secrets(&self, environment_id: Uuid) -> Result<Vec<Secret>, StorageError> {
        sqlx::query_as::<_, Secret>(
            r"SELECT * FROM secrets
              WHERE environment_id = $1 AND deleted_at IS NULL
              ORDER BY key",
        )
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list_secrets", "secret"))
    }

    async fn update_secret(
        &self,
        secret_id: Uuid,
        key: &str,
        encrypted_value: &str,
        key_method: &str,
    ) -> Result<Secret, StorageError> {
        sqlx::query_as::<_, Secret>(
            r"UPDATE secrets
              SET key = $2, encrypted_value = $3, key_method = $4, updated_at = now()
              WHERE id = $1 AND deleted_at IS NULL
              RETURNING *",
        )
        .bind(secret_id)
        .bind(key)
        .bind(encrypted_value)
        .bind(key_method)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("update_secret", "secret"))?
        .ok_or_else(|| StorageError::NotFound {
            entity: "secret",
            detail: secret_id.to_string(),
        })
    }

    async fn soft_delete_secret(&self, secret_id: Uuid) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE secrets SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(secret_id)
        .execute(&self.pool)
        .await
        .map_err(db_err("soft_delete_secret", "secret"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn count_secrets(&self, environment_id: Uuid) -> Result<i64, StorageError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM secrets WHERE environment_id = $1 AND deleted_at IS NULL",
        )
        .bind(environment_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("count_secrets", "secret"))
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), StorageError> {
        sqlx::query(
            r"INSERT INTO audit_logs
                (id, actor_id, org_id, action, resource_type, resource_id, ip_address, metadata, created_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(entry.id)
        .bind(entry.actor_id)
        .bind(entry.org_id)
        .bind(&entry.action)
        .bind(&entry.resource_type)
        .bind(entry.resource_id)
        .bind(&entry.ip_address)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("append_audit", "audit entry"))?;
        Ok(())
    }

    async fn list_org_audit(
        &self,
        org_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AuditLogEntry>, StorageError> {
        sqlx::query_as::<_, AuditLogEntry>(
            r"SELECT * FROM audit_logs
              WHERE org_id = $1
              ORDER BY created_at DESC
              LIMIT $2",
        )
        .bind(org_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list_org_audit", "audit entry"))
    }

    async fn tier_limit(
        &self,
        tier: Tier,
        limit_type: LimitType,
    ) -> Result<Option<i64>, StorageError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT limit_value FROM tier_limits WHERE tier = $1 AND limit_type = $2",
        )
        .bind(tier)
        .bind(limit_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("tier_limit", "tier limit"))
    }

    async fn upsert_tier_limit(
        &self,
        tier: Tier,
        limit_type: LimitType,
        value: i64,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r"INSERT INTO tier_limits (tier, limit_type, limit_value)
              VALUES ($1, $2, $3)
              ON CONFLICT (tier, limit_type) DO UPDATE SET limit_value = EXCLUDED.limit_value",
        )
        .bind(tier)
        .bind(limit_type)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(db_err("upsert_tier_limit", "tier limit"))?;
        Ok(())
    }

    async fn insert_refresh_token(&self, record: &RefreshTokenRecord) -> Result<(), StorageError> {
        sqlx::query(
            r"INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at, revoked, created_at)
              VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(&record.token_hash)
        .bind(record.expires_at)
        .bind(record.revoked)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("insert_refresh_token", "refresh token"))?;
        Ok(())
    }

    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StorageError> {
        sqlx::query_as::<_, RefreshTokenRecord>(
            "SELECT * FROM refresh_tokens WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("find_refresh_token", "refresh token"))
    }

    async fn revoke_refresh_token(&self, token_hash: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE refresh_tokens SET revoked = true WHERE token_hash = $1")
            .bind(token_hash)
            .execute(&self.pool)
            .await
            .map_err(db_err("revoke_refresh_token", "refresh token"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_exchange_code(&self, code: &LoginExchangeCode) -> Result<(), StorageError> {
        sqlx::query(
            r"INSERT INTO login_exchange_codes (id, code_hash, user_id, expires_at, used_at, created_at)
              VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(code.id)
        .bind(&code.code_hash)
        .bind(code.user_id)
        .bind(code.expires_at)
        .bind(code.used_at)
        .bind(code.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("insert_exchange_code", "exchange code"))?;
        Ok(())
    }

    async fn consume_exchange_code(
        &self,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, StorageError> {
        sqlx::query_scalar::<_, Uuid>(
            r"UPDATE login_exchange_codes
              SET used_at = $2
              WHERE code_hash = $1 AND used_at IS NULL AND expires_at > $2
              RETURNING user_id",
        )
        .bind(code_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("consume_exchange_code", "exchange code"))
    }
}

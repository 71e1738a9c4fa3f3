//! Bootstrap data: system roles and default tier limits.
//!
//! Safe to run on every start. Existing roles and limits are left as they
//! are, so operator edits to tier limits survive restarts.

use envo_storage::models::{LimitType, Tier, UNLIMITED};
use envo_storage::{Store, StorageError};
use tracing::info;

use crate::rbac::SystemRole;

/// Default limits per tier, in [`LimitType`] order.
const DEFAULT_LIMITS: [(Tier, [(LimitType, i64); 6]); 3] = [
    (
        Tier::Free,
        [
            (LimitType::MaxDevs, 2),
            (LimitType::MaxProjects, 1),
            (LimitType::MaxOrgs, 1),
            (LimitType::MaxSecretsPerEnv, 50),
            (LimitType::ApiRateLimitPerHour, 100),
            (LimitType::AuditRetentionDays, 7),
        ],
    ),
    (
        Tier::Starter,
        [
            (LimitType::MaxDevs, 8),
            (LimitType::MaxProjects, 5),
            (LimitType::MaxOrgs, 1),
            (LimitType::MaxSecretsPerEnv, 200),
            (LimitType::ApiRateLimitPerHour, 500),
            (LimitType::AuditRetentionDays, 30),
        ],
    ),
    (
        Tier::Team,
        [
            (LimitType::MaxDevs, UNLIMITED),
            (LimitType::MaxProjects, UNLIMITED),
            (LimitType::MaxOrgs, UNLIMITED),
            (LimitType::MaxSecretsPerEnv, UNLIMITED),
            (LimitType::ApiRateLimitPerHour, 2000),
            (LimitType::AuditRetentionDays, 365),
        ],
    ),
];

/// Create missing system roles and tier limits.
///
/// # Errors
///
/// Returns [`StorageError`] if a lookup or insert fails.
pub async fn seed_defaults(store: &dyn Store) -> Result<(), StorageError> {
    let mut roles_created = 0_usize;
    for role in SystemRole::ALL {
        if store.find_role(role.name(), None).await?.is_some() {
            continue;
        }
        let permissions: Vec<String> = role
            .permissions()
            .into_iter()
            .map(|p| p.as_str().to_owned())
            .collect();
        store.create_role(role.name(), None, &permissions).await?;
        roles_created += 1;
    }

    let mut limits_created = 0_usize;
    for (tier, limits) in DEFAULT_LIMITS {
        for (limit_type, value) in limits {
            if store.tier_limit(tier, limit_type).await?.is_none() {
                store.upsert_tier_limit(tier, limit_type, value).await?;
                limits_created += 1;
            }
        }
    }

    info!(roles_created, limits_created, "seeded default roles and tier limits");
    Ok(())
}

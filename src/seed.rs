//! Install-time seeding: the immutable system roles and permissions, the
//! capability catalog, and optionally a bootstrap system owner. Every write
//! is idempotent, so re-running the seed is safe.

use chrono::Utc;
use uuid::Uuid;

use crate::auth::CredentialVerifier;
use crate::database::models::{
    capability::SEEDED_CAPABILITY_KEYS, Permission, PrincipalType, Role, RolePlane, User,
    UserStatus,
};
use crate::error::AuthError;
use crate::storage::Storage;

/// `(resource, action)` pairs granted to each seeded system role.
const SYSTEM_PERMISSIONS: &[(&str, &str)] = &[
    ("tenants", "manage"),
    ("users", "manage"),
    ("roles", "manage"),
    ("capabilities", "manage"),
    ("features", "manage"),
    ("tokens", "revoke"),
    ("audit", "read"),
    ("impersonation", "use"),
];

const AUDITOR_PERMISSIONS: &[(&str, &str)] = &[("audit", "read")];

/// Capability keys that ship enabled at the system layer.
const DEFAULT_ENABLED: &[&str] = &["mfa", "totp", "recovery_codes", "webhooks", "api_keys"];

pub struct SeedReport {
    pub roles_created: usize,
    pub capabilities_seeded: usize,
    pub admin_created: bool,
}

/// Seed system roles, permissions and the capability catalog. Optionally
/// bootstrap a system owner with the given credentials.
pub async fn seed(
    storage: &Storage,
    credentials: &CredentialVerifier,
    admin: Option<(&str, &str, &str)>,
) -> Result<SeedReport, AuthError> {
    let mut report = SeedReport {
        roles_created: 0,
        capabilities_seeded: 0,
        admin_created: false,
    };

    let owner = seed_role(storage, "system_owner", SYSTEM_PERMISSIONS, &mut report).await?;
    seed_role(storage, "system_admin", SYSTEM_PERMISSIONS, &mut report).await?;
    seed_role(storage, "system_auditor", AUDITOR_PERMISSIONS, &mut report).await?;

    for key in SEEDED_CAPABILITY_KEYS {
        let existing = storage.capabilities.get_system(key).await?;
        if existing.is_none() {
            storage
                .capabilities
                .upsert_system(&crate::database::models::SystemCapability {
                    capability_key: key.to_string(),
                    enabled: DEFAULT_ENABLED.contains(key),
                    default_value: None,
                })
                .await?;
            report.capabilities_seeded += 1;
        }
    }

    if let Some((username, email, password)) = admin {
        if storage
            .users
            .find_by_username(None, username)
            .await?
            .is_none()
        {
            let user = User {
                id: Uuid::new_v4(),
                principal_type: PrincipalType::System,
                tenant_id: None,
                username: username.to_string(),
                email: email.to_string(),
                status: UserStatus::Active,
                mfa_enabled: false,
                totp_secret_enc: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                deleted_at: None,
            };
            storage.users.create(&user).await?;
            credentials.set_password(user.id, password).await?;
            storage.roles.assign_role(&user, owner).await?;
            report.admin_created = true;
            tracing::info!(username, "Bootstrap system owner created");
        }
    }

    Ok(report)
}

/// Create a seeded system role with its permission grants. Returns the role
/// id whether freshly created or pre-existing.
async fn seed_role(
    storage: &Storage,
    name: &str,
    permissions: &[(&str, &str)],
    report: &mut SeedReport,
) -> Result<Uuid, AuthError> {
    let role = Role {
        id: Uuid::new_v4(),
        plane: RolePlane::System,
        tenant_id: None,
        name: name.to_string(),
        description: Some(format!("Seeded system role: {}", name)),
        created_at: Utc::now(),
    };

    let role_id = match storage.roles.create(&role).await {
        Ok(()) => {
            report.roles_created += 1;
            role.id
        }
        // Already seeded on a previous run.
        Err(AuthError::Conflict(_)) => find_role_id(storage, name).await?,
        Err(e) => return Err(e),
    };

    for (resource, action) in permissions {
        storage
            .roles
            .attach_permission(
                role_id,
                &Permission {
                    id: Uuid::new_v4(),
                    resource: resource.to_string(),
                    action: action.to_string(),
                    tenant_id: None,
                },
            )
            .await?;
    }
    Ok(role_id)
}

async fn find_role_id(storage: &Storage, name: &str) -> Result<Uuid, AuthError> {
    storage
        .roles
        .find_by_name(None, name)
        .await?
        .map(|role| role.id)
        .ok_or_else(|| AuthError::Internal(format!("seeded role '{}' vanished", name)))
}

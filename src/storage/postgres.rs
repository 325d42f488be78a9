//! Postgres-backed repositories. All SQL for the primary store lives here.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::database::models::{
    AuditActor, AuditEvent, AuditQuery, AuditResult, AuditTarget, Credential, FederatedIdentity,
    OAuthClient, Permission, PrincipalType, RefreshToken, Role, RolePlane, SystemCapability,
    Tenant, TenantCapability, TenantFeatureEnablement, TenantStatus, User, UserCapabilityState,
    UserStatus,
};
use crate::error::AuthError;
use crate::token::lifetimes::TenantTokenSettings;

use super::{
    AuditEventRepository, CapabilityRepository, CredentialRepository,
    FederatedIdentityRepository, OAuthClientRepository, RecoveryCodeRepository,
    RefreshTokenRepository, RoleRepository, RotateOutcome, TenantCapabilitySnapshot,
    TenantRepository, UserRepository,
};

fn parse_field<T>(value: Option<T>, field: &str) -> Result<T, AuthError> {
    value.ok_or_else(|| AuthError::Internal(format!("unrecognised value in column {}", field)))
}

fn row_to_user(row: &PgRow) -> Result<User, AuthError> {
    let principal_type: String = row.get("principal_type");
    let status: String = row.get("status");
    Ok(User {
        id: row.get("id"),
        principal_type: parse_field(PrincipalType::parse(&principal_type), "principal_type")?,
        tenant_id: row.get("tenant_id"),
        username: row.get("username"),
        email: row.get("email"),
        status: parse_field(UserStatus::parse(&status), "status")?,
        mfa_enabled: row.get("mfa_enabled"),
        totp_secret_enc: row.get("totp_secret_enc"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    })
}

fn row_to_refresh_token(row: &PgRow) -> RefreshToken {
    RefreshToken {
        id: row.get("id"),
        user_id: row.get("user_id"),
        tenant_id: row.get("tenant_id"),
        token_hash: row.get("token_hash"),
        expires_at: row.get("expires_at"),
        revoked_at: row.get("revoked_at"),
        remember_me: row.get("remember_me"),
        client_id: row.get("client_id"),
        mfa_satisfied: row.get("mfa_satisfied"),
        created_at: row.get("created_at"),
    }
}

fn row_to_audit_event(row: &PgRow) -> Result<AuditEvent, AuthError> {
    let result: String = row.get("result");
    let actor_pt: Option<String> = row.get("actor_principal_type");
    Ok(AuditEvent {
        id: row.get("id"),
        event_type: row.get("event_type"),
        actor: AuditActor {
            user_id: row.get("actor_user_id"),
            username: row.get("actor_username"),
            principal_type: actor_pt.as_deref().and_then(PrincipalType::parse),
        },
        target: AuditTarget {
            target_type: row.get("target_type"),
            target_id: row.get("target_id"),
            identifier: row.get("target_identifier"),
        },
        tenant_id: row.get("tenant_id"),
        source_ip: row.get("source_ip"),
        user_agent: row.get("user_agent"),
        timestamp: row.get("timestamp"),
        result: match result.as_str() {
            "success" => AuditResult::Success,
            "denied" => AuditResult::Denied,
            _ => AuditResult::Failure,
        },
        metadata: row.get("metadata"),
        error: row.get("error"),
    })
}

// ---------------------------------------------------------------------------
// Users

pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn create(&self, user: &User) -> Result<(), AuthError> {
        if !user.plane_is_consistent() {
            return Err(AuthError::InputInvalid(
                "principal plane does not match tenant binding".to_string(),
            ));
        }
        sqlx::query(
            r#"
            INSERT INTO users
                (id, principal_type, tenant_id, username, email, status,
                 mfa_enabled, totp_secret_enc, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(user.id)
        .bind(user.principal_type.as_str())
        .bind(user.tenant_id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(user.status.as_str())
        .bind(user.mfa_enabled)
        .bind(&user.totp_secret_enc)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AuthError::Conflict("username or email already taken".to_string())
            }
            _ => AuthError::from(e),
        })?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<User>, AuthError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1 AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn find_by_username(
        &self,
        tenant_id: Option<Uuid>,
        username: &str,
    ) -> Result<Option<User>, AuthError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM users
            WHERE tenant_id IS NOT DISTINCT FROM $1
              AND username = $2
              AND deleted_at IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn set_totp_secret(
        &self,
        user_id: Uuid,
        secret_enc: Option<Vec<u8>>,
        mfa_enabled: bool,
    ) -> Result<(), AuthError> {
        sqlx::query(
            "UPDATE users SET totp_secret_enc = $2, mfa_enabled = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(user_id)
        .bind(secret_enc)
        .bind(mfa_enabled)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), AuthError> {
        // Cascade: credential removed, refresh tokens revoked, MFA state gone.
        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;
        let now = Utc::now();
        sqlx::query("UPDATE users SET deleted_at = $2, updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM credentials WHERE user_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = $2 WHERE user_id = $1 AND revoked_at IS NULL",
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM user_capability_states WHERE user_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM mfa_recovery_codes WHERE user_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await.map_err(AuthError::from)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Credentials

pub struct PgCredentialRepository {
    pool: PgPool,
}

impl PgCredentialRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialRepository for PgCredentialRepository {
    async fn get(&self, user_id: Uuid) -> Result<Option<Credential>, AuthError> {
        let row = sqlx::query("SELECT * FROM credentials WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| Credential {
            user_id: row.get("user_id"),
            password_hash: row.get("password_hash"),
            password_changed_at: row.get("password_changed_at"),
            failed_login_attempts: row.get("failed_login_attempts"),
            locked_until: row.get("locked_until"),
        }))
    }

    async fn upsert(&self, credential: &Credential) -> Result<(), AuthError> {
        sqlx::query(
            r#"
            INSERT INTO credentials
                (user_id, password_hash, password_changed_at, failed_login_attempts, locked_until)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE SET
                password_hash = EXCLUDED.password_hash,
                password_changed_at = EXCLUDED.password_changed_at,
                failed_login_attempts = EXCLUDED.failed_login_attempts,
                locked_until = EXCLUDED.locked_until
            "#,
        )
        .bind(credential.user_id)
        .bind(&credential.password_hash)
        .bind(credential.password_changed_at)
        .bind(credential.failed_login_attempts)
        .bind(credential.locked_until)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        user_id: Uuid,
        threshold: i32,
        lock_for: Duration,
    ) -> Result<i32, AuthError> {
        // Counter increment is atomic at the row; the lock engages in the
        // same statement when the threshold is reached.
        let locked_until = Utc::now() + lock_for;
        let row = sqlx::query(
            r#"
            UPDATE credentials
            SET failed_login_attempts = failed_login_attempts + 1,
                locked_until = CASE
                    WHEN failed_login_attempts + 1 >= $2 THEN $3
                    ELSE locked_until
                END
            WHERE user_id = $1
            RETURNING failed_login_attempts
            "#,
        )
        .bind(user_id)
        .bind(threshold)
        .bind(locked_until)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("failed_login_attempts"))
    }

    async fn reset_failures(&self, user_id: Uuid) -> Result<(), AuthError> {
        sqlx::query(
            "UPDATE credentials SET failed_login_attempts = 0, locked_until = NULL WHERE user_id = $1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_password(&self, user_id: Uuid, password_hash: &str) -> Result<(), AuthError> {
        sqlx::query(
            r#"
            UPDATE credentials
            SET password_hash = $2, password_changed_at = $3,
                failed_login_attempts = 0, locked_until = NULL
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(password_hash)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tenants

pub struct PgTenantRepository {
    pool: PgPool,
}

impl PgTenantRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_tenant(row: &PgRow) -> Result<Tenant, AuthError> {
    let status: String = row.get("status");
    Ok(Tenant {
        id: row.get("id"),
        name: row.get("name"),
        domain: row.get("domain"),
        status: parse_field(TenantStatus::parse(&status), "status")?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    })
}

#[async_trait]
impl TenantRepository for PgTenantRepository {
    async fn create(&self, tenant: &Tenant) -> Result<(), AuthError> {
        sqlx::query(
            r#"
            INSERT INTO tenants (id, name, domain, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(tenant.id)
        .bind(&tenant.name)
        .bind(&tenant.domain)
        .bind(tenant.status.as_str())
        .bind(tenant.created_at)
        .bind(tenant.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AuthError::Conflict(format!("domain '{}' already registered", tenant.domain))
            }
            _ => AuthError::from(e),
        })?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Tenant>, AuthError> {
        let row = sqlx::query("SELECT * FROM tenants WHERE id = $1 AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_tenant).transpose()
    }

    async fn find_by_domain(&self, domain: &str) -> Result<Option<Tenant>, AuthError> {
        let row = sqlx::query("SELECT * FROM tenants WHERE domain = $1 AND deleted_at IS NULL")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_tenant).transpose()
    }

    async fn get_token_settings(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<TenantTokenSettings>, AuthError> {
        let row = sqlx::query("SELECT settings FROM tenant_token_settings WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let settings: serde_json::Value = row.get("settings");
            serde_json::from_value(settings)
                .map_err(|e| AuthError::Internal(format!("bad tenant token settings: {}", e)))
        })
        .transpose()
    }

    async fn upsert_token_settings(
        &self,
        tenant_id: Uuid,
        settings: &TenantTokenSettings,
    ) -> Result<(), AuthError> {
        let value = serde_json::to_value(settings)
            .map_err(|e| AuthError::Internal(format!("serialise tenant token settings: {}", e)))?;
        sqlx::query(
            r#"
            INSERT INTO tenant_token_settings (tenant_id, settings)
            VALUES ($1, $2)
            ON CONFLICT (tenant_id) DO UPDATE SET settings = EXCLUDED.settings
            "#,
        )
        .bind(tenant_id)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Roles & permissions

pub struct PgRoleRepository {
    pool: PgPool,
}

impl PgRoleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_role(row: &PgRow) -> Result<Role, AuthError> {
    let plane: String = row.get("plane");
    Ok(Role {
        id: row.get("id"),
        plane: parse_field(RolePlane::parse(&plane), "plane")?,
        tenant_id: row.get("tenant_id"),
        name: row.get("name"),
        description: row.get("description"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl RoleRepository for PgRoleRepository {
    async fn create(&self, role: &Role) -> Result<(), AuthError> {
        sqlx::query(
            r#"
            INSERT INTO roles (id, plane, tenant_id, name, description, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(role.id)
        .bind(role.plane.as_str())
        .bind(role.tenant_id)
        .bind(&role.name)
        .bind(&role.description)
        .bind(role.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AuthError::Conflict(format!("role '{}' already exists", role.name))
            }
            _ => AuthError::from(e),
        })?;
        Ok(())
    }

    async fn find_by_name(
        &self,
        tenant_id: Option<Uuid>,
        name: &str,
    ) -> Result<Option<Role>, AuthError> {
        let row = sqlx::query(
            "SELECT * FROM roles WHERE tenant_id IS NOT DISTINCT FROM $1 AND name = $2",
        )
        .bind(tenant_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_role).transpose()
    }

    async fn roles_for_user(&self, user_id: Uuid) -> Result<Vec<Role>, AuthError> {
        let rows = sqlx::query(
            r#"
            SELECT r.* FROM roles r
            JOIN user_roles ur ON ur.role_id = r.id
            WHERE ur.user_id = $1
            ORDER BY r.name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_role).collect()
    }

    async fn permissions_for_user(&self, user_id: Uuid) -> Result<Vec<Permission>, AuthError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT p.id, p.resource, p.action, p.tenant_id
            FROM permissions p
            JOIN role_permissions rp ON rp.permission_id = p.id
            JOIN user_roles ur ON ur.role_id = rp.role_id
            WHERE ur.user_id = $1
            ORDER BY p.resource, p.action
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| Permission {
                id: row.get("id"),
                resource: row.get("resource"),
                action: row.get("action"),
                tenant_id: row.get("tenant_id"),
            })
            .collect())
    }

    async fn assign_role(&self, user: &User, role_id: Uuid) -> Result<(), AuthError> {
        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;

        let row = sqlx::query("SELECT * FROM roles WHERE id = $1 FOR UPDATE")
            .bind(role_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AuthError::NotFound("role not found".to_string()))?;
        let role = row_to_role(&row)?;

        // Plane invariant: tenant principals hold only their own tenant's
        // roles, system principals only system roles.
        let allowed = match user.principal_type {
            PrincipalType::System => role.plane == RolePlane::System,
            PrincipalType::Tenant => {
                role.plane == RolePlane::Tenant && role.tenant_id == user.tenant_id
            }
        };
        if !allowed {
            return Err(AuthError::Conflict(
                "role plane does not match principal".to_string(),
            ));
        }

        sqlx::query(
            "INSERT INTO user_roles (user_id, role_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(user.id)
        .bind(role_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await.map_err(AuthError::from)?;
        Ok(())
    }

    async fn attach_permission(
        &self,
        role_id: Uuid,
        permission: &Permission,
    ) -> Result<(), AuthError> {
        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;
        sqlx::query(
            r#"
            INSERT INTO permissions (id, resource, action, tenant_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (resource, action, tenant_id) DO NOTHING
            "#,
        )
        .bind(permission.id)
        .bind(&permission.resource)
        .bind(&permission.action)
        .bind(permission.tenant_id)
        .execute(&mut *tx)
        .await?;

        let permission_id: Uuid = sqlx::query(
            r#"
            SELECT id FROM permissions
            WHERE resource = $1 AND action = $2 AND tenant_id IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(&permission.resource)
        .bind(&permission.action)
        .bind(permission.tenant_id)
        .fetch_one(&mut *tx)
        .await?
        .get("id");

        sqlx::query(
            r#"
            INSERT INTO role_permissions (role_id, permission_id)
            VALUES ($1, $2) ON CONFLICT DO NOTHING
            "#,
        )
        .bind(role_id)
        .bind(permission_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await.map_err(AuthError::from)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Refresh tokens

pub struct PgRefreshTokenRepository {
    pool: PgPool,
}

impl PgRefreshTokenRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshTokenRepository for PgRefreshTokenRepository {
    async fn insert(&self, token: &RefreshToken) -> Result<(), AuthError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens
                (id, user_id, tenant_id, token_hash, expires_at, revoked_at,
                 remember_me, client_id, mfa_satisfied, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(token.id)
        .bind(token.user_id)
        .bind(token.tenant_id)
        .bind(&token.token_hash)
        .bind(token.expires_at)
        .bind(token.revoked_at)
        .bind(token.remember_me)
        .bind(&token.client_id)
        .bind(token.mfa_satisfied)
        .bind(token.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>, AuthError> {
        let row = sqlx::query("SELECT * FROM refresh_tokens WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_refresh_token))
    }

    async fn rotate(
        &self,
        presented_hash: &str,
        replacement: &RefreshToken,
    ) -> Result<RotateOutcome, AuthError> {
        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;

        // Row lock serialises concurrent refreshes of the same token.
        let row = sqlx::query("SELECT * FROM refresh_tokens WHERE token_hash = $1 FOR UPDATE")
            .bind(presented_hash)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await.map_err(AuthError::from)?;
            return Ok(RotateOutcome::NotFound);
        };
        let presented = row_to_refresh_token(&row);

        if presented.revoked_at.is_some() {
            tx.rollback().await.map_err(AuthError::from)?;
            return Ok(RotateOutcome::AlreadyRevoked(presented));
        }
        let now = Utc::now();
        if now >= presented.expires_at {
            tx.rollback().await.map_err(AuthError::from)?;
            return Ok(RotateOutcome::Expired(presented));
        }

        sqlx::query("UPDATE refresh_tokens SET revoked_at = $2 WHERE id = $1")
            .bind(presented.id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO refresh_tokens
                (id, user_id, tenant_id, token_hash, expires_at, revoked_at,
                 remember_me, client_id, mfa_satisfied, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(replacement.id)
        .bind(replacement.user_id)
        .bind(replacement.tenant_id)
        .bind(&replacement.token_hash)
        .bind(replacement.expires_at)
        .bind(replacement.revoked_at)
        .bind(replacement.remember_me)
        .bind(&replacement.client_id)
        .bind(replacement.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await.map_err(AuthError::from)?;
        Ok(RotateOutcome::Rotated(presented))
    }

    async fn revoke_by_hash(&self, token_hash: &str) -> Result<bool, AuthError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = $2 WHERE token_hash = $1 AND revoked_at IS NULL",
        )
        .bind(token_hash)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64, AuthError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = $2 WHERE user_id = $1 AND revoked_at IS NULL",
        )
        .bind(user_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_all_for_client(&self, client_id: &str) -> Result<u64, AuthError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = $2 WHERE client_id = $1 AND revoked_at IS NULL",
        )
        .bind(client_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_active_for_user(&self, user_id: Uuid) -> Result<i64, AuthError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM refresh_tokens
            WHERE user_id = $1 AND revoked_at IS NULL AND expires_at > $2
            "#,
        )
        .bind(user_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }
}

// ---------------------------------------------------------------------------
// Capabilities

pub struct PgCapabilityRepository {
    pool: PgPool,
}

impl PgCapabilityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CapabilityRepository for PgCapabilityRepository {
    async fn get_system(&self, key: &str) -> Result<Option<SystemCapability>, AuthError> {
        let row = sqlx::query("SELECT * FROM system_capabilities WHERE capability_key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| SystemCapability {
            capability_key: row.get("capability_key"),
            enabled: row.get("enabled"),
            default_value: row.get("default_value"),
        }))
    }

    async fn upsert_system(&self, capability: &SystemCapability) -> Result<(), AuthError> {
        sqlx::query(
            r#"
            INSERT INTO system_capabilities (capability_key, enabled, default_value)
            VALUES ($1, $2, $3)
            ON CONFLICT (capability_key) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                default_value = EXCLUDED.default_value
            "#,
        )
        .bind(&capability.capability_key)
        .bind(capability.enabled)
        .bind(&capability.default_value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_tenant(
        &self,
        tenant_id: Uuid,
        key: &str,
    ) -> Result<Option<TenantCapability>, AuthError> {
        let row = sqlx::query(
            "SELECT * FROM tenant_capabilities WHERE tenant_id = $1 AND capability_key = $2",
        )
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| TenantCapability {
            tenant_id: row.get("tenant_id"),
            capability_key: row.get("capability_key"),
            enabled: row.get("enabled"),
            value: row.get("value"),
        }))
    }

    async fn upsert_tenant(&self, capability: &TenantCapability) -> Result<(), AuthError> {
        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;

        if capability.enabled {
            // Invariant: tenant assignment may only be enabled while the
            // system layer supports the key.
            let system_enabled: Option<bool> = sqlx::query(
                "SELECT enabled FROM system_capabilities WHERE capability_key = $1 FOR UPDATE",
            )
            .bind(&capability.capability_key)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.get("enabled"));

            if system_enabled != Some(true) {
                tx.rollback().await.map_err(AuthError::from)?;
                return Err(AuthError::Conflict("not supported".to_string()));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO tenant_capabilities (tenant_id, capability_key, enabled, value)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, capability_key) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                value = EXCLUDED.value
            "#,
        )
        .bind(capability.tenant_id)
        .bind(&capability.capability_key)
        .bind(capability.enabled)
        .bind(&capability.value)
        .execute(&mut *tx)
        .await?;

        tx.commit().await.map_err(AuthError::from)?;
        Ok(())
    }

    async fn get_feature(
        &self,
        tenant_id: Uuid,
        key: &str,
    ) -> Result<Option<TenantFeatureEnablement>, AuthError> {
        let row = sqlx::query(
            "SELECT * FROM tenant_feature_enablements WHERE tenant_id = $1 AND feature_key = $2",
        )
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| TenantFeatureEnablement {
            tenant_id: row.get("tenant_id"),
            feature_key: row.get("feature_key"),
            enabled: row.get("enabled"),
            configuration: row.get("configuration"),
        }))
    }

    async fn upsert_feature(&self, feature: &TenantFeatureEnablement) -> Result<(), AuthError> {
        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;

        if feature.enabled {
            // Invariant: enablement requires a live tenant assignment, which
            // in turn is only effective while the system layer supports the
            // key.
            let allowed: Option<bool> = sqlx::query(
                r#"
                SELECT (tc.enabled AND sc.enabled) AS allowed
                FROM tenant_capabilities tc
                JOIN system_capabilities sc ON sc.capability_key = tc.capability_key
                WHERE tc.tenant_id = $1 AND tc.capability_key = $2
                FOR UPDATE OF tc
                "#,
            )
            .bind(feature.tenant_id)
            .bind(&feature.feature_key)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.get("allowed"));

            if allowed != Some(true) {
                tx.rollback().await.map_err(AuthError::from)?;
                return Err(AuthError::Conflict("not allowed for tenant".to_string()));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO tenant_feature_enablements (tenant_id, feature_key, enabled, configuration)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, feature_key) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                configuration = EXCLUDED.configuration
            "#,
        )
        .bind(feature.tenant_id)
        .bind(&feature.feature_key)
        .bind(feature.enabled)
        .bind(&feature.configuration)
        .execute(&mut *tx)
        .await?;

        tx.commit().await.map_err(AuthError::from)?;
        Ok(())
    }

    async fn get_user_state(
        &self,
        user_id: Uuid,
        key: &str,
    ) -> Result<Option<UserCapabilityState>, AuthError> {
        let row = sqlx::query(
            "SELECT * FROM user_capability_states WHERE user_id = $1 AND capability_key = $2",
        )
        .bind(user_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| UserCapabilityState {
            user_id: row.get("user_id"),
            capability_key: row.get("capability_key"),
            enrolled: row.get("enrolled"),
            state_data: row.get("state_data"),
            enrolled_at: row.get("enrolled_at"),
        }))
    }

    async fn upsert_user_state(
        &self,
        user: &User,
        state: &UserCapabilityState,
    ) -> Result<(), AuthError> {
        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;

        // SYSTEM principals bypass the tenant layers.
        if state.enrolled && !user.is_system() {
            let Some(tenant_id) = user.tenant_id else {
                tx.rollback().await.map_err(AuthError::from)?;
                return Err(AuthError::Internal(
                    "tenant principal without tenant".to_string(),
                ));
            };
            let feature_enabled: Option<bool> = sqlx::query(
                r#"
                SELECT enabled FROM tenant_feature_enablements
                WHERE tenant_id = $1 AND feature_key = $2
                FOR UPDATE
                "#,
            )
            .bind(tenant_id)
            .bind(&state.capability_key)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.get("enabled"));

            if feature_enabled != Some(true) {
                tx.rollback().await.map_err(AuthError::from)?;
                return Err(AuthError::Conflict("not enabled by tenant".to_string()));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO user_capability_states
                (user_id, capability_key, enrolled, state_data, enrolled_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, capability_key) DO UPDATE SET
                enrolled = EXCLUDED.enrolled,
                state_data = EXCLUDED.state_data,
                enrolled_at = EXCLUDED.enrolled_at
            "#,
        )
        .bind(state.user_id)
        .bind(&state.capability_key)
        .bind(state.enrolled)
        .bind(&state.state_data)
        .bind(state.enrolled_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await.map_err(AuthError::from)?;
        Ok(())
    }

    async fn snapshot_for_tenant(
        &self,
        tenant_id: Uuid,
    ) -> Result<HashMap<String, TenantCapabilitySnapshot>, AuthError> {
        // One query folds the assignment and enablement layers.
        let rows = sqlx::query(
            r#"
            SELECT tc.capability_key,
                   tc.enabled AS allowed,
                   COALESCE(tfe.enabled, FALSE) AS enabled,
                   tfe.configuration
            FROM tenant_capabilities tc
            LEFT JOIN tenant_feature_enablements tfe
                   ON tfe.tenant_id = tc.tenant_id
                  AND tfe.feature_key = tc.capability_key
            WHERE tc.tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<String, _>("capability_key"),
                    TenantCapabilitySnapshot {
                        allowed: row.get("allowed"),
                        enabled: row.get("enabled"),
                        configuration: row.get("configuration"),
                    },
                )
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Recovery codes

pub struct PgRecoveryCodeRepository {
    pool: PgPool,
}

impl PgRecoveryCodeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecoveryCodeRepository for PgRecoveryCodeRepository {
    async fn replace_for_user(&self, user_id: Uuid, hashes: &[String]) -> Result<(), AuthError> {
        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;
        sqlx::query("DELETE FROM mfa_recovery_codes WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        for hash in hashes {
            sqlx::query(
                r#"
                INSERT INTO mfa_recovery_codes (id, user_id, code_hash, created_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(hash)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await.map_err(AuthError::from)?;
        Ok(())
    }

    async fn list_unused(&self, user_id: Uuid) -> Result<Vec<(Uuid, String)>, AuthError> {
        let rows = sqlx::query(
            "SELECT id, code_hash FROM mfa_recovery_codes WHERE user_id = $1 AND used_at IS NULL",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("id"), row.get("code_hash")))
            .collect())
    }

    async fn mark_used(&self, code_id: Uuid) -> Result<(), AuthError> {
        let result = sqlx::query(
            "UPDATE mfa_recovery_codes SET used_at = $2 WHERE id = $1 AND used_at IS NULL",
        )
        .bind(code_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AuthError::Conflict("recovery code already used".to_string()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// OAuth clients

pub struct PgOAuthClientRepository {
    pool: PgPool,
}

impl PgOAuthClientRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OAuthClientRepository for PgOAuthClientRepository {
    async fn create(&self, client: &OAuthClient) -> Result<(), AuthError> {
        sqlx::query(
            r#"
            INSERT INTO oauth_clients
                (id, tenant_id, client_id, client_secret_hash, redirect_uris,
                 grant_types, scopes, is_confidential, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(client.id)
        .bind(client.tenant_id)
        .bind(&client.client_id)
        .bind(&client.client_secret_hash)
        .bind(&client.redirect_uris)
        .bind(&client.grant_types)
        .bind(&client.scopes)
        .bind(client.is_confidential)
        .bind(client.is_active)
        .bind(client.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_client_id(&self, client_id: &str) -> Result<Option<OAuthClient>, AuthError> {
        let row = sqlx::query("SELECT * FROM oauth_clients WHERE client_id = $1")
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| OAuthClient {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            client_id: row.get("client_id"),
            client_secret_hash: row.get("client_secret_hash"),
            redirect_uris: row.get("redirect_uris"),
            grant_types: row.get("grant_types"),
            scopes: row.get("scopes"),
            is_confidential: row.get("is_confidential"),
            is_active: row.get("is_active"),
            created_at: row.get("created_at"),
        }))
    }
}

// ---------------------------------------------------------------------------
// Federated identities

pub struct PgFederatedIdentityRepository {
    pool: PgPool,
}

impl PgFederatedIdentityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FederatedIdentityRepository for PgFederatedIdentityRepository {
    async fn find(
        &self,
        provider_id: Uuid,
        external_id: &str,
    ) -> Result<Option<FederatedIdentity>, AuthError> {
        let row = sqlx::query(
            "SELECT * FROM federated_identities WHERE provider_id = $1 AND external_id = $2",
        )
        .bind(provider_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| FederatedIdentity {
            id: row.get("id"),
            user_id: row.get("user_id"),
            provider_id: row.get("provider_id"),
            external_id: row.get("external_id"),
            attributes: row.get("attributes"),
            linked_at: row.get("linked_at"),
        }))
    }

    async fn link(&self, identity: &FederatedIdentity) -> Result<(), AuthError> {
        sqlx::query(
            r#"
            INSERT INTO federated_identities
                (id, user_id, provider_id, external_id, attributes, linked_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (provider_id, external_id) DO UPDATE SET
                attributes = EXCLUDED.attributes
            "#,
        )
        .bind(identity.id)
        .bind(identity.user_id)
        .bind(identity.provider_id)
        .bind(&identity.external_id)
        .bind(&identity.attributes)
        .bind(identity.linked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Audit events

pub struct PgAuditEventRepository {
    pool: PgPool,
}

impl PgAuditEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditEventRepository for PgAuditEventRepository {
    async fn insert_batch(&self, events: &[AuditEvent]) -> Result<(), AuthError> {
        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;
        for event in events {
            sqlx::query(
                r#"
                INSERT INTO audit_events
                    (id, event_type, actor_user_id, actor_username, actor_principal_type,
                     target_type, target_id, target_identifier, tenant_id,
                     source_ip, user_agent, timestamp, result, metadata, error)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                "#,
            )
            .bind(event.id)
            .bind(&event.event_type)
            .bind(event.actor.user_id)
            .bind(&event.actor.username)
            .bind(event.actor.principal_type.map(|pt| pt.as_str()))
            .bind(&event.target.target_type)
            .bind(event.target.target_id)
            .bind(&event.target.identifier)
            .bind(event.tenant_id)
            .bind(&event.source_ip)
            .bind(&event.user_agent)
            .bind(event.timestamp)
            .bind(event.result.as_str())
            .bind(&event.metadata)
            .bind(&event.error)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await.map_err(AuthError::from)?;
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, AuthError> {
        let mut builder = sqlx::QueryBuilder::new("SELECT * FROM audit_events WHERE 1=1");
        if let Some(tenant_id) = query.tenant_id {
            builder.push(" AND tenant_id = ").push_bind(tenant_id);
        }
        if let Some(event_type) = &query.event_type {
            builder.push(" AND event_type = ").push_bind(event_type);
        }
        if let Some(actor) = query.actor_user_id {
            builder.push(" AND actor_user_id = ").push_bind(actor);
        }
        if let Some(since) = query.since {
            builder.push(" AND timestamp >= ").push_bind(since);
        }
        if let Some(until) = query.until {
            builder.push(" AND timestamp < ").push_bind(until);
        }
        builder.push(" ORDER BY timestamp DESC");
        builder
            .push(" LIMIT ")
            .push_bind(query.limit.unwrap_or(100).clamp(1, 1000));
        builder
            .push(" OFFSET ")
            .push_bind(query.offset.unwrap_or(0).max(0));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_audit_event).collect()
    }
}

/// Wire every Postgres repository onto one pool.
pub fn build_storage(pool: PgPool) -> super::Storage {
    use std::sync::Arc;
    super::Storage {
        users: Arc::new(PgUserRepository::new(pool.clone())),
        credentials: Arc::new(PgCredentialRepository::new(pool.clone())),
        tenants: Arc::new(PgTenantRepository::new(pool.clone())),
        roles: Arc::new(PgRoleRepository::new(pool.clone())),
        refresh_tokens: Arc::new(PgRefreshTokenRepository::new(pool.clone())),
        capabilities: Arc::new(PgCapabilityRepository::new(pool.clone())),
        recovery_codes: Arc::new(PgRecoveryCodeRepository::new(pool.clone())),
        oauth_clients: Arc::new(PgOAuthClientRepository::new(pool.clone())),
        federated_identities: Arc::new(PgFederatedIdentityRepository::new(pool.clone())),
        audit_events: Arc::new(PgAuditEventRepository::new(pool)),
    }
}

//! Repository interfaces over the primary store. No SQL leaks above this
//! layer: services talk to these traits, and the Postgres implementations
//! own every query. In-memory implementations back development mode and the
//! integration suite.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use uuid::Uuid;

use crate::database::models::{
    AuditEvent, AuditQuery, Credential, FederatedIdentity, OAuthClient, Permission, RefreshToken,
    Role, SystemCapability, Tenant, TenantCapability, TenantFeatureEnablement, User,
    UserCapabilityState,
};
use crate::error::AuthError;
use crate::token::lifetimes::TenantTokenSettings;

/// Outcome of an atomic refresh-token rotation. The Token Service turns
/// `AlreadyRevoked` into the reuse-detection breach response.
#[derive(Debug, Clone)]
pub enum RotateOutcome {
    /// The presented row was live; it is now revoked and the replacement row
    /// is inserted. Carries the old row.
    Rotated(RefreshToken),
    /// The presented row exists but was revoked before this call.
    AlreadyRevoked(RefreshToken),
    /// The presented row exists but is past its expiry.
    Expired(RefreshToken),
    /// No row matches the presented hash.
    NotFound,
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create(&self, user: &User) -> Result<(), AuthError>;
    async fn get(&self, id: Uuid) -> Result<Option<User>, AuthError>;
    /// Plane-aware lookup: `tenant_id = None` searches the SYSTEM namespace.
    async fn find_by_username(
        &self,
        tenant_id: Option<Uuid>,
        username: &str,
    ) -> Result<Option<User>, AuthError>;
    async fn set_totp_secret(
        &self,
        user_id: Uuid,
        secret_enc: Option<Vec<u8>>,
        mfa_enabled: bool,
    ) -> Result<(), AuthError>;
    async fn delete(&self, id: Uuid) -> Result<(), AuthError>;
}

#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn get(&self, user_id: Uuid) -> Result<Option<Credential>, AuthError>;
    async fn upsert(&self, credential: &Credential) -> Result<(), AuthError>;
    /// Atomic `failed_login_attempts + 1`; sets `locked_until` when the new
    /// count reaches `threshold`. Returns the post-increment count.
    async fn record_failure(
        &self,
        user_id: Uuid,
        threshold: i32,
        lock_for: Duration,
    ) -> Result<i32, AuthError>;
    async fn reset_failures(&self, user_id: Uuid) -> Result<(), AuthError>;
    async fn set_password(&self, user_id: Uuid, password_hash: &str) -> Result<(), AuthError>;
}

#[async_trait]
pub trait TenantRepository: Send + Sync {
    async fn create(&self, tenant: &Tenant) -> Result<(), AuthError>;
    async fn get(&self, id: Uuid) -> Result<Option<Tenant>, AuthError>;
    async fn find_by_domain(&self, domain: &str) -> Result<Option<Tenant>, AuthError>;
    async fn get_token_settings(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<TenantTokenSettings>, AuthError>;
    async fn upsert_token_settings(
        &self,
        tenant_id: Uuid,
        settings: &TenantTokenSettings,
    ) -> Result<(), AuthError>;
}

#[async_trait]
pub trait RoleRepository: Send + Sync {
    async fn create(&self, role: &Role) -> Result<(), AuthError>;
    /// `tenant_id = None` searches the system-plane namespace.
    async fn find_by_name(
        &self,
        tenant_id: Option<Uuid>,
        name: &str,
    ) -> Result<Option<Role>, AuthError>;
    async fn roles_for_user(&self, user_id: Uuid) -> Result<Vec<Role>, AuthError>;
    /// Union of permissions across the user's roles, deduplicated.
    async fn permissions_for_user(&self, user_id: Uuid) -> Result<Vec<Permission>, AuthError>;
    /// Binds a role to a user. The plane invariant (tenant principals hold
    /// only their own tenant's roles, system principals only system roles)
    /// is checked inside the same transaction as the insert.
    async fn assign_role(&self, user: &User, role_id: Uuid) -> Result<(), AuthError>;
    async fn attach_permission(&self, role_id: Uuid, permission: &Permission)
        -> Result<(), AuthError>;
}

#[async_trait]
pub trait RefreshTokenRepository: Send + Sync {
    async fn insert(&self, token: &RefreshToken) -> Result<(), AuthError>;
    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>, AuthError>;
    /// Atomically revoke the presented row and insert its replacement.
    /// Serialised per row (Postgres: `SELECT ... FOR UPDATE`), so concurrent
    /// rotations of the same token are linearised: exactly one caller
    /// observes `Rotated`.
    async fn rotate(
        &self,
        presented_hash: &str,
        replacement: &RefreshToken,
    ) -> Result<RotateOutcome, AuthError>;
    async fn revoke_by_hash(&self, token_hash: &str) -> Result<bool, AuthError>;
    /// Revoke every live token of a principal. Idempotent; returns the number
    /// of rows newly revoked.
    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64, AuthError>;
    async fn revoke_all_for_client(&self, client_id: &str) -> Result<u64, AuthError>;
    async fn count_active_for_user(&self, user_id: Uuid) -> Result<i64, AuthError>;
}

/// Bulk row for the claims builder: one entry per capability key a tenant has
/// assigned, with its enablement folded in.
#[derive(Debug, Clone)]
pub struct TenantCapabilitySnapshot {
    pub allowed: bool,
    pub enabled: bool,
    pub configuration: Option<serde_json::Value>,
}

#[async_trait]
pub trait CapabilityRepository: Send + Sync {
    async fn get_system(&self, key: &str) -> Result<Option<SystemCapability>, AuthError>;
    async fn upsert_system(&self, capability: &SystemCapability) -> Result<(), AuthError>;

    async fn get_tenant(
        &self,
        tenant_id: Uuid,
        key: &str,
    ) -> Result<Option<TenantCapability>, AuthError>;
    /// Fails with `Conflict` when the system layer does not allow the key
    /// (invariant C1), checked in the same transaction as the write.
    async fn upsert_tenant(&self, capability: &TenantCapability) -> Result<(), AuthError>;

    async fn get_feature(
        &self,
        tenant_id: Uuid,
        key: &str,
    ) -> Result<Option<TenantFeatureEnablement>, AuthError>;
    /// Fails with `Conflict` when the tenant layer does not allow the key
    /// (invariant C2).
    async fn upsert_feature(&self, feature: &TenantFeatureEnablement) -> Result<(), AuthError>;

    async fn get_user_state(
        &self,
        user_id: Uuid,
        key: &str,
    ) -> Result<Option<UserCapabilityState>, AuthError>;
    /// Fails with `Conflict` when the feature layer is not enabled for the
    /// user's tenant (invariant C3). SYSTEM principals bypass the check.
    async fn upsert_user_state(
        &self,
        user: &User,
        state: &UserCapabilityState,
    ) -> Result<(), AuthError>;

    /// Single-query bulk read used by the claims builder: every assigned key
    /// for the tenant with its enablement state.
    async fn snapshot_for_tenant(
        &self,
        tenant_id: Uuid,
    ) -> Result<HashMap<String, TenantCapabilitySnapshot>, AuthError>;
}

#[async_trait]
pub trait RecoveryCodeRepository: Send + Sync {
    /// Replace the user's whole batch; old codes become unusable.
    async fn replace_for_user(&self, user_id: Uuid, hashes: &[String]) -> Result<(), AuthError>;
    /// Unused codes only: `(code_id, bcrypt_hash)`.
    async fn list_unused(&self, user_id: Uuid) -> Result<Vec<(Uuid, String)>, AuthError>;
    /// Single-use enforcement: marks `used_at = now`, failing if already used.
    async fn mark_used(&self, code_id: Uuid) -> Result<(), AuthError>;
}

#[async_trait]
pub trait FederatedIdentityRepository: Send + Sync {
    async fn find(
        &self,
        provider_id: Uuid,
        external_id: &str,
    ) -> Result<Option<FederatedIdentity>, AuthError>;
    async fn link(&self, identity: &FederatedIdentity) -> Result<(), AuthError>;
}

#[async_trait]
pub trait OAuthClientRepository: Send + Sync {
    async fn create(&self, client: &OAuthClient) -> Result<(), AuthError>;
    async fn find_by_client_id(&self, client_id: &str) -> Result<Option<OAuthClient>, AuthError>;
}

#[async_trait]
pub trait AuditEventRepository: Send + Sync {
    async fn insert_batch(&self, events: &[AuditEvent]) -> Result<(), AuthError>;
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, AuthError>;
}

/// Aggregate handed to services: one `Arc` per repository.
#[derive(Clone)]
pub struct Storage {
    pub users: Arc<dyn UserRepository>,
    pub credentials: Arc<dyn CredentialRepository>,
    pub tenants: Arc<dyn TenantRepository>,
    pub roles: Arc<dyn RoleRepository>,
    pub refresh_tokens: Arc<dyn RefreshTokenRepository>,
    pub capabilities: Arc<dyn CapabilityRepository>,
    pub recovery_codes: Arc<dyn RecoveryCodeRepository>,
    pub oauth_clients: Arc<dyn OAuthClientRepository>,
    pub federated_identities: Arc<dyn FederatedIdentityRepository>,
    pub audit_events: Arc<dyn AuditEventRepository>,
}

/// Validity helper shared by both backends.
pub(crate) fn token_is_live(token: &RefreshToken, now: DateTime<Utc>) -> bool {
    token.revoked_at.is_none() && now < token.expires_at
}

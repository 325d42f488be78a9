//! In-memory repositories with the same semantics as the Postgres backend.
//! They back development mode without a database and make the integration
//! suite self-contained. Every map sits behind a mutex wide enough that the
//! invariant checks the Postgres side does transactionally stay atomic here.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::database::models::{
    AuditEvent, AuditQuery, Credential, FederatedIdentity, OAuthClient, Permission, PrincipalType,
    RefreshToken, Role, RolePlane, SystemCapability, Tenant, TenantCapability,
    TenantFeatureEnablement, User, UserCapabilityState,
};
use crate::error::AuthError;
use crate::token::lifetimes::TenantTokenSettings;

use super::{
    token_is_live, AuditEventRepository, CapabilityRepository, CredentialRepository,
    FederatedIdentityRepository, OAuthClientRepository, RecoveryCodeRepository,
    RefreshTokenRepository, RoleRepository, RotateOutcome, Storage, TenantCapabilitySnapshot,
    TenantRepository, UserRepository,
};

#[derive(Default)]
struct CapabilityTables {
    system: HashMap<String, SystemCapability>,
    tenant: HashMap<(Uuid, String), TenantCapability>,
    features: HashMap<(Uuid, String), TenantFeatureEnablement>,
    user_states: HashMap<(Uuid, String), UserCapabilityState>,
}

#[derive(Clone)]
struct RecoveryCodeRow {
    user_id: Uuid,
    code_hash: String,
    used_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<HashMap<Uuid, User>>,
    credentials: Mutex<HashMap<Uuid, Credential>>,
    tenants: Mutex<HashMap<Uuid, Tenant>>,
    tenant_token_settings: Mutex<HashMap<Uuid, TenantTokenSettings>>,
    roles: Mutex<HashMap<Uuid, Role>>,
    user_roles: Mutex<HashMap<Uuid, HashSet<Uuid>>>,
    role_permissions: Mutex<HashMap<Uuid, Vec<Permission>>>,
    refresh_tokens: Mutex<HashMap<String, RefreshToken>>,
    capabilities: Mutex<CapabilityTables>,
    recovery_codes: Mutex<HashMap<Uuid, RecoveryCodeRow>>,
    oauth_clients: Mutex<HashMap<String, OAuthClient>>,
    federated_identities: Mutex<HashMap<(Uuid, String), FederatedIdentity>>,
    audit_events: Mutex<Vec<AuditEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> Result<std::sync::MutexGuard<'a, T>, AuthError> {
    mutex
        .lock()
        .map_err(|_| AuthError::Internal("store mutex poisoned".to_string()))
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn create(&self, user: &User) -> Result<(), AuthError> {
        if !user.plane_is_consistent() {
            return Err(AuthError::InputInvalid(
                "principal plane does not match tenant binding".to_string(),
            ));
        }
        let mut users = lock(&self.users)?;
        let taken = users.values().any(|existing| {
            existing.deleted_at.is_none()
                && existing.tenant_id == user.tenant_id
                && (existing.username == user.username || existing.email == user.email)
        });
        if taken {
            return Err(AuthError::Conflict(
                "username or email already taken".to_string(),
            ));
        }
        users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<User>, AuthError> {
        let users = lock(&self.users)?;
        Ok(users.get(&id).filter(|u| u.deleted_at.is_none()).cloned())
    }

    async fn find_by_username(
        &self,
        tenant_id: Option<Uuid>,
        username: &str,
    ) -> Result<Option<User>, AuthError> {
        let users = lock(&self.users)?;
        Ok(users
            .values()
            .find(|u| {
                u.deleted_at.is_none() && u.tenant_id == tenant_id && u.username == username
            })
            .cloned())
    }

    async fn set_totp_secret(
        &self,
        user_id: Uuid,
        secret_enc: Option<Vec<u8>>,
        mfa_enabled: bool,
    ) -> Result<(), AuthError> {
        let mut users = lock(&self.users)?;
        if let Some(user) = users.get_mut(&user_id) {
            user.totp_secret_enc = secret_enc;
            user.mfa_enabled = mfa_enabled;
            user.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), AuthError> {
        let now = Utc::now();
        if let Some(user) = lock(&self.users)?.get_mut(&id) {
            user.deleted_at = Some(now);
        }
        lock(&self.credentials)?.remove(&id);
        for token in lock(&self.refresh_tokens)?.values_mut() {
            if token.user_id == id && token.revoked_at.is_none() {
                token.revoked_at = Some(now);
            }
        }
        lock(&self.capabilities)?
            .user_states
            .retain(|(user_id, _), _| *user_id != id);
        lock(&self.recovery_codes)?.retain(|_, row| row.user_id != id);
        Ok(())
    }
}

#[async_trait]
impl CredentialRepository for MemoryStore {
    async fn get(&self, user_id: Uuid) -> Result<Option<Credential>, AuthError> {
        Ok(lock(&self.credentials)?.get(&user_id).cloned())
    }

    async fn upsert(&self, credential: &Credential) -> Result<(), AuthError> {
        lock(&self.credentials)?.insert(credential.user_id, credential.clone());
        Ok(())
    }

    async fn record_failure(
        &self,
        user_id: Uuid,
        threshold: i32,
        lock_for: Duration,
    ) -> Result<i32, AuthError> {
        let mut credentials = lock(&self.credentials)?;
        let credential = credentials
            .get_mut(&user_id)
            .ok_or_else(|| AuthError::NotFound("credential not found".to_string()))?;
        credential.failed_login_attempts += 1;
        if credential.failed_login_attempts >= threshold {
            credential.locked_until = Some(Utc::now() + lock_for);
        }
        Ok(credential.failed_login_attempts)
    }

    async fn reset_failures(&self, user_id: Uuid) -> Result<(), AuthError> {
        if let Some(credential) = lock(&self.credentials)?.get_mut(&user_id) {
            credential.failed_login_attempts = 0;
            credential.locked_until = None;
        }
        Ok(())
    }

    async fn set_password(&self, user_id: Uuid, password_hash: &str) -> Result<(), AuthError> {
        if let Some(credential) = lock(&self.credentials)?.get_mut(&user_id) {
            credential.password_hash = password_hash.to_string();
            credential.password_changed_at = Utc::now();
            credential.failed_login_attempts = 0;
            credential.locked_until = None;
        }
        Ok(())
    }
}

#[async_trait]
impl TenantRepository for MemoryStore {
    async fn create(&self, tenant: &Tenant) -> Result<(), AuthError> {
        let mut tenants = lock(&self.tenants)?;
        if tenants
            .values()
            .any(|t| t.deleted_at.is_none() && t.domain == tenant.domain)
        {
            return Err(AuthError::Conflict(format!(
                "domain '{}' already registered",
                tenant.domain
            )));
        }
        tenants.insert(tenant.id, tenant.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Tenant>, AuthError> {
        Ok(lock(&self.tenants)?
            .get(&id)
            .filter(|t| t.deleted_at.is_none())
            .cloned())
    }

    async fn find_by_domain(&self, domain: &str) -> Result<Option<Tenant>, AuthError> {
        Ok(lock(&self.tenants)?
            .values()
            .find(|t| t.deleted_at.is_none() && t.domain == domain)
            .cloned())
    }

    async fn get_token_settings(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<TenantTokenSettings>, AuthError> {
        Ok(lock(&self.tenant_token_settings)?.get(&tenant_id).cloned())
    }

    async fn upsert_token_settings(
        &self,
        tenant_id: Uuid,
        settings: &TenantTokenSettings,
    ) -> Result<(), AuthError> {
        lock(&self.tenant_token_settings)?.insert(tenant_id, settings.clone());
        Ok(())
    }
}

#[async_trait]
impl RoleRepository for MemoryStore {
    async fn create(&self, role: &Role) -> Result<(), AuthError> {
        let mut roles = lock(&self.roles)?;
        if roles
            .values()
            .any(|r| r.tenant_id == role.tenant_id && r.name == role.name)
        {
            return Err(AuthError::Conflict(format!(
                "role '{}' already exists",
                role.name
            )));
        }
        roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn find_by_name(
        &self,
        tenant_id: Option<Uuid>,
        name: &str,
    ) -> Result<Option<Role>, AuthError> {
        Ok(lock(&self.roles)?
            .values()
            .find(|r| r.tenant_id == tenant_id && r.name == name)
            .cloned())
    }

    async fn roles_for_user(&self, user_id: Uuid) -> Result<Vec<Role>, AuthError> {
        let bindings = lock(&self.user_roles)?;
        let roles = lock(&self.roles)?;
        let mut out: Vec<Role> = bindings
            .get(&user_id)
            .map(|ids| ids.iter().filter_map(|id| roles.get(id).cloned()).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn permissions_for_user(&self, user_id: Uuid) -> Result<Vec<Permission>, AuthError> {
        let bindings = lock(&self.user_roles)?;
        let role_permissions = lock(&self.role_permissions)?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        if let Some(role_ids) = bindings.get(&user_id) {
            for role_id in role_ids {
                for permission in role_permissions.get(role_id).into_iter().flatten() {
                    if seen.insert((permission.resource.clone(), permission.action.clone())) {
                        out.push(permission.clone());
                    }
                }
            }
        }
        out.sort_by(|a, b| a.as_claim().cmp(&b.as_claim()));
        Ok(out)
    }

    async fn assign_role(&self, user: &User, role_id: Uuid) -> Result<(), AuthError> {
        let roles = lock(&self.roles)?;
        let role = roles
            .get(&role_id)
            .ok_or_else(|| AuthError::NotFound("role not found".to_string()))?;
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
        drop(roles);
        lock(&self.user_roles)?
            .entry(user.id)
            .or_default()
            .insert(role_id);
        Ok(())
    }

    async fn attach_permission(
        &self,
        role_id: Uuid,
        permission: &Permission,
    ) -> Result<(), AuthError> {
        let mut role_permissions = lock(&self.role_permissions)?;
        let list = role_permissions.entry(role_id).or_default();
        if !list
            .iter()
            .any(|p| p.resource == permission.resource && p.action == permission.action)
        {
            list.push(permission.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl RefreshTokenRepository for MemoryStore {
    async fn insert(&self, token: &RefreshToken) -> Result<(), AuthError> {
        lock(&self.refresh_tokens)?.insert(token.token_hash.clone(), token.clone());
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>, AuthError> {
        Ok(lock(&self.refresh_tokens)?.get(token_hash).cloned())
    }

    async fn rotate(
        &self,
        presented_hash: &str,
        replacement: &RefreshToken,
    ) -> Result<RotateOutcome, AuthError> {
        // Whole-map mutex linearises concurrent rotations of the same token.
        let mut tokens = lock(&self.refresh_tokens)?;
        let Some(presented) = tokens.get(presented_hash).cloned() else {
            return Ok(RotateOutcome::NotFound);
        };
        if presented.revoked_at.is_some() {
            return Ok(RotateOutcome::AlreadyRevoked(presented));
        }
        let now = Utc::now();
        if now >= presented.expires_at {
            return Ok(RotateOutcome::Expired(presented));
        }
        if let Some(row) = tokens.get_mut(presented_hash) {
            row.revoked_at = Some(now);
        }
        tokens.insert(replacement.token_hash.clone(), replacement.clone());
        Ok(RotateOutcome::Rotated(presented))
    }

    async fn revoke_by_hash(&self, token_hash: &str) -> Result<bool, AuthError> {
        let mut tokens = lock(&self.refresh_tokens)?;
        if let Some(token) = tokens.get_mut(token_hash) {
            if token.revoked_at.is_none() {
                token.revoked_at = Some(Utc::now());
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64, AuthError> {
        let mut tokens = lock(&self.refresh_tokens)?;
        let now = Utc::now();
        let mut revoked = 0;
        for token in tokens.values_mut() {
            if token.user_id == user_id && token.revoked_at.is_none() {
                token.revoked_at = Some(now);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn revoke_all_for_client(&self, client_id: &str) -> Result<u64, AuthError> {
        let mut tokens = lock(&self.refresh_tokens)?;
        let now = Utc::now();
        let mut revoked = 0;
        for token in tokens.values_mut() {
            if token.client_id.as_deref() == Some(client_id) && token.revoked_at.is_none() {
                token.revoked_at = Some(now);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn count_active_for_user(&self, user_id: Uuid) -> Result<i64, AuthError> {
        let tokens = lock(&self.refresh_tokens)?;
        let now = Utc::now();
        Ok(tokens
            .values()
            .filter(|t| t.user_id == user_id && token_is_live(t, now))
            .count() as i64)
    }
}

#[async_trait]
impl CapabilityRepository for MemoryStore {
    async fn get_system(&self, key: &str) -> Result<Option<SystemCapability>, AuthError> {
        Ok(lock(&self.capabilities)?.system.get(key).cloned())
    }

    async fn upsert_system(&self, capability: &SystemCapability) -> Result<(), AuthError> {
        lock(&self.capabilities)?
            .system
            .insert(capability.capability_key.clone(), capability.clone());
        Ok(())
    }

    async fn get_tenant(
        &self,
        tenant_id: Uuid,
        key: &str,
    ) -> Result<Option<TenantCapability>, AuthError> {
        Ok(lock(&self.capabilities)?
            .tenant
            .get(&(tenant_id, key.to_string()))
            .cloned())
    }

    async fn upsert_tenant(&self, capability: &TenantCapability) -> Result<(), AuthError> {
        let mut tables = lock(&self.capabilities)?;
        if capability.enabled {
            let supported = tables
                .system
                .get(&capability.capability_key)
                .is_some_and(|c| c.enabled);
            if !supported {
                return Err(AuthError::Conflict("not supported".to_string()));
            }
        }
        tables.tenant.insert(
            (capability.tenant_id, capability.capability_key.clone()),
            capability.clone(),
        );
        Ok(())
    }

    async fn get_feature(
        &self,
        tenant_id: Uuid,
        key: &str,
    ) -> Result<Option<TenantFeatureEnablement>, AuthError> {
        Ok(lock(&self.capabilities)?
            .features
            .get(&(tenant_id, key.to_string()))
            .cloned())
    }

    async fn upsert_feature(&self, feature: &TenantFeatureEnablement) -> Result<(), AuthError> {
        let mut tables = lock(&self.capabilities)?;
        if feature.enabled {
            let allowed = tables
                .tenant
                .get(&(feature.tenant_id, feature.feature_key.clone()))
                .is_some_and(|c| c.enabled)
                && tables
                    .system
                    .get(&feature.feature_key)
                    .is_some_and(|c| c.enabled);
            if !allowed {
                return Err(AuthError::Conflict("not allowed for tenant".to_string()));
            }
        }
        tables.features.insert(
            (feature.tenant_id, feature.feature_key.clone()),
            feature.clone(),
        );
        Ok(())
    }

    async fn get_user_state(
        &self,
        user_id: Uuid,
        key: &str,
    ) -> Result<Option<UserCapabilityState>, AuthError> {
        Ok(lock(&self.capabilities)?
            .user_states
            .get(&(user_id, key.to_string()))
            .cloned())
    }

    async fn upsert_user_state(
        &self,
        user: &User,
        state: &UserCapabilityState,
    ) -> Result<(), AuthError> {
        let mut tables = lock(&self.capabilities)?;
        if state.enrolled && !user.is_system() {
            let tenant_id = user
                .tenant_id
                .ok_or_else(|| AuthError::Internal("tenant principal without tenant".to_string()))?;
            let enabled = tables
                .features
                .get(&(tenant_id, state.capability_key.clone()))
                .is_some_and(|f| f.enabled);
            if !enabled {
                return Err(AuthError::Conflict("not enabled by tenant".to_string()));
            }
        }
        tables.user_states.insert(
            (state.user_id, state.capability_key.clone()),
            state.clone(),
        );
        Ok(())
    }

    async fn snapshot_for_tenant(
        &self,
        tenant_id: Uuid,
    ) -> Result<HashMap<String, TenantCapabilitySnapshot>, AuthError> {
        let tables = lock(&self.capabilities)?;
        Ok(tables
            .tenant
            .iter()
            .filter(|((id, _), _)| *id == tenant_id)
            .map(|((_, key), capability)| {
                let feature = tables.features.get(&(tenant_id, key.clone()));
                (
                    key.clone(),
                    TenantCapabilitySnapshot {
                        allowed: capability.enabled,
                        enabled: feature.is_some_and(|f| f.enabled),
                        configuration: feature.and_then(|f| f.configuration.clone()),
                    },
                )
            })
            .collect())
    }
}

#[async_trait]
impl RecoveryCodeRepository for MemoryStore {
    async fn replace_for_user(&self, user_id: Uuid, hashes: &[String]) -> Result<(), AuthError> {
        let mut codes = lock(&self.recovery_codes)?;
        codes.retain(|_, row| row.user_id != user_id);
        for hash in hashes {
            codes.insert(
                Uuid::new_v4(),
                RecoveryCodeRow {
                    user_id,
                    code_hash: hash.clone(),
                    used_at: None,
                },
            );
        }
        Ok(())
    }

    async fn list_unused(&self, user_id: Uuid) -> Result<Vec<(Uuid, String)>, AuthError> {
        Ok(lock(&self.recovery_codes)?
            .iter()
            .filter(|(_, row)| row.user_id == user_id && row.used_at.is_none())
            .map(|(id, row)| (*id, row.code_hash.clone()))
            .collect())
    }

    async fn mark_used(&self, code_id: Uuid) -> Result<(), AuthError> {
        let mut codes = lock(&self.recovery_codes)?;
        match codes.get_mut(&code_id) {
            Some(row) if row.used_at.is_none() => {
                row.used_at = Some(Utc::now());
                Ok(())
            }
            _ => Err(AuthError::Conflict("recovery code already used".to_string())),
        }
    }
}

#[async_trait]
impl OAuthClientRepository for MemoryStore {
    async fn create(&self, client: &OAuthClient) -> Result<(), AuthError> {
        lock(&self.oauth_clients)?.insert(client.client_id.clone(), client.clone());
        Ok(())
    }

    async fn find_by_client_id(&self, client_id: &str) -> Result<Option<OAuthClient>, AuthError> {
        Ok(lock(&self.oauth_clients)?.get(client_id).cloned())
    }
}

#[async_trait]
impl FederatedIdentityRepository for MemoryStore {
    async fn find(
        &self,
        provider_id: Uuid,
        external_id: &str,
    ) -> Result<Option<FederatedIdentity>, AuthError> {
        Ok(lock(&self.federated_identities)?
            .get(&(provider_id, external_id.to_string()))
            .cloned())
    }

    async fn link(&self, identity: &FederatedIdentity) -> Result<(), AuthError> {
        lock(&self.federated_identities)?.insert(
            (identity.provider_id, identity.external_id.clone()),
            identity.clone(),
        );
        Ok(())
    }
}

#[async_trait]
impl AuditEventRepository for MemoryStore {
    async fn insert_batch(&self, events: &[AuditEvent]) -> Result<(), AuthError> {
        lock(&self.audit_events)?.extend_from_slice(events);
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, AuthError> {
        let events = lock(&self.audit_events)?;
        let mut out: Vec<AuditEvent> = events
            .iter()
            .filter(|e| query.tenant_id.is_none() || e.tenant_id == query.tenant_id)
            .filter(|e| {
                query
                    .event_type
                    .as_deref()
                    .map_or(true, |t| e.event_type == t)
            })
            .filter(|e| {
                query
                    .actor_user_id
                    .map_or(true, |id| e.actor.user_id == Some(id))
            })
            .filter(|e| query.since.map_or(true, |since| e.timestamp >= since))
            .filter(|e| query.until.map_or(true, |until| e.timestamp < until))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let offset = query.offset.unwrap_or(0).max(0) as usize;
        let limit = query.limit.unwrap_or(100).clamp(1, 1000) as usize;
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }
}

/// Wire every repository onto one shared in-memory store.
pub fn build_storage() -> Storage {
    let store = Arc::new(MemoryStore::new());
    Storage {
        users: store.clone(),
        credentials: store.clone(),
        tenants: store.clone(),
        roles: store.clone(),
        refresh_tokens: store.clone(),
        capabilities: store.clone(),
        recovery_codes: store.clone(),
        oauth_clients: store.clone(),
        federated_identities: store.clone(),
        audit_events: store,
    }
}

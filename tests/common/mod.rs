//! Shared fixture for the integration suite: a real server on a random port
//! over in-memory storage and cache, driven with reqwest.

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use tessera_iam::auth::CredentialVerifier;
use tessera_iam::cache::MemoryCache;
use tessera_iam::config::AppConfig;
use tessera_iam::database::models::{
    Permission, PrincipalType, Role, RolePlane, Tenant, TenantStatus, User, UserStatus,
};
use tessera_iam::handlers;
use tessera_iam::state::AppState;
use tessera_iam::storage::memory;

pub struct TestServer {
    pub base_url: String,
    pub state: AppState,
    // Keeps the audit worker alive for the duration of the test.
    _audit: tessera_iam::audit::AuditPipeline,
}

/// Boot the app on an ephemeral port with in-memory backends and the system
/// catalog seeded.
pub async fn spawn_server() -> Result<TestServer> {
    let config = AppConfig::development();
    let storage = memory::build_storage();
    let cache = Arc::new(MemoryCache::new());
    let (state, pipeline) = AppState::build(config, storage, cache)
        .map_err(|e| anyhow::anyhow!("state build failed: {}", e))?;

    let credentials = CredentialVerifier::new(state.storage.clone(), 5, 15);
    tessera_iam::seed::seed(&state.storage, &credentials, None)
        .await
        .map_err(|e| anyhow::anyhow!("seed failed: {}", e))?;

    let port = portpicker::pick_unused_port().expect("no free port");
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    let app = handlers::router(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Ok(TestServer {
        base_url: format!("http://127.0.0.1:{}", port),
        state,
        _audit: pipeline,
    })
}

pub async fn create_tenant(state: &AppState, name: &str, domain: &str) -> Tenant {
    let tenant = Tenant {
        id: Uuid::new_v4(),
        name: name.to_string(),
        domain: domain.to_string(),
        status: TenantStatus::Active,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        deleted_at: None,
    };
    state.storage.tenants.create(&tenant).await.unwrap();
    tenant
}

pub async fn create_user(
    state: &AppState,
    tenant_id: Option<Uuid>,
    username: &str,
    password: &str,
) -> User {
    let user = User {
        id: Uuid::new_v4(),
        principal_type: if tenant_id.is_some() {
            PrincipalType::Tenant
        } else {
            PrincipalType::System
        },
        tenant_id,
        username: username.to_string(),
        email: format!("{}@example.com", username),
        status: UserStatus::Active,
        mfa_enabled: false,
        totp_secret_enc: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        deleted_at: None,
    };
    state.storage.users.create(&user).await.unwrap();
    let credentials = CredentialVerifier::new(state.storage.clone(), 5, 15);
    credentials.set_password(user.id, password).await.unwrap();
    user
}

/// Create a role on the user's plane, grant it the permissions, and bind it.
pub async fn grant_role(
    state: &AppState,
    user: &User,
    role_name: &str,
    permissions: &[(&str, &str)],
) {
    let role_id = match state
        .storage
        .roles
        .find_by_name(user.tenant_id, role_name)
        .await
        .unwrap()
    {
        Some(role) => role.id,
        None => {
            let role = Role {
                id: Uuid::new_v4(),
                plane: if user.tenant_id.is_some() {
                    RolePlane::Tenant
                } else {
                    RolePlane::System
                },
                tenant_id: user.tenant_id,
                name: role_name.to_string(),
                description: None,
                created_at: Utc::now(),
            };
            state.storage.roles.create(&role).await.unwrap();
            role.id
        }
    };
    for (resource, action) in permissions {
        state
            .storage
            .roles
            .attach_permission(
                role_id,
                &Permission {
                    id: Uuid::new_v4(),
                    resource: resource.to_string(),
                    action: action.to_string(),
                    tenant_id: user.tenant_id,
                },
            )
            .await
            .unwrap();
    }
    state.storage.roles.assign_role(user, role_id).await.unwrap();
}

/// Walk a capability through system support, tenant assignment and tenant
/// enablement.
pub async fn enable_capability_stack(state: &AppState, tenant_id: Uuid, key: &str) {
    state
        .capabilities
        .set_system_capability(key, true, None)
        .await
        .unwrap();
    state
        .capabilities
        .set_tenant_capability(tenant_id, key, true, None)
        .await
        .unwrap();
    state
        .capabilities
        .set_feature_enablement(tenant_id, key, true, None)
        .await
        .unwrap();
}

/// Decode a JWT payload without verifying, for claim assertions.
pub fn decode_claims(jwt: &str) -> Value {
    let payload = jwt.split('.').nth(1).expect("JWT payload segment");
    let bytes = URL_SAFE_NO_PAD.decode(payload).expect("base64 payload");
    serde_json::from_slice(&bytes).expect("JSON payload")
}

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::database::models::{AuditEvent, AuditResult};
use crate::error::ApiError;
use crate::middleware::{require_permission, require_system_principal, PrincipalContext};
use crate::state::AppState;
use crate::token::Acr;

#[derive(Debug, Deserialize)]
pub struct SystemCapabilityBody {
    pub enabled: bool,
    pub default_value: Option<Value>,
}

/// PUT /system/capabilities/:key - flip the platform-wide capability switch.
pub async fn system_capability_put(
    State(state): State<AppState>,
    Extension(principal): Extension<PrincipalContext>,
    Path(key): Path<String>,
    Json(body): Json<SystemCapabilityBody>,
) -> Result<Json<Value>, ApiError> {
    require_system_principal(&principal)?;
    require_permission(&principal, &state.audit, "capabilities", "manage")?;

    let capability = state
        .capabilities
        .set_system_capability(&key, body.enabled, body.default_value)
        .await
        .map_err(ApiError::from)?;

    state.audit.emit(
        AuditEvent::new("capability.system_set", AuditResult::Success)
            .with_actor(principal.user_id, &principal.username, principal.principal_type)
            .with_metadata(json!({ "key": key, "enabled": body.enabled })),
    );
    Ok(Json(serde_json::to_value(capability).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct TenantCapabilityBody {
    pub enabled: bool,
    pub value: Option<Value>,
}

/// PUT /system/tenants/:tenant_id/capabilities/:key - assign a capability to
/// a tenant. Refused while the system layer does not support the key.
pub async fn tenant_capability_put(
    State(state): State<AppState>,
    Extension(principal): Extension<PrincipalContext>,
    Path((tenant_id, key)): Path<(Uuid, String)>,
    Json(body): Json<TenantCapabilityBody>,
) -> Result<Json<Value>, ApiError> {
    require_system_principal(&principal)?;
    require_permission(&principal, &state.audit, "capabilities", "manage")?;

    let capability = state
        .capabilities
        .set_tenant_capability(tenant_id, &key, body.enabled, body.value)
        .await
        .map_err(ApiError::from)?;

    state.audit.emit(
        AuditEvent::new("capability.tenant_set", AuditResult::Success)
            .with_actor(principal.user_id, &principal.username, principal.principal_type)
            .with_tenant(Some(tenant_id))
            .with_metadata(json!({ "key": key, "enabled": body.enabled })),
    );
    Ok(Json(serde_json::to_value(capability).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct ImpersonateRequest {
    pub user_id: Uuid,
}

/// POST /system/impersonate - issue a token acting as another principal. The
/// issued token carries the `act` claim naming the real administrator.
pub async fn impersonate_post(
    State(state): State<AppState>,
    Extension(principal): Extension<PrincipalContext>,
    Json(request): Json<ImpersonateRequest>,
) -> Result<Json<Value>, ApiError> {
    require_system_principal(&principal)?;
    require_permission(&principal, &state.audit, "impersonation", "use")?;

    let admin = state
        .storage
        .users
        .get(principal.user_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::unauthorized("Unknown principal"))?;
    let target = state
        .storage
        .users
        .get(request.user_id)
        .await
        .map_err(ApiError::from)?
        .filter(|u| u.is_active())
        .ok_or_else(|| ApiError::not_found("Target principal not found"))?;

    let tokens = state
        .login
        .issue(&target, Acr::Pwd, false, None, Some(&admin))
        .await
        .map_err(ApiError::from)?;

    state.audit.emit(
        AuditEvent::new("impersonation.started", AuditResult::Success)
            .with_actor(admin.id, &admin.username, admin.principal_type)
            .with_target("user", Some(target.id))
            .with_tenant(target.tenant_id),
    );
    Ok(Json(json!({
        "access_token": tokens.access_token,
        "refresh_token": tokens.refresh_token,
        "token_type": "Bearer",
        "expires_in": tokens.expires_in,
    })))
}

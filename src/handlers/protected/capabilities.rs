use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::database::models::{AuditEvent, AuditResult};
use crate::error::ApiError;
use crate::middleware::{require_permission, resolve_tenant, PrincipalContext};
use crate::state::AppState;

/// GET /capabilities/:key - evaluate a capability for the caller.
pub async fn evaluate_get(
    State(state): State<AppState>,
    Extension(principal): Extension<PrincipalContext>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = state
        .storage
        .users
        .get(principal.user_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::unauthorized("Unknown principal"))?;

    let evaluation = state
        .capabilities
        .evaluate(&user, &key)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(serde_json::to_value(evaluation).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct EnrollBody {
    #[serde(default = "default_true")]
    pub enroll: bool,
    pub state_data: Option<Value>,
}

fn default_true() -> bool {
    true
}

/// POST /capabilities/:key/enroll - user self-service enrollment into an
/// enrollment-gated capability (or withdrawal with `enroll: false`).
pub async fn enroll_post(
    State(state): State<AppState>,
    Extension(principal): Extension<PrincipalContext>,
    Path(key): Path<String>,
    Json(body): Json<EnrollBody>,
) -> Result<Json<Value>, ApiError> {
    let user = state
        .storage
        .users
        .get(principal.user_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::unauthorized("Unknown principal"))?;

    if body.enroll {
        state
            .capabilities
            .enroll_user(&user, &key, body.state_data)
            .await
            .map_err(ApiError::from)?;
    } else {
        state
            .capabilities
            .withdraw_user(&user, &key)
            .await
            .map_err(ApiError::from)?;
    }

    state.audit.emit(
        AuditEvent::new("capability.user_enrollment", AuditResult::Success)
            .with_actor(user.id, &user.username, user.principal_type)
            .with_tenant(user.tenant_id)
            .with_target("capability", None)
            .with_metadata(json!({ "key": key, "enrolled": body.enroll })),
    );
    Ok(Json(json!({ "ok": true, "key": key, "enrolled": body.enroll })))
}

#[derive(Debug, Deserialize)]
pub struct FeatureBody {
    pub enabled: bool,
    pub configuration: Option<Value>,
}

/// PUT /features/:key - tenant admin enables or disables a feature for its
/// users. Requires the `features:manage` permission on the resolved tenant.
pub async fn feature_put(
    State(state): State<AppState>,
    Extension(principal): Extension<PrincipalContext>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(body): Json<FeatureBody>,
) -> Result<Json<Value>, ApiError> {
    let tenant_id = resolve_tenant(&principal, &headers)?;
    require_permission(&principal, &state.audit, "features", "manage")?;

    let feature = state
        .capabilities
        .set_feature_enablement(tenant_id, &key, body.enabled, body.configuration)
        .await
        .map_err(ApiError::from)?;

    state.audit.emit(
        AuditEvent::new("capability.feature_set", AuditResult::Success)
            .with_actor(principal.user_id, &principal.username, principal.principal_type)
            .with_tenant(Some(tenant_id))
            .with_metadata(json!({ "key": key, "enabled": body.enabled })),
    );
    Ok(Json(serde_json::to_value(feature).unwrap_or_default()))
}

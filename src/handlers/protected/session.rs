use axum::{extract::State, Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::database::models::{AuditEvent, AuditResult};
use crate::error::ApiError;
use crate::middleware::PrincipalContext;
use crate::state::AppState;

/// GET /auth/whoami - echo the authenticated principal context.
pub async fn whoami_get(
    Extension(principal): Extension<PrincipalContext>,
) -> Json<Value> {
    Json(json!({
        "user_id": principal.user_id,
        "principal_type": principal.principal_type,
        "tenant_id": principal.tenant_id,
        "username": principal.username,
        "email": principal.email,
        "roles": principal.roles,
        "permissions": principal.permissions,
        "system_permissions": principal.system_permissions,
        "capabilities": principal.capabilities,
        "acr": principal.acr,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogoutRequest {
    pub refresh_token: Option<String>,
}

/// POST /auth/logout - revoke the presented refresh token, or the whole set
/// when none is given.
pub async fn logout_post(
    State(state): State<AppState>,
    Extension(principal): Extension<PrincipalContext>,
    body: Option<Json<LogoutRequest>>,
) -> Result<Json<Value>, ApiError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let revoked = match &request.refresh_token {
        Some(token) => state.tokens.revoke(token).await.map_err(ApiError::from)? as u64,
        None => state
            .tokens
            .revoke_all_for_user(principal.user_id)
            .await
            .map_err(ApiError::from)?,
    };

    state.audit.emit(
        AuditEvent::new("logout", AuditResult::Success)
            .with_actor(principal.user_id, &principal.username, principal.principal_type)
            .with_tenant(principal.tenant_id)
            .with_metadata(json!({ "revoked": revoked })),
    );
    Ok(Json(json!({ "ok": true, "revoked": revoked })))
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub refresh_token: String,
}

/// POST /auth/token/revoke - revoke one refresh token. Idempotent.
pub async fn token_revoke_post(
    State(state): State<AppState>,
    Extension(principal): Extension<PrincipalContext>,
    Json(request): Json<RevokeRequest>,
) -> Result<Json<Value>, ApiError> {
    let revoked = state
        .tokens
        .revoke(&request.refresh_token)
        .await
        .map_err(ApiError::from)?;

    state.audit.emit(
        AuditEvent::new("token.revoked", AuditResult::Success)
            .with_actor(principal.user_id, &principal.username, principal.principal_type)
            .with_tenant(principal.tenant_id)
            .with_metadata(json!({ "was_live": revoked })),
    );
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct IntrospectRequest {
    pub token: String,
}

/// POST /auth/token/introspect - RFC 7662 introspection. Invalid tokens are
/// `active: false`, never an error.
pub async fn introspect_post(
    State(state): State<AppState>,
    Json(request): Json<IntrospectRequest>,
) -> Json<Value> {
    Json(state.tokens.introspect(&request.token).await)
}

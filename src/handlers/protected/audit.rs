use axum::{
    extract::{Query, State},
    Extension, Json,
};
use serde_json::{json, Value};

use crate::database::models::AuditQuery;
use crate::error::ApiError;
use crate::middleware::{require_permission, PrincipalContext};
use crate::state::AppState;

/// GET /audit/events - filtered audit query. SYSTEM principals see all
/// tenants; TENANT principals are pinned to their own.
pub async fn events_get(
    State(state): State<AppState>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Value>, ApiError> {
    require_permission(&principal, &state.audit, "audit", "read")?;

    let events = state
        .audit_reader
        .query_scoped(principal.principal_type, principal.tenant_id, query)
        .await
        .map_err(ApiError::from)?;

    let count = events.len();
    Ok(Json(json!({
        "events": events,
        "count": count,
    })))
}

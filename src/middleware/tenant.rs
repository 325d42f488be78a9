use axum::http::HeaderMap;
use uuid::Uuid;

use crate::error::ApiError;

use super::auth::PrincipalContext;

/// Resolve the tenant a tenant-scoped request operates on.
///
/// TENANT principals act on the tenant bound into their token; a mismatching
/// explicit header is a cross-tenant attempt and is refused. SYSTEM
/// principals must say which tenant they mean via `X-Tenant-ID`.
pub fn resolve_tenant(
    principal: &PrincipalContext,
    headers: &HeaderMap,
) -> Result<Uuid, ApiError> {
    let header_tenant = headers
        .get("x-tenant-id")
        .map(|value| {
            value
                .to_str()
                .ok()
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| ApiError::bad_request("Invalid X-Tenant-ID header"))
        })
        .transpose()?;

    if principal.is_system() {
        return header_tenant
            .ok_or_else(|| ApiError::bad_request("X-Tenant-ID header required for system principals"));
    }

    let own = principal
        .tenant_id
        .ok_or_else(|| ApiError::unauthorized("Token carries no tenant"))?;
    match header_tenant {
        Some(requested) if requested != own => {
            Err(ApiError::forbidden("Cross-tenant access denied"))
        }
        _ => Ok(own),
    }
}

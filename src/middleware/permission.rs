use serde_json::json;
use uuid::Uuid;

use crate::audit::AuditRecorder;
use crate::database::models::{AuditEvent, AuditResult};
use crate::error::ApiError;

use super::auth::PrincipalContext;

/// Deny unless the caller is a SYSTEM principal. Guards `/system/*`.
pub fn require_system_principal(principal: &PrincipalContext) -> Result<(), ApiError> {
    if principal.is_system() {
        Ok(())
    } else {
        Err(ApiError::forbidden("System principal required"))
    }
}

/// Deny unless the principal holds `resource:action` on its plane. Emits an
/// `authz.denied` security event on refusal.
pub fn require_permission(
    principal: &PrincipalContext,
    audit: &AuditRecorder,
    resource: &str,
    action: &str,
) -> Result<(), ApiError> {
    require_permission_for_tenant(principal, audit, resource, action, principal.tenant_id)
}

/// Permission check against an explicit target tenant, for routes where a
/// SYSTEM principal addresses a tenant via header.
pub fn require_permission_for_tenant(
    principal: &PrincipalContext,
    audit: &AuditRecorder,
    resource: &str,
    action: &str,
    target_tenant: Option<Uuid>,
) -> Result<(), ApiError> {
    let wanted = format!("{}:{}", resource, action);
    let granted = if principal.is_system() {
        principal.system_permissions.iter().any(|p| p == &wanted)
    } else {
        principal.permissions.iter().any(|p| p == &wanted)
    };

    if granted {
        return Ok(());
    }

    tracing::warn!(
        user_id = %principal.user_id,
        permission = %wanted,
        "Permission denied"
    );
    audit.emit(
        AuditEvent::new("authz.denied", AuditResult::Denied)
            .with_actor(principal.user_id, &principal.username, principal.principal_type)
            .with_tenant(principal.tenant_id)
            .with_target("permission", None)
            .with_metadata(json!({
                "permission": wanted,
                "target_tenant_id": target_tenant,
            })),
    );
    Err(ApiError::forbidden("Insufficient permissions"))
}

/// For tokens issued to OAuth clients: the `scope` claim must contain the
/// requested scope.
pub fn require_scope(principal: &PrincipalContext, scope: &str) -> Result<(), ApiError> {
    let granted = principal
        .scope
        .as_deref()
        .is_some_and(|s| s.split_whitespace().any(|part| part == scope));
    if granted {
        Ok(())
    } else {
        Err(ApiError::forbidden("Insufficient scope"))
    }
}

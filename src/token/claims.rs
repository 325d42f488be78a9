use std::collections::{BTreeMap, HashMap};

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::models::{Permission, PrincipalType, Role, User};
use crate::storage::TenantCapabilitySnapshot;

/// Authentication Context Reference: how the session was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acr {
    Pwd,
    Mfa,
}

/// Impersonation marker: the acting (real) principal behind the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActClaim {
    pub sub: String,
    pub principal_type: PrincipalType,
    pub session_id: String,
}

/// The access-token claim set. Plane-specific fields are optional and omitted
/// from the wire when absent: a SYSTEM token never carries `tenant_id`,
/// `roles`, `permissions` or `capabilities`; a TENANT token never carries the
/// `system_*` fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    // Registered claims
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,

    // Principal
    pub principal_type: PrincipalType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub username: String,
    pub email: String,

    // Authorization material
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_roles: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_permissions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<BTreeMap<String, bool>>,

    pub acr: Acr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub act: Option<ActClaim>,
}

impl Claims {
    pub fn user_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.sub).ok()
    }

    pub fn tenant_uuid(&self) -> Option<Uuid> {
        self.tenant_id
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn has_scope(&self, wanted: &str) -> bool {
        self.scope
            .as_deref()
            .is_some_and(|s| s.split_whitespace().any(|part| part == wanted))
    }
}

/// ID-token claim set (OpenID-shaped subset).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// Assembles claim sets from principal state. One builder per process,
/// carrying the configured issuer and default audience.
#[derive(Clone)]
pub struct ClaimsBuilder {
    issuer: String,
    default_audience: String,
}

impl ClaimsBuilder {
    pub fn new(issuer: &str, default_audience: &str) -> Self {
        Self {
            issuer: issuer.to_string(),
            default_audience: default_audience.to_string(),
        }
    }

    /// Build the access-token claim set for a principal.
    ///
    /// `capabilities` is the bulk snapshot for the principal's tenant; every
    /// allowed key appears in the claim with its enablement as the value.
    #[allow(clippy::too_many_arguments)]
    pub fn access_claims(
        &self,
        user: &User,
        roles: &[Role],
        permissions: &[Permission],
        capabilities: &HashMap<String, TenantCapabilitySnapshot>,
        acr: Acr,
        access_ttl: Duration,
        audience: Option<&str>,
        scope: Option<&str>,
        impersonator: Option<&User>,
    ) -> Claims {
        let now = Utc::now();
        let iat = now.timestamp();
        let role_names: Vec<String> = roles.iter().map(|r| r.name.clone()).collect();
        let permission_claims: Vec<String> =
            permissions.iter().map(|p| p.as_claim()).collect();

        let mut claims = Claims {
            iss: self.issuer.clone(),
            sub: user.id.to_string(),
            aud: audience.unwrap_or(&self.default_audience).to_string(),
            iat,
            nbf: iat,
            exp: iat + access_ttl.num_seconds(),
            jti: Uuid::new_v4().to_string(),
            principal_type: user.principal_type,
            tenant_id: None,
            username: user.username.clone(),
            email: user.email.clone(),
            roles: None,
            permissions: None,
            system_roles: None,
            system_permissions: None,
            capabilities: None,
            acr,
            scope: scope.map(str::to_string),
            act: None,
        };

        match user.principal_type {
            PrincipalType::System => {
                claims.system_roles = Some(role_names);
                claims.system_permissions = Some(permission_claims);
            }
            PrincipalType::Tenant => {
                claims.tenant_id = user.tenant_id.map(|id| id.to_string());
                claims.roles = Some(role_names);
                claims.permissions = Some(permission_claims);
                claims.capabilities = Some(
                    capabilities
                        .iter()
                        .filter(|(_, snapshot)| snapshot.allowed)
                        .map(|(key, snapshot)| (key.clone(), snapshot.enabled))
                        .collect(),
                );
            }
        }

        if let Some(actor) = impersonator {
            claims.act = Some(ActClaim {
                sub: actor.id.to_string(),
                principal_type: actor.principal_type,
                session_id: Uuid::new_v4().to_string(),
            });
        }

        claims
    }

    /// Build the ID-token claim set.
    pub fn id_claims(&self, user: &User, id_ttl: Duration, audience: Option<&str>) -> IdClaims {
        let now = Utc::now().timestamp();
        IdClaims {
            iss: self.issuer.clone(),
            sub: user.id.to_string(),
            aud: audience.unwrap_or(&self.default_audience).to_string(),
            iat: now,
            exp: now + id_ttl.num_seconds(),
            username: user.username.clone(),
            email: user.email.clone(),
            tenant_id: user.tenant_id.map(|id| id.to_string()),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{RolePlane, UserStatus};

    fn tenant_user(tenant_id: Uuid) -> User {
        User {
            id: Uuid::new_v4(),
            principal_type: PrincipalType::Tenant,
            tenant_id: Some(tenant_id),
            username: "alice".to_string(),
            email: "alice@t1.example".to_string(),
            status: UserStatus::Active,
            mfa_enabled: false,
            totp_secret_enc: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    fn role(name: &str, tenant_id: Option<Uuid>) -> Role {
        Role {
            id: Uuid::new_v4(),
            plane: if tenant_id.is_some() {
                RolePlane::Tenant
            } else {
                RolePlane::System
            },
            tenant_id,
            name: name.to_string(),
            description: None,
            created_at: Utc::now(),
        }
    }

    fn permission(resource: &str, action: &str) -> Permission {
        Permission {
            id: Uuid::new_v4(),
            resource: resource.to_string(),
            action: action.to_string(),
            tenant_id: None,
        }
    }

    #[test]
    fn tenant_claims_carry_tenant_plane_fields_only() {
        let tenant_id = Uuid::new_v4();
        let user = tenant_user(tenant_id);
        let builder = ClaimsBuilder::new("tessera-iam", "tessera-iam");
        let mut caps = HashMap::new();
        caps.insert(
            "mfa".to_string(),
            TenantCapabilitySnapshot {
                allowed: true,
                enabled: true,
                configuration: None,
            },
        );
        caps.insert(
            "saml".to_string(),
            TenantCapabilitySnapshot {
                allowed: true,
                enabled: false,
                configuration: None,
            },
        );

        let claims = builder.access_claims(
            &user,
            &[role("admin", Some(tenant_id))],
            &[permission("users", "read")],
            &caps,
            Acr::Pwd,
            Duration::seconds(900),
            None,
            None,
            None,
        );

        assert_eq!(claims.principal_type, PrincipalType::Tenant);
        assert_eq!(claims.tenant_id, Some(tenant_id.to_string()));
        assert_eq!(claims.roles.as_deref(), Some(&["admin".to_string()][..]));
        assert_eq!(
            claims.permissions.as_deref(),
            Some(&["users:read".to_string()][..])
        );
        let caps = claims.capabilities.unwrap();
        assert_eq!(caps.get("mfa"), Some(&true));
        assert_eq!(caps.get("saml"), Some(&false));
        assert!(claims.system_roles.is_none());
        assert_eq!(claims.exp - claims.iat, 900);
        assert_eq!(claims.nbf, claims.iat);
    }

    #[test]
    fn system_claims_omit_tenant_fields() {
        let mut user = tenant_user(Uuid::new_v4());
        user.principal_type = PrincipalType::System;
        user.tenant_id = None;
        let builder = ClaimsBuilder::new("tessera-iam", "tessera-iam");

        let claims = builder.access_claims(
            &user,
            &[role("system_admin", None)],
            &[permission("tenants", "manage")],
            &HashMap::new(),
            Acr::Mfa,
            Duration::seconds(900),
            None,
            None,
            None,
        );

        assert!(claims.tenant_id.is_none());
        assert!(claims.roles.is_none());
        assert!(claims.capabilities.is_none());
        assert_eq!(
            claims.system_roles.as_deref(),
            Some(&["system_admin".to_string()][..])
        );
        assert_eq!(
            claims.system_permissions.as_deref(),
            Some(&["tenants:manage".to_string()][..])
        );
        assert_eq!(claims.acr, Acr::Mfa);
    }

    #[test]
    fn impersonation_adds_act_claim() {
        let tenant_id = Uuid::new_v4();
        let user = tenant_user(tenant_id);
        let mut admin = tenant_user(tenant_id);
        admin.principal_type = PrincipalType::System;
        admin.tenant_id = None;

        let builder = ClaimsBuilder::new("tessera-iam", "tessera-iam");
        let claims = builder.access_claims(
            &user,
            &[],
            &[],
            &HashMap::new(),
            Acr::Pwd,
            Duration::seconds(900),
            None,
            None,
            Some(&admin),
        );

        let act = claims.act.unwrap();
        assert_eq!(act.sub, admin.id.to_string());
        assert_eq!(act.principal_type, PrincipalType::System);
        assert!(!act.session_id.is_empty());
    }

    #[test]
    fn scope_membership_check() {
        let user = tenant_user(Uuid::new_v4());
        let builder = ClaimsBuilder::new("tessera-iam", "tessera-iam");
        let claims = builder.access_claims(
            &user,
            &[],
            &[],
            &HashMap::new(),
            Acr::Pwd,
            Duration::seconds(900),
            Some("client-1"),
            Some("openid profile"),
            None,
        );
        assert!(claims.has_scope("openid"));
        assert!(claims.has_scope("profile"));
        assert!(!claims.has_scope("admin"));
        assert_eq!(claims.aud, "client-1");
    }
}

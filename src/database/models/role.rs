use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which plane a role belongs to. System roles are seeded and immutable;
/// tenant roles are `(tenant_id, name)`-unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RolePlane {
    System,
    Tenant,
}

impl RolePlane {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolePlane::System => "SYSTEM",
            RolePlane::Tenant => "TENANT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SYSTEM" => Some(RolePlane::System),
            "TENANT" => Some(RolePlane::Tenant),
            _ => None,
        }
    }
}

/// Seeded system roles. Not deletable.
pub const SYSTEM_ROLES: &[&str] = &["system_owner", "system_admin", "system_auditor"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub plane: RolePlane,
    pub tenant_id: Option<Uuid>,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Role {
    pub fn is_seeded_system_role(&self) -> bool {
        self.plane == RolePlane::System && SYSTEM_ROLES.contains(&self.name.as_str())
    }
}

/// A `(resource, action)` tuple with optional tenant scope. System
/// permissions (no tenant) are seeded and immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: Uuid,
    pub resource: String,
    pub action: String,
    pub tenant_id: Option<Uuid>,
}

impl Permission {
    /// Wire form used in token claims: `"resource:action"`.
    pub fn as_claim(&self) -> String {
        format!("{}:{}", self.resource, self.action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_claim_form() {
        let p = Permission {
            id: Uuid::new_v4(),
            resource: "users".to_string(),
            action: "read".to_string(),
            tenant_id: None,
        };
        assert_eq!(p.as_claim(), "users:read");
    }

    #[test]
    fn seeded_role_detection() {
        let role = Role {
            id: Uuid::new_v4(),
            plane: RolePlane::System,
            tenant_id: None,
            name: "system_admin".to_string(),
            description: None,
            created_at: Utc::now(),
        };
        assert!(role.is_seeded_system_role());
    }
}

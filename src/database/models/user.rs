use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The plane a principal lives on. SYSTEM principals are platform-wide and
/// carry no tenant; TENANT principals are scoped to exactly one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrincipalType {
    System,
    Tenant,
}

impl PrincipalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalType::System => "SYSTEM",
            PrincipalType::Tenant => "TENANT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SYSTEM" => Some(PrincipalType::System),
            "TENANT" => Some(PrincipalType::Tenant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Suspended,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(UserStatus::Active),
            "suspended" => Some(UserStatus::Suspended),
            _ => None,
        }
    }
}

/// An authenticable principal. One `users` table holds both planes with a
/// `principal_type` discriminator and nullable `tenant_id`.
///
/// Invariant: `principal_type == System` iff `tenant_id.is_none()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub principal_type: PrincipalType,
    pub tenant_id: Option<Uuid>,
    pub username: String,
    pub email: String,
    pub status: UserStatus,
    pub mfa_enabled: bool,
    /// TOTP secret encrypted under the system key; never stored plaintext.
    #[serde(skip_serializing)]
    pub totp_secret_enc: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_system(&self) -> bool {
        self.principal_type == PrincipalType::System
    }

    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active && self.deleted_at.is_none()
    }

    /// Plane invariant check, applied at every write boundary.
    pub fn plane_is_consistent(&self) -> bool {
        match self.principal_type {
            PrincipalType::System => self.tenant_id.is_none(),
            PrincipalType::Tenant => self.tenant_id.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(principal_type: PrincipalType, tenant_id: Option<Uuid>) -> User {
        User {
            id: Uuid::new_v4(),
            principal_type,
            tenant_id,
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            status: UserStatus::Active,
            mfa_enabled: false,
            totp_secret_enc: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn plane_invariant() {
        assert!(user(PrincipalType::System, None).plane_is_consistent());
        assert!(user(PrincipalType::Tenant, Some(Uuid::new_v4())).plane_is_consistent());
        assert!(!user(PrincipalType::System, Some(Uuid::new_v4())).plane_is_consistent());
        assert!(!user(PrincipalType::Tenant, None).plane_is_consistent());
    }

    #[test]
    fn principal_type_round_trips_through_strings() {
        assert_eq!(PrincipalType::parse("SYSTEM"), Some(PrincipalType::System));
        assert_eq!(PrincipalType::parse("TENANT"), Some(PrincipalType::Tenant));
        assert_eq!(PrincipalType::parse("other"), None);
    }
}

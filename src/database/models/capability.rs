use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Capability keys that require per-user enrollment on top of tenant
/// enablement. Everything else is usable as soon as the tenant enables it.
pub const ENROLLMENT_GATED_KEYS: &[&str] = &["totp", "mfa", "passwordless"];

/// Default capability catalog seeded at install time.
pub const SEEDED_CAPABILITY_KEYS: &[&str] = &[
    "mfa",
    "totp",
    "recovery_codes",
    "passwordless",
    "saml",
    "oidc",
    "scim",
    "webhooks",
    "audit_export",
    "api_keys",
];

/// Layer 1: platform-wide switch per capability key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemCapability {
    pub capability_key: String,
    pub enabled: bool,
    pub default_value: Option<Value>,
}

/// Layer 2: a capability assigned to a tenant by a system admin. May only
/// exist while the system layer allows the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantCapability {
    pub tenant_id: Uuid,
    pub capability_key: String,
    pub enabled: bool,
    pub value: Option<Value>,
}

/// Layer 3: the tenant admin turning an assigned capability on for its users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantFeatureEnablement {
    pub tenant_id: Uuid,
    pub feature_key: String,
    pub enabled: bool,
    pub configuration: Option<Value>,
}

/// Layer 4: per-user enrollment state for enrollment-gated keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCapabilityState {
    pub user_id: Uuid,
    pub capability_key: String,
    pub enrolled: bool,
    pub state_data: Option<Value>,
    pub enrolled_at: Option<DateTime<Utc>>,
}

/// Result of folding the four layers for one `(tenant, user, key)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityEvaluation {
    pub capability_key: String,
    pub system_supported: bool,
    pub tenant_allowed: bool,
    pub tenant_enabled: bool,
    pub user_enrolled: bool,
    pub can_use: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CapabilityEvaluation {
    pub fn denied(key: &str, reason: &str) -> Self {
        Self {
            capability_key: key.to_string(),
            system_supported: false,
            tenant_allowed: false,
            tenant_enabled: false,
            user_enrolled: false,
            can_use: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Whether a key needs per-user enrollment (step 4 of the evaluation).
pub fn requires_enrollment(key: &str) -> bool {
    ENROLLMENT_GATED_KEYS.contains(&key)
}

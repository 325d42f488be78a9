use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::PrincipalType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Failure,
    Denied,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditResult::Success => "success",
            AuditResult::Failure => "failure",
            AuditResult::Denied => "denied",
        }
    }
}

/// Who performed the action. Absent for unauthenticated attempts where the
/// principal never resolved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditActor {
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
    pub principal_type: Option<PrincipalType>,
}

/// What the action touched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditTarget {
    pub target_type: Option<String>,
    pub target_id: Option<Uuid>,
    pub identifier: Option<String>,
}

/// One structured audit or security event. Event types are dotted strings
/// (`login.success`, `login.failure`, `authz.denied`, `rate_limit.exceeded`,
/// `mfa.enrolled`, `token.refreshed`, `token.reuse_detected`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub event_type: String,
    pub actor: AuditActor,
    pub target: AuditTarget,
    pub tenant_id: Option<Uuid>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub result: AuditResult,
    pub metadata: Option<Value>,
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: &str, result: AuditResult) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            actor: AuditActor::default(),
            target: AuditTarget::default(),
            tenant_id: None,
            source_ip: None,
            user_agent: None,
            timestamp: Utc::now(),
            result,
            metadata: None,
            error: None,
        }
    }

    pub fn with_actor(mut self, user_id: Uuid, username: &str, pt: PrincipalType) -> Self {
        self.actor = AuditActor {
            user_id: Some(user_id),
            username: Some(username.to_string()),
            principal_type: Some(pt),
        };
        self
    }

    pub fn with_tenant(mut self, tenant_id: Option<Uuid>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn with_target(mut self, target_type: &str, target_id: Option<Uuid>) -> Self {
        self.target = AuditTarget {
            target_type: Some(target_type.to_string()),
            target_id,
            identifier: None,
        };
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_source(mut self, ip: Option<String>, user_agent: Option<String>) -> Self {
        self.source_ip = ip;
        self.user_agent = user_agent;
        self
    }
}

/// Filter for the audit read path. Tenant isolation is enforced by the
/// caller-facing layer: TENANT principals always get their own tenant id
/// forced into `tenant_id`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub tenant_id: Option<Uuid>,
    pub event_type: Option<String>,
    pub actor_user_id: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

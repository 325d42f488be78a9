use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A link between a local principal and an identity at an external provider.
/// The federation protocol itself is handled outside the core; only the
/// verified result lands here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedIdentity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_id: Uuid,
    pub external_id: String,
    pub attributes: Option<Value>,
    pub linked_at: DateTime<Utc>,
}

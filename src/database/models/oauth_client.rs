use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered OAuth client. The secret is stored as a bcrypt hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClient {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret_hash: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub scopes: Vec<String>,
    pub is_confidential: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl OAuthClient {
    pub fn verify_secret(&self, presented: &str) -> bool {
        bcrypt::verify(presented, &self.client_secret_hash).unwrap_or(false)
    }

    pub fn allows_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

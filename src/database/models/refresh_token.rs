use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored refresh token. Only the SHA-256 hash of the opaque value is kept;
/// the plaintext is returned exactly once at issuance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Option<Uuid>,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub remember_me: bool,
    pub client_id: Option<String>,
    /// Whether the session that minted this chain satisfied MFA; refreshed
    /// access tokens inherit their `acr` from this.
    pub mfa_satisfied: bool,
    pub created_at: DateTime<Utc>,
}

impl RefreshToken {
    /// A token is live iff not revoked and not past expiry.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && now < self.expires_at
    }
}

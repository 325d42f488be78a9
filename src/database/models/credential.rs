use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Password material for a principal, 1:1 with `users`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub user_id: Uuid,
    /// PHC-encoded Argon2id string.
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub password_changed_at: DateTime<Utc>,
    pub failed_login_attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }
}

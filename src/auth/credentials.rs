use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::crypto::password;
use crate::database::models::Credential;
use crate::error::AuthError;
use crate::storage::Storage;

/// Password verification with the failed-attempt lockout policy. The lock is
/// checked before the hash is ever consulted; password success resets the
/// counter, MFA failures never touch it.
#[derive(Clone)]
pub struct CredentialVerifier {
    storage: Storage,
    max_failed: i32,
    lockout: Duration,
}

impl CredentialVerifier {
    pub fn new(storage: Storage, max_failed: i32, lockout_minutes: i64) -> Self {
        Self {
            storage,
            max_failed,
            lockout: Duration::minutes(lockout_minutes),
        }
    }

    /// Verify a password for a principal.
    ///
    /// Returns `Locked` while `locked_until` is in the future,
    /// `Unauthenticated` on a missing credential row or hash mismatch.
    pub async fn verify(&self, user_id: Uuid, plain: &str) -> Result<(), AuthError> {
        let credential = self
            .storage
            .credentials
            .get(user_id)
            .await?
            .ok_or(AuthError::Unauthenticated)?;

        if credential.is_locked(Utc::now()) {
            return Err(AuthError::Locked);
        }

        // Argon2id is deliberately expensive; keep it off the async workers.
        let encoded = credential.password_hash.clone();
        let candidate = plain.to_string();
        let matches = tokio::task::spawn_blocking(move || {
            password::verify_password(&candidate, &encoded)
        })
        .await
        .map_err(|e| AuthError::Internal(format!("verify task: {}", e)))?;

        if !matches {
            let attempts = self
                .storage
                .credentials
                .record_failure(user_id, self.max_failed, self.lockout)
                .await?;
            if attempts >= self.max_failed {
                tracing::warn!(user_id = %user_id, attempts, "Account locked after failed logins");
            }
            return Err(AuthError::Unauthenticated);
        }

        self.storage.credentials.reset_failures(user_id).await?;
        Ok(())
    }

    /// Create or replace the password for a principal.
    pub async fn set_password(&self, user_id: Uuid, plain: &str) -> Result<(), AuthError> {
        let candidate = plain.to_string();
        let encoded =
            tokio::task::spawn_blocking(move || password::hash_password(&candidate))
                .await
                .map_err(|e| AuthError::Internal(format!("hash task: {}", e)))??;

        let existing = self.storage.credentials.get(user_id).await?;
        match existing {
            Some(_) => self.storage.credentials.set_password(user_id, &encoded).await,
            None => {
                self.storage
                    .credentials
                    .upsert(&Credential {
                        user_id,
                        password_hash: encoded,
                        password_changed_at: Utc::now(),
                        failed_login_attempts: 0,
                        locked_until: None,
                    })
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{PrincipalType, User, UserStatus};
    use crate::storage::memory;

    async fn fixture() -> (CredentialVerifier, Uuid) {
        let storage = memory::build_storage();
        let user = User {
            id: Uuid::new_v4(),
            principal_type: PrincipalType::System,
            tenant_id: None,
            username: "root".to_string(),
            email: "root@example.com".to_string(),
            status: UserStatus::Active,
            mfa_enabled: false,
            totp_secret_enc: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        };
        storage.users.create(&user).await.unwrap();
        let verifier = CredentialVerifier::new(storage, 5, 15);
        verifier
            .set_password(user.id, "Hunter2!!Hunter2")
            .await
            .unwrap();
        (verifier, user.id)
    }

    #[tokio::test]
    async fn correct_password_verifies_and_resets_counter() {
        let (verifier, user_id) = fixture().await;
        assert!(verifier.verify(user_id, "wrong").await.is_err());
        assert!(verifier.verify(user_id, "Hunter2!!Hunter2").await.is_ok());
        let credential = verifier.storage.credentials.get(user_id).await.unwrap().unwrap();
        assert_eq!(credential.failed_login_attempts, 0);
    }

    #[tokio::test]
    async fn five_failures_lock_without_consulting_the_hash() {
        let (verifier, user_id) = fixture().await;
        for _ in 0..5 {
            assert!(matches!(
                verifier.verify(user_id, "wrong").await,
                Err(AuthError::Unauthenticated)
            ));
        }
        // Sixth attempt, correct password: still locked.
        assert!(matches!(
            verifier.verify(user_id, "Hunter2!!Hunter2").await,
            Err(AuthError::Locked)
        ));
    }

    #[tokio::test]
    async fn lock_expires() {
        let (verifier, user_id) = fixture().await;
        for _ in 0..5 {
            let _ = verifier.verify(user_id, "wrong").await;
        }
        // Rewind the lock instead of waiting 15 minutes.
        let mut credential = verifier.storage.credentials.get(user_id).await.unwrap().unwrap();
        credential.locked_until = Some(Utc::now() - Duration::seconds(1));
        verifier.storage.credentials.upsert(&credential).await.unwrap();

        assert!(verifier.verify(user_id, "Hunter2!!Hunter2").await.is_ok());
    }

    #[tokio::test]
    async fn unknown_user_is_uniform_bad_credentials() {
        let (verifier, _) = fixture().await;
        assert!(matches!(
            verifier.verify(Uuid::new_v4(), "whatever").await,
            Err(AuthError::Unauthenticated)
        ));
    }
}

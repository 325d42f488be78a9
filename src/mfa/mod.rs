//! MFA sessions and verification. Pending TOTP secrets never touch primary
//! storage: they live in the TTL cache until the challenge is verified, and
//! a restart without Redis legitimately voids in-flight enrollments.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::cache::Cache;
use crate::capability::CapabilityEngine;
use crate::crypto::{cipher, recovery, totp};
use crate::database::models::User;
use crate::error::{ApiError, AuthError};
use crate::storage::Storage;

const MAX_ATTEMPTS: i64 = 5;
const ATTEMPT_WINDOW_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MfaPurpose {
    Challenge,
    Enroll,
}

/// Ephemeral session state, JSON-encoded into the cache under
/// `mfa:session:{id}` with the configured TTL (default 5 min).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaSession {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub purpose: MfaPurpose,
    /// Enrollment only: the candidate TOTP secret, pending verification.
    pub pending_secret: Option<String>,
    /// Enrollment only: bcrypt hashes of the recovery codes shown to the
    /// user, persisted on successful verification.
    pub pending_recovery_hashes: Option<Vec<String>>,
    pub created_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum MfaError {
    #[error("MFA session expired or unknown")]
    SessionExpired,
    #[error("invalid MFA code")]
    InvalidCode,
    #[error("MFA session locked")]
    Locked,
    #[error("MFA already enrolled")]
    AlreadyEnrolled,
    #[error("MFA not enrolled")]
    NotEnrolled,
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl From<crate::crypto::CryptoError> for MfaError {
    fn from(err: crate::crypto::CryptoError) -> Self {
        MfaError::Auth(err.into())
    }
}

impl From<MfaError> for ApiError {
    fn from(err: MfaError) -> Self {
        match err {
            MfaError::SessionExpired => ApiError::gone("MFA session expired"),
            MfaError::InvalidCode => ApiError::unauthorized("Invalid MFA code"),
            MfaError::Locked => ApiError::locked("Too many MFA attempts"),
            MfaError::AlreadyEnrolled => ApiError::conflict("MFA already enrolled"),
            MfaError::NotEnrolled => ApiError::unauthorized("MFA not enrolled"),
            MfaError::Auth(e) => e.into(),
        }
    }
}

/// What a successful verification yields.
pub enum MfaVerified {
    /// Enrollment completed; the recovery codes were already handed out at
    /// enrollment time.
    Enrolled { user: User },
    /// A challenge passed, by TOTP or by burning a recovery code.
    Challenged { user: User },
}

/// Material returned when enrollment begins. The secret and recovery-code
/// plaintexts appear exactly once, here.
pub struct EnrollmentStart {
    pub session_id: Uuid,
    pub secret_b32: String,
    pub otpauth_uri: String,
    pub qr_png_base64: String,
    pub recovery_codes: Vec<String>,
}

#[derive(Clone)]
pub struct MfaService {
    cache: Arc<dyn Cache>,
    storage: Storage,
    capabilities: CapabilityEngine,
    encryption_key: [u8; 32],
    totp_issuer: String,
    session_ttl: StdDuration,
}

impl MfaService {
    pub fn new(
        cache: Arc<dyn Cache>,
        storage: Storage,
        capabilities: CapabilityEngine,
        encryption_key: [u8; 32],
        totp_issuer: &str,
        session_ttl: StdDuration,
    ) -> Self {
        Self {
            cache,
            storage,
            capabilities,
            encryption_key,
            totp_issuer: totp_issuer.to_string(),
            session_ttl,
        }
    }

    fn session_key(session_id: Uuid) -> String {
        format!("mfa:session:{}", session_id)
    }

    fn attempts_key(session_id: Uuid) -> String {
        format!("mfa:attempts:{}", session_id)
    }

    async fn store_session(&self, session: &MfaSession) -> Result<(), AuthError> {
        let payload = serde_json::to_string(session)
            .map_err(|e| AuthError::Internal(format!("serialise MFA session: {}", e)))?;
        self.cache
            .set(&Self::session_key(session.session_id), &payload, self.session_ttl)
            .await
    }

    async fn load_session(&self, session_id: Uuid) -> Result<MfaSession, MfaError> {
        let payload = self
            .cache
            .get(&Self::session_key(session_id))
            .await
            .map_err(MfaError::Auth)?
            .ok_or(MfaError::SessionExpired)?;
        serde_json::from_str(&payload)
            .map_err(|e| MfaError::Auth(AuthError::Internal(format!("bad MFA session: {}", e))))
    }

    async fn delete_session(&self, session_id: Uuid) -> Result<(), AuthError> {
        self.cache.delete(&Self::session_key(session_id)).await?;
        self.cache.delete(&Self::attempts_key(session_id)).await
    }

    /// Start a challenge for an enrolled user. Returns the opaque session id.
    pub async fn begin_challenge(&self, user: &User) -> Result<Uuid, MfaError> {
        if !user.mfa_enabled || user.totp_secret_enc.is_none() {
            return Err(MfaError::NotEnrolled);
        }
        let session = MfaSession {
            session_id: Uuid::new_v4(),
            user_id: user.id,
            tenant_id: user.tenant_id,
            purpose: MfaPurpose::Challenge,
            pending_secret: None,
            pending_recovery_hashes: None,
            created_at: Utc::now().timestamp(),
        };
        self.store_session(&session).await?;
        Ok(session.session_id)
    }

    /// Create the placeholder session the login pipeline hands out when a
    /// policy demands MFA from a not-yet-enrolled user.
    pub async fn begin_pending_enrollment(&self, user: &User) -> Result<Uuid, MfaError> {
        let session = MfaSession {
            session_id: Uuid::new_v4(),
            user_id: user.id,
            tenant_id: user.tenant_id,
            purpose: MfaPurpose::Enroll,
            pending_secret: None,
            pending_recovery_hashes: None,
            created_at: Utc::now().timestamp(),
        };
        self.store_session(&session).await?;
        Ok(session.session_id)
    }

    /// Resolve the principal behind a live session, for flows authenticated
    /// by the session itself rather than a bearer token.
    pub async fn session_user(&self, session_id: Uuid) -> Result<Uuid, MfaError> {
        Ok(self.load_session(session_id).await?.user_id)
    }

    /// Generate enrollment material: a fresh TOTP secret (in the session
    /// only), the otpauth URI, QR code and recovery codes. Reuses the
    /// session minted at login when one is supplied.
    pub async fn begin_enrollment(
        &self,
        user: &User,
        existing_session: Option<Uuid>,
    ) -> Result<EnrollmentStart, MfaError> {
        if user.mfa_enabled {
            return Err(MfaError::AlreadyEnrolled);
        }

        let account = &user.email;
        let enrollment = totp::new_totp(&self.totp_issuer, account)?;
        let codes = recovery::new_recovery_codes(10)?;

        let session_id = match existing_session {
            Some(id) => {
                let session = self.load_session(id).await?;
                if session.user_id != user.id || session.purpose != MfaPurpose::Enroll {
                    return Err(MfaError::SessionExpired);
                }
                id
            }
            None => Uuid::new_v4(),
        };

        let session = MfaSession {
            session_id,
            user_id: user.id,
            tenant_id: user.tenant_id,
            purpose: MfaPurpose::Enroll,
            pending_secret: Some(enrollment.secret_b32.clone()),
            pending_recovery_hashes: Some(codes.hashed.clone()),
            created_at: Utc::now().timestamp(),
        };
        self.store_session(&session).await?;

        Ok(EnrollmentStart {
            session_id,
            secret_b32: enrollment.secret_b32,
            otpauth_uri: enrollment.otpauth_uri,
            qr_png_base64: enrollment.qr_png_base64,
            recovery_codes: codes.plain,
        })
    }

    /// Verify a code against a session. Single-use: the session is deleted on
    /// success. At most 5 attempts per session per 5 minutes.
    pub async fn verify(&self, session_id: Uuid, code: &str) -> Result<MfaVerified, MfaError> {
        let session = self.load_session(session_id).await?;

        let attempts = self
            .cache
            .incr(
                &Self::attempts_key(session_id),
                StdDuration::from_secs(ATTEMPT_WINDOW_SECS),
            )
            .await
            .map_err(MfaError::Auth)?;
        if attempts > MAX_ATTEMPTS {
            return Err(MfaError::Locked);
        }

        let user = self
            .storage
            .users
            .get(session.user_id)
            .await
            .map_err(MfaError::Auth)?
            .ok_or(MfaError::SessionExpired)?;

        let now = Utc::now().timestamp() as u64;
        match session.purpose {
            MfaPurpose::Enroll => {
                let secret = session
                    .pending_secret
                    .as_deref()
                    .ok_or(MfaError::SessionExpired)?;
                if !totp::verify_totp(secret, code, now) {
                    return Err(MfaError::InvalidCode);
                }
                self.complete_enrollment(&user, secret, &session).await?;
                self.delete_session(session_id).await.map_err(MfaError::Auth)?;
                let user = self
                    .storage
                    .users
                    .get(user.id)
                    .await
                    .map_err(MfaError::Auth)?
                    .ok_or(MfaError::SessionExpired)?;
                Ok(MfaVerified::Enrolled { user })
            }
            MfaPurpose::Challenge => {
                if self.check_totp(&user, code, now)? {
                    self.delete_session(session_id).await.map_err(MfaError::Auth)?;
                    return Ok(MfaVerified::Challenged { user });
                }
                if self.burn_recovery_code(&user, code).await? {
                    self.delete_session(session_id).await.map_err(MfaError::Auth)?;
                    return Ok(MfaVerified::Challenged { user });
                }
                Err(MfaError::InvalidCode)
            }
        }
    }

    /// Persist the verified secret (encrypted), the recovery-code hashes, and
    /// the capability enrollments.
    async fn complete_enrollment(
        &self,
        user: &User,
        secret_b32: &str,
        session: &MfaSession,
    ) -> Result<(), MfaError> {
        let secret_enc = cipher::encrypt(secret_b32.as_bytes(), &self.encryption_key)?;
        self.storage
            .users
            .set_totp_secret(user.id, Some(secret_enc), true)
            .await
            .map_err(MfaError::Auth)?;

        if let Some(hashes) = &session.pending_recovery_hashes {
            self.storage
                .recovery_codes
                .replace_for_user(user.id, hashes)
                .await
                .map_err(MfaError::Auth)?;
        }

        // The encrypted secret on the user row is authoritative; the
        // capability rows mirror it for every key the tenant plane permits.
        for key in ["mfa", "totp"] {
            match self
                .capabilities
                .enroll_user(user, key, Some(json!({ "method": "totp" })))
                .await
            {
                Ok(_) => {}
                Err(AuthError::Conflict(reason)) => {
                    tracing::debug!(key, %reason, "Capability enrollment skipped");
                }
                Err(e) => return Err(MfaError::Auth(e)),
            }
        }
        Ok(())
    }

    fn check_totp(&self, user: &User, code: &str, now: u64) -> Result<bool, MfaError> {
        let Some(secret_enc) = &user.totp_secret_enc else {
            return Ok(false);
        };
        let secret = cipher::decrypt(secret_enc, &self.encryption_key)?;
        let secret_b32 = String::from_utf8(secret)
            .map_err(|_| MfaError::Auth(AuthError::CryptoFailure("TOTP secret".to_string())))?;
        Ok(totp::verify_totp(&secret_b32, code, now))
    }

    /// Accept a recovery code; a code verifies at most once, ever.
    async fn burn_recovery_code(&self, user: &User, code: &str) -> Result<bool, MfaError> {
        let candidates = self
            .storage
            .recovery_codes
            .list_unused(user.id)
            .await
            .map_err(MfaError::Auth)?;
        for (code_id, hash) in candidates {
            if recovery::verify_recovery_code(code, &hash) {
                // mark_used fails if another request burned it first.
                return match self.storage.recovery_codes.mark_used(code_id).await {
                    Ok(()) => Ok(true),
                    Err(AuthError::Conflict(_)) => Ok(false),
                    Err(e) => Err(MfaError::Auth(e)),
                };
            }
        }
        Ok(false)
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, decode_header, encode, Header, Validation};
use rand::RngCore;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::database::models::RefreshToken;
use crate::error::{ApiError, AuthError};
use crate::storage::{RotateOutcome, Storage};

use super::claims::{Acr, Claims, ClaimsBuilder, IdClaims};
use super::keys::KeyRing;
use super::lifetimes::LifetimeResolver;

/// Token-layer failure modes. The HTTP mapping keeps authentication failures
/// uniform except where the surface distinguishes them (refresh).
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("token malformed")]
    Malformed,
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("refresh token revoked")]
    Revoked,
    #[error("refresh token reuse detected")]
    ReuseDetected,
    #[error("client mismatch")]
    ClientMismatch,
    #[error(transparent)]
    Storage(#[from] AuthError),
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => ApiError::unauthorized("Token expired"),
            TokenError::Malformed | TokenError::SignatureInvalid => {
                ApiError::unauthorized("Invalid token")
            }
            TokenError::Revoked => ApiError::unauthorized("Refresh token revoked"),
            TokenError::ReuseDetected => ApiError::unauthorized("Refresh token reuse detected"),
            TokenError::ClientMismatch => ApiError::unauthorized("Invalid client"),
            TokenError::Storage(e) => e.into(),
        }
    }
}

/// Everything a successful issuance returns. The refresh token plaintext
/// appears here once and is never reconstructable.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(skip)]
    pub refresh_token_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub expires_in: i64,
}

/// Sole writer of refresh-token rows. Signs with the active key, verifies
/// against every key in the ring, rotates refresh tokens atomically and
/// answers reuse with a full revoke of the principal's set.
pub struct TokenService {
    keys: RwLock<Arc<KeyRing>>,
    storage: Storage,
    claims_builder: ClaimsBuilder,
    lifetimes: LifetimeResolver,
}

impl TokenService {
    pub fn new(
        keys: KeyRing,
        storage: Storage,
        claims_builder: ClaimsBuilder,
        lifetimes: LifetimeResolver,
    ) -> Self {
        Self {
            keys: RwLock::new(Arc::new(keys)),
            storage,
            claims_builder,
            lifetimes,
        }
    }

    /// Swap the signing keys without stopping the service. Readers clone the
    /// ring out of the lock, so in-flight requests keep a consistent view.
    pub async fn rotate_signing_keys(&self, ring: KeyRing) {
        let mut keys = self.keys.write().await;
        *keys = Arc::new(ring);
        tracing::info!(kid = %keys.active().kid, "Signing keys rotated");
    }

    async fn ring(&self) -> Arc<KeyRing> {
        self.keys.read().await.clone()
    }

    pub async fn jwks(&self) -> Value {
        self.ring().await.jwks()
    }

    fn sign<T: Serialize>(&self, ring: &KeyRing, claims: &T) -> Result<String, TokenError> {
        let key = ring.active();
        let mut header = Header::new(key.alg);
        header.kid = Some(key.kid.clone());
        encode(&header, claims, &key.encoding).map_err(|e| {
            tracing::error!("JWT signing failed: {}", e);
            TokenError::SignatureInvalid
        })
    }

    /// Mint an access/refresh pair (plus optional ID token) and persist the
    /// refresh-token hash.
    pub async fn issue(
        &self,
        claims: Claims,
        id_claims: Option<IdClaims>,
        refresh_ttl: Duration,
        remember_me: bool,
        client_id: Option<String>,
    ) -> Result<IssuedTokens, TokenError> {
        let ring = self.ring().await;
        let access_token = self.sign(&ring, &claims)?;
        let id_token = id_claims
            .as_ref()
            .map(|c| self.sign(&ring, c))
            .transpose()?;

        let (refresh_plain, refresh_hash) = generate_refresh_token();
        let user_id = claims
            .user_id()
            .ok_or(TokenError::Malformed)?;
        let row = RefreshToken {
            id: Uuid::new_v4(),
            user_id,
            tenant_id: claims.tenant_uuid(),
            token_hash: refresh_hash,
            expires_at: Utc::now() + refresh_ttl,
            revoked_at: None,
            remember_me,
            client_id,
            mfa_satisfied: claims.acr == Acr::Mfa,
            created_at: Utc::now(),
        };
        self.storage.refresh_tokens.insert(&row).await?;

        Ok(IssuedTokens {
            access_token,
            refresh_token: refresh_plain,
            refresh_token_id: row.id,
            id_token,
            expires_in: claims.exp - claims.iat,
        })
    }

    /// Verify signature, issuer, expiry and shape of an access token.
    pub async fn validate_access(&self, token: &str) -> Result<Claims, TokenError> {
        let header = decode_header(token).map_err(|_| TokenError::Malformed)?;
        let kid = header.kid.ok_or(TokenError::Malformed)?;

        let ring = self.ring().await;
        let key = ring.find(&kid).ok_or(TokenError::SignatureInvalid)?;

        let mut validation = Validation::new(key.alg);
        validation.set_issuer(&[self.claims_builder.issuer()]);
        // The audience varies per OAuth client; scope middleware enforces it
        // where a specific audience matters.
        validation.validate_aud = false;
        validation.validate_nbf = true;

        let data = decode::<Claims>(token, &key.decoding, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature => TokenError::SignatureInvalid,
                ErrorKind::ImmatureSignature => TokenError::Expired,
                _ => TokenError::Malformed,
            }
        })?;

        if data.claims.jti.is_empty() {
            return Err(TokenError::Malformed);
        }
        Ok(data.claims)
    }

    /// Rotate a refresh token: revoke the presented row and mint a fresh
    /// pair, atomically. Presenting an already-revoked token is treated as a
    /// leak: every refresh token of that principal is revoked and
    /// `ReuseDetected` is returned.
    pub async fn refresh(
        &self,
        presented_plain: &str,
        client_id: Option<&str>,
    ) -> Result<IssuedTokens, TokenError> {
        let presented_hash = hash_refresh_token(presented_plain);

        let presented = self
            .storage
            .refresh_tokens
            .find_by_hash(&presented_hash)
            .await?
            .ok_or(TokenError::Malformed)?;

        if presented.client_id.as_deref() != client_id {
            return Err(TokenError::ClientMismatch);
        }
        if let Some(client_id) = client_id {
            let client = self
                .storage
                .oauth_clients
                .find_by_client_id(client_id)
                .await?;
            if !client.is_some_and(|c| c.is_active) {
                return Err(TokenError::ClientMismatch);
            }
        }
        if presented.revoked_at.is_some() {
            return self.reuse_detected(presented.user_id).await;
        }
        let now = Utc::now();
        if now >= presented.expires_at {
            return Err(TokenError::Expired);
        }

        // Recompute TTLs and claims from current state: roles or capability
        // grants may have changed since the chain started.
        let settings = match presented.tenant_id {
            Some(tenant_id) => self.storage.tenants.get_token_settings(tenant_id).await?,
            None => None,
        };
        let lifetimes = self.lifetimes.resolve(settings.as_ref());
        let (access_ttl, refresh_ttl) = lifetimes.session_pair(presented.remember_me);

        let user = self
            .storage
            .users
            .get(presented.user_id)
            .await?
            .filter(|u| u.is_active())
            .ok_or(TokenError::Revoked)?;
        let roles = self.storage.roles.roles_for_user(user.id).await?;
        let permissions = self.storage.roles.permissions_for_user(user.id).await?;
        let capabilities = match user.tenant_id {
            Some(tenant_id) => {
                self.storage
                    .capabilities
                    .snapshot_for_tenant(tenant_id)
                    .await?
            }
            None => HashMap::new(),
        };

        let acr = if presented.mfa_satisfied {
            Acr::Mfa
        } else {
            Acr::Pwd
        };
        let claims = self.claims_builder.access_claims(
            &user,
            &roles,
            &permissions,
            &capabilities,
            acr,
            access_ttl,
            presented.client_id.as_deref(),
            None,
            None,
        );
        let id_claims = self
            .claims_builder
            .id_claims(&user, lifetimes.id, presented.client_id.as_deref());

        let ring = self.ring().await;
        let access_token = self.sign(&ring, &claims)?;
        let id_token = self.sign(&ring, &id_claims)?;

        let (refresh_plain, refresh_hash) = generate_refresh_token();
        let replacement = RefreshToken {
            id: Uuid::new_v4(),
            user_id: presented.user_id,
            tenant_id: presented.tenant_id,
            token_hash: refresh_hash,
            expires_at: now + refresh_ttl,
            revoked_at: None,
            remember_me: presented.remember_me,
            client_id: presented.client_id.clone(),
            mfa_satisfied: presented.mfa_satisfied,
            created_at: now,
        };

        match self
            .storage
            .refresh_tokens
            .rotate(&presented_hash, &replacement)
            .await?
        {
            RotateOutcome::Rotated(_) => Ok(IssuedTokens {
                access_token,
                refresh_token: refresh_plain,
                refresh_token_id: replacement.id,
                id_token: Some(id_token),
                expires_in: claims.exp - claims.iat,
            }),
            // Lost the race: someone rotated this token between our read and
            // the lock. That is indistinguishable from replay, so the breach
            // response applies.
            RotateOutcome::AlreadyRevoked(row) => self.reuse_detected(row.user_id).await,
            RotateOutcome::Expired(_) => Err(TokenError::Expired),
            RotateOutcome::NotFound => Err(TokenError::Malformed),
        }
    }

    async fn reuse_detected(&self, user_id: Uuid) -> Result<IssuedTokens, TokenError> {
        let revoked = self
            .storage
            .refresh_tokens
            .revoke_all_for_user(user_id)
            .await?;
        tracing::warn!(
            user_id = %user_id,
            revoked,
            "Refresh token reuse detected; revoked all refresh tokens for principal"
        );
        Err(TokenError::ReuseDetected)
    }

    /// Revoke one refresh token by its plaintext. Idempotent.
    pub async fn revoke(&self, presented_plain: &str) -> Result<bool, TokenError> {
        let hash = hash_refresh_token(presented_plain);
        Ok(self.storage.refresh_tokens.revoke_by_hash(&hash).await?)
    }

    /// Revoke every refresh token of a principal. Idempotent: a second call
    /// finds nothing live and is a no-op.
    pub async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64, TokenError> {
        Ok(self.storage.refresh_tokens.revoke_all_for_user(user_id).await?)
    }

    pub async fn revoke_all_for_client(&self, client_id: &str) -> Result<u64, TokenError> {
        Ok(self
            .storage
            .refresh_tokens
            .revoke_all_for_client(client_id)
            .await?)
    }

    /// RFC 7662 introspection response. Invalid tokens are `active: false`,
    /// never an error.
    pub async fn introspect(&self, token: &str) -> Value {
        match self.validate_access(token).await {
            Ok(claims) => json!({
                "active": true,
                "token_type": "Bearer",
                "sub": claims.sub,
                "username": claims.username,
                "iss": claims.iss,
                "aud": claims.aud,
                "exp": claims.exp,
                "iat": claims.iat,
                "nbf": claims.nbf,
                "jti": claims.jti,
                "scope": claims.scope,
            }),
            Err(_) => json!({ "active": false }),
        }
    }
}

/// SHA-256 hex of the opaque refresh-token value. Rows store this, never the
/// plaintext.
pub fn hash_refresh_token(plain: &str) -> String {
    format!("{:x}", Sha256::digest(plain.as_bytes()))
}

/// URL-safe random 32-byte opaque token: `(plaintext, sha256_hex)`.
pub fn generate_refresh_token() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let plain = URL_SAFE_NO_PAD.encode(bytes);
    let hash = hash_refresh_token(&plain);
    (plain, hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::database::models::{PrincipalType, User, UserStatus};
    use crate::storage::memory;

    fn service() -> TokenService {
        let config = AppConfig::development();
        TokenService::new(
            KeyRing::from_hs256_secret(&config.security.jwt_signing_key),
            memory::build_storage(),
            ClaimsBuilder::new("tessera-iam", "tessera-iam"),
            LifetimeResolver::new(config.tokens),
        )
    }

    async fn seed_user(storage: &Storage) -> User {
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
        user
    }

    fn claims_for(service: &TokenService, user: &User) -> Claims {
        service.claims_builder.access_claims(
            user,
            &[],
            &[],
            &HashMap::new(),
            Acr::Pwd,
            Duration::seconds(900),
            None,
            None,
            None,
        )
    }

    #[tokio::test]
    async fn sign_then_validate_round_trips() {
        let service = service();
        let user = seed_user(&service.storage).await;
        let claims = claims_for(&service, &user);
        let jti = claims.jti.clone();

        let issued = service
            .issue(claims, None, Duration::days(30), false, None)
            .await
            .unwrap();
        assert_eq!(issued.expires_in, 900);

        let verified = service.validate_access(&issued.access_token).await.unwrap();
        assert_eq!(verified.sub, user.id.to_string());
        assert_eq!(verified.jti, jti);
        assert_eq!(verified.principal_type, PrincipalType::System);
    }

    #[tokio::test]
    async fn garbage_token_is_malformed() {
        let service = service();
        assert!(matches!(
            service.validate_access("not-a-jwt").await,
            Err(TokenError::Malformed)
        ));
    }

    #[tokio::test]
    async fn token_signed_by_unknown_key_is_rejected() {
        let other = service();
        let service = service();
        let user = seed_user(&other.storage).await;
        let claims = claims_for(&other, &user);
        let foreign = other
            .issue(claims, None, Duration::days(1), false, None)
            .await
            .unwrap();

        // Same secret means same kid here; rotate our ring to a different key
        // so the foreign kid no longer resolves.
        service
            .rotate_signing_keys(KeyRing::from_hs256_secret(
                "another-secret-another-secret-32",
            ))
            .await;
        assert!(matches!(
            service.validate_access(&foreign.access_token).await,
            Err(TokenError::SignatureInvalid)
        ));
    }

    #[tokio::test]
    async fn refresh_rotates_and_detects_reuse() {
        let service = service();
        let user = seed_user(&service.storage).await;
        let claims = claims_for(&service, &user);
        let issued = service
            .issue(claims, None, Duration::days(30), false, None)
            .await
            .unwrap();

        let rotated = service.refresh(&issued.refresh_token, None).await.unwrap();
        assert_ne!(rotated.refresh_token, issued.refresh_token);

        // Replaying the first token is a breach: everything gets revoked.
        assert!(matches!(
            service.refresh(&issued.refresh_token, None).await,
            Err(TokenError::ReuseDetected)
        ));
        let active = service
            .storage
            .refresh_tokens
            .count_active_for_user(user.id)
            .await
            .unwrap();
        assert_eq!(active, 0);

        // The rotated token was revoked by the breach response too.
        assert!(matches!(
            service.refresh(&rotated.refresh_token, None).await,
            Err(TokenError::ReuseDetected)
        ));
    }

    #[tokio::test]
    async fn concurrent_refreshes_linearise() {
        let service = Arc::new(service());
        let user = seed_user(&service.storage).await;
        let claims = claims_for(&service, &user);
        let issued = service
            .issue(claims, None, Duration::days(30), false, None)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            let token = issued.refresh_token.clone();
            handles.push(tokio::spawn(async move {
                service.refresh(&token, None).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(TokenError::Revoked | TokenError::ReuseDetected) => {}
                Err(other) => panic!("unexpected refresh error: {:?}", other),
            }
        }
        assert_eq!(successes, 1, "exactly one concurrent refresh must win");
    }

    #[tokio::test]
    async fn client_mismatch_is_rejected() {
        let service = service();
        let user = seed_user(&service.storage).await;
        service
            .storage
            .oauth_clients
            .create(&crate::database::models::OAuthClient {
                id: Uuid::new_v4(),
                tenant_id: Uuid::new_v4(),
                client_id: "client-1".to_string(),
                client_secret_hash: "unused".to_string(),
                redirect_uris: vec![],
                grant_types: vec!["refresh_token".to_string()],
                scopes: vec![],
                is_confidential: true,
                is_active: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let claims = claims_for(&service, &user);
        let issued = service
            .issue(
                claims,
                None,
                Duration::days(30),
                false,
                Some("client-1".to_string()),
            )
            .await
            .unwrap();

        assert!(matches!(
            service.refresh(&issued.refresh_token, Some("client-2")).await,
            Err(TokenError::ClientMismatch)
        ));
        // The right client still works.
        assert!(service
            .refresh(&issued.refresh_token, Some("client-1"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn revoke_all_is_idempotent() {
        let service = service();
        let user = seed_user(&service.storage).await;
        let claims = claims_for(&service, &user);
        service
            .issue(claims, None, Duration::days(30), false, None)
            .await
            .unwrap();

        let first = service.revoke_all_for_user(user.id).await.unwrap();
        assert_eq!(first, 1);
        let second = service.revoke_all_for_user(user.id).await.unwrap();
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn introspection_reports_active_state() {
        let service = service();
        let user = seed_user(&service.storage).await;
        let claims = claims_for(&service, &user);
        let issued = service
            .issue(claims, None, Duration::days(30), false, None)
            .await
            .unwrap();

        let active = service.introspect(&issued.access_token).await;
        assert_eq!(active["active"], true);
        assert_eq!(active["sub"], user.id.to_string());

        let inactive = service.introspect("garbage").await;
        assert_eq!(inactive["active"], false);
    }
}

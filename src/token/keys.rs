use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::config::SecurityConfig;
use crate::error::AuthError;

/// One signing key: material for both directions plus the JWKS fields for
/// RSA keys.
pub struct SigningKey {
    pub kid: String,
    pub alg: Algorithm,
    pub encoding: EncodingKey,
    pub decoding: DecodingKey,
    /// `(n, e)` base64url, present for RSA keys only.
    jwk_components: Option<(String, String)>,
}

impl SigningKey {
    fn from_rsa_pem(pem: &str) -> Result<Self, AuthError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| AuthError::CryptoFailure(format!("RSA private key: {}", e)))?;
        let public = RsaPublicKey::from(&private);

        let public_der = public
            .to_public_key_der()
            .map_err(|e| AuthError::CryptoFailure(format!("RSA public key: {}", e)))?;
        let kid = {
            let digest = Sha256::digest(public_der.as_bytes());
            format!("{:x}", digest)[..16].to_string()
        };

        let public_pem = public
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| AuthError::CryptoFailure(format!("RSA public key: {}", e)))?;

        let encoding = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AuthError::CryptoFailure(format!("RSA private key: {}", e)))?;
        let decoding = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| AuthError::CryptoFailure(format!("RSA public key: {}", e)))?;

        let n = URL_SAFE_NO_PAD.encode(public.n().to_bytes_be());
        let e = URL_SAFE_NO_PAD.encode(public.e().to_bytes_be());

        Ok(Self {
            kid,
            alg: Algorithm::RS256,
            encoding,
            decoding,
            jwk_components: Some((n, e)),
        })
    }

    fn from_hs256_secret(secret: &str) -> Self {
        let kid = {
            let digest = Sha256::digest(secret.as_bytes());
            format!("hs-{:x}", digest)[..16].to_string()
        };
        Self {
            kid,
            alg: Algorithm::HS256,
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            jwk_components: None,
        }
    }

    fn jwk(&self) -> Option<Value> {
        self.jwk_components.as_ref().map(|(n, e)| {
            json!({
                "kty": "RSA",
                "use": "sig",
                "alg": "RS256",
                "kid": self.kid,
                "n": n,
                "e": e,
            })
        })
    }
}

/// The keys accepted for verification, with exactly one active for signing.
/// Rotation keeps the previous keys in `accepted` so tokens signed before the
/// swap keep validating until they expire.
pub struct KeyRing {
    active: SigningKey,
    accepted: Vec<SigningKey>,
}

impl KeyRing {
    /// RS256 preferred: an RSA key path enables it. HS256 only as the
    /// development fallback.
    pub fn from_config(security: &SecurityConfig) -> Result<Self, AuthError> {
        match &security.jwt_rsa_private_key_path {
            Some(path) => {
                let pem = std::fs::read_to_string(path).map_err(|e| {
                    AuthError::CryptoFailure(format!("cannot read RSA key {}: {}", path, e))
                })?;
                Self::from_rsa_pem(&pem)
            }
            None => {
                tracing::warn!("No RSA key configured; falling back to HS256 signing");
                Ok(Self::from_hs256_secret(&security.jwt_signing_key))
            }
        }
    }

    pub fn from_rsa_pem(pem: &str) -> Result<Self, AuthError> {
        let active = SigningKey::from_rsa_pem(pem)?;
        Ok(Self {
            active,
            accepted: Vec::new(),
        })
    }

    pub fn from_hs256_secret(secret: &str) -> Self {
        Self {
            active: SigningKey::from_hs256_secret(secret),
            accepted: Vec::new(),
        }
    }

    /// A new ring with `self`'s keys demoted to verification-only.
    pub fn rotated(self, new_active: SigningKey) -> Self {
        let mut accepted = self.accepted;
        accepted.push(self.active);
        Self {
            active: new_active,
            accepted,
        }
    }

    pub fn active(&self) -> &SigningKey {
        &self.active
    }

    /// Find a verification key by `kid`, checking the active key first.
    pub fn find(&self, kid: &str) -> Option<&SigningKey> {
        if self.active.kid == kid {
            return Some(&self.active);
        }
        self.accepted.iter().find(|key| key.kid == kid)
    }

    pub fn all(&self) -> impl Iterator<Item = &SigningKey> {
        std::iter::once(&self.active).chain(self.accepted.iter())
    }

    /// RFC 7517 key set for the public keys in rotation. HS256 keys are never
    /// published, so the set is empty in fallback mode.
    pub fn jwks(&self) -> Value {
        let keys: Vec<Value> = self.all().filter_map(SigningKey::jwk).collect();
        json!({ "keys": keys })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hs256_ring_has_active_key_and_empty_jwks() {
        let ring = KeyRing::from_hs256_secret("development-only-signing-key-32b!");
        assert_eq!(ring.active().alg, Algorithm::HS256);
        assert!(ring.active().kid.starts_with("hs-"));
        assert_eq!(ring.jwks()["keys"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn find_resolves_active_kid() {
        let ring = KeyRing::from_hs256_secret("development-only-signing-key-32b!");
        let kid = ring.active().kid.clone();
        assert!(ring.find(&kid).is_some());
        assert!(ring.find("unknown").is_none());
    }

    #[test]
    fn rotation_keeps_old_key_for_verification() {
        let old = KeyRing::from_hs256_secret("old-secret-old-secret-old-secret!");
        let old_kid = old.active().kid.clone();
        let new_key = KeyRing::from_hs256_secret("new-secret-new-secret-new-secret!").active;
        let ring = old.rotated(new_key);
        assert_ne!(ring.active().kid, old_kid);
        assert!(ring.find(&old_kid).is_some());
    }
}

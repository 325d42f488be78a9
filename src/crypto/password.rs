use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Algorithm, Argon2, Params, PasswordHasher, PasswordVerifier, Version};

use super::CryptoError;

// Argon2id parameters: 64 MiB memory, 3 iterations, 4 lanes, 32-byte key.
const MEMORY_KIB: u32 = 64 * 1024;
const ITERATIONS: u32 = 3;
const PARALLELISM: u32 = 4;
const OUTPUT_LEN: usize = 32;

fn hasher() -> Result<Argon2<'static>, CryptoError> {
    let params = Params::new(MEMORY_KIB, ITERATIONS, PARALLELISM, Some(OUTPUT_LEN))
        .map_err(|e| CryptoError::Hashing(e.to_string()))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hash a password into a PHC-encoded Argon2id string.
pub fn hash_password(plain: &str) -> Result<String, CryptoError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = hasher()?
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| CryptoError::Hashing(e.to_string()))?;
    Ok(hash.to_string())
}

/// Verify a password against a PHC-encoded hash. The comparison on the
/// derived key is constant-time inside the argon2 crate. Parameters are read
/// from the encoded string, so hashes survive cost-parameter bumps.
pub fn verify_password(plain: &str, encoded: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(encoded) else {
        return false;
    };
    Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify_round_trips() {
        let encoded = hash_password("Hunter2!!Hunter2").unwrap();
        assert!(encoded.starts_with("$argon2id$"));
        assert!(verify_password("Hunter2!!Hunter2", &encoded));
        assert!(!verify_password("wrong", &encoded));
    }

    #[test]
    fn verify_survives_different_cost_parameters() {
        // A hash produced with lighter parameters must still verify, since
        // the parameters are carried in the PHC string.
        let params = Params::new(8 * 1024, 1, 1, Some(32)).unwrap();
        let light = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let salt = SaltString::generate(&mut OsRng);
        let encoded = light
            .hash_password(b"portable-password", &salt)
            .unwrap()
            .to_string();
        assert!(verify_password("portable-password", &encoded));
    }

    #[test]
    fn garbage_encoding_never_verifies() {
        assert!(!verify_password("anything", "not-a-phc-string"));
    }
}

use rand::Rng;

use super::CryptoError;

const CODE_LEN: usize = 16;
const BCRYPT_COST: u32 = 10;
// Base32 alphabet: unambiguous in print, case-insensitive to type.
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// One batch of recovery codes: the plaintexts (shown to the user exactly
/// once) and the bcrypt hashes that get persisted.
#[derive(Debug, Clone)]
pub struct RecoveryCodeBatch {
    pub plain: Vec<String>,
    pub hashed: Vec<String>,
}

/// Generate `n` recovery codes, 16 base32 characters each.
pub fn new_recovery_codes(n: usize) -> Result<RecoveryCodeBatch, CryptoError> {
    let mut rng = rand::thread_rng();
    let mut plain = Vec::with_capacity(n);
    let mut hashed = Vec::with_capacity(n);

    for _ in 0..n {
        let code: String = (0..CODE_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        let hash = bcrypt::hash(&code, BCRYPT_COST)
            .map_err(|e| CryptoError::Hashing(e.to_string()))?;
        plain.push(code);
        hashed.push(hash);
    }

    Ok(RecoveryCodeBatch { plain, hashed })
}

/// Check a presented code against a stored bcrypt hash. Codes are normalised
/// to uppercase before comparison.
pub fn verify_recovery_code(code: &str, hash: &str) -> bool {
    bcrypt::verify(code.trim().to_uppercase(), hash).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_has_requested_size_and_shape() {
        let batch = new_recovery_codes(10).unwrap();
        assert_eq!(batch.plain.len(), 10);
        assert_eq!(batch.hashed.len(), 10);
        for code in &batch.plain {
            assert_eq!(code.len(), CODE_LEN);
            assert!(code.bytes().all(|b| ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn codes_verify_against_their_own_hash_only() {
        let batch = new_recovery_codes(2).unwrap();
        assert!(verify_recovery_code(&batch.plain[0], &batch.hashed[0]));
        assert!(!verify_recovery_code(&batch.plain[0], &batch.hashed[1]));
    }

    #[test]
    fn verification_is_case_insensitive() {
        let batch = new_recovery_codes(1).unwrap();
        let lowered = batch.plain[0].to_lowercase();
        assert!(verify_recovery_code(&lowered, &batch.hashed[0]));
    }
}

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};

use super::CryptoError;

const NONCE_LEN: usize = 12;

/// AES-256-GCM encrypt with a random 12-byte nonce prepended to the output.
pub fn encrypt(plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a nonce-prefixed AES-256-GCM envelope. Auth-tag mismatch, a wrong
/// key, or a truncated envelope all surface as `CryptoError::Decryption`.
pub fn decrypt(envelope: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    if envelope.len() < NONCE_LEN {
        return Err(CryptoError::Decryption);
    }
    let (nonce, ciphertext) = envelope.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trips() {
        let key = [7u8; 32];
        let envelope = encrypt(b"totp-secret-material", &key).unwrap();
        assert_eq!(decrypt(&envelope, &key).unwrap(), b"totp-secret-material");
    }

    #[test]
    fn wrong_key_fails_auth() {
        let key = [7u8; 32];
        let other = [8u8; 32];
        let envelope = encrypt(b"secret", &key).unwrap();
        assert!(matches!(
            decrypt(&envelope, &other),
            Err(CryptoError::Decryption)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let key = [7u8; 32];
        let mut envelope = encrypt(b"secret", &key).unwrap();
        let last = envelope.len() - 1;
        envelope[last] ^= 0x01;
        assert!(decrypt(&envelope, &key).is_err());
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let key = [7u8; 32];
        assert!(decrypt(&[0u8; 5], &key).is_err());
    }

    #[test]
    fn nonces_are_random_per_call() {
        let key = [7u8; 32];
        let a = encrypt(b"same", &key).unwrap();
        let b = encrypt(b"same", &key).unwrap();
        assert_ne!(a, b);
    }
}

pub mod cipher;
pub mod password;
pub mod recovery;
pub mod totp;

use crate::error::AuthError;

/// Failures from the crypto primitives. Collapsed into `AuthError::CryptoFailure`
/// at the service boundary so callers never branch on primitive internals.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Password hashing failed: {0}")]
    Hashing(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed")]
    Decryption,

    #[error("TOTP failure: {0}")]
    Totp(String),
}

impl From<CryptoError> for AuthError {
    fn from(err: CryptoError) -> Self {
        AuthError::CryptoFailure(err.to_string())
    }
}

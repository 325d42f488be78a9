use totp_rs::{Algorithm, Secret, TOTP};

use super::CryptoError;

// RFC 6238 defaults used by every mainstream authenticator app.
const DIGITS: usize = 6;
const SKEW: u8 = 1;
const STEP: u64 = 30;

/// A freshly provisioned TOTP secret plus the material the client needs to
/// enroll: the otpauth URI and a QR code rendered as a base64 PNG.
#[derive(Debug, Clone)]
pub struct TotpEnrollment {
    pub secret_b32: String,
    pub otpauth_uri: String,
    pub qr_png_base64: String,
}

fn build(secret_b32: &str, issuer: &str, account: &str) -> Result<TOTP, CryptoError> {
    let bytes = Secret::Encoded(secret_b32.to_string())
        .to_bytes()
        .map_err(|e| CryptoError::Totp(format!("invalid base32 secret: {:?}", e)))?;
    TOTP::new(
        Algorithm::SHA1,
        DIGITS,
        SKEW,
        STEP,
        bytes,
        Some(issuer.to_string()),
        account.to_string(),
    )
    .map_err(|e| CryptoError::Totp(e.to_string()))
}

/// Generate a new TOTP secret for `account` under `issuer`.
pub fn new_totp(issuer: &str, account: &str) -> Result<TotpEnrollment, CryptoError> {
    let Secret::Encoded(secret_b32) = Secret::generate_secret().to_encoded() else {
        return Err(CryptoError::Totp("secret encoding failed".to_string()));
    };
    let totp = build(&secret_b32, issuer, account)?;

    let otpauth_uri = totp.get_url();
    let qr_png_base64 = totp
        .get_qr_base64()
        .map_err(|e| CryptoError::Totp(format!("QR rendering failed: {}", e)))?;

    Ok(TotpEnrollment {
        secret_b32,
        otpauth_uri,
        qr_png_base64,
    })
}

/// Verify a 6-digit code against a base32 secret at `now` (unix seconds),
/// accepting one 30-second step of clock skew in either direction.
pub fn verify_totp(secret_b32: &str, code: &str, now: u64) -> bool {
    let Ok(totp) = build(secret_b32, "verify", "verify") else {
        return false;
    };
    totp.check(code, now)
}

/// Generate the current code for a secret. Used by enrollment flows and tests.
pub fn generate_code(secret_b32: &str, now: u64) -> Result<String, CryptoError> {
    let totp = build(secret_b32, "generate", "generate")?;
    Ok(totp.generate(now))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrollment_produces_uri_and_qr() {
        let enrollment = new_totp("Tessera", "alice@t1.example").unwrap();
        assert!(enrollment.otpauth_uri.starts_with("otpauth://totp/"));
        assert!(enrollment.otpauth_uri.contains("Tessera"));
        assert!(!enrollment.qr_png_base64.is_empty());
    }

    #[test]
    fn generated_code_verifies_at_same_instant() {
        let enrollment = new_totp("Tessera", "alice").unwrap();
        let now = 1_700_000_000;
        let code = generate_code(&enrollment.secret_b32, now).unwrap();
        assert!(verify_totp(&enrollment.secret_b32, &code, now));
    }

    #[test]
    fn one_step_of_skew_is_accepted() {
        let enrollment = new_totp("Tessera", "alice").unwrap();
        let now = 1_700_000_000;
        let code = generate_code(&enrollment.secret_b32, now).unwrap();
        assert!(verify_totp(&enrollment.secret_b32, &code, now + STEP));
        assert!(verify_totp(&enrollment.secret_b32, &code, now - STEP));
        assert!(!verify_totp(&enrollment.secret_b32, &code, now + 3 * STEP));
    }

    #[test]
    fn wrong_code_is_rejected() {
        let enrollment = new_totp("Tessera", "alice").unwrap();
        assert!(!verify_totp(&enrollment.secret_b32, "000000", 1_700_000_000));
    }
}

//! HMAC-SHA256 signatures over callback payloads.
//!
//! Providers sign the canonical JSON encoding of the callback body: keys in
//! lexicographic order, no insignificant whitespace. Signing the canonical
//! form rather than the raw bytes lets a callback replayed from the retry
//! queue, which only keeps the decoded payload, be verified again.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Signature validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// The signature header is absent or empty.
    #[error("signature header missing")]
    MissingSignature,

    /// The signature is not in a recognised format.
    #[error("invalid signature format: {0}")]
    InvalidFormat(String),

    /// The signature does not match the payload.
    #[error("signature verification failed")]
    VerificationFailed,

    /// The configured secret cannot key an HMAC.
    #[error("invalid secret key")]
    InvalidSecret,
}

/// Canonical byte encoding of a JSON payload.
///
/// `serde_json` keeps object keys in a sorted map, so serializing the value
/// yields keys in lexicographic order at every nesting level.
pub fn canonical_json(payload: &serde_json::Value) -> Vec<u8> {
    payload.to_string().into_bytes()
}

/// Generates the hex HMAC-SHA256 of `message` under `secret`.
///
/// # Errors
///
/// Returns `SignatureError::InvalidSecret` if the secret is empty.
pub fn generate_hmac_hex(message: &[u8], secret: &str) -> Result<String, SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::InvalidSecret);
    }

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Signs a payload in the `sha256=<hex>` form providers send.
///
/// # Errors
///
/// Returns `SignatureError::InvalidSecret` if the secret is empty.
pub fn sign_payload(payload: &serde_json::Value, secret: &str) -> Result<String, SignatureError> {
    generate_hmac_hex(&canonical_json(payload), secret).map(|hex| format!("sha256={hex}"))
}

/// Verifies a provider signature against a payload.
///
/// Accepts `sha256=<hex>` or bare 64-character hex.
///
/// # Errors
///
/// Returns the reason verification failed.
pub fn verify_payload_signature(
    payload: &serde_json::Value,
    signature: &str,
    secret: &str,
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::MissingSignature);
    }

    let provided = parse_signature_format(signature)?;
    let expected = generate_hmac_hex(&canonical_json(payload), secret)?;

    if timing_safe_eq(&provided.to_ascii_lowercase(), &expected) {
        Ok(())
    } else {
        Err(SignatureError::VerificationFailed)
    }
}

fn parse_signature_format(signature: &str) -> Result<&str, SignatureError> {
    let hex = signature.strip_prefix("sha256=").unwrap_or(signature);

    if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(hex);
    }

    Err(SignatureError::InvalidFormat(
        "expected 'sha256=<hex>' or 64 hex characters".to_string(),
    ))
}

/// Constant-time comparison so mismatches do not leak through timing.
fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn signed_payload_verifies() {
        let payload = json!({"status": "in_transit", "tracking_number": "TRK1"});
        let signature = sign_payload(&payload, "secret").unwrap();

        assert!(signature.starts_with("sha256="));
        assert_eq!(verify_payload_signature(&payload, &signature, "secret"), Ok(()));
    }

    #[test]
    fn bare_hex_and_uppercase_are_accepted() {
        let payload = json!({"status": "delivered"});
        let hex = generate_hmac_hex(&canonical_json(&payload), "secret").unwrap();

        assert_eq!(verify_payload_signature(&payload, &hex, "secret"), Ok(()));
        assert_eq!(verify_payload_signature(&payload, &hex.to_ascii_uppercase(), "secret"), Ok(()));
    }

    #[test]
    fn key_order_does_not_matter() {
        let a: serde_json::Value = serde_json::from_str(r#"{"b":1,"a":{"d":2,"c":3}}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"a":{"c":3,"d":2},"b":1}"#).unwrap();

        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), br#"{"a":{"c":3,"d":2},"b":1}"#.to_vec());
    }

    #[test]
    fn tampered_payload_fails() {
        let signature = sign_payload(&json!({"status": "in_transit"}), "secret").unwrap();

        assert_eq!(
            verify_payload_signature(&json!({"status": "delivered"}), &signature, "secret"),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn wrong_secret_fails() {
        let payload = json!({"status": "in_transit"});
        let signature = sign_payload(&payload, "secret").unwrap();

        assert_eq!(
            verify_payload_signature(&payload, &signature, "other"),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn malformed_signatures_are_rejected() {
        let payload = json!({});

        assert_eq!(
            verify_payload_signature(&payload, "", "secret"),
            Err(SignatureError::MissingSignature)
        );
        assert!(matches!(
            verify_payload_signature(&payload, "v1=abc", "secret"),
            Err(SignatureError::InvalidFormat(_))
        ));
        assert!(matches!(
            verify_payload_signature(&payload, "sha256=zz", "secret"),
            Err(SignatureError::InvalidFormat(_))
        ));
    }

    #[test]
    fn empty_secret_is_invalid() {
        assert_eq!(sign_payload(&json!({}), ""), Err(SignatureError::InvalidSecret));
    }

    #[test]
    fn timing_safe_eq_compares_exactly() {
        assert!(timing_safe_eq("abc", "abc"));
        assert!(!timing_safe_eq("abc", "abd"));
        assert!(!timing_safe_eq("abc", "ab"));
    }
}

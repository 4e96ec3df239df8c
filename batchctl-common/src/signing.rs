//! HMAC-SHA256 signing for outbound webhook deliveries.
//!
//! Receivers verify a delivery came from this control plane by recomputing the signature over
//! the timestamp and raw payload bytes with their copy of the per-endpoint secret, the same
//! construction used by most webhook providers.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("invalid signing secret")]
    InvalidSecret,
}

/// Computes `hex(HMAC-SHA256(secret, "{timestamp}.{payload}"))`, the value sent in the
/// `X-Signature` header alongside `X-Timestamp`.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String, SigningError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SigningError::InvalidSecret)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Recomputes the signature and compares it against the one a receiver claims, for use in the
/// control plane's own tests and any local webhook-receiver tooling.
pub fn verify_signature(
    secret: &str,
    timestamp: i64,
    payload: &[u8],
    signature: &str,
) -> Result<bool, SigningError> {
    let expected = sign_payload(secret, timestamp, payload)?;
    Ok(constant_time_eq(expected.as_bytes(), signature.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic() {
        let a = sign_payload("secret", 1_700_000_000, b"{\"hello\":\"world\"}").unwrap();
        let b = sign_payload("secret", 1_700_000_000, b"{\"hello\":\"world\"}").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_secrets_produce_different_signatures() {
        let a = sign_payload("secret-a", 1_700_000_000, b"payload").unwrap();
        let b = sign_payload("secret-b", 1_700_000_000, b"payload").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn verify_roundtrips() {
        let signature = sign_payload("secret", 1_700_000_000, b"payload").unwrap();
        assert!(verify_signature("secret", 1_700_000_000, b"payload", &signature).unwrap());
        assert!(!verify_signature("secret", 1_700_000_000, b"tampered", &signature).unwrap());
    }
}

//! Webhook signature verification.
//!
//! Both webhook endpoints authenticate with `X-Signature:
//! sha256=<64 lowercase hex>` computed as HMAC-SHA256 over the raw request
//! body. The body must be read as raw bytes before any parsing, and every
//! comparison against secret material is constant-time.

use hmac::{Hmac, Mac};
use regex::Regex;
use sha2::Sha256;
use std::sync::OnceLock;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, PartialEq, Eq)]
pub enum SignatureError {
    /// No signature header at all → 401.
    Missing,
    /// Header present but not `sha256=<64 hex>` → 400.
    Malformed,
    /// Well-formed but digest does not match → 401.
    Mismatch,
}

fn signature_format() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^sha256=[0-9a-f]{64}$").unwrap())
}

/// Verify an `X-Signature` header value against the raw body.
pub fn verify_signature(
    secret: &str,
    body: &[u8],
    header: Option<&str>,
) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::Missing)?;

    if !signature_format().is_match(header) {
        return Err(SignatureError::Malformed);
    }
    let hex_digest = &header["sha256=".len()..];
    let provided = hex::decode(hex_digest).map_err(|_| SignatureError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::Mismatch)?;
    mac.update(body);
    // verify_slice is constant-time over the digest bytes.
    mac.verify_slice(&provided).map_err(|_| SignatureError::Mismatch)
}

/// Compute the header value for a body, used by tests and by operators
/// debugging webhook producers.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time equality for bearer-token checks. Compares every byte
/// regardless of where the first difference occurs, and folds the length
/// difference into the result instead of early-returning.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = (a.len() ^ b.len()) as u8;
    let len = a.len().min(b.len());
    for i in 0..len {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-webhook-secret-0123456789abcdef0123";

    #[test]
    fn test_round_trip_verifies() {
        let body = br#"{"type":"crawl.page"}"#;
        let header = sign_body(SECRET, body);
        assert!(verify_signature(SECRET, body, Some(&header)).is_ok());
    }

    #[test]
    fn test_missing_header() {
        assert_eq!(
            verify_signature(SECRET, b"{}", None),
            Err(SignatureError::Missing)
        );
    }

    #[test]
    fn test_malformed_header() {
        for bad in [
            "deadbeef",
            "sha256=xyz",
            "sha256=DEADBEEF",
            "sha1=0000000000000000000000000000000000000000000000000000000000000000",
            "sha256=0000",
        ] {
            assert_eq!(
                verify_signature(SECRET, b"{}", Some(bad)),
                Err(SignatureError::Malformed),
                "{:?} should be malformed",
                bad
            );
        }
    }

    #[test]
    fn test_wrong_key_mismatch() {
        let body = b"payload";
        let header = sign_body("another-secret-another-secret-another-00", body);
        assert_eq!(
            verify_signature(SECRET, body, Some(&header)),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_tampered_body_mismatch() {
        let header = sign_body(SECRET, b"original");
        assert_eq!(
            verify_signature(SECRET, b"tampered", Some(&header)),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}

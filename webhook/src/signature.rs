//! `X-Hub-Signature-256` verification: HMAC SHA-256 over the raw body,
//! encoded as `sha256=<hex>`, compared in constant time.

use hmac::Hmac;
use hmac::Mac;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// Compute the signature header value GitHub would send for `payload`.
pub fn sign(payload: &[u8], secret: &str) -> String {
    #[allow(clippy::expect_used)]
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a presented `sha256=<hex>` header against the raw body.
pub fn verify(payload: &[u8], signature_header: &str, secret: &str) -> bool {
    let Some(presented_hex) = signature_header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(presented) = hex::decode(presented_hex) else {
        return false;
    };

    #[allow(clippy::expect_used)]
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    expected.ct_eq(presented.as_slice()).unwrap_u8() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_round_trip() {
        let payload = br#"{"action":"opened"}"#;
        let signature = sign(payload, "webhook-secret");
        assert!(signature.starts_with("sha256="));
        assert!(verify(payload, &signature, "webhook-secret"));
    }

    #[test]
    fn tampered_payloads_fail() {
        let signature = sign(br#"{"action":"opened"}"#, "webhook-secret");
        assert!(!verify(br#"{"action":"closed"}"#, &signature, "webhook-secret"));
    }

    #[test]
    fn wrong_secret_fails() {
        let payload = br#"{"action":"opened"}"#;
        let signature = sign(payload, "webhook-secret");
        assert!(!verify(payload, &signature, "other-secret"));
    }

    #[test]
    fn malformed_headers_fail_closed() {
        let payload = b"{}";
        for header in ["", "sha1=abcd", "sha256=", "sha256=zz", "abcdef"] {
            assert!(!verify(payload, header, "s"), "accepted `{header}`");
        }
    }
}

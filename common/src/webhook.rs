// Webhook tokens and HMAC signature validation

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signature header names accepted on inbound webhook requests, in
/// precedence order. All carry `sha256=<hex>` values.
pub const SIGNATURE_HEADERS: [&str; 3] = [
    "X-GAGOS-Signature",
    "X-Hub-Signature-256",
    "X-Signature-256",
];

/// Header attached to outbound notification deliveries
pub const OUTBOUND_SIGNATURE_HEADER: &str = "X-GAGOS-Signature";

/// Generate an opaque URL-safe webhook token (32 bytes, hex-encoded).
/// Embedded in the webhook URL; unrelated to any HMAC secret.
pub fn generate_webhook_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Byte-wise comparison that does not short-circuit, so timing reveals only
/// the length. Both tokens and signatures go through this.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Compute `sha256=<hex>` over a body, the form carried by signature headers
pub fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Validate a `sha256=<hex>` signature header value against a raw body.
/// Verification goes through `Mac::verify_slice`, which is constant time.
pub fn verify_signature(secret: &str, payload: &[u8], header_value: &str) -> bool {
    let Some(hex_digest) = header_value.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_webhook_token_shape() {
        let t1 = generate_webhook_token();
        let t2 = generate_webhook_token();
        assert_ne!(t1, t2);
        assert_eq!(t1.len(), 64);
        assert!(hex::decode(&t1).is_ok());
    }

    #[test]
    fn test_sign_then_verify() {
        let body = br#"{"ref":"main"}"#;
        let sig = sign_payload("s3cret", body);
        assert!(sig.starts_with("sha256="));
        assert!(verify_signature("s3cret", body, &sig));
    }

    #[test]
    fn test_verify_rejects_wrong_secret() {
        let body = b"{}";
        let sig = sign_payload("s3cret", body);
        assert!(!verify_signature("other", body, &sig));
    }

    #[test]
    fn test_verify_rejects_tampered_body() {
        let sig = sign_payload("s3cret", b"{}");
        assert!(!verify_signature("s3cret", b"{ }", &sig));
    }

    #[test]
    fn test_verify_rejects_malformed_header() {
        assert!(!verify_signature("s3cret", b"{}", "not-a-signature"));
        assert!(!verify_signature("s3cret", b"{}", "sha256=zzzz"));
        assert!(!verify_signature("s3cret", b"{}", ""));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}

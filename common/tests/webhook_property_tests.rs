// Property-based tests for webhook token generation and HMAC admission

use common::webhook::{constant_time_eq, generate_webhook_token, sign_payload, verify_signature};
use proptest::prelude::*;

proptest! {
    // Signing a body and verifying it with the same secret always admits
    #[test]
    fn prop_sign_verify_roundtrip(secret in ".{1,64}", body in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let signature = sign_payload(&secret, &body);
        prop_assert!(verify_signature(&secret, &body, &signature));
    }

    // Any signature other than the correct one is rejected
    #[test]
    fn prop_wrong_signature_rejected(
        secret in "[a-zA-Z0-9]{1,32}",
        body in proptest::collection::vec(any::<u8>(), 0..512),
        forged_hex in "[0-9a-f]{64}",
    ) {
        let genuine = sign_payload(&secret, &body);
        let forged = format!("sha256={}", forged_hex);
        prop_assume!(forged != genuine);
        prop_assert!(!verify_signature(&secret, &body, &forged));
    }

    // A different secret never validates the same body
    #[test]
    fn prop_different_secret_rejected(
        secret_a in "[a-z]{8,32}",
        secret_b in "[A-Z]{8,32}",
        body in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let signature = sign_payload(&secret_a, &body);
        prop_assert!(!verify_signature(&secret_b, &body, &signature));
    }

    // Changing a single byte of the body invalidates the signature
    #[test]
    fn prop_tampered_body_rejected(
        secret in "[a-z]{8,16}",
        mut body in proptest::collection::vec(any::<u8>(), 1..512),
        flip_at_factor in 0.0f64..1.0,
    ) {
        let signature = sign_payload(&secret, &body);
        let idx = ((body.len() as f64) * flip_at_factor) as usize % body.len();
        body[idx] ^= 0x01;
        prop_assert!(!verify_signature(&secret, &body, &signature));
    }

    // Malformed header values are never admitted
    #[test]
    fn prop_malformed_header_rejected(
        secret in "[a-z]{8,16}",
        body in proptest::collection::vec(any::<u8>(), 0..128),
        junk in "[^=]{0,64}",
    ) {
        prop_assert!(!verify_signature(&secret, &body, &junk));
    }

    // constant_time_eq agrees with == on arbitrary byte strings
    #[test]
    fn prop_constant_time_eq_semantics(
        a in proptest::collection::vec(any::<u8>(), 0..64),
        b in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        prop_assert_eq!(constant_time_eq(&a, &b), a == b);
    }
}

#[test]
fn generated_tokens_are_long_and_unique() {
    let mut seen = std::collections::HashSet::new();
    for _ in 0..100 {
        let token = generate_webhook_token();
        assert!(token.len() >= 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(seen.insert(token), "token repeated");
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0
//! Webhook signature verification and operator-token auth. Both comparisons
//! are constant-time; an empty configured secret/token disables its check.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Verify a `sha256=<hex>` webhook signature over `body`.
pub fn verify_webhook_signature(body: &[u8], signature: Option<&str>, secret: &str) -> bool {
    if secret.is_empty() {
        return true;
    }
    let Some(signature) = signature else {
        return false;
    };
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(provided) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

/// Compute the `sha256=<hex>` signature for a body (used by tests and docs).
pub fn sign_webhook_body(body: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Whether the provided operator token matches the configured one.
pub fn operator_token_valid(provided: Option<&str>, expected: &str) -> bool {
    if expected.is_empty() {
        return true;
    }
    let Some(provided) = provided else {
        return false;
    };
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_secret_accepts_anything() {
        assert!(verify_webhook_signature(b"body", None, ""));
        assert!(verify_webhook_signature(b"body", Some("sha256=junk"), ""));
    }

    #[test]
    fn valid_signature_roundtrip() {
        let body = br#"{"action":"labeled"}"#;
        let sig = sign_webhook_body(body, "hunter2");
        assert!(verify_webhook_signature(body, Some(&sig), "hunter2"));
    }

    #[test]
    fn tampered_body_or_secret_rejects() {
        let body = b"payload";
        let sig = sign_webhook_body(body, "hunter2");
        assert!(!verify_webhook_signature(b"other payload", Some(&sig), "hunter2"));
        assert!(!verify_webhook_signature(body, Some(&sig), "different"));
    }

    #[test]
    fn malformed_signatures_reject() {
        assert!(!verify_webhook_signature(b"x", None, "secret"));
        assert!(!verify_webhook_signature(b"x", Some("md5=abc"), "secret"));
        assert!(!verify_webhook_signature(b"x", Some("sha256=nothex"), "secret"));
    }

    #[test]
    fn operator_token_rules() {
        assert!(operator_token_valid(None, ""));
        assert!(operator_token_valid(Some("anything"), ""));
        assert!(operator_token_valid(Some("tok"), "tok"));
        assert!(!operator_token_valid(Some("tok "), "tok"));
        assert!(!operator_token_valid(Some("wrong"), "tok"));
        assert!(!operator_token_valid(None, "tok"));
    }
}

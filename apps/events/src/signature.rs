use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// Compute the hex-encoded HMAC-SHA256 signature of a raw webhook payload.
pub fn compute_signature(secret: &str, payload: &[u8]) -> String {
    // HMAC accepts keys of any length, so new_from_slice cannot fail here.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a caller-supplied signature against the raw payload bytes.
///
/// The presented value may carry a `sha256=` prefix. Comparison is
/// constant-time; malformed input is a plain `false`, never an error. This
/// runs before any audit write, so a rejected delivery touches no storage.
#[must_use]
pub fn verify_signature(payload: &[u8], presented: &str, secret: &str) -> bool {
    let expected = compute_signature(secret, payload);
    if expected.is_empty() {
        return false;
    }
    let trimmed = presented.trim();
    let presented = trimmed.strip_prefix(SIGNATURE_PREFIX).unwrap_or(trimmed);
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::{compute_signature, verify_signature};

    #[test]
    fn roundtrip_verifies_for_the_signing_secret() {
        let payload = br#"{"event_type":"reward.completed","payload":{"amount":25.0}}"#;
        let signature = compute_signature("whsec_test", payload);
        assert!(verify_signature(payload, &signature, "whsec_test"));
        assert!(verify_signature(
            payload,
            &format!("sha256={signature}"),
            "whsec_test"
        ));
    }

    #[test]
    fn altered_payload_or_signature_fails() {
        let payload = b"{\"amount\":25}";
        let signature = compute_signature("whsec_test", payload);

        assert!(!verify_signature(b"{\"amount\":26}", &signature, "whsec_test"));

        let mut tampered = signature.clone().into_bytes();
        tampered[0] = if tampered[0] == b'0' { b'1' } else { b'0' };
        let tampered = String::from_utf8(tampered).expect("hex stays utf8");
        assert!(!verify_signature(payload, &tampered, "whsec_test"));
    }

    #[test]
    fn wrong_secret_fails() {
        let payload = b"payload";
        let signature = compute_signature("whsec_test", payload);
        assert!(!verify_signature(payload, &signature, "whsec_other"));
    }

    #[test]
    fn short_or_garbage_signature_is_rejected_not_an_error() {
        let payload = br#"{"type":"invoice.payment_succeeded"}"#;
        assert!(!verify_signature(payload, "sha256=deadbeef", "whsec_test"));
        assert!(!verify_signature(payload, "", "whsec_test"));
        assert!(!verify_signature(payload, "not hex at all", "whsec_test"));
    }
}

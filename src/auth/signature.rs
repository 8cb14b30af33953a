use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Scheme prefix GitHub puts in front of the hex digest.
const SIGNATURE_PREFIX: &str = "sha256=";

/// Verify the HMAC-SHA256 signature of a webhook delivery.
///
/// Fails closed: returns false when no secret is configured, the header is
/// absent, the scheme prefix is wrong, or the digest is not valid hex. The
/// comparison itself is constant-time. Call this before parsing any byte of
/// the payload.
pub fn verify(secret: Option<&str>, raw_body: &[u8], signature_header: Option<&str>) -> bool {
    let Some(secret) = secret else {
        return false;
    };
    if secret.is_empty() {
        return false;
    }
    let Some(header) = signature_header else {
        return false;
    };
    let Some(signature_hex) = header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Compute a valid signature header the way GitHub does.
    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_verify_valid_signature() {
        let body = br#"{"action":"opened"}"#;
        let header = sign("mysecret", body);
        assert!(verify(Some("mysecret"), body, Some(&header)));
    }

    #[test]
    fn test_verify_empty_body() {
        let header = sign("mysecret", b"");
        assert!(verify(Some("mysecret"), b"", Some(&header)));
    }

    #[test]
    fn test_verify_wrong_secret() {
        let body = b"test payload";
        let header = sign("other-secret", body);
        assert!(!verify(Some("mysecret"), body, Some(&header)));
    }

    #[test]
    fn test_verify_tampered_body() {
        let header = sign("mysecret", b"original");
        assert!(!verify(Some("mysecret"), b"tampered", Some(&header)));
    }

    #[test]
    fn test_verify_fails_closed_without_secret() {
        let body = b"test payload";
        let header = sign("mysecret", body);
        assert!(!verify(None, body, Some(&header)));
        assert!(!verify(Some(""), body, Some(&header)));
    }

    #[test]
    fn test_verify_missing_header() {
        assert!(!verify(Some("mysecret"), b"test payload", None));
    }

    #[test]
    fn test_verify_wrong_prefix() {
        let body = b"test payload";
        let header = sign("mysecret", body).replace("sha256=", "sha1=");
        assert!(!verify(Some("mysecret"), body, Some(&header)));
    }

    #[test]
    fn test_verify_invalid_hex() {
        assert!(!verify(
            Some("mysecret"),
            b"test payload",
            Some("sha256=not-hex-data!")
        ));
    }
}

//! HMAC-SHA256 signing and verification of webhook payloads.
//!
//! GitHub signs the raw request body with the shared secret and sends the
//! result in `X-Hub-Signature-256` as `sha256=<hex>`. Verification compares
//! MACs in constant time through [`Mac::verify_slice`].

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// Signature verification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// Signature header is empty.
    #[error("signature header is empty")]
    Missing,

    /// Header is not `sha256=<hex>`.
    #[error("invalid signature format: {0}")]
    InvalidFormat(String),

    /// MAC did not match the payload.
    #[error("signature mismatch")]
    Mismatch,

    /// Secret cannot key an HMAC.
    #[error("invalid secret key")]
    InvalidSecret,
}

/// Shared webhook secret.
///
/// `Debug` output is redacted so the secret never reaches logs.
#[derive(Clone, PartialEq, Eq)]
pub struct WebhookSecret(String);

impl WebhookSecret {
    /// Wraps a secret. Returns `None` for an empty string.
    pub fn new(secret: impl Into<String>) -> Option<Self> {
        let secret = secret.into();
        (!secret.is_empty()).then_some(Self(secret))
    }

    /// Returns the secret bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WebhookSecret(***)")
    }
}

/// Computes the HMAC-SHA256 of `payload` as lowercase hex.
///
/// # Errors
///
/// Returns `SignatureError::InvalidSecret` if the key is rejected.
pub fn generate_hmac_hex(payload: &[u8], secret: &[u8]) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Produces the `sha256=<hex>` header value for `payload`.
///
/// # Errors
///
/// Returns `SignatureError::InvalidSecret` if the key is rejected.
pub fn sign_payload(payload: &[u8], secret: &[u8]) -> Result<String, SignatureError> {
    Ok(format!("{SIGNATURE_PREFIX}{}", generate_hmac_hex(payload, secret)?))
}

/// Verifies a `sha256=<hex>` header against `payload`.
///
/// # Errors
///
/// Returns the reason verification failed. A malformed header never panics.
pub fn verify_signature(payload: &[u8], header: &str, secret: &[u8]) -> Result<(), SignatureError> {
    let expected = parse_signature_header(header)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(payload);
    mac.verify_slice(&expected).map_err(|_| SignatureError::Mismatch)
}

/// Decodes the MAC bytes from a `sha256=<hex>` header value.
fn parse_signature_header(header: &str) -> Result<Vec<u8>, SignatureError> {
    let header = header.trim();
    if header.is_empty() {
        return Err(SignatureError::Missing);
    }

    let Some(hex_signature) = header.strip_prefix(SIGNATURE_PREFIX) else {
        let algorithm = header.split_once('=').map_or("none", |(algorithm, _)| algorithm);
        return Err(SignatureError::InvalidFormat(format!(
            "expected sha256=<hex>, got algorithm {algorithm}"
        )));
    };

    hex::decode(hex_signature)
        .map_err(|e| SignatureError::InvalidFormat(format!("signature is not hex: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"It's a Secret to Everybody";

    #[test]
    fn matches_github_reference_signature() {
        // Reference vector from GitHub's webhook validation documentation.
        let header = sign_payload(b"Hello, World!", SECRET).unwrap();
        assert_eq!(
            header,
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17"
        );
        assert!(verify_signature(b"Hello, World!", &header, SECRET).is_ok());
    }

    #[test]
    fn rejects_modified_payload() {
        let header = sign_payload(b"original", SECRET).unwrap();
        assert_eq!(verify_signature(b"tampered", &header, SECRET), Err(SignatureError::Mismatch));
    }

    #[test]
    fn rejects_wrong_secret() {
        let header = sign_payload(b"payload", b"secret-one").unwrap();
        assert_eq!(
            verify_signature(b"payload", &header, b"secret-two"),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_malformed_headers() {
        let hex = generate_hmac_hex(b"payload", SECRET).unwrap();

        assert_eq!(verify_signature(b"payload", "", SECRET), Err(SignatureError::Missing));
        assert!(matches!(
            verify_signature(b"payload", &hex, SECRET),
            Err(SignatureError::InvalidFormat(_))
        ));
        assert!(matches!(
            verify_signature(b"payload", &format!("sha1={hex}"), SECRET),
            Err(SignatureError::InvalidFormat(msg)) if msg.contains("sha1")
        ));
        assert!(matches!(
            verify_signature(b"payload", "sha256=not-hex", SECRET),
            Err(SignatureError::InvalidFormat(_))
        ));
    }

    #[test]
    fn rejects_truncated_signature() {
        let header = sign_payload(b"payload", SECRET).unwrap();
        let truncated = &header[..header.len() - 2];
        assert_eq!(verify_signature(b"payload", truncated, SECRET), Err(SignatureError::Mismatch));
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = WebhookSecret::new("hunter2").unwrap();
        assert_eq!(format!("{secret:?}"), "WebhookSecret(***)");
        assert!(WebhookSecret::new("").is_none());
    }
}

use crate::error::{BillflowError, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Trait for verifying webhook signatures
///
/// Different webhook providers use different signature algorithms.
/// Implement this trait to verify webhooks from your provider.
///
/// # Example
///
/// ```rust,ignore
/// use billflow::webhooks::{WebhookVerifier, HmacSha256Verifier};
///
/// let verifier = HmacSha256Verifier::new_with_prefix("ramp_secret", "sha256=");
///
/// let payload = br#"{"id": "evt_1", "type": "transaction.cleared"}"#;
/// let signature = "sha256=abc123..."; // From x-ramp-signature
/// let is_valid = verifier.verify_signature(payload, signature).await?;
/// ```
#[async_trait]
pub trait WebhookVerifier: Send + Sync {
    /// Verify the webhook signature
    ///
    /// Returns `Ok(true)` if the signature is valid, `Ok(false)` if invalid,
    /// `Err` only when verification itself could not run.
    async fn verify_signature(&self, payload: &[u8], signature: &str) -> Result<bool>;
}

/// HMAC-SHA256 webhook verifier with timing-safe comparison
///
/// # Signature Formats
///
/// - **Hex encoded**: `a1b2c3d4...`
/// - **Hex with prefix**: `sha256=a1b2c3d4...`
/// - **Base64 encoded**: `oWvD1A==...`
///
/// The secret is held as a [`SecretString`] and never appears in debug output.
pub struct HmacSha256Verifier {
    secret: SecretString,
    /// Optional prefix to strip from signatures (e.g., "sha256=")
    signature_prefix: Option<String>,
    /// Whether signatures are base64 encoded (vs hex encoded)
    base64_encoded: bool,
}

impl HmacSha256Verifier {
    /// Create a new verifier with hex-encoded signatures
    pub fn new(secret: impl Into<SecretString>) -> Self {
        Self {
            secret: secret.into(),
            signature_prefix: None,
            base64_encoded: false,
        }
    }

    /// Create a verifier that strips a prefix from signatures
    ///
    /// The prefix is optional on incoming headers: both `sha256=<hex>` and a
    /// bare `<hex>` verify.
    pub fn new_with_prefix(secret: impl Into<SecretString>, prefix: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            signature_prefix: Some(prefix.into()),
            base64_encoded: false,
        }
    }

    /// Create a verifier for base64-encoded signatures
    pub fn new_base64(secret: impl Into<SecretString>) -> Self {
        Self {
            secret: secret.into(),
            signature_prefix: None,
            base64_encoded: true,
        }
    }

    /// Compute the expected HMAC-SHA256 signature for a payload
    fn compute_signature(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| BillflowError::internal("HMAC error"))?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Encode a signature the way a provider would send it.
    pub fn sign(&self, payload: &[u8]) -> Result<String> {
        let raw = self.compute_signature(payload)?;
        let encoded = if self.base64_encoded {
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, raw)
        } else {
            hex::encode(raw)
        };
        Ok(match &self.signature_prefix {
            Some(prefix) => format!("{}{}", prefix, encoded),
            None => encoded,
        })
    }

    /// Decode the provided signature from hex or base64
    fn decode_signature(&self, signature: &str) -> Option<Vec<u8>> {
        let sig = signature.trim();
        let sig = match self.signature_prefix.as_deref() {
            Some(prefix) => sig.strip_prefix(prefix).unwrap_or(sig),
            None => sig,
        };

        if self.base64_encoded {
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, sig).ok()
        } else {
            hex::decode(sig).ok()
        }
    }
}

/// Constant-time comparison to prevent timing attacks
fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.ct_eq(b).into()
}

#[async_trait]
impl WebhookVerifier for HmacSha256Verifier {
    async fn verify_signature(&self, payload: &[u8], signature: &str) -> Result<bool> {
        let provided = match self.decode_signature(signature) {
            Some(bytes) => bytes,
            None => {
                tracing::debug!(target: "billflow::webhooks", "Failed to decode webhook signature");
                return Ok(false);
            }
        };

        let expected = self.compute_signature(payload)?;
        let is_valid = constant_time_compare(&expected, &provided);

        if !is_valid {
            tracing::debug!(target: "billflow::webhooks", "Webhook signature verification failed");
        }

        Ok(is_valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compute_test_signature(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(&[], &[]));
        assert!(constant_time_compare(&[1, 2, 3], &[1, 2, 3]));
        assert!(!constant_time_compare(&[1, 2, 3], &[1, 2, 4]));
        assert!(!constant_time_compare(&[1, 2], &[1, 2, 3]));
    }

    #[tokio::test]
    async fn test_valid_hex_signature() {
        let payload = b"{\"id\":\"evt_1\"}";
        let verifier = HmacSha256Verifier::new("ramp-secret".to_string());
        let signature = compute_test_signature("ramp-secret", payload);

        assert!(verifier.verify_signature(payload, &signature).await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_secret_and_modified_payload_fail() {
        let payload = b"original";
        let signature = compute_test_signature("secret1", payload);

        let verifier = HmacSha256Verifier::new("secret2".to_string());
        assert!(!verifier.verify_signature(payload, &signature).await.unwrap());

        let verifier = HmacSha256Verifier::new("secret1".to_string());
        assert!(!verifier.verify_signature(b"modified", &signature).await.unwrap());
    }

    #[tokio::test]
    async fn test_prefix_is_optional() {
        let payload = b"ledger event";
        let verifier = HmacSha256Verifier::new_with_prefix("s".to_string(), "sha256=");
        let hex_sig = compute_test_signature("s", payload);

        assert!(verifier
            .verify_signature(payload, &format!("sha256={}", hex_sig))
            .await
            .unwrap());
        assert!(verifier.verify_signature(payload, &hex_sig).await.unwrap());
        assert_eq!(verifier.sign(payload).unwrap(), format!("sha256={}", hex_sig));
    }

    #[tokio::test]
    async fn test_malformed_signatures_fail_without_error() {
        let verifier = HmacSha256Verifier::new("secret".to_string());
        for malformed in ["", "not-hex", "abc", "0g0g0g"] {
            assert!(!verifier.verify_signature(b"payload", malformed).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_base64_signatures() {
        let payload = b"payload";
        let verifier = HmacSha256Verifier::new_base64("secret".to_string());
        let signature = verifier.sign(payload).unwrap();

        assert!(verifier.verify_signature(payload, &signature).await.unwrap());
        assert!(!verifier.verify_signature(b"other", &signature).await.unwrap());
    }
}

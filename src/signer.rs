//! Message signing
//!
//! Every outbound request is signed so the coordinator can verify the caller
//! holds the claimed key. Two keys are involved per session:
//!
//! - The **holder identity key** (from configuration) signs the handshake:
//!   the auth request and the server's challenge.
//! - A **fresh session key**, generated per session and registered during the
//!   handshake, signs every call after the session is open.
//!
//! Signatures are Ed25519 over a canonical byte representation of the
//! payload. Canonicalization goes through `serde_json::Value`, whose objects
//! are BTreeMap-backed, so object keys are always emitted in sorted order and
//! the same payload yields the same bytes on every run.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::ClientError;

/// Signs payloads with a held Ed25519 private key.
///
/// Pure with respect to session state: signing never mutates the payload and
/// the same (payload, key) pair always produces the same signature.
#[derive(Debug)]
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    /// Build a signer from a hex-encoded 32-byte seed.
    pub fn from_hex(hex_seed: &str) -> Result<Self, ClientError> {
        let seed = hex_seed.trim_start_matches("0x");
        let bytes = hex::decode(seed)
            .map_err(|e| ClientError::Signing(format!("Invalid private key hex: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ClientError::Signing("Private key must be 32 bytes".into()))?;
        Ok(Self {
            key: SigningKey::from_bytes(&seed),
        })
    }

    /// Build the holder identity signer from configuration.
    ///
    /// A missing key is a fatal handshake error, not a retryable one.
    pub fn from_config(private_key: Option<&str>) -> Result<Self, ClientError> {
        match private_key {
            Some(hex_seed) => Self::from_hex(hex_seed),
            None => Err(ClientError::Signing("No signing key configured".into())),
        }
    }

    /// Generate a fresh session key.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Public address derived from the verifying key: `0x` plus the last
    /// 20 bytes of the SHA-256 of the public key, hex-encoded.
    pub fn address(&self) -> String {
        let digest = Sha256::digest(self.key.verifying_key().as_bytes());
        format!("0x{}", hex::encode(&digest[12..]))
    }

    /// Hex-encoded public key, sent as the session verification key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().as_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Sign an arbitrary JSON-serializable payload. Returns the hex-encoded
    /// 64-byte signature.
    pub fn sign(&self, payload: &Value) -> Result<String, ClientError> {
        let bytes = canonical_bytes(payload)?;
        let signature = self.key.sign(&bytes);
        Ok(hex::encode(signature.to_bytes()))
    }

    /// Sign the exact `{id, method, params, ts}` tuple of a request envelope.
    pub fn sign_request(
        &self,
        id: u64,
        method: &str,
        params: &Value,
        ts: u64,
    ) -> Result<String, ClientError> {
        self.sign(&request_tuple(id, method, params, ts))
    }
}

/// Verify a hex signature over a payload. Used by tests and by the mock
/// coordinator; the production client never signs on behalf of a caller who
/// does not hold the key.
pub fn verify(key: &VerifyingKey, payload: &Value, sig_hex: &str) -> Result<(), ClientError> {
    let bytes = canonical_bytes(payload)?;
    let sig_bytes = hex::decode(sig_hex)
        .map_err(|e| ClientError::Signing(format!("Invalid signature hex: {}", e)))?;
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| ClientError::Signing("Signature must be 64 bytes".into()))?;
    let signature = Signature::from_bytes(&sig_bytes);
    key.verify(&bytes, &signature)
        .map_err(|e| ClientError::Signing(format!("Signature verification failed: {}", e)))
}

/// The signed tuple for a request envelope.
pub fn request_tuple(id: u64, method: &str, params: &Value, ts: u64) -> Value {
    serde_json::json!({
        "id": id,
        "method": method,
        "params": params,
        "ts": ts,
    })
}

/// Canonical byte representation of a payload.
///
/// `serde_json::Value` objects are BTreeMap-backed, so serialization emits
/// object keys in sorted order. Array order is preserved.
pub fn canonical_bytes(payload: &Value) -> Result<Vec<u8>, ClientError> {
    serde_json::to_vec(payload)
        .map_err(|e| ClientError::Signing(format!("Failed to canonicalize payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signing_is_deterministic() {
        let signer = Signer::generate();
        let payload = json!({"b": 2, "a": 1, "nested": {"z": [1, 2], "y": null}});

        let sig1 = signer.sign(&payload).unwrap();
        let sig2 = signer.sign(&payload).unwrap();
        assert_eq!(sig1, sig2);
    }

    #[test]
    fn test_canonical_bytes_sorts_object_keys() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": 2, "b": 1}"#).unwrap();
        assert_eq!(canonical_bytes(&a).unwrap(), canonical_bytes(&b).unwrap());
    }

    #[test]
    fn test_sign_and_verify_roundtrip() {
        let signer = Signer::generate();
        let payload = json!({"challenge": "f3a1"});

        let sig = signer.sign(&payload).unwrap();
        verify(&signer.verifying_key(), &payload, &sig).unwrap();

        // Tampered payload must not verify
        let tampered = json!({"challenge": "f3a2"});
        assert!(verify(&signer.verifying_key(), &tampered, &sig).is_err());
    }

    #[test]
    fn test_request_tuple_signature_covers_all_fields() {
        let signer = Signer::generate();
        let sig = signer.sign_request(7, "get_channels", &json!([]), 1_700_000_000_000).unwrap();

        // Different id -> different signed bytes
        let other = signer.sign_request(8, "get_channels", &json!([]), 1_700_000_000_000).unwrap();
        assert_ne!(sig, other);
    }

    #[test]
    fn test_from_hex_roundtrip() {
        let signer = Signer::generate();
        let seed = hex::encode(signer.key.to_bytes());
        let restored = Signer::from_hex(&seed).unwrap();
        assert_eq!(signer.address(), restored.address());

        // 0x prefix is accepted
        let restored = Signer::from_hex(&format!("0x{}", seed)).unwrap();
        assert_eq!(signer.address(), restored.address());
    }

    #[test]
    fn test_missing_key_is_a_signing_error() {
        let err = Signer::from_config(None).unwrap_err();
        assert!(matches!(err, ClientError::Signing(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_address_shape() {
        let signer = Signer::generate();
        let address = signer.address();
        assert!(address.starts_with("0x"));
        assert_eq!(address.len(), 2 + 40);
    }
}

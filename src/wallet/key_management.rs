// src/wallet/key_management.rs
//! Deterministic key management for the in-process agent.
//!
//! Keys are secp256k1 (via the `k256` crate) derived from a party's secret seed
//! and a key index. Index `k` signs at the current establishment event and the
//! digest of key `k + 1` is published as the next-key commitment, so every
//! rotation simply advances the index.
//!
//! # Security Notes
//! - Derivation is `SHA-256(seed || ":" || index)`; fine for simulation, not a KDF
//! - Signatures are ECDSA over the SHA-256 prehash of the message

use crate::error::AgentError;
use crate::utils::crypto::{b64_int, digest_qb64, hash_data};
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::{PublicKey, SecretKey};

/// Secp256k1 key chain derived from one seed.
#[derive(Clone)]
pub struct KeyManager {
    seed: String,
}

impl KeyManager {
    pub fn new(seed: impl Into<String>) -> Self {
        Self { seed: seed.into() }
    }

    fn secret_key(&self, index: u64) -> Result<SecretKey, AgentError> {
        let material = hash_data(format!("{}:{}", self.seed, index).as_bytes());
        SecretKey::from_slice(&material)
            .map_err(|e| AgentError::Rejected(format!("key derivation failed: {}", e)))
    }

    fn public_key(&self, index: u64) -> Result<PublicKey, AgentError> {
        Ok(self.secret_key(index)?.public_key())
    }

    /// Qualified compressed public key at `index`.
    pub fn public_key_qb64(&self, index: u64) -> Result<String, AgentError> {
        let bytes = self.public_key(index)?.to_sec1_bytes();
        Ok(format!(
            "1AAB{}",
            base64::encode_config(&bytes, base64::URL_SAFE_NO_PAD)
        ))
    }

    /// Commitment to the key that will sign after the next rotation.
    pub fn next_digest(&self, index: u64) -> Result<String, AgentError> {
        Ok(digest_qb64(self.public_key_qb64(index + 1)?.as_bytes()))
    }

    /// Signs `message` with the key at `index`, returning the 64-byte compact signature.
    pub fn sign(&self, index: u64, message: &[u8]) -> Result<Vec<u8>, AgentError> {
        let signing_key = SigningKey::from(&self.secret_key(index)?);
        let signature: Signature = signing_key
            .sign_prehash(&hash_data(message))
            .map_err(|e| AgentError::Rejected(format!("signing failed: {}", e)))?;
        Ok(signature.to_vec())
    }

    /// Signature qualified with the signer's position in the member key list.
    pub fn sign_indexed(&self, index: u64, position: usize, message: &[u8]) -> Result<String, AgentError> {
        let raw = self.sign(index, message)?;
        Ok(format!(
            "2A{}{}",
            b64_int(position as u64, 2),
            base64::encode_config(&raw, base64::URL_SAFE_NO_PAD)
        ))
    }

    pub fn verify(&self, index: u64, message: &[u8], signature: &[u8]) -> bool {
        let Ok(public_key) = self.public_key(index) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        VerifyingKey::from(&public_key)
            .verify_prehash(&hash_data(message), &signature)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keys = KeyManager::new("0ACDEyMzQ1Njc4OWxtbm9aBc");
        let sig = keys.sign(0, b"rotation event").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(keys.verify(0, b"rotation event", &sig));
        assert!(!keys.verify(1, b"rotation event", &sig));
        assert!(!keys.verify(0, b"tampered", &sig));
    }

    #[test]
    fn test_derivation_is_deterministic_per_index() {
        let a = KeyManager::new("seed-a");
        let b = KeyManager::new("seed-a");
        assert_eq!(a.public_key_qb64(0).unwrap(), b.public_key_qb64(0).unwrap());
        assert_ne!(a.public_key_qb64(0).unwrap(), a.public_key_qb64(1).unwrap());
        assert_eq!(
            a.next_digest(0).unwrap(),
            digest_qb64(a.public_key_qb64(1).unwrap().as_bytes())
        );
    }

    #[test]
    fn test_indexed_signature_carries_position() {
        let keys = KeyManager::new("seed-b");
        let sig = keys.sign_indexed(0, 2, b"icp").unwrap();
        assert!(sig.starts_with("2AAC"));
    }
}

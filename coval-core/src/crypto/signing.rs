//! Ed25519 signing over canonically-hashed payloads.
//!
//! Payloads are canonicalized and hashed before signing, so a signature is
//! over `blake3(canonical(payload))` and independent of key order.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::Serialize;
use thiserror::Error;

use crate::canonical::CanonicalError;
use crate::crypto::hashing::{secure_hash, Hash};
use crate::ids::{Signature, SignerId, SignerSecret};

#[derive(Error, Debug)]
pub enum SignError {
    #[error("signer id is not a valid Ed25519 public key")]
    InvalidSignerId,

    #[error("payload cannot be canonicalized: {0}")]
    Canonical(#[from] CanonicalError),
}

pub type Result<T> = std::result::Result<T, SignError>;

/// Generate a fresh Ed25519 keypair.
pub fn generate_signing_keypair() -> (SignerId, SignerSecret) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let public = SignerId(signing_key.verifying_key().to_bytes());
    let secret = SignerSecret(signing_key.to_bytes());
    (public, secret)
}

/// Public half of a signing secret.
pub fn signer_id(secret: &SignerSecret) -> SignerId {
    let signing_key = SigningKey::from_bytes(&secret.0);
    SignerId(signing_key.verifying_key().to_bytes())
}

/// Sign a serializable payload.
pub fn sign<T: Serialize>(secret: &SignerSecret, payload: &T) -> Result<Signature> {
    Ok(sign_hash(secret, &secure_hash(payload)?))
}

/// Sign an already-computed secure hash (session chains sign their rolling
/// hash directly).
pub fn sign_hash(secret: &SignerSecret, hash: &Hash) -> Signature {
    let signing_key = SigningKey::from_bytes(&secret.0);
    Signature(signing_key.sign(hash.as_bytes()).to_bytes())
}

/// Verify a signature over a serializable payload.
///
/// Returns `Ok(false)` for a valid key with a non-matching signature and
/// `Err` only when the signer id itself is malformed.
pub fn verify<T: Serialize>(
    signature: &Signature,
    payload: &T,
    signer: &SignerId,
) -> Result<bool> {
    Ok(verify_hash(signature, &secure_hash(payload)?, signer)?)
}

/// Verify a signature over an already-computed secure hash.
pub fn verify_hash(
    signature: &Signature,
    hash: &Hash,
    signer: &SignerId,
) -> std::result::Result<bool, SignError> {
    let verifying_key =
        VerifyingKey::from_bytes(&signer.0).map_err(|_| SignError::InvalidSignerId)?;
    let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
    Ok(verifying_key.verify(hash.as_bytes(), &sig).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sign_and_verify() {
        let (id, secret) = generate_signing_keypair();
        let payload = json!({"a": "hello", "b": "world"});
        let sig = sign(&secret, &payload).unwrap();
        assert!(verify(&sig, &payload, &id).unwrap());
    }

    #[test]
    fn test_verify_rejects_other_signer() {
        let (_, secret) = generate_signing_keypair();
        let (other_id, _) = generate_signing_keypair();
        let payload = json!({"a": "hello", "b": "world"});
        let sig = sign(&secret, &payload).unwrap();
        assert!(!verify(&sig, &payload, &other_id).unwrap());
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let (id, secret) = generate_signing_keypair();
        let sig = sign(&secret, &json!({"a": 1})).unwrap();
        assert!(!verify(&sig, &json!({"a": 2}), &id).unwrap());
    }

    #[test]
    fn test_signature_is_key_order_insensitive() {
        let (id, secret) = generate_signing_keypair();
        let sig = sign(&secret, &json!({"x": 1, "y": 2})).unwrap();
        assert!(verify(&sig, &json!({"y": 2, "x": 1}), &id).unwrap());
    }

    #[test]
    fn test_signer_id_matches_generated() {
        let (id, secret) = generate_signing_keypair();
        assert_eq!(signer_id(&secret), id);
    }
}

//! Sealed messages between agents.
//!
//! X25519 Diffie-Hellman into an XSalsa20-Poly1305 box. The nonce is derived
//! from caller-provided nonce material (`blake3(canonical(material))[..24]`),
//! so the same (message, pair, material) triple always seals to the same
//! bytes and no nonce travels on the wire.

use crypto_box::aead::Aead;
use crypto_box::{Nonce, PublicKey, SalsaBox, SecretKey};
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use x25519_dalek::StaticSecret;

use crate::canonical::{canonical_bytes, CanonicalError};
use crate::crypto::hashing::derive_nonce;
use crate::ids::{Sealed, SealerId, SealerSecret};

#[derive(Error, Debug)]
pub enum SealError {
    /// AEAD verification failed: wrong keypair, wrong nonce material, or a
    /// tampered ciphertext.
    #[error("Wrong tag")]
    WrongTag,

    #[error("sealed payload is not valid JSON")]
    BadPayload,

    #[error("message cannot be canonicalized: {0}")]
    Canonical(#[from] CanonicalError),
}

pub type Result<T> = std::result::Result<T, SealError>;

/// Generate a fresh X25519 keypair for sealing.
pub fn generate_sealer_keypair() -> (SealerId, SealerSecret) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = x25519_dalek::PublicKey::from(&secret);
    (SealerId(public.to_bytes()), SealerSecret(secret.to_bytes()))
}

/// Public half of a sealing secret.
pub fn sealer_id(secret: &SealerSecret) -> SealerId {
    let secret = StaticSecret::from(secret.0);
    SealerId(x25519_dalek::PublicKey::from(&secret).to_bytes())
}

/// Seal `message` from `from` to `to`.
pub fn seal<T: Serialize>(
    message: &T,
    from: &SealerSecret,
    to: &SealerId,
    nonce_material: &Value,
) -> Result<Sealed> {
    let plaintext = canonical_bytes(message)?;
    let nonce = Nonce::from(derive_nonce(nonce_material));
    let sealer = SalsaBox::new(&PublicKey::from(to.0), &SecretKey::from(from.0));
    let ciphertext = sealer
        .encrypt(&nonce, plaintext.as_slice())
        .map_err(|_| SealError::WrongTag)?;
    Ok(Sealed(ciphertext))
}

/// Open a sealed message. Fails with [`SealError::WrongTag`] when the
/// keypair, nonce material, or ciphertext does not match.
pub fn unseal<T: DeserializeOwned>(
    sealed: &Sealed,
    from: &SealerId,
    to: &SealerSecret,
    nonce_material: &Value,
) -> Result<T> {
    let nonce = Nonce::from(derive_nonce(nonce_material));
    let opener = SalsaBox::new(&PublicKey::from(from.0), &SecretKey::from(to.0));
    let plaintext = opener
        .decrypt(&nonce, sealed.0.as_slice())
        .map_err(|_| SealError::WrongTag)?;
    serde_json::from_slice(&plaintext).map_err(|_| SealError::BadPayload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seal_unseal_roundtrip() {
        let (from_id, from_secret) = generate_sealer_keypair();
        let (to_id, to_secret) = generate_sealer_keypair();
        let material = json!({"in": "co_zTEST", "tx": 0});

        let sealed = seal(&json!({"secret": "value"}), &from_secret, &to_id, &material).unwrap();
        let opened: Value = unseal(&sealed, &from_id, &to_secret, &material).unwrap();
        assert_eq!(opened, json!({"secret": "value"}));
    }

    #[test]
    fn test_unseal_wrong_recipient_fails() {
        let (from_id, from_secret) = generate_sealer_keypair();
        let (to_id, _) = generate_sealer_keypair();
        let (_, other_secret) = generate_sealer_keypair();
        let material = json!({"n": 1});

        let sealed = seal(&json!("payload"), &from_secret, &to_id, &material).unwrap();
        let result: Result<Value> = unseal(&sealed, &from_id, &other_secret, &material);
        assert!(matches!(result, Err(SealError::WrongTag)));
    }

    #[test]
    fn test_unseal_wrong_nonce_material_fails() {
        let (from_id, from_secret) = generate_sealer_keypair();
        let (to_id, to_secret) = generate_sealer_keypair();

        let sealed = seal(&json!("payload"), &from_secret, &to_id, &json!({"n": 1})).unwrap();
        let result: Result<Value> = unseal(&sealed, &from_id, &to_secret, &json!({"n": 2}));
        assert!(matches!(result, Err(SealError::WrongTag)));
    }

    #[test]
    fn test_unseal_tampered_ciphertext_fails() {
        let (from_id, from_secret) = generate_sealer_keypair();
        let (to_id, to_secret) = generate_sealer_keypair();
        let material = json!({"n": 1});

        let mut sealed = seal(&json!("payload"), &from_secret, &to_id, &material).unwrap();
        sealed.0[0] ^= 0xFF;
        let result: Result<Value> = unseal(&sealed, &from_id, &to_secret, &material);
        assert!(matches!(result, Err(SealError::WrongTag)));
    }

    #[test]
    fn test_sealer_id_matches_generated() {
        let (id, secret) = generate_sealer_keypair();
        assert_eq!(sealer_id(&secret), id);
    }
}

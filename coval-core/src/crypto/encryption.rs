//! Symmetric encryption for transactions and key-secret wrapping.
//!
//! XSalsa20-Poly1305 under a covalue read key. Decryption of
//! attacker-controllable ciphertext never errors: MAC failure yields `None`
//! and the caller treats the transaction as undecryptable.

use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::canonical::{canonical_bytes, CanonicalError};
use crate::crypto::hashing::derive_nonce;
use crate::ids::{Encrypted, KeyId, KeySecret};

#[derive(Error, Debug)]
pub enum EncryptError {
    #[error("plaintext cannot be canonicalized: {0}")]
    Canonical(#[from] CanonicalError),

    #[error("encryption failed")]
    EncryptionFailed,
}

pub type Result<T> = std::result::Result<T, EncryptError>;

/// Generate a random 32-byte read key.
pub fn generate_key_secret() -> KeySecret {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    KeySecret(key)
}

/// Encrypt a change list (or any value) under a read key.
///
/// The nonce is derived from `nonce_material`, which for transactions binds
/// the ciphertext to its (covalue, session, index) slot.
pub fn encrypt_for_transaction<T: Serialize>(
    value: &T,
    key: &KeySecret,
    nonce_material: &Value,
) -> Result<Encrypted> {
    let plaintext = canonical_bytes(value)?;
    let cipher = XSalsa20Poly1305::new(Key::from_slice(&key.0));
    let nonce_bytes = derive_nonce(nonce_material);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
        .map_err(|_| EncryptError::EncryptionFailed)?;
    Ok(Encrypted(ciphertext))
}

/// Decrypt a transaction payload. `None` on MAC failure or garbled JSON —
/// never an error, because the ciphertext is attacker-controllable.
pub fn decrypt_for_transaction<T: DeserializeOwned>(
    encrypted: &Encrypted,
    key: &KeySecret,
    nonce_material: &Value,
) -> Option<T> {
    let cipher = XSalsa20Poly1305::new(Key::from_slice(&key.0));
    let nonce_bytes = derive_nonce(nonce_material);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), encrypted.0.as_slice())
        .ok()?;
    serde_json::from_slice(&plaintext).ok()
}

fn wrap_nonce_material(encrypted_id: KeyId, encrypting_id: KeyId) -> Value {
    json!({
        "encryptedID": encrypted_id.to_string(),
        "encryptingID": encrypting_id.to_string(),
    })
}

/// Wrap one read key under another (the previous-key chain in group state).
pub fn encrypt_key_secret(to_encrypt: &KeySecret, encrypting: &KeySecret) -> Result<Encrypted> {
    let material = wrap_nonce_material(to_encrypt.id(), encrypting.id());
    encrypt_for_transaction(&to_encrypt.to_string(), encrypting, &material)
}

/// Unwrap a read key. `None` on MAC failure, malformed key string, or an id
/// mismatch against the expected `encrypted_id`.
pub fn decrypt_key_secret(
    wrapped: &Encrypted,
    encrypted_id: KeyId,
    encrypting: &KeySecret,
) -> Option<KeySecret> {
    let material = wrap_nonce_material(encrypted_id, encrypting.id());
    let key_string: String = decrypt_for_transaction(wrapped, encrypting, &material)?;
    let secret: KeySecret = key_string.parse().ok()?;
    if secret.id() != encrypted_id {
        return None;
    }
    Some(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_key_secret();
        let material = json!({"in": "co_zX", "tx": {"sessionID": "s", "txIndex": 0}});
        let changes = json!([{"op": "set", "key": "foo", "value": "bar"}]);

        let encrypted = encrypt_for_transaction(&changes, &key, &material).unwrap();
        let decrypted: Value = decrypt_for_transaction(&encrypted, &key, &material).unwrap();
        assert_eq!(decrypted, changes);
    }

    #[test]
    fn test_decrypt_wrong_key_returns_none() {
        let key = generate_key_secret();
        let other = generate_key_secret();
        let material = json!({"n": 0});

        let encrypted = encrypt_for_transaction(&json!("data"), &key, &material).unwrap();
        let decrypted: Option<Value> = decrypt_for_transaction(&encrypted, &other, &material);
        assert!(decrypted.is_none());
    }

    #[test]
    fn test_decrypt_wrong_nonce_material_returns_none() {
        let key = generate_key_secret();
        let encrypted = encrypt_for_transaction(&json!("data"), &key, &json!({"n": 0})).unwrap();
        let decrypted: Option<Value> = decrypt_for_transaction(&encrypted, &key, &json!({"n": 1}));
        assert!(decrypted.is_none());
    }

    #[test]
    fn test_key_wrapping_roundtrip() {
        let old_key = generate_key_secret();
        let new_key = generate_key_secret();

        let wrapped = encrypt_key_secret(&old_key, &new_key).unwrap();
        let unwrapped = decrypt_key_secret(&wrapped, old_key.id(), &new_key).unwrap();
        assert_eq!(unwrapped, old_key);
    }

    #[test]
    fn test_key_unwrapping_with_wrong_key_returns_none() {
        let old_key = generate_key_secret();
        let new_key = generate_key_secret();
        let wrong = generate_key_secret();

        let wrapped = encrypt_key_secret(&old_key, &new_key).unwrap();
        assert!(decrypt_key_secret(&wrapped, old_key.id(), &wrong).is_none());
    }

    #[test]
    fn test_ciphertext_is_deterministic_for_same_slot() {
        // Same key, value, and slot material must produce identical bytes —
        // replicas re-deriving a transaction ciphertext agree.
        let key = KeySecret([9u8; 32]);
        let material = json!({"tx": 3});
        let a = encrypt_for_transaction(&json!([1, 2]), &key, &material).unwrap();
        let b = encrypt_for_transaction(&json!([1, 2]), &key, &material).unwrap();
        assert_eq!(a, b);
    }
}

//! Content hashing.
//!
//! `secure_hash` is BLAKE3 over the canonical encoding, so it is insensitive
//! to object key order. `short_hash` truncates to 16 bytes and is used where
//! a compact collision-resistant tag is enough (key IDs).

use serde::Serialize;
use serde_json::Value;
use std::fmt;

use crate::canonical::{self, stable_stringify};
use crate::ids::{decode_b58_array, ParseError, PREFIX_HASH, PREFIX_SHORT_HASH};

/// 32-byte BLAKE3 hash of a canonically-encoded value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash(pub [u8; 32]);

/// 16-byte truncation of a [`Hash`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShortHash(pub [u8; 16]);

/// Hash any serializable value through the canonical encoder.
pub fn secure_hash<T: Serialize>(value: &T) -> Result<Hash, canonical::CanonicalError> {
    Ok(Hash(*blake3::hash(&canonical::canonical_bytes(value)?).as_bytes()))
}

/// Hash an already-parsed JSON value. Infallible.
pub fn secure_hash_value(value: &Value) -> Hash {
    Hash(*blake3::hash(stable_stringify(value).as_bytes()).as_bytes())
}

/// 24-byte nonce derived from arbitrary nonce material.
///
/// Deterministic on purpose: both sides of a seal/encrypt derive the same
/// nonce from shared material instead of shipping it alongside the
/// ciphertext.
pub(crate) fn derive_nonce(material: &Value) -> [u8; 24] {
    let digest = secure_hash_value(material);
    let mut nonce = [0u8; 24];
    nonce.copy_from_slice(&digest.0[..24]);
    nonce
}

/// First 16 bytes of the secure hash.
pub fn short_hash(value: &Value) -> ShortHash {
    let full = secure_hash_value(value);
    let mut out = [0u8; 16];
    out.copy_from_slice(&full.0[..16]);
    ShortHash(out)
}

impl Hash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_raw(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    pub fn short(&self) -> ShortHash {
        let mut out = [0u8; 16];
        out.copy_from_slice(&self.0[..16]);
        ShortHash(out)
    }
}

impl ShortHash {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PREFIX_HASH, bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}..)", &bs58::encode(self.0).into_string()[..8])
    }
}

impl fmt::Display for ShortHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            PREFIX_SHORT_HASH,
            bs58::encode(self.0).into_string()
        )
    }
}

impl fmt::Debug for ShortHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortHash({})", bs58::encode(self.0).into_string())
    }
}

impl std::str::FromStr for Hash {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Hash(decode_b58_array::<32>(s, PREFIX_HASH)?))
    }
}

impl std::str::FromStr for ShortHash {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ShortHash(decode_b58_array::<16>(s, PREFIX_SHORT_HASH)?))
    }
}

impl serde::Serialize for Hash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Hash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl serde::Serialize for ShortHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ShortHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_order_insensitive() {
        let a = secure_hash_value(&json!({"a": 1, "b": 2}));
        let b = secure_hash_value(&json!({"b": 2, "a": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_differs_on_content() {
        let a = secure_hash_value(&json!({"a": 1}));
        let b = secure_hash_value(&json!({"a": 2}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_hash_is_prefix() {
        let v = json!(["x", "y"]);
        let full = secure_hash_value(&v);
        let short = short_hash(&v);
        assert_eq!(&full.0[..16], short.as_bytes());
    }

    #[test]
    fn test_hash_string_roundtrip() {
        let h = secure_hash_value(&json!("payload"));
        let s = h.to_string();
        assert!(s.starts_with("hash_z"));
        let back: Hash = s.parse().unwrap();
        assert_eq!(h, back);
    }
}

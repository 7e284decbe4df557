//! Typed, self-describing string identifiers.
//!
//! Every piece of binary material crosses the wire as a prefixed string:
//! the prefix names the role *and* pins the algorithm (a future scheme change
//! multiplexes on a new prefix), the suffix letter selects the alphabet —
//! `z` for base58 (short material), `U` for unpadded url-safe base64 (longer
//! ciphertexts).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::hashing::Hash;

pub const PREFIX_CO: &str = "co_z";
pub const PREFIX_SIGNER: &str = "signer_z";
pub const PREFIX_SIGNER_SECRET: &str = "signerSecret_z";
pub const PREFIX_SEALER: &str = "sealer_z";
pub const PREFIX_SEALER_SECRET: &str = "sealerSecret_z";
pub const PREFIX_KEY: &str = "key_z";
pub const PREFIX_KEY_SECRET: &str = "keySecret_z";
pub const PREFIX_SIGNATURE: &str = "signature_z";
pub const PREFIX_SEALED: &str = "sealed_U";
pub const PREFIX_ENCRYPTED: &str = "encrypted_U";
pub const PREFIX_HASH: &str = "hash_z";
pub const PREFIX_SHORT_HASH: &str = "shortHash_z";

const SESSION_SEPARATOR: &str = "_session_z";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected prefix {expected:?}")]
    WrongPrefix { expected: &'static str },

    #[error("invalid base58 material")]
    BadBase58,

    #[error("invalid base64 material")]
    BadBase64,

    #[error("wrong material length: expected {expected}, got {got}")]
    WrongLength { expected: usize, got: usize },

    #[error("malformed composite id")]
    Malformed,
}

pub(crate) fn decode_b58_array<const N: usize>(
    s: &str,
    prefix: &'static str,
) -> Result<[u8; N], ParseError> {
    let material = s
        .strip_prefix(prefix)
        .ok_or(ParseError::WrongPrefix { expected: prefix })?;
    let bytes = bs58::decode(material)
        .into_vec()
        .map_err(|_| ParseError::BadBase58)?;
    let got = bytes.len();
    bytes.try_into().map_err(|_| ParseError::WrongLength {
        expected: N,
        got,
    })
}

pub(crate) fn decode_b64(s: &str, prefix: &'static str) -> Result<Vec<u8>, ParseError> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    let material = s
        .strip_prefix(prefix)
        .ok_or(ParseError::WrongPrefix { expected: prefix })?;
    URL_SAFE_NO_PAD
        .decode(material)
        .map_err(|_| ParseError::BadBase64)
}

pub(crate) fn encode_b64(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD.encode(bytes)
}

// Shared Debug-through-Display body for composite ids.
macro_rules! fmt_debug_via_display {
    () => {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self}")
        }
    };
}

/// Implements string-form `Display`/`FromStr`-backed serde for an id type.
macro_rules! impl_string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// CoId
// ---------------------------------------------------------------------------

/// Covalue identity: the BLAKE3 hash of the covalue's canonical header.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoId(pub [u8; 32]);

impl CoId {
    pub fn from_header_hash(hash: Hash) -> Self {
        CoId(hash.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn header_hash(&self) -> Hash {
        Hash(self.0)
    }
}

impl fmt::Display for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PREFIX_CO, bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoId({}..)", &bs58::encode(self.0).into_string()[..8])
    }
}

impl FromStr for CoId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CoId(decode_b58_array::<32>(s, PREFIX_CO)?))
    }
}

impl_string_serde!(CoId);

// ---------------------------------------------------------------------------
// Signing identities
// ---------------------------------------------------------------------------

/// Ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SignerId(pub [u8; 32]);

/// Ed25519 signing key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SignerSecret(pub [u8; 32]);

/// Ed25519 signature over a 32-byte secure hash.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl fmt::Display for SignerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PREFIX_SIGNER, bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for SignerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignerId({}..)", &bs58::encode(self.0).into_string()[..8])
    }
}

impl FromStr for SignerId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SignerId(decode_b58_array::<32>(s, PREFIX_SIGNER)?))
    }
}

impl_string_serde!(SignerId);

impl fmt::Display for SignerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            PREFIX_SIGNER_SECRET,
            bs58::encode(self.0).into_string()
        )
    }
}

impl fmt::Debug for SignerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignerSecret(..)")
    }
}

impl FromStr for SignerSecret {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SignerSecret(decode_b58_array::<32>(s, PREFIX_SIGNER_SECRET)?))
    }
}

impl_string_serde!(SignerSecret);

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            PREFIX_SIGNATURE,
            bs58::encode(self.0).into_string()
        )
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Signature({}..)",
            &bs58::encode(self.0).into_string()[..8]
        )
    }
}

impl FromStr for Signature {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Signature(decode_b58_array::<64>(s, PREFIX_SIGNATURE)?))
    }
}

impl_string_serde!(Signature);

// ---------------------------------------------------------------------------
// Sealing identities
// ---------------------------------------------------------------------------

/// X25519 public key used to seal messages *to* an agent.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SealerId(pub [u8; 32]);

/// X25519 static secret. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SealerSecret(pub [u8; 32]);

impl fmt::Display for SealerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PREFIX_SEALER, bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for SealerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealerId({}..)", &bs58::encode(self.0).into_string()[..8])
    }
}

impl FromStr for SealerId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SealerId(decode_b58_array::<32>(s, PREFIX_SEALER)?))
    }
}

impl_string_serde!(SealerId);

impl fmt::Display for SealerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            PREFIX_SEALER_SECRET,
            bs58::encode(self.0).into_string()
        )
    }
}

impl fmt::Debug for SealerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealerSecret(..)")
    }
}

impl FromStr for SealerSecret {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SealerSecret(decode_b58_array::<32>(s, PREFIX_SEALER_SECRET)?))
    }
}

impl_string_serde!(SealerSecret);

// ---------------------------------------------------------------------------
// Symmetric keys
// ---------------------------------------------------------------------------

/// Read-key identity: the short hash of the key material.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyId(pub [u8; 16]);

/// 32-byte symmetric read key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeySecret(pub [u8; 32]);

impl KeySecret {
    /// Derive the public identity of this key.
    pub fn id(&self) -> KeyId {
        let digest = blake3::hash(&self.0);
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest.as_bytes()[..16]);
        KeyId(out)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PREFIX_KEY, bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", bs58::encode(self.0).into_string())
    }
}

impl FromStr for KeyId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(KeyId(decode_b58_array::<16>(s, PREFIX_KEY)?))
    }
}

impl_string_serde!(KeyId);

impl fmt::Display for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            PREFIX_KEY_SECRET,
            bs58::encode(self.0).into_string()
        )
    }
}

impl fmt::Debug for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySecret(..)")
    }
}

impl FromStr for KeySecret {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(KeySecret(decode_b58_array::<32>(s, PREFIX_KEY_SECRET)?))
    }
}

impl_string_serde!(KeySecret);

// ---------------------------------------------------------------------------
// Ciphertexts
// ---------------------------------------------------------------------------

/// Sealed box: X25519 ECDH + XSalsa20-Poly1305, nonce derived out-of-band.
#[derive(Clone, PartialEq, Eq)]
pub struct Sealed(pub Vec<u8>);

/// Symmetric XSalsa20-Poly1305 ciphertext, nonce derived out-of-band.
#[derive(Clone, PartialEq, Eq)]
pub struct Encrypted(pub Vec<u8>);

impl fmt::Display for Sealed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PREFIX_SEALED, encode_b64(&self.0))
    }
}

impl fmt::Debug for Sealed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sealed({} bytes)", self.0.len())
    }
}

impl FromStr for Sealed {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Sealed(decode_b64(s, PREFIX_SEALED)?))
    }
}

impl_string_serde!(Sealed);

impl fmt::Display for Encrypted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PREFIX_ENCRYPTED, encode_b64(&self.0))
    }
}

impl fmt::Debug for Encrypted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Encrypted({} bytes)", self.0.len())
    }
}

impl FromStr for Encrypted {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Encrypted(decode_b64(s, PREFIX_ENCRYPTED)?))
    }
}

impl_string_serde!(Encrypted);

// ---------------------------------------------------------------------------
// AgentId / SessionId
// ---------------------------------------------------------------------------

/// Public identity of one agent: its sealing and signing public halves.
///
/// String form: `sealer_z<b58>/signer_z<b58>`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgentId {
    pub sealer: SealerId,
    pub signer: SignerId,
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sealer, self.signer)
    }
}

impl fmt::Debug for AgentId {
    fmt_debug_via_display!();
}

impl FromStr for AgentId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sealer, signer) = s.split_once('/').ok_or(ParseError::Malformed)?;
        Ok(AgentId {
            sealer: sealer.parse()?,
            signer: signer.parse()?,
        })
    }
}

impl_string_serde!(AgentId);

/// One linear writing context: an agent plus a per-device nonce.
///
/// String form: `<agentID>_session_z<b58 nonce>`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId {
    pub agent: AgentId,
    pub nonce: String,
}

impl SessionId {
    pub fn new(agent: AgentId, nonce: impl Into<String>) -> Self {
        SessionId {
            agent,
            nonce: nonce.into(),
        }
    }

    /// Mint a session with fresh random nonce material.
    pub fn random(agent: AgentId) -> Self {
        use rand::RngCore;
        let mut material = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut material);
        SessionId {
            agent,
            nonce: bs58::encode(material).into_string(),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.agent, SESSION_SEPARATOR, self.nonce)
    }
}

impl fmt::Debug for SessionId {
    fmt_debug_via_display!();
}

impl FromStr for SessionId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let idx = s.rfind(SESSION_SEPARATOR).ok_or(ParseError::Malformed)?;
        let agent = s[..idx].parse()?;
        let nonce = &s[idx + SESSION_SEPARATOR.len()..];
        if nonce.is_empty() {
            return Err(ParseError::Malformed);
        }
        Ok(SessionId {
            agent,
            nonce: nonce.to_string(),
        })
    }
}

impl_string_serde!(SessionId);

// ---------------------------------------------------------------------------
// MemberId
// ---------------------------------------------------------------------------

/// A subject of a group role entry: an account covalue or a raw agent
/// (invite agents are raw agents, never accounts).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemberId {
    Account(CoId),
    Agent(AgentId),
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberId::Account(id) => write!(f, "{id}"),
            MemberId::Agent(id) => write!(f, "{id}"),
        }
    }
}

impl fmt::Debug for MemberId {
    fmt_debug_via_display!();
}

impl FromStr for MemberId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with(PREFIX_CO) {
            Ok(MemberId::Account(s.parse()?))
        } else {
            Ok(MemberId::Agent(s.parse()?))
        }
    }
}

impl_string_serde!(MemberId);

//! Agent credentials: the dual keypair an account's device holds.
//!
//! An agent secret bundles the Ed25519 signing half and the X25519 sealing
//! half; its public form is the [`AgentId`]. Auth adapters persist the
//! string form (`sealerSecret_z…/signerSecret_z…`) together with the account
//! id and hand both back on restart.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::crypto::sealing::{generate_sealer_keypair, sealer_id};
use crate::crypto::signing::{generate_signing_keypair, signer_id};
use crate::ids::{AgentId, CoId, ParseError, SealerSecret, SignerSecret};

/// Both private halves of one agent.
#[derive(Clone, PartialEq, Eq)]
pub struct AgentSecret {
    pub sealer: SealerSecret,
    pub signer: SignerSecret,
}

impl AgentSecret {
    /// Generate a fresh agent.
    pub fn generate() -> Self {
        let (_, sealer) = generate_sealer_keypair();
        let (_, signer) = generate_signing_keypair();
        AgentSecret { sealer, signer }
    }

    /// The public identity of this agent.
    pub fn id(&self) -> AgentId {
        AgentId {
            sealer: sealer_id(&self.sealer),
            signer: signer_id(&self.signer),
        }
    }
}

impl fmt::Display for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sealer, self.signer)
    }
}

impl fmt::Debug for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentSecret(..)")
    }
}

impl FromStr for AgentSecret {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sealer, signer) = s.split_once('/').ok_or(ParseError::Malformed)?;
        Ok(AgentSecret {
            sealer: sealer.parse()?,
            signer: signer.parse()?,
        })
    }
}

impl Serialize for AgentSecret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AgentSecret {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// What an auth adapter persists per device.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountCredentials {
    pub account_id: CoId,
    pub account_secret: AgentSecret,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_secret_roundtrip() {
        let secret = AgentSecret::generate();
        let s = secret.to_string();
        assert!(s.starts_with("sealerSecret_z"));
        assert!(s.contains("/signerSecret_z"));
        let back: AgentSecret = s.parse().unwrap();
        assert_eq!(back, secret);
        assert_eq!(back.id(), secret.id());
    }

    #[test]
    fn test_agents_are_distinct() {
        assert_ne!(AgentSecret::generate().id(), AgentSecret::generate().id());
    }

    #[test]
    fn test_credentials_serde() {
        let creds = AccountCredentials {
            account_id: CoId([4u8; 32]),
            account_secret: AgentSecret::generate(),
        };
        let json = serde_json::to_string(&creds).unwrap();
        let back: AccountCredentials = serde_json::from_str(&json).unwrap();
        assert_eq!(back, creds);
    }
}

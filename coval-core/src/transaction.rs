//! Transactions: the signed, hash-chained unit of mutation.
//!
//! A transaction carries a list of CRDT changes either in the clear
//! (*trusting*, used under `unsafeAllowAll` rulesets and for group/admin
//! state that every replica must read) or encrypted under a group read key
//! (*private*).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ids::{CoId, Encrypted, KeyId, SessionId};

/// Soft cap on a single transaction's serialized size. Binary-stream writers
/// split blobs into chunks below this.
pub const MAX_RECOMMENDED_TX_SIZE: usize = 100 * 1024;

/// Whether a change list is written in the clear or under the read key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Privacy {
    Trusting,
    Private,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "privacy", rename_all = "camelCase")]
pub enum Transaction {
    #[serde(rename_all = "camelCase")]
    Trusting {
        /// Millis since the Unix epoch, non-decreasing within a session.
        made_at: u64,
        changes: Vec<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Private {
        made_at: u64,
        /// The read key this transaction was encrypted under.
        key_used: KeyId,
        encrypted_changes: Encrypted,
    },
}

impl Transaction {
    pub fn made_at(&self) -> u64 {
        match self {
            Transaction::Trusting { made_at, .. } => *made_at,
            Transaction::Private { made_at, .. } => *made_at,
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Transaction::Private { .. })
    }

    pub fn key_used(&self) -> Option<KeyId> {
        match self {
            Transaction::Trusting { .. } => None,
            Transaction::Private { key_used, .. } => Some(*key_used),
        }
    }
}

/// Nonce material binding a private transaction's ciphertext to its slot in
/// a specific covalue and session.
pub fn tx_nonce_material(id: &CoId, session: &SessionId, tx_index: usize) -> Value {
    json!({
        "in": id.to_string(),
        "sessionID": session.to_string(),
        "txIndex": tx_index,
    })
}

/// Clamp a wall-clock reading so `madeAt` never regresses within a session.
pub fn clamp_made_at(now: u64, previous: Option<u64>) -> u64 {
    match previous {
        Some(prev) if now <= prev => prev + 1,
        _ => now,
    }
}

/// Current wall-clock time in millis since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_made_at_monotonic() {
        assert_eq!(clamp_made_at(100, None), 100);
        assert_eq!(clamp_made_at(100, Some(50)), 100);
        assert_eq!(clamp_made_at(100, Some(100)), 101);
        assert_eq!(clamp_made_at(100, Some(200)), 201);
    }

    #[test]
    fn test_trusting_serde_shape() {
        let tx = Transaction::Trusting {
            made_at: 42,
            changes: vec![json!({"op": "set", "key": "a", "value": 1})],
        };
        let value = serde_json::to_value(&tx).unwrap();
        assert_eq!(value["privacy"], "trusting");
        assert_eq!(value["madeAt"], 42);
        let back: Transaction = serde_json::from_value(value).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn test_private_serde_shape() {
        let tx = Transaction::Private {
            made_at: 42,
            key_used: crate::ids::KeySecret([1u8; 32]).id(),
            encrypted_changes: Encrypted(vec![1, 2, 3]),
        };
        let value = serde_json::to_value(&tx).unwrap();
        assert_eq!(value["privacy"], "private");
        assert!(value["keyUsed"].as_str().unwrap().starts_with("key_z"));
        let back: Transaction = serde_json::from_value(value).unwrap();
        assert_eq!(back, tx);
    }
}

//! Local-first collaboration engine.
//!
//! Peers independently mutate shared objects ("covalues") and converge
//! through a gossip-style sync protocol. Every covalue is a content-
//! addressed header plus per-session signed-hash-chained transaction logs;
//! the merged logs materialize a CRDT view (map, list, stream, or binary
//! stream). A group/permission layer gates who may sign and distributes
//! symmetric read keys sealed to members, rotating them on revocation.
//!
//! # Layers
//!
//! - [`crypto`] / [`canonical`] / [`ids`] — hashing, signing, sealing, and
//!   the typed string identifiers everything travels as
//! - [`session_log`] / [`covalue`] — the signed append-only logs and their
//!   deterministic merge
//! - [`content`] — the CRDT content types
//! - [`group`] — roles, read keys, invites
//! - [`sync`] — the per-peer missing-transaction negotiation
//! - [`node`] / [`account`] — the registry, account lifecycle, and query
//!   subscriptions

pub mod account;
pub mod canonical;
pub mod content;
pub mod covalue;
pub mod crypto;
pub mod group;
pub mod ids;
pub mod node;
pub mod session_log;
pub mod sync;
pub mod transaction;

pub use account::{AccountCredentials, AgentSecret};
pub use canonical::{canonical_bytes, canonical_string, stable_stringify};
pub use content::{
    BinaryStreamInfo, Change, CoListView, CoMapView, CoStreamView, ContentType, ContentView,
    Position,
};
pub use covalue::{CoValueCore, CoValueError, CoValueHeader, CoValueKnownState, Ruleset};
pub use crypto::{secure_hash, secure_hash_value, short_hash, Hash};
pub use group::{GroupContent, Role};
pub use ids::{
    AgentId, CoId, Encrypted, KeyId, KeySecret, MemberId, Sealed, SealerId, SealerSecret,
    SessionId, Signature, SignerId, SignerSecret,
};
pub use node::{
    LocalNode, NewAccount, NodeError, QueryView, Registry, SessionLocker,
};
pub use sync::{connected_peer_pair, PeerHandle, PeerRole, SyncManager, SyncMessage, WireMessage};
pub use transaction::{Privacy, Transaction, MAX_RECOMMENDED_TX_SIZE};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    #[test]
    fn test_version() {
        assert!(!super::VERSION.is_empty());
    }
}

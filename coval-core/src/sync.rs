//! The sync protocol: per-peer state and missing-transaction negotiation.
//!
//! Peers exchange JSON records over any duplex channel. Four record kinds
//! (`known`, `load`, `content`, `done`, tagged by `action`) carry the
//! protocol; adapters additionally emit `{"type":"ping"}` records as idle
//! traffic. For every peer the manager tracks what the peer claims to have
//! (`known`) and what we have already sent it (`optimistic`), and fans new
//! content out gossip-style to every peer that is behind. The manager never
//! opens or reconnects channels — adapters own the sockets and hand the
//! channel ends to [`SyncManager::add_peer`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::covalue::{CoValueError, CoValueHeader, CoValueKnownState, SessionNewContent};
use crate::ids::{CoId, SessionId};
use crate::node::Registry;
use crate::session_log::SessionLogError;

/// A peer channel is considered dead after this long without any inbound
/// record. Adapters own the timers; [`SyncManager::idle_peers`] does the
/// bookkeeping.
pub const PING_TIMEOUT_MS: u64 = 2500;

// ---------------------------------------------------------------------------
// Wire records
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Receives unsolicited sync of everything we know.
    Server,
    /// Only hears about covalues it asked for.
    Client,
    /// Symmetric gossip peer.
    Peer,
    /// Durability collaborator; treated like a server.
    Storage,
}

impl PeerRole {
    /// Whether this peer gets covalues it never asked about.
    pub fn unsolicited(self) -> bool {
        !matches!(self, PeerRole::Client)
    }
}

/// Sync protocol records, tagged by `action`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum SyncMessage {
    #[serde(rename_all = "camelCase")]
    Known {
        id: CoId,
        #[serde(default)]
        header: bool,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        sessions: BTreeMap<SessionId, usize>,
    },
    #[serde(rename_all = "camelCase")]
    Load {
        id: CoId,
        #[serde(default)]
        header: bool,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        sessions: BTreeMap<SessionId, usize>,
    },
    #[serde(rename_all = "camelCase")]
    Content {
        id: CoId,
        #[serde(skip_serializing_if = "Option::is_none")]
        header: Option<CoValueHeader>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        new: BTreeMap<SessionId, SessionNewContent>,
    },
    Done {
        id: CoId,
    },
}

/// Idle-traffic record emitted by peer adapters.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PingMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub time: u64,
    pub dc: String,
}

/// Everything a peer channel may carry.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum WireMessage {
    Sync(SyncMessage),
    Ping(PingMessage),
}

impl From<SyncMessage> for WireMessage {
    fn from(msg: SyncMessage) -> Self {
        WireMessage::Sync(msg)
    }
}

// ---------------------------------------------------------------------------
// Peer plumbing
// ---------------------------------------------------------------------------

/// One end of a duplex peer channel, as handed to the node by an adapter.
#[derive(Debug)]
pub struct PeerHandle {
    /// Name of the remote peer.
    pub id: String,
    pub role: PeerRole,
    pub outgoing: mpsc::UnboundedSender<WireMessage>,
    pub incoming: mpsc::UnboundedReceiver<WireMessage>,
}

/// An in-memory duplex pair: what the first node sends, the second receives
/// and vice versa. The returned handles describe the *remote* side, so the
/// first handle carries `second`'s name and role.
pub fn connected_peer_pair(
    first: (&str, PeerRole),
    second: (&str, PeerRole),
) -> (PeerHandle, PeerHandle) {
    let (to_second, from_first) = mpsc::unbounded_channel();
    let (to_first, from_second) = mpsc::unbounded_channel();
    (
        PeerHandle {
            id: second.0.to_string(),
            role: second.1,
            outgoing: to_second,
            incoming: from_second,
        },
        PeerHandle {
            id: first.0.to_string(),
            role: first.1,
            outgoing: to_first,
            incoming: from_first,
        },
    )
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("unknown peer {0}")]
    UnknownPeer(String),

    #[error("channel to peer {0} closed")]
    ChannelClosed(String),
}

struct PeerState {
    role: PeerRole,
    outgoing: mpsc::UnboundedSender<WireMessage>,
    /// What the peer told us it has.
    known: HashMap<CoId, CoValueKnownState>,
    /// What we have already offered or sent it.
    optimistic: HashMap<CoId, CoValueKnownState>,
    /// Covalues the peer explicitly asked for.
    asked_for: HashSet<CoId>,
    last_activity: u64,
    dead: bool,
}

impl PeerState {
    fn wants(&self, id: &CoId) -> bool {
        self.role.unsolicited() || self.asked_for.contains(id)
    }

    fn effective_known(&self, id: &CoId) -> CoValueKnownState {
        let mut state = self.known.get(id).cloned().unwrap_or_default();
        if let Some(optimistic) = self.optimistic.get(id) {
            state.header |= optimistic.header;
            for (session, len) in &optimistic.sessions {
                let entry = state.sessions.entry(session.clone()).or_insert(0);
                *entry = (*entry).max(*len);
            }
        }
        state
    }

    fn send(&mut self, peer_id: &str, msg: SyncMessage) {
        if self.dead {
            return;
        }
        if self.outgoing.send(msg.into()).is_err() {
            log::info!("peer {peer_id}: channel closed, removing");
            self.dead = true;
        }
    }
}

// ---------------------------------------------------------------------------
// SyncManager
// ---------------------------------------------------------------------------

pub struct SyncManager {
    peers: Mutex<HashMap<String, PeerState>>,
}

impl Default for SyncManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncManager {
    pub fn new() -> Self {
        SyncManager {
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a peer channel. Unsolicited-sync peers are immediately told
    /// what we have.
    pub fn add_peer(
        &self,
        registry: &Registry,
        peer_id: &str,
        role: PeerRole,
        outgoing: mpsc::UnboundedSender<WireMessage>,
    ) {
        let mut peers = self.peers.lock().unwrap();
        let mut state = PeerState {
            role,
            outgoing,
            known: HashMap::new(),
            optimistic: HashMap::new(),
            asked_for: HashSet::new(),
            last_activity: crate::transaction::now_ms(),
            dead: false,
        };
        if role.unsolicited() {
            for id in registry.all_ids() {
                if let Some(known) = registry.known_state(&id) {
                    state.send(
                        peer_id,
                        SyncMessage::Known {
                            id,
                            header: known.header,
                            sessions: known.sessions,
                        },
                    );
                }
            }
        }
        peers.insert(peer_id.to_string(), state);
    }

    pub fn remove_peer(&self, peer_id: &str) -> bool {
        self.peers.lock().unwrap().remove(peer_id).is_some()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.lock().unwrap().keys().cloned().collect()
    }

    /// Peers with no inbound traffic for [`PING_TIMEOUT_MS`].
    pub fn idle_peers(&self, now_ms: u64) -> Vec<String> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, state)| now_ms.saturating_sub(state.last_activity) > PING_TIMEOUT_MS)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Handle one inbound record from `peer_id`. Returns the covalues that
    /// gained new transactions; the caller gossips those onward and delivers
    /// subscriptions.
    pub fn handle_message(
        &self,
        registry: &Registry,
        peer_id: &str,
        msg: WireMessage,
    ) -> Result<Vec<CoId>, SyncError> {
        let mut peers = self.peers.lock().unwrap();
        let peer = peers
            .get_mut(peer_id)
            .ok_or_else(|| SyncError::UnknownPeer(peer_id.to_string()))?;
        peer.last_activity = crate::transaction::now_ms();

        let sync_msg = match msg {
            WireMessage::Ping(_) => return Ok(Vec::new()),
            WireMessage::Sync(sync_msg) => sync_msg,
        };

        let mut changed = Vec::new();
        match sync_msg {
            SyncMessage::Known {
                id,
                header,
                sessions,
            } => {
                peer.known.insert(id, CoValueKnownState { header, sessions });
                self.reconcile(registry, peer_id, peer, &id);
            }
            SyncMessage::Load {
                id,
                header,
                sessions,
            } => {
                peer.asked_for.insert(id);
                peer.known.insert(id, CoValueKnownState { header, sessions });
                match registry.get(&id) {
                    Some(_) => self.push_content(registry, peer_id, peer, &id),
                    None => peer.send(
                        peer_id,
                        SyncMessage::Known {
                            id,
                            header: false,
                            sessions: BTreeMap::new(),
                        },
                    ),
                }
            }
            SyncMessage::Content { id, header, new } => {
                if let Some(added) = self.ingest(registry, peer_id, peer, id, header, new) {
                    if added {
                        changed.push(id);
                    }
                }
            }
            SyncMessage::Done { id } => {
                log::debug!("peer {peer_id}: done for {id}");
            }
        }

        peers.retain(|_, state| !state.dead);
        Ok(changed)
    }

    /// Announce a locally created or newly loaded covalue (protocol step 1).
    pub fn announce(&self, registry: &Registry, id: &CoId) {
        let Some(known) = registry.known_state(id) else {
            return;
        };
        let mut peers = self.peers.lock().unwrap();
        for (peer_id, state) in peers.iter_mut() {
            if state.wants(id) {
                state.send(
                    peer_id,
                    SyncMessage::Known {
                        id: *id,
                        header: known.header,
                        sessions: known.sessions.clone(),
                    },
                );
            }
        }
        peers.retain(|_, state| !state.dead);
    }

    /// Ask peers for a covalue we do not hold yet.
    pub fn request_load(&self, id: &CoId) {
        let mut peers = self.peers.lock().unwrap();
        for (peer_id, state) in peers.iter_mut() {
            if state.role.unsolicited() {
                state.send(
                    peer_id,
                    SyncMessage::Load {
                        id: *id,
                        header: false,
                        sessions: BTreeMap::new(),
                    },
                );
            }
        }
        peers.retain(|_, state| !state.dead);
    }

    /// Gossip fan-out after new content (local write or remote ingest):
    /// every peer that is behind and cares gets the missing slices.
    pub fn broadcast_content(&self, registry: &Registry, id: &CoId) {
        let mut peers = self.peers.lock().unwrap();
        let peer_ids: Vec<String> = peers.keys().cloned().collect();
        for peer_id in peer_ids {
            let Some(state) = peers.get_mut(&peer_id) else {
                continue;
            };
            if state.wants(id) {
                self.push_content(registry, &peer_id, state, id);
            }
        }
        peers.retain(|_, state| !state.dead);
    }

    /// Send a peer everything it lacks for `id`, based on its effective
    /// (claimed + already-sent) state.
    fn push_content(&self, registry: &Registry, peer_id: &str, peer: &mut PeerState, id: &CoId) {
        let Some(value) = registry.get(id) else {
            return;
        };
        let peer_known = peer.effective_known(id);

        let (header, new, our_known) = {
            let value = value.lock().unwrap();
            let our_known = value.known_state();
            let header = (!peer_known.header).then(|| value.header().clone());
            let mut new = BTreeMap::new();
            for (session, log) in value.sessions() {
                let theirs = peer_known.session_len(session);
                if log.len() > theirs {
                    if let Some(signature) = log.last_signature() {
                        new.insert(
                            session.clone(),
                            SessionNewContent {
                                after: theirs,
                                new_transactions: log.slice(theirs).to_vec(),
                                last_signature: *signature,
                            },
                        );
                    }
                }
            }
            (header, new, our_known)
        };

        if header.is_none() && new.is_empty() {
            return;
        }
        peer.optimistic.insert(*id, our_known);
        peer.send(peer_id, SyncMessage::Content { id: *id, header, new });
    }

    /// After a peer's `known`: push what it lacks, request what we lack.
    fn reconcile(&self, registry: &Registry, peer_id: &str, peer: &mut PeerState, id: &CoId) {
        let Some(value) = registry.get(id) else {
            // First time we hear of this covalue: ask for all of it.
            peer.send(
                peer_id,
                SyncMessage::Load {
                    id: *id,
                    header: false,
                    sessions: BTreeMap::new(),
                },
            );
            return;
        };

        let peer_claim = peer.known.get(id).cloned().unwrap_or_default();
        let our_known = value.lock().unwrap().known_state();
        let behind = peer_claim.sessions.iter().any(|(session, theirs)| {
            *theirs > our_known.session_len(session)
        });
        if behind {
            peer.send(
                peer_id,
                SyncMessage::Load {
                    id: *id,
                    header: our_known.header,
                    sessions: our_known.sessions,
                },
            );
        }
        self.push_content(registry, peer_id, peer, id);
    }

    /// Ingest a `content` record. Returns `Some(true)` when transactions were
    /// appended, `Some(false)` for a no-op, `None` when the covalue could not
    /// be created.
    fn ingest(
        &self,
        registry: &Registry,
        peer_id: &str,
        peer: &mut PeerState,
        id: CoId,
        header: Option<CoValueHeader>,
        new: BTreeMap<SessionId, SessionNewContent>,
    ) -> Option<bool> {
        let mut created = false;
        let value = match registry.get(&id) {
            Some(value) => value,
            None => {
                let header = match header {
                    Some(header) => header,
                    None => {
                        // Content for a covalue we have no header for: ask.
                        peer.send(
                            peer_id,
                            SyncMessage::Load {
                                id,
                                header: false,
                                sessions: BTreeMap::new(),
                            },
                        );
                        return None;
                    }
                };
                match registry.insert_received(id, header) {
                    Ok(value) => {
                        created = true;
                        value
                    }
                    Err(err) => {
                        log::warn!("peer {peer_id}: rejected header for {id}: {err}");
                        return None;
                    }
                }
            }
        };

        let mut added = false;
        let mut need_load = false;
        {
            let mut value = value.lock().unwrap();
            for (session, content) in &new {
                match value.try_add_transactions(registry, session, content) {
                    Ok(n) => added |= n > 0,
                    Err(CoValueError::SessionLog(SessionLogError::Duplicate)) => {}
                    Err(CoValueError::SessionLog(SessionLogError::Gap { .. })) => {
                        need_load = true;
                    }
                    Err(err) => {
                        log::warn!("peer {peer_id}: dropped content for {id}: {err}");
                    }
                }
            }
        }
        if added {
            registry.note_mutation(&id);
            peer.send(peer_id, SyncMessage::Done { id });
        }

        // Their known state advanced at least to what they sent.
        let claim = peer.known.entry(id).or_default();
        claim.header = true;
        for (session, content) in &new {
            let end = content.after + content.new_transactions.len();
            let entry = claim.sessions.entry(session.clone()).or_insert(0);
            *entry = (*entry).max(end);
        }

        if need_load {
            let our_known = value.lock().unwrap().known_state();
            peer.send(
                peer_id,
                SyncMessage::Load {
                    id,
                    header: our_known.header,
                    sessions: our_known.sessions,
                },
            );
        }
        Some(added || created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sync_message_wire_shape() {
        let id = CoId([1u8; 32]);
        let msg = SyncMessage::Known {
            id,
            header: true,
            sessions: BTreeMap::new(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["action"], "known");
        assert_eq!(value["id"], id.to_string());
        assert_eq!(value["header"], true);

        let back: SyncMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_ping_wire_shape() {
        let record = json!({"type": "ping", "time": 123, "dc": "local"});
        let msg: WireMessage = serde_json::from_value(record).unwrap();
        assert!(matches!(msg, WireMessage::Ping(PingMessage { ref kind, .. }) if kind == "ping"));
    }

    #[test]
    fn test_load_defaults() {
        let id = CoId([2u8; 32]);
        let record = json!({"action": "load", "id": id.to_string()});
        let msg: WireMessage = serde_json::from_value(record).unwrap();
        assert_eq!(
            msg,
            WireMessage::Sync(SyncMessage::Load {
                id,
                header: false,
                sessions: BTreeMap::new(),
            })
        );
    }

    #[test]
    fn test_connected_pair_crosses_channels() {
        let (mut left, mut right) = connected_peer_pair(
            ("one", PeerRole::Server),
            ("two", PeerRole::Client),
        );
        assert_eq!(left.id, "two");
        assert_eq!(right.id, "one");

        left.outgoing
            .send(SyncMessage::Done { id: CoId([3u8; 32]) }.into())
            .unwrap();
        let received = right.incoming.try_recv().unwrap();
        assert!(matches!(received, WireMessage::Sync(SyncMessage::Done { .. })));
        assert!(left.incoming.try_recv().is_err());
    }

    #[test]
    fn test_peer_role_solicitation() {
        assert!(PeerRole::Server.unsolicited());
        assert!(PeerRole::Storage.unsolicited());
        assert!(PeerRole::Peer.unsolicited());
        assert!(!PeerRole::Client.unsolicited());
    }
}

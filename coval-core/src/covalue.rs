//! The covalue core: one content-addressed header plus the session logs that
//! grow under it.
//!
//! All mutation funnels through [`CoValueCore::try_add_transactions`]
//! (remote ingest) or [`CoValueCore::add_local_transaction`] (the local
//! writer); both verify the session chain and gate on the ruleset, and both
//! invalidate the materialization cache atomically with the append.
//! Materialization interleaves every session's transactions by
//! `(madeAt, sessionID)`, decrypts private payloads with keys resolved
//! through the owning group, filters out writes whose author lacked the
//! required role at their `madeAt`, and folds the survivors into the typed
//! view named by the header.

use std::collections::BTreeMap;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::canonical::CanonicalError;
use crate::content::{self, ContentType, ContentView, OrderedChange};
use crate::crypto::hashing::secure_hash;
use crate::group::{fold_group, GroupContent, Role};
use crate::ids::{AgentId, CoId, KeyId, KeySecret, MemberId, SessionId, Signature, SignerSecret};
use crate::session_log::{SessionLog, SessionLogError};
use crate::transaction::{tx_nonce_material, Transaction};

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Who may write to a covalue and how readers get keys.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Ruleset {
    /// The covalue is itself a permission group.
    Group,
    /// Writes are gated by the referenced group's roles.
    OwnedByGroup { group: CoId },
    /// Anyone may write; content is always trusting.
    UnsafeAllowAll,
    /// The covalue is an account: a group whose members are raw agents.
    Account,
}

/// The immutable, content-addressed header. Its hash is the covalue's id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoValueHeader {
    #[serde(rename = "type")]
    pub content_type: ContentType,
    pub ruleset: Ruleset,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    pub created_at: u64,
    pub uniqueness: String,
}

impl CoValueHeader {
    /// Assemble a fresh header with a random uniqueness salt.
    pub fn new(content_type: ContentType, ruleset: Ruleset, meta: Option<Value>) -> Self {
        let mut salt = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        CoValueHeader {
            content_type,
            ruleset,
            meta,
            created_at: crate::transaction::now_ms(),
            uniqueness: bs58::encode(salt).into_string(),
        }
    }

    pub fn id(&self) -> CoId {
        let hash = secure_hash(self).expect("header serialization is infallible");
        CoId::from_header_hash(hash)
    }
}

// ---------------------------------------------------------------------------
// Known state and wire content
// ---------------------------------------------------------------------------

/// Summary of what a replica holds for one covalue.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CoValueKnownState {
    pub header: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sessions: BTreeMap<SessionId, usize>,
}

impl CoValueKnownState {
    pub fn session_len(&self, session: &SessionId) -> usize {
        self.sessions.get(session).copied().unwrap_or(0)
    }
}

/// A batch of transactions for one session, as shipped in `content`
/// messages: everything after index `after`, signed once over the final
/// chain hash.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionNewContent {
    pub after: usize,
    pub new_transactions: Vec<Transaction>,
    pub last_signature: Signature,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Identity indirection into the node's registry: covalues reference their
/// group and authors by id only and look them up on demand.
pub trait Resolver {
    /// The account a writing agent speaks for, or the raw agent when no
    /// loaded account lists it.
    fn author_of(&self, agent: &AgentId) -> MemberId;

    /// The folded permission state of a group or account covalue.
    fn group_content_of(&self, group: &CoId) -> Option<GroupContent>;

    /// A read-key secret of the given group, resolved as the local account.
    fn read_key(&self, group: &CoId, key: KeyId) -> Option<KeySecret>;

    /// Bumped on every registry mutation; materialization caches key on it.
    fn epoch(&self) -> u64;
}

/// Resolver for contexts with no registry (tests, standalone folds): every
/// writer is its raw agent and no keys resolve.
pub struct NoResolver;

impl Resolver for NoResolver {
    fn author_of(&self, agent: &AgentId) -> MemberId {
        MemberId::Agent(*agent)
    }

    fn group_content_of(&self, _group: &CoId) -> Option<GroupContent> {
        None
    }

    fn read_key(&self, _group: &CoId, _key: KeyId) -> Option<KeySecret> {
        None
    }

    fn epoch(&self) -> u64 {
        0
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum CoValueError {
    #[error("header hash does not match covalue id")]
    InvalidHeader,

    #[error("agent {agent} may not write to {id} under its ruleset")]
    Unauthorized { id: CoId, agent: AgentId },

    #[error("owning group {0} is not available")]
    GroupUnavailable(CoId),

    #[error(transparent)]
    SessionLog(#[from] SessionLogError),

    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

pub type Result<T> = std::result::Result<T, CoValueError>;

// ---------------------------------------------------------------------------
// CoValueCore
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct ContentCache {
    total: usize,
    epoch: u64,
    view: ContentView,
    group: Option<GroupContent>,
}

#[derive(Clone, Debug)]
pub struct CoValueCore {
    id: CoId,
    header: CoValueHeader,
    sessions: BTreeMap<SessionId, SessionLog>,
    cache: Option<ContentCache>,
}

impl CoValueCore {
    /// A covalue born locally from a freshly assembled header.
    pub fn new(header: CoValueHeader) -> Self {
        CoValueCore {
            id: header.id(),
            header,
            sessions: BTreeMap::new(),
            cache: None,
        }
    }

    /// A covalue received from a peer: the header must hash to the id it was
    /// announced under.
    pub fn from_received_header(id: CoId, header: CoValueHeader) -> Result<Self> {
        if header.id() != id {
            return Err(CoValueError::InvalidHeader);
        }
        Ok(CoValueCore {
            id,
            header,
            sessions: BTreeMap::new(),
            cache: None,
        })
    }

    pub fn id(&self) -> CoId {
        self.id
    }

    pub fn header(&self) -> &CoValueHeader {
        &self.header
    }

    pub fn content_type(&self) -> ContentType {
        self.header.content_type
    }

    pub fn ruleset(&self) -> &Ruleset {
        &self.header.ruleset
    }

    /// The group covalue gating writes here, for `ownedByGroup` rulesets.
    pub fn owning_group(&self) -> Option<CoId> {
        match self.header.ruleset {
            Ruleset::OwnedByGroup { group } => Some(group),
            _ => None,
        }
    }

    pub fn known_state(&self) -> CoValueKnownState {
        CoValueKnownState {
            header: true,
            sessions: self
                .sessions
                .iter()
                .map(|(session, log)| (session.clone(), log.len()))
                .collect(),
        }
    }

    pub fn sessions(&self) -> impl Iterator<Item = (&SessionId, &SessionLog)> {
        self.sessions.iter()
    }

    pub fn session(&self, session: &SessionId) -> Option<&SessionLog> {
        self.sessions.get(session)
    }

    pub fn total_transactions(&self) -> usize {
        self.sessions.values().map(|log| log.len()).sum()
    }

    /// Verify and append a batch received from a peer or storage.
    ///
    /// The session chain and signature are always enforced here.
    /// Authorization is enforced during materialization, against the roles
    /// in force at each transaction's `madeAt`: a batch whose author's
    /// account or role entry has not arrived yet still replicates, merges
    /// identically everywhere, and surfaces in the view the moment its
    /// authorization does arrive. Rejecting it at ingest would fork
    /// replicas on message ordering.
    pub fn try_add_transactions(
        &mut self,
        _resolver: &dyn Resolver,
        session_id: &SessionId,
        new_content: &SessionNewContent,
    ) -> Result<usize> {
        let log = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionLog::new(session_id.clone()));
        let added = log.try_add_batch(
            new_content.after,
            &new_content.new_transactions,
            new_content.last_signature,
        )?;
        self.cache = None;
        Ok(added)
    }

    /// Sign and append one transaction written by this node.
    ///
    /// Unlike remote ingest this checks the *current* role strictly: a local
    /// write the ruleset forbids is a programmer error and fails loudly.
    pub fn add_local_transaction(
        &mut self,
        resolver: &dyn Resolver,
        session_id: &SessionId,
        secret: &SignerSecret,
        tx: Transaction,
    ) -> Result<(crate::crypto::hashing::Hash, Signature)> {
        self.check_local_write_allowed(resolver, &session_id.agent, tx.is_private())?;
        let log = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionLog::new(session_id.clone()));
        let (after, signature) = log.sign(secret, &tx)?;
        log.try_add(tx, after, signature)?;
        self.cache = None;
        Ok((after, signature))
    }

    /// The next `madeAt` for a local write in `session`, clamped so it never
    /// regresses.
    pub fn next_made_at(&self, session: &SessionId) -> u64 {
        let previous = self.sessions.get(session).and_then(|log| log.last_made_at());
        crate::transaction::clamp_made_at(crate::transaction::now_ms(), previous)
    }

    /// The next transaction index for a local write in `session`.
    pub fn next_tx_index(&self, session: &SessionId) -> usize {
        self.sessions.get(session).map(|log| log.len()).unwrap_or(0)
    }

    fn check_local_write_allowed(
        &mut self,
        resolver: &dyn Resolver,
        agent: &AgentId,
        private: bool,
    ) -> Result<()> {
        let id = self.id;
        let agent = *agent;
        let unauthorized = move || CoValueError::Unauthorized { id, agent };
        match self.header.ruleset.clone() {
            Ruleset::UnsafeAllowAll => {
                // No group, no keys: only trusting writes make sense here.
                if private {
                    Err(unauthorized())
                } else {
                    Ok(())
                }
            }
            Ruleset::Group | Ruleset::Account => {
                if self.total_transactions() == 0 {
                    return Ok(());
                }
                let author = self.ruleset_author(resolver, &agent);
                let role = self.own_group_content(resolver).current_role(&author);
                match role {
                    Some(role) if role.is_admin() || role.is_invite() => Ok(()),
                    _ => Err(unauthorized()),
                }
            }
            Ruleset::OwnedByGroup { group } => {
                let content = resolver
                    .group_content_of(&group)
                    .ok_or(CoValueError::GroupUnavailable(group))?;
                let author = resolver.author_of(&agent);
                match role_for(&content, &author, &agent, u64::MAX) {
                    Some(role) if role.can_write() => Ok(()),
                    _ => Err(unauthorized()),
                }
            }
        }
    }

    /// Own permission fold for group/account rulesets (empty for others).
    fn own_group_content(&mut self, resolver: &dyn Resolver) -> GroupContent {
        self.group_content(resolver).unwrap_or_default()
    }

    /// The member identity a writing agent carries under this ruleset:
    /// accounts fold their own agents, groups fold the agents' accounts.
    fn ruleset_author(&self, resolver: &dyn Resolver, agent: &AgentId) -> MemberId {
        match self.header.ruleset {
            Ruleset::Account => MemberId::Agent(*agent),
            _ => resolver.author_of(agent),
        }
    }

    /// The folded permission state of a group or account covalue (`None`
    /// for other rulesets).
    pub fn group_content(&mut self, resolver: &dyn Resolver) -> Option<GroupContent> {
        match self.header.ruleset {
            Ruleset::Group | Ruleset::Account => {
                self.materialize(resolver);
                self.cache.as_ref().and_then(|cache| cache.group.clone())
            }
            _ => None,
        }
    }

    /// The current typed view of this covalue.
    pub fn current_content(&mut self, resolver: &dyn Resolver) -> ContentView {
        self.materialize(resolver);
        self.cache
            .as_ref()
            .map(|cache| cache.view.clone())
            .expect("materialize always fills the cache")
    }

    fn materialize(&mut self, resolver: &dyn Resolver) {
        let total = self.total_transactions();
        let epoch = resolver.epoch();
        if let Some(cache) = &self.cache {
            if cache.total == total && cache.epoch == epoch {
                return;
            }
        }

        let ordered_txs = self.merge_order();
        let (changes, group) = match self.header.ruleset.clone() {
            Ruleset::Group | Ruleset::Account => {
                let raw = self.collect_changes(resolver, &ordered_txs, None);
                let group = fold_group(&raw);
                (group.valid_changes().to_vec(), Some(group))
            }
            Ruleset::UnsafeAllowAll => (self.collect_changes(resolver, &ordered_txs, None), None),
            Ruleset::OwnedByGroup { group } => {
                let group_content = resolver.group_content_of(&group);
                let changes = match &group_content {
                    Some(content) => {
                        self.collect_changes(resolver, &ordered_txs, Some((&group, content)))
                    }
                    None => {
                        log::debug!("{}: owning group {} unavailable, empty view", self.id, group);
                        Vec::new()
                    }
                };
                (changes, None)
            }
        };

        let view = content::materialize(self.header.content_type, &changes);
        self.cache = Some(ContentCache {
            total,
            epoch,
            view,
            group,
        });
    }

    /// All transactions of all sessions in deterministic merge order:
    /// `madeAt` ascending, session id lexicographic, then append order.
    fn merge_order(&self) -> Vec<(SessionId, usize, Transaction)> {
        let mut txs: Vec<(SessionId, usize, Transaction)> = self
            .sessions
            .iter()
            .flat_map(|(session, log)| {
                log.transactions()
                    .iter()
                    .enumerate()
                    .map(move |(tx_index, tx)| (session.clone(), tx_index, tx.clone()))
            })
            .collect();
        txs.sort_by(|(sa, ia, ta), (sb, ib, tb)| {
            ta.made_at()
                .cmp(&tb.made_at())
                .then_with(|| sa.to_string().cmp(&sb.to_string()))
                .then_with(|| ia.cmp(ib))
        });
        txs
    }

    /// Expand ordered transactions into ordered changes, decrypting private
    /// payloads and, when an owning group is given, dropping transactions
    /// whose author lacked write permission at their `madeAt`.
    fn collect_changes(
        &self,
        resolver: &dyn Resolver,
        ordered_txs: &[(SessionId, usize, Transaction)],
        owning: Option<(&CoId, &GroupContent)>,
    ) -> Vec<OrderedChange> {
        let mut out = Vec::new();
        for (session, tx_index, tx) in ordered_txs {
            let author = self.ruleset_author(resolver, &session.agent);

            if let Some((_, group_content)) = owning {
                let role = role_for(group_content, &author, &session.agent, tx.made_at());
                if !role.map(Role::can_write).unwrap_or(false) {
                    log::debug!(
                        "{}: dropping tx by {} without write role at {}",
                        self.id,
                        author,
                        tx.made_at()
                    );
                    continue;
                }
            }

            let raw_changes: Vec<Value> = match tx {
                Transaction::Trusting { changes, .. } => changes.clone(),
                Transaction::Private {
                    key_used,
                    encrypted_changes,
                    ..
                } => {
                    let Some((group_id, _)) = owning else {
                        // No owning group means no key source: retained in
                        // the log, absent from the view.
                        continue;
                    };
                    let Some(key) = resolver.read_key(group_id, *key_used) else {
                        log::debug!("{}: no key {} yet, tx skipped", self.id, key_used);
                        continue;
                    };
                    let material = tx_nonce_material(&self.id, session, *tx_index);
                    match crate::crypto::encryption::decrypt_for_transaction(
                        encrypted_changes,
                        &key,
                        &material,
                    ) {
                        Some(changes) => changes,
                        None => {
                            log::debug!("{}: undecryptable tx skipped", self.id);
                            continue;
                        }
                    }
                }
            };

            for (change_index, raw) in raw_changes.iter().enumerate() {
                let Some(change) = content::parse_change(raw) else {
                    continue;
                };
                out.push(OrderedChange {
                    session: session.clone(),
                    author,
                    made_at: tx.made_at(),
                    tx_index: *tx_index,
                    change_index,
                    change,
                });
            }
        }
        out
    }
}

/// Role lookup with the account/agent duality: a session's writes count
/// under its resolved account, but an account covalue acting as a group
/// lists raw agents, so the agent form is consulted as a fallback.
fn role_for(
    content: &GroupContent,
    author: &MemberId,
    agent: &AgentId,
    time: u64,
) -> Option<Role> {
    content
        .role_at(author, time)
        .or_else(|| content.role_at(&MemberId::Agent(*agent), time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Change;
    use crate::crypto::sealing::generate_sealer_keypair;
    use crate::crypto::signing::generate_signing_keypair;
    use serde_json::json;

    fn agent() -> (AgentId, SignerSecret) {
        let (signer, signer_secret) = generate_signing_keypair();
        let (sealer, _) = generate_sealer_keypair();
        (AgentId { sealer, signer }, signer_secret)
    }

    fn open_map() -> CoValueCore {
        CoValueCore::new(CoValueHeader::new(
            ContentType::Map,
            Ruleset::UnsafeAllowAll,
            None,
        ))
    }

    fn set_tx(made_at: u64, key: &str, value: Value) -> Transaction {
        Transaction::Trusting {
            made_at,
            changes: vec![serde_json::to_value(Change::Set {
                key: key.into(),
                value,
            })
            .unwrap()],
        }
    }

    #[test]
    fn test_id_is_header_hash() {
        let header = CoValueHeader::new(ContentType::Map, Ruleset::UnsafeAllowAll, None);
        let id = header.id();
        let value = CoValueCore::new(header.clone());
        assert_eq!(value.id(), id);
        assert!(CoValueCore::from_received_header(id, header).is_ok());
    }

    #[test]
    fn test_received_header_must_match_id() {
        let header = CoValueHeader::new(ContentType::Map, Ruleset::UnsafeAllowAll, None);
        let other = CoValueHeader::new(ContentType::Map, Ruleset::UnsafeAllowAll, None);
        assert!(matches!(
            CoValueCore::from_received_header(header.id(), other),
            Err(CoValueError::InvalidHeader)
        ));
    }

    #[test]
    fn test_headers_are_unique() {
        let a = CoValueHeader::new(ContentType::Map, Ruleset::UnsafeAllowAll, None);
        let b = CoValueHeader::new(ContentType::Map, Ruleset::UnsafeAllowAll, None);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_local_write_and_read_back() {
        let (agent_id, secret) = agent();
        let session = SessionId::random(agent_id);
        let mut value = open_map();

        value
            .add_local_transaction(&NoResolver, &session, &secret, set_tx(1, "foo", json!("bar")))
            .unwrap();

        let view = value.current_content(&NoResolver);
        assert_eq!(view.as_map().unwrap().get("foo"), Some(&json!("bar")));
    }

    #[test]
    fn test_known_state_counts_sessions() {
        let (agent_id, secret) = agent();
        let session = SessionId::random(agent_id);
        let mut value = open_map();

        value
            .add_local_transaction(&NoResolver, &session, &secret, set_tx(1, "a", json!(1)))
            .unwrap();
        value
            .add_local_transaction(&NoResolver, &session, &secret, set_tx(2, "b", json!(2)))
            .unwrap();

        let known = value.known_state();
        assert!(known.header);
        assert_eq!(known.session_len(&session), 2);
        assert_eq!(value.total_transactions(), 2);
    }

    #[test]
    fn test_merge_interleaves_by_made_at() {
        let (agent_a, secret_a) = agent();
        let (agent_b, secret_b) = agent();
        let session_a = SessionId::random(agent_a);
        let session_b = SessionId::random(agent_b);
        let mut value = open_map();

        // B's later write must win over A's earlier one, regardless of
        // arrival order.
        value
            .add_local_transaction(&NoResolver, &session_b, &secret_b, set_tx(5, "k", json!("late")))
            .unwrap();
        value
            .add_local_transaction(&NoResolver, &session_a, &secret_a, set_tx(1, "k", json!("early")))
            .unwrap();

        let view = value.current_content(&NoResolver);
        assert_eq!(view.as_map().unwrap().get("k"), Some(&json!("late")));
    }

    #[test]
    fn test_replicas_converge_via_batches() {
        let (agent_a, secret_a) = agent();
        let (agent_b, secret_b) = agent();
        let session_a = SessionId::random(agent_a);
        let session_b = SessionId::random(agent_b);

        let header = CoValueHeader::new(ContentType::Map, Ruleset::UnsafeAllowAll, None);
        let mut one = CoValueCore::new(header.clone());
        let mut two = CoValueCore::new(header);

        one.add_local_transaction(&NoResolver, &session_a, &secret_a, set_tx(1, "x", json!(1)))
            .unwrap();
        two.add_local_transaction(&NoResolver, &session_b, &secret_b, set_tx(2, "y", json!(2)))
            .unwrap();

        // Exchange each session's full log.
        let (sid_a, log_a) = one.sessions().next().map(|(s, l)| (s.clone(), l.clone())).unwrap();
        let (sid_b, log_b) = two.sessions().next().map(|(s, l)| (s.clone(), l.clone())).unwrap();

        two.try_add_transactions(
            &NoResolver,
            &sid_a,
            &SessionNewContent {
                after: 0,
                new_transactions: log_a.transactions().to_vec(),
                last_signature: *log_a.last_signature().unwrap(),
            },
        )
        .unwrap();
        one.try_add_transactions(
            &NoResolver,
            &sid_b,
            &SessionNewContent {
                after: 0,
                new_transactions: log_b.transactions().to_vec(),
                last_signature: *log_b.last_signature().unwrap(),
            },
        )
        .unwrap();

        assert_eq!(
            one.current_content(&NoResolver),
            two.current_content(&NoResolver)
        );
    }

    #[test]
    fn test_private_write_rejected_without_group() {
        let (agent_id, secret) = agent();
        let session = SessionId::random(agent_id);
        let mut value = open_map();

        let tx = Transaction::Private {
            made_at: 1,
            key_used: crate::ids::KeySecret([1; 32]).id(),
            encrypted_changes: crate::ids::Encrypted(vec![1, 2, 3]),
        };
        assert!(matches!(
            value.add_local_transaction(&NoResolver, &session, &secret, tx),
            Err(CoValueError::Unauthorized { .. })
        ));
    }

    #[test]
    fn test_made_at_clamping_across_appends() {
        let (agent_id, secret) = agent();
        let session = SessionId::random(agent_id);
        let mut value = open_map();

        let first = value.next_made_at(&session);
        value
            .add_local_transaction(
                &NoResolver,
                &session,
                &secret,
                set_tx(u64::MAX - 1, "k", json!(1)),
            )
            .unwrap();
        // The wall clock is far behind the stored madeAt now.
        let next = value.next_made_at(&session);
        assert!(next > u64::MAX - 1);
        assert!(first <= next);
    }
}

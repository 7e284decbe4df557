//! The node: top-level registry of covalues, account lifecycle, peer
//! plumbing, and query subscriptions.
//!
//! A node owns one agent identity and (usually) one account, holds every
//! loaded covalue behind the registry, and is the only place the sync
//! manager, the subscription fan-out, and the local write path meet. All
//! state mutation is funneled through the covalue cores; the node reacts to
//! each mutation by notifying load waiters, gossiping to peers, and
//! re-delivering query views.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use serde_json::{json, Value};
use thiserror::Error;

use crate::account::AgentSecret;
use crate::canonical::CanonicalError;
use crate::content::{
    binary, Change, ContentType, ContentView, Position,
};
use crate::covalue::{
    CoValueCore, CoValueError, CoValueHeader, CoValueKnownState, Resolver, Ruleset,
};
use crate::crypto::encryption::{
    encrypt_for_transaction, encrypt_key_secret, generate_key_secret, EncryptError,
};
use crate::crypto::sealing::{seal, SealError};
use crate::group::{
    read_key_change, role_change, sealed_key_change, wrapped_key_change, GroupContent, Role,
};
use crate::ids::{AgentId, CoId, KeyId, KeySecret, MemberId, SessionId, SignerSecret};
use crate::sync::{PeerHandle, PeerRole, SyncError, SyncManager, WireMessage};
use crate::transaction::{tx_nonce_material, Privacy, Transaction};

/// How long `load` waits for peers before reporting `Unavailable`.
pub const DEFAULT_LOAD_PATIENCE_MS: u64 = 5000;

/// How deep `query` follows covalue references nested in values.
pub const DEFAULT_QUERY_DEPTH: usize = 3;

/// Session slots tried per account on one device.
pub const MAX_SESSION_SLOTS: usize = 100;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("covalue {0} unavailable")]
    Unavailable(CoId),

    #[error("no free session slot for account {0}")]
    NoSessionSlot(CoId),

    #[error("account {account} does not list agent {agent}")]
    ForeignAccount { account: CoId, agent: AgentId },

    #[error("no usable read key for {0}")]
    NoReadKey(CoId),

    #[error("{id} holds a different content type")]
    WrongContentType { id: CoId },

    #[error("secret is not an open invite of {0}")]
    InvalidInvite(CoId),

    #[error("index {0} out of bounds")]
    IndexOutOfBounds(usize),

    #[error("private transactions need an owning group")]
    NoGroupForPrivacy,

    #[error(transparent)]
    CoValue(#[from] CoValueError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Seal(#[from] SealError),

    #[error(transparent)]
    Encrypt(#[from] EncryptError),

    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

pub type Result<T> = std::result::Result<T, NodeError>;

// ---------------------------------------------------------------------------
// Session lock
// ---------------------------------------------------------------------------

/// Process-wide mutual exclusion for session slots, injected so that test
/// harnesses and embedders can supply their own (the browser equivalent is
/// the platform lock manager).
pub trait SessionLocker: Send + Sync {
    fn try_acquire(&self, key: &str) -> bool;
    fn release(&self, key: &str);
}

static HELD_SESSION_SLOTS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

/// Default locker backed by a process-wide slot set.
pub struct InMemorySessionLocker;

impl SessionLocker for InMemorySessionLocker {
    fn try_acquire(&self, key: &str) -> bool {
        HELD_SESSION_SLOTS
            .get_or_init(|| Mutex::new(HashSet::new()))
            .lock()
            .unwrap()
            .insert(key.to_string())
    }

    fn release(&self, key: &str) {
        if let Some(slots) = HELD_SESSION_SLOTS.get() {
            slots.lock().unwrap().remove(key);
        }
    }
}

/// Holds one `accountID_<slot>` token; released on drop.
pub struct SessionToken {
    key: String,
    locker: Arc<dyn SessionLocker>,
}

impl Drop for SessionToken {
    fn drop(&mut self) {
        self.locker.release(&self.key);
    }
}

fn acquire_session_slot(
    locker: &Arc<dyn SessionLocker>,
    account: &CoId,
) -> Result<(usize, SessionToken)> {
    for slot in 0..MAX_SESSION_SLOTS {
        let key = format!("{account}_{slot}");
        if locker.try_acquire(&key) {
            return Ok((
                slot,
                SessionToken {
                    key,
                    locker: Arc::clone(locker),
                },
            ));
        }
    }
    Err(NodeError::NoSessionSlot(*account))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Every loaded covalue, plus the identity indirection the cores resolve
/// authors, groups, and read keys through.
pub struct Registry {
    values: Mutex<BTreeMap<CoId, Arc<Mutex<CoValueCore>>>>,
    /// agent → the loaded account covalue listing it.
    agent_accounts: Mutex<HashMap<AgentId, CoId>>,
    key_cache: Mutex<HashMap<KeyId, KeySecret>>,
    epoch: AtomicU64,
    agent: AgentId,
    agent_secret: AgentSecret,
    account: Mutex<Option<CoId>>,
}

impl Registry {
    pub fn new(agent_secret: AgentSecret) -> Self {
        Registry {
            values: Mutex::new(BTreeMap::new()),
            agent_accounts: Mutex::new(HashMap::new()),
            key_cache: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(1),
            agent: agent_secret.id(),
            agent_secret,
            account: Mutex::new(None),
        }
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub fn account(&self) -> Option<CoId> {
        *self.account.lock().unwrap()
    }

    pub(crate) fn set_account(&self, account: CoId) {
        *self.account.lock().unwrap() = Some(account);
    }

    pub(crate) fn signer_secret(&self) -> &SignerSecret {
        &self.agent_secret.signer
    }

    pub(crate) fn agent_secret_sealer(&self) -> crate::ids::SealerSecret {
        self.agent_secret.sealer.clone()
    }

    /// The member identity local writes carry.
    pub fn me(&self) -> MemberId {
        match self.account() {
            Some(account) => MemberId::Account(account),
            None => MemberId::Agent(self.agent),
        }
    }

    pub fn get(&self, id: &CoId) -> Option<Arc<Mutex<CoValueCore>>> {
        self.values.lock().unwrap().get(id).cloned()
    }

    pub fn all_ids(&self) -> Vec<CoId> {
        self.values.lock().unwrap().keys().copied().collect()
    }

    pub fn known_state(&self, id: &CoId) -> Option<CoValueKnownState> {
        let value = self.get(id)?;
        let state = value.lock().unwrap().known_state();
        Some(state)
    }

    /// Register a locally assembled covalue.
    pub fn insert_new(&self, value: CoValueCore) -> Arc<Mutex<CoValueCore>> {
        let id = value.id();
        let value = Arc::new(Mutex::new(value));
        self.values.lock().unwrap().insert(id, Arc::clone(&value));
        self.epoch.fetch_add(1, Ordering::SeqCst);
        value
    }

    /// Register a covalue received from a peer, verifying its header hash.
    pub fn insert_received(
        &self,
        id: CoId,
        header: CoValueHeader,
    ) -> std::result::Result<Arc<Mutex<CoValueCore>>, CoValueError> {
        let value = CoValueCore::from_received_header(id, header)?;
        Ok(self.insert_new(value))
    }

    /// Record that a covalue changed: bump the epoch and, for accounts,
    /// refresh the agent index so sessions of their agents attribute to the
    /// account.
    pub fn note_mutation(&self, id: &CoId) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let Some(value) = self.get(id) else {
            return;
        };
        let is_account = {
            let value = value.lock().unwrap();
            matches!(value.ruleset(), Ruleset::Account)
        };
        if !is_account {
            return;
        }
        let Some(content) = value.lock().unwrap().group_content(self) else {
            return;
        };
        let mut index = self.agent_accounts.lock().unwrap();
        for (member, role) in content.roles_at(u64::MAX) {
            if let MemberId::Agent(agent) = member {
                if role.can_read() {
                    index.insert(agent, *id);
                }
            }
        }
    }
}

impl Resolver for Registry {
    fn author_of(&self, agent: &AgentId) -> MemberId {
        match self.agent_accounts.lock().unwrap().get(agent) {
            Some(account) => MemberId::Account(*account),
            None => MemberId::Agent(*agent),
        }
    }

    fn group_content_of(&self, group: &CoId) -> Option<GroupContent> {
        let value = self.get(group)?;
        let content = value.lock().unwrap().group_content(self);
        content
    }

    fn read_key(&self, group: &CoId, key: KeyId) -> Option<KeySecret> {
        if let Some(secret) = self.key_cache.lock().unwrap().get(&key) {
            return Some(secret.clone());
        }
        let content = self.group_content_of(group)?;
        let mut candidates = vec![MemberId::Agent(self.agent)];
        if let Some(account) = self.account() {
            candidates.insert(0, MemberId::Account(account));
        }
        for member in candidates {
            if let Some(secret) =
                content.unwrap_read_key(group, key, &member, &self.agent_secret.sealer)
            {
                self.key_cache.lock().unwrap().insert(key, secret.clone());
                return Some(secret);
            }
        }
        None
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Query views
// ---------------------------------------------------------------------------

/// One delivery of a query subscription: the root view plus every nested
/// covalue reachable within the subscription depth.
#[derive(Clone, Debug)]
pub struct QueryView {
    pub id: CoId,
    pub root: ContentView,
    pub nested: BTreeMap<CoId, ContentView>,
}

impl QueryView {
    pub fn nested(&self, id: &CoId) -> Option<&ContentView> {
        self.nested.get(id)
    }
}

type QueryCallback = Arc<dyn Fn(Option<QueryView>) + Send + Sync>;

struct Subscription {
    root: CoId,
    depth: usize,
    callback: QueryCallback,
    /// Root plus every id seen (or still loading) at the last delivery.
    watching: HashSet<CoId>,
}

/// Cancellation handle returned by [`LocalNode::query`].
pub struct QueryUnsubscribe {
    node: Arc<LocalNode>,
    token: u64,
}

impl QueryUnsubscribe {
    pub fn unsubscribe(self) {
        self.node.subscriptions.lock().unwrap().remove(&self.token);
    }
}

/// Collect covalue ids referenced by string values of a view.
fn referenced_ids(view: &ContentView) -> Vec<CoId> {
    fn from_value(value: &Value, out: &mut Vec<CoId>) {
        if let Value::String(s) = value {
            if let Ok(id) = s.parse::<CoId>() {
                out.push(id);
            }
        }
    }

    let mut out = Vec::new();
    match view {
        ContentView::Map(map) => {
            for key in map.keys().collect::<Vec<_>>() {
                if let Some(value) = map.get(key) {
                    from_value(value, &mut out);
                }
            }
        }
        ContentView::List(list) => {
            for value in list.values() {
                from_value(value, &mut out);
            }
        }
        ContentView::Stream(stream) | ContentView::BinaryStream(stream) => {
            for session in stream.sessions().cloned().collect::<Vec<_>>() {
                for item in stream.per_session(&session) {
                    from_value(&item.value, &mut out);
                }
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// LocalNode
// ---------------------------------------------------------------------------

/// Result of creating a brand-new account.
pub struct NewAccount {
    pub node: Arc<LocalNode>,
    pub account_id: CoId,
    pub account_secret: AgentSecret,
    pub session_id: SessionId,
}

/// Hook run once against a freshly created or loaded account.
pub type Migration = Box<dyn FnOnce(&LocalNode) -> Result<()> + Send>;

pub struct LocalNode {
    registry: Arc<Registry>,
    sync: SyncManager,
    session: SessionId,
    subscriptions: Mutex<HashMap<u64, Subscription>>,
    next_subscription: AtomicU64,
    load_waiters: Mutex<HashMap<CoId, Vec<tokio::sync::oneshot::Sender<()>>>>,
    session_token: Mutex<Option<SessionToken>>,
}

impl LocalNode {
    /// Create a node with a brand-new account named `name`, its profile, and
    /// an initial session.
    pub fn with_newly_created_account(
        name: &str,
        initial_agent_secret: Option<AgentSecret>,
        migration: Option<Migration>,
    ) -> Result<NewAccount> {
        Self::with_newly_created_account_and_locker(
            name,
            initial_agent_secret,
            migration,
            Arc::new(InMemorySessionLocker),
        )
    }

    pub fn with_newly_created_account_and_locker(
        name: &str,
        initial_agent_secret: Option<AgentSecret>,
        migration: Option<Migration>,
        locker: Arc<dyn SessionLocker>,
    ) -> Result<NewAccount> {
        let account_secret = initial_agent_secret.unwrap_or_else(AgentSecret::generate);
        let agent = account_secret.id();
        let registry = Arc::new(Registry::new(account_secret.clone()));

        let account_header =
            CoValueHeader::new(ContentType::Map, Ruleset::Account, Some(json!({"type": "account"})));
        let account_id = account_header.id();

        let node = Arc::new(LocalNode {
            registry: Arc::clone(&registry),
            sync: SyncManager::new(),
            session: SessionId::random(agent),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            load_waiters: Mutex::new(HashMap::new()),
            session_token: Mutex::new(None),
        });

        // Found the account: the creating agent appoints itself admin and
        // installs the first read key, sealed to itself.
        registry.insert_new(CoValueCore::new(account_header));
        let me_agent = MemberId::Agent(agent);
        let read_key = generate_key_secret();
        let sealed = {
            let material = tx_nonce_material(&account_id, &node.session, 0);
            seal(
                &read_key.to_string(),
                &account_secret.sealer,
                &agent.sealer,
                &material,
            )?
        };
        node.commit_changes(
            account_id,
            vec![
                role_change(&me_agent, Role::Admin),
                read_key_change(read_key.id()),
                sealed_key_change(read_key.id(), &me_agent, &sealed),
            ],
            Privacy::Trusting,
        )?;
        registry.set_account(account_id);
        registry.note_mutation(&account_id);

        let (slot, token) = acquire_session_slot(&locker, &account_id)?;
        log::debug!("account {account_id}: session slot {slot}");
        *node.session_token.lock().unwrap() = Some(token);

        // Profile: a publicly readable map owned by the account.
        let profile_id = node.create_owned(
            ContentType::Map,
            account_id,
            Some(json!({"type": "profile"})),
        )?;
        node.map_set(profile_id, "name", json!(name), Privacy::Trusting)?;
        node.map_set(
            account_id,
            "profile",
            json!(profile_id.to_string()),
            Privacy::Trusting,
        )?;

        if let Some(migration) = migration {
            migration(&node)?;
        }

        let session_id = node.session.clone();
        Ok(NewAccount {
            node,
            account_id,
            account_secret,
            session_id,
        })
    }

    /// Create a node for an existing account, loading the account covalue
    /// from the given peers and verifying it lists our agent.
    pub async fn with_loaded_account(
        account_id: CoId,
        account_secret: AgentSecret,
        session_id: SessionId,
        peers_to_load_from: Vec<PeerHandle>,
        migration: Option<Migration>,
    ) -> Result<Arc<Self>> {
        let agent = account_secret.id();
        let registry = Arc::new(Registry::new(account_secret));
        registry.set_account(account_id);

        let node = Arc::new(LocalNode {
            registry,
            sync: SyncManager::new(),
            session: session_id,
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            load_waiters: Mutex::new(HashMap::new()),
            session_token: Mutex::new(None),
        });

        let locker: Arc<dyn SessionLocker> = Arc::new(InMemorySessionLocker);
        let (_, token) = acquire_session_slot(&locker, &account_id)?;
        *node.session_token.lock().unwrap() = Some(token);

        for handle in peers_to_load_from {
            node.add_peer(handle);
        }

        node.load(account_id).await?;
        node.registry.note_mutation(&account_id);
        let content = node
            .registry
            .group_content_of(&account_id)
            .ok_or(NodeError::Unavailable(account_id))?;
        if content.current_role(&MemberId::Agent(agent)).is_none() {
            return Err(NodeError::ForeignAccount {
                account: account_id,
                agent,
            });
        }

        if let Some(migration) = migration {
            migration(&node)?;
        }
        Ok(node)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn account(&self) -> Option<CoId> {
        self.registry.account()
    }

    /// Close every peer channel, drop subscriptions, and release the
    /// session slot.
    pub fn done(&self) {
        for peer in self.sync.peer_ids() {
            self.sync.remove_peer(&peer);
        }
        self.subscriptions.lock().unwrap().clear();
        self.session_token.lock().unwrap().take();
    }

    // -----------------------------------------------------------------------
    // Peers and sync
    // -----------------------------------------------------------------------

    /// Register a peer channel and spawn its read loop. Must be called
    /// within a tokio runtime.
    pub fn add_peer(self: &Arc<Self>, handle: PeerHandle) {
        let PeerHandle {
            id,
            role,
            outgoing,
            mut incoming,
        } = handle;
        self.attach_peer(&id, role, outgoing);
        let node = Arc::clone(self);
        let peer_id = id;
        tokio::spawn(async move {
            while let Some(msg) = incoming.recv().await {
                if let Err(err) = node.handle_sync_message(&peer_id, msg) {
                    log::warn!("peer {peer_id}: {err}");
                }
            }
            log::info!("peer {peer_id}: channel closed");
            node.sync.remove_peer(&peer_id);
        });
    }

    /// Register a peer channel without a read loop; the caller feeds
    /// inbound records through [`LocalNode::handle_sync_message`].
    pub fn attach_peer(
        &self,
        peer_id: &str,
        role: PeerRole,
        outgoing: tokio::sync::mpsc::UnboundedSender<WireMessage>,
    ) {
        self.sync.add_peer(&self.registry, peer_id, role, outgoing);
    }

    pub fn remove_peer(&self, peer_id: &str) -> bool {
        self.sync.remove_peer(peer_id)
    }

    /// Feed one inbound wire record from `peer_id` into the sync state
    /// machine, then gossip and re-deliver queries for whatever changed.
    pub fn handle_sync_message(&self, peer_id: &str, msg: WireMessage) -> Result<()> {
        let changed = self.sync.handle_message(&self.registry, peer_id, msg)?;
        for id in changed {
            self.notify_loaded(&id);
            self.request_group_dependencies(&id);
            self.sync.broadcast_content(&self.registry, &id);
            self.deliver_for(&id);
        }
        Ok(())
    }

    /// For a group or account covalue, request every member account its
    /// role and key entries reference that we do not hold yet. Until those
    /// accounts arrive, the group fold cannot attribute their agents'
    /// writes; once they do, the epoch bump re-materializes everything.
    pub fn request_group_dependencies(&self, id: &CoId) -> Vec<CoId> {
        use crate::group::{parse_group_key, GroupKey};

        let Some(value) = self.registry.get(id) else {
            return Vec::new();
        };
        let mut missing = Vec::new();
        {
            let value = value.lock().unwrap();
            if !matches!(value.ruleset(), Ruleset::Group | Ruleset::Account) {
                return Vec::new();
            }
            for (_, log) in value.sessions() {
                for tx in log.transactions() {
                    let changes = match tx {
                        Transaction::Trusting { changes, .. } => changes,
                        Transaction::Private { .. } => continue,
                    };
                    for raw in changes {
                        let Some(Change::Set { key, .. }) = crate::content::parse_change(raw)
                        else {
                            continue;
                        };
                        let account = match parse_group_key(&key) {
                            Some(GroupKey::Role(MemberId::Account(account))) => account,
                            Some(GroupKey::KeyFor(_, MemberId::Account(account))) => account,
                            _ => continue,
                        };
                        if account != *id
                            && self.registry.get(&account).is_none()
                            && !missing.contains(&account)
                        {
                            missing.push(account);
                        }
                    }
                }
            }
        }
        for account in &missing {
            self.sync.request_load(account);
        }
        missing
    }

    /// Peers whose channel has gone quiet past the protocol timeout.
    pub fn idle_peers(&self, now_ms: u64) -> Vec<String> {
        self.sync.idle_peers(now_ms)
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Create a permission group administered by this account.
    pub fn create_group(&self) -> Result<CoId> {
        let header = CoValueHeader::new(ContentType::Map, Ruleset::Group, None);
        let group_id = header.id();
        self.registry.insert_new(CoValueCore::new(header));

        let me = self.registry.me();
        let read_key = generate_key_secret();
        let material = tx_nonce_material(&group_id, &self.session, 0);
        let sealed = seal(
            &read_key.to_string(),
            &self.sealer_secret(),
            &self.session.agent.sealer,
            &material,
        )?;
        self.commit_changes(
            group_id,
            vec![
                role_change(&me, Role::Admin),
                read_key_change(read_key.id()),
                sealed_key_change(read_key.id(), &me, &sealed),
            ],
            Privacy::Trusting,
        )?;
        self.sync.announce(&self.registry, &group_id);
        Ok(group_id)
    }

    /// Create a covalue whose writes are gated by `group`.
    pub fn create_owned(
        &self,
        content_type: ContentType,
        group: CoId,
        meta: Option<Value>,
    ) -> Result<CoId> {
        let header = CoValueHeader::new(content_type, Ruleset::OwnedByGroup { group }, meta);
        let id = header.id();
        self.registry.insert_new(CoValueCore::new(header));
        self.sync.announce(&self.registry, &id);
        Ok(id)
    }

    /// Create a covalue anyone may write to.
    pub fn create_unsafe(&self, content_type: ContentType, meta: Option<Value>) -> Result<CoId> {
        let header = CoValueHeader::new(content_type, Ruleset::UnsafeAllowAll, meta);
        let id = header.id();
        self.registry.insert_new(CoValueCore::new(header));
        self.sync.announce(&self.registry, &id);
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    /// The current content of a locally present covalue.
    pub fn content(&self, id: &CoId) -> Result<ContentView> {
        let value = self.registry.get(id).ok_or(NodeError::Unavailable(*id))?;
        let view = value.lock().unwrap().current_content(&*self.registry);
        Ok(view)
    }

    /// Load a covalue, asking peers and waiting up to the default patience.
    pub async fn load(&self, id: CoId) -> Result<Arc<Mutex<CoValueCore>>> {
        self.load_with_patience(id, DEFAULT_LOAD_PATIENCE_MS).await
    }

    pub async fn load_with_patience(
        &self,
        id: CoId,
        patience_ms: u64,
    ) -> Result<Arc<Mutex<CoValueCore>>> {
        if let Some(value) = self.registry.get(&id) {
            return Ok(value);
        }
        let rx = {
            let (tx, rx) = tokio::sync::oneshot::channel();
            self.load_waiters.lock().unwrap().entry(id).or_default().push(tx);
            rx
        };
        self.sync.request_load(&id);
        let arrived =
            tokio::time::timeout(std::time::Duration::from_millis(patience_ms), rx).await;
        match arrived {
            Ok(Ok(())) => self.registry.get(&id).ok_or(NodeError::Unavailable(id)),
            _ => Err(NodeError::Unavailable(id)),
        }
    }

    /// Load and read a map in one step.
    pub async fn load_map(&self, id: CoId) -> Result<crate::content::CoMapView> {
        let value = self.load(id).await?;
        let view = value.lock().unwrap().current_content(&*self.registry);
        view.as_map()
            .cloned()
            .ok_or(NodeError::WrongContentType { id })
    }

    /// Load and read a list in one step.
    pub async fn load_list(&self, id: CoId) -> Result<crate::content::CoListView> {
        let value = self.load(id).await?;
        let view = value.lock().unwrap().current_content(&*self.registry);
        view.as_list()
            .cloned()
            .ok_or(NodeError::WrongContentType { id })
    }

    /// Load and read a stream in one step.
    pub async fn load_stream(&self, id: CoId) -> Result<crate::content::CoStreamView> {
        let value = self.load(id).await?;
        let view = value.lock().unwrap().current_content(&*self.registry);
        view.as_stream()
            .cloned()
            .ok_or(NodeError::WrongContentType { id })
    }

    fn notify_loaded(&self, id: &CoId) {
        let waiters = self.load_waiters.lock().unwrap().remove(id);
        if let Some(waiters) = waiters {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    /// Set a key on a map covalue.
    pub fn map_set(&self, id: CoId, key: &str, value: Value, privacy: Privacy) -> Result<()> {
        self.commit_changes(
            id,
            vec![Change::Set {
                key: key.to_string(),
                value,
            }],
            privacy,
        )
    }

    /// Delete a key from a map covalue.
    pub fn map_delete(&self, id: CoId, key: &str, privacy: Privacy) -> Result<()> {
        self.commit_changes(
            id,
            vec![Change::Delete {
                key: key.to_string(),
            }],
            privacy,
        )
    }

    /// Insert into a list covalue at `index` (clamped to the end).
    pub fn list_insert(&self, id: CoId, index: usize, value: Value, privacy: Privacy) -> Result<()> {
        let arc = self.registry.get(&id).ok_or(NodeError::Unavailable(id))?;
        let mut guard = arc.lock().unwrap();
        let view = guard.current_content(&*self.registry);
        let list = view.as_list().ok_or(NodeError::WrongContentType { id })?;

        let left = index.checked_sub(1).and_then(|i| list.position_at(i));
        let right = list.position_at(index);
        let pos = Position::between(left, right);

        self.commit_to(id, &mut guard, vec![Change::Insert { pos, value }], privacy)?;
        drop(guard);
        self.after_local_write(id);
        Ok(())
    }

    /// Append to a list covalue.
    pub fn list_append(&self, id: CoId, value: Value, privacy: Privacy) -> Result<()> {
        let arc = self.registry.get(&id).ok_or(NodeError::Unavailable(id))?;
        let mut guard = arc.lock().unwrap();
        let view = guard.current_content(&*self.registry);
        let list = view.as_list().ok_or(NodeError::WrongContentType { id })?;
        let len = list.len();
        let left = len.checked_sub(1).and_then(|i| list.position_at(i));
        let pos = Position::between(left, None);

        self.commit_to(id, &mut guard, vec![Change::Insert { pos, value }], privacy)?;
        drop(guard);
        self.after_local_write(id);
        Ok(())
    }

    /// Tombstone the list item at `index`.
    pub fn list_remove(&self, id: CoId, index: usize, privacy: Privacy) -> Result<()> {
        let arc = self.registry.get(&id).ok_or(NodeError::Unavailable(id))?;
        let mut guard = arc.lock().unwrap();
        let view = guard.current_content(&*self.registry);
        let list = view.as_list().ok_or(NodeError::WrongContentType { id })?;
        let pos = list
            .position_at(index)
            .cloned()
            .ok_or(NodeError::IndexOutOfBounds(index))?;

        self.commit_to(id, &mut guard, vec![Change::Remove { pos }], privacy)?;
        drop(guard);
        self.after_local_write(id);
        Ok(())
    }

    /// Push a value onto a stream covalue.
    pub fn stream_push(&self, id: CoId, value: Value, privacy: Privacy) -> Result<()> {
        self.commit_changes(id, vec![Change::Push { value }], privacy)
    }

    /// Upload a blob into a binary-stream covalue: start marker, chunked
    /// payload (one transaction per chunk), end marker.
    pub fn binary_upload(
        &self,
        id: CoId,
        mime_type: &str,
        file_name: Option<&str>,
        bytes: &[u8],
        privacy: Privacy,
    ) -> Result<()> {
        self.stream_push(
            id,
            binary::start_item(mime_type, Some(bytes.len() as u64), file_name),
            privacy,
        )?;
        for chunk in binary::split_chunks(bytes) {
            self.stream_push(id, binary::chunk_item(chunk), privacy)?;
        }
        self.stream_push(id, binary::end_item(), privacy)
    }

    /// Apply a list of changes as one transaction in our session.
    pub fn commit_changes(&self, id: CoId, changes: Vec<Change>, privacy: Privacy) -> Result<()> {
        let arc = self.registry.get(&id).ok_or(NodeError::Unavailable(id))?;
        let mut guard = arc.lock().unwrap();
        self.commit_to(id, &mut guard, changes, privacy)?;
        drop(guard);
        self.after_local_write(id);
        Ok(())
    }

    fn commit_to(
        &self,
        id: CoId,
        value: &mut CoValueCore,
        changes: Vec<Change>,
        privacy: Privacy,
    ) -> Result<()> {
        let session = self.session.clone();
        let signer = self.registry.signer_secret().clone();
        self.commit_as(id, value, &session, signer, changes, privacy)
    }

    fn commit_as(
        &self,
        id: CoId,
        value: &mut CoValueCore,
        session: &SessionId,
        signer: SignerSecret,
        changes: Vec<Change>,
        privacy: Privacy,
    ) -> Result<()> {
        let raw: Vec<Value> = changes
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<_, _>>()
            .map_err(|err| CanonicalError::NotJson(err))?;
        let made_at = value.next_made_at(session);

        let tx = match privacy {
            Privacy::Trusting => Transaction::Trusting {
                made_at,
                changes: raw,
            },
            Privacy::Private => {
                let group = value.owning_group().ok_or(NodeError::NoGroupForPrivacy)?;
                let content = self
                    .registry
                    .group_content_of(&group)
                    .ok_or(NodeError::Unavailable(group))?;
                let key_id = content
                    .current_read_key_id()
                    .ok_or(NodeError::NoReadKey(group))?;
                let key = self
                    .registry
                    .read_key(&group, key_id)
                    .ok_or(NodeError::NoReadKey(group))?;
                let material = tx_nonce_material(&id, session, value.next_tx_index(session));
                Transaction::Private {
                    made_at,
                    key_used: key_id,
                    encrypted_changes: encrypt_for_transaction(&raw, &key, &material)?,
                }
            }
        };

        value.add_local_transaction(&*self.registry, session, &signer, tx)?;
        Ok(())
    }

    fn after_local_write(&self, id: CoId) {
        self.registry.note_mutation(&id);
        self.sync.broadcast_content(&self.registry, &id);
        self.deliver_for(&id);
    }

    fn sealer_secret(&self) -> crate::ids::SealerSecret {
        self.registry.agent_secret_sealer()
    }

    // -----------------------------------------------------------------------
    // Group membership
    // -----------------------------------------------------------------------

    /// Add an account to a group: record the role and seal the current read
    /// key to the account's sealer.
    pub fn add_group_member(&self, group: CoId, account: CoId, role: Role) -> Result<()> {
        let member = MemberId::Account(account);
        let target_sealer = self
            .account_sealer(&account)
            .ok_or(NodeError::Unavailable(account))?;
        let (key_id, key) = self.current_group_key(&group)?;

        let arc = self.registry.get(&group).ok_or(NodeError::Unavailable(group))?;
        let mut guard = arc.lock().unwrap();
        let material = tx_nonce_material(&group, &self.session, guard.next_tx_index(&self.session));
        let sealed = seal(&key.to_string(), &self.sealer_secret(), &target_sealer, &material)?;
        self.commit_to(
            group,
            &mut guard,
            vec![
                role_change(&member, role),
                sealed_key_change(key_id, &member, &sealed),
            ],
            Privacy::Trusting,
        )?;
        drop(guard);
        self.after_local_write(group);
        Ok(())
    }

    /// Revoke a member, rotate the read key, wrap the old key under the new
    /// one, and re-seal the new key to everyone still in.
    pub fn remove_group_member(&self, group: CoId, member: MemberId) -> Result<()> {
        let content = self
            .registry
            .group_content_of(&group)
            .ok_or(NodeError::Unavailable(group))?;
        let old = content.current_read_key_id();
        let old_secret = old.and_then(|old_id| self.registry.read_key(&group, old_id));
        let new_key = generate_key_secret();

        // Resolve every remaining member's sealer before taking the group
        // lock; resolution itself walks the registry.
        let mut remaining = Vec::new();
        for reader in content.readers() {
            if reader == member {
                continue;
            }
            match self.sealer_for_member(&reader) {
                Some(sealer) => remaining.push((reader, sealer)),
                None => log::warn!("{group}: no sealer for {reader}, key not re-sealed"),
            }
        }

        let mut changes = vec![role_change(&member, Role::Revoked)];

        let arc = self.registry.get(&group).ok_or(NodeError::Unavailable(group))?;
        let mut guard = arc.lock().unwrap();
        let material = tx_nonce_material(&group, &self.session, guard.next_tx_index(&self.session));

        for (reader, sealer) in remaining {
            let sealed = seal(&new_key.to_string(), &self.sealer_secret(), &sealer, &material)?;
            changes.push(sealed_key_change(new_key.id(), &reader, &sealed));
        }

        if let (Some(old_id), Some(old_secret)) = (old, old_secret) {
            let wrapped = encrypt_key_secret(&old_secret, &new_key)?;
            changes.push(wrapped_key_change(old_id, new_key.id(), &wrapped));
        }
        changes.push(read_key_change(new_key.id()));

        self.commit_to(group, &mut guard, changes, Privacy::Trusting)?;
        drop(guard);
        self.after_local_write(group);
        Ok(())
    }

    /// Mint a one-shot invite: a throwaway agent whose secret is handed out
    /// out-of-band and whose group entry carries the invite role plus the
    /// sealed read key.
    pub fn create_invite(&self, group: CoId, role: Role) -> Result<AgentSecret> {
        let invite_role = Role::invite_for(role).ok_or(NodeError::InvalidInvite(group))?;
        let invite = AgentSecret::generate();
        let invite_member = MemberId::Agent(invite.id());
        let (key_id, key) = self.current_group_key(&group)?;

        let arc = self.registry.get(&group).ok_or(NodeError::Unavailable(group))?;
        let mut guard = arc.lock().unwrap();
        let material = tx_nonce_material(&group, &self.session, guard.next_tx_index(&self.session));
        let sealed = seal(
            &key.to_string(),
            &self.sealer_secret(),
            &invite.id().sealer,
            &material,
        )?;
        self.commit_to(
            group,
            &mut guard,
            vec![
                role_change(&invite_member, invite_role),
                sealed_key_change(key_id, &invite_member, &sealed),
            ],
            Privacy::Trusting,
        )?;
        drop(guard);
        self.after_local_write(group);
        Ok(invite)
    }

    /// Join a covalue's group by presenting an invite secret: the invite
    /// agent signs our account in at the invited role and re-seals the read
    /// key to us.
    pub async fn accept_invite(&self, value_id: CoId, invite_secret: &AgentSecret) -> Result<()> {
        let value = self.load(value_id).await?;
        let group_id = {
            let value = value.lock().unwrap();
            match value.ruleset() {
                Ruleset::Group | Ruleset::Account => value.id(),
                Ruleset::OwnedByGroup { group } => *group,
                Ruleset::UnsafeAllowAll => return Err(NodeError::InvalidInvite(value_id)),
            }
        };
        if group_id != value_id {
            self.load(group_id).await?;
        }

        // The fold cannot validate the group until the accounts its role
        // entries name are present; pull them in before reading roles.
        for _ in 0..(DEFAULT_LOAD_PATIENCE_MS / 50) {
            if self.request_group_dependencies(&group_id).is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let invite_agent = invite_secret.id();
        let invite_member = MemberId::Agent(invite_agent);
        let content = self
            .registry
            .group_content_of(&group_id)
            .ok_or(NodeError::Unavailable(group_id))?;
        let granted = content
            .current_role(&invite_member)
            .and_then(Role::invite_grants)
            .ok_or(NodeError::InvalidInvite(group_id))?;

        let key_id = content
            .current_read_key_id()
            .ok_or(NodeError::NoReadKey(group_id))?;
        let key = content
            .unwrap_read_key(&group_id, key_id, &invite_member, &invite_secret.sealer)
            .ok_or(NodeError::NoReadKey(group_id))?;

        let me = self.registry.me();
        let invite_session = SessionId::random(invite_agent);

        let arc = self
            .registry
            .get(&group_id)
            .ok_or(NodeError::Unavailable(group_id))?;
        let mut guard = arc.lock().unwrap();
        let material =
            tx_nonce_material(&group_id, &invite_session, guard.next_tx_index(&invite_session));
        let sealed = seal(
            &key.to_string(),
            &invite_secret.sealer,
            &self.session.agent.sealer,
            &material,
        )?;
        self.commit_as(
            group_id,
            &mut guard,
            &invite_session,
            invite_secret.signer.clone(),
            vec![
                role_change(&me, granted),
                sealed_key_change(key_id, &me, &sealed),
            ],
            Privacy::Trusting,
        )?;
        drop(guard);
        self.after_local_write(group_id);
        Ok(())
    }

    fn current_group_key(&self, group: &CoId) -> Result<(KeyId, KeySecret)> {
        let content = self
            .registry
            .group_content_of(group)
            .ok_or(NodeError::Unavailable(*group))?;
        let key_id = content
            .current_read_key_id()
            .ok_or(NodeError::NoReadKey(*group))?;
        let key = self
            .registry
            .read_key(group, key_id)
            .ok_or(NodeError::NoReadKey(*group))?;
        Ok((key_id, key))
    }

    /// The sealer of an account: its first admin agent.
    fn account_sealer(&self, account: &CoId) -> Option<crate::ids::SealerId> {
        let content = self.registry.group_content_of(account)?;
        content
            .roles_at(u64::MAX)
            .into_iter()
            .find_map(|(member, role)| match member {
                MemberId::Agent(agent) if role.can_read() => Some(agent.sealer),
                _ => None,
            })
    }

    fn sealer_for_member(&self, member: &MemberId) -> Option<crate::ids::SealerId> {
        match member {
            MemberId::Account(account) => self.account_sealer(account),
            MemberId::Agent(agent) => Some(agent.sealer),
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Subscribe to a covalue: the callback fires with a fresh view now and
    /// after every change, `None` while the root or a nested covalue is
    /// still loading.
    pub fn query(
        self: &Arc<Self>,
        id: CoId,
        callback: impl Fn(Option<QueryView>) + Send + Sync + 'static,
    ) -> QueryUnsubscribe {
        self.query_with_depth(id, DEFAULT_QUERY_DEPTH, callback)
    }

    pub fn query_with_depth(
        self: &Arc<Self>,
        id: CoId,
        depth: usize,
        callback: impl Fn(Option<QueryView>) + Send + Sync + 'static,
    ) -> QueryUnsubscribe {
        let token = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let callback: QueryCallback = Arc::new(callback);
        let mut watching = HashSet::new();
        watching.insert(id);
        self.subscriptions.lock().unwrap().insert(
            token,
            Subscription {
                root: id,
                depth,
                callback,
                watching,
            },
        );
        self.deliver_one(token);
        QueryUnsubscribe {
            node: Arc::clone(self),
            token,
        }
    }

    /// Re-deliver every subscription watching `changed`.
    fn deliver_for(&self, changed: &CoId) {
        let tokens: Vec<u64> = {
            let subscriptions = self.subscriptions.lock().unwrap();
            subscriptions
                .iter()
                .filter(|(_, sub)| sub.watching.contains(changed))
                .map(|(token, _)| *token)
                .collect()
        };
        for token in tokens {
            self.deliver_one(token);
        }
    }

    fn deliver_one(&self, token: u64) {
        let (root, depth, callback) = {
            let subscriptions = self.subscriptions.lock().unwrap();
            let Some(sub) = subscriptions.get(&token) else {
                return;
            };
            (sub.root, sub.depth, Arc::clone(&sub.callback))
        };

        let (view, watching) = self.build_query_view(root, depth);

        if let Some(sub) = self.subscriptions.lock().unwrap().get_mut(&token) {
            sub.watching = watching;
        }
        callback(view);
    }

    /// Materialize the root and every nested covalue within `depth`.
    /// Returns `None` (plus the watch set) while anything is missing.
    fn build_query_view(&self, root: CoId, depth: usize) -> (Option<QueryView>, HashSet<CoId>) {
        let mut watching = HashSet::new();
        watching.insert(root);

        let Some(value) = self.registry.get(&root) else {
            self.sync.request_load(&root);
            return (None, watching);
        };
        let root_view = value.lock().unwrap().current_content(&*self.registry);

        let mut nested = BTreeMap::new();
        let mut missing = false;
        let mut frontier = referenced_ids(&root_view);
        for _ in 0..depth {
            let mut next = Vec::new();
            for id in frontier.drain(..) {
                if id == root || nested.contains_key(&id) {
                    continue;
                }
                watching.insert(id);
                match self.registry.get(&id) {
                    Some(value) => {
                        let view = value.lock().unwrap().current_content(&*self.registry);
                        next.extend(referenced_ids(&view));
                        nested.insert(id, view);
                    }
                    None => {
                        self.sync.request_load(&id);
                        missing = true;
                    }
                }
            }
            frontier = next;
        }

        if missing {
            return (None, watching);
        }
        (
            Some(QueryView {
                id: root,
                root: root_view,
                nested,
            }),
            watching,
        )
    }
}

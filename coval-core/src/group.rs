//! Group state: roles, read keys, and invites.
//!
//! A group is a map-shaped covalue whose entries are interpreted as
//! permission state:
//!
//! - `<memberID>` → role (`reader` | `writer` | `admin` | `revoked`, or an
//!   `…Invite` role for throwaway invite agents),
//! - `readKey` → the read-key id currently in force,
//! - `<keyID>_for_<memberID>` → that key's secret sealed to the member,
//! - `<oldKeyID>_wrapped_in_<newKeyID>` → the previous-key chain.
//!
//! The fold walks the group's changes in merge order, validating each against
//! the roles in force at that point: invalid writes are skipped and logged,
//! never applied. The same fold drives account covalues, whose members are
//! raw agents instead of accounts.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::content::{Change, OrderedChange};
use crate::crypto::encryption::decrypt_key_secret;
use crate::crypto::sealing::unseal;
use crate::ids::{
    CoId, Encrypted, KeyId, KeySecret, MemberId, ParseError, Sealed, SealerId, SealerSecret,
    SessionId,
};
use crate::transaction::tx_nonce_material;

pub const READ_KEY_ENTRY: &str = "readKey";
const KEY_FOR_SEPARATOR: &str = "_for_";
const WRAPPED_SEPARATOR: &str = "_wrapped_in_";

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Reader,
    Writer,
    Admin,
    Revoked,
    ReaderInvite,
    WriterInvite,
    AdminInvite,
}

impl Role {
    pub fn can_read(self) -> bool {
        matches!(
            self,
            Role::Reader
                | Role::Writer
                | Role::Admin
                | Role::ReaderInvite
                | Role::WriterInvite
                | Role::AdminInvite
        )
    }

    /// May sign content transactions in covalues owned by this group.
    pub fn can_write(self) -> bool {
        matches!(self, Role::Writer | Role::Admin)
    }

    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin)
    }

    pub fn is_invite(self) -> bool {
        matches!(
            self,
            Role::ReaderInvite | Role::WriterInvite | Role::AdminInvite
        )
    }

    /// The role an invite hands out on acceptance.
    pub fn invite_grants(self) -> Option<Role> {
        match self {
            Role::ReaderInvite => Some(Role::Reader),
            Role::WriterInvite => Some(Role::Writer),
            Role::AdminInvite => Some(Role::Admin),
            _ => None,
        }
    }

    /// The invite role handing out `granted`.
    pub fn invite_for(granted: Role) -> Option<Role> {
        match granted {
            Role::Reader => Some(Role::ReaderInvite),
            Role::Writer => Some(Role::WriterInvite),
            Role::Admin => Some(Role::AdminInvite),
            _ => None,
        }
    }

    /// Authority rank for "may hand out at most my own level" checks.
    fn rank(self) -> u8 {
        match self {
            Role::Revoked => 0,
            Role::Reader | Role::ReaderInvite => 1,
            Role::Writer | Role::WriterInvite => 2,
            Role::Admin | Role::AdminInvite => 3,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Reader => "reader",
            Role::Writer => "writer",
            Role::Admin => "admin",
            Role::Revoked => "revoked",
            Role::ReaderInvite => "readerInvite",
            Role::WriterInvite => "writerInvite",
            Role::AdminInvite => "adminInvite",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Role {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reader" => Ok(Role::Reader),
            "writer" => Ok(Role::Writer),
            "admin" => Ok(Role::Admin),
            "revoked" => Ok(Role::Revoked),
            "readerInvite" => Ok(Role::ReaderInvite),
            "writerInvite" => Ok(Role::WriterInvite),
            "adminInvite" => Ok(Role::AdminInvite),
            _ => Err(ParseError::Malformed),
        }
    }
}

// ---------------------------------------------------------------------------
// Group map keys
// ---------------------------------------------------------------------------

/// Interpreted form of a group map key.
#[derive(Clone, Debug, PartialEq)]
pub enum GroupKey {
    Role(MemberId),
    ReadKey,
    KeyFor(KeyId, MemberId),
    Wrapped(KeyId, KeyId),
}

pub fn parse_group_key(key: &str) -> Option<GroupKey> {
    if key == READ_KEY_ENTRY {
        return Some(GroupKey::ReadKey);
    }
    if let Some((old, new)) = key.split_once(WRAPPED_SEPARATOR) {
        return Some(GroupKey::Wrapped(old.parse().ok()?, new.parse().ok()?));
    }
    if let Some((key_id, member)) = key.split_once(KEY_FOR_SEPARATOR) {
        return Some(GroupKey::KeyFor(key_id.parse().ok()?, member.parse().ok()?));
    }
    key.parse().ok().map(GroupKey::Role)
}

/// Change setting a member's role.
pub fn role_change(member: &MemberId, role: Role) -> Change {
    Change::Set {
        key: member.to_string(),
        value: Value::String(role.to_string()),
    }
}

/// Change announcing the read key in force.
pub fn read_key_change(key_id: KeyId) -> Change {
    Change::Set {
        key: READ_KEY_ENTRY.to_string(),
        value: Value::String(key_id.to_string()),
    }
}

/// Change publishing a read key sealed to a member.
pub fn sealed_key_change(key_id: KeyId, member: &MemberId, sealed: &Sealed) -> Change {
    Change::Set {
        key: format!("{key_id}{KEY_FOR_SEPARATOR}{member}"),
        value: Value::String(sealed.to_string()),
    }
}

/// Change wrapping an old read key under its successor.
pub fn wrapped_key_change(old: KeyId, new: KeyId, wrapped: &Encrypted) -> Change {
    Change::Set {
        key: format!("{old}{WRAPPED_SEPARATOR}{new}"),
        value: Value::String(wrapped.to_string()),
    }
}

// ---------------------------------------------------------------------------
// GroupContent
// ---------------------------------------------------------------------------

/// A read key sealed to one member, with enough provenance to unseal it.
#[derive(Clone, Debug, PartialEq)]
pub struct SealedKeyEntry {
    pub sealed: Sealed,
    pub sealed_by: SealerId,
    pub session: SessionId,
    pub tx_index: usize,
}

/// The folded permission state of a group (or account) covalue.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GroupContent {
    /// Per member: role history in merge order.
    roles: BTreeMap<MemberId, Vec<(u64, Role)>>,
    /// Read-key announcements in merge order.
    read_keys: Vec<(u64, KeyId)>,
    sealed_keys: BTreeMap<(KeyId, MemberId), SealedKeyEntry>,
    /// old key → (new key, old wrapped under new).
    wrapped_keys: BTreeMap<KeyId, Vec<(KeyId, Encrypted)>>,
    /// Changes that passed validation, for the map view.
    valid: Vec<OrderedChange>,
}

impl GroupContent {
    /// The role a member holds at `time` (`u64::MAX` for "now").
    pub fn role_at(&self, member: &MemberId, time: u64) -> Option<Role> {
        let history = self.roles.get(member)?;
        history
            .iter()
            .take_while(|(at, _)| *at <= time)
            .last()
            .map(|(_, role)| *role)
    }

    pub fn current_role(&self, member: &MemberId) -> Option<Role> {
        self.role_at(member, u64::MAX)
    }

    /// Every member's role at `time`.
    pub fn roles_at(&self, time: u64) -> BTreeMap<MemberId, Role> {
        self.roles
            .keys()
            .filter_map(|member| {
                self.role_at(member, time).map(|role| (*member, role))
            })
            .collect()
    }

    /// Whether any member currently holds the admin role.
    pub fn has_admin(&self) -> bool {
        self.roles
            .keys()
            .any(|member| self.current_role(member) == Some(Role::Admin))
    }

    /// The read-key id in force at `time`.
    pub fn read_key_id_at(&self, time: u64) -> Option<KeyId> {
        self.read_keys
            .iter()
            .take_while(|(at, _)| *at <= time)
            .last()
            .map(|(_, key)| *key)
    }

    pub fn current_read_key_id(&self) -> Option<KeyId> {
        self.read_key_id_at(u64::MAX)
    }

    /// Members whose current role reads content (revoked excluded).
    pub fn readers(&self) -> Vec<MemberId> {
        self.roles
            .keys()
            .filter(|member| {
                self.current_role(member).map(Role::can_read).unwrap_or(false)
            })
            .copied()
            .collect()
    }

    /// Whether `member` is known to this group in any capacity.
    pub fn knows(&self, member: &MemberId) -> bool {
        self.roles.contains_key(member)
    }

    pub fn sealed_key_for(&self, key: KeyId, member: &MemberId) -> Option<&SealedKeyEntry> {
        self.sealed_keys.get(&(key, *member))
    }

    /// Resolve a read-key secret as `member`, either from a directly sealed
    /// entry or by walking the wrapped-key chain upward to a key we can
    /// unseal.
    pub fn unwrap_read_key(
        &self,
        group_id: &CoId,
        target: KeyId,
        member: &MemberId,
        sealer_secret: &SealerSecret,
    ) -> Option<KeySecret> {
        let mut visited = BTreeSet::new();
        self.unwrap_inner(group_id, target, member, sealer_secret, &mut visited)
    }

    fn unwrap_inner(
        &self,
        group_id: &CoId,
        target: KeyId,
        member: &MemberId,
        sealer_secret: &SealerSecret,
        visited: &mut BTreeSet<KeyId>,
    ) -> Option<KeySecret> {
        if !visited.insert(target) {
            return None;
        }

        if let Some(entry) = self.sealed_key_for(target, member) {
            let material = tx_nonce_material(group_id, &entry.session, entry.tx_index);
            if let Ok(key_string) =
                unseal::<String>(&entry.sealed, &entry.sealed_by, sealer_secret, &material)
            {
                if let Ok(secret) = key_string.parse::<KeySecret>() {
                    if secret.id() == target {
                        return Some(secret);
                    }
                }
            }
        }

        let successors = self.wrapped_keys.get(&target)?;
        for (newer, wrapped) in successors {
            if let Some(newer_secret) =
                self.unwrap_inner(group_id, *newer, member, sealer_secret, visited)
            {
                if let Some(secret) = decrypt_key_secret(wrapped, target, &newer_secret) {
                    return Some(secret);
                }
            }
        }
        None
    }

    /// The changes that passed validation, for the map materialization.
    pub fn valid_changes(&self) -> &[OrderedChange] {
        &self.valid
    }
}

// ---------------------------------------------------------------------------
// Fold
// ---------------------------------------------------------------------------

/// Fold a group's changes (merge order) into permission state, skipping
/// writes their author was not entitled to make at that point.
pub fn fold_group(changes: &[OrderedChange]) -> GroupContent {
    let mut content = GroupContent::default();

    for ordered in changes {
        let author_role = content.current_role(&ordered.author);
        let (key, value) = match &ordered.change {
            Change::Set { key, value } => (key, value),
            Change::Delete { key } => {
                // App-level keys (profile, root, …) may be deleted by
                // admins; permission state has no deletes.
                if parse_group_key(key).is_none() && author_role == Some(Role::Admin) {
                    content.valid.push(ordered.clone());
                } else {
                    log::debug!("group: delete of {key:?} skipped");
                }
                continue;
            }
            _ => {
                log::debug!("group: non-map change skipped");
                continue;
            }
        };
        let Some(group_key) = parse_group_key(key) else {
            // Not permission state: groups may carry app-level entries,
            // written by admins.
            if author_role == Some(Role::Admin) {
                content.valid.push(ordered.clone());
            } else {
                log::debug!("group: app entry by non-admin skipped");
            }
            continue;
        };

        match group_key {
            GroupKey::Role(target) => {
                let Some(new_role) = value.as_str().and_then(|s| s.parse::<Role>().ok()) else {
                    continue;
                };
                if !role_write_allowed(&content, &ordered.author, author_role, &target, new_role) {
                    log::debug!(
                        "group: unauthorized role write by {} skipped",
                        ordered.author
                    );
                    continue;
                }
                content
                    .roles
                    .entry(target)
                    .or_default()
                    .push((ordered.made_at, new_role));
            }
            GroupKey::ReadKey => {
                let Some(key_id) = value.as_str().and_then(|s| s.parse::<KeyId>().ok()) else {
                    continue;
                };
                if author_role != Some(Role::Admin) {
                    log::debug!("group: readKey write requires admin, skipped");
                    continue;
                }
                content.read_keys.push((ordered.made_at, key_id));
            }
            GroupKey::KeyFor(key_id, member) => {
                let Some(sealed) = value.as_str().and_then(|s| s.parse::<Sealed>().ok()) else {
                    continue;
                };
                let allowed = author_role == Some(Role::Admin)
                    || author_role.map(Role::is_invite).unwrap_or(false)
                    || ordered.author == member;
                if !allowed {
                    log::debug!("group: unauthorized key entry skipped");
                    continue;
                }
                content.sealed_keys.insert(
                    (key_id, member),
                    SealedKeyEntry {
                        sealed,
                        sealed_by: ordered.session.agent.sealer,
                        session: ordered.session.clone(),
                        tx_index: ordered.tx_index,
                    },
                );
            }
            GroupKey::Wrapped(old, new) => {
                let Some(wrapped) = value.as_str().and_then(|s| s.parse::<Encrypted>().ok())
                else {
                    continue;
                };
                if author_role != Some(Role::Admin) {
                    log::debug!("group: wrapped-key write requires admin, skipped");
                    continue;
                }
                content.wrapped_keys.entry(old).or_default().push((new, wrapped));
            }
        }
        content.valid.push(ordered.clone());
    }

    content
}

fn role_write_allowed(
    content: &GroupContent,
    author: &MemberId,
    author_role: Option<Role>,
    target: &MemberId,
    new_role: Role,
) -> bool {
    // Admins manage every role.
    if author_role == Some(Role::Admin) {
        return true;
    }
    // The founding write: self-appointment as admin while the group has none.
    if !content.has_admin() && author == target && new_role == Role::Admin {
        return true;
    }
    // Invite agents add members at up to the invited role, but cannot touch
    // anyone who already outranks the grant.
    if let Some(invite_role) = author_role.filter(|role| role.is_invite()) {
        let target_rank = content
            .current_role(target)
            .map(Role::rank)
            .unwrap_or(0);
        return new_role.rank() <= invite_role.rank()
            && !new_role.is_invite()
            && target_rank <= invite_role.rank();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::encryption::{encrypt_key_secret, generate_key_secret};
    use crate::crypto::sealing::{generate_sealer_keypair, seal};
    use crate::crypto::signing::generate_signing_keypair;
    use crate::ids::AgentId;

    struct Member {
        session: SessionId,
        member: MemberId,
        sealer_secret: SealerSecret,
    }

    fn account_member(tag: u8) -> Member {
        let (signer, _) = generate_signing_keypair();
        let (sealer, sealer_secret) = generate_sealer_keypair();
        Member {
            session: SessionId::random(AgentId { sealer, signer }),
            member: MemberId::Account(CoId([tag; 32])),
            sealer_secret,
        }
    }

    fn agent_member() -> Member {
        let (signer, _) = generate_signing_keypair();
        let (sealer, sealer_secret) = generate_sealer_keypair();
        let agent = AgentId { sealer, signer };
        Member {
            session: SessionId::random(agent),
            member: MemberId::Agent(agent),
            sealer_secret,
        }
    }

    fn change(by: &Member, made_at: u64, tx_index: usize, change: Change) -> OrderedChange {
        OrderedChange {
            session: by.session.clone(),
            author: by.member,
            made_at,
            tx_index,
            change_index: 0,
            change,
        }
    }

    fn group_id() -> CoId {
        CoId([0xEE; 32])
    }

    #[test]
    fn test_founding_self_appointment() {
        let alice = account_member(1);
        let content = fold_group(&[change(
            &alice,
            1,
            0,
            role_change(&alice.member, Role::Admin),
        )]);
        assert_eq!(content.current_role(&alice.member), Some(Role::Admin));
    }

    #[test]
    fn test_second_self_appointment_rejected() {
        let alice = account_member(1);
        let mallory = account_member(2);
        let content = fold_group(&[
            change(&alice, 1, 0, role_change(&alice.member, Role::Admin)),
            change(&mallory, 2, 0, role_change(&mallory.member, Role::Admin)),
        ]);
        assert_eq!(content.current_role(&mallory.member), None);
    }

    #[test]
    fn test_admin_adds_and_revokes() {
        let alice = account_member(1);
        let bob = account_member(2);
        let content = fold_group(&[
            change(&alice, 1, 0, role_change(&alice.member, Role::Admin)),
            change(&alice, 2, 1, role_change(&bob.member, Role::Writer)),
            change(&alice, 3, 2, role_change(&bob.member, Role::Revoked)),
        ]);
        assert_eq!(content.current_role(&bob.member), Some(Role::Revoked));
        // Role history is time-indexed.
        assert_eq!(content.role_at(&bob.member, 2), Some(Role::Writer));
        assert_eq!(content.role_at(&bob.member, 1), None);
    }

    #[test]
    fn test_non_admin_cannot_grant_roles() {
        let alice = account_member(1);
        let bob = account_member(2);
        let carol = account_member(3);
        let content = fold_group(&[
            change(&alice, 1, 0, role_change(&alice.member, Role::Admin)),
            change(&alice, 2, 1, role_change(&bob.member, Role::Writer)),
            change(&bob, 3, 0, role_change(&carol.member, Role::Writer)),
        ]);
        assert_eq!(content.current_role(&carol.member), None);
    }

    #[test]
    fn test_invite_agent_adds_account_at_granted_role() {
        let alice = account_member(1);
        let invite = agent_member();
        let newcomer = account_member(2);

        let content = fold_group(&[
            change(&alice, 1, 0, role_change(&alice.member, Role::Admin)),
            change(&alice, 2, 1, role_change(&invite.member, Role::WriterInvite)),
            change(&invite, 3, 0, role_change(&newcomer.member, Role::Writer)),
        ]);
        assert_eq!(content.current_role(&newcomer.member), Some(Role::Writer));
    }

    #[test]
    fn test_invite_agent_cannot_escalate() {
        let alice = account_member(1);
        let invite = agent_member();
        let newcomer = account_member(2);

        let content = fold_group(&[
            change(&alice, 1, 0, role_change(&alice.member, Role::Admin)),
            change(&alice, 2, 1, role_change(&invite.member, Role::ReaderInvite)),
            change(&invite, 3, 0, role_change(&newcomer.member, Role::Writer)),
        ]);
        assert_eq!(content.current_role(&newcomer.member), None);
    }

    #[test]
    fn test_invite_agent_cannot_demote_admin() {
        let alice = account_member(1);
        let invite = agent_member();

        let content = fold_group(&[
            change(&alice, 1, 0, role_change(&alice.member, Role::Admin)),
            change(&alice, 2, 1, role_change(&invite.member, Role::WriterInvite)),
            change(&invite, 3, 0, role_change(&alice.member, Role::Reader)),
        ]);
        assert_eq!(content.current_role(&alice.member), Some(Role::Admin));
    }

    #[test]
    fn test_read_key_requires_admin() {
        let alice = account_member(1);
        let bob = account_member(2);
        let key = generate_key_secret();

        let content = fold_group(&[
            change(&alice, 1, 0, role_change(&alice.member, Role::Admin)),
            change(&alice, 2, 1, role_change(&bob.member, Role::Writer)),
            change(&bob, 3, 0, read_key_change(key.id())),
        ]);
        assert_eq!(content.current_read_key_id(), None);

        let content = fold_group(&[
            change(&alice, 1, 0, role_change(&alice.member, Role::Admin)),
            change(&alice, 2, 1, read_key_change(key.id())),
        ]);
        assert_eq!(content.current_read_key_id(), Some(key.id()));
    }

    #[test]
    fn test_read_key_history_at_time() {
        let alice = account_member(1);
        let key1 = generate_key_secret();
        let key2 = generate_key_secret();

        let content = fold_group(&[
            change(&alice, 1, 0, role_change(&alice.member, Role::Admin)),
            change(&alice, 2, 1, read_key_change(key1.id())),
            change(&alice, 10, 2, read_key_change(key2.id())),
        ]);
        assert_eq!(content.read_key_id_at(5), Some(key1.id()));
        assert_eq!(content.read_key_id_at(10), Some(key2.id()));
    }

    #[test]
    fn test_sealed_key_unwrap_direct() {
        let alice = account_member(1);
        let gid = group_id();
        let key = generate_key_secret();

        // Alice seals the key to herself in tx 1 of her session.
        let material = tx_nonce_material(&gid, &alice.session, 1);
        let sealed = seal(
            &key.to_string(),
            &alice.sealer_secret,
            &alice.session.agent.sealer,
            &material,
        )
        .unwrap();

        let content = fold_group(&[
            change(&alice, 1, 0, role_change(&alice.member, Role::Admin)),
            change(&alice, 2, 1, sealed_key_change(key.id(), &alice.member, &sealed)),
            change(&alice, 3, 1, read_key_change(key.id())),
        ]);

        let resolved = content
            .unwrap_read_key(&gid, key.id(), &alice.member, &alice.sealer_secret)
            .unwrap();
        assert_eq!(resolved, key);
    }

    #[test]
    fn test_sealed_key_unwrap_through_chain() {
        let alice = account_member(1);
        let gid = group_id();
        let old_key = generate_key_secret();
        let new_key = generate_key_secret();

        let material = tx_nonce_material(&gid, &alice.session, 4);
        let sealed_new = seal(
            &new_key.to_string(),
            &alice.sealer_secret,
            &alice.session.agent.sealer,
            &material,
        )
        .unwrap();
        let wrapped_old = encrypt_key_secret(&old_key, &new_key).unwrap();

        let content = fold_group(&[
            change(&alice, 1, 0, role_change(&alice.member, Role::Admin)),
            change(&alice, 2, 4, sealed_key_change(new_key.id(), &alice.member, &sealed_new)),
            change(&alice, 3, 5, wrapped_key_change(old_key.id(), new_key.id(), &wrapped_old)),
            change(&alice, 4, 6, read_key_change(new_key.id())),
        ]);

        // The old key is only reachable through the chain.
        let resolved = content
            .unwrap_read_key(&gid, old_key.id(), &alice.member, &alice.sealer_secret)
            .unwrap();
        assert_eq!(resolved, old_key);
    }

    #[test]
    fn test_unwrap_fails_for_outsider() {
        let alice = account_member(1);
        let outsider = account_member(9);
        let gid = group_id();
        let key = generate_key_secret();

        let material = tx_nonce_material(&gid, &alice.session, 1);
        let sealed = seal(
            &key.to_string(),
            &alice.sealer_secret,
            &alice.session.agent.sealer,
            &material,
        )
        .unwrap();

        let content = fold_group(&[
            change(&alice, 1, 0, role_change(&alice.member, Role::Admin)),
            change(&alice, 2, 1, sealed_key_change(key.id(), &alice.member, &sealed)),
        ]);

        assert!(content
            .unwrap_read_key(&gid, key.id(), &outsider.member, &outsider.sealer_secret)
            .is_none());
    }

    #[test]
    fn test_group_key_parsing() {
        let member = MemberId::Account(CoId([3; 32]));
        let key = generate_key_secret();
        let other = generate_key_secret();

        assert_eq!(parse_group_key(READ_KEY_ENTRY), Some(GroupKey::ReadKey));
        assert_eq!(
            parse_group_key(&member.to_string()),
            Some(GroupKey::Role(member))
        );
        assert_eq!(
            parse_group_key(&format!("{}_for_{}", key.id(), member)),
            Some(GroupKey::KeyFor(key.id(), member))
        );
        assert_eq!(
            parse_group_key(&format!("{}_wrapped_in_{}", key.id(), other.id())),
            Some(GroupKey::Wrapped(key.id(), other.id()))
        );
        assert_eq!(parse_group_key("not a group key"), None);
    }

    #[test]
    fn test_roles_at_snapshot() {
        let alice = account_member(1);
        let bob = account_member(2);
        let content = fold_group(&[
            change(&alice, 1, 0, role_change(&alice.member, Role::Admin)),
            change(&alice, 5, 1, role_change(&bob.member, Role::Reader)),
        ]);

        let early = content.roles_at(2);
        assert_eq!(early.get(&alice.member), Some(&Role::Admin));
        assert_eq!(early.get(&bob.member), None);

        let later = content.roles_at(5);
        assert_eq!(later.get(&bob.member), Some(&Role::Reader));
    }
}

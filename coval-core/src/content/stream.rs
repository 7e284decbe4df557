//! Stream content: an append-only multiset partitioned by session.
//!
//! Each session's pushes stay in their append order; there is no cross-
//! session ordering beyond the deterministic merge. Views fold sessions per
//! account for "everything this account said" queries.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::content::{Change, OrderedChange};
use crate::ids::{MemberId, SessionId};

#[derive(Clone, Debug, PartialEq)]
pub struct StreamItem {
    pub value: Value,
    pub by: MemberId,
    pub made_at: u64,
    pub tx_index: usize,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct CoStreamView {
    items: BTreeMap<SessionId, Vec<StreamItem>>,
}

impl CoStreamView {
    /// Items of one session, in append order.
    pub fn per_session(&self, session: &SessionId) -> &[StreamItem] {
        self.items
            .get(session)
            .map(|items| items.as_slice())
            .unwrap_or(&[])
    }

    /// All sessions with at least one item.
    pub fn sessions(&self) -> impl Iterator<Item = &SessionId> {
        self.items.keys()
    }

    /// Every item of every session belonging to `account`, interleaved by
    /// `(madeAt, sessionID)` like the merge order.
    pub fn per_account(&self, account: &MemberId) -> Vec<&StreamItem> {
        let mut out: Vec<(&SessionId, &StreamItem)> = self
            .items
            .iter()
            .flat_map(|(session, items)| items.iter().map(move |item| (session, item)))
            .filter(|(_, item)| &item.by == account)
            .collect();
        out.sort_by(|(sa, a), (sb, b)| {
            a.made_at
                .cmp(&b.made_at)
                .then_with(|| sa.to_string().cmp(&sb.to_string()))
        });
        out.into_iter().map(|(_, item)| item).collect()
    }

    /// The current session's items — the `me` shortcut.
    pub fn me(&self, session: &SessionId) -> &[StreamItem] {
        self.per_session(session)
    }

    /// Most recent item per session.
    pub fn last_per_session(&self) -> BTreeMap<&SessionId, &StreamItem> {
        self.items
            .iter()
            .filter_map(|(session, items)| items.last().map(|item| (session, item)))
            .collect()
    }

    /// Most recent item of `account` across its sessions.
    pub fn last_by_account(&self, account: &MemberId) -> Option<&StreamItem> {
        self.per_account(account).into_iter().last()
    }

    pub fn item_count(&self) -> usize {
        self.items.values().map(|items| items.len()).sum()
    }
}

pub(crate) fn fold(changes: &[OrderedChange]) -> CoStreamView {
    let mut view = CoStreamView::default();
    for ordered in changes {
        let value = match &ordered.change {
            Change::Push { value } => value.clone(),
            _ => continue,
        };
        view.items
            .entry(ordered.session.clone())
            .or_default()
            .push(StreamItem {
                value,
                by: ordered.author,
                made_at: ordered.made_at,
                tx_index: ordered.tx_index,
            });
    }
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sealing::generate_sealer_keypair;
    use crate::crypto::signing::generate_signing_keypair;
    use crate::ids::{AgentId, CoId};
    use serde_json::json;

    fn session() -> SessionId {
        let (signer, _) = generate_signing_keypair();
        let (sealer, _) = generate_sealer_keypair();
        SessionId::random(AgentId { sealer, signer })
    }

    fn push(s: &SessionId, by: MemberId, made_at: u64, value: Value) -> OrderedChange {
        OrderedChange {
            session: s.clone(),
            author: by,
            made_at,
            tx_index: 0,
            change_index: 0,
            change: Change::Push { value },
        }
    }

    #[test]
    fn test_per_session_keeps_append_order() {
        let s = session();
        let me = MemberId::Agent(s.agent);
        let view = fold(&[
            push(&s, me, 1, json!("hello")),
            push(&s, me, 2, json!("world")),
        ]);

        let items: Vec<_> = view.per_session(&s).iter().map(|i| &i.value).collect();
        assert_eq!(items, vec![&json!("hello"), &json!("world")]);
        assert_eq!(view.me(&s).last().unwrap().value, json!("world"));
    }

    #[test]
    fn test_per_account_folds_sessions() {
        let s1 = session();
        let s2 = session();
        let account = MemberId::Account(CoId([1u8; 32]));

        let view = fold(&[
            push(&s1, account, 1, json!("a")),
            push(&s2, account, 2, json!("b")),
            push(&s1, account, 3, json!("c")),
        ]);

        let values: Vec<_> = view
            .per_account(&account)
            .into_iter()
            .map(|item| item.value.clone())
            .collect();
        assert_eq!(values, vec![json!("a"), json!("b"), json!("c")]);
        assert_eq!(view.last_by_account(&account).unwrap().value, json!("c"));
    }

    #[test]
    fn test_last_per_session() {
        let s1 = session();
        let s2 = session();
        let m1 = MemberId::Agent(s1.agent);
        let m2 = MemberId::Agent(s2.agent);

        let view = fold(&[
            push(&s1, m1, 1, json!(1)),
            push(&s1, m1, 2, json!(2)),
            push(&s2, m2, 1, json!(10)),
        ]);

        let last = view.last_per_session();
        assert_eq!(last[&s1].value, json!(2));
        assert_eq!(last[&s2].value, json!(10));
        assert_eq!(view.item_count(), 3);
    }
}

//! Map content: last-writer-wins per key under the deterministic merge
//! order, with per-key edit history retained for UI attribution.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::content::{Change, OrderedChange};
use crate::ids::{MemberId, SessionId};

/// One recorded edit of a map key.
#[derive(Clone, Debug, PartialEq)]
pub struct MapEdit {
    pub by: MemberId,
    pub session: SessionId,
    pub at: u64,
    pub tx_index: usize,
    /// `None` records a delete.
    pub value: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct MapEntry {
    /// Current value; `None` once the latest edit is a delete.
    pub value: Option<Value>,
    /// Every edit that touched this key, in merge order.
    pub edits: Vec<MapEdit>,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct CoMapView {
    entries: BTreeMap<String, MapEntry>,
}

impl CoMapView {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).and_then(|entry| entry.value.as_ref())
    }

    /// Keys with a live (non-deleted) value, in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.value.is_some())
            .map(|(key, _)| key.as_str())
    }

    pub fn len(&self) -> usize {
        self.keys().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The most recent edit of `key`, delete included.
    pub fn last_edit(&self, key: &str) -> Option<&MapEdit> {
        self.entries.get(key).and_then(|entry| entry.edits.last())
    }

    pub fn edits(&self, key: &str) -> &[MapEdit] {
        self.entries
            .get(key)
            .map(|entry| entry.edits.as_slice())
            .unwrap_or(&[])
    }

    pub fn entry(&self, key: &str) -> Option<&MapEntry> {
        self.entries.get(key)
    }
}

pub(crate) fn fold(changes: &[OrderedChange]) -> CoMapView {
    let mut view = CoMapView::default();
    for ordered in changes {
        let (key, value) = match &ordered.change {
            Change::Set { key, value } => (key, Some(value.clone())),
            Change::Delete { key } => (key, None),
            _ => continue,
        };
        let entry = view.entries.entry(key.clone()).or_default();
        entry.value = value.clone();
        entry.edits.push(MapEdit {
            by: ordered.author,
            session: ordered.session.clone(),
            at: ordered.made_at,
            tx_index: ordered.tx_index,
            value,
        });
    }
    view
}

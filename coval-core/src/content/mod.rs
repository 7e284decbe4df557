//! CRDT content types and the schema-agnostic change record.
//!
//! A covalue's merged transaction stream is folded into one of four views:
//! map, list, stream, or binary stream (a stream whose items follow the
//! start/chunk/end convention). Changes are stored in transactions as plain
//! JSON values; unknown shapes are skipped during the fold so newer writers
//! do not break older readers.

pub mod binary;
pub mod list;
pub mod map;
pub mod stream;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{MemberId, SessionId};

pub use binary::{BinaryStreamInfo, MAX_BINARY_CHUNK_SIZE};
pub use list::{CoListView, ListItem, Position};
pub use map::{CoMapView, MapEdit, MapEntry};
pub use stream::{CoStreamView, StreamItem};

/// The four materializable shapes, fixed in the covalue header.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentType {
    #[serde(rename = "comap")]
    Map,
    #[serde(rename = "colist")]
    List,
    #[serde(rename = "costream")]
    Stream,
    #[serde(rename = "binary-costream")]
    BinaryStream,
}

/// One CRDT operation inside a transaction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "op")]
pub enum Change {
    /// Map: assign `key` to `value` (last writer wins).
    #[serde(rename = "set")]
    Set { key: String, value: Value },
    /// Map: delete `key`. An explicit change, not absence.
    #[serde(rename = "del")]
    Delete { key: String },
    /// List: insert `value` at an opaque ordered position.
    #[serde(rename = "ins")]
    Insert { pos: Position, value: Value },
    /// List: tombstone the item(s) at a position.
    #[serde(rename = "rm")]
    Remove { pos: Position },
    /// Stream: append `value` to the writing session's sequence.
    #[serde(rename = "push")]
    Push { value: Value },
}

/// A change annotated with its origin, in deterministic merge order.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderedChange {
    pub session: SessionId,
    /// The account (or raw agent) the writing session speaks for.
    pub author: MemberId,
    pub made_at: u64,
    pub tx_index: usize,
    pub change_index: usize,
    pub change: Change,
}

/// The materialized current content of a covalue.
#[derive(Clone, Debug, PartialEq)]
pub enum ContentView {
    Map(CoMapView),
    List(CoListView),
    Stream(CoStreamView),
    BinaryStream(CoStreamView),
}

impl ContentView {
    pub fn as_map(&self) -> Option<&CoMapView> {
        match self {
            ContentView::Map(view) => Some(view),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&CoListView> {
        match self {
            ContentView::List(view) => Some(view),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&CoStreamView> {
        match self {
            ContentView::Stream(view) | ContentView::BinaryStream(view) => Some(view),
            _ => None,
        }
    }

    /// Binary accessor over a binary stream's start/chunk/end items.
    pub fn binary_chunks(&self, allow_unfinished: bool) -> Option<BinaryStreamInfo> {
        match self {
            ContentView::BinaryStream(view) => binary::binary_chunks(view, allow_unfinished),
            _ => None,
        }
    }
}

/// Fold ordered changes into the view named by the header.
pub fn materialize(content_type: ContentType, changes: &[OrderedChange]) -> ContentView {
    match content_type {
        ContentType::Map => ContentView::Map(map::fold(changes)),
        ContentType::List => ContentView::List(list::fold(changes)),
        ContentType::Stream => ContentView::Stream(stream::fold(changes)),
        ContentType::BinaryStream => ContentView::BinaryStream(stream::fold(changes)),
    }
}

/// Parse a raw change value, skipping shapes this version does not know.
pub fn parse_change(raw: &Value) -> Option<Change> {
    serde_json::from_value(raw.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_type_wire_names() {
        assert_eq!(serde_json::to_value(ContentType::Map).unwrap(), "comap");
        assert_eq!(
            serde_json::to_value(ContentType::BinaryStream).unwrap(),
            "binary-costream"
        );
        let back: ContentType = serde_json::from_value(json!("colist")).unwrap();
        assert_eq!(back, ContentType::List);
    }

    #[test]
    fn test_change_wire_shape() {
        let change = Change::Set {
            key: "foo".into(),
            value: json!("bar"),
        };
        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(value, json!({"op": "set", "key": "foo", "value": "bar"}));
    }

    #[test]
    fn test_unknown_change_is_skipped() {
        assert!(parse_change(&json!({"op": "teleport", "to": "mars"})).is_none());
        assert!(parse_change(&json!({"op": "push", "value": 1})).is_some());
    }
}

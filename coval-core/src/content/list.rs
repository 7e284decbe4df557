//! List content: items keyed by opaque dense ordered positions, deletion as
//! position-keyed tombstones.
//!
//! A position is a path of `u64` digits compared lexicographically. Inserting
//! between two neighbors mints a fresh path strictly between them, so the
//! space is dense and no insertion ever rebalances existing items. Two
//! concurrent writers inserting into the same slot may mint the same path;
//! their items are then ordered by `(madeAt, sessionID)` like any other
//! merge tie.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::content::{Change, OrderedChange};
use crate::ids::{MemberId, ParseError, SessionId};

/// Spacing of freshly minted top-level digits; leaves room for ~2^32
/// boundary insertions before paths deepen.
const STEP: u64 = 1 << 32;

/// An opaque, totally ordered list position.
///
/// String form: digits joined by `.` (`"4294967296.17"`).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(pub Vec<u64>);

impl Position {
    /// Mint a position strictly between two neighbors. `None` bounds mean
    /// the start/end of the list. Neighbors that do not actually bracket a
    /// gap (equal positions from a concurrent same-slot insert) degrade to
    /// insert-after-left.
    pub fn between(left: Option<&Position>, right: Option<&Position>) -> Position {
        let l: &[u64] = left.map(|p| p.0.as_slice()).unwrap_or(&[]);
        match right {
            Some(r) if l < r.0.as_slice() => Position(midpoint(l, &r.0)),
            _ => Position(after(l)),
        }
    }
}

fn after(l: &[u64]) -> Vec<u64> {
    match l.first() {
        None => vec![STEP],
        Some(&first) if first <= u64::MAX - STEP => vec![first + STEP],
        Some(_) => {
            let mut digits = l.to_vec();
            digits.push(STEP);
            digits
        }
    }
}

/// A path strictly between `l` and `r`, where `l` may be empty (start of
/// list) and `l < r` lexicographically.
fn midpoint(l: &[u64], r: &[u64]) -> Vec<u64> {
    debug_assert!(l < r, "midpoint bounds out of order");
    let mut out = Vec::new();
    let mut i = 0;
    loop {
        match (l.get(i).copied(), r.get(i).copied()) {
            (Some(a), Some(b)) if a == b => {
                out.push(a);
                i += 1;
            }
            (Some(a), Some(b)) if b - a >= 2 => {
                out.push(a + (b - a) / 2);
                return out;
            }
            (Some(a), Some(_)) => {
                // b == a + 1: keep a, then go strictly after l's remaining tail.
                out.push(a);
                out.extend(after(&l[i + 1..]));
                return out;
            }
            (None, Some(b)) if b >= 2 => {
                out.push(b / 2);
                return out;
            }
            (None, Some(b)) if b == 1 => {
                out.push(0);
                out.push(STEP);
                return out;
            }
            (None, Some(_)) => {
                // b == 0: mirror the shared digit and look deeper into r.
                out.push(0);
                i += 1;
            }
            _ => unreachable!("bounds out of order"),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, digit) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{digit}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Position({self})")
    }
}

impl FromStr for Position {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::Malformed);
        }
        let digits = s
            .split('.')
            .map(|digit| digit.parse::<u64>().map_err(|_| ParseError::Malformed))
            .collect::<Result<Vec<u64>, _>>()?;
        Ok(Position(digits))
    }
}

impl Serialize for Position {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// View
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct ListItem {
    pub pos: Position,
    pub value: Value,
    pub inserted_by: MemberId,
    pub session: SessionId,
    pub made_at: u64,
    pub deleted: bool,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct CoListView {
    /// All items (tombstones included) in list order.
    items: Vec<ListItem>,
}

impl CoListView {
    /// Live values in list order.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.items
            .iter()
            .filter(|item| !item.deleted)
            .map(|item| &item.value)
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.values().cloned().collect()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values().nth(index)
    }

    pub fn len(&self) -> usize {
        self.values().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live items with their positions, for callers minting neighbors.
    pub fn items(&self) -> impl Iterator<Item = &ListItem> {
        self.items.iter().filter(|item| !item.deleted)
    }

    /// The position of the live item at `index`.
    pub fn position_at(&self, index: usize) -> Option<&Position> {
        self.items().nth(index).map(|item| &item.pos)
    }
}

pub(crate) fn fold(changes: &[OrderedChange]) -> CoListView {
    let mut view = CoListView::default();
    for ordered in changes {
        match &ordered.change {
            Change::Insert { pos, value } => {
                let item = ListItem {
                    pos: pos.clone(),
                    value: value.clone(),
                    inserted_by: ordered.author,
                    session: ordered.session.clone(),
                    made_at: ordered.made_at,
                    deleted: false,
                };
                // Changes arrive in merge order, so among equal positions the
                // earlier (madeAt, sessionID) is already in place: insert
                // after the run of items with pos <= new pos.
                let at = view
                    .items
                    .partition_point(|existing| existing.pos <= item.pos);
                view.items.insert(at, item);
            }
            Change::Remove { pos } => {
                for item in view.items.iter_mut().filter(|item| &item.pos == pos) {
                    item.deleted = true;
                }
            }
            _ => continue,
        }
    }
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sealing::generate_sealer_keypair;
    use crate::crypto::signing::generate_signing_keypair;
    use crate::ids::AgentId;
    use serde_json::json;

    fn session() -> SessionId {
        let (signer, _) = generate_signing_keypair();
        let (sealer, _) = generate_sealer_keypair();
        SessionId::random(AgentId { sealer, signer })
    }

    fn ins(s: &SessionId, made_at: u64, pos: Position, value: Value) -> OrderedChange {
        OrderedChange {
            session: s.clone(),
            author: MemberId::Agent(s.agent),
            made_at,
            tx_index: 0,
            change_index: 0,
            change: Change::Insert { pos, value },
        }
    }

    fn rm(s: &SessionId, made_at: u64, pos: Position) -> OrderedChange {
        OrderedChange {
            session: s.clone(),
            author: MemberId::Agent(s.agent),
            made_at,
            tx_index: 0,
            change_index: 0,
            change: Change::Remove { pos },
        }
    }

    #[test]
    fn test_between_is_strictly_ordered() {
        let first = Position::between(None, None);
        let before = Position::between(None, Some(&first));
        let past = Position::between(Some(&first), None);
        let mid = Position::between(Some(&before), Some(&first));

        assert!(before < first);
        assert!(first < past);
        assert!(before < mid && mid < first);
    }

    #[test]
    fn test_between_stays_dense_under_repeated_splitting() {
        let mut low = Position::between(None, None);
        let high = Position::between(Some(&low), None);
        for _ in 0..200 {
            let mid = Position::between(Some(&low), Some(&high));
            assert!(low < mid && mid < high, "{low:?} !< {mid:?} !< {high:?}");
            low = mid;
        }
    }

    #[test]
    fn test_between_narrow_gap_descends() {
        let l = Position(vec![5]);
        let r = Position(vec![6]);
        let mid = Position::between(Some(&l), Some(&r));
        assert!(l < mid && mid < r);

        let tight_l = Position(vec![5, 9]);
        let mid2 = Position::between(Some(&tight_l), Some(&r));
        assert!(tight_l < mid2 && mid2 < r);
    }

    #[test]
    fn test_position_string_roundtrip() {
        let pos = Position(vec![4294967296, 17, 3]);
        let s = pos.to_string();
        assert_eq!(s, "4294967296.17.3");
        assert_eq!(s.parse::<Position>().unwrap(), pos);
        assert!("".parse::<Position>().is_err());
        assert!("1..2".parse::<Position>().is_err());
    }

    #[test]
    fn test_insert_and_read_in_order() {
        let s = session();
        let p1 = Position::between(None, None);
        let p2 = Position::between(Some(&p1), None);
        let p0 = Position::between(None, Some(&p1));

        let view = fold(&[
            ins(&s, 1, p1.clone(), json!("b")),
            ins(&s, 2, p2, json!("c")),
            ins(&s, 3, p0, json!("a")),
        ]);
        assert_eq!(view.to_vec(), vec![json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn test_delete_is_tombstone() {
        let s = session();
        let p1 = Position::between(None, None);
        let p2 = Position::between(Some(&p1), None);

        let view = fold(&[
            ins(&s, 1, p1.clone(), json!("x")),
            ins(&s, 2, p2, json!("y")),
            rm(&s, 3, p1),
        ]);
        assert_eq!(view.to_vec(), vec![json!("y")]);
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn test_concurrent_equal_positions_keep_merge_order() {
        // Two sessions minting the same slot: the fold receives them in
        // (madeAt, sessionID) order and must keep that order in the list.
        let s1 = session();
        let s2 = session();
        let p = Position::between(None, None);

        let view = fold(&[
            ins(&s1, 1, p.clone(), json!("first")),
            ins(&s2, 2, p, json!("second")),
        ]);
        assert_eq!(view.to_vec(), vec![json!("first"), json!("second")]);
    }
}

//! Change-set and node-revision identifiers
//!
//! Every stored item is addressed logically by the change-set that wrote it
//! (a committed revision or a live transaction) plus an item number local
//! to that change-set. Physical offsets never leak above the index layer.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Revision number; revision 0 is the empty root
pub type Revnum = u64;

/// Item number of a revision's root node-revision
pub const ITEM_ROOT_NODE: u64 = 1;
/// Item number of a revision's changed-paths list
pub const ITEM_CHANGES: u64 = 2;
/// First item number handed out for ordinary items
pub const FIRST_USER_ITEM: u64 = 3;

/// Transaction identifier, unique for the lifetime of a filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TxnId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(TxnId)
            .map_err(|_| IdParseError(s.to_string()))
    }
}

/// Whether an edit point is a committed revision or a live transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeSet {
    Revision(Revnum),
    Transaction(TxnId),
}

impl ChangeSet {
    pub fn revision(&self) -> Option<Revnum> {
        match self {
            ChangeSet::Revision(rev) => Some(*rev),
            ChangeSet::Transaction(_) => None,
        }
    }

    pub fn txn(&self) -> Option<TxnId> {
        match self {
            ChangeSet::Transaction(txn) => Some(*txn),
            ChangeSet::Revision(_) => None,
        }
    }

    pub fn is_txn(&self) -> bool {
        matches!(self, ChangeSet::Transaction(_))
    }

    /// Replace `txn` with the revision it was committed as
    pub fn committed(self, txn: TxnId, rev: Revnum) -> Self {
        match self {
            ChangeSet::Transaction(t) if t == txn => ChangeSet::Revision(rev),
            other => other,
        }
    }
}

/// Revisions are totally ordered; a transaction is only comparable to itself.
impl PartialOrd for ChangeSet {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (ChangeSet::Revision(a), ChangeSet::Revision(b)) => Some(a.cmp(b)),
            (ChangeSet::Transaction(a), ChangeSet::Transaction(b)) if a == b => {
                Some(Ordering::Equal)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeSet::Revision(rev) => write!(f, "r{}", rev),
            ChangeSet::Transaction(txn) => write!(f, "t{}", txn),
        }
    }
}

impl FromStr for ChangeSet {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || IdParseError(s.to_string());
        if let Some(rev) = s.strip_prefix('r') {
            rev.parse().map(ChangeSet::Revision).map_err(|_| err())
        } else if let Some(txn) = s.strip_prefix('t') {
            txn.parse().map(ChangeSet::Transaction).map_err(|_| err())
        } else {
            Err(err())
        }
    }
}

/// A change-set plus a counter local to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdPart {
    pub change_set: ChangeSet,
    pub number: u64,
}

impl IdPart {
    pub fn new(change_set: ChangeSet, number: u64) -> Self {
        Self { change_set, number }
    }

    pub fn in_revision(rev: Revnum, number: u64) -> Self {
        Self::new(ChangeSet::Revision(rev), number)
    }

    pub fn in_txn(txn: TxnId, number: u64) -> Self {
        Self::new(ChangeSet::Transaction(txn), number)
    }

    pub fn is_txn(&self, txn: TxnId) -> bool {
        self.change_set == ChangeSet::Transaction(txn)
    }

    pub fn committed(self, txn: TxnId, rev: Revnum) -> Self {
        Self {
            change_set: self.change_set.committed(txn, rev),
            number: self.number,
        }
    }
}

impl fmt::Display for IdPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.number, self.change_set)
    }
}

impl FromStr for IdPart {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (number, change_set) = s.split_once('-').ok_or_else(|| IdParseError(s.to_string()))?;
        Ok(Self {
            number: number.parse().map_err(|_| IdParseError(s.to_string()))?,
            change_set: change_set.parse()?,
        })
    }
}

/// Identity of one node-revision: the node lineage plus the item holding it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRevId {
    pub node_id: IdPart,
    pub rev_item: IdPart,
}

impl NodeRevId {
    pub fn new(node_id: IdPart, rev_item: IdPart) -> Self {
        Self { node_id, rev_item }
    }

    /// Id of the root node-revision of `rev`
    pub fn root_of(rev: Revnum) -> Self {
        Self {
            node_id: IdPart::in_revision(0, 0),
            rev_item: IdPart::in_revision(rev, ITEM_ROOT_NODE),
        }
    }

    /// Same node lineage
    pub fn is_related(&self, other: &NodeRevId) -> bool {
        self.node_id == other.node_id
    }

    pub fn change_set(&self) -> ChangeSet {
        self.rev_item.change_set
    }

    pub fn revision(&self) -> Option<Revnum> {
        self.rev_item.change_set.revision()
    }

    /// Whether this node-revision is owned (mutable) by `txn`
    pub fn is_txn(&self, txn: TxnId) -> bool {
        self.rev_item.is_txn(txn)
    }

    pub fn committed(self, txn: TxnId, rev: Revnum) -> Self {
        Self {
            node_id: self.node_id.committed(txn, rev),
            rev_item: self.rev_item.committed(txn, rev),
        }
    }
}

impl fmt::Display for NodeRevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_id, self.rev_item)
    }
}

impl FromStr for NodeRevId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (node, item) = s.split_once('.').ok_or_else(|| IdParseError(s.to_string()))?;
        Ok(Self {
            node_id: node.parse()?,
            rev_item: item.parse()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed id: {0}")]
pub struct IdParseError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_set_ordering() {
        let r1 = ChangeSet::Revision(1);
        let r2 = ChangeSet::Revision(2);
        let t = ChangeSet::Transaction(TxnId(1));

        assert!(r1 < r2);
        assert_eq!(r1.partial_cmp(&r1), Some(Ordering::Equal));
        assert_eq!(t.partial_cmp(&t), Some(Ordering::Equal));
        assert_eq!(t.partial_cmp(&r1), None);
        assert_eq!(r1.partial_cmp(&ChangeSet::Transaction(TxnId(1))), None);
        assert_eq!(t.partial_cmp(&ChangeSet::Transaction(TxnId(2))), None);
    }

    #[test]
    fn test_node_rev_id_text_form() {
        let id = NodeRevId::new(IdPart::in_txn(TxnId(7), 4), IdPart::in_revision(12, 9));
        let text = id.to_string();
        assert_eq!(text, "4-t7.9-r12");
        assert_eq!(text.parse::<NodeRevId>().unwrap(), id);
        assert!("garbage".parse::<NodeRevId>().is_err());
        assert!("1-x3.2-r1".parse::<NodeRevId>().is_err());
    }

    #[test]
    fn test_committed_rewrites_only_owning_txn() {
        let txn = TxnId(3);
        let id = NodeRevId::new(IdPart::in_revision(1, 5), IdPart::in_txn(txn, 8));
        let done = id.committed(txn, 4);
        assert_eq!(done.node_id, IdPart::in_revision(1, 5));
        assert_eq!(done.rev_item, IdPart::in_revision(4, 8));

        let other = NodeRevId::new(IdPart::in_txn(TxnId(9), 1), IdPart::in_txn(TxnId(9), 1));
        assert_eq!(other.committed(txn, 4), other);
    }

    #[test]
    fn test_relatedness() {
        let a = NodeRevId::new(IdPart::in_revision(1, 3), IdPart::in_revision(1, 3));
        let b = NodeRevId::new(IdPart::in_revision(1, 3), IdPart::in_revision(5, 7));
        let c = NodeRevId::new(IdPart::in_revision(2, 3), IdPart::in_revision(5, 7));
        assert!(a.is_related(&b));
        assert!(!a.is_related(&c));
        assert!(NodeRevId::root_of(0).is_related(&NodeRevId::root_of(10)));
    }
}

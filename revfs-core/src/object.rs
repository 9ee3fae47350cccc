//! Core object model for revfs
//!
//! Node-revisions, representations, directory entries and changed-path
//! records. All cross references are ids, never pointers, so every object
//! can be persisted, cached and evicted independently.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::id::{IdPart, NodeRevId, Revnum, TxnId};

/// SHA-256 over the logical (expanded) bytes of a representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum([u8; 32]);

impl Checksum {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the checksum of data
    pub fn from_data(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(hash.into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Dir,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::File => write!(f, "file"),
            NodeKind::Dir => write!(f, "dir"),
        }
    }
}

/// How a representation's bytes are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepEncoding {
    Fulltext,
    /// Delta against the representation stored at `base`
    Delta { base: IdPart, chain_length: u32 },
}

impl RepEncoding {
    /// Number of delta links to walk before reaching a fulltext
    pub fn chain_length(&self) -> u32 {
        match self {
            RepEncoding::Fulltext => 0,
            RepEncoding::Delta { chain_length, .. } => *chain_length,
        }
    }
}

/// Descriptor of stored bytes backing file contents, a directory or a
/// property list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Representation {
    /// Logical address of the representation item
    pub addr: IdPart,
    /// Bytes occupied on disk (header and compressed body)
    pub size: u64,
    /// Length of the reconstructed content
    pub expanded_size: u64,
    pub checksum: Checksum,
    pub encoding: RepEncoding,
}

impl Representation {
    pub fn is_txn(&self, txn: TxnId) -> bool {
        self.addr.is_txn(txn)
    }

    pub fn committed(self, txn: TxnId, rev: Revnum) -> Self {
        let encoding = match self.encoding {
            RepEncoding::Delta { base, chain_length } => RepEncoding::Delta {
                base: base.committed(txn, rev),
                chain_length,
            },
            RepEncoding::Fulltext => RepEncoding::Fulltext,
        };
        Self {
            addr: self.addr.committed(txn, rev),
            encoding,
            ..self
        }
    }

    /// Same logical content
    pub fn same_content(a: Option<&Representation>, b: Option<&Representation>) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => a.checksum == b.checksum,
            _ => false,
        }
    }
}

/// Where a copied node came from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CopySource {
    pub path: String,
    pub revision: Revnum,
}

/// One historical version of one file or directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRevision {
    pub id: NodeRevId,
    pub kind: NodeKind,
    pub predecessor_id: Option<NodeRevId>,
    /// Length of the predecessor chain behind this node-revision
    pub predecessor_count: u64,
    pub copy_from: Option<CopySource>,
    pub data_rep: Option<Representation>,
    pub prop_rep: Option<Representation>,
    /// Path at which this node-revision was first observed
    pub created_path: String,
}

impl NodeRevision {
    /// Brand new node without history
    pub fn new(id: NodeRevId, kind: NodeKind, created_path: String) -> Self {
        Self {
            id,
            kind,
            predecessor_id: None,
            predecessor_count: 0,
            copy_from: None,
            data_rep: None,
            prop_rep: None,
            created_path,
        }
    }

    /// Successor of `self` stored at `id`, keeping representations
    pub fn successor(&self, id: NodeRevId, created_path: String) -> Self {
        Self {
            id,
            kind: self.kind,
            predecessor_id: Some(self.id),
            predecessor_count: self.predecessor_count + 1,
            copy_from: None,
            data_rep: self.data_rep,
            prop_rep: self.prop_rep,
            created_path,
        }
    }

    /// Revision this node-revision was committed in; `None` while mutable
    pub fn created_rev(&self) -> Option<Revnum> {
        self.id.revision()
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
    pub id: NodeRevId,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, kind: NodeKind, id: NodeRevId) -> Self {
        Self {
            name: name.into(),
            kind,
            id,
        }
    }
}

/// Directory contents keyed by entry name
///
/// The map is ordered so that identical entry sets serialize to identical
/// bytes and share one representation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    entries: BTreeMap<String, DirEntry>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: DirEntry) -> Option<DirEntry> {
        self.entries.insert(entry.name.clone(), entry)
    }

    pub fn remove(&mut self, name: &str) -> Option<DirEntry> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&DirEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Add,
    Delete,
    Replace,
    Modify,
}

impl ChangeKind {
    /// Single-letter code used in listings
    pub fn code(&self) -> char {
        match self {
            ChangeKind::Add => 'A',
            ChangeKind::Delete => 'D',
            ChangeKind::Replace => 'R',
            ChangeKind::Modify => 'M',
        }
    }
}

/// One entry of a transaction's or revision's changed-paths list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathChange {
    pub path: String,
    pub kind: ChangeKind,
    pub node_kind: NodeKind,
    /// Node-revision at `path` after the change; `None` for deletes
    pub node_rev_id: Option<NodeRevId>,
    pub text_mod: bool,
    pub prop_mod: bool,
    pub copy_from: Option<CopySource>,
}

impl PathChange {
    pub fn committed(mut self, txn: TxnId, rev: Revnum) -> Self {
        self.node_rev_id = self.node_rev_id.map(|id| id.committed(txn, rev));
        self
    }
}

//! Transaction storage
//!
//! Each live transaction owns a directory `txns/<id>.txn/`:
//!
//! ```text
//! txn.bin               TxnRecord
//! next-item             next free item number
//! node.<item>           mutable node-revision
//! node.<item>.children  entries of a mutable directory
//! node.<item>.props     property list of a mutable node
//! rep.<item>            representation payload written by this txn
//! sha.<hex>             representation already holding that content
//! changes               append-only change log
//! rev.proto             revision container being prepared for commit
//! ```
//!
//! Nothing under `txns/` is visible to revision readers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{FsError, IoResultExt, Result};
use crate::id::{FIRST_USER_ITEM, NodeRevId, Revnum, TxnId};
use crate::object::{
    ChangeKind, Checksum, CopySource, Directory, NodeRevision, PathChange, Representation,
};
use crate::path;
use crate::properties::PropertySet;
use crate::util::{self, FileLock};

pub const TXNS_DIR: &str = "txns";
pub const TXN_CURRENT_FILE: &str = "txn-current";
pub const TXN_CURRENT_LOCK_FILE: &str = "txn-current-lock";

const RECORD_FILE: &str = "txn.bin";
const NEXT_ITEM_FILE: &str = "next-item";
const CHANGES_FILE: &str = "changes";
const PROTO_FILE: &str = "rev.proto";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    Active,
    Committed(Revnum),
    Dead,
}

/// Checks a commit runs in addition to conflict detection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnFlags {
    /// Reject edits to nodes that changed between the base and HEAD
    pub check_out_of_date: bool,
    /// Verify path locks against the committer's access context
    pub check_locks: bool,
}

/// A copy made inside the transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyRecord {
    pub path: String,
    pub source: CopySource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxnRecord {
    pub id: TxnId,
    pub base_rev: Revnum,
    pub state: TxnState,
    pub root_id: NodeRevId,
    pub base_root_id: NodeRevId,
    pub props: PropertySet,
    pub flags: TxnFlags,
    pub copies: Vec<CopyRecord>,
}

impl TxnRecord {
    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(FsError::TransactionNotMutable(self.id))
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| FsError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(path: &Path, data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| FsError::corrupt(path.display(), e))
}

/// File-level access to transaction directories
pub struct TxnStore {
    root: PathBuf,
}

impl TxnStore {
    pub fn new(fs_root: &Path) -> Self {
        Self {
            root: fs_root.to_path_buf(),
        }
    }

    pub fn create_layout(fs_root: &Path) -> Result<()> {
        let dir = fs_root.join(TXNS_DIR);
        fs::create_dir_all(&dir).with_path(&dir)?;
        util::write_number(&fs_root.join(TXN_CURRENT_FILE), 0)
    }

    pub fn txn_dir(&self, id: TxnId) -> PathBuf {
        self.root.join(TXNS_DIR).join(format!("{}.txn", id))
    }

    fn file(&self, id: TxnId, name: &str) -> PathBuf {
        self.txn_dir(id).join(name)
    }

    pub fn proto_path(&self, id: TxnId) -> PathBuf {
        self.file(id, PROTO_FILE)
    }

    /// Hand out the next transaction id; ids are never reused
    pub fn allocate_id(&self) -> Result<TxnId> {
        let _lock = FileLock::acquire(&self.root.join(TXN_CURRENT_LOCK_FILE))?;
        let counter = self.root.join(TXN_CURRENT_FILE);
        let next = util::read_number(&counter)? + 1;
        util::write_number(&counter, next)?;
        Ok(TxnId(next))
    }

    /// Create the directory of a new transaction
    pub fn create(&self, record: &TxnRecord) -> Result<()> {
        let dir = self.txn_dir(record.id);
        fs::create_dir_all(&dir).with_path(&dir)?;
        util::write_number(&dir.join(NEXT_ITEM_FILE), FIRST_USER_ITEM)?;
        self.write_record(record)
    }

    pub fn exists(&self, id: TxnId) -> bool {
        self.file(id, RECORD_FILE).exists()
    }

    pub fn read_record(&self, id: TxnId) -> Result<TxnRecord> {
        let path = self.file(id, RECORD_FILE);
        let data = util::read_optional(&path)?.ok_or(FsError::NoSuchTransaction(id))?;
        decode(&path, &data)
    }

    pub fn write_record(&self, record: &TxnRecord) -> Result<()> {
        util::write_atomic(&self.file(record.id, RECORD_FILE), &encode(record)?)
    }

    /// Reserve a fresh item number inside `id`
    pub fn allocate_item(&self, id: TxnId) -> Result<u64> {
        let path = self.file(id, NEXT_ITEM_FILE);
        if !path.exists() {
            return Err(FsError::NoSuchTransaction(id));
        }
        let item = util::read_number(&path)?;
        util::write_number(&path, item + 1)?;
        Ok(item)
    }

    pub fn write_node(&self, id: TxnId, node: &NodeRevision) -> Result<()> {
        let item = node.id.rev_item.number;
        util::write_atomic(&self.file(id, &format!("node.{}", item)), &encode(node)?)
    }

    pub fn read_node(&self, id: TxnId, item: u64) -> Result<Option<NodeRevision>> {
        let path = self.file(id, &format!("node.{}", item));
        util::read_optional(&path)?
            .map(|data| decode(&path, &data))
            .transpose()
    }

    pub fn write_children(&self, id: TxnId, item: u64, dir: &Directory) -> Result<()> {
        let path = self.file(id, &format!("node.{}.children", item));
        util::write_atomic(&path, &encode(dir)?)
    }

    pub fn read_children(&self, id: TxnId, item: u64) -> Result<Option<Directory>> {
        let path = self.file(id, &format!("node.{}.children", item));
        util::read_optional(&path)?
            .map(|data| decode(&path, &data))
            .transpose()
    }

    pub fn write_props(&self, id: TxnId, item: u64, props: &PropertySet) -> Result<()> {
        let path = self.file(id, &format!("node.{}.props", item));
        util::write_atomic(&path, &encode(props)?)
    }

    pub fn read_props(&self, id: TxnId, item: u64) -> Result<Option<PropertySet>> {
        let path = self.file(id, &format!("node.{}.props", item));
        util::read_optional(&path)?
            .map(|data| decode(&path, &data))
            .transpose()
    }

    pub fn write_rep(&self, id: TxnId, item: u64, payload: &[u8]) -> Result<()> {
        util::write_atomic(&self.file(id, &format!("rep.{}", item)), payload)
    }

    pub fn read_rep(&self, id: TxnId, item: u64) -> Result<Vec<u8>> {
        let path = self.file(id, &format!("rep.{}", item));
        util::read_optional(&path)?.ok_or_else(|| {
            FsError::Corruption(format!("representation {} missing from txn {}", item, id))
        })
    }

    /// Representation written earlier in this transaction with `checksum`
    pub fn shared_rep(&self, id: TxnId, checksum: &Checksum) -> Result<Option<Representation>> {
        let path = self.file(id, &format!("sha.{}", checksum.to_hex()));
        util::read_optional(&path)?
            .map(|data| decode(&path, &data))
            .transpose()
    }

    pub fn remember_shared_rep(&self, id: TxnId, rep: &Representation) -> Result<()> {
        let path = self.file(id, &format!("sha.{}", rep.checksum.to_hex()));
        util::write_atomic(&path, &encode(rep)?)
    }

    /// Append one entry to the change log
    pub fn append_change(&self, id: TxnId, change: &PathChange) -> Result<()> {
        let path = self.file(id, CHANGES_FILE);
        let payload = encode(change)?;
        let mut record = Vec::with_capacity(payload.len() + 4);
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&payload);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_path(&path)?;
        file.write_all(&record).with_path(&path)
    }

    /// Raw change log in recording order
    pub fn read_changes(&self, id: TxnId) -> Result<Vec<PathChange>> {
        let path = self.file(id, CHANGES_FILE);
        let Some(data) = util::read_optional(&path)? else {
            return Ok(Vec::new());
        };
        let mut changes = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let Some(len_bytes) = data.get(pos..pos + 4) else {
                return Err(FsError::corrupt(path.display(), "truncated change record"));
            };
            let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
                as usize;
            let body = data
                .get(pos + 4..pos + 4 + len)
                .ok_or_else(|| FsError::corrupt(path.display(), "truncated change record"))?;
            changes.push(decode(&path, body)?);
            pos += 4 + len;
        }
        Ok(changes)
    }

    /// Remove everything the transaction left on disk
    pub fn purge(&self, id: TxnId) -> Result<()> {
        let dir = self.txn_dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::Io {
                path: dir,
                source: e,
            }),
        }
    }

    /// Ids of every transaction directory present
    pub fn list(&self) -> Result<Vec<TxnId>> {
        let dir = self.root.join(TXNS_DIR);
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir).with_path(&dir)? {
            let entry = entry.with_path(&dir)?;
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".txn"))
                .and_then(|n| n.parse().ok())
            else {
                continue;
            };
            ids.push(id);
        }
        ids.sort();
        Ok(ids)
    }
}

/// Collapse a change log into one entry per path, ordered by path.
///
/// An add followed by modifications stays an add; an add followed by a
/// delete disappears; a delete followed by an add becomes a replace.
/// Deleting or replacing a directory drops the changes recorded below it
/// up to that point.
pub fn fold_changes(log: Vec<PathChange>) -> Result<Vec<PathChange>> {
    let mut folded: BTreeMap<String, PathChange> = BTreeMap::new();
    for change in log {
        if matches!(change.kind, ChangeKind::Delete | ChangeKind::Replace) {
            let root = change.path.clone();
            folded.retain(|p, _| p == &root || !path::is_ancestor(&root, p));
        }
        let Some(old) = folded.remove(&change.path) else {
            folded.insert(change.path.clone(), change);
            continue;
        };
        let merged = match (old.kind, change.kind) {
            (ChangeKind::Add, ChangeKind::Delete) => None,
            (_, ChangeKind::Delete) => Some(PathChange {
                kind: ChangeKind::Delete,
                node_rev_id: None,
                text_mod: false,
                prop_mod: false,
                copy_from: None,
                ..change
            }),
            (ChangeKind::Delete, ChangeKind::Add | ChangeKind::Replace) => Some(PathChange {
                kind: ChangeKind::Replace,
                ..change
            }),
            (ChangeKind::Add, ChangeKind::Replace) => Some(PathChange {
                kind: ChangeKind::Add,
                ..change
            }),
            (_, ChangeKind::Replace) => Some(change),
            (ChangeKind::Delete, ChangeKind::Modify) | (_, ChangeKind::Add) => {
                return Err(FsError::Corruption(format!(
                    "invalid change ordering at {}: {:?} after {:?}",
                    change.path, change.kind, old.kind
                )));
            }
            (kind, ChangeKind::Modify) => Some(PathChange {
                kind,
                text_mod: old.text_mod || change.text_mod,
                prop_mod: old.prop_mod || change.prop_mod,
                copy_from: old.copy_from,
                ..change
            }),
        };
        if let Some(merged) = merged {
            folded.insert(merged.path.clone(), merged);
        }
    }
    Ok(folded.into_values().collect())
}

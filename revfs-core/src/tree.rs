//! Revision and transaction roots
//!
//! All path-based reads and writes go through a [`Root`]. Revision roots
//! are read-only views of a published revision; transaction roots edit
//! the transaction's tree by copy-on-write.

use bytes::Bytes;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::dag::{self, DagNode};
use crate::error::{FsError, Result};
use crate::id::{ITEM_ROOT_NODE, IdPart, NodeRevId, Revnum, TxnId};
use crate::object::{ChangeKind, Checksum, CopySource, NodeKind, PathChange};
use crate::path;
use crate::properties::{PropertySet, PropertyValue};
use crate::storage::NodeStore;
use crate::txn::{CopyRecord, TxnRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    Revision(Revnum),
    Transaction(TxnId),
}

/// One step of a node's history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub path: String,
    pub revision: Revnum,
}

#[derive(Clone)]
pub struct Root {
    store: Arc<dyn NodeStore>,
    kind: RootKind,
}

impl std::fmt::Debug for Root {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Root").field("kind", &self.kind).finish()
    }
}

impl Root {
    pub(crate) fn revision(store: Arc<dyn NodeStore>, rev: Revnum) -> Result<Self> {
        if rev > store.youngest()? {
            return Err(FsError::NoSuchRevision(rev));
        }
        Ok(Self {
            store,
            kind: RootKind::Revision(rev),
        })
    }

    pub(crate) fn transaction(store: Arc<dyn NodeStore>, txn: TxnId) -> Self {
        Self {
            store,
            kind: RootKind::Transaction(txn),
        }
    }

    pub fn kind(&self) -> RootKind {
        self.kind
    }

    pub fn is_txn_root(&self) -> bool {
        matches!(self.kind, RootKind::Transaction(_))
    }

    /// Revision of a revision root
    pub fn revision_number(&self) -> Option<Revnum> {
        match self.kind {
            RootKind::Revision(rev) => Some(rev),
            RootKind::Transaction(_) => None,
        }
    }

    pub fn txn_id(&self) -> Option<TxnId> {
        match self.kind {
            RootKind::Transaction(txn) => Some(txn),
            RootKind::Revision(_) => None,
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    fn root_id(&self) -> NodeRevId {
        match self.kind {
            RootKind::Revision(rev) => NodeRevId::root_of(rev),
            RootKind::Transaction(txn) => NodeRevId::new(
                NodeRevId::root_of(0).node_id,
                IdPart::in_txn(txn, ITEM_ROOT_NODE),
            ),
        }
    }

    fn root_node(&self) -> Result<DagNode> {
        DagNode::open(&self.store, &self.root_id())
    }

    fn node(&self, path: &str) -> Result<DagNode> {
        let path = path::canonicalize(path)?;
        dag::open_path(&self.root_node()?, &path)
    }

    // Reads

    /// Kind of the node at `path`, `None` if nothing is there
    pub fn check_path(&self, path: &str) -> Result<Option<NodeKind>> {
        let path = path::canonicalize(path)?;
        Ok(dag::lookup(&self.root_node()?, &path)?.map(|n| n.kind()))
    }

    pub fn open_path(&self, path: &str) -> Result<DagNode> {
        self.node(path)
    }

    /// Entries of the directory at `path` as (name, kind) pairs
    pub fn dir_entries(&self, path: &str) -> Result<Vec<(String, NodeKind)>> {
        let node = self.node(path)?;
        if !node.is_dir() {
            return Err(FsError::NotADirectory(path::canonicalize(path)?));
        }
        Ok(node
            .entries()?
            .iter()
            .map(|e| (e.name.clone(), e.kind))
            .collect())
    }

    pub fn file_contents(&self, path: &str) -> Result<Bytes> {
        self.node(path)?.contents()
    }

    pub fn file_length(&self, path: &str) -> Result<u64> {
        let node = self.node(path)?;
        if node.is_dir() {
            return Err(FsError::NotAFile(node.created_path().to_string()));
        }
        Ok(node.node_revision().data_rep.map_or(0, |r| r.expanded_size))
    }

    pub fn file_checksum(&self, path: &str) -> Result<Checksum> {
        let node = self.node(path)?;
        if node.is_dir() {
            return Err(FsError::NotAFile(node.created_path().to_string()));
        }
        Ok(node
            .node_revision()
            .data_rep
            .map_or_else(|| Checksum::from_data(b""), |r| r.checksum))
    }

    pub fn node_proplist(&self, path: &str) -> Result<PropertySet> {
        self.node(path)?.proplist()
    }

    pub fn node_prop(&self, path: &str, name: &str) -> Result<Option<PropertyValue>> {
        Ok(self.node_proplist(path)?.get(name).cloned())
    }

    pub fn node_id(&self, path: &str) -> Result<NodeRevId> {
        Ok(self.node(path)?.id())
    }

    /// Revision in which the node at `path` was last changed; `None` for
    /// nodes changed in a transaction
    pub fn node_created_rev(&self, path: &str) -> Result<Option<Revnum>> {
        Ok(self.node(path)?.node_revision().created_rev())
    }

    pub fn node_created_path(&self, path: &str) -> Result<String> {
        Ok(self.node(path)?.created_path().to_string())
    }

    /// Copy source if the node at `path` was created by a copy
    pub fn copied_from(&self, path: &str) -> Result<Option<CopySource>> {
        Ok(self.node(path)?.node_revision().copy_from.clone())
    }

    /// Committed versions of the node at `path`, newest first.
    ///
    /// Walks predecessor links; with `stop_on_copy` the walk ends at the
    /// node-revision that was created by a copy.
    pub fn node_history(
        &self,
        path: &str,
        stop_on_copy: bool,
        cancel: &CancelToken,
    ) -> Result<Vec<HistoryEntry>> {
        let mut history = Vec::new();
        let mut next = Some(self.node(path)?);
        while let Some(node) = next {
            cancel.check()?;
            let revision = node.node_revision();
            if let Some(rev) = revision.created_rev() {
                history.push(HistoryEntry {
                    path: revision.created_path.clone(),
                    revision: rev,
                });
            }
            if stop_on_copy && revision.copy_from.is_some() {
                break;
            }
            next = node.predecessor()?;
        }
        Ok(history)
    }

    /// Changed-path list of the revision or transaction
    pub fn paths_changed(&self) -> Result<Vec<PathChange>> {
        match self.kind {
            RootKind::Revision(rev) => self.store.changed_paths(rev),
            RootKind::Transaction(txn) => self.store.txn_changes(txn),
        }
    }

    fn check_same_fs(&self, other: &Root) -> Result<()> {
        let same = self.store.uuid() == other.store.uuid()
            && self.store.location() == other.store.location();
        if same {
            Ok(())
        } else {
            Err(FsError::CrossFilesystem)
        }
    }

    /// Whether the file contents differ between two root/path pairs
    pub fn contents_changed(&self, path: &str, other: &Root, other_path: &str) -> Result<bool> {
        self.check_same_fs(other)?;
        let a = self.node(path)?;
        let b = other.node(other_path)?;
        if a.is_dir() || b.is_dir() {
            return Err(FsError::NotAFile(path::canonicalize(path)?));
        }
        Ok(!crate::object::Representation::same_content(
            a.node_revision().data_rep.as_ref(),
            b.node_revision().data_rep.as_ref(),
        ))
    }

    /// Whether the property lists differ between two root/path pairs
    pub fn props_changed(&self, path: &str, other: &Root, other_path: &str) -> Result<bool> {
        self.check_same_fs(other)?;
        Ok(self.node_proplist(path)? != other.node_proplist(other_path)?)
    }

    // Writes

    fn txn_record(&self) -> Result<TxnRecord> {
        let RootKind::Transaction(txn) = self.kind else {
            return Err(FsError::NotTxnRoot);
        };
        let record = self.store.transaction(txn)?;
        record.ensure_active()?;
        Ok(record)
    }

    /// With out-of-date checking on, refuse to edit `path` when HEAD holds
    /// a different node-revision there than the transaction's base
    fn check_out_of_date(&self, record: &TxnRecord, path: &str) -> Result<()> {
        if !record.flags.check_out_of_date {
            return Ok(());
        }
        let youngest = self.store.youngest()?;
        if youngest == record.base_rev {
            return Ok(());
        }
        let base = DagNode::open(&self.store, &NodeRevId::root_of(record.base_rev))?;
        let Some(base_node) = dag::lookup(&base, path)? else {
            return Ok(());
        };
        let head = DagNode::open(&self.store, &NodeRevId::root_of(youngest))?;
        match dag::lookup(&head, path)? {
            Some(head_node) if head_node.id() == base_node.id() => Ok(()),
            Some(_) => Err(FsError::OutOfDate {
                path: path.to_string(),
                detail: format!("changed since r{}", record.base_rev),
            }),
            None => Err(FsError::OutOfDate {
                path: path.to_string(),
                detail: format!("deleted since r{}", record.base_rev),
            }),
        }
    }

    /// Mutable node at canonical `path`, cloning every immutable node on
    /// the way down
    fn mutable_node(&self, txn: TxnId, path: &str) -> Result<DagNode> {
        let mut node = self.root_node()?;
        let mut walked = String::from("/");
        for name in path::components(path) {
            if !node.is_dir() {
                return Err(FsError::NotADirectory(walked));
            }
            let child_path = path::join(&walked, name);
            node = node.clone_child(txn, name, &child_path)?;
            walked = child_path;
        }
        Ok(node)
    }

    /// Copy-on-write entry point: clone the node at `path` and its parents
    /// into the transaction
    pub fn make_node_mutable(&self, path: &str) -> Result<DagNode> {
        let record = self.txn_record()?;
        let path = path::canonicalize(path)?;
        self.mutable_node(record.id, &path)
    }

    fn parent_of<'p>(&self, txn: TxnId, path: &'p str) -> Result<(DagNode, &'p str)> {
        let (parent, name) = path::split(path)
            .ok_or_else(|| FsError::InvalidPath(format!("{} has no parent", path)))?;
        let parent_node = self.mutable_node(txn, parent)?;
        if !parent_node.is_dir() {
            return Err(FsError::NotADirectory(parent.to_string()));
        }
        Ok((parent_node, name))
    }

    fn make_node(&self, path: &str, kind: NodeKind) -> Result<()> {
        let record = self.txn_record()?;
        let path = path::canonicalize(path)?;
        let (parent, name) = self.parent_of(record.id, &path)?;
        let node = parent.make_entry(record.id, name, kind, &path)?;
        self.store.record_change(
            record.id,
            &PathChange {
                path: path.clone(),
                kind: ChangeKind::Add,
                node_kind: kind,
                node_rev_id: Some(node.id()),
                text_mod: false,
                prop_mod: false,
                copy_from: None,
            },
        )
    }

    pub fn make_dir(&self, path: &str) -> Result<()> {
        self.make_node(path, NodeKind::Dir)
    }

    pub fn make_file(&self, path: &str) -> Result<()> {
        self.make_node(path, NodeKind::File)
    }

    pub fn delete(&self, path: &str) -> Result<()> {
        let record = self.txn_record()?;
        let path = path::canonicalize(path)?;
        if path == "/" {
            return Err(FsError::InvalidPath("cannot delete the root directory".into()));
        }
        self.check_out_of_date(&record, &path)?;
        let (parent, name) = self.parent_of(record.id, &path)?;
        let removed = parent.delete_entry(record.id, name)?;
        self.store.record_change(
            record.id,
            &PathChange {
                path,
                kind: ChangeKind::Delete,
                node_kind: removed.kind,
                node_rev_id: None,
                text_mod: false,
                prop_mod: false,
                copy_from: None,
            },
        )
    }

    /// Copy `from_path` of revision root `from` to `to_path`, recording
    /// the copy source
    pub fn copy(&self, from: &Root, from_path: &str, to_path: &str) -> Result<()> {
        self.copy_node(from, from_path, to_path, true)
    }

    /// Point `to_path` at the node-revision of `from_path` without
    /// recording a copy
    pub fn revision_link(&self, from: &Root, from_path: &str, to_path: &str) -> Result<()> {
        self.copy_node(from, from_path, to_path, false)
    }

    fn copy_node(&self, from: &Root, from_path: &str, to_path: &str, preserve_history: bool) -> Result<()> {
        self.check_same_fs(from)?;
        let RootKind::Revision(from_rev) = from.kind else {
            return Err(FsError::NotRevisionRoot);
        };
        let mut record = self.txn_record()?;
        let from_path = path::canonicalize(from_path)?;
        let to_path = path::canonicalize(to_path)?;
        if to_path == "/" {
            return Err(FsError::InvalidPath("cannot replace the root directory".into()));
        }
        let source = from.node(&from_path)?;
        let (parent, name) = self.parent_of(record.id, &to_path)?;
        let replaced = parent.entries()?.contains(name);
        if replaced {
            self.check_out_of_date(&record, &to_path)?;
        }

        let copy_from = preserve_history.then(|| CopySource {
            path: from_path.clone(),
            revision: from_rev,
        });
        let node = parent.copy_into(record.id, name, &source, copy_from.clone(), &to_path)?;
        self.store.record_change(
            record.id,
            &PathChange {
                path: to_path.clone(),
                kind: if replaced {
                    ChangeKind::Replace
                } else {
                    ChangeKind::Add
                },
                node_kind: node.kind(),
                node_rev_id: Some(node.id()),
                text_mod: false,
                prop_mod: false,
                copy_from: copy_from.clone(),
            },
        )?;
        if let Some(source) = copy_from {
            record.copies.push(CopyRecord {
                path: to_path,
                source,
            });
            self.store.update_transaction(&record)?;
        }
        Ok(())
    }

    pub fn set_file_contents(&self, path: &str, data: &[u8]) -> Result<()> {
        let record = self.txn_record()?;
        let path = path::canonicalize(path)?;
        self.check_out_of_date(&record, &path)?;
        let mut node = self.mutable_node(record.id, &path)?;
        if node.is_dir() {
            return Err(FsError::NotAFile(path));
        }
        node.set_contents(record.id, data)?;
        self.store.record_change(
            record.id,
            &PathChange {
                path,
                kind: ChangeKind::Modify,
                node_kind: NodeKind::File,
                node_rev_id: Some(node.id()),
                text_mod: true,
                prop_mod: false,
                copy_from: None,
            },
        )
    }

    /// Set (`Some`) or remove (`None`) property `name` on the node at `path`
    pub fn set_node_prop(&self, path: &str, name: &str, value: Option<&[u8]>) -> Result<()> {
        let record = self.txn_record()?;
        let path = path::canonicalize(path)?;
        self.check_out_of_date(&record, &path)?;
        let node = self.mutable_node(record.id, &path)?;
        let mut props = node.proplist()?;
        props.apply(name, value);
        node.set_proplist(record.id, &props)?;
        self.store.record_change(
            record.id,
            &PathChange {
                path,
                kind: ChangeKind::Modify,
                node_kind: node.kind(),
                node_rev_id: Some(node.id()),
                text_mod: false,
                prop_mod: true,
                copy_from: None,
            },
        )
    }
}

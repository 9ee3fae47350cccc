//! Storage backend interface
//!
//! The DAG layer and the commit machinery talk to storage only through
//! [`NodeStore`]. [`crate::disk_store::DiskStore`] is the one on-disk
//! format implementing it.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::config::FsConfig;
use crate::error::Result;
use crate::id::{NodeRevId, Revnum, TxnId};
use crate::object::{Directory, NodeRevision, PathChange, Representation};
use crate::properties::PropertySet;
use crate::revision::WriteLock;
use crate::txn::{TxnFlags, TxnRecord};

/// A revision container prepared for publishing, not yet visible
#[derive(Debug, Clone)]
pub struct ProtoRevision {
    pub revision: Revnum,
    pub path: PathBuf,
    /// Representations first written by this revision
    pub new_reps: Vec<Representation>,
    pub root_id: NodeRevId,
}

/// Storage operations needed by the node-revision layer
///
/// Committed objects are immutable; implementations may cache them
/// forever. Objects owned by a transaction change with every edit.
pub trait NodeStore: Send + Sync {
    /// Identity of the filesystem; copies across filesystems are rejected
    fn uuid(&self) -> &str;

    /// Canonical directory the filesystem lives in. Copies of a filesystem
    /// share its UUID but not its location.
    fn location(&self) -> &Path;

    fn config(&self) -> &FsConfig;

    /// Youngest published revision, re-read on every call
    fn youngest(&self) -> Result<Revnum>;

    fn node_revision(&self, id: &NodeRevId) -> Result<Arc<NodeRevision>>;

    /// Entries of a directory node
    fn directory(&self, node: &NodeRevision) -> Result<Arc<Directory>>;

    /// Logical bytes of a representation
    fn contents(&self, rep: &Representation) -> Result<Bytes>;

    fn proplist(&self, node: &NodeRevision) -> Result<PropertySet>;

    /// Changed-path list recorded with `rev`
    fn changed_paths(&self, rev: Revnum) -> Result<Vec<PathChange>>;

    fn revision_proplist(&self, rev: Revnum) -> Result<PropertySet>;

    /// Replace the properties of `rev`; the caller holds the write lock
    fn set_revision_proplist(&self, rev: Revnum, props: &PropertySet) -> Result<()>;

    // Transactions

    fn create_transaction(&self, base_rev: Revnum, flags: TxnFlags) -> Result<TxnRecord>;

    fn transaction(&self, txn: TxnId) -> Result<TxnRecord>;

    fn update_transaction(&self, record: &TxnRecord) -> Result<()>;

    /// Remove a transaction and everything cached for it
    fn purge_transaction(&self, txn: TxnId) -> Result<()>;

    fn list_transactions(&self) -> Result<Vec<TxnId>>;

    fn allocate_item(&self, txn: TxnId) -> Result<u64>;

    fn put_node_revision(&self, txn: TxnId, node: &NodeRevision) -> Result<()>;

    fn put_directory(&self, txn: TxnId, node: &NodeRevision, dir: &Directory) -> Result<()>;

    fn put_proplist(&self, txn: TxnId, node: &NodeRevision, props: &PropertySet) -> Result<()>;

    /// Store file contents, optionally as a delta against `base`
    fn store_contents(
        &self,
        txn: TxnId,
        data: &[u8],
        base: Option<&Representation>,
    ) -> Result<Representation>;

    fn record_change(&self, txn: TxnId, change: &PathChange) -> Result<()>;

    /// Changes of `txn` folded to one entry per path
    fn txn_changes(&self, txn: TxnId) -> Result<Vec<PathChange>>;

    // Commit

    /// Write every node-revision owned by `txn` into a container for
    /// `new_rev`, invisible to readers until published
    fn write_revision(&self, txn: TxnId, new_rev: Revnum, cancel: &CancelToken)
    -> Result<ProtoRevision>;

    /// Make `proto` the youngest revision; the caller holds the write lock
    fn publish_revision(&self, proto: &ProtoRevision, props: &PropertySet) -> Result<()>;

    fn write_lock(&self) -> Result<WriteLock>;
}

//! Node-revision layer
//!
//! A [`DagNode`] is a handle on one node-revision. Nodes owned by a
//! transaction can be edited; every other node is immutable and is cloned
//! into the transaction (keeping its predecessor link) before the first
//! edit. Lifecycle of a node-revision:
//!
//! 1. created in a transaction directory by a clone or a new entry
//! 2. edited in place while the transaction lives
//! 3. written into a revision container at commit, immutable from then on

use bytes::Bytes;
use std::sync::Arc;

use crate::error::{FsError, Result};
use crate::id::{IdPart, NodeRevId, TxnId};
use crate::object::{
    CopySource, DirEntry, Directory, NodeKind, NodeRevision, Representation,
};
use crate::path;
use crate::properties::PropertySet;
use crate::storage::NodeStore;

#[derive(Clone)]
pub struct DagNode {
    store: Arc<dyn NodeStore>,
    node: Arc<NodeRevision>,
}

impl std::fmt::Debug for DagNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagNode").field("node", &self.node).finish()
    }
}

impl DagNode {
    pub fn open(store: &Arc<dyn NodeStore>, id: &NodeRevId) -> Result<Self> {
        Ok(Self {
            store: store.clone(),
            node: store.node_revision(id)?,
        })
    }

    fn wrap(&self, node: NodeRevision) -> Self {
        Self {
            store: self.store.clone(),
            node: Arc::new(node),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    pub fn id(&self) -> NodeRevId {
        self.node.id
    }

    pub fn kind(&self) -> NodeKind {
        self.node.kind
    }

    pub fn is_dir(&self) -> bool {
        self.node.is_dir()
    }

    pub fn node_revision(&self) -> &NodeRevision {
        &self.node
    }

    pub fn created_path(&self) -> &str {
        &self.node.created_path
    }

    pub fn is_mutable(&self, txn: TxnId) -> bool {
        self.node.id.is_txn(txn)
    }

    fn require_mutable(&self, txn: TxnId) -> Result<()> {
        if self.is_mutable(txn) {
            Ok(())
        } else {
            Err(FsError::NotTxnRoot)
        }
    }

    fn require_dir(&self) -> Result<()> {
        if self.is_dir() {
            Ok(())
        } else {
            Err(FsError::NotADirectory(self.node.created_path.clone()))
        }
    }

    pub fn entries(&self) -> Result<Arc<Directory>> {
        self.store.directory(&self.node)
    }

    pub fn child(&self, name: &str) -> Result<Option<DagNode>> {
        let entries = self.entries()?;
        match entries.get(name) {
            Some(entry) => Ok(Some(DagNode::open(&self.store, &entry.id)?)),
            None => Ok(None),
        }
    }

    pub fn contents(&self) -> Result<Bytes> {
        if self.is_dir() {
            return Err(FsError::NotAFile(self.node.created_path.clone()));
        }
        match &self.node.data_rep {
            Some(rep) => self.store.contents(rep),
            None => Ok(Bytes::new()),
        }
    }

    pub fn proplist(&self) -> Result<PropertySet> {
        self.store.proplist(&self.node)
    }

    pub fn predecessor(&self) -> Result<Option<DagNode>> {
        match &self.node.predecessor_id {
            Some(id) => Ok(Some(DagNode::open(&self.store, id)?)),
            None => Ok(None),
        }
    }

    /// Point entry `name` at `id`
    pub fn set_entry(&self, txn: TxnId, name: &str, kind: NodeKind, id: NodeRevId) -> Result<()> {
        self.require_mutable(txn)?;
        self.require_dir()?;
        path::validate_name(name)?;
        let mut dir = (*self.entries()?).clone();
        dir.insert(DirEntry::new(name, kind, id));
        self.store.put_directory(txn, &self.node, &dir)
    }

    pub fn delete_entry(&self, txn: TxnId, name: &str) -> Result<DirEntry> {
        self.require_mutable(txn)?;
        self.require_dir()?;
        let mut dir = (*self.entries()?).clone();
        let removed = dir.remove(name).ok_or_else(|| {
            FsError::NotFound(path::join(&self.node.created_path, name))
        })?;
        self.store.put_directory(txn, &self.node, &dir)?;
        Ok(removed)
    }

    /// Mutable version of child `name`, cloning it into `txn` if needed.
    /// `child_path` is where the child lives in the transaction tree.
    pub fn clone_child(&self, txn: TxnId, name: &str, child_path: &str) -> Result<DagNode> {
        self.require_mutable(txn)?;
        let child = self
            .child(name)?
            .ok_or_else(|| FsError::NotFound(child_path.to_string()))?;
        if child.is_mutable(txn) {
            return Ok(child);
        }
        let item = self.store.allocate_item(txn)?;
        let id = NodeRevId::new(child.node.id.node_id, IdPart::in_txn(txn, item));
        let clone = child.node.successor(id, child_path.to_string());
        self.store.put_node_revision(txn, &clone)?;
        if clone.is_dir() {
            self.store.put_directory(txn, &clone, &*child.entries()?)?;
        }
        self.set_entry(txn, name, clone.kind, id)?;
        tracing::debug!("cloned {} as {} in txn {}", child.node.id, id, txn);
        Ok(self.wrap(clone))
    }

    /// Create a new node without history as entry `name`
    pub fn make_entry(&self, txn: TxnId, name: &str, kind: NodeKind, child_path: &str) -> Result<DagNode> {
        self.require_mutable(txn)?;
        self.require_dir()?;
        path::validate_name(name)?;
        if self.entries()?.contains(name) {
            return Err(FsError::AlreadyExists(child_path.to_string()));
        }
        let item = self.store.allocate_item(txn)?;
        let part = IdPart::in_txn(txn, item);
        let node = NodeRevision::new(NodeRevId::new(part, part), kind, child_path.to_string());
        self.store.put_node_revision(txn, &node)?;
        if node.is_dir() {
            self.store.put_directory(txn, &node, &Directory::new())?;
        }
        self.set_entry(txn, name, kind, node.id)?;
        Ok(self.wrap(node))
    }

    /// Make entry `name` a copy of `source`.
    ///
    /// With a copy source a new node-revision related to `source` records
    /// the provenance and shares its representations; without one the entry
    /// points straight at `source`.
    pub fn copy_into(
        &self,
        txn: TxnId,
        name: &str,
        source: &DagNode,
        copy_from: Option<CopySource>,
        child_path: &str,
    ) -> Result<DagNode> {
        self.require_mutable(txn)?;
        self.require_dir()?;
        path::validate_name(name)?;
        let Some(copy_from) = copy_from else {
            self.set_entry(txn, name, source.kind(), source.id())?;
            return Ok(source.clone());
        };
        let item = self.store.allocate_item(txn)?;
        let id = NodeRevId::new(source.node.id.node_id, IdPart::in_txn(txn, item));
        let mut node = source.node.successor(id, child_path.to_string());
        node.copy_from = Some(copy_from);
        self.store.put_node_revision(txn, &node)?;
        if node.is_dir() {
            self.store.put_directory(txn, &node, &*source.entries()?)?;
        }
        if source.node.id.change_set().is_txn() {
            self.store.put_proplist(txn, &node, &source.proplist()?)?;
        }
        self.set_entry(txn, name, node.kind, id)?;
        Ok(self.wrap(node))
    }

    /// Skip-delta base: walk back to the predecessor whose count has the
    /// lowest set bit of ours cleared, so chains stay logarithmic
    fn delta_base(&self) -> Result<Option<Representation>> {
        let policy = &self.store.config().deltification;
        let count = self.node.predecessor_count;
        if !policy.enabled || count == 0 {
            return Ok(None);
        }
        let walk = count - (count & (count - 1));
        if walk > policy.max_deltification_walk {
            return Ok(None);
        }
        let mut node = self.node.clone();
        for _ in 0..walk {
            let Some(pred) = node.predecessor_id else {
                return Ok(None);
            };
            node = self.store.node_revision(&pred)?;
        }
        Ok(node.data_rep)
    }

    pub fn set_contents(&mut self, txn: TxnId, data: &[u8]) -> Result<()> {
        self.require_mutable(txn)?;
        if self.is_dir() {
            return Err(FsError::NotAFile(self.node.created_path.clone()));
        }
        let base = self.delta_base()?;
        let rep = self.store.store_contents(txn, data, base.as_ref())?;
        let mut node = (*self.node).clone();
        node.data_rep = Some(rep);
        self.store.put_node_revision(txn, &node)?;
        self.node = Arc::new(node);
        Ok(())
    }

    pub fn set_proplist(&self, txn: TxnId, props: &PropertySet) -> Result<()> {
        self.require_mutable(txn)?;
        self.store.put_proplist(txn, &self.node, props)
    }

    /// Re-parent this mutable node's history onto `predecessor`
    pub fn set_predecessor(&mut self, txn: TxnId, predecessor: &DagNode) -> Result<()> {
        self.require_mutable(txn)?;
        let mut node = (*self.node).clone();
        node.predecessor_id = Some(predecessor.id());
        node.predecessor_count = predecessor.node.predecessor_count + 1;
        self.store.put_node_revision(txn, &node)?;
        self.node = Arc::new(node);
        Ok(())
    }
}

/// Resolve canonical `path` below `root`
pub fn open_path(root: &DagNode, path: &str) -> Result<DagNode> {
    let mut node = root.clone();
    let mut walked = String::from("/");
    for name in path::components(path) {
        if !node.is_dir() {
            return Err(FsError::NotADirectory(walked));
        }
        node = node
            .child(name)?
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        walked = path::join(&walked, name);
    }
    Ok(node)
}

/// Like [`open_path`] but absence is `None`
pub fn lookup(root: &DagNode, path: &str) -> Result<Option<DagNode>> {
    match open_path(root, path) {
        Ok(node) => Ok(Some(node)),
        Err(FsError::NotFound(_)) | Err(FsError::NotADirectory(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

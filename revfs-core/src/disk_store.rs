//! On-disk filesystem format
//!
//! Representation payloads are stored as
//! `header_len:u32 | bincode(RepHeader) | zstd(body)` where the body is
//! either the fulltext or an encoded [`Delta`] against the representation
//! named in the header. Transaction-owned payloads live in the
//! transaction directory until commit copies them into the revision
//! container under the same item number.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{CachedDelta, FsCaches};
use crate::cancel::CancelToken;
use crate::config::{FsConfig, FsMetadata, METADATA_FILE};
use crate::delta::{self, Delta};
use crate::error::{FsError, IoResultExt, Result};
use crate::id::{ChangeSet, ITEM_CHANGES, ITEM_ROOT_NODE, IdPart, NodeRevId, Revnum, TxnId};
use crate::index::ItemKind;
use crate::object::{
    Checksum, DirEntry, Directory, NodeKind, NodeRevision, PathChange, RepEncoding,
    Representation,
};
use crate::packfile::ContainerWriter;
use crate::properties::{PropertySet, svn_props};
use crate::rep_cache::RepCache;
use crate::revision::{RevisionStore, WriteLock};
use crate::storage::{NodeStore, ProtoRevision};
use crate::txn::{self, TxnFlags, TxnRecord, TxnState, TxnStore};
use crate::util;

/// Prefix of every stored representation payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepHeader {
    pub encoding: RepEncoding,
    pub expanded_size: u64,
}

pub fn encode_rep(header: &RepHeader, body: &[u8]) -> Result<Vec<u8>> {
    let head = bincode::serialize(header).map_err(|e| FsError::Serialization(e.to_string()))?;
    let mut out = Vec::with_capacity(4 + head.len() + body.len());
    out.extend_from_slice(&(head.len() as u32).to_le_bytes());
    out.extend_from_slice(&head);
    out.extend_from_slice(body);
    Ok(out)
}

/// Split a payload into its header and decompressed body
pub fn decode_rep(addr: &IdPart, payload: &[u8]) -> Result<(RepHeader, Vec<u8>)> {
    let head_len = payload
        .get(..4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
        .ok_or_else(|| FsError::corrupt(addr, "truncated representation"))?;
    let head = payload
        .get(4..4 + head_len)
        .ok_or_else(|| FsError::corrupt(addr, "truncated representation header"))?;
    let header: RepHeader =
        bincode::deserialize(head).map_err(|e| FsError::corrupt(addr, e))?;
    let body = zstd::decode_all(&payload[4 + head_len..]).map_err(|e| FsError::corrupt(addr, e))?;
    Ok((header, body))
}

fn compress(data: &[u8], level: i32) -> Result<Vec<u8>> {
    zstd::encode_all(data, level).map_err(|e| FsError::Serialization(e.to_string()))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| FsError::Serialization(e.to_string()))
}

/// The single storage backend
pub struct DiskStore {
    path: PathBuf,
    location: PathBuf,
    config: FsConfig,
    metadata: FsMetadata,
    revisions: RevisionStore,
    txns: TxnStore,
    rep_cache: RepCache,
    caches: Arc<FsCaches>,
}

impl DiskStore {
    /// Lay out a new filesystem holding the empty revision 0
    pub fn create(path: &Path, config: &FsConfig) -> Result<Self> {
        if path.join(METADATA_FILE).exists() {
            return Err(FsError::AlreadyExists(path.display().to_string()));
        }
        fs::create_dir_all(path).with_path(path)?;
        let metadata = FsMetadata::new(config.shard_size);
        config.save(path)?;
        RevisionStore::create_layout(path)?;
        TxnStore::create_layout(path)?;

        let revisions = RevisionStore::open(path, metadata.shard_size);
        write_initial_revision(&revisions)?;
        metadata.save(path)?;
        tracing::info!("created filesystem {} at {}", metadata.uuid, path.display());
        Self::open(path)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let metadata = FsMetadata::load(path)?;
        let config = FsConfig::load(path)?;
        let location = fs::canonicalize(path).with_path(path)?;
        let caches = FsCaches::for_filesystem(&metadata.uuid, &location, &config.cache);
        Ok(Self {
            path: path.to_path_buf(),
            location,
            revisions: RevisionStore::open(path, metadata.shard_size),
            txns: TxnStore::new(path),
            rep_cache: RepCache::open(path)?,
            caches,
            config,
            metadata,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &FsMetadata {
        &self.metadata
    }

    pub fn revisions(&self) -> &RevisionStore {
        &self.revisions
    }

    pub fn caches(&self) -> &FsCaches {
        &self.caches
    }

    pub fn rep_cache(&self) -> &RepCache {
        &self.rep_cache
    }

    /// Stored bytes of the representation item at `addr`
    fn read_payload(&self, addr: &IdPart) -> Result<Vec<u8>> {
        match addr.change_set {
            ChangeSet::Revision(rev) => self.revisions.read_item(rev, addr.number, ItemKind::Rep),
            ChangeSet::Transaction(txn) => self.txns.read_rep(txn, addr.number),
        }
    }

    /// Reconstruct the bytes of `rep`, walking its delta chain.
    ///
    /// `verify` forces a checksum comparison; `use_cache` allows cached
    /// fulltexts and deltas to short-circuit the walk.
    pub fn read_representation(
        &self,
        rep: &Representation,
        verify: bool,
        use_cache: bool,
    ) -> Result<Bytes> {
        let cacheable = |addr: &IdPart| use_cache && addr.change_set.revision().is_some();
        if cacheable(&rep.addr) {
            if let Some(text) = self.caches.fulltexts.get(&rep.addr) {
                return Ok(text);
            }
        }

        let limit = self.config.max_delta_chain;
        let mut chain: Vec<Arc<CachedDelta>> = Vec::new();
        let mut addr = rep.addr;
        let mut text = loop {
            if !chain.is_empty() && cacheable(&addr) {
                if let Some(text) = self.caches.fulltexts.get(&addr) {
                    break text.to_vec();
                }
            }
            let cached = if cacheable(&addr) {
                self.caches.deltas.get(&addr)
            } else {
                None
            };
            let link = match cached {
                Some(link) => link,
                None => {
                    let payload = self.read_payload(&addr)?;
                    let (header, body) = decode_rep(&addr, &payload)?;
                    match header.encoding {
                        RepEncoding::Fulltext => break body,
                        RepEncoding::Delta { base, .. } => {
                            let link = Arc::new(CachedDelta {
                                base,
                                delta: Delta::from_bytes(&body)?,
                            });
                            if cacheable(&addr) {
                                self.caches.deltas.insert(addr, link.clone());
                            }
                            link
                        }
                    }
                }
            };
            if chain.len() as u32 >= limit {
                return Err(FsError::ChainTooDeep { limit });
            }
            addr = link.base;
            chain.push(link);
        };

        for link in chain.iter().rev() {
            text = delta::apply(&text, &link.delta)?;
        }
        if text.len() as u64 != rep.expanded_size {
            return Err(FsError::Corruption(format!(
                "representation {} expands to {} bytes, expected {}",
                rep.addr,
                text.len(),
                rep.expanded_size
            )));
        }
        if verify {
            let actual = Checksum::from_data(&text);
            if actual != rep.checksum {
                return Err(FsError::Corruption(format!(
                    "checksum mismatch for representation {}: expected {}, got {}",
                    rep.addr, rep.checksum, actual
                )));
            }
        }
        let text = Bytes::from(text);
        if cacheable(&rep.addr) {
            self.caches.fulltexts.insert(rep.addr, text.clone());
        }
        Ok(text)
    }

    /// Representation already holding content with `checksum`
    fn find_shared(&self, txn: TxnId, checksum: &Checksum) -> Result<Option<Representation>> {
        if let Some(rep) = self.txns.shared_rep(txn, checksum)? {
            return Ok(Some(rep));
        }
        self.rep_cache.get(checksum, self.youngest()?)
    }

    /// Pick fulltext or delta encoding for `data`
    fn encode_contents(
        &self,
        data: &[u8],
        base: Option<&Representation>,
    ) -> Result<(RepEncoding, Vec<u8>)> {
        let level = self.config.compression_level;
        let fulltext = compress(data, level)?;
        let policy = &self.config.deltification;
        let Some(base) = base.filter(|b| {
            policy.enabled && b.encoding.chain_length() + 1 < policy.max_chain_length
        }) else {
            return Ok((RepEncoding::Fulltext, fulltext));
        };

        let source = self.read_representation(base, self.config.verify_checksums, true)?;
        let delta = delta::compute(&source, data);
        let compressed = compress(&delta.to_bytes()?, level)?;
        if compressed.len() as u64 * 100 <= fulltext.len() as u64 * policy.max_ratio_percent as u64
        {
            let encoding = RepEncoding::Delta {
                base: base.addr,
                chain_length: base.encoding.chain_length() + 1,
            };
            Ok((encoding, compressed))
        } else {
            Ok((RepEncoding::Fulltext, fulltext))
        }
    }

    /// Create, write back and publish every complete shard
    pub fn pack(&self, cancel: &CancelToken) -> Result<Vec<u64>> {
        let _lock = self.write_lock()?;
        let shards = self.revisions.packable_shards()?;
        for &shard in &shards {
            self.revisions.pack_shard(shard, cancel)?;
        }
        Ok(shards)
    }

    fn ensure_owned(&self, txn: TxnId, node: &NodeRevision) -> Result<()> {
        if node.id.is_txn(txn) {
            Ok(())
        } else {
            Err(FsError::Corruption(format!(
                "node-revision {} is not owned by transaction {}",
                node.id, txn
            )))
        }
    }
}

fn write_initial_revision(revisions: &RevisionStore) -> Result<()> {
    let root = NodeRevision::new(NodeRevId::root_of(0), NodeKind::Dir, "/".to_string());
    let target = revisions.rev_path(0);
    let tmp = util::tmp_path(&target);
    let mut writer = ContainerWriter::create(&tmp)?;
    writer.append(ItemKind::NodeRev, 0, ITEM_ROOT_NODE, &encode(&root)?)?;
    writer.append(ItemKind::Changes, 0, ITEM_CHANGES, &encode(&Vec::<PathChange>::new())?)?;
    writer.finish()?;
    revisions.install_revision(&tmp, 0)?;

    let mut props = PropertySet::new();
    props.set(svn_props::DATE, chrono::Utc::now().to_rfc3339());
    revisions.set_revision_proplist(0, &props)?;
    revisions.set_youngest(0)
}

impl NodeStore for DiskStore {
    fn uuid(&self) -> &str {
        &self.metadata.uuid
    }

    fn location(&self) -> &Path {
        &self.location
    }

    fn config(&self) -> &FsConfig {
        &self.config
    }

    fn youngest(&self) -> Result<Revnum> {
        self.revisions.youngest()
    }

    fn node_revision(&self, id: &NodeRevId) -> Result<Arc<NodeRevision>> {
        match id.change_set() {
            ChangeSet::Revision(rev) => {
                if let Some(node) = self.caches.node_revisions.get(id) {
                    return Ok(node);
                }
                let data = self
                    .revisions
                    .read_item(rev, id.rev_item.number, ItemKind::NodeRev)?;
                let node = NodeRevision::from_bytes(&data)
                    .map_err(|e| FsError::corrupt(format!("node-revision {}", id), e))?;
                if node.id != *id {
                    return Err(FsError::Corruption(format!(
                        "item for node-revision {} holds {}",
                        id, node.id
                    )));
                }
                let node = Arc::new(node);
                self.caches.node_revisions.insert(*id, node.clone());
                Ok(node)
            }
            ChangeSet::Transaction(txn) => match self.txns.read_node(txn, id.rev_item.number)? {
                Some(node) => Ok(Arc::new(node)),
                None if !self.txns.exists(txn) => Err(FsError::NoSuchTransaction(txn)),
                None => Err(FsError::Corruption(format!(
                    "node-revision {} missing from transaction {}",
                    id, txn
                ))),
            },
        }
    }

    fn directory(&self, node: &NodeRevision) -> Result<Arc<Directory>> {
        if !node.is_dir() {
            return Err(FsError::NotADirectory(node.created_path.clone()));
        }
        if let Some(txn) = node.id.change_set().txn() {
            let key = (txn, node.id.rev_item.number);
            if let Some(dir) = self.caches.txn_directories.get(&key) {
                return Ok(dir);
            }
            if let Some(dir) = self.txns.read_children(txn, key.1)? {
                let dir = Arc::new(dir);
                self.caches.txn_directories.insert(key, dir.clone());
                return Ok(dir);
            }
        }
        let Some(rep) = node.data_rep else {
            return Ok(Arc::new(Directory::new()));
        };
        let committed = rep.addr.change_set.revision().is_some();
        if committed {
            if let Some(dir) = self.caches.directories.get(&rep.addr) {
                return Ok(dir);
            }
        }
        let data = self.contents(&rep)?;
        let dir = Arc::new(
            Directory::from_bytes(&data)
                .map_err(|e| FsError::corrupt(format!("directory {}", rep.addr), e))?,
        );
        if committed {
            self.caches.directories.insert(rep.addr, dir.clone());
        }
        Ok(dir)
    }

    fn contents(&self, rep: &Representation) -> Result<Bytes> {
        self.read_representation(rep, self.config.verify_checksums, true)
    }

    fn proplist(&self, node: &NodeRevision) -> Result<PropertySet> {
        if let Some(txn) = node.id.change_set().txn() {
            if let Some(props) = self.txns.read_props(txn, node.id.rev_item.number)? {
                return Ok(props);
            }
        }
        match node.prop_rep {
            None => Ok(PropertySet::new()),
            Some(rep) => {
                let data = self.contents(&rep)?;
                PropertySet::from_bytes(&data)
                    .map_err(|e| FsError::corrupt(format!("property list {}", rep.addr), e))
            }
        }
    }

    fn changed_paths(&self, rev: Revnum) -> Result<Vec<PathChange>> {
        let data = self.revisions.read_item(rev, ITEM_CHANGES, ItemKind::Changes)?;
        bincode::deserialize(&data).map_err(|e| FsError::corrupt(format!("changes of r{}", rev), e))
    }

    fn revision_proplist(&self, rev: Revnum) -> Result<PropertySet> {
        if rev > self.youngest()? {
            return Err(FsError::NoSuchRevision(rev));
        }
        self.revisions.revision_proplist(rev)
    }

    fn set_revision_proplist(&self, rev: Revnum, props: &PropertySet) -> Result<()> {
        if rev > self.youngest()? {
            return Err(FsError::NoSuchRevision(rev));
        }
        self.revisions.set_revision_proplist(rev, props)
    }

    fn create_transaction(&self, base_rev: Revnum, flags: TxnFlags) -> Result<TxnRecord> {
        if base_rev > self.youngest()? {
            return Err(FsError::NoSuchRevision(base_rev));
        }
        let id = self.txns.allocate_id()?;
        let base_root_id = NodeRevId::root_of(base_rev);
        let base_root = self.node_revision(&base_root_id)?;
        let root_id = NodeRevId::new(base_root.id.node_id, IdPart::in_txn(id, ITEM_ROOT_NODE));
        let root = base_root.successor(root_id, "/".to_string());

        let mut props = PropertySet::new();
        props.set(svn_props::DATE, chrono::Utc::now().to_rfc3339());
        let record = TxnRecord {
            id,
            base_rev,
            state: TxnState::Active,
            root_id,
            base_root_id,
            props,
            flags,
            copies: Vec::new(),
        };
        self.txns.create(&record)?;
        self.txns.write_node(id, &root)?;
        let entries = self.directory(&base_root)?;
        self.txns.write_children(id, ITEM_ROOT_NODE, &entries)?;
        tracing::debug!("began transaction {} on r{}", id, base_rev);
        Ok(record)
    }

    fn transaction(&self, txn: TxnId) -> Result<TxnRecord> {
        self.txns.read_record(txn)
    }

    fn update_transaction(&self, record: &TxnRecord) -> Result<()> {
        if !self.txns.exists(record.id) {
            return Err(FsError::NoSuchTransaction(record.id));
        }
        self.txns.write_record(record)
    }

    fn purge_transaction(&self, txn: TxnId) -> Result<()> {
        self.caches.purge_txn(txn);
        self.txns.purge(txn)
    }

    fn list_transactions(&self) -> Result<Vec<TxnId>> {
        self.txns.list()
    }

    fn allocate_item(&self, txn: TxnId) -> Result<u64> {
        self.txns.allocate_item(txn)
    }

    fn put_node_revision(&self, txn: TxnId, node: &NodeRevision) -> Result<()> {
        self.ensure_owned(txn, node)?;
        self.txns.write_node(txn, node)
    }

    fn put_directory(&self, txn: TxnId, node: &NodeRevision, dir: &Directory) -> Result<()> {
        self.ensure_owned(txn, node)?;
        let item = node.id.rev_item.number;
        self.txns.write_children(txn, item, dir)?;
        self.caches
            .txn_directories
            .insert((txn, item), Arc::new(dir.clone()));
        Ok(())
    }

    fn put_proplist(&self, txn: TxnId, node: &NodeRevision, props: &PropertySet) -> Result<()> {
        self.ensure_owned(txn, node)?;
        self.txns.write_props(txn, node.id.rev_item.number, props)
    }

    fn store_contents(
        &self,
        txn: TxnId,
        data: &[u8],
        base: Option<&Representation>,
    ) -> Result<Representation> {
        let checksum = Checksum::from_data(data);
        if self.config.rep_sharing {
            if let Some(rep) = self.find_shared(txn, &checksum)? {
                tracing::debug!("sharing representation {} for {}", rep.addr, checksum);
                return Ok(rep);
            }
        }
        let (encoding, body) = self.encode_contents(data, base)?;
        let header = RepHeader {
            encoding,
            expanded_size: data.len() as u64,
        };
        let payload = encode_rep(&header, &body)?;
        let item = self.txns.allocate_item(txn)?;
        self.txns.write_rep(txn, item, &payload)?;
        let rep = Representation {
            addr: IdPart::in_txn(txn, item),
            size: payload.len() as u64,
            expanded_size: header.expanded_size,
            checksum,
            encoding,
        };
        if self.config.rep_sharing {
            self.txns.remember_shared_rep(txn, &rep)?;
        }
        Ok(rep)
    }

    fn record_change(&self, txn: TxnId, change: &PathChange) -> Result<()> {
        self.txns.append_change(txn, change)
    }

    fn txn_changes(&self, txn: TxnId) -> Result<Vec<PathChange>> {
        txn::fold_changes(self.txns.read_changes(txn)?)
    }

    fn write_revision(
        &self,
        txn: TxnId,
        new_rev: Revnum,
        cancel: &CancelToken,
    ) -> Result<ProtoRevision> {
        let record = self.txns.read_record(txn)?;
        record.ensure_active()?;
        let path = self.txns.proto_path(txn);
        let mut writer = RevisionWriter {
            store: self,
            txn,
            rev: new_rev,
            out: ContainerWriter::create(&path)?,
            structures: HashMap::new(),
            copied_items: HashSet::new(),
            new_reps: Vec::new(),
            cancel,
        };
        let root_id = writer.write_node(record.root_id)?;

        let changes: Vec<PathChange> = self
            .txn_changes(txn)?
            .into_iter()
            .map(|c| c.committed(txn, new_rev))
            .collect();
        writer
            .out
            .append(ItemKind::Changes, new_rev, ITEM_CHANGES, &encode(&changes)?)?;
        let new_reps = writer.new_reps;
        let items = writer.out.item_count();
        writer.out.finish()?;
        tracing::debug!(
            "wrote proto-revision r{} for txn {} ({} items)",
            new_rev,
            txn,
            items
        );
        Ok(ProtoRevision {
            revision: new_rev,
            path,
            new_reps,
            root_id,
        })
    }

    fn publish_revision(&self, proto: &ProtoRevision, props: &PropertySet) -> Result<()> {
        let rev = proto.revision;
        self.revisions.set_revision_proplist(rev, props)?;
        self.revisions.install_revision(&proto.path, rev)?;
        self.revisions.set_youngest(rev)?;
        tracing::info!("published revision r{}", rev);
        if self.config.rep_sharing {
            if let Err(e) = self.rep_cache.insert_all(rev, &proto.new_reps) {
                tracing::warn!("failed to record representations of r{}: {}", rev, e);
            }
        }
        Ok(())
    }

    fn write_lock(&self) -> Result<WriteLock> {
        self.revisions.write_lock()
    }
}

/// Turns the mutable nodes of a transaction into items of one container
struct RevisionWriter<'a> {
    store: &'a DiskStore,
    txn: TxnId,
    rev: Revnum,
    out: ContainerWriter,
    /// Directory and property representations written so far
    structures: HashMap<Checksum, Representation>,
    /// Transaction payload items already copied
    copied_items: HashSet<u64>,
    new_reps: Vec<Representation>,
    cancel: &'a CancelToken,
}

impl RevisionWriter<'_> {
    /// Write the node `id` and every mutable node below it; returns the
    /// committed id
    fn write_node(&mut self, id: NodeRevId) -> Result<NodeRevId> {
        self.cancel.check()?;
        let node = self.store.node_revision(&id)?;
        let (txn, rev) = (self.txn, self.rev);
        let mut committed = (*node).clone();

        if node.is_dir() {
            let dir = self.store.directory(&node)?;
            let mut out = Directory::new();
            for entry in dir.iter() {
                let child = if entry.id.is_txn(txn) {
                    self.write_node(entry.id)?
                } else {
                    entry.id
                };
                out.insert(DirEntry::new(entry.name.clone(), entry.kind, child));
            }
            committed.data_rep = if out.is_empty() {
                None
            } else {
                let bytes = out.to_bytes().map_err(|e| FsError::Serialization(e.to_string()))?;
                Some(self.write_structure(&bytes, node.data_rep.as_ref())?)
            };
        } else if let Some(rep) = node.data_rep.filter(|r| r.is_txn(txn)) {
            committed.data_rep = Some(self.copy_rep(&rep)?);
        }

        if let Some(props) = self.store.txns.read_props(txn, id.rev_item.number)? {
            committed.prop_rep = if props.is_empty() {
                None
            } else {
                let bytes = props
                    .to_bytes()
                    .map_err(|e| FsError::Serialization(e.to_string()))?;
                Some(self.write_structure(&bytes, node.prop_rep.as_ref())?)
            };
        }

        committed.id = id.committed(txn, rev);
        committed.predecessor_id = node.predecessor_id.map(|p| p.committed(txn, rev));
        let bytes = committed
            .to_bytes()
            .map_err(|e| FsError::Serialization(e.to_string()))?;
        self.out
            .append(ItemKind::NodeRev, rev, committed.id.rev_item.number, &bytes)?;
        Ok(committed.id)
    }

    /// Fulltext representation of serialized directory or property bytes,
    /// reusing an identical one where possible
    fn write_structure(
        &mut self,
        bytes: &[u8],
        previous: Option<&Representation>,
    ) -> Result<Representation> {
        let checksum = Checksum::from_data(bytes);
        if let Some(prev) = previous {
            if prev.checksum == checksum && !prev.addr.change_set.is_txn() {
                return Ok(*prev);
            }
        }
        if let Some(rep) = self.structures.get(&checksum) {
            return Ok(*rep);
        }
        if self.store.config.rep_sharing {
            if let Some(rep) = self.store.rep_cache.get(&checksum, self.rev - 1)? {
                self.structures.insert(checksum, rep);
                return Ok(rep);
            }
        }
        let header = RepHeader {
            encoding: RepEncoding::Fulltext,
            expanded_size: bytes.len() as u64,
        };
        let payload = encode_rep(&header, &compress(bytes, self.store.config.compression_level)?)?;
        let item = self.store.txns.allocate_item(self.txn)?;
        self.out.append(ItemKind::Rep, self.rev, item, &payload)?;
        let rep = Representation {
            addr: IdPart::in_revision(self.rev, item),
            size: payload.len() as u64,
            expanded_size: header.expanded_size,
            checksum,
            encoding: RepEncoding::Fulltext,
        };
        self.structures.insert(checksum, rep);
        self.new_reps.push(rep);
        Ok(rep)
    }

    /// Move a transaction-owned file representation into the container
    fn copy_rep(&mut self, rep: &Representation) -> Result<Representation> {
        if self.copy_item(rep.addr.number)? {
            self.new_reps.push(rep.committed(self.txn, self.rev));
        }
        if let RepEncoding::Delta { base, .. } = rep.encoding {
            if base.is_txn(self.txn) {
                self.copy_item(base.number)?;
            }
        }
        Ok(rep.committed(self.txn, self.rev))
    }

    fn copy_item(&mut self, item: u64) -> Result<bool> {
        if !self.copied_items.insert(item) {
            return Ok(false);
        }
        self.cancel.check()?;
        let payload = self.store.txns.read_rep(self.txn, item)?;
        self.out.append(ItemKind::Rep, self.rev, item, &payload)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Incompressible pseudo-random bytes
    fn sample_text(seed: u8, len: usize) -> Vec<u8> {
        let mut state = 0x9E37_79B9_7F4A_7C15u64 ^ seed as u64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect()
    }

    fn store_with(config: FsConfig) -> (TempDir, DiskStore) {
        let dir = TempDir::new().unwrap();
        let config = FsConfig {
            cache: crate::config::CacheConfig {
                shared: false,
                ..config.cache.clone()
            },
            ..config
        };
        let store = DiskStore::create(&dir.path().join("fs"), &config).unwrap();
        (dir, store)
    }

    #[test]
    fn test_create_holds_empty_revision_zero() {
        let (_dir, store) = store_with(FsConfig::default());
        assert_eq!(store.youngest().unwrap(), 0);
        let root = store.node_revision(&NodeRevId::root_of(0)).unwrap();
        assert!(root.is_dir());
        assert!(store.directory(&root).unwrap().is_empty());
        assert!(store.changed_paths(0).unwrap().is_empty());
        assert!(store.revision_proplist(0).unwrap().contains(svn_props::DATE));
        assert!(matches!(
            DiskStore::create(store.path(), &FsConfig::default()),
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_store_and_read_fulltext() {
        let (_dir, store) = store_with(FsConfig::default());
        let txn = store.create_transaction(0, TxnFlags::default()).unwrap().id;
        let rep = store.store_contents(txn, b"hello", None).unwrap();
        assert_eq!(rep.encoding, RepEncoding::Fulltext);
        assert_eq!(rep.expanded_size, 5);
        assert_eq!(&store.contents(&rep).unwrap()[..], b"hello");
    }

    #[test]
    fn test_txn_local_sharing() {
        let (_dir, store) = store_with(FsConfig::default());
        let txn = store.create_transaction(0, TxnFlags::default()).unwrap().id;
        let a = store.store_contents(txn, b"same bytes", None).unwrap();
        let b = store.store_contents(txn, b"same bytes", None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_delta_against_base() {
        let (_dir, store) = store_with(FsConfig::default());
        let txn = store.create_transaction(0, TxnFlags::default()).unwrap().id;
        let v1 = sample_text(1, 20_000);
        let mut v2 = v1.clone();
        v2[10_000..10_010].copy_from_slice(b"0123456789");
        let base = store.store_contents(txn, &v1, None).unwrap();
        let rep = store.store_contents(txn, &v2, Some(&base)).unwrap();
        assert!(matches!(rep.encoding, RepEncoding::Delta { chain_length: 1, .. }));
        assert_eq!(&store.contents(&rep).unwrap()[..], &v2[..]);
    }

    #[test]
    fn test_unrelated_content_stays_fulltext() {
        let (_dir, store) = store_with(FsConfig::default());
        let txn = store.create_transaction(0, TxnFlags::default()).unwrap().id;
        let base = store.store_contents(txn, &sample_text(1, 4096), None).unwrap();
        let other: Vec<u8> = (0..4096u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let rep = store.store_contents(txn, &other, Some(&base)).unwrap();
        assert_eq!(rep.encoding, RepEncoding::Fulltext);
    }

    #[test]
    fn test_chain_bound_is_enforced() {
        let config = FsConfig {
            max_delta_chain: 1,
            ..FsConfig::default()
        };
        let (_dir, store) = store_with(config);
        let txn = store.create_transaction(0, TxnFlags::default()).unwrap().id;
        let v1 = sample_text(3, 20_000);
        let mut v2 = v1.clone();
        v2[100] ^= 1;
        let mut v3 = v2.clone();
        v3[200] ^= 1;
        let r1 = store.store_contents(txn, &v1, None).unwrap();
        let r2 = store.store_contents(txn, &v2, Some(&r1)).unwrap();
        let r3 = store.store_contents(txn, &v3, Some(&r2)).unwrap();
        assert_eq!(r3.encoding.chain_length(), 2);
        assert_eq!(&store.contents(&r2).unwrap()[..], &v2[..]);
        assert!(matches!(
            store.contents(&r3),
            Err(FsError::ChainTooDeep { limit: 1 })
        ));
    }

    #[test]
    fn test_long_chains_are_cut_by_fulltext() {
        let config = FsConfig {
            deltification: crate::config::DeltificationConfig {
                max_chain_length: 2,
                ..Default::default()
            },
            ..FsConfig::default()
        };
        let (_dir, store) = store_with(config);
        let txn = store.create_transaction(0, TxnFlags::default()).unwrap().id;
        let v1 = sample_text(5, 20_000);
        let mut v2 = v1.clone();
        v2[7] ^= 1;
        let mut v3 = v2.clone();
        v3[9] ^= 1;
        let r1 = store.store_contents(txn, &v1, None).unwrap();
        let r2 = store.store_contents(txn, &v2, Some(&r1)).unwrap();
        let r3 = store.store_contents(txn, &v3, Some(&r2)).unwrap();
        assert_eq!(r2.encoding.chain_length(), 1);
        assert_eq!(r3.encoding, RepEncoding::Fulltext);
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let (_dir, store) = store_with(FsConfig::default());
        let txn = store.create_transaction(0, TxnFlags::default()).unwrap().id;
        let mut rep = store.store_contents(txn, b"payload", None).unwrap();
        rep.checksum = Checksum::from_data(b"something else");
        assert!(matches!(store.contents(&rep), Err(FsError::Corruption(_))));
        assert!(store.read_representation(&rep, false, false).is_ok());
    }

    #[test]
    fn test_purge_transaction() {
        let (_dir, store) = store_with(FsConfig::default());
        let txn = store.create_transaction(0, TxnFlags::default()).unwrap().id;
        assert_eq!(store.list_transactions().unwrap(), vec![txn]);
        store.purge_transaction(txn).unwrap();
        assert!(store.list_transactions().unwrap().is_empty());
        assert!(matches!(
            store.transaction(txn),
            Err(FsError::NoSuchTransaction(_))
        ));
    }

    #[test]
    fn test_transaction_beyond_youngest_rejected() {
        let (_dir, store) = store_with(FsConfig::default());
        assert!(matches!(
            store.create_transaction(1, TxnFlags::default()),
            Err(FsError::NoSuchRevision(1))
        ));
    }
}

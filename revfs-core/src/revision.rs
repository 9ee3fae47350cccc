//! Revision store
//!
//! On-disk layout below the filesystem root:
//!
//! ```text
//! current               youngest revision number
//! min-unpacked-rev      first revision not yet moved into a pack
//! write-lock            flock target serializing publishers
//! revs/<shard>/<rev>    container holding one revision
//! revs/<shard>.pack     container holding a whole shard
//! revprops/<shard>/<rev>
//! ```
//!
//! Revision content is never rewritten once `current` names it. Packing
//! only moves items between containers; their logical addresses stay
//! the same, so readers going through the L2P index do not notice.

use lru::LruCache;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::cancel::CancelToken;
use crate::error::{FsError, IoResultExt, Result};
use crate::id::Revnum;
use crate::index::ItemKind;
use crate::packfile::{self, ContainerReader, ContainerWriter};
use crate::properties::PropertySet;
use crate::util::{self, FileLock};

pub const CURRENT_FILE: &str = "current";
pub const MIN_UNPACKED_FILE: &str = "min-unpacked-rev";
pub const WRITE_LOCK_FILE: &str = "write-lock";
pub const REVS_DIR: &str = "revs";
pub const REVPROPS_DIR: &str = "revprops";

const OPEN_CONTAINERS: usize = 64;

/// Held while publishing a revision, packing or changing locks and
/// revision properties
pub struct WriteLock {
    _lock: FileLock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKey {
    Revision(Revnum),
    Pack(u64),
}

pub struct RevisionStore {
    root: PathBuf,
    shard_size: u64,
    containers: Mutex<LruCache<ContainerKey, Arc<ContainerReader>>>,
}

impl RevisionStore {
    pub fn open(root: &Path, shard_size: u64) -> Self {
        let capacity = NonZeroUsize::new(OPEN_CONTAINERS).unwrap_or(NonZeroUsize::MIN);
        Self {
            root: root.to_path_buf(),
            shard_size: shard_size.max(1),
            containers: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Create the directory skeleton of a fresh filesystem
    pub fn create_layout(root: &Path) -> Result<()> {
        for dir in [REVS_DIR, REVPROPS_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path).with_path(&path)?;
        }
        util::write_number(&root.join(MIN_UNPACKED_FILE), 0)
    }

    pub fn shard_size(&self) -> u64 {
        self.shard_size
    }

    pub fn shard_of(&self, rev: Revnum) -> u64 {
        rev / self.shard_size
    }

    pub fn youngest(&self) -> Result<Revnum> {
        util::read_number(&self.root.join(CURRENT_FILE))
    }

    /// Atomically make `rev` the youngest revision
    pub fn set_youngest(&self, rev: Revnum) -> Result<()> {
        util::write_number(&self.root.join(CURRENT_FILE), rev)
    }

    pub fn min_unpacked(&self) -> Result<Revnum> {
        let path = self.root.join(MIN_UNPACKED_FILE);
        if !path.exists() {
            return Ok(0);
        }
        util::read_number(&path)
    }

    pub fn rev_path(&self, rev: Revnum) -> PathBuf {
        self.root
            .join(REVS_DIR)
            .join(self.shard_of(rev).to_string())
            .join(rev.to_string())
    }

    pub fn pack_path(&self, shard: u64) -> PathBuf {
        self.root.join(REVS_DIR).join(format!("{}.pack", shard))
    }

    pub fn revprops_path(&self, rev: Revnum) -> PathBuf {
        self.root
            .join(REVPROPS_DIR)
            .join(self.shard_of(rev).to_string())
            .join(rev.to_string())
    }

    pub fn write_lock(&self) -> Result<WriteLock> {
        Ok(WriteLock {
            _lock: FileLock::acquire(&self.root.join(WRITE_LOCK_FILE))?,
        })
    }

    fn key_for(&self, rev: Revnum) -> Result<ContainerKey> {
        if rev < self.min_unpacked()? {
            Ok(ContainerKey::Pack(self.shard_of(rev)))
        } else {
            Ok(ContainerKey::Revision(rev))
        }
    }

    fn key_path(&self, key: ContainerKey) -> PathBuf {
        match key {
            ContainerKey::Revision(rev) => self.rev_path(rev),
            ContainerKey::Pack(shard) => self.pack_path(shard),
        }
    }

    /// Path of the container currently holding `rev`
    pub fn container_path(&self, rev: Revnum) -> Result<PathBuf> {
        Ok(self.key_path(self.key_for(rev)?))
    }

    /// Reader for the container holding `rev`
    pub fn container(&self, rev: Revnum) -> Result<Arc<ContainerReader>> {
        let key = self.key_for(rev)?;
        if let Some(reader) = self.cached(key) {
            return Ok(reader);
        }
        match ContainerReader::open(&self.key_path(key)) {
            Ok(reader) => Ok(self.remember(key, reader)),
            Err(FsError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound
                    && matches!(key, ContainerKey::Revision(_)) =>
            {
                // packed between our look at min-unpacked-rev and the open
                let retry = self.key_for(rev)?;
                if retry == key {
                    return Err(FsError::NoSuchRevision(rev));
                }
                let reader = ContainerReader::open(&self.key_path(retry))?;
                Ok(self.remember(retry, reader))
            }
            Err(e) => Err(e),
        }
    }

    fn cached(&self, key: ContainerKey) -> Option<Arc<ContainerReader>> {
        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        containers.get(&key).cloned()
    }

    fn remember(&self, key: ContainerKey, reader: ContainerReader) -> Arc<ContainerReader> {
        let reader = Arc::new(reader);
        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        containers.put(key, reader.clone());
        reader
    }

    /// Drop cached readers so the next access reopens from disk
    pub fn forget_containers(&self) {
        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        containers.clear();
    }

    /// Payload of item `item` of `rev`, which must be of kind `kind`
    pub fn read_item(&self, rev: Revnum, item: u64, kind: ItemKind) -> Result<Vec<u8>> {
        let (header, payload) = self.container(rev)?.read_item(rev, item)?;
        if header.kind != kind {
            return Err(FsError::Corruption(format!(
                "item {} of r{} is {:?}, expected {:?}",
                item, rev, header.kind, kind
            )));
        }
        Ok(payload)
    }

    /// Move a finished container into place as revision `rev`
    pub fn install_revision(&self, container: &Path, rev: Revnum) -> Result<()> {
        let target = self.rev_path(rev);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        fs::rename(container, &target).with_path(&target)?;
        util::sync_parent(&target)
    }

    pub fn revision_proplist(&self, rev: Revnum) -> Result<PropertySet> {
        let path = self.revprops_path(rev);
        let data = util::read_optional(&path)?.ok_or(FsError::NoSuchRevision(rev))?;
        PropertySet::from_bytes(&data).map_err(|e| FsError::corrupt(path.display(), e))
    }

    pub fn set_revision_proplist(&self, rev: Revnum, props: &PropertySet) -> Result<()> {
        let path = self.revprops_path(rev);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        let data = props
            .to_bytes()
            .map_err(|e| FsError::Serialization(e.to_string()))?;
        util::write_atomic(&path, &data)
    }

    /// Shards whose revisions all exist and are still unpacked
    pub fn packable_shards(&self) -> Result<Vec<u64>> {
        let youngest = self.youngest()?;
        let first = self.min_unpacked()? / self.shard_size;
        let complete = (youngest + 1) / self.shard_size;
        Ok((first..complete).collect())
    }

    /// Copy every item of `shard` into one pack container, then retire the
    /// per-revision files. The caller holds the write lock.
    pub fn pack_shard(&self, shard: u64, cancel: &CancelToken) -> Result<()> {
        let first = shard * self.shard_size;
        let end = first + self.shard_size;
        if self.min_unpacked()? != first {
            return Err(FsError::InvalidPath(format!(
                "shard {} is not the next shard to pack",
                shard
            )));
        }
        if end > self.youngest()? + 1 {
            return Err(FsError::NoSuchRevision(end - 1));
        }

        let pack_path = self.pack_path(shard);
        let tmp = util::tmp_path(&pack_path);
        let written = self.write_pack(&tmp, first, end, cancel);
        let items = match written {
            Ok(items) => items,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
        };
        fs::rename(&tmp, &pack_path).with_path(&pack_path)?;
        util::sync_parent(&pack_path)?;
        util::write_number(&self.root.join(MIN_UNPACKED_FILE), end)?;

        let shard_dir = self.root.join(REVS_DIR).join(shard.to_string());
        fs::remove_dir_all(&shard_dir).with_path(&shard_dir)?;
        self.forget_containers();
        tracing::info!(
            "packed shard {} (r{}..r{}, {} items)",
            shard,
            first,
            end - 1,
            items
        );
        Ok(())
    }

    fn write_pack(&self, tmp: &Path, first: Revnum, end: Revnum, cancel: &CancelToken) -> Result<usize> {
        let mut writer = ContainerWriter::create(tmp)?;
        for rev in first..end {
            let reader = ContainerReader::open(&self.rev_path(rev))?;
            for entry in &reader.p2l().entries {
                cancel.check()?;
                let raw = reader.read_raw(entry)?;
                writer.append(entry.kind, entry.revision, entry.item, packfile::item_payload(&raw)?)?;
            }
        }
        let items = writer.item_count();
        writer.finish()?;
        Ok(items)
    }
}

//! Filesystem handle
//!
//! [`Filesystem`] is the entry point: it opens the on-disk store, hands
//! out revision roots and transactions, and runs the administrative
//! operations. It is cheap to clone and safe to share between threads.

use chrono::Utc;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::cache::CacheStats;
use crate::cancel::CancelToken;
use crate::commit;
use crate::config::{FsConfig, FsMetadata};
use crate::disk_store::DiskStore;
use crate::error::{FsError, Result};
use crate::hooks::{self, CommitHooks, NoHooks};
use crate::id::{Revnum, TxnId};
use crate::lock::{self, AccessContext, Lock, LockRequest, LockTable};
use crate::object::NodeKind;
use crate::path;
use crate::properties::{PropertySet, PropertyValue};
use crate::storage::NodeStore;
use crate::tree::Root;
use crate::txn::{TxnFlags, TxnRecord, TxnState};
use crate::verify::{self, VerifyReport};

struct FsInner {
    disk: Arc<DiskStore>,
    store: Arc<dyn NodeStore>,
    locks: LockTable,
    hooks: RwLock<Arc<dyn CommitHooks>>,
}

#[derive(Clone)]
pub struct Filesystem {
    inner: Arc<FsInner>,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("path", &self.inner.disk.path())
            .field("uuid", &self.uuid())
            .finish()
    }
}

impl Filesystem {
    /// Create a new filesystem at `path` holding only revision 0
    pub fn create(path: &Path, config: &FsConfig) -> Result<Self> {
        let disk = DiskStore::create(path, config)?;
        Self::from_store(disk)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let disk = DiskStore::open(path)?;
        Self::from_store(disk)
    }

    fn from_store(disk: DiskStore) -> Result<Self> {
        let locks = LockTable::open(disk.path())?;
        let disk = Arc::new(disk);
        let store: Arc<dyn NodeStore> = disk.clone();
        Ok(Self {
            inner: Arc::new(FsInner {
                disk,
                store,
                locks,
                hooks: RwLock::new(Arc::new(NoHooks)),
            }),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.inner.disk.metadata().uuid
    }

    pub fn path(&self) -> &Path {
        self.inner.disk.path()
    }

    pub fn metadata(&self) -> &FsMetadata {
        self.inner.disk.metadata()
    }

    pub fn config(&self) -> &FsConfig {
        self.inner.store.config()
    }

    pub fn set_hooks(&self, hooks: Arc<dyn CommitHooks>) {
        *self.inner.hooks.write().unwrap_or_else(|e| e.into_inner()) = hooks;
    }

    fn hooks(&self) -> Arc<dyn CommitHooks> {
        self.inner
            .hooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn youngest_rev(&self) -> Result<Revnum> {
        self.inner.store.youngest()
    }

    pub fn revision_root(&self, rev: Revnum) -> Result<Root> {
        Root::revision(self.inner.store.clone(), rev)
    }

    pub fn head_root(&self) -> Result<Root> {
        self.revision_root(self.youngest_rev()?)
    }

    // Transactions

    pub fn begin_txn(&self, base_rev: Revnum, flags: TxnFlags) -> Result<Transaction> {
        let record = self.inner.store.create_transaction(base_rev, flags)?;
        Ok(Transaction {
            fs: self.clone(),
            id: record.id,
        })
    }

    pub fn open_txn(&self, id: TxnId) -> Result<Transaction> {
        self.inner.store.transaction(id)?;
        Ok(Transaction {
            fs: self.clone(),
            id,
        })
    }

    pub fn list_transactions(&self) -> Result<Vec<TxnId>> {
        self.inner.store.list_transactions()
    }

    /// Remove a transaction, live or dead; purging a missing one succeeds
    pub fn purge_txn(&self, id: TxnId) -> Result<()> {
        self.inner.store.purge_transaction(id)
    }

    // Revision properties

    pub fn revision_proplist(&self, rev: Revnum) -> Result<PropertySet> {
        self.inner.store.revision_proplist(rev)
    }

    pub fn revision_prop(&self, rev: Revnum, name: &str) -> Result<Option<PropertyValue>> {
        Ok(self.revision_proplist(rev)?.get(name).cloned())
    }

    /// Set (`Some`) or delete (`None`) revision property `name`.
    ///
    /// With `expected_old`, the change only happens if the current value
    /// (`None` meaning absent) still matches it.
    pub fn change_rev_prop(
        &self,
        rev: Revnum,
        name: &str,
        value: Option<&[u8]>,
        expected_old: Option<Option<&[u8]>>,
    ) -> Result<()> {
        let hooks = self.hooks();
        {
            let _lock = self.inner.store.write_lock()?;
            let mut props = self.inner.store.revision_proplist(rev)?;
            if let Some(expected) = expected_old {
                if props.get(name).map(|v| v.as_slice()) != expected {
                    return Err(FsError::PropChangedUnexpectedly {
                        revision: rev,
                        name: name.to_string(),
                    });
                }
            }
            hooks::run_pre_revprop_change(hooks.as_ref(), rev, name, value)?;
            props.apply(name, value);
            self.inner.store.set_revision_proplist(rev, &props)?;
        }
        tracing::debug!("changed revision property {} on r{}", name, rev);
        hooks::run_post_revprop_change(hooks.as_ref(), rev, name);
        Ok(())
    }

    // Locks

    /// Lock the file at `path` in HEAD for `access.username`
    pub fn lock(&self, path: &str, request: LockRequest, access: &AccessContext) -> Result<Lock> {
        let owner = access.username.clone().ok_or(FsError::NoUser)?;
        let path = path::canonicalize(path)?;
        if let Some(token) = &request.token {
            if !token.starts_with(lock::TOKEN_PREFIX) {
                return Err(FsError::BadToken(path));
            }
        }

        let _write = self.inner.store.write_lock()?;
        let head = self.head_root()?;
        match head.check_path(&path)? {
            None => return Err(FsError::NotFound(path)),
            Some(NodeKind::Dir) => return Err(FsError::NotAFile(path)),
            Some(NodeKind::File) => {}
        }
        if let Some(seen) = request.current_rev {
            let created = head.node_created_rev(&path)?.unwrap_or(0);
            if seen < created {
                return Err(FsError::OutOfDate {
                    detail: format!("changed in r{}, caller has r{}", created, seen),
                    path,
                });
            }
        }

        let existing = self.inner.locks.get(&path)?;
        let creation_date = match &existing {
            None => Utc::now(),
            Some(_) if request.steal => Utc::now(),
            Some(held) if request.token.as_deref() == Some(held.token.as_str()) && held.owner == owner => {
                held.creation_date
            }
            Some(held) => {
                return Err(FsError::PathLocked {
                    path,
                    owner: held.owner.clone(),
                });
            }
        };

        let lock = Lock {
            token: request.token.unwrap_or_else(lock::generate_token),
            path,
            owner,
            comment: request.comment,
            creation_date,
            expiration_date: request.expiration,
        };
        self.inner.locks.put(&lock)?;
        tracing::info!("{} locked {}", lock.owner, lock.path);
        Ok(lock)
    }

    /// Remove the lock on `path`. Without `force` the caller must own it
    /// and present its token.
    pub fn unlock(&self, path: &str, token: &str, force: bool, access: &AccessContext) -> Result<()> {
        let path = path::canonicalize(path)?;
        let _write = self.inner.store.write_lock()?;
        let held = self
            .inner
            .locks
            .get(&path)?
            .ok_or_else(|| FsError::NoSuchLock(path.clone()))?;
        if !force {
            if held.token != token {
                return Err(FsError::BadToken(path));
            }
            let user = access.username.as_ref().ok_or(FsError::NoUser)?;
            if *user != held.owner {
                return Err(FsError::LockOwnerMismatch {
                    path,
                    user: user.clone(),
                    owner: held.owner,
                });
            }
        }
        self.inner.locks.remove(&path)?;
        tracing::info!("unlocked {}", path);
        Ok(())
    }

    pub fn get_lock(&self, path: &str) -> Result<Option<Lock>> {
        self.inner.locks.get(&path::canonicalize(path)?)
    }

    /// Locks on `path` and everything below it
    pub fn get_locks_under(&self, path: &str, cancel: &CancelToken) -> Result<Vec<Lock>> {
        self.inner.locks.locks_under(&path::canonicalize(path)?, cancel)
    }

    // Administration

    /// Pack every complete shard; returns the shards packed
    pub fn pack(&self, cancel: &CancelToken) -> Result<Vec<u64>> {
        self.inner.disk.pack(cancel)
    }

    pub fn verify(&self, start: Revnum, end: Revnum, cancel: &CancelToken) -> Result<VerifyReport> {
        verify::verify(&self.inner.disk, start, end, cancel)
    }

    pub fn rebuild_index(&self, rev: Revnum) -> Result<usize> {
        verify::rebuild_index(&self.inner.disk, rev)
    }

    pub fn recover(&self) -> Result<Revnum> {
        verify::recover(&self.inner.disk)
    }

    pub fn cache_stats(&self) -> Vec<(&'static str, CacheStats)> {
        self.inner.disk.caches().stats()
    }
}

/// Handle on one transaction
#[derive(Debug, Clone)]
pub struct Transaction {
    fs: Filesystem,
    id: TxnId,
}

impl Transaction {
    pub fn id(&self) -> TxnId {
        self.id
    }

    fn record(&self) -> Result<TxnRecord> {
        self.fs.inner.store.transaction(self.id)
    }

    /// Revision the transaction is currently based on
    pub fn base_revision(&self) -> Result<Revnum> {
        Ok(self.record()?.base_rev)
    }

    pub fn root(&self) -> Root {
        Root::transaction(self.fs.inner.store.clone(), self.id)
    }

    pub fn proplist(&self) -> Result<PropertySet> {
        Ok(self.record()?.props)
    }

    pub fn prop(&self, name: &str) -> Result<Option<PropertyValue>> {
        Ok(self.record()?.props.get(name).cloned())
    }

    /// Set (`Some`) or delete (`None`) a property of the future revision
    pub fn set_prop(&self, name: &str, value: Option<&[u8]>) -> Result<()> {
        let mut record = self.record()?;
        record.ensure_active()?;
        record.props.apply(name, value);
        self.fs.inner.store.update_transaction(&record)
    }

    /// Commit as a new revision. On a conflict the transaction stays open.
    pub fn commit(&self, access: &AccessContext, cancel: &CancelToken) -> Result<Revnum> {
        let hooks = self.fs.hooks();
        commit::commit_transaction(
            &self.fs.inner.store,
            &self.fs.inner.locks,
            hooks.as_ref(),
            self.id,
            access,
            cancel,
        )
    }

    /// Abandon the transaction and remove its storage. Aborting one that
    /// is already gone or dead succeeds; a committed one is refused.
    pub fn abort(&self) -> Result<()> {
        let store = &self.fs.inner.store;
        let mut record = match self.record() {
            Ok(record) => record,
            Err(FsError::NoSuchTransaction(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        match record.state {
            TxnState::Committed(_) => return Err(FsError::TransactionNotMutable(self.id)),
            TxnState::Dead => {}
            TxnState::Active => {
                record.state = TxnState::Dead;
                store.update_transaction(&record)?;
            }
        }
        store.purge_transaction(self.id)?;
        tracing::debug!("aborted transaction {}", self.id);
        Ok(())
    }
}

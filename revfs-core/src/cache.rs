//! In-memory caches
//!
//! Revision-scoped entries are keyed by committed ids and never go stale.
//! Transaction-scoped directory contents are keyed by `(TxnId, item)`,
//! written through on every mutation and purged when the transaction
//! commits or aborts.

use bytes::Bytes;
use lru::LruCache;
use std::collections::HashMap;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::config::CacheConfig;
use crate::delta::Delta;
use crate::id::{IdPart, NodeRevId, TxnId};
use crate::object::{Directory, NodeRevision};

/// Approximate heap footprint of a cached value
pub trait CacheWeight {
    fn weight(&self) -> usize;
}

impl CacheWeight for Bytes {
    fn weight(&self) -> usize {
        self.len() + 32
    }
}

impl CacheWeight for Arc<NodeRevision> {
    fn weight(&self) -> usize {
        256 + self.created_path.len()
            + self.copy_from.as_ref().map_or(0, |c| c.path.len())
    }
}

impl CacheWeight for Arc<Directory> {
    fn weight(&self) -> usize {
        64 + self.iter().map(|e| 96 + e.name.len()).sum::<usize>()
    }
}

/// A decoded delta plus the address of the representation it applies to
#[derive(Debug)]
pub struct CachedDelta {
    pub base: IdPart,
    pub delta: Delta,
}

impl CacheWeight for Arc<CachedDelta> {
    fn weight(&self) -> usize {
        96 + self.delta.ops.len() * 24 + self.delta.insert_len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub budget: usize,
    pub hits: u64,
    pub misses: u64,
}

struct Inner<K: Hash + Eq, V> {
    lru: LruCache<K, V>,
    used: usize,
    hits: u64,
    misses: u64,
}

/// LRU cache bounded by the total weight of its values
pub struct MemCache<K: Hash + Eq, V> {
    inner: Mutex<Inner<K, V>>,
    budget: usize,
}

impl<K: Hash + Eq + Clone, V: Clone + CacheWeight> MemCache<K, V> {
    pub fn new(budget: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                lru: LruCache::unbounded(),
                used: 0,
                hits: 0,
                misses: 0,
            }),
            budget,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.budget > 0
    }

    pub fn get(&self, key: &K) -> Option<V> {
        if !self.is_enabled() {
            return None;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let found = inner.lru.get(key).cloned();
        match found {
            Some(value) => {
                inner.hits += 1;
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert a value, evicting least recently used entries to stay
    /// within budget. Values larger than a quarter of the budget are not
    /// cached.
    pub fn insert(&self, key: K, value: V) {
        let weight = value.weight();
        if !self.is_enabled() || weight > self.budget / 4 {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = inner.lru.put(key, value) {
            inner.used = inner.used.saturating_sub(old.weight());
        }
        inner.used += weight;
        while inner.used > self.budget {
            match inner.lru.pop_lru() {
                Some((_, evicted)) => inner.used = inner.used.saturating_sub(evicted.weight()),
                None => break,
            }
        }
    }

    pub fn remove(&self, key: &K) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = inner.lru.pop(key) {
            inner.used = inner.used.saturating_sub(old.weight());
        }
    }

    /// Drop every entry whose key matches `pred`
    pub fn remove_where(&self, pred: impl Fn(&K) -> bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let doomed: Vec<K> = inner
            .lru
            .iter()
            .filter(|(k, _)| pred(k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            if let Some(old) = inner.lru.pop(&key) {
                inner.used = inner.used.saturating_sub(old.weight());
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.lru.clear();
        inner.used = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        CacheStats {
            entries: inner.lru.len(),
            bytes: inner.used,
            budget: self.budget,
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

/// All caches of one filesystem
pub struct FsCaches {
    pub node_revisions: MemCache<NodeRevId, Arc<NodeRevision>>,
    /// Committed directories keyed by their representation address
    pub directories: MemCache<IdPart, Arc<Directory>>,
    pub fulltexts: MemCache<IdPart, Bytes>,
    pub deltas: MemCache<IdPart, Arc<CachedDelta>>,
    pub txn_directories: MemCache<(TxnId, u64), Arc<Directory>>,
}

impl FsCaches {
    pub fn new(config: &CacheConfig) -> Self {
        let total = config.memory_size;
        let share = |percent: usize, enabled: bool| if enabled { total / 100 * percent } else { 0 };
        Self {
            node_revisions: MemCache::new(share(15, true)),
            directories: MemCache::new(share(20, true)),
            fulltexts: MemCache::new(share(40, config.fulltexts)),
            deltas: MemCache::new(share(15, config.deltas)),
            txn_directories: MemCache::new(share(10, true)),
        }
    }

    /// Caches for the filesystem `uuid` stored at `path`: shared within the
    /// process when `config.shared` is set, private otherwise.
    ///
    /// Copies of a filesystem keep its UUID, so the location is part of the
    /// key.
    pub fn for_filesystem(uuid: &str, path: &Path, config: &CacheConfig) -> Arc<Self> {
        if !config.shared {
            return Arc::new(Self::new(config));
        }
        static SHARED: OnceLock<Mutex<HashMap<(String, PathBuf), Weak<FsCaches>>>> =
            OnceLock::new();
        let location = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let key = (uuid.to_string(), location);
        let registry = SHARED.get_or_init(|| Mutex::new(HashMap::new()));
        let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = registry.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        registry.retain(|_, weak| weak.strong_count() > 0);
        let caches = Arc::new(Self::new(config));
        registry.insert(key, Arc::downgrade(&caches));
        caches
    }

    /// Forget everything cached for `txn`
    pub fn purge_txn(&self, txn: TxnId) {
        self.txn_directories.remove_where(|(t, _)| *t == txn);
    }

    pub fn stats(&self) -> Vec<(&'static str, CacheStats)> {
        vec![
            ("node-revisions", self.node_revisions.stats()),
            ("directories", self.directories.stats()),
            ("fulltexts", self.fulltexts.stats()),
            ("deltas", self.deltas.stats()),
            ("txn-directories", self.txn_directories.stats()),
        ]
    }
}

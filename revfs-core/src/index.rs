//! Logical-to-physical and physical-to-logical item indexes
//!
//! Every container file (a single revision or a packed shard) ends with
//! both indexes. L2P answers "where is item N of revision R" with two
//! array lookups; P2L answers "which item occupies this offset" with a
//! binary search. Both are derived from the same list of entries, which
//! in turn can be recovered by scanning the self-describing item headers.

use serde::{Deserialize, Serialize};

use crate::error::{FsError, Result};
use crate::id::Revnum;

/// Offset value for item numbers that were never written
pub const NO_OFFSET: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ItemKind {
    NodeRev = 1,
    Rep = 2,
    Changes = 3,
}

impl ItemKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ItemKind::NodeRev),
            2 => Some(ItemKind::Rep),
            3 => Some(ItemKind::Changes),
            _ => None,
        }
    }
}

/// One physical item: where it is, what it is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2lEntry {
    pub offset: u64,
    /// Total bytes including the item header
    pub size: u64,
    pub kind: ItemKind,
    pub revision: Revnum,
    pub item: u64,
}

impl P2lEntry {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Per-revision page tables: `offsets[rev - first_revision][item]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L2pIndex {
    pub first_revision: Revnum,
    pub offsets: Vec<Vec<u64>>,
}

impl L2pIndex {
    pub fn revision_count(&self) -> u64 {
        self.offsets.len() as u64
    }

    pub fn covers(&self, rev: Revnum) -> bool {
        rev >= self.first_revision && rev < self.first_revision + self.revision_count()
    }

    /// Offset of `item` in `rev`
    pub fn resolve(&self, rev: Revnum, item: u64) -> Result<u64> {
        let page = rev
            .checked_sub(self.first_revision)
            .and_then(|i| self.offsets.get(i as usize))
            .ok_or_else(|| {
                FsError::IndexCorruption(format!("revision {} not covered by L2P index", rev))
            })?;
        match page.get(item as usize) {
            Some(&offset) if offset != NO_OFFSET => Ok(offset),
            _ => Err(FsError::IndexCorruption(format!(
                "item {} of r{} unknown to L2P index",
                item, rev
            ))),
        }
    }

    /// Item numbers present for `rev`
    pub fn items(&self, rev: Revnum) -> Vec<u64> {
        rev.checked_sub(self.first_revision)
            .and_then(|i| self.offsets.get(i as usize))
            .map(|page| {
                page.iter()
                    .enumerate()
                    .filter(|(_, off)| **off != NO_OFFSET)
                    .map(|(item, _)| item as u64)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Offset-sorted item list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2lIndex {
    pub entries: Vec<P2lEntry>,
}

impl P2lIndex {
    /// Item occupying byte `offset`
    pub fn resolve(&self, offset: u64) -> Result<&P2lEntry> {
        let idx = self.entries.partition_point(|e| e.end() <= offset);
        match self.entries.get(idx) {
            Some(entry) if entry.offset <= offset => Ok(entry),
            _ => Err(FsError::IndexCorruption(format!(
                "no item at offset {} in P2L index",
                offset
            ))),
        }
    }

    /// All items overlapping `[offset, offset + len)`
    pub fn resolve_range(&self, offset: u64, len: u64) -> Result<&[P2lEntry]> {
        let end = offset.saturating_add(len.max(1));
        let start = self.entries.partition_point(|e| e.end() <= offset);
        let stop = self.entries.partition_point(|e| e.offset < end);
        if start >= stop {
            return Err(FsError::IndexCorruption(format!(
                "no item in byte range {}+{}",
                offset, len
            )));
        }
        Ok(&self.entries[start..stop])
    }
}

/// Collects entries as items are appended and produces both indexes
#[derive(Debug, Default)]
pub struct IndexBuilder {
    entries: Vec<P2lEntry>,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, revision: Revnum, item: u64, offset: u64, size: u64, kind: ItemKind) {
        self.entries.push(P2lEntry {
            offset,
            size,
            kind,
            revision,
            item,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn build(mut self) -> Result<(L2pIndex, P2lIndex)> {
        self.entries.sort_by_key(|e| e.offset);
        for pair in self.entries.windows(2) {
            if pair[0].end() > pair[1].offset {
                return Err(FsError::IndexCorruption(format!(
                    "items at {} and {} overlap",
                    pair[0].offset, pair[1].offset
                )));
            }
        }
        let first = self.entries.iter().map(|e| e.revision).min().unwrap_or(0);
        let last = self.entries.iter().map(|e| e.revision).max().unwrap_or(0);
        let mut offsets = if self.entries.is_empty() {
            Vec::new()
        } else {
            vec![Vec::new(); (last - first + 1) as usize]
        };
        for entry in &self.entries {
            let page = &mut offsets[(entry.revision - first) as usize];
            let slot = entry.item as usize;
            if page.len() <= slot {
                page.resize(slot + 1, NO_OFFSET);
            }
            if page[slot] != NO_OFFSET {
                return Err(FsError::IndexCorruption(format!(
                    "item {} of r{} recorded twice",
                    entry.item, entry.revision
                )));
            }
            page[slot] = entry.offset;
        }
        Ok((
            L2pIndex {
                first_revision: first,
                offsets,
            },
            P2lIndex {
                entries: self.entries,
            },
        ))
    }
}

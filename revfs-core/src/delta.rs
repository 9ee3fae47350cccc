//! Binary delta codec
//!
//! A delta rebuilds a target from a source with two instructions: copy a
//! range of the source, or insert literal bytes. Matches are found by
//! indexing fixed-size source blocks and sliding a rolling hash over the
//! target.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{FsError, Result};

const BLOCK: usize = 32;
const MAX_CANDIDATES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    Copy { offset: u64, len: u64 },
    Insert(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub source_len: u64,
    pub target_len: u64,
    pub ops: Vec<DeltaOp>,
}

impl Delta {
    /// Bytes of literal data carried by the delta
    pub fn insert_len(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                DeltaOp::Insert(data) => data.len(),
                DeltaOp::Copy { .. } => 0,
            })
            .sum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| FsError::Serialization(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| FsError::corrupt("delta", e))
    }
}

/// Adler-style rolling checksum over a window of `BLOCK` bytes
#[derive(Clone, Copy)]
struct Rolling {
    a: u32,
    b: u32,
}

impl Rolling {
    fn new(window: &[u8]) -> Self {
        let mut a = 0u32;
        let mut b = 0u32;
        for (i, &byte) in window.iter().enumerate() {
            a = a.wrapping_add(byte as u32);
            b = b.wrapping_add((window.len() - i) as u32 * byte as u32);
        }
        Self { a, b }
    }

    fn roll(&mut self, out: u8, inp: u8) {
        self.a = self.a.wrapping_sub(out as u32).wrapping_add(inp as u32);
        self.b = self
            .b
            .wrapping_sub((BLOCK as u32).wrapping_mul(out as u32))
            .wrapping_add(self.a);
    }

    fn key(&self) -> u64 {
        ((self.b as u64) << 32) | self.a as u64
    }
}

/// Compute a delta turning `source` into `target`
pub fn compute(source: &[u8], target: &[u8]) -> Delta {
    let mut ops = Vec::new();
    let mut delta = Delta {
        source_len: source.len() as u64,
        target_len: target.len() as u64,
        ops: Vec::new(),
    };
    if target.is_empty() {
        return delta;
    }
    if source.len() < BLOCK || target.len() < BLOCK {
        delta.ops.push(DeltaOp::Insert(target.to_vec()));
        return delta;
    }

    let mut index: HashMap<u64, Vec<usize>> = HashMap::new();
    for offset in (0..=source.len() - BLOCK).step_by(BLOCK) {
        let slot = index
            .entry(Rolling::new(&source[offset..offset + BLOCK]).key())
            .or_default();
        if slot.len() < MAX_CANDIDATES {
            slot.push(offset);
        }
    }

    let mut pos = 0usize;
    let mut pending = 0usize;
    let mut hash = Rolling::new(&target[..BLOCK]);
    while pos + BLOCK <= target.len() {
        if let Some(found) = index
            .get(&hash.key())
            .and_then(|candidates| best_match(source, target, pos, pending, candidates))
        {
            let (src, back, len) = found;
            if pos - back > pending {
                ops.push(DeltaOp::Insert(target[pending..pos - back].to_vec()));
            }
            ops.push(DeltaOp::Copy {
                offset: (src - back) as u64,
                len: (back + len) as u64,
            });
            pos += len;
            pending = pos;
            if pos + BLOCK <= target.len() {
                hash = Rolling::new(&target[pos..pos + BLOCK]);
            }
            continue;
        }
        if pos + BLOCK < target.len() {
            hash.roll(target[pos], target[pos + BLOCK]);
        }
        pos += 1;
    }
    if pending < target.len() {
        ops.push(DeltaOp::Insert(target[pending..].to_vec()));
    }
    delta.ops = ops;
    delta
}

/// Longest verified match among the candidate source offsets, extended
/// forward and backward into not-yet-emitted target bytes.
/// Returns (source offset, backward extension, forward length).
fn best_match(
    source: &[u8],
    target: &[u8],
    pos: usize,
    pending: usize,
    candidates: &[usize],
) -> Option<(usize, usize, usize)> {
    let mut best: Option<(usize, usize, usize)> = None;
    for &src in candidates {
        if source[src..src + BLOCK] != target[pos..pos + BLOCK] {
            continue;
        }
        let mut len = BLOCK;
        while src + len < source.len() && pos + len < target.len() && source[src + len] == target[pos + len]
        {
            len += 1;
        }
        let mut back = 0;
        while back < pos - pending && back < src && source[src - back - 1] == target[pos - back - 1] {
            back += 1;
        }
        if best.is_none_or(|(_, b, l)| back + len > b + l) {
            best = Some((src, back, len));
        }
    }
    best
}

/// Reconstruct the target from `source` and `delta`.
///
/// Every instruction is bounds-checked and the lengths must add up to
/// `target_len` before any output is reserved.
pub fn apply(source: &[u8], delta: &Delta) -> Result<Vec<u8>> {
    if delta.source_len != source.len() as u64 {
        return Err(FsError::Corruption(format!(
            "delta expects a {} byte source, got {}",
            delta.source_len,
            source.len()
        )));
    }
    let mut produced: u64 = 0;
    for op in &delta.ops {
        let len = match op {
            DeltaOp::Copy { offset, len } => {
                let in_source = offset
                    .checked_add(*len)
                    .is_some_and(|end| end <= source.len() as u64);
                if !in_source {
                    return Err(FsError::Corruption(format!(
                        "delta copy {}+{} outside {} byte source",
                        offset,
                        len,
                        source.len()
                    )));
                }
                *len
            }
            DeltaOp::Insert(data) => data.len() as u64,
        };
        produced = produced
            .checked_add(len)
            .ok_or_else(|| FsError::Corruption("delta output length overflows".to_string()))?;
    }
    if produced != delta.target_len {
        return Err(FsError::Corruption(format!(
            "delta produces {} bytes, expected {}",
            produced, delta.target_len
        )));
    }

    let mut out = Vec::with_capacity(produced as usize);
    for op in &delta.ops {
        match op {
            DeltaOp::Copy { offset, len } => {
                let start = *offset as usize;
                out.extend_from_slice(&source[start..start + *len as usize]);
            }
            DeltaOp::Insert(data) => out.extend_from_slice(data),
        }
    }
    Ok(out)
}

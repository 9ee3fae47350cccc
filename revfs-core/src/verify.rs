//! Verification and repair
//!
//! `verify` reads every item of every revision in a range straight from
//! its container, bypassing the caches, and reports what it cannot
//! decode or reconstruct. Problems are collected per revision so one bad
//! revision does not hide the others.

use std::collections::HashSet;

use crate::cancel::CancelToken;
use crate::disk_store::{DiskStore, decode_rep};
use crate::error::{FsError, Result};
use crate::id::{ITEM_CHANGES, ITEM_ROOT_NODE, IdPart, Revnum};
use crate::index::ItemKind;
use crate::object::{Directory, NodeRevision, PathChange, Representation};
use crate::packfile::{self, ContainerReader};
use crate::properties::PropertySet;
use crate::storage::NodeStore;
use crate::util;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyIssue {
    pub revision: Revnum,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub revisions_checked: u64,
    pub items_checked: u64,
    pub issues: Vec<VerifyIssue>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }

    fn issue(&mut self, revision: Revnum, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("verify r{}: {}", revision, message);
        self.issues.push(VerifyIssue { revision, message });
    }
}

/// Check revisions `start..=end`
pub fn verify(
    store: &DiskStore,
    start: Revnum,
    end: Revnum,
    cancel: &CancelToken,
) -> Result<VerifyReport> {
    let youngest = store.youngest()?;
    if start > end {
        return Err(FsError::InvalidPath(format!(
            "empty revision range r{}:r{}",
            start, end
        )));
    }
    if end > youngest {
        return Err(FsError::NoSuchRevision(end));
    }

    let mut report = VerifyReport::default();
    let mut verified_reps: HashSet<IdPart> = HashSet::new();
    for rev in start..=end {
        cancel.check()?;
        match verify_revision(store, rev, &mut verified_reps, &mut report, cancel) {
            Ok(()) => {}
            Err(FsError::Cancelled) => return Err(FsError::Cancelled),
            Err(e) => report.issue(rev, e.to_string()),
        }
        report.revisions_checked += 1;
    }
    tracing::info!(
        "verified r{}..r{}: {} items, {} issues",
        start,
        end,
        report.items_checked,
        report.issues.len()
    );
    Ok(report)
}

fn verify_revision(
    store: &DiskStore,
    rev: Revnum,
    verified_reps: &mut HashSet<IdPart>,
    report: &mut VerifyReport,
    cancel: &CancelToken,
) -> Result<()> {
    let path = store.revisions().container_path(rev)?;
    let container = ContainerReader::open(&path)?;
    store.revision_proplist(rev)?;

    let items = container.l2p().items(rev);
    for required in [ITEM_ROOT_NODE, ITEM_CHANGES] {
        if !items.contains(&required) {
            report.issue(rev, format!("item {} missing", required));
        }
    }

    for item in items {
        cancel.check()?;
        report.items_checked += 1;
        if let Err(e) = verify_item(store, &container, rev, item, verified_reps) {
            if matches!(e, FsError::Cancelled) {
                return Err(e);
            }
            report.issue(rev, format!("item {}: {}", item, e));
        }
    }
    Ok(())
}

fn verify_item(
    store: &DiskStore,
    container: &ContainerReader,
    rev: Revnum,
    item: u64,
    verified_reps: &mut HashSet<IdPart>,
) -> Result<()> {
    let offset = container.l2p().resolve(rev, item)?;
    let entry = container.p2l().resolve(offset)?;
    if entry.offset != offset || entry.revision != rev || entry.item != item {
        return Err(FsError::IndexCorruption(format!(
            "P2L entry at {} is r{}/{}, L2P says r{}/{}",
            entry.offset, entry.revision, entry.item, rev, item
        )));
    }
    let (header, payload) = container.read_item(rev, item)?;
    if header.kind != entry.kind || header.total_len() != entry.size {
        return Err(FsError::IndexCorruption(format!(
            "item header {:?}/{} disagrees with P2L {:?}/{}",
            header.kind,
            header.total_len(),
            entry.kind,
            entry.size
        )));
    }

    match header.kind {
        ItemKind::NodeRev => {
            let node = NodeRevision::from_bytes(&payload)
                .map_err(|e| FsError::corrupt("node-revision", e))?;
            if node.id.rev_item != IdPart::in_revision(rev, item) {
                return Err(FsError::Corruption(format!(
                    "node-revision {} stored as r{}/{}",
                    node.id, rev, item
                )));
            }
            verify_node(store, &node, verified_reps)
        }
        ItemKind::Rep => decode_rep(&IdPart::in_revision(rev, item), &payload).map(|_| ()),
        ItemKind::Changes => {
            let _: Vec<PathChange> = bincode::deserialize(&payload)
                .map_err(|e| FsError::corrupt("changed-path list", e))?;
            Ok(())
        }
    }
}

fn reconstruct(
    store: &DiskStore,
    rep: &Representation,
    verified_reps: &mut HashSet<IdPart>,
) -> Result<Vec<u8>> {
    let text = store.read_representation(rep, true, false)?;
    verified_reps.insert(rep.addr);
    Ok(text.to_vec())
}

fn verify_node(
    store: &DiskStore,
    node: &NodeRevision,
    verified_reps: &mut HashSet<IdPart>,
) -> Result<()> {
    if let Some(rep) = &node.data_rep {
        if node.is_dir() {
            let data = reconstruct(store, rep, verified_reps)?;
            Directory::from_bytes(&data).map_err(|e| FsError::corrupt("directory", e))?;
        } else if !verified_reps.contains(&rep.addr) {
            reconstruct(store, rep, verified_reps)?;
        }
    }
    if let Some(rep) = &node.prop_rep {
        let data = reconstruct(store, rep, verified_reps)?;
        PropertySet::from_bytes(&data).map_err(|e| FsError::corrupt("property list", e))?;
    }
    Ok(())
}

/// Regenerate the indexes of the container holding `rev`
pub fn rebuild_index(store: &DiskStore, rev: Revnum) -> Result<usize> {
    let _lock = store.write_lock()?;
    if rev > store.youngest()? {
        return Err(FsError::NoSuchRevision(rev));
    }
    let path = store.revisions().container_path(rev)?;
    let items = packfile::rebuild_index(&path)?;
    store.revisions().forget_containers();
    tracing::info!("rebuilt index of {} ({} items)", path.display(), items);
    Ok(items)
}

/// Publish revisions that were installed but never made youngest.
/// Returns the youngest revision afterwards.
pub fn recover(store: &DiskStore) -> Result<Revnum> {
    let _lock = store.write_lock()?;
    let revisions = store.revisions();
    let mut youngest = revisions.youngest()?;
    loop {
        let next = youngest + 1;
        let path = revisions.rev_path(next);
        if !path.exists() {
            break;
        }
        if util::read_optional(&revisions.revprops_path(next))?.is_none() {
            tracing::warn!("r{} has no revision properties; not recovering it", next);
            break;
        }
        if let Err(e) = ContainerReader::open(&path) {
            tracing::warn!("r{} is not a complete container ({}); not recovering it", next, e);
            break;
        }
        youngest = next;
    }
    if youngest != revisions.youngest()? {
        revisions.set_youngest(youngest)?;
        tracing::info!("recovered: youngest revision is now r{}", youngest);
    }
    Ok(youngest)
}

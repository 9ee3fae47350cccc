//! Committing transactions
//!
//! A commit runs in three phases:
//!
//! 1. Bring the transaction up to date: if revisions were published since
//!    its base, check its changed paths against them and merge their
//!    tree changes into the transaction tree.
//! 2. Write the proto-revision container, outside the write lock.
//! 3. Under the write lock, confirm nobody published in the meantime,
//!    check path locks and publish.
//!
//! Losing the race in phase 3 sends the commit back to phase 1, up to
//! `max_commit_retries` times.

use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::dag::{self, DagNode};
use crate::error::{FsError, Result};
use crate::hooks::{self, CommitHooks};
use crate::id::{NodeRevId, Revnum, TxnId};
use crate::lock::{AccessContext, LockTable};
use crate::object::{ChangeKind, NodeKind, PathChange, Representation};
use crate::path;
use crate::properties::svn_props;
use crate::storage::NodeStore;
use crate::txn::TxnState;

pub fn commit_transaction(
    store: &Arc<dyn NodeStore>,
    locks: &LockTable,
    hooks: &dyn CommitHooks,
    txn: TxnId,
    access: &AccessContext,
    cancel: &CancelToken,
) -> Result<Revnum> {
    let record = store.transaction(txn)?;
    record.ensure_active()?;
    let changes = store.txn_changes(txn)?;
    hooks::run_pre_commit(hooks, &record, &changes)?;

    match run_commit(store, locks, txn, &changes, access, cancel) {
        Ok(rev) => {
            if let Err(e) = store.purge_transaction(txn) {
                tracing::warn!("failed to purge committed txn {}: {}", txn, e);
            }
            hooks::run_post_commit(hooks, rev);
            Ok(rev)
        }
        Err(FsError::Cancelled) => {
            tracing::info!("commit of txn {} cancelled; aborting it", txn);
            store.purge_transaction(txn)?;
            Err(FsError::Cancelled)
        }
        Err(e) => Err(e),
    }
}

fn run_commit(
    store: &Arc<dyn NodeStore>,
    locks: &LockTable,
    txn: TxnId,
    changes: &[PathChange],
    access: &AccessContext,
    cancel: &CancelToken,
) -> Result<Revnum> {
    let max_retries = store.config().max_commit_retries;
    for attempt in 0..=max_retries {
        cancel.check()?;
        let mut record = store.transaction(txn)?;
        record.ensure_active()?;
        let youngest = store.youngest()?;

        if youngest != record.base_rev {
            tracing::debug!(
                "txn {} based on r{}, HEAD is r{}; merging",
                txn,
                record.base_rev,
                youngest
            );
            check_conflicts(store, changes, record.base_rev, youngest)?;
            let mut target = DagNode::open(store, &record.root_id)?;
            let source = DagNode::open(store, &NodeRevId::root_of(youngest))?;
            let ancestor = DagNode::open(store, &NodeRevId::root_of(record.base_rev))?;
            merge(txn, "/", &mut target, &source, &ancestor)?;
            record.base_rev = youngest;
            record.base_root_id = NodeRevId::root_of(youngest);
            store.update_transaction(&record)?;
        }

        let proto = store.write_revision(txn, youngest + 1, cancel)?;

        let lock = store.write_lock()?;
        if store.youngest()? != youngest {
            drop(lock);
            tracing::debug!("lost commit race for txn {} (attempt {})", txn, attempt + 1);
            continue;
        }

        if record.flags.check_locks {
            for change in changes {
                let recursive = matches!(change.kind, ChangeKind::Delete | ChangeKind::Replace);
                locks.allow_locked_operation(&change.path, recursive, access, cancel)?;
            }
        }

        let mut props = record.props.clone();
        props.set(svn_props::DATE, chrono::Utc::now().to_rfc3339());
        store.publish_revision(&proto, &props)?;
        record.state = TxnState::Committed(proto.revision);
        if let Err(e) = store.update_transaction(&record) {
            tracing::warn!("failed to mark txn {} committed: {}", txn, e);
        }
        drop(lock);
        tracing::info!("committed txn {} as r{}", txn, proto.revision);
        return Ok(proto.revision);
    }
    Err(FsError::ResourceExhausted(format!(
        "txn {} lost the commit race {} times",
        txn,
        max_retries + 1
    )))
}

/// Fail if any path the transaction changed was also changed between
/// `base_rev` and `youngest`
fn check_conflicts(
    store: &Arc<dyn NodeStore>,
    changes: &[PathChange],
    base_rev: Revnum,
    youngest: Revnum,
) -> Result<()> {
    let base = DagNode::open(store, &NodeRevId::root_of(base_rev))?;
    let head = DagNode::open(store, &NodeRevId::root_of(youngest))?;
    for change in changes {
        let before = dag::lookup(&base, &change.path)?;
        let after = dag::lookup(&head, &change.path)?;
        let unchanged = match (&before, &after) {
            (None, None) => true,
            // a directory's id moves with every change below it; for a
            // property edit only its own properties matter
            (Some(b), Some(a))
                if change.kind == ChangeKind::Modify && change.node_kind == NodeKind::Dir =>
            {
                !props_differ(b, a)?
            }
            (Some(b), Some(a)) => b.id() == a.id(),
            _ => false,
        };
        if !unchanged {
            return Err(FsError::Conflict(change.path.clone()));
        }
    }
    Ok(())
}

fn props_differ(a: &DagNode, b: &DagNode) -> Result<bool> {
    let (ra, rb) = (a.node_revision(), b.node_revision());
    let committed = !ra.id.change_set().is_txn() && !rb.id.change_set().is_txn();
    if committed {
        return Ok(!Representation::same_content(
            ra.prop_rep.as_ref(),
            rb.prop_rep.as_ref(),
        ));
    }
    Ok(a.proplist()? != b.proplist()?)
}

fn entry_id(node: &DagNode, name: &str) -> Result<Option<(NodeKind, NodeRevId)>> {
    Ok(node.entries()?.get(name).map(|e| (e.kind, e.id)))
}

/// Three-way merge of directory `source` into mutable directory `target`,
/// both descended from `ancestor`
fn merge(
    txn: TxnId,
    at: &str,
    target: &mut DagNode,
    source: &DagNode,
    ancestor: &DagNode,
) -> Result<()> {
    if props_differ(ancestor, source)? {
        if !props_differ(target, ancestor)? {
            target.set_proplist(txn, &source.proplist()?)?;
        } else if props_differ(target, source)? {
            return Err(FsError::Conflict(at.to_string()));
        }
    }

    let ancestor_entries = ancestor.entries()?;
    for entry in ancestor_entries.iter() {
        let name = entry.name.as_str();
        let here = path::join(at, name);
        let from_ancestor = Some((entry.kind, entry.id));
        let from_source = entry_id(source, name)?;
        let from_target = entry_id(target, name)?;

        if from_source == from_ancestor || from_source == from_target {
            continue;
        }
        if from_target == from_ancestor {
            match from_source {
                Some((kind, id)) => target.set_entry(txn, name, kind, id)?,
                None => {
                    target.delete_entry(txn, name)?;
                }
            }
            continue;
        }
        match (from_source, from_target) {
            (Some((NodeKind::Dir, s)), Some((NodeKind::Dir, t)))
                if entry.kind == NodeKind::Dir
                    && s.is_related(&entry.id)
                    && t.is_related(&entry.id)
                    && t.is_txn(txn) =>
            {
                let store = target.store().clone();
                let mut target_child = DagNode::open(&store, &t)?;
                let source_child = DagNode::open(&store, &s)?;
                let ancestor_child = DagNode::open(&store, &entry.id)?;
                merge(txn, &here, &mut target_child, &source_child, &ancestor_child)?;
            }
            _ => return Err(FsError::Conflict(here)),
        }
    }

    for entry in source.entries()?.iter() {
        if ancestor_entries.contains(&entry.name) {
            continue;
        }
        match entry_id(target, &entry.name)? {
            None => target.set_entry(txn, &entry.name, entry.kind, entry.id)?,
            Some((_, id)) if id == entry.id => {}
            Some(_) => return Err(FsError::Conflict(path::join(at, &entry.name))),
        }
    }

    target.set_predecessor(txn, source)
}

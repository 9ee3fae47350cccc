//! Commit and revision-property hooks
//!
//! The engine calls out synchronously at four points:
//! - pre-commit: before the revision is written (can reject)
//! - post-commit: after the revision is published (notification)
//! - pre-revprop-change: before a revision property changes (can reject)
//! - post-revprop-change: after a revision property changed (notification)
//!
//! A rejecting pre-hook returns `Err(message)`. Errors from post-hooks are
//! logged and never undo the operation that already happened.

use crate::error::{FsError, Result};
use crate::id::Revnum;
use crate::object::PathChange;
use crate::txn::TxnRecord;

pub trait CommitHooks: Send + Sync {
    fn pre_commit(&self, _txn: &TxnRecord, _changes: &[PathChange]) -> std::result::Result<(), String> {
        Ok(())
    }

    fn post_commit(&self, _rev: Revnum) -> std::result::Result<(), String> {
        Ok(())
    }

    /// `value` is the new value, `None` when the property is deleted
    fn pre_revprop_change(
        &self,
        _rev: Revnum,
        _name: &str,
        _value: Option<&[u8]>,
    ) -> std::result::Result<(), String> {
        Ok(())
    }

    fn post_revprop_change(&self, _rev: Revnum, _name: &str) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Accepts everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl CommitHooks for NoHooks {}

pub(crate) fn run_pre_commit(
    hooks: &dyn CommitHooks,
    txn: &TxnRecord,
    changes: &[PathChange],
) -> Result<()> {
    hooks
        .pre_commit(txn, changes)
        .map_err(|message| FsError::HookRejected {
            hook: "pre-commit",
            message,
        })
}

pub(crate) fn run_post_commit(hooks: &dyn CommitHooks, rev: Revnum) {
    if let Err(e) = hooks.post_commit(rev) {
        tracing::warn!("post-commit hook error for r{} (ignored): {}", rev, e);
    }
}

pub(crate) fn run_pre_revprop_change(
    hooks: &dyn CommitHooks,
    rev: Revnum,
    name: &str,
    value: Option<&[u8]>,
) -> Result<()> {
    hooks
        .pre_revprop_change(rev, name, value)
        .map_err(|message| FsError::HookRejected {
            hook: "pre-revprop-change",
            message,
        })
}

pub(crate) fn run_post_revprop_change(hooks: &dyn CommitHooks, rev: Revnum, name: &str) {
    if let Err(e) = hooks.post_revprop_change(rev, name) {
        tracing::warn!("post-revprop-change hook error for r{} (ignored): {}", rev, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{NodeRevId, TxnId};
    use crate::properties::PropertySet;
    use crate::txn::{TxnFlags, TxnState};

    struct RejectAll;

    impl CommitHooks for RejectAll {
        fn pre_commit(&self, _txn: &TxnRecord, _changes: &[PathChange]) -> std::result::Result<(), String> {
            Err("commits are frozen".into())
        }

        fn post_commit(&self, _rev: Revnum) -> std::result::Result<(), String> {
            Err("mailer down".into())
        }
    }

    fn record() -> TxnRecord {
        TxnRecord {
            id: TxnId(1),
            base_rev: 0,
            state: TxnState::Active,
            root_id: NodeRevId::root_of(0),
            base_root_id: NodeRevId::root_of(0),
            props: PropertySet::new(),
            flags: TxnFlags::default(),
            copies: Vec::new(),
        }
    }

    #[test]
    fn test_no_hooks_accepts() {
        assert!(run_pre_commit(&NoHooks, &record(), &[]).is_ok());
        assert!(run_pre_revprop_change(&NoHooks, 1, "svn:log", Some(b"msg")).is_ok());
    }

    #[test]
    fn test_rejection_becomes_hook_error() {
        match run_pre_commit(&RejectAll, &record(), &[]) {
            Err(FsError::HookRejected { hook, message }) => {
                assert_eq!(hook, "pre-commit");
                assert_eq!(message, "commits are frozen");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // post-commit failures are only logged
        run_post_commit(&RejectAll, 3);
    }
}

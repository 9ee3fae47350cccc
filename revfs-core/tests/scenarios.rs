//! End-to-end filesystem scenarios

use std::sync::Arc;
use std::thread;

use revfs_core::{
    AccessContext, CacheConfig, CancelToken, CommitHooks, Filesystem, FsConfig, FsError,
    LockRequest, NodeKind, PathChange, Revnum, TxnFlags, svn_props,
};
use revfs_core::txn::TxnRecord;
use tempfile::TempDir;

fn config(shard_size: u64) -> FsConfig {
    FsConfig {
        cache: CacheConfig {
            shared: false,
            ..CacheConfig::default()
        },
        shard_size,
        ..FsConfig::default()
    }
}

fn create_fs(shard_size: u64) -> (TempDir, Filesystem) {
    let temp_dir = TempDir::new().unwrap();
    let fs = Filesystem::create(&temp_dir.path().join("repo"), &config(shard_size)).unwrap();
    (temp_dir, fs)
}

fn anonymous() -> AccessContext {
    AccessContext::anonymous()
}

fn never() -> CancelToken {
    CancelToken::never()
}

/// Incompressible test data
fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

fn commit_contents(fs: &Filesystem, path: &str, data: &[u8]) -> Revnum {
    let txn = fs.begin_txn(fs.youngest_rev().unwrap(), TxnFlags::default()).unwrap();
    let root = txn.root();
    if root.check_path(path).unwrap().is_none() {
        root.make_file(path).unwrap();
    }
    root.set_file_contents(path, data).unwrap();
    txn.commit(&anonymous(), &never()).unwrap()
}

/// Revision 1: /A and /A/foo = "hello"
fn seed(fs: &Filesystem) {
    let txn = fs.begin_txn(0, TxnFlags::default()).unwrap();
    let root = txn.root();
    root.make_dir("/A").unwrap();
    root.make_file("/A/foo").unwrap();
    root.set_file_contents("/A/foo", b"hello").unwrap();
    assert_eq!(txn.commit(&anonymous(), &never()).unwrap(), 1);
}

#[test]
fn test_first_commit() {
    let (_temp_dir, fs) = create_fs(1000);
    assert_eq!(fs.youngest_rev().unwrap(), 0);
    seed(&fs);
    assert_eq!(fs.youngest_rev().unwrap(), 1);
    let root = fs.revision_root(1).unwrap();
    assert_eq!(&root.file_contents("/A/foo").unwrap()[..], b"hello");
    assert_eq!(root.check_path("/A").unwrap(), Some(NodeKind::Dir));
    assert_eq!(root.dir_entries("/A").unwrap(), vec![("foo".to_string(), NodeKind::File)]);
    assert_eq!(root.file_length("/A/foo").unwrap(), 5);
}

#[test]
fn test_old_revisions_are_immutable() {
    let (_temp_dir, fs) = create_fs(1000);
    seed(&fs);
    let txn = fs.begin_txn(1, TxnFlags::default()).unwrap();
    txn.root().set_file_contents("/A/foo", b"hello world").unwrap();

    // uncommitted edits are invisible through the base revision
    let r1 = fs.revision_root(1).unwrap();
    assert_eq!(&r1.file_contents("/A/foo").unwrap()[..], b"hello");
    assert_eq!(&txn.root().file_contents("/A/foo").unwrap()[..], b"hello world");

    assert_eq!(txn.commit(&anonymous(), &never()).unwrap(), 2);
    assert_eq!(&r1.file_contents("/A/foo").unwrap()[..], b"hello");
    assert_eq!(
        &fs.revision_root(2).unwrap().file_contents("/A/foo").unwrap()[..],
        b"hello world"
    );
    assert!(!r1.is_txn_root());
    assert!(matches!(r1.make_file("/x"), Err(FsError::NotTxnRoot)));
}

#[test]
fn test_concurrent_edit_of_same_file_conflicts() {
    let (_temp_dir, fs) = create_fs(1000);
    seed(&fs);
    let t1 = fs.begin_txn(1, TxnFlags::default()).unwrap();
    let t2 = fs.begin_txn(1, TxnFlags::default()).unwrap();
    t1.root().set_file_contents("/A/foo", b"x").unwrap();
    assert_eq!(t1.commit(&anonymous(), &never()).unwrap(), 2);
    t2.root().set_file_contents("/A/foo", b"y").unwrap();
    match t2.commit(&anonymous(), &never()) {
        Err(FsError::Conflict(path)) => assert_eq!(path, "/A/foo"),
        other => panic!("expected conflict, got {:?}", other),
    }
    assert_eq!(fs.youngest_rev().unwrap(), 2);
    assert_eq!(&fs.head_root().unwrap().file_contents("/A/foo").unwrap()[..], b"x");
}

#[test]
fn test_locked_file_requires_token() {
    let (_temp_dir, fs) = create_fs(1000);
    seed(&fs);
    let alice = AccessContext::new("alice");
    fs.lock("/A/foo", LockRequest::default(), &alice).unwrap();
    let lock = fs.get_lock("/A/foo").unwrap().unwrap();
    assert_eq!(lock.owner, "alice");
    assert!(lock.expiration_date.is_none());

    let flags = TxnFlags {
        check_locks: true,
        ..TxnFlags::default()
    };
    let txn = fs.begin_txn(1, flags).unwrap();
    txn.root().set_file_contents("/A/foo", b"locked edit").unwrap();
    assert!(matches!(
        txn.commit(&alice, &never()),
        Err(FsError::LockedPath { path, .. }) if path == "/A/foo"
    ));
    assert_eq!(fs.youngest_rev().unwrap(), 1);

    let with_token = alice.clone().with_token(lock.token.clone());
    assert_eq!(txn.commit(&with_token, &never()).unwrap(), 2);
    assert_eq!(
        &fs.head_root().unwrap().file_contents("/A/foo").unwrap()[..],
        b"locked edit"
    );
}

#[test]
fn test_deleting_locked_subtree_is_checked() {
    let (_temp_dir, fs) = create_fs(1000);
    seed(&fs);
    let alice = AccessContext::new("alice");
    let lock = fs.lock("/A/foo", LockRequest::default(), &alice).unwrap();
    let flags = TxnFlags {
        check_locks: true,
        ..TxnFlags::default()
    };
    let txn = fs.begin_txn(1, flags).unwrap();
    txn.root().delete("/A").unwrap();
    assert!(matches!(
        txn.commit(&AccessContext::new("bob"), &never()),
        Err(FsError::LockedPath { .. })
    ));
    assert_eq!(txn.commit(&alice.with_token(lock.token), &never()).unwrap(), 2);
    assert_eq!(fs.head_root().unwrap().check_path("/A").unwrap(), None);
}

#[test]
fn test_copy_shares_representations() {
    let (_temp_dir, fs) = create_fs(1000);
    let big = noise(100 * 1024, 7);
    let txn = fs.begin_txn(0, TxnFlags::default()).unwrap();
    let root = txn.root();
    root.make_dir("/A").unwrap();
    root.make_file("/A/foo").unwrap();
    root.set_file_contents("/A/foo", &big).unwrap();
    txn.commit(&anonymous(), &never()).unwrap();

    let r1 = fs.revision_root(1).unwrap();
    let txn = fs.begin_txn(1, TxnFlags::default()).unwrap();
    txn.root().copy(&r1, "/A", "/B").unwrap();
    let rev = txn.commit(&anonymous(), &never()).unwrap();

    let head = fs.revision_root(rev).unwrap();
    assert_eq!(&head.file_contents("/B/foo").unwrap()[..], &big[..]);
    let original = r1.open_path("/A/foo").unwrap().node_revision().data_rep;
    let copied = head.open_path("/B/foo").unwrap().node_revision().data_rep;
    assert_eq!(original, copied);

    let rev_file = fs.path().join("revs").join("0").join(rev.to_string());
    let size = std::fs::metadata(rev_file).unwrap().len();
    assert!(size < 8 * 1024, "copy revision is {} bytes", size);

    let copy = head.copied_from("/B").unwrap().unwrap();
    assert_eq!((copy.path.as_str(), copy.revision), ("/A", 1));
    let changes: Vec<PathChange> = head.paths_changed().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].path, "/B");
    assert_eq!(changes[0].copy_from.as_ref().unwrap().revision, 1);
}

#[test]
fn test_identical_content_is_stored_once() {
    let (_temp_dir, fs) = create_fs(1000);
    let data = noise(64 * 1024, 11);
    let txn = fs.begin_txn(0, TxnFlags::default()).unwrap();
    let root = txn.root();
    for path in ["/one", "/two"] {
        root.make_file(path).unwrap();
        root.set_file_contents(path, &data).unwrap();
    }
    let rev = txn.commit(&anonymous(), &never()).unwrap();

    let head = fs.revision_root(rev).unwrap();
    let one = head.open_path("/one").unwrap().node_revision().data_rep;
    let two = head.open_path("/two").unwrap().node_revision().data_rep;
    assert_eq!(one, two);
    let rev_file = fs.path().join("revs").join("0").join(rev.to_string());
    assert!(std::fs::metadata(rev_file).unwrap().len() < 96 * 1024);

    // a later revision reuses it through the representation cache
    let later = commit_contents(&fs, "/three", &data);
    let three = fs
        .revision_root(later)
        .unwrap()
        .open_path("/three")
        .unwrap()
        .node_revision()
        .data_rep;
    assert_eq!(three, one);
}

#[test]
fn test_packing_is_transparent() {
    let (_temp_dir, fs) = create_fs(11);
    let mut expected = Vec::new();
    for rev in 1..=10u64 {
        let data = format!("revision {} of the file\n", rev).repeat(rev as usize * 10);
        assert_eq!(commit_contents(&fs, "/file", data.as_bytes()), rev);
        expected.push(data);
    }
    for (i, data) in expected.iter().enumerate() {
        let root = fs.revision_root(i as u64 + 1).unwrap();
        assert_eq!(&root.file_contents("/file").unwrap()[..], data.as_bytes());
    }

    assert_eq!(fs.pack(&never()).unwrap(), vec![0]);
    assert!(fs.path().join("revs").join("0.pack").exists());
    assert!(!fs.path().join("revs").join("0").exists());

    for (i, data) in expected.iter().enumerate() {
        let root = fs.revision_root(i as u64 + 1).unwrap();
        assert_eq!(&root.file_contents("/file").unwrap()[..], data.as_bytes());
    }
    // a reopened handle sees the same thing
    let reopened = Filesystem::open(fs.path()).unwrap();
    let root = reopened.revision_root(5).unwrap();
    assert_eq!(&root.file_contents("/file").unwrap()[..], expected[4].as_bytes());
    assert!(fs.verify(0, 10, &never()).unwrap().is_ok());
}

#[test]
fn test_commits_continue_after_packing() {
    let (_temp_dir, fs) = create_fs(4);
    for rev in 1..=5u64 {
        commit_contents(&fs, "/f", format!("v{}", rev).as_bytes());
    }
    assert_eq!(fs.pack(&never()).unwrap(), vec![0]);
    assert!(fs.pack(&never()).unwrap().is_empty());
    for rev in 6..=9u64 {
        commit_contents(&fs, "/f", format!("v{}", rev).as_bytes());
    }
    assert_eq!(fs.pack(&never()).unwrap(), vec![1]);
    for rev in 1..=9u64 {
        let root = fs.revision_root(rev).unwrap();
        assert_eq!(
            &root.file_contents("/f").unwrap()[..],
            format!("v{}", rev).as_bytes()
        );
    }
    assert!(fs.verify(0, 9, &never()).unwrap().is_ok());
}

#[test]
fn test_parallel_commits_to_disjoint_paths() {
    let (_temp_dir, fs) = create_fs(1000);
    let handles: Vec<_> = (0..6)
        .map(|i| {
            let fs = fs.clone();
            thread::spawn(move || {
                let txn = fs.begin_txn(0, TxnFlags::default()).unwrap();
                let path = format!("/file{}", i);
                txn.root().make_file(&path).unwrap();
                txn.root()
                    .set_file_contents(&path, format!("thread {}", i).as_bytes())
                    .unwrap();
                txn.commit(&AccessContext::anonymous(), &CancelToken::never())
                    .unwrap()
            })
        })
        .collect();
    let mut revs: Vec<Revnum> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    revs.sort();
    assert_eq!(revs, (1..=6).collect::<Vec<_>>());

    let head = fs.head_root().unwrap();
    for i in 0..6 {
        assert_eq!(
            &head.file_contents(&format!("/file{}", i)).unwrap()[..],
            format!("thread {}", i).as_bytes()
        );
    }
}

#[test]
fn test_history_follows_copies() {
    let (_temp_dir, fs) = create_fs(1000);
    seed(&fs);
    commit_contents(&fs, "/A/foo", b"second");

    let r2 = fs.revision_root(2).unwrap();
    let txn = fs.begin_txn(2, TxnFlags::default()).unwrap();
    txn.root().copy(&r2, "/A/foo", "/C").unwrap();
    assert_eq!(txn.commit(&anonymous(), &never()).unwrap(), 3);
    commit_contents(&fs, "/C", b"fourth");

    let head = fs.revision_root(4).unwrap();
    let full: Vec<(String, Revnum)> = head
        .node_history("/C", false, &never())
        .unwrap()
        .into_iter()
        .map(|h| (h.path, h.revision))
        .collect();
    assert_eq!(
        full,
        vec![
            ("/C".to_string(), 4),
            ("/C".to_string(), 3),
            ("/A/foo".to_string(), 2),
            ("/A/foo".to_string(), 1),
        ]
    );
    let short = head.node_history("/C", true, &never()).unwrap();
    assert_eq!(short.len(), 2);
    assert_eq!(short[1].revision, 3);

    // the copy is related to its source
    let source_id = fs.revision_root(2).unwrap().node_id("/A/foo").unwrap();
    assert!(head.node_id("/C").unwrap().is_related(&source_id));
}

#[test]
fn test_out_of_date_edit_is_rejected() {
    let (_temp_dir, fs) = create_fs(1000);
    seed(&fs);
    let flags = TxnFlags {
        check_out_of_date: true,
        ..TxnFlags::default()
    };
    let stale = fs.begin_txn(1, flags).unwrap();
    commit_contents(&fs, "/A/foo", b"newer");
    assert!(matches!(
        stale.root().set_file_contents("/A/foo", b"older"),
        Err(FsError::OutOfDate { .. })
    ));
    // unrelated paths are still editable
    stale.root().make_file("/A/bar").unwrap();
}

#[test]
fn test_delete_and_replace() {
    let (_temp_dir, fs) = create_fs(1000);
    seed(&fs);
    let txn = fs.begin_txn(1, TxnFlags::default()).unwrap();
    let root = txn.root();
    root.delete("/A/foo").unwrap();
    root.make_dir("/A/foo").unwrap();
    assert!(matches!(root.delete("/"), Err(FsError::InvalidPath(_))));
    assert!(matches!(root.delete("/nope"), Err(FsError::NotFound(_))));
    let rev = txn.commit(&anonymous(), &never()).unwrap();

    let head = fs.revision_root(rev).unwrap();
    assert_eq!(head.check_path("/A/foo").unwrap(), Some(NodeKind::Dir));
    let changes = head.paths_changed().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].kind.code(), 'R');
    assert_eq!(
        &fs.revision_root(1).unwrap().file_contents("/A/foo").unwrap()[..],
        b"hello"
    );
}

#[test]
fn test_node_properties() {
    let (_temp_dir, fs) = create_fs(1000);
    seed(&fs);
    let txn = fs.begin_txn(1, TxnFlags::default()).unwrap();
    txn.root()
        .set_node_prop("/A/foo", svn_props::MIME_TYPE, Some(b"text/plain"))
        .unwrap();
    txn.root().set_node_prop("/A", "owner", Some(b"team")).unwrap();
    let rev = txn.commit(&anonymous(), &never()).unwrap();

    let head = fs.revision_root(rev).unwrap();
    assert_eq!(
        head.node_prop("/A/foo", svn_props::MIME_TYPE).unwrap(),
        Some(b"text/plain".to_vec())
    );
    let r1 = fs.revision_root(1).unwrap();
    assert!(head.props_changed("/A", &r1, "/A").unwrap());
    assert!(!head.contents_changed("/A/foo", &r1, "/A/foo").unwrap());

    let txn = fs.begin_txn(rev, TxnFlags::default()).unwrap();
    txn.root().set_node_prop("/A", "owner", None).unwrap();
    let rev = txn.commit(&anonymous(), &never()).unwrap();
    assert!(fs.revision_root(rev).unwrap().node_proplist("/A").unwrap().is_empty());
}

struct Frozen;

impl CommitHooks for Frozen {
    fn pre_commit(&self, _txn: &TxnRecord, changes: &[PathChange]) -> Result<(), String> {
        if changes.iter().any(|c| c.path.starts_with("/frozen")) {
            Err("frozen area".into())
        } else {
            Ok(())
        }
    }

    fn pre_revprop_change(&self, _rev: Revnum, name: &str, _value: Option<&[u8]>) -> Result<(), String> {
        if name == svn_props::AUTHOR {
            Err("authors are permanent".into())
        } else {
            Ok(())
        }
    }
}

#[test]
fn test_hooks_can_veto() {
    let (_temp_dir, fs) = create_fs(1000);
    fs.set_hooks(Arc::new(Frozen));
    let txn = fs.begin_txn(0, TxnFlags::default()).unwrap();
    txn.root().make_dir("/frozen").unwrap();
    assert!(matches!(
        txn.commit(&anonymous(), &never()),
        Err(FsError::HookRejected { hook: "pre-commit", .. })
    ));
    assert_eq!(fs.youngest_rev().unwrap(), 0);
    assert_eq!(fs.list_transactions().unwrap(), vec![txn.id()]);
    txn.abort().unwrap();

    assert!(matches!(
        fs.change_rev_prop(0, svn_props::AUTHOR, Some(b"mallory"), None),
        Err(FsError::HookRejected { hook: "pre-revprop-change", .. })
    ));
    fs.change_rev_prop(0, svn_props::LOG, Some(b"initial"), None).unwrap();
}

#[test]
fn test_cancelled_commit_leaves_no_revision() {
    let (_temp_dir, fs) = create_fs(1000);
    let txn = fs.begin_txn(0, TxnFlags::default()).unwrap();
    txn.root().make_file("/f").unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    assert!(matches!(txn.commit(&anonymous(), &cancel), Err(FsError::Cancelled)));
    assert_eq!(fs.youngest_rev().unwrap(), 0);
    assert!(fs.list_transactions().unwrap().is_empty());
}

#[test]
fn test_committed_transaction_is_gone() {
    let (_temp_dir, fs) = create_fs(1000);
    let txn = fs.begin_txn(0, TxnFlags::default()).unwrap();
    txn.root().make_file("/f").unwrap();
    txn.commit(&anonymous(), &never()).unwrap();
    assert!(matches!(
        txn.root().make_file("/g"),
        Err(FsError::NoSuchTransaction(_))
    ));
    assert!(matches!(
        fs.revision_root(5),
        Err(FsError::NoSuchRevision(5))
    ));
}

#[test]
fn test_verify_and_repair() {
    let (_temp_dir, fs) = create_fs(1000);
    seed(&fs);
    commit_contents(&fs, "/A/foo", b"hello again");
    let report = fs.verify(0, 2, &never()).unwrap();
    assert!(report.is_ok());
    assert_eq!(report.revisions_checked, 3);
    assert!(fs.rebuild_index(2).unwrap() > 0);
    assert_eq!(fs.recover().unwrap(), 2);
    assert!(fs.verify(0, 2, &never()).unwrap().is_ok());
    let stats = fs.cache_stats();
    assert!(stats.iter().any(|(name, _)| *name == "fulltexts"));
}

fn copy_tree(from: &std::path::Path, to: &std::path::Path) {
    std::fs::create_dir_all(to).unwrap();
    for entry in std::fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_tree(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), &target).unwrap();
        }
    }
}

#[test]
fn test_copied_filesystems_stay_separate() {
    let temp_dir = TempDir::new().unwrap();
    let here = temp_dir.path().join("here");
    let backup = temp_dir.path().join("backup");
    {
        let fs = Filesystem::create(&here, &FsConfig::default()).unwrap();
        assert!(fs.config().cache.shared);
        commit_contents(&fs, "/f", b"original");
    }
    copy_tree(&here, &backup);

    let a = Filesystem::open(&here).unwrap();
    let b = Filesystem::open(&backup).unwrap();
    assert_eq!(a.uuid(), b.uuid());
    assert_eq!(commit_contents(&a, "/f", b"from here"), 2);
    assert_eq!(commit_contents(&b, "/f", b"from backup"), 2);
    assert_eq!(&a.revision_root(2).unwrap().file_contents("/f").unwrap()[..], b"from here");
    assert_eq!(&b.revision_root(2).unwrap().file_contents("/f").unwrap()[..], b"from backup");

    // a second handle on the same filesystem is not a different filesystem
    let again = Filesystem::open(&here).unwrap();
    let txn = a.begin_txn(2, TxnFlags::default()).unwrap();
    txn.root().copy(&again.revision_root(2).unwrap(), "/f", "/g").unwrap();

    let txn = b.begin_txn(2, TxnFlags::default()).unwrap();
    let err = txn.root().copy(&a.revision_root(2).unwrap(), "/f", "/g").unwrap_err();
    assert!(matches!(err, FsError::CrossFilesystem));
    let err = txn
        .root()
        .contents_changed("/f", &a.revision_root(2).unwrap(), "/f")
        .unwrap_err();
    assert!(matches!(err, FsError::CrossFilesystem));
}

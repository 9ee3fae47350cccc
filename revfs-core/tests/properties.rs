//! Property tests over stored contents and revision history

use proptest::prelude::*;
use revfs_core::{
    AccessContext, CacheConfig, CancelToken, DeltificationConfig, Filesystem, FsConfig, TxnFlags,
};
use tempfile::TempDir;

fn create_fs(deltify: bool) -> (TempDir, Filesystem) {
    let temp_dir = TempDir::new().unwrap();
    let config = FsConfig {
        cache: CacheConfig {
            shared: false,
            ..CacheConfig::default()
        },
        deltification: DeltificationConfig {
            enabled: deltify,
            ..DeltificationConfig::default()
        },
        ..FsConfig::default()
    };
    let fs = Filesystem::create(&temp_dir.path().join("repo"), &config).unwrap();
    (temp_dir, fs)
}

fn commit(fs: &Filesystem, data: &[u8]) -> u64 {
    let txn = fs.begin_txn(fs.youngest_rev().unwrap(), TxnFlags::default()).unwrap();
    let root = txn.root();
    if root.check_path("/file").unwrap().is_none() {
        root.make_file("/file").unwrap();
    }
    root.set_file_contents("/file", data).unwrap();
    txn.commit(&AccessContext::anonymous(), &CancelToken::never())
        .unwrap()
}

/// A base text followed by edited versions of it, so deltas get used
fn versions() -> impl Strategy<Value = Vec<Vec<u8>>> {
    (
        prop::collection::vec(any::<u8>(), 0..4096),
        prop::collection::vec((any::<usize>(), prop::collection::vec(any::<u8>(), 0..64)), 1..6),
    )
        .prop_map(|(base, edits)| {
            let mut out = vec![base.clone()];
            let mut current = base;
            for (at, insert) in edits {
                let at = if current.is_empty() { 0 } else { at % current.len() };
                let cut = (at + insert.len()).min(current.len());
                current.splice(at..cut, insert);
                out.push(current.clone());
            }
            out
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_every_revision_reads_back(texts in versions(), deltify in any::<bool>()) {
        let (_temp_dir, fs) = create_fs(deltify);
        let revs: Vec<u64> = texts.iter().map(|t| commit(&fs, t)).collect();
        for (rev, text) in revs.iter().zip(&texts) {
            let root = fs.revision_root(*rev).unwrap();
            prop_assert_eq!(&root.file_contents("/file").unwrap()[..], &text[..]);
            prop_assert_eq!(root.file_length("/file").unwrap(), text.len() as u64);
        }
        prop_assert!(fs.verify(0, fs.youngest_rev().unwrap(), &CancelToken::never()).unwrap().is_ok());
    }

    #[test]
    fn prop_history_is_finite_and_ordered(texts in versions()) {
        let (_temp_dir, fs) = create_fs(true);
        for text in &texts {
            commit(&fs, text);
        }
        let head = fs.head_root().unwrap();
        let history = head.node_history("/file", false, &CancelToken::never()).unwrap();
        prop_assert_eq!(history.len(), texts.len());
        prop_assert!(history.windows(2).all(|w| w[0].revision > w[1].revision));
    }
}

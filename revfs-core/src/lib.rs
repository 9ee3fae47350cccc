//! revfs Core Library
//!
//! A revision-oriented versioned filesystem:
//! - Immutable revisions and copy-on-write transactions over a node DAG
//! - Delta-encoded, deduplicated representations
//! - Revision containers with logical (L2P) and physical (P2L) indexes
//! - Sharded packing of old revisions
//! - Path locks stored in SQLite (WAL mode)
//! - Commit with conflict detection, merge and retry
//! - Verification and index repair

pub mod cache;
pub mod cancel;
pub mod commit;
pub mod config;
pub mod dag;
pub mod delta;
pub mod disk_store;
pub mod error;
pub mod fs;
pub mod hooks;
pub mod id;
pub mod index;
pub mod lock;
pub mod object;
pub mod packfile;
pub mod path;
pub mod properties;
pub mod rep_cache;
pub mod revision;
pub mod storage;
pub mod tree;
pub mod txn;
pub mod util;
pub mod verify;

pub use cache::CacheStats;
pub use cancel::CancelToken;
pub use config::{CacheConfig, DeltificationConfig, FsConfig, FsMetadata};
pub use error::{FsError, Result};
pub use fs::{Filesystem, Transaction};
pub use hooks::{CommitHooks, NoHooks};
pub use id::{ChangeSet, IdPart, NodeRevId, Revnum, TxnId};
pub use lock::{AccessContext, Lock, LockRequest};
pub use object::{ChangeKind, Checksum, CopySource, NodeKind, PathChange};
pub use properties::{PropertySet, PropertyValue, svn_props};
pub use tree::{HistoryEntry, Root, RootKind};
pub use txn::{TxnFlags, TxnState};
pub use verify::{VerifyIssue, VerifyReport};

//! Error taxonomy for the filesystem engine

use std::path::PathBuf;

use crate::id::{Revnum, TxnId};

/// Result type for filesystem operations
pub type Result<T> = std::result::Result<T, FsError>;

/// Errors that can occur during filesystem operations
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("path not found: {0}")]
    NotFound(String),

    #[error("no such revision: {0}")]
    NoSuchRevision(Revnum),

    #[error("no such transaction: {0}")]
    NoSuchTransaction(TxnId),

    #[error("transaction {0} is not active")]
    TransactionNotMutable(TxnId),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("path already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("operation requires a transaction root")]
    NotTxnRoot,

    #[error("operation requires a revision root")]
    NotRevisionRoot,

    #[error("conflict at {0}")]
    Conflict(String),

    #[error("path {path} is locked: {reason}")]
    LockedPath { path: String, reason: String },

    #[error("path {path} is already locked by {owner}")]
    PathLocked { path: String, owner: String },

    #[error("lock token does not match lock on {0}")]
    BadToken(String),

    #[error("no lock on {0}")]
    NoSuchLock(String),

    #[error("user {user} does not own lock on {path} (owner: {owner})")]
    LockOwnerMismatch {
        path: String,
        user: String,
        owner: String,
    },

    #[error("no username available in access context")]
    NoUser,

    #[error("{path} is out of date: {detail}")]
    OutOfDate { path: String, detail: String },

    #[error("value of property {name} on r{revision} changed unexpectedly")]
    PropChangedUnexpectedly { revision: Revnum, name: String },

    #[error("{hook} hook rejected the operation: {message}")]
    HookRejected { hook: &'static str, message: String },

    #[error("corrupt filesystem data: {0}")]
    Corruption(String),

    #[error("corrupt index: {0}")]
    IndexCorruption(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("delta chain exceeds {limit} links")]
    ChainTooDeep { limit: u32 },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("roots belong to different filesystems")]
    CrossFilesystem,
}

impl FsError {
    /// Integrity failures that a verify/repair pass should look at
    pub fn is_corruption(&self) -> bool {
        matches!(self, FsError::Corruption(_) | FsError::IndexCorruption(_))
    }

    pub fn is_lock_error(&self) -> bool {
        matches!(
            self,
            FsError::LockedPath { .. }
                | FsError::PathLocked { .. }
                | FsError::BadToken(_)
                | FsError::NoSuchLock(_)
                | FsError::LockOwnerMismatch { .. }
                | FsError::OutOfDate { .. }
        )
    }

    pub(crate) fn corrupt(what: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        FsError::Corruption(format!("{}: {}", what, err))
    }
}

impl From<rusqlite::Error> for FsError {
    fn from(e: rusqlite::Error) -> Self {
        FsError::Database(e.to_string())
    }
}

pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| FsError::Io {
            path: path.into(),
            source,
        })
    }
}

//! Path locks
//!
//! Locks live in `locks.db`, one row per locked path. Expired locks are
//! treated as absent and deleted the next time they are looked at; there
//! is no background sweep. Enumerating the locks below a directory is a
//! range scan on the primary key: every path below `/A` sorts between
//! `/A/` and `/A0`.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{FsError, Result};
use crate::id::Revnum;

pub const LOCKS_FILE: &str = "locks.db";
pub const TOKEN_PREFIX: &str = "opaquelocktoken:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub path: String,
    pub token: String,
    pub owner: String,
    pub comment: Option<String>,
    pub creation_date: DateTime<Utc>,
    pub expiration_date: Option<DateTime<Utc>>,
}

impl Lock {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiration_date, Some(expires) if expires <= now)
    }
}

/// Parameters of a lock request
#[derive(Debug, Clone, Default)]
pub struct LockRequest {
    /// Token to use; generated when `None`
    pub token: Option<String>,
    pub comment: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
    /// Revision of the file the caller has seen
    pub current_rev: Option<Revnum>,
    /// Take over an existing lock
    pub steal: bool,
}

/// Who is acting and which lock tokens they hold
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessContext {
    pub username: Option<String>,
    pub tokens: HashSet<String>,
}

impl AccessContext {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            tokens: HashSet::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.tokens.insert(token.into());
        self
    }

    pub fn add_token(&mut self, token: impl Into<String>) {
        self.tokens.insert(token.into());
    }
}

pub fn generate_token() -> String {
    format!("{}{}", TOKEN_PREFIX, uuid::Uuid::new_v4())
}

type LockRow = (String, String, String, Option<String>, String, Option<String>);

fn parse_time(path: &str, text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| FsError::corrupt(format!("lock on {}", path), e))
}

fn lock_from_row(row: LockRow) -> Result<Lock> {
    let (path, token, owner, comment, created, expires) = row;
    let creation_date = parse_time(&path, &created)?;
    let expiration_date = expires.map(|t| parse_time(&path, &t)).transpose()?;
    Ok(Lock {
        path,
        token,
        owner,
        comment,
        creation_date,
        expiration_date,
    })
}

fn read_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<LockRow> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
}

pub struct LockTable {
    conn: Mutex<Connection>,
}

impl LockTable {
    pub fn open(fs_path: &Path) -> Result<Self> {
        let conn = Connection::open(fs_path.join(LOCKS_FILE))?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS locks (
                path TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                owner TEXT NOT NULL,
                comment TEXT,
                created TEXT NOT NULL,
                expires TEXT
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Live lock on exactly `path`
    pub fn get(&self, path: &str) -> Result<Option<Lock>> {
        let row = self
            .conn()
            .query_row(
                "SELECT path, token, owner, comment, created, expires FROM locks WHERE path = ?1",
                rusqlite::params![path],
                read_row,
            )
            .optional()?;
        let Some(lock) = row.map(lock_from_row).transpose()? else {
            return Ok(None);
        };
        if lock.is_expired_at(Utc::now()) {
            tracing::debug!("lock on {} expired; removing", path);
            self.remove(path)?;
            return Ok(None);
        }
        Ok(Some(lock))
    }

    /// Insert or replace the lock on `lock.path`
    pub fn put(&self, lock: &Lock) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO locks (path, token, owner, comment, created, expires)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                lock.path,
                lock.token,
                lock.owner,
                lock.comment,
                lock.creation_date.to_rfc3339(),
                lock.expiration_date.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Delete the row for `path`; returns whether one existed
    pub fn remove(&self, path: &str) -> Result<bool> {
        let removed = self
            .conn()
            .execute("DELETE FROM locks WHERE path = ?1", rusqlite::params![path])?;
        Ok(removed > 0)
    }

    /// Live locks on `path` and everything below it, ordered by path
    pub fn locks_under(&self, path: &str, cancel: &CancelToken) -> Result<Vec<Lock>> {
        let rows: Vec<LockRow> = {
            let conn = self.conn();
            if path == "/" {
                let mut stmt = conn.prepare(
                    "SELECT path, token, owner, comment, created, expires FROM locks ORDER BY path",
                )?;
                stmt.query_map([], read_row)?
                    .collect::<rusqlite::Result<_>>()?
            } else {
                let mut stmt = conn.prepare(
                    "SELECT path, token, owner, comment, created, expires FROM locks
                     WHERE path = ?1 OR (path >= ?2 AND path < ?3) ORDER BY path",
                )?;
                stmt.query_map(
                    rusqlite::params![path, format!("{}/", path), format!("{}0", path)],
                    read_row,
                )?
                .collect::<rusqlite::Result<_>>()?
            }
        };

        let now = Utc::now();
        let mut locks = Vec::with_capacity(rows.len());
        for row in rows {
            cancel.check()?;
            let lock = lock_from_row(row)?;
            if lock.is_expired_at(now) {
                self.remove(&lock.path)?;
            } else {
                locks.push(lock);
            }
        }
        Ok(locks)
    }

    /// Check that `access` may change `path` (and with `recursive`,
    /// everything below it) despite any locks there
    pub fn allow_locked_operation(
        &self,
        path: &str,
        recursive: bool,
        access: &AccessContext,
        cancel: &CancelToken,
    ) -> Result<()> {
        let locks = if recursive {
            self.locks_under(path, cancel)?
        } else {
            self.get(path)?.into_iter().collect()
        };
        for lock in locks {
            let Some(user) = &access.username else {
                return Err(FsError::LockedPath {
                    path: lock.path,
                    reason: "no username supplied".into(),
                });
            };
            if *user != lock.owner {
                return Err(FsError::LockedPath {
                    reason: format!("locked by {}", lock.owner),
                    path: lock.path,
                });
            }
            if !access.tokens.contains(&lock.token) {
                return Err(FsError::LockedPath {
                    path: lock.path,
                    reason: "lock token not supplied".into(),
                });
            }
        }
        Ok(())
    }
}

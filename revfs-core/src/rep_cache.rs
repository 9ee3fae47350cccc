//! Representation sharing table
//!
//! Maps the checksum of committed content to the representation that
//! already holds it, so identical content is stored once. Rows are only
//! added after the owning revision is published.

use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{FsError, Result};
use crate::id::Revnum;
use crate::object::{Checksum, Representation};

pub const REP_CACHE_FILE: &str = "rep-cache.db";

pub struct RepCache {
    conn: Mutex<Connection>,
}

impl RepCache {
    pub fn open(fs_path: &Path) -> Result<Self> {
        let conn = Connection::open(fs_path.join(REP_CACHE_FILE))?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rep_cache (
                checksum TEXT PRIMARY KEY,
                revision INTEGER NOT NULL,
                rep BLOB NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up a shareable representation. Rows naming revisions newer than
    /// `youngest` belong to an unfinished commit and are ignored.
    pub fn get(&self, checksum: &Checksum, youngest: Revnum) -> Result<Option<Representation>> {
        let row: Option<(i64, Vec<u8>)> = self
            .conn()
            .query_row(
                "SELECT revision, rep FROM rep_cache WHERE checksum = ?1",
                rusqlite::params![checksum.to_hex()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((revision, blob)) = row else {
            return Ok(None);
        };
        if revision as u64 > youngest {
            tracing::warn!(
                "rep-cache row for {} names r{} beyond youngest r{}; ignoring",
                checksum,
                revision,
                youngest
            );
            return Ok(None);
        }
        let rep: Representation =
            bincode::deserialize(&blob).map_err(|e| FsError::corrupt("rep-cache row", e))?;
        if rep.checksum != *checksum {
            return Err(FsError::Corruption(format!(
                "rep-cache row {} holds representation with checksum {}",
                checksum, rep.checksum
            )));
        }
        Ok(Some(rep))
    }

    /// Record the representations written by `revision`
    pub fn insert_all(&self, revision: Revnum, reps: &[Representation]) -> Result<()> {
        if reps.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO rep_cache (checksum, revision, rep) VALUES (?1, ?2, ?3)",
            )?;
            for rep in reps {
                let blob = bincode::serialize(rep).map_err(|e| FsError::Serialization(e.to_string()))?;
                stmt.execute(rusqlite::params![rep.checksum.to_hex(), revision as i64, blob])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn len(&self) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM rep_cache", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

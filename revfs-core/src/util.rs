//! Small durable-file helpers shared by the stores

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use crate::error::{FsError, IoResultExt, Result};

/// Write `data` to a temporary sibling, fsync it and rename it over `path`.
///
/// Readers observe either the old or the new content, never a mix.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    {
        let mut file = File::create(&tmp).with_path(&tmp)?;
        file.write_all(data).with_path(&tmp)?;
        file.sync_all().with_path(&tmp)?;
    }
    fs::rename(&tmp, path).with_path(path)?;
    sync_parent(path)
}

/// Unique temporary name next to `path`
pub fn tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

/// Flush the directory entry of `path` so a rename survives a crash
pub fn sync_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        let dir = File::open(parent).with_path(parent)?;
        dir.sync_all().with_path(parent)?;
    }
    Ok(())
}

/// Read a file, mapping absence to `None`
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FsError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Parse a file holding a single decimal number
pub fn read_number(path: &Path) -> Result<u64> {
    let text = fs::read_to_string(path).with_path(path)?;
    text.trim()
        .parse()
        .map_err(|e| FsError::corrupt(path.display(), e))
}

pub fn write_number(path: &Path, value: u64) -> Result<()> {
    write_atomic(path, format!("{}\n", value).as_bytes())
}

/// Exclusive advisory lock on a file, released on drop
pub struct FileLock {
    #[allow(dead_code)]
    flock: Flock<File>,
}

impl FileLock {
    /// Block until the exclusive lock on `path` is acquired
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_path(path)?;
        let flock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            FsError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::from(errno),
            }
        })?;
        Ok(Self { flock })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("current");
        write_number(&path, 1).unwrap();
        write_number(&path, 42).unwrap();
        assert_eq!(read_number(&path).unwrap(), 42);
        // no temporaries left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_read_optional_missing() {
        let dir = TempDir::new().unwrap();
        assert!(read_optional(&dir.path().join("nope")).unwrap().is_none());
    }

    #[test]
    fn test_read_number_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("n");
        fs::write(&path, "abc").unwrap();
        assert!(matches!(read_number(&path), Err(FsError::Corruption(_))));
    }

    #[test]
    fn test_file_lock_reacquire_after_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("write-lock");
        let lock = FileLock::acquire(&path).unwrap();
        drop(lock);
        let _again = FileLock::acquire(&path).unwrap();
    }
}

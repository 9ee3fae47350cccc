//! Container files
//!
//! A container holds the items of one revision, or of a whole packed
//! shard, followed by its L2P and P2L indexes and a fixed-size footer:
//!
//! ```text
//! "RVFC" version:u32
//! item*      marker:u8 kind:u8 revision:u64 item:u64 len:u32 payload[len]
//! 0x1D       index marker
//! L2P        bincode
//! P2L        bincode
//! footer     data_end:u64 l2p_len:u64 p2l_len:u64 sha256(L2P|P2L) "RVFX"
//! ```
//!
//! Item headers make the data self-describing: both indexes can be
//! rebuilt by scanning items from the start of the file.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::{FsError, IoResultExt, Result};
use crate::id::Revnum;
use crate::index::{IndexBuilder, ItemKind, L2pIndex, P2lEntry, P2lIndex};
use crate::object::Checksum;

pub const CONTAINER_MAGIC: &[u8; 4] = b"RVFC";
pub const CONTAINER_VERSION: u32 = 1;
const FOOTER_MAGIC: &[u8; 4] = b"RVFX";
const ITEM_MARKER: u8 = 0xA7;
const INDEX_MARKER: u8 = 0x1D;

pub const HEADER_LEN: u64 = 8;
pub const ITEM_HEADER_LEN: u64 = 22;
pub const FOOTER_LEN: u64 = 8 + 8 + 8 + 32 + 4;

/// Largest payload a single item may carry
pub const MAX_ITEM_LEN: u64 = u32::MAX as u64;

/// Self-describing header in front of every item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemHeader {
    pub kind: ItemKind,
    pub revision: Revnum,
    pub item: u64,
    pub len: u32,
}

impl ItemHeader {
    pub fn encode(&self) -> [u8; ITEM_HEADER_LEN as usize] {
        let mut buf = [0u8; ITEM_HEADER_LEN as usize];
        buf[0] = ITEM_MARKER;
        buf[1] = self.kind as u8;
        buf[2..10].copy_from_slice(&self.revision.to_le_bytes());
        buf[10..18].copy_from_slice(&self.item.to_le_bytes());
        buf[18..22].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < ITEM_HEADER_LEN as usize || buf[0] != ITEM_MARKER {
            return None;
        }
        Some(Self {
            kind: ItemKind::from_u8(buf[1])?,
            revision: u64::from_le_bytes(buf[2..10].try_into().ok()?),
            item: u64::from_le_bytes(buf[10..18].try_into().ok()?),
            len: u32::from_le_bytes(buf[18..22].try_into().ok()?),
        })
    }

    pub fn total_len(&self) -> u64 {
        ITEM_HEADER_LEN + self.len as u64
    }
}

/// Appends items to a new container file
pub struct ContainerWriter {
    file: BufWriter<File>,
    path: PathBuf,
    offset: u64,
    index: IndexBuilder,
}

impl ContainerWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        let file = File::create(path).with_path(path)?;
        let mut file = BufWriter::new(file);
        file.write_all(CONTAINER_MAGIC).with_path(path)?;
        file.write_all(&CONTAINER_VERSION.to_le_bytes()).with_path(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            offset: HEADER_LEN,
            index: IndexBuilder::new(),
        })
    }

    /// Append one item and record it in the index; returns its offset
    pub fn append(&mut self, kind: ItemKind, revision: Revnum, item: u64, payload: &[u8]) -> Result<u64> {
        if payload.len() as u64 > MAX_ITEM_LEN {
            return Err(FsError::ResourceExhausted(format!(
                "item of {} bytes exceeds container limit",
                payload.len()
            )));
        }
        let header = ItemHeader {
            kind,
            revision,
            item,
            len: payload.len() as u32,
        };
        let offset = self.offset;
        self.file.write_all(&header.encode()).with_path(&self.path)?;
        self.file.write_all(payload).with_path(&self.path)?;
        self.offset += header.total_len();
        self.index
            .record(revision, item, offset, header.total_len(), kind);
        Ok(offset)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn item_count(&self) -> usize {
        self.index.len()
    }

    /// Write both indexes and the footer, then fsync
    pub fn finish(mut self) -> Result<(L2pIndex, P2lIndex)> {
        let (l2p, p2l) = self.index.build()?;
        let l2p_bytes = bincode::serialize(&l2p).map_err(|e| FsError::Serialization(e.to_string()))?;
        let p2l_bytes = bincode::serialize(&p2l).map_err(|e| FsError::Serialization(e.to_string()))?;
        let mut indexes = l2p_bytes;
        let l2p_len = indexes.len() as u64;
        indexes.extend_from_slice(&p2l_bytes);
        let checksum = Checksum::from_data(&indexes);

        let path = self.path.clone();
        self.file.write_all(&[INDEX_MARKER]).with_path(&path)?;
        self.file.write_all(&indexes).with_path(&path)?;
        self.file.write_all(&self.offset.to_le_bytes()).with_path(&path)?;
        self.file.write_all(&l2p_len.to_le_bytes()).with_path(&path)?;
        self.file
            .write_all(&(p2l_bytes.len() as u64).to_le_bytes())
            .with_path(&path)?;
        self.file.write_all(checksum.as_bytes()).with_path(&path)?;
        self.file.write_all(FOOTER_MAGIC).with_path(&path)?;
        let file = self
            .file
            .into_inner()
            .map_err(|e| FsError::Io {
                path: path.clone(),
                source: e.into_error(),
            })?;
        file.sync_all().with_path(&path)?;
        Ok((l2p, p2l))
    }
}

/// Random-access reader over a finished container
#[derive(Debug)]
pub struct ContainerReader {
    file: File,
    path: PathBuf,
    l2p: L2pIndex,
    p2l: P2lIndex,
    data_end: u64,
}

impl ContainerReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_path(path)?;
        let len = file.metadata().with_path(path)?.len();
        if len < HEADER_LEN + FOOTER_LEN {
            return Err(FsError::IndexCorruption(format!(
                "{} is too short to be a container",
                path.display()
            )));
        }
        check_header(&file, path)?;

        let mut footer = [0u8; FOOTER_LEN as usize];
        file.read_exact_at(&mut footer, len - FOOTER_LEN).with_path(path)?;
        if &footer[56..60] != FOOTER_MAGIC {
            return Err(FsError::IndexCorruption(format!(
                "{} has no container footer",
                path.display()
            )));
        }
        let word = |i: usize| u64::from_le_bytes(footer[i * 8..i * 8 + 8].try_into().unwrap_or([0; 8]));
        let (data_end, l2p_len, p2l_len) = (word(0), word(1), word(2));
        let expected_len = l2p_len
            .checked_add(p2l_len)
            .and_then(|n| n.checked_add(data_end))
            .and_then(|n| n.checked_add(1 + FOOTER_LEN));
        if data_end < HEADER_LEN || expected_len != Some(len) {
            return Err(FsError::IndexCorruption(format!(
                "{} footer does not match file length",
                path.display()
            )));
        }
        let mut indexes = vec![0u8; (1 + l2p_len + p2l_len) as usize];
        file.read_exact_at(&mut indexes, data_end).with_path(path)?;
        if indexes[0] != INDEX_MARKER {
            return Err(FsError::IndexCorruption(format!(
                "{} has no index marker at {}",
                path.display(),
                data_end
            )));
        }
        let indexes = &indexes[1..];
        let mut expected = [0u8; 32];
        expected.copy_from_slice(&footer[24..56]);
        if Checksum::from_data(indexes) != Checksum::new(expected) {
            return Err(FsError::IndexCorruption(format!(
                "{} index checksum mismatch",
                path.display()
            )));
        }
        let l2p: L2pIndex = bincode::deserialize(&indexes[..l2p_len as usize])
            .map_err(|e| FsError::IndexCorruption(format!("{}: L2P: {}", path.display(), e)))?;
        let p2l: P2lIndex = bincode::deserialize(&indexes[l2p_len as usize..])
            .map_err(|e| FsError::IndexCorruption(format!("{}: P2L: {}", path.display(), e)))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            l2p,
            p2l,
            data_end,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn l2p(&self) -> &L2pIndex {
        &self.l2p
    }

    pub fn p2l(&self) -> &P2lIndex {
        &self.p2l
    }

    /// End of the item area
    pub fn data_end(&self) -> u64 {
        self.data_end
    }

    /// Read item `item` of `rev`, checking the header agrees with the index
    pub fn read_item(&self, rev: Revnum, item: u64) -> Result<(ItemHeader, Vec<u8>)> {
        let offset = self.l2p.resolve(rev, item)?;
        let header = self.read_header(offset)?;
        if header.revision != rev || header.item != item {
            return Err(FsError::IndexCorruption(format!(
                "{}: L2P maps r{}/{} to offset {} holding r{}/{}",
                self.path.display(),
                rev,
                item,
                offset,
                header.revision,
                header.item
            )));
        }
        let payload = self.read_payload(offset, &header)?;
        Ok((header, payload))
    }

    /// Read the header of the item starting at `offset`
    pub fn read_header(&self, offset: u64) -> Result<ItemHeader> {
        if offset + ITEM_HEADER_LEN > self.data_end {
            return Err(FsError::IndexCorruption(format!(
                "{}: offset {} beyond item area",
                self.path.display(),
                offset
            )));
        }
        let mut buf = [0u8; ITEM_HEADER_LEN as usize];
        self.file.read_exact_at(&mut buf, offset).with_path(&self.path)?;
        ItemHeader::decode(&buf).ok_or_else(|| {
            FsError::IndexCorruption(format!(
                "{}: no item header at offset {}",
                self.path.display(),
                offset
            ))
        })
    }

    /// Raw item bytes (header included) at a P2L entry
    pub fn read_raw(&self, entry: &P2lEntry) -> Result<Vec<u8>> {
        if entry.size < ITEM_HEADER_LEN {
            return Err(FsError::IndexCorruption(format!(
                "{}: item at {} is shorter than its header ({} bytes)",
                self.path.display(),
                entry.offset,
                entry.size
            )));
        }
        if entry.offset.checked_add(entry.size).is_none_or(|end| end > self.data_end) {
            return Err(FsError::IndexCorruption(format!(
                "{}: item at {} runs past item area",
                self.path.display(),
                entry.offset
            )));
        }
        let mut buf = vec![0u8; entry.size as usize];
        self.file.read_exact_at(&mut buf, entry.offset).with_path(&self.path)?;
        Ok(buf)
    }

    fn read_payload(&self, offset: u64, header: &ItemHeader) -> Result<Vec<u8>> {
        if offset + header.total_len() > self.data_end {
            return Err(FsError::Corruption(format!(
                "{}: item at {} runs past item area",
                self.path.display(),
                offset
            )));
        }
        let mut payload = vec![0u8; header.len as usize];
        self.file
            .read_exact_at(&mut payload, offset + ITEM_HEADER_LEN)
            .with_path(&self.path)?;
        Ok(payload)
    }
}

fn check_header(file: &File, path: &Path) -> Result<()> {
    let mut header = [0u8; HEADER_LEN as usize];
    file.read_exact_at(&mut header, 0).with_path(path)?;
    if &header[..4] != CONTAINER_MAGIC {
        return Err(FsError::Corruption(format!(
            "{} is not a container file",
            path.display()
        )));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != CONTAINER_VERSION {
        return Err(FsError::Corruption(format!(
            "{}: unknown container version {}",
            path.display(),
            version
        )));
    }
    Ok(())
}

/// Parse items sequentially from the start of a container, ignoring its
/// indexes. Stops at the first byte range that is not a valid item.
pub fn scan_items(path: &Path) -> Result<Vec<P2lEntry>> {
    let file = File::open(path).with_path(path)?;
    let len = file.metadata().with_path(path)?.len();
    check_header(&file, path)?;

    let mut entries = Vec::new();
    let mut offset = HEADER_LEN;
    let mut buf = [0u8; ITEM_HEADER_LEN as usize];
    while offset + ITEM_HEADER_LEN <= len {
        file.read_exact_at(&mut buf, offset).with_path(path)?;
        let Some(header) = ItemHeader::decode(&buf) else {
            break;
        };
        if offset + header.total_len() > len {
            break;
        }
        entries.push(P2lEntry {
            offset,
            size: header.total_len(),
            kind: header.kind,
            revision: header.revision,
            item: header.item,
        });
        offset += header.total_len();
    }
    Ok(entries)
}

/// Payload of raw item bytes as returned by [`ContainerReader::read_raw`]
pub fn item_payload(raw: &[u8]) -> Result<&[u8]> {
    raw.get(ITEM_HEADER_LEN as usize..).ok_or_else(|| {
        FsError::IndexCorruption(format!("{} byte item is shorter than its header", raw.len()))
    })
}

/// Regenerate the indexes of a container from its item headers.
///
/// The rewritten file replaces `path` atomically. Returns the number of
/// items indexed.
pub fn rebuild_index(path: &Path) -> Result<usize> {
    let entries = scan_items(path)?;
    let source = File::open(path).with_path(path)?;
    let tmp = crate::util::tmp_path(path);
    let mut writer = ContainerWriter::create(&tmp)?;
    for entry in &entries {
        let mut raw = vec![0u8; entry.size as usize];
        source.read_exact_at(&mut raw, entry.offset).with_path(path)?;
        let payload = item_payload(&raw)?;
        writer.append(entry.kind, entry.revision, entry.item, payload)?;
    }
    let count = writer.item_count();
    writer.finish()?;
    fs::rename(&tmp, path).with_path(path)?;
    crate::util::sync_parent(path)?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_sample(path: &Path) {
        let mut w = ContainerWriter::create(path).unwrap();
        w.append(ItemKind::Rep, 3, 3, b"representation bytes").unwrap();
        w.append(ItemKind::NodeRev, 3, 1, b"root node").unwrap();
        w.append(ItemKind::Changes, 3, 2, b"").unwrap();
        w.finish().unwrap();
    }

    #[test]
    fn test_write_and_read_items() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("3");
        write_sample(&path);

        let reader = ContainerReader::open(&path).unwrap();
        let (header, payload) = reader.read_item(3, 1).unwrap();
        assert_eq!(header.kind, ItemKind::NodeRev);
        assert_eq!(payload, b"root node");
        assert_eq!(reader.read_item(3, 2).unwrap().1, b"");
        assert!(matches!(reader.read_item(3, 9), Err(FsError::IndexCorruption(_))));
        assert_eq!(reader.p2l().entries.len(), 3);
        assert_eq!(reader.p2l().resolve(HEADER_LEN + 5).unwrap().item, 3);
    }

    #[test]
    fn test_undersized_entry_is_index_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("3");
        write_sample(&path);

        let reader = ContainerReader::open(&path).unwrap();
        let mut entry = reader.p2l().entries[0];
        assert_eq!(item_payload(&reader.read_raw(&entry).unwrap()).unwrap(), b"representation bytes");
        entry.size = ITEM_HEADER_LEN - 1;
        assert!(matches!(reader.read_raw(&entry), Err(FsError::IndexCorruption(_))));
        entry.size = u64::MAX;
        assert!(matches!(reader.read_raw(&entry), Err(FsError::IndexCorruption(_))));
        assert!(matches!(item_payload(&[0u8; 5]), Err(FsError::IndexCorruption(_))));
    }

    #[test]
    fn test_truncated_file_is_index_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("3");
        write_sample(&path);
        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() - 10]).unwrap();
        assert!(matches!(
            ContainerReader::open(&path),
            Err(FsError::IndexCorruption(_))
        ));
    }

    #[test]
    fn test_damaged_index_detected_and_rebuilt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("3");
        write_sample(&path);

        let original = ContainerReader::open(&path).unwrap();
        let data_end = original.data_end() as usize;
        drop(original);

        let mut data = fs::read(&path).unwrap();
        data[data_end + 2] ^= 0xff;
        fs::write(&path, &data).unwrap();
        assert!(matches!(
            ContainerReader::open(&path),
            Err(FsError::IndexCorruption(_))
        ));

        assert_eq!(rebuild_index(&path).unwrap(), 3);
        let reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.read_item(3, 3).unwrap().1, b"representation bytes");
    }

    #[test]
    fn test_scan_stops_at_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("3");
        write_sample(&path);
        let entries = scan_items(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].offset, HEADER_LEN);
        assert_eq!(entries[1].offset, entries[0].end());
    }
}

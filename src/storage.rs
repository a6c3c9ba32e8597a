//! Append-only keyed row store with insert-if-absent semantics.
//!
//! # Storage Format
//!
//! One memory-mapped file per store:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │ Header (64 bytes)                    │
//! │  - Magic: "AISKEYED"                │
//! │  - Version: u32                      │
//! │  - Row count: u64                    │
//! │  - Commit offset: u64                │
//! │  - Reserved                          │
//! ├─────────────────────────────────────┤
//! │ Rows (variable length, append order) │
//! │  - receipt_time: f64                 │
//! │  - key_len: u32, aux_len: u32        │
//! │  - key bytes, aux bytes              │
//! ├─────────────────────────────────────┤
//! │ Uncommitted / free space             │
//! └─────────────────────────────────────┘
//! ```
//!
//! A row's primary key is `(receipt_time, key bytes)`. New rows are written
//! past the commit offset and flushed; only then is the header's commit
//! offset advanced and flushed. Anything past the commit offset is ignored
//! on open, so a crash mid-batch never exposes a partial batch.

use bytemuck::{Pod, Zeroable};
use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid file format")]
    InvalidFormat,
    #[error("Version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },
    #[error("Corrupted row at offset {0}")]
    Corrupted(u64),
    #[error("Row too large: {0} bytes")]
    RowTooLarge(usize),
}

const STORE_MAGIC: &[u8; 8] = b"AISKEYED";
const CURRENT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 64;

/// Initial file size; grows by doubling.
const INITIAL_CAPACITY: u64 = 16 * 1024 * 1024;

/// Store file header
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct StoreHeader {
    magic: [u8; 8],
    version: u32,
    _pad1: u32,
    row_count: u64,
    commit_offset: u64,
    _reserved: [u8; 32],
}

/// Fixed part of each row
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RowHeader {
    receipt_time: f64,
    key_len: u32,
    aux_len: u32,
}

impl RowHeader {
    const SIZE: usize = std::mem::size_of::<Self>();
}

/// One stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub receipt_time: f64,
    /// Second half of the primary key
    pub key: Vec<u8>,
    /// Non-key columns, encoded by the owning sink
    pub aux: Vec<u8>,
}

impl Row {
    pub fn new(receipt_time: f64, key: impl Into<Vec<u8>>, aux: impl Into<Vec<u8>>) -> Self {
        Self {
            receipt_time,
            key: key.into(),
            aux: aux.into(),
        }
    }

    fn encoded_len(&self) -> usize {
        RowHeader::SIZE + self.key.len() + self.aux.len()
    }

    fn fingerprint(&self) -> u64 {
        fingerprint(self.receipt_time, &self.key)
    }
}

/// Result of an insert batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Memory-mapped, append-only, idempotent row store.
pub struct KeyedStore {
    file: File,
    mmap: RwLock<MmapMut>,
    /// Primary-key fingerprint -> row offsets
    index: RwLock<HashMap<u64, Vec<u64>>>,
    commit_offset: AtomicU64,
    row_count: AtomicU64,
    capacity: AtomicU64,
}

impl KeyedStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let file_len = file.metadata()?.len();
        let is_new = file_len == 0;
        if !is_new {
            let mut head = [0u8; HEADER_SIZE];
            (&file).read_exact(&mut head).map_err(|_| StorageError::InvalidFormat)?;
            check_magic_and_version(&head)?;
        }
        let capacity = if file_len < INITIAL_CAPACITY {
            file.set_len(INITIAL_CAPACITY)?;
            INITIAL_CAPACITY
        } else {
            file_len
        };

        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        let header = if is_new {
            let header = StoreHeader {
                magic: *STORE_MAGIC,
                version: CURRENT_VERSION,
                _pad1: 0,
                row_count: 0,
                commit_offset: HEADER_SIZE as u64,
                _reserved: [0; 32],
            };
            mmap[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
            mmap.flush_range(0, HEADER_SIZE)?;
            header
        } else {
            read_header(&mmap)?
        };

        let index = build_index(&mmap, header.commit_offset)?;

        tracing::debug!(
            "Opened store {} ({} rows, {} bytes committed)",
            path.display(),
            header.row_count,
            header.commit_offset
        );

        Ok(Self {
            file,
            mmap: RwLock::new(mmap),
            index: RwLock::new(index),
            commit_offset: AtomicU64::new(header.commit_offset),
            row_count: AtomicU64::new(header.row_count),
            capacity: AtomicU64::new(capacity),
        })
    }

    /// Insert rows whose primary key is not yet stored.
    ///
    /// The whole batch is committed at once after its data is flushed.
    pub fn insert_batch(&self, rows: &[Row]) -> Result<InsertOutcome, StorageError> {
        let mut outcome = InsertOutcome::default();
        if rows.is_empty() {
            return Ok(outcome);
        }

        let mut mmap = self.mmap.write();
        let mut index = self.index.write();

        let start = self.commit_offset.load(Ordering::Acquire);
        let mut write_pos = start;
        let mut staged: Vec<(u64, u64)> = Vec::new();

        for row in rows {
            let fp = row.fingerprint();
            let exists = index
                .get(&fp)
                .into_iter()
                .flatten()
                .chain(staged.iter().filter(|(f, _)| *f == fp).map(|(_, off)| off))
                .any(|&offset| row_matches(&mmap, offset, row));
            if exists {
                outcome.duplicates += 1;
                continue;
            }

            let key_len = u32::try_from(row.key.len()).map_err(|_| StorageError::RowTooLarge(row.key.len()))?;
            let aux_len = u32::try_from(row.aux.len()).map_err(|_| StorageError::RowTooLarge(row.aux.len()))?;

            let needed = write_pos + row.encoded_len() as u64;
            while needed > self.capacity.load(Ordering::Acquire) {
                self.grow(&mut mmap)?;
            }

            let header = RowHeader {
                receipt_time: row.receipt_time,
                key_len,
                aux_len,
            };
            let mut pos = write_pos as usize;
            mmap[pos..pos + RowHeader::SIZE].copy_from_slice(bytemuck::bytes_of(&header));
            pos += RowHeader::SIZE;
            mmap[pos..pos + row.key.len()].copy_from_slice(&row.key);
            pos += row.key.len();
            mmap[pos..pos + row.aux.len()].copy_from_slice(&row.aux);

            staged.push((fp, write_pos));
            write_pos = needed;
            outcome.inserted += 1;
        }

        if staged.is_empty() {
            return Ok(outcome);
        }

        // Data first, then the header that makes it visible.
        mmap.flush_range(start as usize, (write_pos - start) as usize)?;

        let rows_after = self.row_count.load(Ordering::Acquire) + staged.len() as u64;
        let header: &mut StoreHeader =
            bytemuck::from_bytes_mut(&mut mmap[..std::mem::size_of::<StoreHeader>()]);
        header.commit_offset = write_pos;
        header.row_count = rows_after;
        mmap.flush_range(0, HEADER_SIZE)?;

        self.commit_offset.store(write_pos, Ordering::Release);
        self.row_count.store(rows_after, Ordering::Release);
        for (fp, offset) in staged {
            index.entry(fp).or_default().push(offset);
        }

        Ok(outcome)
    }

    /// Insert a single row; `true` when it was new.
    pub fn insert(&self, row: &Row) -> Result<bool, StorageError> {
        Ok(self.insert_batch(std::slice::from_ref(row))?.inserted == 1)
    }

    /// Whether a row with this primary key is stored.
    pub fn contains(&self, receipt_time: f64, key: &[u8]) -> bool {
        let mmap = self.mmap.read();
        let index = self.index.read();
        let probe = Row::new(receipt_time, key, Vec::new());
        index
            .get(&probe.fingerprint())
            .into_iter()
            .flatten()
            .any(|&offset| row_matches(&mmap, offset, &probe))
    }

    /// All committed rows in append order.
    pub fn rows(&self) -> Result<Vec<Row>, StorageError> {
        let mmap = self.mmap.read();
        scan_rows(&mmap, self.commit_offset.load(Ordering::Acquire))
    }

    /// Durable position of the last committed row.
    pub fn committed_offset(&self) -> u64 {
        self.commit_offset.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            row_count: self.row_count.load(Ordering::Acquire),
            data_size_bytes: self.commit_offset.load(Ordering::Acquire),
            capacity_bytes: self.capacity.load(Ordering::Acquire),
        }
    }

    /// Flush everything to disk.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.mmap.write().flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn grow(&self, mmap: &mut MmapMut) -> Result<(), StorageError> {
        let new_cap = self.capacity.load(Ordering::Acquire) * 2;

        self.file.set_len(new_cap)?;
        *mmap = unsafe { MmapOptions::new().map_mut(&self.file)? };
        self.capacity.store(new_cap, Ordering::Release);

        tracing::info!("Grew store to {} MB", new_cap / (1024 * 1024));
        Ok(())
    }
}

/// Read the committed rows of a store file without opening it for writing.
pub fn read_rows<P: AsRef<Path>>(path: P) -> Result<Vec<Row>, StorageError> {
    let file = File::open(path)?;
    if file.metadata()?.len() < HEADER_SIZE as u64 {
        return Err(StorageError::InvalidFormat);
    }
    let mmap: Mmap = unsafe { MmapOptions::new().map(&file)? };
    let header = read_header(&mmap)?;
    scan_rows(&mmap, header.commit_offset)
}

/// Store statistics.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub row_count: u64,
    pub data_size_bytes: u64,
    pub capacity_bytes: u64,
}

impl StoreStats {
    pub fn data_size_mb(&self) -> f64 {
        self.data_size_bytes as f64 / (1024.0 * 1024.0)
    }

    pub fn utilization(&self) -> f64 {
        if self.capacity_bytes == 0 {
            0.0
        } else {
            self.data_size_bytes as f64 / self.capacity_bytes as f64
        }
    }
}

fn check_magic_and_version(bytes: &[u8]) -> Result<StoreHeader, StorageError> {
    if bytes.len() < HEADER_SIZE || bytes[..8] != *STORE_MAGIC {
        return Err(StorageError::InvalidFormat);
    }
    let header: StoreHeader =
        bytemuck::pod_read_unaligned(&bytes[..std::mem::size_of::<StoreHeader>()]);
    if header.version != CURRENT_VERSION {
        return Err(StorageError::VersionMismatch {
            expected: CURRENT_VERSION,
            got: header.version,
        });
    }
    Ok(header)
}

fn read_header(bytes: &[u8]) -> Result<StoreHeader, StorageError> {
    let header = check_magic_and_version(bytes)?;
    if header.commit_offset < HEADER_SIZE as u64 || header.commit_offset > bytes.len() as u64 {
        return Err(StorageError::InvalidFormat);
    }
    Ok(header)
}

/// Decode the row at `offset`, returning it and the offset after it.
fn row_at(bytes: &[u8], offset: u64, end: u64) -> Result<(Row, u64), StorageError> {
    let start = offset as usize;
    let body = start + RowHeader::SIZE;
    if body as u64 > end {
        return Err(StorageError::Corrupted(offset));
    }
    let header: RowHeader = bytemuck::pod_read_unaligned(&bytes[start..body]);
    let key_end = body + header.key_len as usize;
    let aux_end = key_end + header.aux_len as usize;
    if aux_end as u64 > end {
        return Err(StorageError::Corrupted(offset));
    }
    let row = Row {
        receipt_time: header.receipt_time,
        key: bytes[body..key_end].to_vec(),
        aux: bytes[key_end..aux_end].to_vec(),
    };
    Ok((row, aux_end as u64))
}

fn scan_rows(bytes: &[u8], commit_offset: u64) -> Result<Vec<Row>, StorageError> {
    let mut rows = Vec::new();
    let mut offset = HEADER_SIZE as u64;
    while offset < commit_offset {
        let (row, next) = row_at(bytes, offset, commit_offset)?;
        rows.push(row);
        offset = next;
    }
    Ok(rows)
}

fn build_index(bytes: &[u8], commit_offset: u64) -> Result<HashMap<u64, Vec<u64>>, StorageError> {
    let mut index: HashMap<u64, Vec<u64>> = HashMap::new();
    let mut offset = HEADER_SIZE as u64;
    while offset < commit_offset {
        let (row, next) = row_at(bytes, offset, commit_offset)?;
        index.entry(row.fingerprint()).or_default().push(offset);
        offset = next;
    }
    Ok(index)
}

fn row_matches(bytes: &[u8], offset: u64, row: &Row) -> bool {
    let start = offset as usize;
    let body = start + RowHeader::SIZE;
    let header: RowHeader = bytemuck::pod_read_unaligned(&bytes[start..body]);
    header.receipt_time.to_bits() == row.receipt_time.to_bits()
        && header.key_len as usize == row.key.len()
        && bytes[body..body + row.key.len()] == row.key[..]
}

fn fingerprint(receipt_time: f64, key: &[u8]) -> u64 {
    // FNV-1a over the time bits and key
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &b in receipt_time.to_bits().to_le_bytes().iter().chain(key) {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_store_create_and_insert() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.store");

        let store = KeyedStore::open(&path).unwrap();
        assert_eq!(store.stats().row_count, 0);

        let row = Row::new(1.5, b"!AIVDM".to_vec(), b"aux".to_vec());
        assert!(store.insert(&row).unwrap());
        assert!(store.contains(1.5, b"!AIVDM"));
        assert!(!store.contains(1.5, b"!AIVDO"));
        assert!(!store.contains(2.5, b"!AIVDM"));

        assert_eq!(store.rows().unwrap(), vec![row]);
    }

    #[test]
    fn test_duplicate_keys_ignored() {
        let dir = tempdir().unwrap();
        let store = KeyedStore::open(dir.path().join("dup")).unwrap();

        let a = Row::new(10.0, b"same".to_vec(), b"first".to_vec());
        let b = Row::new(10.0, b"same".to_vec(), b"second".to_vec());
        let c = Row::new(11.0, b"same".to_vec(), Vec::new());

        let outcome = store.insert_batch(&[a.clone(), b, c.clone()]).unwrap();
        assert_eq!(outcome, InsertOutcome { inserted: 2, duplicates: 1 });

        for _ in 0..5 {
            assert!(!store.insert(&a).unwrap());
        }
        assert_eq!(store.stats().row_count, 2);
        assert_eq!(store.rows().unwrap(), vec![a, c]);
    }

    #[test]
    fn test_reopen_rebuilds_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reopen");
        let row = Row::new(42.0, b"payload".to_vec(), b"x".to_vec());

        {
            let store = KeyedStore::open(&path).unwrap();
            store.insert(&row).unwrap();
            store.sync().unwrap();
        }

        let store = KeyedStore::open(&path).unwrap();
        assert_eq!(store.stats().row_count, 1);
        assert!(!store.insert(&row).unwrap());
        assert_eq!(read_rows(&path).unwrap(), vec![row]);
    }

    #[test]
    fn test_uncommitted_bytes_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn");
        let committed = Row::new(1.0, b"kept".to_vec(), Vec::new());

        let offset = {
            let store = KeyedStore::open(&path).unwrap();
            store.insert(&committed).unwrap();
            store.committed_offset()
        };

        // Simulate a crash after data was written but before the commit.
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(offset)).unwrap();
            let torn = RowHeader {
                receipt_time: 2.0,
                key_len: 4,
                aux_len: 0,
            };
            file.write_all(bytemuck::bytes_of(&torn)).unwrap();
            file.write_all(b"lost").unwrap();
        }

        let store = KeyedStore::open(&path).unwrap();
        assert_eq!(store.rows().unwrap(), vec![committed]);
        assert!(!store.contains(2.0, b"lost"));
    }

    #[test]
    fn test_grows_past_initial_capacity() {
        let dir = tempdir().unwrap();
        let store = KeyedStore::open(dir.path().join("big")).unwrap();

        let big = vec![b'x'; (INITIAL_CAPACITY as usize) + 1024];
        assert!(store.insert(&Row::new(0.0, big.clone(), Vec::new())).unwrap());
        assert!(store.stats().capacity_bytes > INITIAL_CAPACITY);
        assert!(store.contains(0.0, &big));
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("foreign");
        std::fs::write(&path, vec![7u8; 128]).unwrap();

        assert!(matches!(KeyedStore::open(&path), Err(StorageError::InvalidFormat)));
        assert!(matches!(read_rows(&path), Err(StorageError::InvalidFormat)));
    }
}

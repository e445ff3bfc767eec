//! Critical Data Store
//!
//! Critical tables keep a copy of their active image in a store that
//! survives a warm restart. The store is an opt-in collaborator: a platform
//! without one simply registers every table as non-critical.
//!
//! Two stores are provided:
//!
//! - [`MemoryCds`] keeps blocks in process memory. Sharing one instance
//!   between two table services instances models a warm restart.
//! - [`MappedCds`] keeps blocks in a memory-mapped file made of a control
//!   block, a fixed directory of block entries and a data area. The control
//!   block and every data block carry a CRC32 so corruption is detected on
//!   restore instead of being activated.
//!
//! Table services also keeps a shadow of its critical-table registry in the
//! store under [`CRITICAL_REGISTRY_NAME`]; see [`CriticalRegistry`].

use std::fs::OpenOptions;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use crate::codec::{get_fixed_str, get_u32, put_fixed_str, put_u32};
use crate::platform::SpacecraftTime;

/// Block name of the critical-table registry shadow
pub const CRITICAL_REGISTRY_NAME: &str = "TBL.CritReg";

/// Errors raised by a critical data store
#[derive(Debug, thiserror::Error)]
pub enum CdsError {
    /// The handle or name does not identify a block
    #[error("no such block")]
    NotFound,
    /// No directory entry or data space left
    #[error("critical data store is full")]
    Full,
    /// Data length differs from the block size
    #[error("block is {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Size of the block
        expected: usize,
        /// Length supplied by the caller
        actual: usize,
    },
    /// Stored data failed its integrity check
    #[error("block {0} is corrupted")]
    Corrupted(String),
    /// Backing file failure
    #[error("store i/o: {0}")]
    Io(#[from] io::Error),
}

/// Handle of a block in a critical data store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CdsHandle(pub u32);

/// Key/value blob store that survives warm restarts
pub trait CriticalDataStore: Send + Sync {
    /// Create or open the block `name` of `size` bytes
    ///
    /// Returns the handle and `true` if a block of that name and size already
    /// existed. A block of the same name but another size is recreated.
    fn register(&self, name: &str, size: usize) -> Result<(CdsHandle, bool), CdsError>;

    /// Replace the contents of a block
    fn store(&self, handle: CdsHandle, data: &[u8]) -> Result<(), CdsError>;

    /// Copy the contents of a block into `dest`
    fn restore(&self, handle: CdsHandle, dest: &mut [u8]) -> Result<(), CdsError>;

    /// Remove the block `name`
    fn delete(&self, name: &str) -> Result<(), CdsError>;
}

#[derive(Debug, Clone)]
struct MemBlock {
    name: String,
    data: Vec<u8>,
    crc: u32,
}

/// Critical data store held in process memory
#[derive(Debug)]
pub struct MemoryCds {
    blocks: Mutex<Vec<Option<MemBlock>>>,
}

impl MemoryCds {
    /// Store with room for `max_blocks` blocks
    pub fn new(max_blocks: usize) -> Self {
        Self {
            blocks: Mutex::new((0..max_blocks).map(|_| None).collect()),
        }
    }

    /// Number of blocks in use
    pub fn len(&self) -> usize {
        self.blocks.lock().iter().flatten().count()
    }

    /// True when no block is in use
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if a block named `name` exists
    pub fn contains(&self, name: &str) -> bool {
        self.blocks.lock().iter().flatten().any(|block| block.name == name)
    }

    /// Flip the first byte of a block without updating its CRC
    pub fn corrupt(&self, name: &str) -> bool {
        let mut blocks = self.blocks.lock();
        match blocks.iter_mut().flatten().find(|block| block.name == name) {
            Some(block) if !block.data.is_empty() => {
                block.data[0] ^= 0xFF;
                true
            }
            _ => false,
        }
    }
}

impl CriticalDataStore for MemoryCds {
    fn register(&self, name: &str, size: usize) -> Result<(CdsHandle, bool), CdsError> {
        let mut blocks = self.blocks.lock();
        if let Some(index) = blocks
            .iter()
            .position(|slot| matches!(slot, Some(block) if block.name == name))
        {
            if let Some(block) = blocks[index].as_mut() {
                if block.data.len() == size {
                    return Ok((CdsHandle(index as u32), true));
                }
                block.data = vec![0u8; size];
                block.crc = crc32fast::hash(&block.data);
            }
            return Ok((CdsHandle(index as u32), false));
        }

        let index = blocks.iter().position(Option::is_none).ok_or(CdsError::Full)?;
        let data = vec![0u8; size];
        blocks[index] = Some(MemBlock {
            name: name.to_string(),
            crc: crc32fast::hash(&data),
            data,
        });
        Ok((CdsHandle(index as u32), false))
    }

    fn store(&self, handle: CdsHandle, data: &[u8]) -> Result<(), CdsError> {
        let mut blocks = self.blocks.lock();
        let block = blocks
            .get_mut(handle.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(CdsError::NotFound)?;
        if block.data.len() != data.len() {
            return Err(CdsError::SizeMismatch {
                expected: block.data.len(),
                actual: data.len(),
            });
        }
        block.data.copy_from_slice(data);
        block.crc = crc32fast::hash(data);
        Ok(())
    }

    fn restore(&self, handle: CdsHandle, dest: &mut [u8]) -> Result<(), CdsError> {
        let blocks = self.blocks.lock();
        let block = blocks
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(CdsError::NotFound)?;
        if block.data.len() != dest.len() {
            return Err(CdsError::SizeMismatch {
                expected: block.data.len(),
                actual: dest.len(),
            });
        }
        if crc32fast::hash(&block.data) != block.crc {
            return Err(CdsError::Corrupted(block.name.clone()));
        }
        dest.copy_from_slice(&block.data);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), CdsError> {
        let mut blocks = self.blocks.lock();
        let slot = blocks
            .iter_mut()
            .find(|slot| matches!(slot, Some(block) if block.name == name))
            .ok_or(CdsError::NotFound)?;
        *slot = None;
        Ok(())
    }
}

/// Control block at the start of a mapped store file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBlock {
    /// Format identifier ("TCDS")
    pub magic: u32,
    /// Format version
    pub version: u32,
    /// Number of directory entries
    pub max_blocks: u32,
    /// Bytes of the data area
    pub data_size: u64,
    /// End of the highest block in use in the data area
    pub data_used: u64,
    /// CRC32 over every preceding field
    pub crc32: u32,
}

impl ControlBlock {
    /// Serialized size in bytes
    pub const SIZE: usize = 32;

    /// Format identifier
    pub const MAGIC: u32 = 0x5443_4453;

    /// Current format version
    pub const VERSION: u32 = 1;

    /// Control block of an empty store
    pub fn new(max_blocks: u32, data_size: u64) -> Self {
        let mut block = Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            max_blocks,
            data_size,
            data_used: 0,
            crc32: 0,
        };
        block.update_crc();
        block
    }

    fn fields(&self) -> [u8; Self::SIZE - 4] {
        let mut bytes = [0u8; Self::SIZE - 4];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.max_blocks.to_le_bytes());
        bytes[12..20].copy_from_slice(&self.data_size.to_le_bytes());
        bytes[20..28].copy_from_slice(&self.data_used.to_le_bytes());
        bytes
    }

    /// Recompute the CRC field
    pub fn update_crc(&mut self) {
        let mut hasher = Hasher::new();
        hasher.update(&self.fields());
        self.crc32 = hasher.finalize();
    }

    /// True if the CRC field matches the other fields
    pub fn verify_crc(&self) -> bool {
        let mut hasher = Hasher::new();
        hasher.update(&self.fields());
        self.crc32 == hasher.finalize()
    }

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[..Self::SIZE - 4].copy_from_slice(&self.fields());
        bytes[Self::SIZE - 4..].copy_from_slice(&self.crc32.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            magic: le_u32(bytes, 0),
            version: le_u32(bytes, 4),
            max_blocks: le_u32(bytes, 8),
            data_size: le_u64(bytes, 12),
            data_used: le_u64(bytes, 20),
            crc32: le_u32(bytes, 28),
        }
    }
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// Directory entry of a mapped store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct DirEntry {
    name: String,
    offset: u64,
    size: u64,
    crc32: u32,
    used: bool,
}

impl DirEntry {
    const NAME_LEN: usize = 40;
    const SIZE: usize = Self::NAME_LEN + 8 + 8 + 4 + 4;

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        put_fixed_str(&mut out, &self.name, Self::NAME_LEN);
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.crc32.to_le_bytes());
        out.extend_from_slice(&(self.used as u32).to_le_bytes());
        out
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let at = Self::NAME_LEN;
        Self {
            name: get_fixed_str(&bytes[..at]),
            offset: le_u64(bytes, at),
            size: le_u64(bytes, at + 8),
            crc32: le_u32(bytes, at + 16),
            used: le_u32(bytes, at + 20) != 0,
        }
    }
}

struct MappedInner {
    mmap: MmapMut,
    control: ControlBlock,
}

impl MappedInner {
    fn data_start(&self) -> usize {
        ControlBlock::SIZE + self.control.max_blocks as usize * DirEntry::SIZE
    }

    fn entry(&self, index: usize) -> DirEntry {
        let at = ControlBlock::SIZE + index * DirEntry::SIZE;
        DirEntry::from_bytes(&self.mmap[at..at + DirEntry::SIZE])
    }

    fn put_entry(&mut self, index: usize, entry: &DirEntry) {
        let at = ControlBlock::SIZE + index * DirEntry::SIZE;
        self.mmap[at..at + DirEntry::SIZE].copy_from_slice(&entry.to_bytes());
    }

    fn used_entry(&self, handle: CdsHandle) -> Result<DirEntry, CdsError> {
        if handle.0 >= self.control.max_blocks {
            return Err(CdsError::NotFound);
        }
        let entry = self.entry(handle.0 as usize);
        if !entry.used {
            return Err(CdsError::NotFound);
        }
        self.block_range(&entry)?;
        Ok(entry)
    }

    fn find(&self, name: &str) -> Option<(usize, DirEntry)> {
        (0..self.control.max_blocks as usize)
            .map(|index| (index, self.entry(index)))
            .find(|(_, entry)| entry.used && entry.name == name)
    }

    /// Bytes of the mapping holding a block, checked against the data area
    fn block_range(&self, entry: &DirEntry) -> Result<Range<usize>, CdsError> {
        let end = entry
            .offset
            .checked_add(entry.size)
            .filter(|end| *end <= self.control.data_size)
            .ok_or_else(|| CdsError::Corrupted(format!("directory entry '{}'", entry.name)))?;
        let start = self.data_start();
        Ok(start + entry.offset as usize..start + end as usize)
    }

    /// Data extents of every used entry that lies inside the data area
    fn extents(&self) -> Vec<(u64, u64)> {
        (0..self.control.max_blocks as usize)
            .map(|index| self.entry(index))
            .filter(|entry| entry.used)
            .filter_map(|entry| {
                let end = entry.offset.checked_add(entry.size)?;
                (end <= self.control.data_size).then_some((entry.offset, end))
            })
            .collect()
    }

    /// Offset of the first gap in the data area that fits `size` bytes
    fn allocate(&self, size: u64) -> Option<u64> {
        let mut extents = self.extents();
        extents.sort_unstable();
        let mut at = 0u64;
        for (start, end) in extents {
            if start.saturating_sub(at) >= size {
                return Some(at);
            }
            at = at.max(end);
        }
        (self.control.data_size - at >= size).then_some(at)
    }

    /// Recompute the high-water mark of the data area
    fn update_data_used(&mut self) {
        self.control.data_used = self.extents().iter().map(|(_, end)| *end).max().unwrap_or(0);
    }

    fn commit(&mut self) -> Result<(), CdsError> {
        self.control.update_crc();
        self.mmap[..ControlBlock::SIZE].copy_from_slice(&self.control.to_bytes());
        self.mmap.flush()?;
        Ok(())
    }
}

/// Critical data store kept in a memory-mapped file
pub struct MappedCds {
    path: PathBuf,
    inner: Mutex<MappedInner>,
}

impl MappedCds {
    /// Create or open a store at `path`
    ///
    /// `max_blocks` and `data_size` size a new file and are ignored when the
    /// file already exists.
    pub fn open<P: AsRef<Path>>(path: P, max_blocks: u32, data_size: u64) -> Result<Self, CdsError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&path)?;
        let is_new = file.metadata()?.len() == 0;
        if is_new {
            let total = ControlBlock::SIZE as u64 + max_blocks as u64 * DirEntry::SIZE as u64 + data_size;
            file.set_len(total)?;
        }

        // SAFETY: the file is owned by this store for the life of the mapping
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        let control = if is_new {
            let control = ControlBlock::new(max_blocks, data_size);
            mmap[..ControlBlock::SIZE].copy_from_slice(&control.to_bytes());
            mmap.flush()?;
            control
        } else {
            if mmap.len() < ControlBlock::SIZE {
                return Err(CdsError::Corrupted("control block".to_string()));
            }
            let control = ControlBlock::from_bytes(&mmap[..ControlBlock::SIZE]);
            let expected_len =
                ControlBlock::SIZE as u64 + control.max_blocks as u64 * DirEntry::SIZE as u64 + control.data_size;
            if control.magic != ControlBlock::MAGIC || !control.verify_crc() || (mmap.len() as u64) < expected_len {
                return Err(CdsError::Corrupted("control block".to_string()));
            }
            control
        };

        Ok(Self {
            path,
            inner: Mutex::new(MappedInner { mmap, control }),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the control block
    pub fn control_block(&self) -> ControlBlock {
        self.inner.lock().control
    }
}

impl CriticalDataStore for MappedCds {
    fn register(&self, name: &str, size: usize) -> Result<(CdsHandle, bool), CdsError> {
        let mut inner = self.inner.lock();
        if let Some((index, mut entry)) = inner.find(name) {
            if entry.size as usize == size && inner.block_range(&entry).is_ok() {
                return Ok((CdsHandle(index as u32), true));
            }
            // Resized or out of bounds: the old block is released and a new one handed out
            entry.used = false;
            inner.put_entry(index, &entry);
        }

        let index = (0..inner.control.max_blocks as usize)
            .find(|index| !inner.entry(*index).used)
            .ok_or(CdsError::Full)?;
        let offset = inner.allocate(size as u64).ok_or(CdsError::Full)?;
        let entry = DirEntry {
            name: name.to_string(),
            offset,
            size: size as u64,
            crc32: crc32fast::hash(&vec![0u8; size]),
            used: true,
        };
        let range = inner.block_range(&entry)?;
        inner.mmap[range].fill(0);
        inner.put_entry(index, &entry);
        inner.update_data_used();
        inner.commit()?;
        Ok((CdsHandle(index as u32), false))
    }

    fn store(&self, handle: CdsHandle, data: &[u8]) -> Result<(), CdsError> {
        let mut inner = self.inner.lock();
        let mut entry = inner.used_entry(handle)?;
        if entry.size as usize != data.len() {
            return Err(CdsError::SizeMismatch {
                expected: entry.size as usize,
                actual: data.len(),
            });
        }
        let range = inner.block_range(&entry)?;
        inner.mmap[range].copy_from_slice(data);
        entry.crc32 = crc32fast::hash(data);
        inner.put_entry(handle.0 as usize, &entry);
        inner.commit()
    }

    fn restore(&self, handle: CdsHandle, dest: &mut [u8]) -> Result<(), CdsError> {
        let inner = self.inner.lock();
        let entry = inner.used_entry(handle)?;
        if entry.size as usize != dest.len() {
            return Err(CdsError::SizeMismatch {
                expected: entry.size as usize,
                actual: dest.len(),
            });
        }
        let block = &inner.mmap[inner.block_range(&entry)?];
        if crc32fast::hash(block) != entry.crc32 {
            return Err(CdsError::Corrupted(entry.name));
        }
        dest.copy_from_slice(block);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), CdsError> {
        let mut inner = self.inner.lock();
        let (index, mut entry) = inner.find(name).ok_or(CdsError::NotFound)?;
        entry.used = false;
        inner.put_entry(index, &entry);
        inner.update_data_used();
        inner.commit()
    }
}

/// One critical table as remembered across restarts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriticalEntry {
    /// Block holding the table image
    pub cds_handle: CdsHandle,
    /// Full `App.Tbl` name
    pub name: String,
    /// True once an image was activated and mirrored
    pub loaded_once: bool,
    /// Time of the last activation
    pub time: SpacecraftTime,
    /// Source of the last activated image
    pub last_file: String,
}

/// Shadow of the critical-table registry
///
/// Stored in the CDS as a fixed array of fixed-size entries so the block
/// never changes size between restarts.
#[derive(Debug, Clone)]
pub struct CriticalRegistry {
    entries: Vec<Option<CriticalEntry>>,
    name_len: usize,
    file_len: usize,
}

impl CriticalRegistry {
    /// Empty shadow of `capacity` entries
    pub fn new(capacity: usize, name_len: usize, file_len: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| None).collect(),
            name_len,
            file_len,
        }
    }

    /// Number of entries
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Bytes of one encoded entry
    fn entry_size(&self) -> usize {
        // used, loaded_once, pad, handle, seconds, subseconds
        4 + 4 + 4 + 4 + self.name_len + self.file_len
    }

    /// Bytes of the encoded shadow
    pub fn encoded_size(&self) -> usize {
        self.entries.len() * self.entry_size()
    }

    /// Entry for table `name`
    pub fn find(&self, name: &str) -> Option<&CriticalEntry> {
        self.entries.iter().flatten().find(|entry| entry.name == name)
    }

    /// Mutable entry for table `name`
    pub fn find_mut(&mut self, name: &str) -> Option<&mut CriticalEntry> {
        self.entries.iter_mut().flatten().find(|entry| entry.name == name)
    }

    /// Add or replace the entry for `entry.name`; `false` when full
    pub fn insert(&mut self, entry: CriticalEntry) -> bool {
        if let Some(existing) = self.find_mut(&entry.name) {
            *existing = entry;
            return true;
        }
        match self.entries.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(entry);
                true
            }
            None => false,
        }
    }

    /// Remove and return the entry for `name`
    pub fn remove(&mut self, name: &str) -> Option<CriticalEntry> {
        self.entries
            .iter_mut()
            .find(|slot| matches!(slot, Some(entry) if entry.name == name))
            .and_then(Option::take)
    }

    /// True when no entry is free
    pub fn is_full(&self) -> bool {
        self.entries.iter().all(Option::is_some)
    }

    /// All live entries
    pub fn iter(&self) -> impl Iterator<Item = &CriticalEntry> {
        self.entries.iter().flatten()
    }

    /// Serialize for the CDS
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_size());
        for slot in &self.entries {
            match slot {
                Some(entry) => {
                    out.extend_from_slice(&[1, entry.loaded_once as u8, 0, 0]);
                    put_u32(&mut out, entry.cds_handle.0);
                    put_u32(&mut out, entry.time.seconds);
                    put_u32(&mut out, entry.time.subseconds);
                    put_fixed_str(&mut out, &entry.name, self.name_len);
                    put_fixed_str(&mut out, &entry.last_file, self.file_len);
                }
                None => out.resize(out.len() + self.entry_size(), 0),
            }
        }
        out
    }

    /// Replace the contents with a shadow read back from the CDS
    pub fn decode(&mut self, bytes: &[u8]) {
        let size = self.entry_size();
        let name_len = self.name_len;
        for (index, slot) in self.entries.iter_mut().enumerate() {
            let at = index * size;
            *slot = bytes.get(at..at + size).filter(|raw| raw[0] != 0).map(|raw| CriticalEntry {
                loaded_once: raw[1] != 0,
                cds_handle: CdsHandle(get_u32(raw, 4)),
                time: SpacecraftTime::new(get_u32(raw, 8), get_u32(raw, 12)),
                name: get_fixed_str(&raw[16..16 + name_len]),
                last_file: get_fixed_str(&raw[16 + name_len..]),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_register_existing() {
        let cds = MemoryCds::new(2);
        let (handle, existed) = cds.register("A.C", 4).unwrap();
        assert!(!existed);
        cds.store(handle, &[1, 2, 3, 4]).unwrap();

        let (again, existed) = cds.register("A.C", 4).unwrap();
        assert_eq!(again, handle);
        assert!(existed);
        let mut out = [0u8; 4];
        cds.restore(handle, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        // A different size recreates the block
        let (_, existed) = cds.register("A.C", 8).unwrap();
        assert!(!existed);
    }

    #[test]
    fn test_memory_full_and_corrupt() {
        let cds = MemoryCds::new(1);
        let (handle, _) = cds.register("A.C", 2).unwrap();
        assert!(matches!(cds.register("B.C", 2), Err(CdsError::Full)));

        cds.store(handle, &[5, 6]).unwrap();
        assert!(cds.corrupt("A.C"));
        let mut out = [0u8; 2];
        assert!(matches!(cds.restore(handle, &mut out), Err(CdsError::Corrupted(_))));

        cds.delete("A.C").unwrap();
        assert!(cds.is_empty());
        assert!(matches!(cds.delete("A.C"), Err(CdsError::NotFound)));
    }

    #[test]
    fn test_mapped_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cds.dat");
        {
            let cds = MappedCds::open(&path, 4, 256).unwrap();
            let (handle, existed) = cds.register("A.C", 8).unwrap();
            assert!(!existed);
            cds.store(handle, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
            assert_eq!(cds.control_block().data_used, 8);
        }

        let cds = MappedCds::open(&path, 0, 0).unwrap();
        assert_eq!(cds.control_block().max_blocks, 4);
        let (handle, existed) = cds.register("A.C", 8).unwrap();
        assert!(existed);
        let mut out = [0u8; 8];
        cds.restore(handle, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_mapped_detects_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cds.dat");
        let handle = {
            let cds = MappedCds::open(&path, 2, 64).unwrap();
            let (handle, _) = cds.register("A.C", 4).unwrap();
            cds.store(handle, &[9, 9, 9, 9]).unwrap();
            handle
        };

        let mut bytes = std::fs::read(&path).unwrap();
        let data_start = ControlBlock::SIZE + 2 * DirEntry::SIZE;
        bytes[data_start] = 0;
        std::fs::write(&path, &bytes).unwrap();

        let cds = MappedCds::open(&path, 2, 64).unwrap();
        let mut out = [0u8; 4];
        assert!(matches!(cds.restore(handle, &mut out), Err(CdsError::Corrupted(_))));

        bytes[0] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(MappedCds::open(&path, 2, 64), Err(CdsError::Corrupted(_))));
    }

    #[test]
    fn test_mapped_space_accounting() {
        let dir = tempdir().unwrap();
        let cds = MappedCds::open(dir.path().join("cds.dat"), 2, 16).unwrap();
        cds.register("A.C", 10).unwrap();
        assert!(matches!(cds.register("B.C", 10), Err(CdsError::Full)));
        cds.delete("A.C").unwrap();
        assert_eq!(cds.control_block().data_used, 0);
        cds.register("B.C", 10).unwrap();
    }

    #[test]
    fn test_mapped_reuses_freed_space() {
        let dir = tempdir().unwrap();
        let cds = MappedCds::open(dir.path().join("cds.dat"), 4, 24).unwrap();
        cds.register("A.C", 8).unwrap();
        cds.register("B.C", 8).unwrap();
        cds.register("C.C", 8).unwrap();
        cds.delete("B.C").unwrap();
        assert_eq!(cds.control_block().data_used, 24);
        let (handle, existed) = cds.register("D.C", 6).unwrap();
        assert!(!existed);
        cds.store(handle, &[4; 6]).unwrap();

        // A resized block gives its old bytes back
        for size in [4, 8, 2, 8] {
            let (handle, existed) = cds.register("A.C", size).unwrap();
            assert!(!existed);
            cds.store(handle, &vec![1; size]).unwrap();
        }
        let mut out = [0u8; 6];
        cds.restore(handle, &mut out).unwrap();
        assert_eq!(out, [4; 6]);
    }

    #[test]
    fn test_mapped_entry_out_of_bounds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cds.dat");
        let handle = {
            let cds = MappedCds::open(&path, 2, 64).unwrap();
            let (handle, _) = cds.register("A.C", 4).unwrap();
            cds.store(handle, &[7; 4]).unwrap();
            handle
        };

        let mut bytes = std::fs::read(&path).unwrap();
        let offset_at = ControlBlock::SIZE + DirEntry::NAME_LEN;
        bytes[offset_at..offset_at + 8].copy_from_slice(&(1u64 << 40).to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let cds = MappedCds::open(&path, 2, 64).unwrap();
        let mut out = [0u8; 4];
        assert!(matches!(cds.restore(handle, &mut out), Err(CdsError::Corrupted(_))));
        assert!(matches!(cds.store(handle, &out), Err(CdsError::Corrupted(_))));

        let (handle, existed) = cds.register("A.C", 4).unwrap();
        assert!(!existed);
        cds.store(handle, &[8; 4]).unwrap();
        cds.restore(handle, &mut out).unwrap();
        assert_eq!(out, [8; 4]);
    }

    #[test]
    fn test_critical_registry_encoding() {
        let mut shadow = CriticalRegistry::new(3, 40, 64);
        assert!(shadow.insert(CriticalEntry {
            cds_handle: CdsHandle(2),
            name: "A.C".to_string(),
            loaded_once: true,
            time: SpacecraftTime::new(100, 5),
            last_file: "/cf/a.tbl".to_string(),
        }));
        let bytes = shadow.encode();
        assert_eq!(bytes.len(), shadow.encoded_size());

        let mut restored = CriticalRegistry::new(3, 40, 64);
        restored.decode(&bytes);
        let entry = restored.find("A.C").unwrap();
        assert_eq!(entry.cds_handle, CdsHandle(2));
        assert!(entry.loaded_once);
        assert_eq!(entry.time, SpacecraftTime::new(100, 5));
        assert_eq!(entry.last_file, "/cf/a.tbl");
        assert_eq!(restored.iter().count(), 1);
    }

    #[test]
    fn test_critical_registry_full() {
        let mut shadow = CriticalRegistry::new(1, 40, 64);
        let entry = |name: &str| CriticalEntry {
            cds_handle: CdsHandle(0),
            name: name.to_string(),
            loaded_once: false,
            time: SpacecraftTime::default(),
            last_file: String::new(),
        };
        assert!(shadow.insert(entry("A.C")));
        assert!(shadow.is_full());
        assert!(!shadow.insert(entry("B.C")));
        assert!(shadow.remove("A.C").is_some());
        assert!(shadow.insert(entry("B.C")));
    }
}

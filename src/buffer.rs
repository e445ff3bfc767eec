//! Table data storage and the load buffer pool
//!
//! Table bytes live in [`TableData`], a shared, lock-protected byte vector.
//! Every registry record owns one local buffer (two for double-buffered
//! tables). In addition a fixed pool of shared buffers stages loads into
//! single-buffered tables and snapshots taken for dumps. A shared buffer is
//! loaned to exactly one registry record at a time through its `owner` field.
//!
//! Local buffers are carved out of a [`MemPool`], a byte budget guarded by its
//! own mutex so registration never nests it inside the registry lock's callers.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, TblError};
use crate::platform::SpacecraftTime;
use crate::resource_id::{IdSerial, LoadBufferId, RegId, ResourceId};

/// Shared, lock-protected table bytes
///
/// This is what `get_address` hands to applications. Clones refer to the same
/// storage.
#[derive(Debug, Clone)]
pub struct TableData(Arc<RwLock<Vec<u8>>>);

impl TableData {
    /// Zero-filled storage of `len` bytes
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    /// Wrap existing bytes
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self(Arc::new(RwLock::new(bytes)))
    }

    /// Storage capacity in bytes
    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    /// True when the storage holds no bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shared view of the bytes
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.0.read()
    }

    /// Exclusive view of the bytes
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.0.write()
    }

    /// Copy of the first `len` bytes
    pub fn to_vec(&self, len: usize) -> Vec<u8> {
        let data = self.0.read();
        data[..len.min(data.len())].to_vec()
    }

    /// True if both handles refer to the same storage
    pub fn same_storage(&self, other: &TableData) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Copy `len` bytes from the start of `src` to the start of `self`
    pub(crate) fn copy_from(&self, src: &TableData, len: usize) {
        if self.same_storage(src) {
            return;
        }
        let from = src.read();
        let mut to = self.write();
        let len = len.min(from.len()).min(to.len());
        to[..len].copy_from_slice(&from[..len]);
    }

    /// CRC32 of the first `len` bytes
    pub fn crc(&self, len: usize) -> u32 {
        let data = self.0.read();
        crc32fast::hash(&data[..len.min(data.len())])
    }
}

/// Which image of a table an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferSelect {
    /// The live image
    Active,
    /// The image staged by a load in progress
    Inactive,
}

impl BufferSelect {
    /// Decode the command-layer encoding (0 inactive, 1 active)
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(BufferSelect::Inactive),
            1 => Some(BufferSelect::Active),
            _ => None,
        }
    }

    /// Command-layer encoding
    pub fn raw(self) -> u16 {
        match self {
            BufferSelect::Inactive => 0,
            BufferSelect::Active => 1,
        }
    }
}

/// Identifies a buffer relative to the registry record that uses it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferId {
    /// Buffer loaned from the shared pool
    Shared(LoadBufferId),
    /// One of the record's own buffers
    Local(u8),
}

/// A buffer plus the metadata of the image it holds
#[derive(Debug, Clone)]
pub struct LoadBuffer {
    /// Table bytes
    pub(crate) data: TableData,
    /// Bytes of meaningful content
    pub(crate) content_size: usize,
    /// CRC32 of the content
    pub(crate) crc: u32,
    /// Creation time of the image source
    pub(crate) file_time: SpacecraftTime,
    /// Description of where the image came from
    pub(crate) source: String,
    /// True once the image passed validation
    pub(crate) validated: bool,
}

impl LoadBuffer {
    /// Wrap storage with empty metadata
    pub fn new(data: TableData) -> Self {
        Self {
            data,
            content_size: 0,
            crc: 0,
            file_time: SpacecraftTime::default(),
            source: String::new(),
            validated: false,
        }
    }

    /// Table bytes
    pub fn data(&self) -> &TableData {
        &self.data
    }

    /// Forget the image, keeping the storage
    pub(crate) fn reset(&mut self) {
        self.content_size = 0;
        self.crc = 0;
        self.file_time = SpacecraftTime::default();
        self.source.clear();
        self.validated = false;
    }

    /// Recompute the CRC over the content
    pub(crate) fn update_crc(&mut self) {
        self.crc = self.data.crc(self.content_size);
    }

    /// Copy the image and its metadata from `other`
    pub(crate) fn copy_image_from(&mut self, other: &LoadBuffer) {
        self.data.copy_from(&other.data, other.content_size);
        self.content_size = other.content_size;
        self.crc = other.crc;
        self.file_time = other.file_time;
        self.source = other.source.clone();
        self.validated = other.validated;
    }
}

/// One slot of the shared pool
#[derive(Debug)]
pub(crate) struct SharedBuffer {
    pub(crate) id: Option<LoadBufferId>,
    pub(crate) owner: Option<RegId>,
    pub(crate) buffer: LoadBuffer,
}

/// Fixed pool of shared load buffers
#[derive(Debug)]
pub struct BufferPool {
    slots: Vec<SharedBuffer>,
    serial: IdSerial<LoadBufferId>,
}

impl BufferPool {
    /// Create `count` buffers of `capacity` bytes each
    pub fn new(count: usize, capacity: usize) -> Self {
        let slots = (0..count)
            .map(|_| SharedBuffer {
                id: None,
                owner: None,
                buffer: LoadBuffer::new(TableData::zeroed(capacity)),
            })
            .collect();
        Self {
            slots,
            serial: IdSerial::new(),
        }
    }

    /// Loan a free buffer to `owner`
    pub fn acquire(&mut self, owner: RegId) -> Result<LoadBufferId> {
        let slots = &self.slots;
        let id = self
            .serial
            .next(slots.len(), |index| slots[index].id.is_some())
            .ok_or(TblError::NoBufferAvailable)?;
        let index = id.to_index(self.slots.len());
        let slot = &mut self.slots[index];
        slot.id = Some(id);
        slot.owner = Some(owner);
        slot.buffer.reset();
        Ok(id)
    }

    /// Return a buffer to the pool; stale IDs are ignored
    pub fn release(&mut self, id: LoadBufferId) {
        let index = id.to_index(self.slots.len());
        let slot = &mut self.slots[index];
        if slot.id == Some(id) {
            slot.id = None;
            slot.owner = None;
            slot.buffer.reset();
        }
    }

    /// Buffer named by `id`, if it is still loaned out
    pub fn get(&self, id: LoadBufferId) -> Option<&LoadBuffer> {
        let slot = &self.slots[id.to_index(self.slots.len())];
        (slot.id == Some(id)).then_some(&slot.buffer)
    }

    /// Mutable buffer named by `id`, if it is still loaned out
    pub fn get_mut(&mut self, id: LoadBufferId) -> Option<&mut LoadBuffer> {
        let index = id.to_index(self.slots.len());
        let slot = &mut self.slots[index];
        (slot.id == Some(id)).then_some(&mut slot.buffer)
    }

    /// Registry record the buffer is loaned to
    pub fn owner(&self, id: LoadBufferId) -> Option<RegId> {
        let slot = &self.slots[id.to_index(self.slots.len())];
        if slot.id == Some(id) {
            slot.owner
        } else {
            None
        }
    }

    /// Release every buffer loaned to `owner`
    pub fn release_owned_by(&mut self, owner: RegId) {
        for slot in self.slots.iter_mut().filter(|slot| slot.owner == Some(owner)) {
            slot.id = None;
            slot.owner = None;
            slot.buffer.reset();
        }
    }

    /// Number of free buffers
    pub fn free_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.id.is_none()).count()
    }

    /// Total number of buffers
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Byte budget for local table buffers
#[derive(Debug)]
pub struct MemPool {
    total: usize,
    used: Mutex<usize>,
}

impl MemPool {
    /// Create a pool of `total` bytes
    pub fn new(total: usize) -> Self {
        Self {
            total,
            used: Mutex::new(0),
        }
    }

    /// Allocate zeroed storage of `len` bytes
    pub fn allocate(&self, len: usize) -> Result<TableData> {
        let mut used = self.used.lock();
        if *used + len > self.total {
            return Err(TblError::PoolExhausted);
        }
        *used += len;
        Ok(TableData::zeroed(len))
    }

    /// Return `len` bytes to the pool
    pub fn free(&self, len: usize) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(len);
    }

    /// Bytes still available
    pub fn available(&self) -> usize {
        self.total - *self.used.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_acquire_release() {
        let mut pool = BufferPool::new(2, 64);
        let owner = RegId::from_serial(1);
        let a = pool.acquire(owner).unwrap();
        let b = pool.acquire(owner).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.free_count(), 0);
        assert!(matches!(pool.acquire(owner), Err(TblError::NoBufferAvailable)));

        pool.release(a);
        assert_eq!(pool.free_count(), 1);
        assert!(pool.get(a).is_none());

        // Reacquiring the slot yields a new ID
        let c = pool.acquire(owner).unwrap();
        assert_ne!(a, c);
        assert!(pool.get(a).is_none());
        assert_eq!(pool.owner(c), Some(owner));
    }

    #[test]
    fn test_release_owned_by() {
        let mut pool = BufferPool::new(3, 16);
        let first = RegId::from_serial(1);
        let second = RegId::from_serial(2);
        pool.acquire(first).unwrap();
        pool.acquire(first).unwrap();
        let kept = pool.acquire(second).unwrap();
        pool.release_owned_by(first);
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.owner(kept), Some(second));
    }

    #[test]
    fn test_copy_image() {
        let mut src = LoadBuffer::new(TableData::from_vec(vec![1, 2, 3, 4]));
        src.content_size = 4;
        src.source = "/cf/a.tbl".to_string();
        src.update_crc();
        let mut dst = LoadBuffer::new(TableData::zeroed(8));
        dst.copy_image_from(&src);
        assert_eq!(dst.data.to_vec(4), vec![1, 2, 3, 4]);
        assert_eq!(dst.crc, src.crc);
        assert_eq!(dst.source, "/cf/a.tbl");
    }

    #[test]
    fn test_mem_pool_budget() {
        let pool = MemPool::new(100);
        let data = pool.allocate(60).unwrap();
        assert_eq!(data.len(), 60);
        assert!(matches!(pool.allocate(50), Err(TblError::PoolExhausted)));
        pool.free(60);
        assert_eq!(pool.available(), 100);
    }
}

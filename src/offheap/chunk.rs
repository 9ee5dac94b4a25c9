//! Chunks handed out by the allocator
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────┐
//! │ header (8 bytes)             │ data region                  │
//! │ ┌──────────────┬───────────┐ │ (size - HEADER_SIZE bytes)   │
//! │ │ size: u32 LE │ state: u32│ │                              │
//! │ └──────────────┴───────────┘ │                              │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! Ownership is explicit: every [`StoredObject::retain`] must be matched by a
//! [`StoredObject::release`]. The release that takes the count to zero
//! returns the chunk to the free list. Dropping a handle does nothing.

use super::allocator::AllocatorInner;
use crate::error::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

/// Bytes of bookkeeping in front of every data region
pub const HEADER_SIZE: usize = 8;

/// Every chunk size is a multiple of this
pub const ALIGNMENT: usize = 8;

/// Header plus one aligned word of data
pub const MIN_CHUNK_SIZE: usize = HEADER_SIZE + ALIGNMENT;

const HEADER_ALLOCATED: u32 = 0x4F48_4131; // "OHA1"
const HEADER_FREE: u32 = 0x4F48_4630; // "OHF0"

/// Total chunk size needed to hold `data_size` bytes
pub fn chunk_size_for(data_size: usize) -> Result<usize> {
    if data_size == 0 {
        return Err(Error::InvalidSize(data_size));
    }
    let padded = data_size
        .checked_add(HEADER_SIZE + ALIGNMENT - 1)
        .ok_or(Error::InvalidSize(data_size))?;
    let total = (padded & !(ALIGNMENT - 1)).max(MIN_CHUNK_SIZE);
    if total > u32::MAX as usize {
        return Err(Error::InvalidSize(data_size));
    }
    Ok(total)
}

/// Encoded header bytes for a chunk of `size` bytes
pub(crate) fn encode_header(size: usize, state: ChunkState) -> [u8; HEADER_SIZE] {
    let marker = match state {
        ChunkState::Allocated => HEADER_ALLOCATED,
        ChunkState::Free => HEADER_FREE,
    };
    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(&(size as u32).to_le_bytes());
    header[4..].copy_from_slice(&marker.to_le_bytes());
    header
}

/// Whether a chunk is owned by someone or sitting on the free list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Allocated,
    Free,
}

/// Bookkeeping for one lifetime of a chunk
///
/// A reused address gets a new record, so a stale handle from an earlier
/// lifetime only ever sees a zero reference count.
#[derive(Debug)]
pub(crate) struct ChunkRecord {
    offset: usize,
    size: usize,
    ref_count: AtomicU32,
    state: AtomicU8,
}

impl ChunkRecord {
    /// A freshly allocated chunk with one owner
    pub(crate) fn allocated(offset: usize, size: usize) -> Self {
        Self {
            offset,
            size,
            ref_count: AtomicU32::new(1),
            state: AtomicU8::new(ChunkState::Allocated as u8),
        }
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn data_offset(&self) -> usize {
        self.offset + HEADER_SIZE
    }

    pub(crate) fn data_size(&self) -> usize {
        self.size - HEADER_SIZE
    }

    pub(crate) fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> ChunkState {
        if self.state.load(Ordering::Acquire) == ChunkState::Free as u8 {
            ChunkState::Free
        } else {
            ChunkState::Allocated
        }
    }

    /// Only called with the owning slab locked
    pub(crate) fn set_state(&self, state: ChunkState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Add an owner; fails once the count has reached zero
    fn retain(&self) -> bool {
        let mut current = self.ref_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop an owner, returning the count before the decrement
    ///
    /// `None` means the count was already zero.
    fn release(&self) -> Option<u32> {
        let mut current = self.ref_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Handle to a chunk of off-heap memory
///
/// Handles are cheap to clone; clones share the same reference count but do
/// not add an owner. Call [`retain`](Self::retain) for that.
#[derive(Clone)]
pub struct StoredObject {
    inner: Arc<AllocatorInner>,
    slab: usize,
    record: Arc<ChunkRecord>,
}

impl StoredObject {
    pub(crate) fn new(inner: Arc<AllocatorInner>, slab: usize, record: Arc<ChunkRecord>) -> Self {
        Self {
            inner,
            slab,
            record,
        }
    }

    /// Address of the chunk header
    pub fn address(&self) -> usize {
        self.inner.slab(self.slab).base_address() + self.record.offset()
    }

    /// Total size of the chunk, header included
    pub fn size(&self) -> usize {
        self.record.size()
    }

    /// Bytes available to the caller
    pub fn data_size(&self) -> usize {
        self.record.data_size()
    }

    pub fn ref_count(&self) -> u32 {
        self.record.ref_count()
    }

    pub fn state(&self) -> ChunkState {
        self.record.state()
    }

    /// Id of the slab the chunk was carved from
    pub fn slab_id(&self) -> usize {
        self.slab
    }

    /// Register an additional owner
    pub fn retain(&self) -> Result<()> {
        self.inner.ensure_open()?;
        if self.record.retain() {
            Ok(())
        } else {
            Err(Error::ChunkFreed {
                address: self.address(),
            })
        }
    }

    /// Drop one owner
    ///
    /// Returns `true` when this call freed the chunk. Releasing a chunk
    /// whose count is already zero is a [`Error::DoubleFree`].
    pub fn release(&self) -> Result<bool> {
        self.inner.ensure_open()?;
        match self.record.release() {
            None => Err(Error::DoubleFree {
                address: self.address(),
            }),
            Some(1) => {
                self.inner.free_chunk(self.slab, &self.record)?;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    fn check_data_range(&self, offset: usize, len: usize) -> Result<()> {
        let limit = self.data_size();
        match offset.checked_add(len) {
            Some(end) if end <= limit => Ok(()),
            _ => Err(Error::OutOfBounds { offset, len, limit }),
        }
    }

    /// Write `bytes` at `offset` within the data region
    pub fn write_data_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_data_range(offset, bytes.len())?;
        self.inner.ensure_open()?;
        self.inner
            .slab(self.slab)
            .write(self.record.data_offset() + offset, bytes)
    }

    /// Read `len` bytes at `offset` within the data region
    pub fn read_data_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check_data_range(offset, len)?;
        self.inner.ensure_open()?;
        self.inner
            .slab(self.slab)
            .read(self.record.data_offset() + offset, len)
    }

    /// Check that the whole data region still holds the fill pattern
    ///
    /// Only meaningful with fill validation enabled; otherwise a no-op.
    /// Expected to fail once the caller has written data into the chunk.
    pub fn validate_fill(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner
            .validate_chunk(self.slab, &self.record, self.address())
    }
}

impl fmt::Debug for StoredObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredObject")
            .field("slab", &self.slab)
            .field("address", &format_args!("{:#x}", self.address()))
            .field("size", &self.size())
            .field("ref_count", &self.ref_count())
            .field("state", &self.state())
            .finish()
    }
}

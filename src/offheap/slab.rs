//! Fixed-size memory slabs

use super::fill::FILL_BYTE;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::fmt;

/// One contiguous region of memory reserved up front
///
/// The size never changes. The bytes are released only when the allocator
/// tears down, after which every access fails with [`Error::Closed`].
pub struct Slab {
    id: usize,
    size: usize,
    base_address: usize,
    memory: RwLock<Option<Box<[u8]>>>,
}

impl Slab {
    /// Reserve a slab of `size` bytes, zero-initialised
    pub fn new(id: usize, size: usize) -> Self {
        Self::with_initial_byte(id, size, 0)
    }

    /// Reserve a slab whose every byte is the fill pattern
    ///
    /// Chunks carved from pristine memory then pass fill validation.
    pub fn with_fill(id: usize, size: usize) -> Self {
        Self::with_initial_byte(id, size, FILL_BYTE)
    }

    fn with_initial_byte(id: usize, size: usize, byte: u8) -> Self {
        let memory = vec![byte; size].into_boxed_slice();
        let base_address = memory.as_ptr() as usize;
        Self {
            id,
            size,
            base_address,
            memory: RwLock::new(Some(memory)),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Address of the first byte of the slab
    pub fn base_address(&self) -> usize {
        self.base_address
    }

    /// Whether `[address, address + len)` lies entirely inside this slab
    pub fn contains(&self, address: usize, len: usize) -> bool {
        address >= self.base_address
            && address
                .checked_add(len)
                .is_some_and(|end| end <= self.base_address + self.size)
    }

    pub fn is_released(&self) -> bool {
        self.memory.read().is_none()
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::OutOfBounds {
                offset,
                len,
                limit: self.size,
            }),
        }
    }

    /// Copy `len` bytes starting at `offset`
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check_range(offset, len)?;
        let memory = self.memory.read();
        let memory = memory.as_ref().ok_or(Error::Closed)?;
        Ok(memory[offset..offset + len].to_vec())
    }

    /// Overwrite bytes starting at `offset`
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_range(offset, bytes.len())?;
        let mut memory = self.memory.write();
        let memory = memory.as_mut().ok_or(Error::Closed)?;
        memory[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Set `len` bytes starting at `offset` to `byte`
    pub fn fill(&self, offset: usize, len: usize, byte: u8) -> Result<()> {
        self.check_range(offset, len)?;
        let mut memory = self.memory.write();
        let memory = memory.as_mut().ok_or(Error::Closed)?;
        memory[offset..offset + len].fill(byte);
        Ok(())
    }

    /// Whether every byte of `[offset, offset + len)` equals `byte`
    pub fn matches(&self, offset: usize, len: usize, byte: u8) -> Result<bool> {
        self.check_range(offset, len)?;
        let memory = self.memory.read();
        let memory = memory.as_ref().ok_or(Error::Closed)?;
        Ok(memory[offset..offset + len].iter().all(|&b| b == byte))
    }

    /// Give the memory back; idempotent
    pub(crate) fn release(&self) {
        self.memory.write().take();
    }
}

impl fmt::Debug for Slab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slab")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("base_address", &format_args!("{:#x}", self.base_address))
            .finish()
    }
}

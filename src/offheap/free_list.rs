//! Free list management for released chunks
//!
//! Two indexes over the same set of free chunks:
//!
//! ```text
//! by_size:    (16, 0x40) (16, 0x900) (1032, 0x100) (4096, 0x500)
//!                 ^ best fit for 16 bytes
//! by_address: 0x40 → 16, 0x100 → 1032, 0x500 → 4096, 0x900 → 16
//!                 ^ walked in order by the compactor
//! ```

use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Size- and address-ordered index of the free chunks of one slab
///
/// Sizes are total chunk sizes (header included). Offsets are slab offsets.
#[derive(Debug, Default)]
pub struct FreeListManager {
    by_size: BTreeSet<(usize, usize)>,
    by_address: BTreeMap<usize, usize>,
    free_bytes: usize,
}

impl FreeListManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a released chunk
    pub fn insert(&mut self, offset: usize, size: usize) -> Result<()> {
        if self.by_address.contains_key(&offset) {
            return Err(Error::Corrupted(format!(
                "chunk at offset {} is already on the free list",
                offset
            )));
        }
        self.by_address.insert(offset, size);
        self.by_size.insert((size, offset));
        self.free_bytes += size;
        Ok(())
    }

    /// The smallest free chunk of at least `size` bytes, left in place
    pub fn peek_best_fit(&self, size: usize) -> Option<(usize, usize)> {
        self.by_size
            .range((size, 0)..)
            .next()
            .map(|&(size, offset)| (offset, size))
    }

    /// Remove and return the smallest free chunk of at least `size` bytes
    ///
    /// Ties go to the lowest address. Returns `(offset, size)`.
    pub fn take_best_fit(&mut self, size: usize) -> Option<(usize, usize)> {
        let (offset, size) = self.peek_best_fit(size)?;
        self.remove(offset);
        Some((offset, size))
    }

    /// Remove the chunk at `offset`, returning its size
    pub fn remove(&mut self, offset: usize) -> Option<usize> {
        let size = self.by_address.remove(&offset)?;
        self.by_size.remove(&(size, offset));
        self.free_bytes -= size;
        Some(size)
    }

    pub fn contains(&self, offset: usize) -> bool {
        self.by_address.contains_key(&offset)
    }

    /// Free chunks in ascending address order as `(offset, size)`
    pub fn iter_by_address(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.by_address.iter().map(|(&offset, &size)| (offset, size))
    }

    /// Size of the largest free chunk
    pub fn largest(&self) -> usize {
        self.by_size.last().map(|&(size, _)| size).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }
}

//! Per-slab bookkeeping
//!
//! A slab is a fixed arena; chunks, free chunks and fragments are offset
//! records over it. At any time the records partition the slab:
//!
//! ```text
//! 0                                                          size
//! | chunk (A) | chunk (F) | chunk (A) | fragment remainder  |
//! ```

use super::chunk::{encode_header, ChunkRecord, ChunkState};
use super::fill::FillPatternValidator;
use super::fragment::Fragment;
use super::free_list::FreeListManager;
use super::slab::Slab;
use super::stats::{BlockKind, MemoryBlock};
use crate::error::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A slab together with the lock guarding its bookkeeping
pub(crate) struct SlabArena {
    slab: Slab,
    state: Mutex<SlabState>,
}

impl SlabArena {
    pub(crate) fn new(slab: Slab) -> Self {
        let state = SlabState::new(slab.size());
        Self {
            slab,
            state: Mutex::new(state),
        }
    }

    pub(crate) fn slab(&self) -> &Slab {
        &self.slab
    }

    /// Exclusive access to the bookkeeping of this slab
    pub(crate) fn lock(&self) -> MutexGuard<'_, SlabState> {
        self.state.lock()
    }
}

/// Chunks, free list and fragments of one slab
pub(crate) struct SlabState {
    /// Every chunk that currently exists, allocated or free
    pub(crate) chunks: BTreeMap<usize, Arc<ChunkRecord>>,
    pub(crate) free_list: FreeListManager,
    pub(crate) fragments: Vec<Fragment>,
}

impl SlabState {
    fn new(slab_size: usize) -> Self {
        Self {
            chunks: BTreeMap::new(),
            free_list: FreeListManager::new(),
            fragments: vec![Fragment::new(0, slab_size)],
        }
    }

    /// Carve a new chunk of `size` bytes from the first fragment with room
    pub(crate) fn carve(
        &mut self,
        slab: &Slab,
        size: usize,
    ) -> Result<Option<Arc<ChunkRecord>>> {
        let offset = match self.fragments.iter_mut().find_map(|f| f.carve(size)) {
            Some(offset) => offset,
            None => return Ok(None),
        };
        self.fragments.retain(|f| !f.is_exhausted());
        self.install(slab, offset, size).map(Some)
    }

    /// Reuse the best-fitting free chunk of at least `size` bytes
    pub(crate) fn reuse(
        &mut self,
        slab: &Slab,
        size: usize,
    ) -> Result<Option<Arc<ChunkRecord>>> {
        match self.free_list.take_best_fit(size) {
            Some((offset, size)) => self.install(slab, offset, size).map(Some),
            None => Ok(None),
        }
    }

    fn install(&mut self, slab: &Slab, offset: usize, size: usize) -> Result<Arc<ChunkRecord>> {
        slab.write(offset, &encode_header(size, ChunkState::Allocated))?;
        let record = Arc::new(ChunkRecord::allocated(offset, size));
        self.chunks.insert(offset, Arc::clone(&record));
        Ok(record)
    }

    /// Move a chunk whose reference count reached zero onto the free list
    pub(crate) fn free(
        &mut self,
        slab: &Slab,
        record: &ChunkRecord,
        fill: &FillPatternValidator,
    ) -> Result<()> {
        let live = self
            .chunks
            .get(&record.offset())
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), record));
        if !live || record.state() != ChunkState::Allocated {
            return Err(Error::Corrupted(format!(
                "freed chunk at offset {} of slab {} is not live",
                record.offset(),
                slab.id()
            )));
        }

        // Record stays Allocated until the slab and the free list agree
        slab.write(record.offset(), &encode_header(record.size(), ChunkState::Free))?;
        fill.fill(slab, record.data_offset(), record.data_size())?;
        self.free_list.insert(record.offset(), record.size())?;
        record.set_state(ChunkState::Free);
        Ok(())
    }

    pub(crate) fn peek_best_fit(&self, size: usize) -> Option<usize> {
        self.free_list.peek_best_fit(size).map(|(_, size)| size)
    }

    pub(crate) fn fragment_bytes(&self) -> usize {
        self.fragments.iter().map(Fragment::remaining).sum()
    }

    pub(crate) fn largest_fragment(&self) -> usize {
        self.fragments
            .iter()
            .map(Fragment::remaining)
            .max()
            .unwrap_or(0)
    }

    pub(crate) fn allocated(&self) -> impl Iterator<Item = &Arc<ChunkRecord>> + '_ {
        self.chunks
            .values()
            .filter(|c| c.state() == ChunkState::Allocated)
    }

    /// Every block of the slab in address order
    pub(crate) fn blocks(&self, slab: &Slab) -> Vec<MemoryBlock> {
        let base = slab.base_address();
        let mut blocks: Vec<MemoryBlock> = self
            .chunks
            .values()
            .map(|c| MemoryBlock {
                slab: slab.id(),
                offset: c.offset(),
                address: base + c.offset(),
                size: c.size(),
                kind: match c.state() {
                    ChunkState::Allocated => BlockKind::Allocated,
                    ChunkState::Free => BlockKind::Free,
                },
                ref_count: c.ref_count(),
            })
            .chain(
                self.fragments
                    .iter()
                    .filter(|f| !f.is_exhausted())
                    .map(|f| MemoryBlock {
                        slab: slab.id(),
                        offset: f.free_start(),
                        address: base + f.free_start(),
                        size: f.remaining(),
                        kind: BlockKind::Unused,
                        ref_count: 0,
                    }),
            )
            .collect();
        blocks.sort_by_key(|b| b.offset);
        blocks
    }

    /// Verify that the blocks tile the slab and that the free list agrees
    /// with the chunk states
    pub(crate) fn check_partition(&self, slab: &Slab) -> Result<()> {
        let mut expected = 0;
        for block in self.blocks(slab) {
            if block.offset != expected {
                return Err(Error::Corrupted(format!(
                    "slab {}: block at offset {} but previous block ends at {}",
                    slab.id(),
                    block.offset,
                    expected
                )));
            }
            expected += block.size;
        }
        if expected != slab.size() {
            return Err(Error::Corrupted(format!(
                "slab {}: blocks cover {} of {} bytes",
                slab.id(),
                expected,
                slab.size()
            )));
        }

        for (offset, chunk) in &self.chunks {
            let listed = self.free_list.contains(*offset);
            let free = chunk.state() == ChunkState::Free;
            if listed != free {
                return Err(Error::Corrupted(format!(
                    "slab {}: chunk at offset {} is {:?} but free-listed = {}",
                    slab.id(),
                    offset,
                    chunk.state(),
                    listed
                )));
            }
        }
        let free_chunks = self
            .chunks
            .values()
            .filter(|c| c.state() == ChunkState::Free)
            .count();
        if self.free_list.len() != free_chunks {
            return Err(Error::Corrupted(format!(
                "slab {}: free list holds chunks that do not exist",
                slab.id()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_carve_until_exhausted() -> Result<()> {
        let arena = SlabArena::new(Slab::new(0, 64));
        let mut state = arena.lock();

        let a = state.carve(arena.slab(), 32)?.expect("first chunk");
        let b = state.carve(arena.slab(), 32)?.expect("second chunk");
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 32);
        assert!(state.carve(arena.slab(), 16)?.is_none());
        assert!(state.fragments.is_empty());

        state.check_partition(arena.slab())
    }

    #[test]
    fn test_free_and_reuse() -> Result<()> {
        let arena = SlabArena::new(Slab::new(0, 256));
        let fill = FillPatternValidator::new(false);
        let mut state = arena.lock();

        let a = state.carve(arena.slab(), 64)?.expect("chunk");
        state.free(arena.slab(), &a, &fill)?;
        assert_eq!(a.state(), ChunkState::Free);
        state.check_partition(arena.slab())?;

        // Freeing the same lifetime twice is a bookkeeping error
        assert!(state.free(arena.slab(), &a, &fill).is_err());

        let b = state.reuse(arena.slab(), 48)?.expect("reused chunk");
        assert_eq!(b.offset(), a.offset());
        assert_eq!(b.size(), 64);
        assert_eq!(b.ref_count(), 1);
        assert!(!Arc::ptr_eq(&a, &b));
        state.check_partition(arena.slab())
    }

    #[test]
    fn test_failed_free_keeps_chunk_allocated() -> Result<()> {
        let arena = SlabArena::new(Slab::with_fill(0, 256));
        let fill = FillPatternValidator::new(true);
        let mut state = arena.lock();

        let a = state.carve(arena.slab(), 64)?.expect("chunk");
        arena.slab().release();

        assert!(matches!(
            state.free(arena.slab(), &a, &fill),
            Err(Error::Closed)
        ));
        assert_eq!(a.state(), ChunkState::Allocated);
        assert!(state.free_list.is_empty());
        assert_eq!(state.allocated().count(), 1);
        Ok(())
    }

    #[test]
    fn test_blocks_in_address_order() -> Result<()> {
        let arena = SlabArena::new(Slab::new(0, 100));
        let fill = FillPatternValidator::new(false);
        let mut state = arena.lock();

        let a = state.carve(arena.slab(), 16)?.expect("chunk");
        let _b = state.carve(arena.slab(), 24)?.expect("chunk");
        state.free(arena.slab(), &a, &fill)?;

        let kinds: Vec<_> = state
            .blocks(arena.slab())
            .iter()
            .map(|b| (b.offset, b.size, b.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (0, 16, BlockKind::Free),
                (16, 24, BlockKind::Allocated),
                (40, 60, BlockKind::Unused),
            ]
        );
        Ok(())
    }
}

//! Memory allocator facade
//!
//! Allocation tries, in order, first success wins:
//!
//! ```text
//! allocate(size)
//!   ├─→ 1. best-fit free chunk across all slabs
//!   ├─→ 2. carve from a fragment (slabs in registration order)
//!   ├─→ 3. compact every slab, then retry 1 and 2 once
//!   └─→ 4. OutOfOffHeapMemory (listener notified)
//! ```

use super::arena::{SlabArena, SlabState};
use super::chunk::{chunk_size_for, ChunkRecord, ChunkState, StoredObject};
use super::compactor::Compactor;
use super::fill::{FillPatternValidator, FILL_BYTE};
use super::listener::OutOfOffHeapMemoryListener;
use super::slab::Slab;
use super::stats::{MemoryBlock, MemoryMetrics, OffHeapMemoryStats};
use crate::error::{Error, Result};
use crate::settings::{check_slab_size, AllocatorConfig};
use parking_lot::MutexGuard;
use prometheus::Registry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// State shared by the allocator and every handle it gives out
pub(crate) struct AllocatorInner {
    arenas: Vec<SlabArena>,
    fill: FillPatternValidator,
    metrics: MemoryMetrics,
    listener: Box<dyn OutOfOffHeapMemoryListener>,
    closed: AtomicBool,
}

impl AllocatorInner {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn slab(&self, index: usize) -> &Slab {
        self.arenas[index].slab()
    }

    /// Return a chunk whose reference count just reached zero
    pub(crate) fn free_chunk(&self, slab: usize, record: &ChunkRecord) -> Result<()> {
        let arena = &self.arenas[slab];
        let mut state = arena.lock();
        state.free(arena.slab(), record, &self.fill)?;
        self.metrics.releases.inc();
        debug!(
            slab,
            offset = record.offset(),
            size = record.size(),
            "Freed chunk"
        );
        Ok(())
    }

    /// Fill check of a chunk's data region, under the slab lock
    pub(crate) fn validate_chunk(
        &self,
        slab: usize,
        record: &ChunkRecord,
        address: usize,
    ) -> Result<()> {
        if !self.fill.is_enabled() {
            return Ok(());
        }
        let arena = &self.arenas[slab];
        let _state = arena.lock();
        self.metrics.fill_validations.inc();
        self.fill.validate(
            arena.slab(),
            record.data_offset(),
            record.data_size(),
            address,
            record.size(),
        )
    }
}

/// Off-heap allocator over one or more slabs
///
/// Cloning gives another handle to the same allocator. There is no global
/// instance; construct one and pass it where it is needed.
#[derive(Clone)]
pub struct MemoryAllocator {
    inner: Arc<AllocatorInner>,
}

impl MemoryAllocator {
    /// Reserve the slabs described by `config`
    pub fn new(
        config: AllocatorConfig,
        listener: Box<dyn OutOfOffHeapMemoryListener>,
    ) -> Result<Self> {
        config.validate()?;
        let slabs = config
            .slab_sizes
            .iter()
            .enumerate()
            .map(|(id, &size)| {
                if config.validate_fill_pattern {
                    Slab::with_fill(id, size)
                } else {
                    Slab::new(id, size)
                }
            })
            .collect();
        Self::with_slabs(slabs, config.validate_fill_pattern, listener)
    }

    /// Build over slabs the caller reserved
    ///
    /// Slab ids must be `0..n` in order, so that a chunk's
    /// [`slab_id`](StoredObject::slab_id) and [`MemoryBlock::slab`] agree.
    /// With fill validation on, slabs that are not already pristine are
    /// filled with [`FILL_BYTE`] so fresh chunks validate.
    pub fn with_slabs(
        slabs: Vec<Slab>,
        validate_fill_pattern: bool,
        listener: Box<dyn OutOfOffHeapMemoryListener>,
    ) -> Result<Self> {
        if slabs.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one slab is required".to_string(),
            ));
        }
        for (index, slab) in slabs.iter().enumerate() {
            if slab.id() != index {
                return Err(Error::InvalidConfig(format!(
                    "slab at position {} has id {}",
                    index,
                    slab.id()
                )));
            }
            check_slab_size(slab.size())?;
            if validate_fill_pattern && !slab.matches(0, slab.size(), FILL_BYTE)? {
                slab.fill(0, slab.size(), FILL_BYTE)?;
            }
        }

        let total: usize = slabs.iter().map(Slab::size).sum();
        info!(
            slabs = slabs.len(),
            total_bytes = total,
            validate_fill = validate_fill_pattern,
            "Initializing off-heap memory allocator"
        );

        let inner = AllocatorInner {
            arenas: slabs.into_iter().map(SlabArena::new).collect(),
            fill: FillPatternValidator::new(validate_fill_pattern),
            metrics: MemoryMetrics::new()?,
            listener,
            closed: AtomicBool::new(false),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Allocate a chunk with at least `size` bytes of data
    ///
    /// The chunk starts with a reference count of one.
    pub fn allocate(&self, size: usize) -> Result<StoredObject> {
        self.inner.ensure_open()?;
        let chunk_size = chunk_size_for(size)?;

        if let Some(chunk) = self.try_allocate(chunk_size)? {
            return Ok(chunk);
        }

        debug!(size, chunk_size, "No room for chunk, compacting");
        self.compact()?;
        if let Some(chunk) = self.try_allocate(chunk_size)? {
            return Ok(chunk);
        }

        let error = Error::OutOfOffHeapMemory {
            requested: size,
            total: self.total_memory(),
        };
        self.inner.metrics.out_of_memory.inc();
        warn!(
            size,
            free = self.free_memory(),
            "Off-heap allocation failed after compaction"
        );
        self.inner.listener.out_of_off_heap_memory(&error);
        Err(error)
    }

    fn try_allocate(&self, chunk_size: usize) -> Result<Option<StoredObject>> {
        if let Some(chunk) = self.allocate_from_free_list(chunk_size)? {
            return Ok(Some(chunk));
        }
        self.allocate_from_fragments(chunk_size)
    }

    /// Smallest fitting free chunk across every slab
    fn allocate_from_free_list(&self, chunk_size: usize) -> Result<Option<StoredObject>> {
        // Slabs are always locked in registration order
        let mut states: Vec<MutexGuard<'_, SlabState>> =
            self.inner.arenas.iter().map(SlabArena::lock).collect();

        let best = states
            .iter()
            .enumerate()
            .filter_map(|(slab, state)| state.peek_best_fit(chunk_size).map(|size| (size, slab)))
            .min();
        let slab = match best {
            Some((_, slab)) => slab,
            None => return Ok(None),
        };

        let record = match states[slab].reuse(self.inner.slab(slab), chunk_size)? {
            Some(record) => record,
            None => return Ok(None),
        };
        drop(states);

        debug!(
            slab,
            offset = record.offset(),
            size = record.size(),
            "Reused free chunk"
        );
        Ok(Some(self.hand_out(slab, record)))
    }

    fn allocate_from_fragments(&self, chunk_size: usize) -> Result<Option<StoredObject>> {
        for (slab, arena) in self.inner.arenas.iter().enumerate() {
            let mut state = arena.lock();
            if let Some(record) = state.carve(arena.slab(), chunk_size)? {
                drop(state);
                debug!(
                    slab,
                    offset = record.offset(),
                    size = record.size(),
                    "Carved chunk from fragment"
                );
                return Ok(Some(self.hand_out(slab, record)));
            }
        }
        Ok(None)
    }

    fn hand_out(&self, slab: usize, record: Arc<ChunkRecord>) -> StoredObject {
        self.inner.metrics.allocations.inc();
        StoredObject::new(Arc::clone(&self.inner), slab, record)
    }

    /// Merge adjacent free space on every slab
    ///
    /// Returns the number of bytes now held by merged fragments.
    pub fn compact(&self) -> Result<usize> {
        self.inner.ensure_open()?;
        let start = Instant::now();
        let mut merged = 0;
        for arena in &self.inner.arenas {
            let mut state = arena.lock();
            merged += Compactor::compact(arena.slab(), &mut state, &self.inner.fill)?.bytes_merged;
        }
        let elapsed = start.elapsed();
        self.inner.metrics.observe_compaction(elapsed);
        info!(bytes_merged = merged, elapsed = ?elapsed, "Compaction finished");
        Ok(merged)
    }

    pub fn slab_count(&self) -> usize {
        self.inner.arenas.len()
    }

    pub fn validate_fill_pattern(&self) -> bool {
        self.inner.fill.is_enabled()
    }

    /// Capacity over all slabs
    pub fn total_memory(&self) -> usize {
        self.inner.arenas.iter().map(|a| a.slab().size()).sum()
    }

    /// Bytes held by allocated chunks
    pub fn used_memory(&self) -> usize {
        self.inner
            .arenas
            .iter()
            .map(|a| a.lock().allocated().map(|c| c.size()).sum::<usize>())
            .sum()
    }

    /// Bytes on free lists plus uncarved fragment space
    pub fn free_memory(&self) -> usize {
        self.inner
            .arenas
            .iter()
            .map(|a| {
                let state = a.lock();
                state.free_list.free_bytes() + state.fragment_bytes()
            })
            .sum()
    }

    /// Snapshot of the allocator statistics
    pub fn stats(&self) -> OffHeapMemoryStats {
        let mut stats = OffHeapMemoryStats {
            slabs: self.inner.arenas.len(),
            ..Default::default()
        };
        for arena in &self.inner.arenas {
            let state = arena.lock();
            stats.total_memory += arena.slab().size();
            for chunk in state.allocated() {
                stats.objects += 1;
                stats.used_memory += chunk.size();
            }
            stats.free_memory += state.free_list.free_bytes() + state.fragment_bytes();
            stats.free_list_chunks += state.free_list.len();
            stats.fragments += state.fragments.len();
            stats.largest_fragment = stats.largest_fragment.max(state.largest_fragment());
        }
        self.inner.metrics.update(&mut stats);
        stats
    }

    /// Every block of every slab in address order
    pub fn inspect(&self) -> Vec<MemoryBlock> {
        let mut blocks: Vec<MemoryBlock> = self
            .inner
            .arenas
            .iter()
            .flat_map(|a| a.lock().blocks(a.slab()))
            .collect();
        blocks.sort_by_key(|b| b.address);
        blocks
    }

    /// Verify that every slab is exactly partitioned into allocated chunks,
    /// free chunks and fragment space
    pub fn check_partition(&self) -> Result<()> {
        for arena in &self.inner.arenas {
            arena.lock().check_partition(arena.slab())?;
        }
        Ok(())
    }

    /// The allocator's Prometheus registry
    pub fn metrics(&self) -> &Registry {
        self.inner.metrics.registry()
    }

    /// Prometheus text exposition, refreshed from a fresh snapshot
    pub fn export_metrics(&self) -> String {
        self.stats();
        self.inner.metrics.export()
    }

    /// Release every slab
    ///
    /// Outstanding handles stay safe to hold but every operation on them
    /// fails with [`Error::Closed`].
    pub fn free_all_off_heap_memory(self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut leaked = 0;
        for arena in &self.inner.arenas {
            let state = arena.lock();
            leaked += state
                .chunks
                .values()
                .filter(|c| c.state() == ChunkState::Allocated)
                .count();
            arena.slab().release();
        }
        if leaked > 0 {
            warn!(chunks = leaked, "Freeing off-heap memory with live chunks");
        }
        self.inner.listener.close();
        info!("Off-heap memory freed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offheap::chunk::{HEADER_SIZE, MIN_CHUNK_SIZE};
    use crate::offheap::listener::NullOutOfOffHeapMemoryListener;
    use crate::offheap::stats::BlockKind;
    use std::sync::atomic::AtomicUsize;

    fn allocator(slab_size: usize, fill: bool) -> MemoryAllocator {
        MemoryAllocator::new(
            AllocatorConfig::single_slab(slab_size).with_fill_validation(fill),
            Box::new(NullOutOfOffHeapMemoryListener),
        )
        .expect("allocator")
    }

    struct CountingListener(Arc<AtomicUsize>);

    impl OutOfOffHeapMemoryListener for CountingListener {
        fn out_of_off_heap_memory(&self, _error: &Error) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_allocate_basic() -> Result<()> {
        let allocator = allocator(4096, false);
        let chunk = allocator.allocate(100)?;

        assert!(chunk.size() >= 100);
        assert!(chunk.data_size() >= 100);
        assert_eq!(chunk.size(), chunk.data_size() + HEADER_SIZE);
        assert_eq!(chunk.ref_count(), 1);
        assert_eq!(chunk.state(), ChunkState::Allocated);

        chunk.write_data_bytes(0, b"Hello, Slab!")?;
        assert_eq!(chunk.read_data_bytes(0, 12)?, b"Hello, Slab!".to_vec());

        assert!(allocator.inner.slab(0).contains(chunk.address(), chunk.size()));
        allocator.check_partition()
    }

    #[test]
    fn test_invalid_size() {
        let allocator = allocator(4096, false);
        assert!(matches!(allocator.allocate(0), Err(Error::InvalidSize(0))));
    }

    #[test]
    fn test_release_and_reuse() -> Result<()> {
        let allocator = allocator(4096, false);
        let a = allocator.allocate(50)?;
        let _b = allocator.allocate(50)?;
        let address = a.address();

        assert!(a.release()?);
        assert_eq!(a.state(), ChunkState::Free);

        // Best fit picks the freed chunk back up
        let c = allocator.allocate(40)?;
        assert_eq!(c.address(), address);
        assert_eq!(c.size(), a.size());
        allocator.check_partition()
    }

    #[test]
    fn test_best_fit_across_sizes() -> Result<()> {
        let allocator = allocator(8192, false);
        let big = allocator.allocate(1000)?;
        let _sep1 = allocator.allocate(8)?;
        let small = allocator.allocate(100)?;
        let _sep2 = allocator.allocate(8)?;
        big.release()?;
        small.release()?;

        let chunk = allocator.allocate(90)?;
        assert_eq!(chunk.address(), small.address());
        Ok(())
    }

    #[test]
    fn test_retain_release() -> Result<()> {
        let allocator = allocator(1024, false);
        let chunk = allocator.allocate(16)?;
        chunk.retain()?;
        assert_eq!(chunk.ref_count(), 2);

        assert!(!chunk.release()?);
        assert_eq!(chunk.state(), ChunkState::Allocated);
        assert!(chunk.release()?);
        assert_eq!(chunk.state(), ChunkState::Free);

        assert!(matches!(chunk.release(), Err(Error::DoubleFree { .. })));
        assert!(matches!(chunk.retain(), Err(Error::ChunkFreed { .. })));
        allocator.check_partition()
    }

    #[test]
    fn test_stale_handle_cannot_free_new_owner() -> Result<()> {
        let allocator = allocator(1024, false);
        let old = allocator.allocate(32)?;
        old.release()?;
        let new = allocator.allocate(32)?;
        assert_eq!(old.address(), new.address());

        assert!(matches!(old.release(), Err(Error::DoubleFree { .. })));
        assert_eq!(new.ref_count(), 1);
        assert_eq!(new.state(), ChunkState::Allocated);
        Ok(())
    }

    #[test]
    fn test_bounds() -> Result<()> {
        let allocator = allocator(1024, false);
        let chunk = allocator.allocate(16)?;
        let limit = chunk.data_size();

        assert!(chunk.write_data_bytes(limit - 1, &[1]).is_ok());
        assert!(matches!(
            chunk.write_data_bytes(limit - 1, &[1, 2]),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(matches!(
            chunk.read_data_bytes(limit + 1, 0),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(chunk.read_data_bytes(usize::MAX, 1).is_err());
        Ok(())
    }

    #[test]
    fn test_out_of_memory_notifies_listener() -> Result<()> {
        let count = Arc::new(AtomicUsize::new(0));
        let allocator = MemoryAllocator::new(
            AllocatorConfig::single_slab(256),
            Box::new(CountingListener(Arc::clone(&count))),
        )?;

        let _a = allocator.allocate(200)?;
        match allocator.allocate(100) {
            Err(Error::OutOfOffHeapMemory { requested, total }) => {
                assert_eq!(requested, 100);
                assert_eq!(total, 256);
            }
            other => panic!("Expected out of memory, got {:?}", other),
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(allocator.stats().out_of_memory, 1);
        Ok(())
    }

    #[test]
    fn test_compaction_on_demand() -> Result<()> {
        let allocator = allocator(MIN_CHUNK_SIZE * 4, false);
        let chunks: Vec<_> = (0..4)
            .map(|_| allocator.allocate(MIN_CHUNK_SIZE - HEADER_SIZE))
            .collect::<Result<_>>()?;
        chunks[1].release()?;
        chunks[2].release()?;

        // Neither freed chunk alone is big enough
        let merged = allocator.allocate(MIN_CHUNK_SIZE * 2 - HEADER_SIZE)?;
        assert_eq!(merged.address(), chunks[1].address());
        assert_eq!(allocator.stats().compactions, 1);
        allocator.check_partition()
    }

    #[test]
    fn test_multiple_slabs() -> Result<()> {
        let allocator = MemoryAllocator::new(
            AllocatorConfig {
                slab_sizes: vec![64, 64],
                validate_fill_pattern: false,
            },
            Box::new(NullOutOfOffHeapMemoryListener),
        )?;
        let a = allocator.allocate(56)?;
        let b = allocator.allocate(56)?;
        assert_eq!(a.slab_id(), 0);
        assert_eq!(b.slab_id(), 1);
        assert!(allocator.allocate(8).is_err());

        b.release()?;
        let c = allocator.allocate(8)?;
        assert_eq!(c.slab_id(), 1);
        allocator.check_partition()
    }

    #[test]
    fn test_with_slabs_fills_plain_slabs() -> Result<()> {
        let allocator = MemoryAllocator::with_slabs(
            vec![Slab::new(0, 4096), Slab::with_fill(1, 4096)],
            true,
            Box::new(NullOutOfOffHeapMemoryListener),
        )?;
        let a = allocator.allocate(4000)?;
        let b = allocator.allocate(4000)?;
        assert_ne!(a.slab_id(), b.slab_id());
        a.validate_fill()?;
        b.validate_fill()?;
        allocator.check_partition()
    }

    #[test]
    fn test_with_slabs_rejects_bad_slabs() {
        let build = |slabs| {
            MemoryAllocator::with_slabs(slabs, false, Box::new(NullOutOfOffHeapMemoryListener))
        };
        assert!(matches!(
            build(vec![Slab::new(7, 4096)]),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            build(vec![Slab::new(0, 4096), Slab::new(0, 4096)]),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            build(vec![Slab::new(0, MIN_CHUNK_SIZE - 1)]),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_slab_ids_agree() -> Result<()> {
        let allocator = MemoryAllocator::with_slabs(
            vec![Slab::new(0, 64), Slab::new(1, 64)],
            false,
            Box::new(NullOutOfOffHeapMemoryListener),
        )?;
        let a = allocator.allocate(56)?;
        let b = allocator.allocate(56)?;

        for chunk in [&a, &b] {
            let block = allocator
                .inspect()
                .into_iter()
                .find(|blk| blk.address == chunk.address())
                .expect("block for chunk");
            assert_eq!(block.slab, chunk.slab_id());
        }
        Ok(())
    }

    #[test]
    fn test_stats_and_inspect() -> Result<()> {
        let allocator = allocator(1024, false);
        let a = allocator.allocate(100)?;
        let _b = allocator.allocate(200)?;
        a.release()?;

        let stats = allocator.stats();
        assert_eq!(stats.total_memory, 1024);
        assert_eq!(stats.objects, 1);
        assert_eq!(stats.used_memory + stats.free_memory, 1024);
        assert_eq!(stats.free_list_chunks, 1);
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.releases, 1);

        let blocks = allocator.inspect();
        let kinds: Vec<_> = blocks.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![BlockKind::Free, BlockKind::Allocated, BlockKind::Unused]
        );
        assert_eq!(blocks.iter().map(|b| b.size).sum::<usize>(), 1024);

        let text = allocator.export_metrics();
        assert!(text.contains("offheap_objects 1"));
        Ok(())
    }

    #[test]
    fn test_free_all_off_heap_memory() -> Result<()> {
        let allocator = allocator(1024, false);
        let chunk = allocator.allocate(16)?;
        let other = allocator.clone();
        allocator.free_all_off_heap_memory();

        assert!(matches!(chunk.write_data_bytes(0, b"x"), Err(Error::Closed)));
        assert!(matches!(chunk.read_data_bytes(0, 1), Err(Error::Closed)));
        assert!(matches!(chunk.release(), Err(Error::Closed)));
        assert!(matches!(other.allocate(16), Err(Error::Closed)));
        other.free_all_off_heap_memory();
        Ok(())
    }
}

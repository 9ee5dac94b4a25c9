//! Concurrent use of the off-heap allocator from many caller threads

use offheap::error::{Error, Result};
use offheap::offheap::ChunkState;
use offheap::{AllocatorConfig, BlockKind, MemoryAllocator, NullOutOfOffHeapMemoryListener};
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

fn allocator(slab_sizes: Vec<usize>, fill: bool) -> MemoryAllocator {
    MemoryAllocator::new(
        AllocatorConfig {
            slab_sizes,
            validate_fill_pattern: fill,
        },
        Box::new(NullOutOfOffHeapMemoryListener),
    )
    .expect("Failed to create allocator")
}

#[test]
fn test_parallel_allocate_write_release() -> Result<()> {
    let allocator = allocator(vec![4 * 1024 * 1024, 4 * 1024 * 1024], true);

    (0..8usize).into_par_iter().try_for_each(|worker| -> Result<()> {
        for round in 0..500usize {
            let size = 16 + (worker * 131 + round * 17) % 2048;
            let chunk = allocator.allocate(size)?;
            chunk.validate_fill()?;

            let payload = vec![worker as u8; size];
            chunk.write_data_bytes(0, &payload)?;
            assert_eq!(chunk.read_data_bytes(0, size)?, payload);

            assert!(chunk.release()?);
        }
        Ok(())
    })?;

    let stats = allocator.stats();
    assert_eq!(stats.objects, 0);
    assert_eq!(stats.allocations, 8 * 500);
    assert_eq!(stats.releases, 8 * 500);
    assert_eq!(stats.free_memory, allocator.total_memory());
    allocator.check_partition()
}

#[test]
fn test_live_chunks_never_overlap_under_contention() -> Result<()> {
    let allocator = allocator(vec![2 * 1024 * 1024], false);

    let live: Vec<_> = (0..16usize)
        .into_par_iter()
        .map(|worker| -> Result<Vec<_>> {
            let mut kept = Vec::new();
            for round in 0..200usize {
                let chunk = allocator.allocate(8 + (round % 64) * 8)?;
                chunk.write_data_bytes(0, &(worker as u64).to_le_bytes())?;
                if round % 4 == 0 {
                    kept.push(chunk);
                } else {
                    chunk.release()?;
                }
            }
            Ok(kept)
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect();

    let mut blocks: Vec<_> = allocator
        .inspect()
        .into_iter()
        .filter(|b| b.kind == BlockKind::Allocated)
        .collect();
    assert_eq!(blocks.len(), live.len());
    blocks.sort_by_key(|b| b.address);
    for pair in blocks.windows(2) {
        assert!(pair[0].end_address() <= pair[1].address);
    }

    // Every kept chunk still holds what its writer put there
    for chunk in &live {
        let bytes = chunk.read_data_bytes(0, 8)?;
        let worker = u64::from_le_bytes(bytes.try_into().expect("8 bytes"));
        assert!(worker < 16);
    }
    allocator.check_partition()
}

#[test]
fn test_shared_chunk_freed_exactly_once() -> Result<()> {
    let allocator = allocator(vec![64 * 1024], true);
    let chunk = allocator.allocate(512)?;

    const OWNERS: usize = 64;
    for _ in 1..OWNERS {
        chunk.retain()?;
    }
    assert_eq!(chunk.ref_count(), OWNERS as u32);

    let frees = AtomicUsize::new(0);
    (0..OWNERS).into_par_iter().try_for_each(|_| -> Result<()> {
        let handle = chunk.clone();
        if handle.release()? {
            frees.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    })?;

    assert_eq!(frees.load(Ordering::SeqCst), 1);
    assert_eq!(chunk.state(), ChunkState::Free);
    assert!(matches!(chunk.release(), Err(Error::DoubleFree { .. })));
    chunk.validate_fill()?;
    allocator.check_partition()
}

#[test]
fn test_compaction_races_with_release() -> Result<()> {
    let allocator = allocator(vec![1024 * 1024], true);
    let chunks: Vec<_> = (0..1024)
        .map(|_| allocator.allocate(1000))
        .collect::<Result<_>>()?;

    let (released, compacted) = rayon::join(
        || -> Result<()> {
            for chunk in &chunks {
                chunk.release()?;
            }
            Ok(())
        },
        || -> Result<()> {
            for _ in 0..20 {
                allocator.compact()?;
            }
            Ok(())
        },
    );
    released?;
    compacted?;

    // Whatever interleaving happened, the free space merges into one piece
    allocator.compact()?;
    let stats = allocator.stats();
    assert_eq!(stats.free_memory, allocator.total_memory());
    assert_eq!(stats.largest_fragment, allocator.total_memory());

    let whole = allocator.allocate(allocator.total_memory() - offheap::offheap::HEADER_SIZE)?;
    whole.validate_fill()?;
    allocator.check_partition()
}

//! Non-moving compaction
//!
//! Walks a slab in address order and turns every run of adjacent free space
//! into one fragment. Allocated chunks are never moved or written, so live
//! handles stay valid across a compaction.
//!
//! ```text
//! before: | A | F | F | A | F | remainder |
//! after:  | A |   frag  | A |    frag     |
//! ```

use super::arena::SlabState;
use super::chunk::ChunkState;
use super::fill::FillPatternValidator;
use super::fragment::Fragment;
use super::slab::Slab;
use crate::error::Result;
use tracing::debug;

/// Outcome of compacting one slab
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionResult {
    /// Number of merged runs (new fragments)
    pub runs: usize,
    /// Free chunks absorbed into fragments
    pub chunks_merged: usize,
    /// Total bytes covered by the new fragments
    pub bytes_merged: usize,
}

#[derive(Debug, Clone, Copy)]
enum FreeBlock {
    Chunk { offset: usize, size: usize },
    Remainder { offset: usize, size: usize },
}

impl FreeBlock {
    fn offset(&self) -> usize {
        match *self {
            FreeBlock::Chunk { offset, .. } | FreeBlock::Remainder { offset, .. } => offset,
        }
    }

    fn end(&self) -> usize {
        match *self {
            FreeBlock::Chunk { offset, size } | FreeBlock::Remainder { offset, size } => {
                offset + size
            }
        }
    }
}

/// Merges adjacent free regions of a slab
pub struct Compactor;

impl Compactor {
    /// Compact one slab; the caller holds the slab lock for the duration
    pub(crate) fn compact(
        slab: &Slab,
        state: &mut SlabState,
        fill: &FillPatternValidator,
    ) -> Result<CompactionResult> {
        let runs = Self::free_runs(state);
        let mut result = CompactionResult::default();

        let mut fragments: Vec<Fragment> = Vec::new();
        for run in runs {
            if run.len() < 2 {
                // Nothing to merge; keep uncarved space as it was
                if let Some(FreeBlock::Remainder { offset, size }) = run.first() {
                    fragments.push(Fragment::new(*offset, *size));
                }
                continue;
            }

            let start = run[0].offset();
            let end = run[run.len() - 1].end();
            for block in &run {
                if let FreeBlock::Chunk { offset, .. } = *block {
                    state.free_list.remove(offset);
                    state.chunks.remove(&offset);
                    result.chunks_merged += 1;
                }
            }

            fill.fill(slab, start, end - start)?;
            fragments.push(Fragment::new(start, end - start));
            result.runs += 1;
            result.bytes_merged += end - start;
        }

        fragments.sort_by_key(Fragment::start);
        state.fragments = fragments;

        debug!(
            slab = slab.id(),
            runs = result.runs,
            chunks = result.chunks_merged,
            bytes = result.bytes_merged,
            "Compacted slab"
        );
        Ok(result)
    }

    /// Maximal runs of address-adjacent free blocks, in address order
    fn free_runs(state: &SlabState) -> Vec<Vec<FreeBlock>> {
        let mut blocks: Vec<(usize, Option<FreeBlock>)> = state
            .chunks
            .values()
            .map(|c| {
                let block = match c.state() {
                    ChunkState::Free => Some(FreeBlock::Chunk {
                        offset: c.offset(),
                        size: c.size(),
                    }),
                    ChunkState::Allocated => None,
                };
                (c.offset(), block)
            })
            .chain(
                state
                    .fragments
                    .iter()
                    .filter(|f| !f.is_exhausted())
                    .map(|f| {
                        (
                            f.free_start(),
                            Some(FreeBlock::Remainder {
                                offset: f.free_start(),
                                size: f.remaining(),
                            }),
                        )
                    }),
            )
            .collect();
        blocks.sort_by_key(|(offset, _)| *offset);

        let mut runs: Vec<Vec<FreeBlock>> = Vec::new();
        let mut current: Vec<FreeBlock> = Vec::new();
        for (_, block) in blocks {
            match block {
                Some(block) => {
                    let adjacent = current.last().map_or(true, |last| last.end() == block.offset());
                    if !adjacent {
                        runs.push(std::mem::take(&mut current));
                    }
                    current.push(block);
                }
                None => {
                    if !current.is_empty() {
                        runs.push(std::mem::take(&mut current));
                    }
                }
            }
        }
        if !current.is_empty() {
            runs.push(current);
        }
        runs
    }
}

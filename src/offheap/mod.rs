//! Off-heap memory
//!
//! Record data lives in a few large slabs reserved at startup instead of in
//! individually allocated buffers.
//!
//! # Architecture
//!
//! ```text
//! MemoryAllocator
//!   ├─→ Slab 0 (50 MB) → [chunk A][chunk F][chunk A][  fragment  ]
//!   │     └─→ FreeListManager: by size {F}, by address {F}
//!   └─→ Slab 1 (50 MB) → [chunk A][        fragment             ]
//!
//! StoredObject → (slab, chunk record with atomic refcount)
//! ```
//!
//! Chunks come from the free list (best fit) or are carved from fragments.
//! When neither has room, the compactor merges adjacent free space into new
//! fragments; live chunks are never moved. With fill validation enabled,
//! released chunks are overwritten with a sentinel so that writes through
//! dangling handles can be detected.

mod arena;
pub mod allocator;
pub mod chunk;
pub mod compactor;
pub mod fill;
pub mod fragment;
pub mod free_list;
pub mod listener;
pub mod slab;
pub mod stats;

pub use allocator::MemoryAllocator;
pub use chunk::{chunk_size_for, ChunkState, StoredObject, ALIGNMENT, HEADER_SIZE, MIN_CHUNK_SIZE};
pub use compactor::{CompactionResult, Compactor};
pub use fill::{FillPatternValidator, FILL_BYTE};
pub use fragment::Fragment;
pub use free_list::FreeListManager;
pub use listener::{
    LoggingOutOfOffHeapMemoryListener, NullOutOfOffHeapMemoryListener, OutOfOffHeapMemoryListener,
};
pub use slab::Slab;
pub use stats::{BlockKind, MemoryBlock, OffHeapMemoryStats};

// offheap - Slab allocator for cache record data kept outside managed memory
// Chunks are carved from a few large pre-reserved slabs, recycled through a
// best-fit free list and defragmented by a non-moving compactor.

#![warn(rust_2018_idioms)]

pub mod offheap;
pub mod settings;

// Re-exports for convenience
pub use settings::AllocatorConfig;
pub use offheap::{
    BlockKind, LoggingOutOfOffHeapMemoryListener, MemoryAllocator, MemoryBlock,
    NullOutOfOffHeapMemoryListener, OffHeapMemoryStats, OutOfOffHeapMemoryListener, Slab,
    StoredObject,
};

/// Off-heap allocator error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Out of off-heap memory: could not allocate {requested} bytes (total {total})")]
        OutOfOffHeapMemory { requested: usize, total: usize },

        #[error("Fill pattern violated for chunk {address} with size {size}")]
        FillPatternViolation { address: usize, size: usize },

        #[error("Double free of chunk {address}: reference count already zero")]
        DoubleFree { address: usize },

        #[error("Chunk {address} has already been freed")]
        ChunkFreed { address: usize },

        #[error("Out of bounds: offset {offset} + length {len} exceeds {limit}")]
        OutOfBounds {
            offset: usize,
            len: usize,
            limit: usize,
        },

        #[error("Invalid allocation size: {0}")]
        InvalidSize(usize),

        #[error("Invalid configuration: {0}")]
        InvalidConfig(String),

        #[error("Off-heap memory has been freed")]
        Closed,

        #[error("Allocator bookkeeping corrupted: {0}")]
        Corrupted(String),

        #[error("Metrics error: {0}")]
        Metrics(#[from] prometheus::Error),

        #[error("Config error: {0}")]
        Config(#[from] ::config::ConfigError),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::error::Error;

    #[test]
    fn test_fill_violation_message() {
        let err = Error::FillPatternViolation {
            address: 4096,
            size: 1032,
        };
        assert_eq!(
            err.to_string(),
            "Fill pattern violated for chunk 4096 with size 1032"
        );
    }
}

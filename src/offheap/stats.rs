//! Memory statistics and Prometheus metrics
//!
//! Each allocator owns its own [`Registry`]; nothing is registered globally,
//! so several allocators (one per test, say) never collide.

use crate::error::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};
use serde::Serialize;
use std::time::Duration;

/// What a block of slab memory is currently used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Chunk with at least one owner
    Allocated,
    /// Released chunk on the free list
    Free,
    /// Fragment space that has never been carved (or was merged back)
    Unused,
}

/// One contiguous block of a slab, as reported by `inspect`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryBlock {
    pub slab: usize,
    /// Offset from the start of the slab
    pub offset: usize,
    pub address: usize,
    pub size: usize,
    pub kind: BlockKind,
    pub ref_count: u32,
}

impl MemoryBlock {
    pub fn end_address(&self) -> usize {
        self.address + self.size
    }
}

/// Point-in-time statistics of an allocator
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OffHeapMemoryStats {
    pub slabs: usize,
    pub total_memory: usize,
    /// Bytes held by allocated chunks
    pub used_memory: usize,
    /// Bytes on the free list plus uncarved fragment space
    pub free_memory: usize,
    /// Allocated chunks
    pub objects: usize,
    pub free_list_chunks: usize,
    pub fragments: usize,
    pub largest_fragment: usize,
    pub allocations: u64,
    pub releases: u64,
    pub compactions: u64,
    pub compaction_time_secs: f64,
    pub out_of_memory: u64,
    pub fill_validations: u64,
}

impl OffHeapMemoryStats {
    /// Fraction of free memory not in the largest fragment
    pub fn fragmentation(&self) -> f64 {
        if self.free_memory == 0 {
            0.0
        } else {
            1.0 - self.largest_fragment as f64 / self.free_memory as f64
        }
    }
}

/// Prometheus instruments for one allocator
pub(crate) struct MemoryMetrics {
    registry: Registry,
    pub(crate) allocations: IntCounter,
    pub(crate) releases: IntCounter,
    pub(crate) compactions: IntCounter,
    pub(crate) compaction_time: Histogram,
    pub(crate) out_of_memory: IntCounter,
    pub(crate) fill_validations: IntCounter,
    objects: IntGauge,
    used_memory: IntGauge,
    free_memory: IntGauge,
    fragments: IntGauge,
    largest_fragment: IntGauge,
}

impl MemoryMetrics {
    pub(crate) fn new() -> Result<Self> {
        let registry = Registry::new();

        let allocations = IntCounter::new("offheap_allocations_total", "Chunks handed out")?;
        let releases = IntCounter::new("offheap_releases_total", "Chunks returned to the free list")?;
        let compactions = IntCounter::new("offheap_compactions_total", "Compaction passes")?;
        let compaction_time = Histogram::with_opts(
            HistogramOpts::new(
                "offheap_compaction_duration_seconds",
                "Duration of a compaction pass in seconds",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        let out_of_memory = IntCounter::new(
            "offheap_out_of_memory_total",
            "Allocations that failed after compaction",
        )?;
        let fill_validations = IntCounter::new(
            "offheap_fill_validations_total",
            "Fill pattern validations performed",
        )?;
        let objects = IntGauge::new("offheap_objects", "Allocated chunks")?;
        let used_memory = IntGauge::new("offheap_used_memory_bytes", "Bytes in allocated chunks")?;
        let free_memory = IntGauge::new("offheap_free_memory_bytes", "Free and unused bytes")?;
        let fragments = IntGauge::new("offheap_fragments", "Carvable fragments")?;
        let largest_fragment = IntGauge::new(
            "offheap_largest_fragment_bytes",
            "Size of the largest carvable fragment",
        )?;

        registry.register(Box::new(allocations.clone()))?;
        registry.register(Box::new(releases.clone()))?;
        registry.register(Box::new(compactions.clone()))?;
        registry.register(Box::new(compaction_time.clone()))?;
        registry.register(Box::new(out_of_memory.clone()))?;
        registry.register(Box::new(fill_validations.clone()))?;
        registry.register(Box::new(objects.clone()))?;
        registry.register(Box::new(used_memory.clone()))?;
        registry.register(Box::new(free_memory.clone()))?;
        registry.register(Box::new(fragments.clone()))?;
        registry.register(Box::new(largest_fragment.clone()))?;

        Ok(Self {
            registry,
            allocations,
            releases,
            compactions,
            compaction_time,
            out_of_memory,
            fill_validations,
            objects,
            used_memory,
            free_memory,
            fragments,
            largest_fragment,
        })
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn observe_compaction(&self, elapsed: Duration) {
        self.compactions.inc();
        self.compaction_time.observe(elapsed.as_secs_f64());
    }

    /// Fill in the counter fields of `stats` and push its gauges
    pub(crate) fn update(&self, stats: &mut OffHeapMemoryStats) {
        stats.allocations = self.allocations.get();
        stats.releases = self.releases.get();
        stats.compactions = self.compactions.get();
        stats.compaction_time_secs = self.compaction_time.get_sample_sum();
        stats.out_of_memory = self.out_of_memory.get();
        stats.fill_validations = self.fill_validations.get();

        self.objects.set(stats.objects as i64);
        self.used_memory.set(stats.used_memory as i64);
        self.free_memory.set(stats.free_memory as i64);
        self.fragments.set(stats.fragments as i64);
        self.largest_fragment.set(stats.largest_fragment as i64);
    }

    /// Prometheus text exposition of every instrument
    pub(crate) fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

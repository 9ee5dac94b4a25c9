//! Out-of-memory notification

use crate::error::Error;
use tracing::warn;

/// Notified when an allocation cannot be satisfied even after compaction
///
/// The failing `allocate` call still returns the error to its caller; the
/// listener is for the surrounding cache (e.g. to start evicting or to mark
/// the member unhealthy).
pub trait OutOfOffHeapMemoryListener: Send + Sync {
    fn out_of_off_heap_memory(&self, error: &Error);

    /// Called once when the allocator is torn down
    fn close(&self) {}
}

/// Ignores every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutOfOffHeapMemoryListener;

impl OutOfOffHeapMemoryListener for NullOutOfOffHeapMemoryListener {
    fn out_of_off_heap_memory(&self, _error: &Error) {}
}

/// Logs every notification at warn level
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingOutOfOffHeapMemoryListener;

impl OutOfOffHeapMemoryListener for LoggingOutOfOffHeapMemoryListener {
    fn out_of_off_heap_memory(&self, error: &Error) {
        warn!(error = %error, "Off-heap memory exhausted");
    }
}

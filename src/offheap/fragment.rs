//! Unused space inside a slab that chunks are carved from

/// A linear cursor over an unused region of a slab
///
/// ```text
/// start          start+cursor            start+size
///   |  carved chunks  |     remaining       |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    /// Slab offset of the first byte
    start: usize,
    /// Total size of the region when it was created
    size: usize,
    /// Bytes already handed out
    cursor: usize,
}

impl Fragment {
    pub fn new(start: usize, size: usize) -> Self {
        Self {
            start,
            size,
            cursor: 0,
        }
    }

    /// Carve `size` bytes off the front of the remaining space
    ///
    /// Returns the slab offset of the carved region, or `None` when the
    /// fragment does not have `size` bytes left.
    pub fn carve(&mut self, size: usize) -> Option<usize> {
        if self.remaining() < size {
            return None;
        }
        let offset = self.start + self.cursor;
        self.cursor += size;
        Some(offset)
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slab offset of the first uncarved byte
    pub fn free_start(&self) -> usize {
        self.start + self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.size - self.cursor
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

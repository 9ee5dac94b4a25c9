//! Fill pattern validation
//!
//! When enabled, the data region of every released chunk is overwritten with
//! [`FILL_BYTE`]. A later [`FillPatternValidator::validate`] of a chunk that
//! should still be untouched then catches writes through dangling handles,
//! overruns from neighbouring chunks and bookkeeping mistakes.

use super::slab::Slab;
use crate::error::{Error, Result};
use tracing::error;

/// Sentinel byte; the 64-bit pattern is `0x3C3C_3C3C_3C3C_3C3C`
pub const FILL_BYTE: u8 = 0x3C;

/// Writes and checks the sentinel over chunk data regions
#[derive(Debug, Clone, Copy)]
pub struct FillPatternValidator {
    enabled: bool,
}

impl FillPatternValidator {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Overwrite `[offset, offset + len)` with the sentinel
    pub fn fill(&self, slab: &Slab, offset: usize, len: usize) -> Result<()> {
        if !self.enabled || len == 0 {
            return Ok(());
        }
        slab.fill(offset, len, FILL_BYTE)
    }

    /// Check that `[offset, offset + len)` still holds the sentinel
    ///
    /// `address` and `size` identify the chunk in the error.
    pub fn validate(
        &self,
        slab: &Slab,
        offset: usize,
        len: usize,
        address: usize,
        size: usize,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if slab.matches(offset, len, FILL_BYTE)? {
            Ok(())
        } else {
            error!(address, size, slab = slab.id(), "Fill pattern violated");
            Err(Error::FillPatternViolation { address, size })
        }
    }
}

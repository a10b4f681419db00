//! Tunables of a [`Heap`](crate::Heap).

use crate::block::{ALIGNMENT, MIN_BLOCK_SIZE};

/// Default number of bytes requested from the region whenever no free block
/// fits.
pub const CHUNK_SIZE: usize = 1 << 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Minimum number of bytes by which the heap grows when it runs out of
    /// free blocks. Also the size of the free block seeded at initialization.
    pub chunk_size: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
        }
    }

    #[must_use]
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub(crate) const fn is_valid_chunk_size(&self) -> bool {
        self.chunk_size >= MIN_BLOCK_SIZE && self.chunk_size.is_multiple_of(ALIGNMENT)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_validation() {
        assert!(HeapConfig::default().is_valid_chunk_size());
        assert!(HeapConfig::new().with_chunk_size(16).is_valid_chunk_size());
        assert!(
            HeapConfig::new()
                .with_chunk_size(1 << 20)
                .is_valid_chunk_size()
        );
        assert!(!HeapConfig::new().with_chunk_size(0).is_valid_chunk_size());
        assert!(!HeapConfig::new().with_chunk_size(8).is_valid_chunk_size());
        assert!(!HeapConfig::new().with_chunk_size(100).is_valid_chunk_size());
    }
}

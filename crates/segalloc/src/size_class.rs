//! Size classes of the segregated free lists.
//!
//! A block belongs to the class given by the position of the highest set bit
//! of its size. Class 0 starts at [`MIN_BLOCK_SIZE`] and every class covers
//! twice the range of the previous one, except for the last class which
//! takes every size above the others.
//!
//! | class | block sizes         |
//! |-------|---------------------|
//! | 0     | 16 ..= 31           |
//! | 1     | 32 ..= 63           |
//! | ...   | ...                 |
//! | 12    | 65536 ..= 131071    |
//! | 13    | 131072 ..           |

use crate::block::MIN_BLOCK_SIZE;

/// Number of segregated free lists.
pub const NUM_SIZE_CLASSES: usize = 14;

const MIN_SHIFT: u32 = MIN_BLOCK_SIZE.trailing_zeros();

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass(u8);
const _: () = assert!(SizeClass::LARGEST.index() + 1 == NUM_SIZE_CLASSES);

impl SizeClass {
    pub const SMALLEST: Self = Self(0);
    pub const LARGEST: Self = Self(13);

    /// Returns the class a block of `size` bytes belongs to.
    ///
    /// Sizes below [`MIN_BLOCK_SIZE`] map to the smallest class.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub const fn of(size: usize) -> Self {
        if size == 0 {
            return Self::SMALLEST;
        }
        let index = size.ilog2().saturating_sub(MIN_SHIFT) as usize;
        if index >= Self::LARGEST.index() {
            return Self::LARGEST;
        }
        Self(index as u8)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the smallest block size of this class.
    #[must_use]
    pub const fn min_size(self) -> usize {
        MIN_BLOCK_SIZE << self.index()
    }

    /// Returns the largest block size of this class, or `None` for the
    /// unbounded last class.
    #[must_use]
    pub const fn max_size(self) -> Option<usize> {
        if self.0 == Self::LARGEST.0 {
            None
        } else {
            Some((MIN_BLOCK_SIZE << (self.index() + 1)) - 1)
        }
    }

    /// Iterates over every class from smallest to largest.
    pub fn all() -> impl Iterator<Item = Self> {
        Self::SMALLEST.and_larger()
    }

    /// Iterates over this class and every larger one, in increasing order.
    pub fn and_larger(self) -> impl Iterator<Item = Self> {
        (self.0..=Self::LARGEST.0).map(Self)
    }
}

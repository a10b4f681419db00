//! Growable heap regions.
//!
//! The allocator never obtains memory on its own. It asks an [`Sbrk`]
//! implementation to move the end of a contiguous region forward and carves
//! blocks out of the bytes it receives. The region only ever grows.
//!
//! [`MemRegion`] is the stock implementation: it reserves a fixed amount of
//! memory up front and hands it out in `sbrk` fashion, failing once the
//! reservation is used up.

use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error};
use core::alloc::Layout;

use snafu::{Snafu, ensure};

use crate::error::{Located, Location};

/// Alignment of the first byte of a [`MemRegion`].
pub const HEAP_ALIGN: usize = 16;

/// Default capacity of a [`MemRegion`] (20 MiB).
pub const MAX_HEAP: usize = 20 * (1 << 20);

/// The region cannot be extended by the requested amount.
#[derive(Debug, Snafu)]
#[snafu(display(
    "heap region exhausted: requested {requested} bytes, {available} bytes available"
))]
pub struct SbrkError {
    requested: usize,
    available: usize,
    #[snafu(implicit)]
    location: Location,
}

impl Located for SbrkError {
    fn location(&self) -> Location {
        self.location
    }
}

impl SbrkError {
    #[must_use]
    pub fn requested(&self) -> usize {
        self.requested
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.available
    }
}

/// A contiguous memory region whose end can be moved forward.
pub trait Sbrk {
    /// Extends the region by `incr` bytes.
    ///
    /// Returns the previous end of the region, which is the first byte of the
    /// newly added range. The region is left unchanged on failure.
    fn sbrk(&mut self, incr: usize) -> Result<*mut u8, SbrkError>;
}

impl<R> Sbrk for &mut R
where
    R: Sbrk + ?Sized,
{
    fn sbrk(&mut self, incr: usize) -> Result<*mut u8, SbrkError> {
        (**self).sbrk(incr)
    }
}

/// A fixed-capacity region backed by a single zeroed allocation.
pub struct MemRegion {
    start: *mut u8,
    brk: usize,
    capacity: usize,
}

unsafe impl Send for MemRegion {}

impl Default for MemRegion {
    fn default() -> Self {
        Self::new(MAX_HEAP)
    }
}

impl MemRegion {
    /// Reserves `capacity` bytes aligned to [`HEAP_ALIGN`].
    ///
    /// # Panics
    ///
    /// Panics if `capacity` cannot be described by a [`Layout`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let layout = Self::layout(capacity);
        let start = unsafe { alloc_zeroed(layout) };
        if start.is_null() {
            handle_alloc_error(layout);
        }
        Self {
            start,
            brk: 0,
            capacity,
        }
    }

    fn layout(capacity: usize) -> Layout {
        Layout::from_size_align(capacity.max(HEAP_ALIGN), HEAP_ALIGN).unwrap()
    }

    /// Returns the address of the first byte of the region.
    #[must_use]
    pub fn heap_lo(&self) -> *mut u8 {
        self.start
    }

    /// Returns the address of the last byte in use, or one before
    /// [`heap_lo`](Self::heap_lo) when nothing has been handed out.
    #[must_use]
    pub fn heap_hi(&self) -> *mut u8 {
        self.start.wrapping_add(self.brk).wrapping_sub(1)
    }

    /// Returns the number of bytes handed out so far.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.brk
    }

    /// Returns the total number of bytes the region can hand out.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns `true` if `ptr` lies inside the part of the region handed
    /// out so far.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let lo = self.start.addr();
        (lo..lo + self.brk).contains(&ptr.addr())
    }
}

impl Sbrk for MemRegion {
    fn sbrk(&mut self, incr: usize) -> Result<*mut u8, SbrkError> {
        let available = self.capacity - self.brk;
        ensure!(
            incr <= available,
            SbrkSnafu {
                requested: incr,
                available,
            }
        );

        let old_brk = unsafe { self.start.add(self.brk) };
        self.brk += incr;
        Ok(old_brk)
    }
}

impl Drop for MemRegion {
    fn drop(&mut self) {
        unsafe { dealloc(self.start, Self::layout(self.capacity)) }
    }
}

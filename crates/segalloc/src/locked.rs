//! A [`Heap`] shared behind a spin lock.

use spin::{Mutex, MutexGuard};

use crate::{
    heap::{Heap, HeapStats},
    region::Sbrk,
};

/// A [`Heap`] that can be used through a shared reference.
///
/// Every operation takes the lock for its whole duration, so operations from
/// different threads never interleave.
///
/// # Examples
///
/// ```
/// use segalloc::{Heap, LockedHeap, region::MemRegion};
///
/// let heap = LockedHeap::new(Heap::new(MemRegion::new(1 << 16)).unwrap());
/// let ptr = heap.allocate(32).unwrap();
/// heap.free(ptr);
/// assert_eq!(heap.stats().allocated_blocks, 0);
/// ```
#[derive(Debug)]
pub struct LockedHeap<R> {
    heap: Mutex<Heap<R>>,
}

impl<R> LockedHeap<R> {
    pub const fn new(heap: Heap<R>) -> Self {
        Self {
            heap: Mutex::new(heap),
        }
    }

    /// Locks the heap for a sequence of operations.
    pub fn lock(&self) -> MutexGuard<'_, Heap<R>> {
        self.heap.lock()
    }

    pub fn into_inner(self) -> Heap<R> {
        self.heap.into_inner()
    }

    /// See [`Heap::free`].
    pub fn free(&self, ptr: *mut u8) {
        self.lock().free(ptr);
    }

    #[must_use]
    pub fn usable_size(&self, ptr: *const u8) -> Option<usize> {
        self.lock().usable_size(ptr)
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.lock().stats()
    }
}

impl<R> LockedHeap<R>
where
    R: Sbrk,
{
    /// See [`Heap::allocate`].
    pub fn allocate(&self, size: usize) -> Option<*mut u8> {
        self.lock().allocate(size)
    }

    /// See [`Heap::allocate_zeroed`].
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> Option<*mut u8> {
        self.lock().allocate_zeroed(count, size)
    }

    /// See [`Heap::resize`].
    pub fn resize(&self, ptr: *mut u8, size: usize) -> Option<*mut u8> {
        self.lock().resize(ptr, size)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::region::MemRegion;

    #[test]
    fn test_concurrent_allocations() {
        let heap = LockedHeap::new(Heap::new(MemRegion::new(1 << 20)).unwrap());

        thread::scope(|s| {
            for tag in 1..=4_u8 {
                let heap = &heap;
                s.spawn(move || {
                    let mut ptrs = Vec::new();
                    for round in 0..64 {
                        let size = 16 + round * 8;
                        let ptr = heap.allocate(size).unwrap();
                        unsafe { ptr.write_bytes(tag, size) };
                        ptrs.push((ptr, size));
                    }
                    for (ptr, size) in ptrs {
                        for i in 0..size {
                            assert_eq!(unsafe { ptr.add(i).read() }, tag);
                        }
                        heap.free(ptr);
                    }
                });
            }
        });

        let heap = heap.into_inner();
        heap.check().unwrap();
        assert_eq!(heap.stats().allocated_blocks, 0);
        assert_eq!(heap.stats().free_blocks, 1);
    }

    #[test]
    fn test_lock_allows_sequences() {
        let heap = LockedHeap::new(Heap::new(MemRegion::new(1 << 16)).unwrap());
        let ptr = heap.allocate_zeroed(4, 8).unwrap();
        assert_eq!(heap.usable_size(ptr), Some(32));

        {
            let mut heap = heap.lock();
            let ptr = heap.resize(ptr, 100).unwrap();
            heap.free(ptr);
            heap.check().unwrap();
        }
        assert_eq!(heap.stats().allocated_blocks, 0);
        assert_eq!(heap.resize(core::ptr::null_mut(), 0), None);
    }
}

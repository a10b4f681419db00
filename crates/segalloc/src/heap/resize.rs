use core::ptr;

use log::{trace, warn};

use super::Heap;
use crate::{
    block::{self, BlockId, TAG_OVERHEAD},
    region::Sbrk,
};

impl<R> Heap<R>
where
    R: Sbrk,
{
    /// Changes the size of the allocation at `ptr` to at least `size` bytes.
    ///
    /// - A null `ptr` behaves like [`allocate`](Self::allocate).
    /// - A zero `size` frees `ptr` and returns `None`.
    /// - A block that is already large enough is returned unchanged.
    /// - Otherwise the block grows in place when its successor is free and
    ///   large enough or when it is the last block of the heap. As a last
    ///   resort the contents are moved to a new allocation.
    ///
    /// Returns `None` if no memory is available; the original allocation and
    /// its contents are left untouched in that case.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is neither null nor a live allocation of this heap.
    pub fn resize(&mut self, ptr: *mut u8, size: usize) -> Option<*mut u8> {
        if size == 0 {
            self.free(ptr);
            return None;
        }
        if ptr.is_null() {
            return self.allocate(size);
        }

        let id = self.live_block(ptr);
        let asize = block::adjusted_size(size)?;
        let current = self.blocks[id].size;
        if asize <= current {
            return Some(ptr);
        }

        if self.grow_in_place(id, asize) {
            self.debug_check();
            return Some(ptr);
        }

        let new_ptr = self.allocate(size)?;
        unsafe {
            ptr::copy_nonoverlapping(ptr, new_ptr, current - TAG_OVERHEAD);
        }
        self.free(ptr);
        trace!("moved {current} byte block from {ptr:p} to {new_ptr:p}");
        Some(new_ptr)
    }

    /// Extends block `id` to at least `asize` bytes without moving it.
    fn grow_in_place(&mut self, id: BlockId, asize: usize) -> bool {
        let current = self.blocks[id].size;
        let next = self.blocks[id].next_phys;
        let next_block = &self.blocks[next];

        if !next_block.allocated && current + next_block.size >= asize {
            self.lists.remove(&mut self.blocks, next);
            self.blocks.absorb_next(id);
            return true;
        }

        if next == self.epilogue {
            let shortfall = asize - current;
            match self.region.sbrk(shortfall) {
                Ok(_) => {
                    self.blocks[id].size += shortfall;
                    self.blocks[self.epilogue].offset += shortfall;
                    trace!("heap grew by {shortfall} bytes to extend the last block");
                    return true;
                }
                Err(err) => {
                    warn!("cannot extend the last block in place: {err}");
                }
            }
        }

        false
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use core::ptr;

    use crate::{Heap, HeapConfig, region::MemRegion};

    const INITIAL_HEAP_SIZE: usize = 16 + 4096;

    fn fill(ptr: *mut u8, len: usize, byte: u8) {
        unsafe { ptr.write_bytes(byte, len) }
    }

    fn assert_filled(ptr: *const u8, len: usize, byte: u8) {
        for i in 0..len {
            assert_eq!(unsafe { ptr.add(i).read() }, byte, "byte {i} changed");
        }
    }

    #[test]
    fn test_null_pointer_allocates() {
        let mut heap = Heap::new(MemRegion::new(1 << 16)).unwrap();
        let ptr = heap.resize(ptr::null_mut(), 50).unwrap();
        assert_eq!(ptr, heap.region().heap_lo().wrapping_add(16));
        assert_eq!(heap.usable_size(ptr), Some(56));
        heap.check().unwrap();
    }

    #[test]
    fn test_zero_size_frees() {
        let mut heap = Heap::new(MemRegion::new(1 << 16)).unwrap();
        let ptr = heap.allocate(100).unwrap();
        assert!(heap.resize(ptr, 0).is_none());
        assert_eq!(heap.stats().free_bytes, 4096);
        assert_eq!(heap.stats().allocated_blocks, 0);

        assert!(heap.resize(ptr::null_mut(), 0).is_none());
        heap.check().unwrap();
    }

    #[test]
    fn test_shrink_keeps_pointer() {
        let mut heap = Heap::new(MemRegion::new(1 << 16)).unwrap();
        let ptr = heap.allocate(200).unwrap();
        fill(ptr, 200, 0x42);

        assert_eq!(heap.resize(ptr, 50), Some(ptr));
        assert_eq!(heap.resize(ptr, 200), Some(ptr));
        assert_eq!(heap.usable_size(ptr), Some(200));
        assert_filled(ptr, 200, 0x42);
        heap.check().unwrap();
    }

    #[test]
    fn test_grow_into_free_successor() {
        let mut heap = Heap::new(MemRegion::new(1 << 16)).unwrap();
        // 4096 bytes take 4104, so the heap grows and a 4096 byte free
        // block follows `ptr`.
        let ptr = heap.allocate(4096).unwrap();
        fill(ptr, 4096, 0x17);
        let heap_size = heap.heap_size();

        // 8192 bytes take 8200 = 4104 + 4096: the successor fits exactly.
        assert_eq!(heap.resize(ptr, 8192), Some(ptr));
        assert_eq!(heap.heap_size(), heap_size);
        assert_eq!(heap.usable_size(ptr), Some(8192));
        assert_eq!(heap.stats().free_blocks, 0);
        assert_filled(ptr, 4096, 0x17);
        heap.check().unwrap();
    }

    #[test]
    fn test_grow_into_free_successor_keeps_excess() {
        let mut heap = Heap::new(MemRegion::new(1 << 16)).unwrap();
        let ptr = heap.allocate(100).unwrap();

        // The successor is the 3984 byte remainder; all of it is absorbed.
        assert_eq!(heap.resize(ptr, 200), Some(ptr));
        assert_eq!(heap.usable_size(ptr), Some(4096 - 8));
        assert_eq!(heap.stats().free_blocks, 0);
        heap.check().unwrap();
    }

    #[test]
    fn test_grow_last_block_extends_heap() {
        let mut heap = Heap::new(MemRegion::new(1 << 16)).unwrap();
        // Fill the seed chunk exactly so `ptr` borders the epilogue.
        let ptr = heap.allocate(4088).unwrap();
        fill(ptr, 4088, 0x5a);
        assert_eq!(heap.heap_size(), INITIAL_HEAP_SIZE);

        assert_eq!(heap.resize(ptr, 8192), Some(ptr));
        assert_eq!(heap.heap_size(), INITIAL_HEAP_SIZE + 8200 - 4096);
        assert_eq!(heap.region().heap_size(), heap.heap_size());
        assert_eq!(heap.usable_size(ptr), Some(8192));
        assert_filled(ptr, 4088, 0x5a);
        heap.check().unwrap();
    }

    #[test]
    fn test_grow_exact_seed_chunk_by_shortfall() {
        let config = HeapConfig::new().with_chunk_size(4104);
        let mut heap = Heap::with_config(MemRegion::new(1 << 16), config).unwrap();
        assert_eq!(heap.heap_size(), 16 + 4104);

        // 4096 bytes take 4104, exactly the seed chunk.
        let ptr = heap.allocate(4096).unwrap();
        fill(ptr, 4096, 0x3c);
        assert_eq!(heap.heap_size(), 16 + 4104);
        assert_eq!(heap.stats().free_blocks, 0);

        // 8192 bytes take 8200, so the heap grows by the 4096 byte shortfall.
        assert_eq!(heap.resize(ptr, 8192), Some(ptr));
        assert_eq!(heap.heap_size(), 16 + 4104 + 4096);
        assert_eq!(heap.usable_size(ptr), Some(8192));
        assert_eq!(heap.stats().free_blocks, 0);
        assert_filled(ptr, 4096, 0x3c);
        heap.check().unwrap();
    }

    #[test]
    fn test_grow_moves_when_boxed_in() {
        let mut heap = Heap::new(MemRegion::new(1 << 16)).unwrap();
        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(64).unwrap();
        fill(a, 64, 0x11);
        fill(b, 64, 0x22);

        let moved = heap.resize(a, 256).unwrap();
        assert_ne!(moved, a);
        assert!(moved > b);
        assert_filled(moved, 64, 0x11);
        assert_filled(b, 64, 0x22);
        assert_eq!(heap.usable_size(a), None);
        assert_eq!(heap.usable_size(moved), Some(256));

        // The old block went back to the free lists.
        assert_eq!(heap.allocate(64), Some(a));
        heap.check().unwrap();
    }

    #[test]
    fn test_failed_move_leaves_block_intact() {
        let mut heap = Heap::new(MemRegion::new(INITIAL_HEAP_SIZE)).unwrap();
        let a = heap.allocate(1000).unwrap();
        let b = heap.allocate(3000).unwrap();
        fill(a, 1000, 0x77);

        assert!(heap.resize(a, 2000).is_none());
        assert_eq!(heap.usable_size(a), Some(1000));
        assert_eq!(heap.usable_size(b), Some(3000));
        assert_filled(a, 1000, 0x77);
        heap.check().unwrap();
    }

    #[test]
    fn test_failed_extension_falls_back_to_move() {
        let mut heap = Heap::new(MemRegion::new(INITIAL_HEAP_SIZE)).unwrap();
        let x = heap.allocate(3000).unwrap();
        // Takes the remaining 1088 bytes, so `a` borders the epilogue.
        let a = heap.allocate(1080).unwrap();
        assert_eq!(heap.stats().free_blocks, 0);
        fill(a, 1080, 0x3c);
        heap.free(x);

        // The region is full, but the hole left by `x` is large enough.
        let moved = heap.resize(a, 1200).unwrap();
        assert_eq!(moved, x);
        assert_filled(moved, 1080, 0x3c);
        assert_eq!(heap.heap_size(), INITIAL_HEAP_SIZE);
        assert_eq!(heap.stats().free_blocks, 1);
        heap.check().unwrap();
    }

    #[test]
    fn test_failed_extension_without_room() {
        let mut heap = Heap::new(MemRegion::new(INITIAL_HEAP_SIZE)).unwrap();
        let a = heap.allocate(4088).unwrap();
        fill(a, 4088, 0x66);

        assert!(heap.resize(a, 5000).is_none());
        assert_eq!(heap.usable_size(a), Some(4088));
        assert_filled(a, 4088, 0x66);
        heap.check().unwrap();
    }

    #[test]
    #[should_panic(expected = "is not a live allocation of this heap")]
    fn test_resize_freed_pointer_panics() {
        let mut heap = Heap::new(MemRegion::new(1 << 16)).unwrap();
        let a = heap.allocate(64).unwrap();
        heap.free(a);
        let _ = heap.resize(a, 128);
    }
}

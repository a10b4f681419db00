use super::Heap;
use crate::block::{BlockId, MIN_BLOCK_SIZE};

impl<R> Heap<R> {
    /// Allocates `asize` bytes out of the free block `id`.
    ///
    /// If the rest of the block can form a block of its own it is split off,
    /// coalesced, and returned to the free lists. Otherwise the caller gets
    /// the whole block. Returns the payload address.
    pub(super) fn place(&mut self, id: BlockId, asize: usize) -> *mut u8 {
        self.lists.remove(&mut self.blocks, id);

        let csize = self.blocks[id].size;
        assert!(
            csize >= asize,
            "block of {csize} bytes cannot hold {asize} bytes"
        );

        // Mark the prefix allocated before the remainder is coalesced, so the
        // remainder cannot merge back into it.
        self.blocks[id].allocated = true;
        if csize - asize >= MIN_BLOCK_SIZE {
            let rest = self.blocks.split(id, asize);
            let rest = self.coalesce(rest);
            self.lists.insert(&mut self.blocks, rest);
        }

        self.live.insert(self.blocks[id].payload_offset(), id);
        self.payload_ptr(id)
    }
}

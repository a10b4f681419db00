use super::Heap;
use crate::block::BlockId;

impl<R> Heap<R> {
    /// Merges a free block with its free physical neighbours.
    ///
    /// `id` must be marked free and must not be linked into a free list.
    /// Absorbed neighbours are unlinked from their lists first. Returns the
    /// handle of the merged block, which is the leftmost participant; the
    /// result is not linked into any list.
    ///
    /// Only the two direct neighbours are inspected, so this runs in constant
    /// time regardless of the heap size.
    pub(super) fn coalesce(&mut self, id: BlockId) -> BlockId {
        let block = &self.blocks[id];
        debug_assert!(!block.allocated);
        debug_assert!(!self.blocks.is_linked(id));

        let prev = block.prev_phys;
        let next = block.next_phys;
        let prev_free = !self.blocks[prev].allocated;
        let next_free = !self.blocks[next].allocated;

        match (prev_free, next_free) {
            (false, false) => id,
            (false, true) => {
                self.lists.remove(&mut self.blocks, next);
                self.blocks.absorb_next(id);
                id
            }
            (true, false) => {
                self.lists.remove(&mut self.blocks, prev);
                self.blocks.absorb_next(prev);
                prev
            }
            (true, true) => {
                self.lists.remove(&mut self.blocks, next);
                self.lists.remove(&mut self.blocks, prev);
                self.blocks.absorb_next(prev);
                self.blocks.absorb_next(prev);
                prev
            }
        }
    }
}

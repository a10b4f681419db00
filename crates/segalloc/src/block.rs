//! Block descriptors.
//!
//! Every block of the heap region is described by one entry of a
//! [`BlockTable`]. The table is the only place where a block's size and
//! allocation state are recorded, so the two ends of a block can never
//! disagree. Descriptors also carry handles to their physical neighbours and,
//! while the block is free, to their free-list neighbours.
//!
//! # Region Layout
//!
//! Blocks still account for a header word and a footer word in the region,
//! which keeps sizes and payload addresses identical to a classic
//! boundary-tag heap:
//!
//! ```text
//!  offset o                                            o + size
//!  ┌────────┬──────────────────────────────────────┬────────┐
//!  │ header │ payload (size - TAG_OVERHEAD bytes)  │ footer │
//!  └────────┴──────────────────────────────────────┴────────┘
//!           ^ o + WORD_SIZE, ALIGNMENT-aligned
//! ```
//!
//! # Handles
//!
//! Blocks are referred to by [`BlockId`]. When a block is absorbed by a
//! neighbour its slot is retired and may later be reused; indexing the table
//! with a retired handle panics instead of reading stale data.

use alloc::vec::Vec;
use core::ops::{Index, IndexMut};

/// Size of one boundary tag.
pub const WORD_SIZE: usize = 4;

/// Alignment of every block size and every payload address.
pub const ALIGNMENT: usize = 8;

/// Bytes of every block taken up by its header and footer.
pub const TAG_OVERHEAD: usize = 2 * WORD_SIZE;

/// Smallest block that can hold its tags and, while free, two list links.
pub const MIN_BLOCK_SIZE: usize = 2 * ALIGNMENT;

const _: () = assert!(MIN_BLOCK_SIZE.is_power_of_two());
const _: () = assert!(MIN_BLOCK_SIZE >= TAG_OVERHEAD + ALIGNMENT);

/// Returns the block size needed to serve a request of `request` bytes.
///
/// The payload is rounded up to [`ALIGNMENT`] and the tag overhead is added,
/// with a floor of [`MIN_BLOCK_SIZE`]. Returns `None` if the result does not
/// fit in `usize`.
#[must_use]
pub fn adjusted_size(request: usize) -> Option<usize> {
    if request <= ALIGNMENT {
        return Some(MIN_BLOCK_SIZE);
    }
    request
        .checked_add(TAG_OVERHEAD)?
        .checked_next_multiple_of(ALIGNMENT)
}

/// Handle to an entry of a [`BlockTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockId(usize);

impl BlockId {
    /// Neighbour handle of the outermost boundary blocks and of sentinels.
    pub(crate) const NONE: Self = Self(usize::MAX);
}

#[derive(Debug, Clone)]
pub(crate) struct Block {
    /// Region offset of the header word.
    pub(crate) offset: usize,
    pub(crate) size: usize,
    pub(crate) allocated: bool,
    pub(crate) prev_phys: BlockId,
    pub(crate) next_phys: BlockId,
    /// Free-list links. A block that is not linked points at itself.
    pub(crate) prev_free: BlockId,
    pub(crate) next_free: BlockId,
}

impl Block {
    pub(crate) fn payload_offset(&self) -> usize {
        self.offset + WORD_SIZE
    }

    pub(crate) fn end(&self) -> usize {
        self.offset + self.size
    }

    /// Number of payload bytes the caller may use.
    pub(crate) fn capacity(&self) -> usize {
        self.size.saturating_sub(TAG_OVERHEAD)
    }
}

#[derive(Debug, Default)]
pub(crate) struct BlockTable {
    slots: Vec<Option<Block>>,
    vacant: Vec<BlockId>,
}

impl BlockTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of slots, live or retired.
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn get(&self, id: BlockId) -> Option<&Block> {
        self.slots.get(id.0)?.as_ref()
    }

    /// Stores a new descriptor with no physical neighbours and no list links.
    pub(crate) fn insert(&mut self, offset: usize, size: usize, allocated: bool) -> BlockId {
        let id = self
            .vacant
            .pop()
            .unwrap_or_else(|| BlockId(self.slots.len()));
        let block = Block {
            offset,
            size,
            allocated,
            prev_phys: BlockId::NONE,
            next_phys: BlockId::NONE,
            prev_free: id,
            next_free: id,
        };
        if id.0 == self.slots.len() {
            self.slots.push(Some(block));
        } else {
            assert!(self.slots[id.0].is_none(), "vacant slot {id:?} is occupied");
            self.slots[id.0] = Some(block);
        }
        id
    }

    /// Removes a descriptor, making its handle stale.
    pub(crate) fn retire(&mut self, id: BlockId) -> Block {
        let Some(block) = self.slots.get_mut(id.0).and_then(Option::take) else {
            panic!("block handle {id:?} retired twice");
        };
        self.vacant.push(id);
        block
    }

    /// Places `id` right after `prev` in the physical order.
    pub(crate) fn link_phys(&mut self, prev: BlockId, id: BlockId) {
        let next = self[prev].next_phys;
        self[id].prev_phys = prev;
        self[id].next_phys = next;
        self[prev].next_phys = id;
        if next != BlockId::NONE {
            self[next].prev_phys = id;
        }
    }

    /// Shrinks `id` to `size` bytes and turns the rest into a new free block
    /// that follows it physically.
    pub(crate) fn split(&mut self, id: BlockId, size: usize) -> BlockId {
        let block = &self[id];
        assert!(
            size <= block.size,
            "cannot split {} bytes off a block of {} bytes",
            size,
            block.size
        );
        let rest_offset = block.offset + size;
        let rest_size = block.size - size;

        self[id].size = size;
        let rest = self.insert(rest_offset, rest_size, false);
        self.link_phys(id, rest);
        rest
    }

    /// Merges the physical successor of `id` into `id`.
    ///
    /// The successor must already be unlinked from its free list.
    pub(crate) fn absorb_next(&mut self, id: BlockId) {
        let next = self[id].next_phys;
        let absorbed = self.retire(next);
        debug_assert_eq!(absorbed.offset, self[id].end());
        debug_assert_eq!(absorbed.next_free, next, "absorbed block is still linked");

        self[id].size += absorbed.size;
        self[id].next_phys = absorbed.next_phys;
        if absorbed.next_phys != BlockId::NONE {
            self[absorbed.next_phys].prev_phys = id;
        }
    }

    /// Links `id` into a free list directly after `anchor`.
    pub(crate) fn link_after(&mut self, anchor: BlockId, id: BlockId) {
        debug_assert!(!self.is_linked(id), "block {id:?} is already linked");
        let next = self[anchor].next_free;
        self[id].prev_free = anchor;
        self[id].next_free = next;
        self[next].prev_free = id;
        self[anchor].next_free = id;
    }

    /// Takes `id` out of whatever free list holds it.
    pub(crate) fn unlink(&mut self, id: BlockId) {
        let (prev_free, next_free) = (self[id].prev_free, self[id].next_free);
        self[prev_free].next_free = next_free;
        self[next_free].prev_free = prev_free;
        self[id].prev_free = id;
        self[id].next_free = id;
    }

    pub(crate) fn is_linked(&self, id: BlockId) -> bool {
        self[id].next_free != id
    }
}

impl Index<BlockId> for BlockTable {
    type Output = Block;

    fn index(&self, id: BlockId) -> &Self::Output {
        match self.get(id) {
            Some(block) => block,
            None => panic!("stale block handle {id:?}"),
        }
    }
}

impl IndexMut<BlockId> for BlockTable {
    fn index_mut(&mut self, id: BlockId) -> &mut Self::Output {
        match self.slots.get_mut(id.0).and_then(Option::as_mut) {
            Some(block) => block,
            None => panic!("stale block handle {id:?}"),
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn chain(table: &mut BlockTable, sizes: &[usize]) -> Vec<BlockId> {
        let mut offset = 0;
        let mut ids: Vec<BlockId> = Vec::new();
        for &size in sizes {
            let id = table.insert(offset, size, false);
            if let Some(&prev) = ids.last() {
                table.link_phys(prev, id);
            }
            ids.push(id);
            offset += size;
        }
        ids
    }

    #[test]
    fn test_adjusted_size() {
        assert_eq!(adjusted_size(1), Some(16));
        assert_eq!(adjusted_size(8), Some(16));
        assert_eq!(adjusted_size(9), Some(24));
        assert_eq!(adjusted_size(16), Some(24));
        assert_eq!(adjusted_size(17), Some(32));
        assert_eq!(adjusted_size(100), Some(112));
        assert_eq!(adjusted_size(4088), Some(4096));
        assert_eq!(adjusted_size(4096), Some(4104));
        assert_eq!(adjusted_size(usize::MAX), None);
        assert_eq!(adjusted_size(usize::MAX - TAG_OVERHEAD), None);
    }

    #[test]
    fn test_block_geometry() {
        let mut table = BlockTable::new();
        let id = table.insert(12, 112, true);
        let block = &table[id];
        assert_eq!(block.payload_offset(), 16);
        assert_eq!(block.end(), 124);
        assert_eq!(block.capacity(), 104);
        assert!(!table.is_linked(id));
    }

    #[test]
    fn test_split_and_absorb() {
        let mut table = BlockTable::new();
        let ids = chain(&mut table, &[64, 32]);

        let rest = table.split(ids[0], 24);
        assert_eq!(table[ids[0]].size, 24);
        assert_eq!(table[rest].offset, 24);
        assert_eq!(table[rest].size, 40);
        assert_eq!(table[ids[0]].next_phys, rest);
        assert_eq!(table[rest].prev_phys, ids[0]);
        assert_eq!(table[rest].next_phys, ids[1]);
        assert_eq!(table[ids[1]].prev_phys, rest);

        table.absorb_next(ids[0]);
        assert_eq!(table[ids[0]].size, 64);
        assert_eq!(table[ids[0]].next_phys, ids[1]);
        assert_eq!(table[ids[1]].prev_phys, ids[0]);
        assert!(table.get(rest).is_none());
    }

    #[test]
    fn test_retired_slot_is_reused() {
        let mut table = BlockTable::new();
        let ids = chain(&mut table, &[16, 16]);
        table.absorb_next(ids[0]);
        assert_eq!(table.len(), 2);

        let id = table.insert(32, 16, false);
        assert_eq!(id, ids[1]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    #[should_panic(expected = "stale block handle")]
    fn test_stale_handle_panics() {
        let mut table = BlockTable::new();
        let ids = chain(&mut table, &[16, 16]);
        table.absorb_next(ids[0]);
        let _ = table[ids[1]].size;
    }

    #[test]
    fn test_link_and_unlink() {
        let mut table = BlockTable::new();
        let head = table.insert(0, 0, true);
        let ids = chain(&mut table, &[16, 16, 16]);

        for &id in &ids {
            table.link_after(head, id);
        }
        // head -> ids[2] -> ids[1] -> ids[0] -> head
        assert_eq!(table[head].next_free, ids[2]);
        assert_eq!(table[ids[2]].next_free, ids[1]);
        assert_eq!(table[ids[0]].next_free, head);
        assert_eq!(table[head].prev_free, ids[0]);

        table.unlink(ids[1]);
        assert!(!table.is_linked(ids[1]));
        assert_eq!(table[ids[2]].next_free, ids[0]);
        assert_eq!(table[ids[0]].prev_free, ids[2]);

        table.unlink(ids[2]);
        assert_eq!(table[head].next_free, ids[0]);
        assert_eq!(table[ids[0]].prev_free, head);

        table.unlink(ids[0]);
        assert_eq!(table[head].next_free, head);
        assert_eq!(table[head].prev_free, head);
    }
}

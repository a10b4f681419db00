//! Segregated free lists.
//!
//! Each size class owns a circular doubly linked list threaded through the
//! `prev_free`/`next_free` handles of the block descriptors. The head of
//! every list is a sentinel descriptor of size zero, so the first block of a
//! class is unlinked exactly like any other block.
//!
//! ```text
//!   ┌──────────────────────────────────────────────────┐
//!   v                                                  │
//! [sentinel] <-> [newest] <-> ... <-> [oldest] <───────┘
//! ```
//!
//! Blocks are inserted at the front, so a block that was just freed is the
//! first one visited by a fit search of its class.

use crate::{
    block::{BlockId, BlockTable},
    size_class::{NUM_SIZE_CLASSES, SizeClass},
};

#[derive(Debug)]
pub(crate) struct SegregatedLists {
    heads: [BlockId; NUM_SIZE_CLASSES],
}

impl SegregatedLists {
    /// Creates one empty list per size class, allocating the sentinels in
    /// `blocks`.
    pub(crate) fn new(blocks: &mut BlockTable) -> Self {
        let heads = core::array::from_fn(|_| blocks.insert(0, 0, true));
        Self { heads }
    }

    pub(crate) fn head(&self, class: SizeClass) -> BlockId {
        self.heads[class.index()]
    }

    /// Inserts a free block at the front of the list of its size class.
    pub(crate) fn insert(&self, blocks: &mut BlockTable, id: BlockId) {
        let block = &blocks[id];
        assert!(
            !block.allocated,
            "allocated block {id:?} inserted into a free list"
        );
        let head = self.head(SizeClass::of(block.size));
        blocks.link_after(head, id);
    }

    /// Removes a block from the list that holds it.
    pub(crate) fn remove(&self, blocks: &mut BlockTable, id: BlockId) {
        debug_assert!(!self.heads.contains(&id), "sentinel {id:?} removed");
        debug_assert!(blocks.is_linked(id), "block {id:?} is not in a free list");
        blocks.unlink(id);
    }

    /// Iterates over the blocks of one class from the front of the list.
    pub(crate) fn iter<'a>(&self, blocks: &'a BlockTable, class: SizeClass) -> Members<'a> {
        let head = self.head(class);
        Members {
            blocks,
            head,
            cursor: blocks[head].next_free,
        }
    }
}

pub(crate) struct Members<'a> {
    blocks: &'a BlockTable,
    head: BlockId,
    cursor: BlockId,
}

impl Iterator for Members<'_> {
    type Item = BlockId;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == self.head {
            return None;
        }
        let id = self.cursor;
        self.cursor = self.blocks[id].next_free;
        Some(id)
    }
}

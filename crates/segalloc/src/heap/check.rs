//! Heap consistency checker.
//!
//! The checker walks every block in address order and every free list, and
//! reports the first structural problem it finds. It is a diagnostic tool:
//! nothing calls it unless the `debug-check` feature is enabled.

use snafu::{OptionExt as _, Snafu, ensure};

use super::Heap;
use crate::{
    block::{ALIGNMENT, MIN_BLOCK_SIZE, WORD_SIZE},
    error::{self, Located, Location},
    size_class::SizeClass,
};

#[derive(Debug, Snafu)]
pub enum HeapCheckError {
    #[snafu(display("adjacent blocks at offsets {left:#x} and {right:#x} are both free"))]
    Uncoalesced {
        left: usize,
        right: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free block at offset {offset:#x} is not in any free list"))]
    Unlisted {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("allocated block at offset {offset:#x} is in the free list of class {class}"))]
    AllocatedInList {
        offset: usize,
        class: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "block at offset {offset:#x} of {size} bytes is in the free list of class {found}, expected {expected}"
    ))]
    WrongClass {
        offset: usize,
        size: usize,
        found: usize,
        expected: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free list of class {class} is broken after offset {offset:#x}"))]
    BrokenLink {
        class: usize,
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{walked} free blocks in the heap but {listed} in the free lists"))]
    FreeCount {
        walked: usize,
        listed: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block at offset {offset:#x} has invalid size {size}"))]
    BadSize {
        offset: usize,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block at offset {offset:#x} should start at {expected:#x}"))]
    Misplaced {
        offset: usize,
        expected: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no block found at offset {offset:#x}"))]
    Missing {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("allocated block at offset {offset:#x} is not tracked as live"))]
    Untracked {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{live} live allocations tracked but {walked} allocated blocks found"))]
    LiveCount {
        live: usize,
        walked: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl Located for HeapCheckError {
    fn location(&self) -> Location {
        match self {
            Self::Uncoalesced { location, .. }
            | Self::Unlisted { location, .. }
            | Self::AllocatedInList { location, .. }
            | Self::WrongClass { location, .. }
            | Self::BrokenLink { location, .. }
            | Self::FreeCount { location, .. }
            | Self::BadSize { location, .. }
            | Self::Misplaced { location, .. }
            | Self::Missing { location, .. }
            | Self::Untracked { location, .. }
            | Self::LiveCount { location, .. } => *location,
        }
    }
}

impl<R> Heap<R> {
    /// Verifies the structural invariants of the heap.
    ///
    /// - blocks tile the heap from the prologue to the epilogue, with
    ///   neighbour handles that agree in both directions
    /// - every block size is aligned and at least the minimum block size
    /// - no two adjacent blocks are both free
    /// - every free block is in exactly the list of its size class, and
    ///   lists contain nothing else
    /// - every allocated block is tracked as a live allocation
    pub fn check(&self) -> Result<(), HeapCheckError> {
        let walked_free = self.check_blocks()?;
        let listed = self.check_lists()?;
        ensure!(
            walked_free == listed,
            FreeCountSnafu {
                walked: walked_free,
                listed,
            }
        );
        Ok(())
    }

    /// Runs [`check`](Self::check) and stops the process with a report if it
    /// fails.
    pub fn check_or_halt(&self) {
        if let Err(err) = self.check() {
            error::halt(err);
        }
    }

    /// Walks the blocks in address order and returns the number of free
    /// blocks.
    fn check_blocks(&self) -> Result<usize, HeapCheckError> {
        let prologue = self
            .blocks
            .get(self.prologue)
            .context(MissingSnafu { offset: WORD_SIZE })?;
        let mut expected = prologue.end();
        let mut prev = self.prologue;
        let mut prev_free: Option<usize> = None;
        let mut free = 0;
        let mut allocated = 0;

        let mut id = prologue.next_phys;
        while id != self.epilogue {
            let block = self
                .blocks
                .get(id)
                .context(MissingSnafu { offset: expected })?;
            ensure!(
                block.offset == expected && block.prev_phys == prev,
                MisplacedSnafu {
                    offset: block.offset,
                    expected,
                }
            );
            ensure!(
                block.size >= MIN_BLOCK_SIZE && block.size.is_multiple_of(ALIGNMENT),
                BadSizeSnafu {
                    offset: block.offset,
                    size: block.size,
                }
            );

            if block.allocated {
                ensure!(
                    self.live.get(&block.payload_offset()) == Some(&id),
                    UntrackedSnafu {
                        offset: block.offset,
                    }
                );
                allocated += 1;
                prev_free = None;
            } else {
                if let Some(left) = prev_free {
                    return UncoalescedSnafu {
                        left,
                        right: block.offset,
                    }
                    .fail();
                }
                ensure!(
                    self.blocks.is_linked(id),
                    UnlistedSnafu {
                        offset: block.offset,
                    }
                );
                free += 1;
                prev_free = Some(block.offset);
            }

            expected = block.end();
            prev = id;
            id = block.next_phys;
        }

        let epilogue = self
            .blocks
            .get(self.epilogue)
            .context(MissingSnafu { offset: expected })?;
        ensure!(
            epilogue.offset == expected && epilogue.prev_phys == prev,
            MisplacedSnafu {
                offset: epilogue.offset,
                expected,
            }
        );
        ensure!(
            self.live.len() == allocated,
            LiveCountSnafu {
                live: self.live.len(),
                walked: allocated,
            }
        );
        Ok(free)
    }

    /// Walks every free list and returns the total number of members.
    fn check_lists(&self) -> Result<usize, HeapCheckError> {
        let mut listed = 0;
        for class in SizeClass::all() {
            let head = self.lists.head(class);
            let mut prev = head;
            let mut prev_offset = 0;
            let mut cursor = self.blocks[head].next_free;
            let mut steps = 0;

            while cursor != head {
                let broken = BrokenLinkSnafu {
                    class: class.index(),
                    offset: prev_offset,
                };
                let block = self.blocks.get(cursor).context(broken)?;
                steps += 1;
                ensure!(
                    block.prev_free == prev && steps <= self.blocks.len(),
                    broken
                );
                ensure!(
                    !block.allocated,
                    AllocatedInListSnafu {
                        offset: block.offset,
                        class: class.index(),
                    }
                );
                let expected = SizeClass::of(block.size);
                ensure!(
                    expected == class,
                    WrongClassSnafu {
                        offset: block.offset,
                        size: block.size,
                        found: class.index(),
                        expected: expected.index(),
                    }
                );

                listed += 1;
                prev = cursor;
                prev_offset = block.offset;
                cursor = block.next_free;
            }

            ensure!(
                self.blocks[head].prev_free == prev,
                BrokenLinkSnafu {
                    class: class.index(),
                    offset: prev_offset,
                }
            );
        }
        Ok(listed)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{block::BlockId, error::Report, region::MemRegion};

    fn heap_with_holes() -> (Heap<MemRegion>, Vec<*mut u8>) {
        let mut heap = Heap::new(MemRegion::new(1 << 16)).unwrap();
        let ptrs: Vec<_> = (0..4).map(|_| heap.allocate(100).unwrap()).collect();
        heap.free(ptrs[1]);
        heap.check().unwrap();
        (heap, ptrs)
    }

    fn block_of(heap: &Heap<MemRegion>, ptr: *mut u8) -> BlockId {
        heap.find_live(ptr).unwrap()
    }

    #[test]
    fn test_consistent_heap_passes() {
        let (mut heap, ptrs) = heap_with_holes();
        heap.free(ptrs[3]);
        heap.check().unwrap();
        heap.check_or_halt();
    }

    #[test]
    fn test_detects_uncoalesced_neighbours() {
        let (mut heap, ptrs) = heap_with_holes();
        // Mark a block free and list it, but skip coalescing.
        let id = block_of(&heap, ptrs[2]);
        heap.live.remove(&heap.blocks[id].payload_offset());
        heap.blocks[id].allocated = false;
        heap.lists.insert(&mut heap.blocks, id);

        let err = heap.check().unwrap_err();
        assert!(matches!(
            err,
            HeapCheckError::Uncoalesced {
                left: 124,
                right: 236,
                ..
            }
        ));
    }

    #[test]
    fn test_detects_unlisted_free_block() {
        let (mut heap, ptrs) = heap_with_holes();
        let id = block_of(&heap, ptrs[0]);
        heap.live.remove(&heap.blocks[id].payload_offset());
        heap.blocks[id].allocated = false;

        let err = heap.check().unwrap_err();
        assert!(matches!(err, HeapCheckError::Unlisted { offset: 12, .. }));
    }

    #[test]
    fn test_detects_allocated_block_in_list() {
        let (mut heap, ptrs) = heap_with_holes();
        let id = block_of(&heap, ptrs[0]);
        let head = heap.lists.head(SizeClass::of(112));
        heap.blocks.link_after(head, id);

        let err = heap.check().unwrap_err();
        assert!(matches!(
            err,
            HeapCheckError::AllocatedInList {
                offset: 12,
                class: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_detects_wrong_class() {
        let (mut heap, _ptrs) = heap_with_holes();
        // The only member of class 2 is the hole left by `ptrs[1]`.
        let id = heap
            .lists
            .iter(&heap.blocks, SizeClass::of(112))
            .next()
            .unwrap();
        heap.lists.remove(&mut heap.blocks, id);
        let head = heap.lists.head(SizeClass::LARGEST);
        heap.blocks.link_after(head, id);

        let err = heap.check().unwrap_err();
        assert!(matches!(
            err,
            HeapCheckError::WrongClass {
                size: 112,
                found: 13,
                expected: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_detects_broken_link() {
        let (mut heap, _ptrs) = heap_with_holes();
        let head = heap.lists.head(SizeClass::of(112));
        let first = heap.blocks[head].next_free;
        heap.blocks[first].prev_free = first;

        let err = heap.check().unwrap_err();
        assert!(matches!(err, HeapCheckError::BrokenLink { class: 2, .. }));
    }

    #[test]
    fn test_detects_bad_size() {
        let (mut heap, ptrs) = heap_with_holes();
        let id = block_of(&heap, ptrs[3]);
        let next = heap.blocks[id].next_phys;
        heap.blocks[id].size += 4;
        heap.blocks[next].offset += 4;
        heap.blocks[next].size -= 4;

        let err = heap.check().unwrap_err();
        assert!(matches!(err, HeapCheckError::BadSize { size: 116, .. }));
    }

    #[test]
    fn test_detects_gap() {
        let (mut heap, ptrs) = heap_with_holes();
        let id = block_of(&heap, ptrs[3]);
        heap.blocks[id].size -= 8;

        let err = heap.check().unwrap_err();
        assert!(matches!(
            err,
            HeapCheckError::Misplaced { expected: 452, .. }
        ));
    }

    #[test]
    fn test_detects_stale_neighbour_handle() {
        let (mut heap, ptrs) = heap_with_holes();
        let id = block_of(&heap, ptrs[3]);
        heap.blocks[id].next_phys = BlockId::NONE;

        let err = heap.check().unwrap_err();
        assert!(matches!(err, HeapCheckError::Missing { offset: 460, .. }));
    }

    #[test]
    fn test_detects_untracked_allocation() {
        let (mut heap, ptrs) = heap_with_holes();
        let id = block_of(&heap, ptrs[0]);
        heap.live.remove(&heap.blocks[id].payload_offset());

        let err = heap.check().unwrap_err();
        assert!(matches!(err, HeapCheckError::Untracked { offset: 12, .. }));
    }

    #[test]
    fn test_report_shows_where_check_failed() {
        let (mut heap, ptrs) = heap_with_holes();
        let id = block_of(&heap, ptrs[0]);
        heap.live.remove(&heap.blocks[id].payload_offset());

        let err = heap.check().unwrap_err();
        assert!(err.location().file().ends_with("check.rs"));
        let rendered = Report::new(err).to_string();
        assert!(rendered.starts_with("Error: allocated block at offset 0xc is not tracked"));
        assert!(rendered.contains("\n  at "));
        assert!(rendered.contains("check.rs:"));
    }

    #[test]
    #[should_panic(expected = "check.rs:")]
    fn test_check_or_halt_panics() {
        let (mut heap, ptrs) = heap_with_holes();
        let id = block_of(&heap, ptrs[0]);
        heap.live.remove(&heap.blocks[id].payload_offset());
        heap.blocks[id].allocated = false;
        heap.check_or_halt();
    }
}

//! The allocator context.
//!
//! A [`Heap`] owns one growable region and the descriptor table that maps it
//! into blocks. The region starts with an alignment pad and a permanently
//! allocated prologue block and ends with a zero-sized epilogue block that is
//! moved every time the region grows:
//!
//! ```text
//! ┌─────┬──────────┬─────────┬─────────┬─────┬──────────┐
//! │ pad │ prologue │ block 1 │ block 2 │ ... │ epilogue │
//! └─────┴──────────┴─────────┴─────────┴─────┴──────────┘
//! 0     4          12                           brk - 4
//! ```
//!
//! Free blocks are kept in segregated lists, one per
//! [`SizeClass`](crate::SizeClass), and are coalesced with their free
//! physical neighbours as soon as they are created.

use alloc::collections::BTreeMap;
use core::fmt;

use log::{debug, trace, warn};
use snafu::{ResultExt as _, Snafu, ensure};

use crate::{
    block::{self, ALIGNMENT, BlockId, BlockTable, TAG_OVERHEAD, WORD_SIZE},
    config::HeapConfig,
    error::{Located, Location},
    free_list::SegregatedLists,
    region::{Sbrk, SbrkError},
};

mod check;
mod coalesce;
mod fit;
mod place;
mod resize;

pub use self::check::HeapCheckError;

/// Bytes requested from the region before the first chunk: alignment pad,
/// prologue header and footer, epilogue header.
const INITIAL_AREA: usize = 4 * WORD_SIZE;

#[derive(Debug, Snafu)]
pub enum InitError {
    #[snafu(display(
        "heap initialization failed: chunk size {chunk_size} is not a multiple of {ALIGNMENT} of at least {} bytes",
        block::MIN_BLOCK_SIZE
    ))]
    InvalidChunkSize {
        chunk_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "heap initialization failed: region start {addr:#x} is not {ALIGNMENT}-byte aligned"
    ))]
    MisalignedRegion {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap initialization failed: out of memory"))]
    OutOfMemory {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: SbrkError,
    },
}

impl Located for InitError {
    fn location(&self) -> Location {
        match self {
            Self::InvalidChunkSize { location, .. }
            | Self::MisalignedRegion { location, .. }
            | Self::OutOfMemory { location, .. } => *location,
        }
    }

    fn located_source(&self) -> Option<&dyn Located> {
        match self {
            Self::OutOfMemory { source, .. } => Some(source),
            Self::InvalidChunkSize { .. } | Self::MisalignedRegion { .. } => None,
        }
    }
}

/// A block as seen by diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the block's header from the start of the heap.
    pub offset: usize,
    pub size: usize,
    pub allocated: bool,
}

/// Totals gathered by walking every block of a heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes obtained from the region, boundary blocks included.
    pub heap_size: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
}

/// A segregated-fit allocator over a region obtained through [`Sbrk`].
///
/// # Examples
///
/// ```
/// use segalloc::{Heap, region::MemRegion};
///
/// let mut heap = Heap::new(MemRegion::new(1 << 16)).unwrap();
///
/// let ptr = heap.allocate(100).unwrap();
/// unsafe { ptr.write_bytes(0xa5, 100) };
///
/// let ptr = heap.resize(ptr, 300).unwrap();
/// assert_eq!(unsafe { ptr.add(99).read() }, 0xa5);
///
/// heap.free(ptr);
/// assert!(heap.check().is_ok());
/// ```
pub struct Heap<R> {
    region: R,
    /// First byte obtained from the region; all offsets are relative to it.
    base: *mut u8,
    blocks: BlockTable,
    lists: SegregatedLists,
    /// Live allocations, keyed by payload offset.
    live: BTreeMap<usize, BlockId>,
    prologue: BlockId,
    epilogue: BlockId,
    config: HeapConfig,
}

unsafe impl<R> Send for Heap<R> where R: Send {}

impl<R> fmt::Debug for Heap<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("base", &self.base)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<R> Heap<R>
where
    R: Sbrk,
{
    /// Creates a heap with the default [`HeapConfig`].
    pub fn new(region: R) -> Result<Self, InitError> {
        Self::with_config(region, HeapConfig::default())
    }

    /// Creates a heap on top of `region`.
    ///
    /// Lays down the prologue and epilogue and seeds the free lists with one
    /// free block of `config.chunk_size` bytes.
    pub fn with_config(mut region: R, config: HeapConfig) -> Result<Self, InitError> {
        ensure!(
            config.is_valid_chunk_size(),
            InvalidChunkSizeSnafu {
                chunk_size: config.chunk_size,
            }
        );

        let base = region.sbrk(INITIAL_AREA).context(OutOfMemorySnafu)?;
        ensure!(
            base.addr().is_multiple_of(ALIGNMENT),
            MisalignedRegionSnafu { addr: base.addr() }
        );

        let mut blocks = BlockTable::new();
        let lists = SegregatedLists::new(&mut blocks);
        let prologue = blocks.insert(WORD_SIZE, TAG_OVERHEAD, true);
        let epilogue = blocks.insert(WORD_SIZE + TAG_OVERHEAD, 0, true);
        blocks.link_phys(prologue, epilogue);

        let mut heap = Self {
            region,
            base,
            blocks,
            lists,
            live: BTreeMap::new(),
            prologue,
            epilogue,
            config,
        };
        heap.extend_heap(config.chunk_size).context(OutOfMemorySnafu)?;

        debug!(
            "heap initialized at {:p} with a {} byte chunk",
            heap.base, config.chunk_size
        );
        heap.debug_check();
        Ok(heap)
    }

    /// Allocates a block with room for at least `size` bytes.
    ///
    /// Returns `None` when `size` is zero or when the region cannot grow
    /// enough to serve the request. The returned pointer is
    /// [`ALIGNMENT`]-aligned.
    pub fn allocate(&mut self, size: usize) -> Option<*mut u8> {
        if size == 0 {
            return None;
        }
        let asize = block::adjusted_size(size)?;

        let id = match self.find_fit(asize) {
            Some(id) => id,
            None => {
                let extend_size = asize.max(self.config.chunk_size);
                match self.extend_heap(extend_size) {
                    Ok(id) => id,
                    Err(err) => {
                        warn!("cannot serve a {size} byte request: {err}");
                        return None;
                    }
                }
            }
        };

        let ptr = self.place(id, asize);
        self.debug_check();
        Some(ptr)
    }

    /// Allocates a zero-filled array of `count` elements of `size` bytes.
    ///
    /// Returns `None` if the total size is zero or overflows, or if the
    /// allocation fails.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Option<*mut u8> {
        let total = count.checked_mul(size)?;
        let ptr = self.allocate(total)?;
        unsafe {
            ptr.write_bytes(0, total);
        }
        Some(ptr)
    }

    /// Grows the region by at least `size` bytes and returns the resulting
    /// free block, already coalesced and linked into its list.
    fn extend_heap(&mut self, size: usize) -> Result<BlockId, SbrkError> {
        let size = size.next_multiple_of(ALIGNMENT);
        let old_brk = self.region.sbrk(size)?;

        let epilogue = self.epilogue;
        let offset = self.blocks[epilogue].offset;
        debug_assert_eq!(old_brk.addr(), self.base.addr() + offset + WORD_SIZE);

        // The new block starts where the epilogue header used to be.
        let last = self.blocks[epilogue].prev_phys;
        let id = self.blocks.insert(offset, size, false);
        self.blocks.link_phys(last, id);
        self.blocks[epilogue].offset += size;
        trace!("heap grew by {size} bytes to {}", self.heap_size());

        let id = self.coalesce(id);
        self.lists.insert(&mut self.blocks, id);
        Ok(id)
    }
}

impl<R> Heap<R> {
    /// Releases the block whose payload starts at `ptr`.
    ///
    /// Freeing a null pointer does nothing.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not a live allocation of this heap, which includes
    /// pointers that were already freed.
    pub fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let id = self.take_live(ptr);
        self.release(id);
        self.debug_check();
    }

    /// Returns the number of usable payload bytes of the live allocation at
    /// `ptr`, or `None` if `ptr` is not one.
    #[must_use]
    pub fn usable_size(&self, ptr: *const u8) -> Option<usize> {
        let id = self.find_live(ptr)?;
        Some(self.blocks[id].capacity())
    }

    /// Returns the region the heap was built on.
    #[must_use]
    pub fn region(&self) -> &R {
        &self.region
    }

    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Returns the number of bytes obtained from the region.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.blocks[self.epilogue].offset + WORD_SIZE
    }

    /// Iterates over every block between the prologue and the epilogue in
    /// address order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        let mut cursor = self.blocks[self.prologue].next_phys;
        core::iter::from_fn(move || {
            if cursor == self.epilogue {
                return None;
            }
            let block = &self.blocks[cursor];
            cursor = block.next_phys;
            Some(BlockInfo {
                offset: block.offset,
                size: block.size,
                allocated: block.allocated,
            })
        })
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.blocks().fold(
            HeapStats {
                heap_size: self.heap_size(),
                ..HeapStats::default()
            },
            |mut stats, block| {
                if block.allocated {
                    stats.allocated_blocks += 1;
                    stats.allocated_bytes += block.size;
                } else {
                    stats.free_blocks += 1;
                    stats.free_bytes += block.size;
                }
                stats
            },
        )
    }

    /// Marks a block free and returns it to the free lists.
    fn release(&mut self, id: BlockId) {
        self.blocks[id].allocated = false;
        let id = self.coalesce(id);
        self.lists.insert(&mut self.blocks, id);
    }

    fn payload_ptr(&self, id: BlockId) -> *mut u8 {
        self.base.wrapping_add(self.blocks[id].payload_offset())
    }

    fn find_live(&self, ptr: *const u8) -> Option<BlockId> {
        let offset = ptr.addr().checked_sub(self.base.addr())?;
        self.live.get(&offset).copied()
    }

    #[track_caller]
    fn live_block(&self, ptr: *const u8) -> BlockId {
        match self.find_live(ptr) {
            Some(id) => id,
            None => panic!("{ptr:p} is not a live allocation of this heap"),
        }
    }

    #[track_caller]
    fn take_live(&mut self, ptr: *const u8) -> BlockId {
        let id = self.live_block(ptr);
        self.live.remove(&self.blocks[id].payload_offset());
        id
    }

    #[cfg_attr(not(feature = "debug-check"), expect(clippy::unused_self))]
    fn debug_check(&self) {
        #[cfg(feature = "debug-check")]
        self.check_or_halt();
    }
}

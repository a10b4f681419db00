//! Allocation tracing for [`segalloc`] heaps.
//!
//! [`TracedHeap`] sits in front of a [`Heap`] and exposes the classic
//! `malloc`/`calloc`/`realloc`/`free` entry points. Every call is logged
//! with its arguments and result, and every block handed out is tracked
//! with its size and a reference count, so that misuse can be caught
//! before it reaches the allocator:
//!
//! - a `free` of a pointer that was never handed out (an illegal free) or
//!   that was already released (a double free) is logged and dropped;
//! - a `realloc` of such a pointer is logged and served by a fresh `malloc`.
//!
//! When the trace is finished, a [`TraceSummary`] reports the totals and
//! every block that was never released.
//!
//! # Examples
//!
//! ```
//! use memtrace::TracedHeap;
//! use segalloc::{Heap, region::MemRegion};
//!
//! let mut heap = TracedHeap::new(Heap::new(MemRegion::new(1 << 16)).unwrap());
//!
//! let a = heap.malloc(100);
//! let b = heap.calloc(4, 8);
//! let a = heap.realloc(a, 200);
//! heap.free(b);
//! heap.free(b); // logged as a double free, not forwarded
//!
//! let summary = heap.finish();
//! assert_eq!(summary.stats.double_frees, 1);
//! assert_eq!(summary.leaks.len(), 1);
//! assert_eq!(summary.leaks[0].addr, a.addr());
//! ```

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

use alloc::collections::{BTreeMap, btree_map::Entry};
use core::ptr;

use log::{error, info, warn};
use segalloc::{Heap, region::Sbrk};

pub use self::stats::{TraceStats, TraceSummary, TrackedBlock};

mod stats;

/// How a pointer passed to `free` or `realloc` relates to the tracked
/// blocks.
enum Release {
    /// The block was live and has been released.
    Released(TrackedBlock),
    /// The pointer was never handed out.
    Illegal,
    /// The block was handed out but already released.
    Double,
}

/// A [`Heap`] whose entry points are logged and checked.
#[derive(Debug)]
pub struct TracedHeap<R> {
    heap: Heap<R>,
    blocks: BTreeMap<usize, TrackedBlock>,
    stats: TraceStats,
}

impl<R> TracedHeap<R> {
    pub fn new(heap: Heap<R>) -> Self {
        info!("memtrace: tracing started");
        Self {
            heap,
            blocks: BTreeMap::new(),
            stats: TraceStats::default(),
        }
    }

    /// Releases `ptr` if it is a live block handed out by this tracer.
    ///
    /// Null pointers are ignored. Illegal and double frees are logged and
    /// counted but never forwarded to the heap.
    pub fn free(&mut self, ptr: *mut u8) {
        self.stats.free_calls += 1;
        info!("free( {ptr:p} )");
        if ptr.is_null() {
            return;
        }

        match self.release(ptr) {
            Release::Released(_) => self.heap.free(ptr),
            Release::Illegal => {
                self.stats.illegal_frees += 1;
                error!("*** ILLEGAL FREE *** {ptr:p} was never allocated");
            }
            Release::Double => {
                self.stats.double_frees += 1;
                error!("*** DOUBLE FREE *** {ptr:p} was already freed");
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> &TraceStats {
        &self.stats
    }

    /// Returns the tracked block at `ptr`, live or released.
    #[must_use]
    pub fn tracked(&self, ptr: *const u8) -> Option<&TrackedBlock> {
        self.blocks.get(&ptr.addr())
    }

    #[must_use]
    pub fn heap(&self) -> &Heap<R> {
        &self.heap
    }

    /// Stops tracing and returns the underlying heap.
    pub fn into_heap(self) -> Heap<R> {
        self.heap
    }

    /// Builds the report of the trace so far.
    #[must_use]
    pub fn summary(&self) -> TraceSummary {
        TraceSummary {
            stats: self.stats,
            leaks: self
                .blocks
                .values()
                .filter(|block| block.refcount > 0)
                .copied()
                .collect(),
        }
    }

    /// Stops tracing, logs the report and returns it.
    pub fn finish(self) -> TraceSummary {
        let summary = self.summary();
        info!("memtrace: tracing finished\n{summary}");
        if !summary.leaks.is_empty() {
            warn!("memtrace: {} blocks were never freed", summary.leaks.len());
        }
        summary
    }

    fn track(&mut self, ptr: *mut u8, size: usize) {
        self.stats.allocated_bytes += size;
        let addr = ptr.addr();
        match self.blocks.entry(addr) {
            Entry::Vacant(entry) => {
                entry.insert(TrackedBlock {
                    addr,
                    size,
                    refcount: 1,
                });
            }
            Entry::Occupied(mut entry) => {
                let block = entry.get_mut();
                block.size = size;
                block.refcount += 1;
            }
        }
    }

    fn release(&mut self, ptr: *mut u8) -> Release {
        match self.blocks.get_mut(&ptr.addr()) {
            None => Release::Illegal,
            Some(block) if block.refcount == 0 => Release::Double,
            Some(block) => {
                block.refcount -= 1;
                self.stats.freed_bytes += block.size;
                Release::Released(*block)
            }
        }
    }

    /// Undoes a [`release`](Self::release) whose forwarded call failed.
    fn restore(&mut self, block: TrackedBlock) {
        self.stats.freed_bytes -= block.size;
        self.blocks.insert(
            block.addr,
            TrackedBlock {
                refcount: block.refcount + 1,
                ..block
            },
        );
    }
}

impl<R> TracedHeap<R>
where
    R: Sbrk,
{
    /// Allocates `size` bytes. Returns null on failure.
    pub fn malloc(&mut self, size: usize) -> *mut u8 {
        self.stats.malloc_calls += 1;
        let ptr = self.heap.allocate(size).unwrap_or(ptr::null_mut());
        info!("malloc( {size} ) = {ptr:p}");
        if !ptr.is_null() {
            self.track(ptr, size);
        }
        ptr
    }

    /// Allocates a zero-filled array of `count` elements of `size` bytes.
    /// Returns null on failure.
    pub fn calloc(&mut self, count: usize, size: usize) -> *mut u8 {
        self.stats.calloc_calls += 1;
        let ptr = self
            .heap
            .allocate_zeroed(count, size)
            .unwrap_or(ptr::null_mut());
        info!("calloc( {count} , {size} ) = {ptr:p}");
        if !ptr.is_null() {
            self.track(ptr, count * size);
        }
        ptr
    }

    /// Resizes the block at `ptr` to `size` bytes.
    ///
    /// A null `ptr` allocates. A pointer that is not a live block is
    /// reported and a fresh block is allocated instead, leaving the bogus
    /// pointer alone. If the heap cannot serve the request the original
    /// block stays live and null is returned.
    pub fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        self.stats.realloc_calls += 1;

        let new_ptr = if ptr.is_null() {
            self.heap.allocate(size)
        } else {
            match self.release(ptr) {
                Release::Released(block) => {
                    let new_ptr = self.heap.resize(ptr, size);
                    if new_ptr.is_none() && size > 0 {
                        self.restore(block);
                    }
                    new_ptr
                }
                Release::Illegal => {
                    self.stats.illegal_frees += 1;
                    error!("*** ILLEGAL FREE *** {ptr:p} passed to realloc was never allocated");
                    self.heap.allocate(size)
                }
                Release::Double => {
                    self.stats.double_frees += 1;
                    error!("*** DOUBLE FREE *** {ptr:p} passed to realloc was already freed");
                    self.heap.allocate(size)
                }
            }
        };

        let new_ptr = new_ptr.unwrap_or(ptr::null_mut());
        info!("realloc( {ptr:p} , {size} ) = {new_ptr:p}");
        if !new_ptr.is_null() {
            self.track(new_ptr, size);
        }
        new_ptr
    }
}

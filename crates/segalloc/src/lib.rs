//! A segregated-fit heap allocator with boundary-tag coalescing.
//!
//! The allocator manages a single contiguous region that only grows. Memory
//! is obtained through the [`Sbrk`](region::Sbrk) trait, carved into blocks,
//! and handed out by [`Heap::allocate`], [`Heap::free`] and [`Heap::resize`].
//!
//! # Allocation Policy
//!
//! - Requests are rounded up to a multiple of 8 bytes, plus 8 bytes of tag
//!   overhead, with a minimum block size of 16 bytes.
//! - Free blocks are kept in 14 segregated lists indexed by the position of
//!   the highest set bit of the block size (see [`SizeClass`]).
//! - A fit search starts at the class of the request and scans each class in
//!   full for its smallest sufficient block. The first class with a match
//!   wins.
//! - A chosen block is split when the remainder can form a block of its own.
//! - Freed blocks are merged with their free neighbours immediately, so no
//!   two adjacent blocks are ever both free.
//! - When nothing fits, the region is extended by the larger of the request
//!   and the configured chunk size (4 KiB by default).
//!
//! # Usage Examples
//!
//! ```rust
//! use segalloc::{Heap, region::MemRegion};
//!
//! let mut heap = Heap::new(MemRegion::new(1 << 20)).unwrap();
//!
//! let a = heap.allocate(24).unwrap();
//! let b = heap.allocate(1000).unwrap();
//! assert_eq!(a.addr() % 8, 0);
//!
//! heap.free(a);
//! let b = heap.resize(b, 2000).unwrap();
//! heap.free(b);
//!
//! let stats = heap.stats();
//! assert_eq!(stats.allocated_blocks, 0);
//! assert_eq!(stats.free_blocks, 1);
//! ```
//!
//! # Thread Safety
//!
//! [`Heap`] is `Send` but requires `&mut self` for every mutating operation.
//! [`LockedHeap`](locked::LockedHeap) wraps it in a spin lock for shared use.
//!
//! # Diagnostics
//!
//! [`Heap::check`] verifies every structural invariant of the heap. With the
//! `debug-check` feature enabled it runs after every mutating operation and
//! halts with a report on the first inconsistency.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

pub mod block;
pub mod config;
pub mod error;
mod free_list;
pub mod heap;
pub mod locked;
pub mod region;
pub mod size_class;

pub use self::{
    config::HeapConfig,
    heap::{BlockInfo, Heap, HeapCheckError, HeapStats, InitError},
    locked::LockedHeap,
    size_class::SizeClass,
};

//! Counters and reports gathered by a [`TracedHeap`](crate::TracedHeap).

use alloc::{format, vec::Vec};
use core::fmt;

/// Per-entry-point call counts and byte totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceStats {
    pub malloc_calls: usize,
    pub calloc_calls: usize,
    pub realloc_calls: usize,
    pub free_calls: usize,
    /// Bytes handed out by successful `malloc`, `calloc` and `realloc` calls.
    pub allocated_bytes: usize,
    /// Bytes of tracked blocks released by `free` and `realloc`.
    pub freed_bytes: usize,
    pub illegal_frees: usize,
    pub double_frees: usize,
}

impl TraceStats {
    /// Average number of bytes per allocating call, or zero if there were
    /// none.
    #[must_use]
    pub fn average_allocation(&self) -> usize {
        let calls = self.malloc_calls + self.calloc_calls + self.realloc_calls;
        self.allocated_bytes.checked_div(calls).unwrap_or(0)
    }
}

/// A block handed out through the tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedBlock {
    pub addr: usize,
    /// Size requested by the most recent allocation at `addr`.
    pub size: usize,
    /// Number of times the block was handed out minus the number of times
    /// it was released.
    pub refcount: u32,
}

/// Final report of a trace.
///
/// ```text
/// Statistics
///   allocated_total      1536
///   allocated_avg        512
///   freed_total          1024
///
/// Non-deallocated memory blocks
///   block              size       ref cnt
///   0x7f3a9c000010     512        1
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSummary {
    pub stats: TraceStats,
    /// Blocks still referenced, in address order.
    pub leaks: Vec<TrackedBlock>,
}

impl fmt::Display for TraceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Statistics")?;
        writeln!(f, "  allocated_total      {}", self.stats.allocated_bytes)?;
        writeln!(
            f,
            "  allocated_avg        {}",
            self.stats.average_allocation()
        )?;
        writeln!(f, "  freed_total          {}", self.stats.freed_bytes)?;

        if !self.leaks.is_empty() {
            writeln!(f)?;
            writeln!(f, "Non-deallocated memory blocks")?;
            writeln!(f, "  {:<18} {:<10} ref cnt", "block", "size")?;
            for block in &self.leaks {
                let addr = format!("{:#x}", block.addr);
                writeln!(f, "  {:<18} {:<10} {}", addr, block.size, block.refcount)?;
            }
        }
        Ok(())
    }
}

//! Heap-wide corruption sweep.
//!
//! Walks the shadow across every heap's extent, cross-checks each block's
//! in-memory metadata against its shadow encoding, verifies checksums, and
//! coalesces neighbouring corrupt blocks into ranges. Runs under the
//! manager's best-effort lock-all, so it can never deadlock against a
//! lock user code holds; a heap whose lock could not be taken is still
//! scanned, accepting that a racing mutation may show up as a transient
//! inconsistency.

use crate::block::{self, BlockState, CompactBlockInfo};
use crate::error::CorruptRange;
use crate::heap_manager::BlockHeapManager;
use crate::report::log;
use crate::shadow::{marker, Shadow, ShadowWalker};

/// Sweep all heaps for corrupt blocks. Corrupt neighbours are coalesced
/// into `out` (most callers pass the error record's range array); the
/// return value is the number of ranges written. Page protections on
/// reported blocks are dropped so later inspection can read them.
pub fn is_heap_corrupt(manager: &BlockHeapManager, out: &mut [CorruptRange]) -> usize {
    let shadow = manager.shadow();
    let mut range_count = 0usize;
    let mut dropped = false;

    manager.best_effort_lock_all();
    manager.for_each_heap(|heap| {
        let Some((lo, hi)) = heap.extent() else {
            return;
        };
        let mut walker = ShadowWalker::new(shadow, false, lo, hi);
        let mut current: Option<CorruptRange> = None;

        while let Some(compact) = walker.next() {
            if block_is_corrupt(shadow, &compact) {
                current = Some(match current.take() {
                    Some(mut range) if range.address + range.length == compact.block => {
                        range.length += compact.block_size;
                        range.block_count += 1;
                        range
                    }
                    Some(range) => {
                        if !flush_range(range, out, &mut range_count) {
                            dropped = true;
                        }
                        new_range(&compact)
                    }
                    None => new_range(&compact),
                });
            } else if let Some(range) = current.take() {
                if !flush_range(range, out, &mut range_count) {
                    dropped = true;
                }
            }
        }
        if let Some(range) = current.take() {
            if !flush_range(range, out, &mut range_count) {
                dropped = true;
            }
        }
    });
    manager.unlock_all();

    if dropped {
        log!("corrupt range buffer full, some ranges not reported");
    }
    range_count
}

fn new_range(compact: &CompactBlockInfo) -> CorruptRange {
    CorruptRange {
        address: compact.block,
        length: compact.block_size,
        block_count: 1,
        representative: *compact,
    }
}

fn flush_range(range: CorruptRange, out: &mut [CorruptRange], count: &mut usize) -> bool {
    if *count < out.len() {
        out[*count] = range;
        *count += 1;
        true
    } else {
        false
    }
}

/// Validate one block against its shadow encoding.
fn block_is_corrupt(shadow: &Shadow, compact: &CompactBlockInfo) -> bool {
    let info = compact.expand();

    // Quarantined blocks may carry hardware protection; lift it so the
    // metadata is readable. Reported blocks are left readable on purpose.
    unsafe { block::block_protect_none(&info, shadow) };

    unsafe {
        let memory_consistent = block::block_info_from_memory(info.header())
            .map(|m| m.body == info.body && m.body_size == info.body_size)
            .unwrap_or(false);
        if !memory_consistent {
            return true;
        }

        let Some(state) = BlockState::from_u8((*info.header()).state) else {
            return true;
        };

        // The block state must agree with the shadow's marker class.
        if info.body_size > 0 {
            let body_marker = shadow.marker_at(info.body);
            let class_consistent = match state {
                BlockState::Allocated => !marker::is_redzone(body_marker),
                BlockState::Quarantined => body_marker == marker::FREED,
                // Released blocks have no business still being encoded in
                // the shadow.
                BlockState::Freed => false,
            };
            if !class_consistent {
                return true;
            }
        }

        !block::verify_checksum(&info)
    }
}

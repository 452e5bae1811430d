//! Internal heap: a bump allocator over mapped regions, used for the
//! runtime's own metadata (region tables, zebra slot stacks). Keeping
//! this separate from the managed heaps means iterating those heaps can
//! never deadlock against an allocation made on their behalf.

use crate::platform;
use crate::sync::RawMutex;
use crate::util::align_up;
use core::cell::UnsafeCell;
use core::ptr;

/// Granularity of the backing regions.
const REGION_SIZE: usize = 256 * 1024;

struct InternalInner {
    cursor: *mut u8,
    remaining: usize,
}

pub struct InternalHeap {
    lock: RawMutex,
    inner: UnsafeCell<InternalInner>,
}

unsafe impl Send for InternalHeap {}
unsafe impl Sync for InternalHeap {}

impl InternalHeap {
    pub const fn new() -> Self {
        InternalHeap {
            lock: RawMutex::new(),
            inner: UnsafeCell::new(InternalInner {
                cursor: ptr::null_mut(),
                remaining: 0,
            }),
        }
    }

    /// Allocate zeroed, 16-byte aligned metadata memory. Never freed.
    /// Returns null on mapping failure.
    pub fn alloc(&self, bytes: usize) -> *mut u8 {
        let bytes = align_up(bytes.max(1), 16);

        // Oversized requests get their own mapping.
        if bytes > REGION_SIZE {
            return platform::map_runtime_pages(bytes).unwrap_or(ptr::null_mut());
        }

        self.lock.lock();
        let result = unsafe {
            let inner = &mut *self.inner.get();
            if inner.remaining < bytes {
                let Some(region) = platform::map_runtime_pages(REGION_SIZE) else {
                    self.lock.unlock();
                    return ptr::null_mut();
                };
                inner.cursor = region;
                inner.remaining = REGION_SIZE;
            }
            let out = inner.cursor;
            inner.cursor = inner.cursor.add(bytes);
            inner.remaining -= bytes;
            out
        };
        self.lock.unlock();
        result
    }
}

struct InternalHeapHolder(InternalHeap);
unsafe impl Sync for InternalHeapHolder {}

static INTERNAL_HEAP: InternalHeapHolder = InternalHeapHolder(InternalHeap::new());

/// Allocate runtime-internal metadata memory from the global internal heap.
pub fn alloc(bytes: usize) -> *mut u8 {
    INTERNAL_HEAP.0.alloc(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_distinct() {
        let heap = InternalHeap::new();
        let a = heap.alloc(24) as usize;
        let b = heap.alloc(100) as usize;
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_eq!(a % 16, 0);
        assert_eq!(b % 16, 0);
        assert!(b >= a + 32 || b < a, "allocations must not overlap");
    }

    #[test]
    fn oversized_allocation_succeeds() {
        let heap = InternalHeap::new();
        let p = heap.alloc(REGION_SIZE + 1);
        assert!(!p.is_null());
        unsafe { *p = 0xFF };
    }
}

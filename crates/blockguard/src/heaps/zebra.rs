//! The zebra block heap: a pre-reserved region striped as
//! `[data page | guard page]` repeating. Blocks are right-aligned in the
//! data page so the block end abuts the guard page, turning linear
//! overflow into a hardware fault; while a freed slot sits in quarantine
//! its data page is protected too, so use-after-free faults as well.
//!
//! Capacity is fixed at construction. Exhaustion simply fails the
//! allocation; the manager falls through to the other heaps.

use crate::heaps::{internal, HeapExtent};
use crate::platform::{self, PageAccess};
use crate::shadow::Shadow;
use crate::sync::RawMutex;
use crate::util::{is_aligned, PAGE_SIZE, SHADOW_RATIO};
use core::cell::UnsafeCell;

/// Bytes per slot: one data page plus one guard page.
const SLOT_SPAN: usize = 2 * PAGE_SIZE;

struct ZebraInner {
    /// LIFO stack of free slot indices.
    free_slots: *mut u32,
    free_count: usize,
}

pub struct ZebraBlockHeap {
    region: usize,
    region_size: usize,
    slot_count: usize,
    lock: RawMutex,
    inner: UnsafeCell<ZebraInner>,
    extent: HeapExtent,
}

unsafe impl Send for ZebraBlockHeap {}
unsafe impl Sync for ZebraBlockHeap {}

impl ZebraBlockHeap {
    /// Reserve the striped region and protect every guard page. Returns
    /// `None` if the reservation cannot be satisfied.
    pub fn new(heap_size: usize) -> Option<ZebraBlockHeap> {
        let slot_count = heap_size / SLOT_SPAN;
        if slot_count == 0 {
            return None;
        }
        let region_size = slot_count * SLOT_SPAN;

        let Some(region) = platform::map_heap_pages(region_size) else {
            return None;
        };

        let free_slots = internal::alloc(slot_count * core::mem::size_of::<u32>()) as *mut u32;
        if free_slots.is_null() {
            unsafe { platform::unmap_pages(region, region_size) };
            return None;
        }

        unsafe {
            for slot in 0..slot_count {
                // Stack is popped from the top; store in reverse so low
                // addresses go out first.
                *free_slots.add(slot) = (slot_count - 1 - slot) as u32;
                let guard = region + slot * SLOT_SPAN + PAGE_SIZE;
                platform::protect_pages(guard, PAGE_SIZE, PageAccess::Inaccessible);
            }
        }

        let heap = ZebraBlockHeap {
            region,
            region_size,
            slot_count,
            lock: RawMutex::new(),
            inner: UnsafeCell::new(ZebraInner {
                free_slots,
                free_count: slot_count,
            }),
            extent: HeapExtent::new(),
        };
        heap.extent.note(heap.region, heap.region_size);
        Some(heap)
    }

    /// True if an allocation of `size` bytes can be placed in a slot.
    pub fn fits(size: usize) -> bool {
        size > 0 && size <= PAGE_SIZE
    }

    /// Allocate `size` bytes right-aligned against the slot's guard page.
    /// `size` must be granule-aligned (block sizes always are). Returns 0
    /// on exhaustion or unsupported size.
    pub fn allocate(&self, size: usize) -> usize {
        if !Self::fits(size) || !is_aligned(size, SHADOW_RATIO) {
            return 0;
        }

        self.lock.lock();
        let slot = unsafe {
            let inner = &mut *self.inner.get();
            if inner.free_count == 0 {
                self.lock.unlock();
                return 0;
            }
            inner.free_count -= 1;
            *inner.free_slots.add(inner.free_count) as usize
        };
        self.lock.unlock();

        self.region + slot * SLOT_SPAN + PAGE_SIZE - size
    }

    /// Return a slot to the free stack. The data page is made accessible
    /// again for the next occupant.
    pub fn free(&self, base: usize) -> bool {
        let Some(slot) = self.slot_of(base) else {
            return false;
        };
        unsafe {
            platform::protect_pages(self.data_page(slot), PAGE_SIZE, PageAccess::ReadWrite);
        }

        self.lock.lock();
        unsafe {
            let inner = &mut *self.inner.get();
            debug_assert!(inner.free_count < self.slot_count);
            *inner.free_slots.add(inner.free_count) = slot as u32;
            inner.free_count += 1;
        }
        self.lock.unlock();
        true
    }

    /// Size from `base` to the guard page: the span allocate() granted.
    pub fn allocation_size(&self, base: usize) -> Option<usize> {
        let slot = self.slot_of(base)?;
        Some(self.data_page(slot) + PAGE_SIZE - base)
    }

    pub fn owns(&self, base: usize) -> bool {
        self.slot_of(base).is_some()
    }

    /// Protect the data page of the slot owning `base`. Called when the
    /// block enters quarantine so stale reads fault in hardware.
    pub fn protect_slot(&self, base: usize, shadow: &Shadow) {
        if let Some(slot) = self.slot_of(base) {
            let page = self.data_page(slot);
            unsafe { platform::protect_pages(page, PAGE_SIZE, PageAccess::Inaccessible) };
            shadow.mark_pages_protected(page, PAGE_SIZE);
        }
    }

    pub fn free_slot_count(&self) -> usize {
        self.lock.lock();
        let count = unsafe { &*self.inner.get() }.free_count;
        self.lock.unlock();
        count
    }

    pub fn try_lock(&self) -> bool {
        self.lock.try_lock()
    }

    pub fn lock(&self) {
        self.lock.lock();
    }

    pub fn unlock(&self) {
        self.lock.unlock();
    }

    pub fn extent(&self) -> Option<(usize, usize)> {
        self.extent.range()
    }

    #[inline]
    fn data_page(&self, slot: usize) -> usize {
        self.region + slot * SLOT_SPAN
    }

    /// The slot owning `base`, provided `base` lies in a data page.
    fn slot_of(&self, base: usize) -> Option<usize> {
        if base < self.region || base >= self.region + self.region_size {
            return None;
        }
        let offset = base - self.region;
        if offset % SLOT_SPAN >= PAGE_SIZE {
            return None; // Guard page.
        }
        Some(offset / SLOT_SPAN)
    }
}

impl Drop for ZebraBlockHeap {
    fn drop(&mut self) {
        unsafe {
            platform::unmap_pages(self.region, self.region_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_abut_guard_pages() {
        let heap = ZebraBlockHeap::new(16 * SLOT_SPAN).unwrap();
        let base = heap.allocate(128);
        assert_ne!(base, 0);
        // The allocation ends exactly at a guard-page boundary.
        assert_eq!((base + 128) % SLOT_SPAN, PAGE_SIZE);
        assert_eq!(heap.allocation_size(base), Some(128));

        unsafe { core::ptr::write_bytes(base as *mut u8, 0x77, 128) };
        assert!(heap.free(base));
    }

    #[test]
    fn capacity_is_fixed() {
        let heap = ZebraBlockHeap::new(4 * SLOT_SPAN).unwrap();
        assert_eq!(heap.free_slot_count(), 4);

        let mut slots = [0usize; 4];
        for slot in slots.iter_mut() {
            *slot = heap.allocate(64);
            assert_ne!(*slot, 0);
        }
        assert_eq!(heap.allocate(64), 0, "exhausted heap must fail");

        for &slot in &slots {
            assert!(heap.free(slot));
        }
        assert_eq!(heap.free_slot_count(), 4);
    }

    #[test]
    fn oversized_and_unaligned_requests_fail() {
        let heap = ZebraBlockHeap::new(4 * SLOT_SPAN).unwrap();
        assert_eq!(heap.allocate(PAGE_SIZE + 8), 0);
        assert_eq!(heap.allocate(0), 0);
        assert_eq!(heap.allocate(60), 0);
    }

    #[test]
    fn guard_page_addresses_are_not_owned() {
        let heap = ZebraBlockHeap::new(4 * SLOT_SPAN).unwrap();
        let base = heap.allocate(256);
        // The block is right-aligned, so the guard page starts at its end.
        let guard = base + 256;
        assert!(heap.owns(base));
        assert!(!heap.owns(guard));
        assert!(!heap.owns(heap.region + heap.region_size));
        heap.free(base);
    }
}

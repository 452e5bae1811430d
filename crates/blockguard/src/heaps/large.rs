//! The large-block heap: every allocation is its own virtual-memory
//! mapping, a whole number of pages. The manager lays blocks out here so
//! their redzones cover whole pages and can carry hardware protection.

use crate::heaps::region_map::RegionMap;
use crate::heaps::HeapExtent;
use crate::platform;
use crate::sync::RawMutex;
use crate::util::{align_up, PAGE_SIZE};
use core::cell::UnsafeCell;

/// Capacity of the live-mapping table (power of two).
const MAPPING_TABLE_CAPACITY: usize = 2048;

pub struct LargeBlockHeap {
    lock: RawMutex,
    inner: UnsafeCell<RegionMap>,
    extent: HeapExtent,
}

unsafe impl Send for LargeBlockHeap {}
unsafe impl Sync for LargeBlockHeap {}

impl LargeBlockHeap {
    pub const fn new() -> Self {
        LargeBlockHeap {
            lock: RawMutex::new(),
            inner: UnsafeCell::new(RegionMap::new()),
            extent: HeapExtent::new(),
        }
    }

    /// Map a fresh region of whole pages. Returns the base address or 0.
    pub fn allocate(&self, size: usize) -> usize {
        let total = align_up(size.max(1), PAGE_SIZE);
        let Some(base) = platform::map_heap_pages(total) else {
            return 0;
        };

        self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        let stored = inner.ensure_init(MAPPING_TABLE_CAPACITY) && inner.insert(base, total);
        self.lock.unlock();

        if !stored {
            unsafe { platform::unmap_pages(base, total) };
            return 0;
        }
        self.extent.note(base, total);
        base
    }

    /// Unmap an allocation. Any page protections die with the mapping.
    pub fn free(&self, base: usize) -> bool {
        self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        let size = inner.remove(base);
        self.lock.unlock();

        match size {
            Some(size) => {
                unsafe { platform::unmap_pages(base, size) };
                true
            }
            None => false,
        }
    }

    pub fn allocation_size(&self, base: usize) -> Option<usize> {
        self.lock.lock();
        let result = unsafe { &*self.inner.get() }.lookup(base);
        self.lock.unlock();
        result
    }

    pub fn owns(&self, base: usize) -> bool {
        self.allocation_size(base).is_some()
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
}

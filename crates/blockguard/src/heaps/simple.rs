//! The default block heap: a thin wrapper over the platform's
//! page-granularity allocator with a small best-fit cache of released
//! regions, so steady-state allocate/free cycles avoid mmap churn.

use crate::heaps::region_map::RegionMap;
use crate::heaps::HeapExtent;
use crate::platform;
use crate::sync::RawMutex;
use crate::util::{align_up, PAGE_SIZE};
use core::cell::UnsafeCell;

/// Maximum cached regions awaiting reuse.
const REGION_CACHE_SIZE: usize = 16;

/// Capacity of the live-region table (power of two). Quarantined blocks
/// keep their region alive until eviction, so this bounds live + parked
/// allocations together.
const REGION_TABLE_CAPACITY: usize = 1 << 16;

#[derive(Clone, Copy)]
struct CachedRegion {
    base: usize,
    size: usize,
}

struct SimpleInner {
    regions: RegionMap,
    cache: [CachedRegion; REGION_CACHE_SIZE],
    cache_count: usize,
}

pub struct SimpleBlockHeap {
    lock: RawMutex,
    inner: UnsafeCell<SimpleInner>,
    extent: HeapExtent,
}

unsafe impl Send for SimpleBlockHeap {}
unsafe impl Sync for SimpleBlockHeap {}

impl SimpleBlockHeap {
    pub const fn new() -> Self {
        SimpleBlockHeap {
            lock: RawMutex::new(),
            inner: UnsafeCell::new(SimpleInner {
                regions: RegionMap::new(),
                cache: [CachedRegion { base: 0, size: 0 }; REGION_CACHE_SIZE],
                cache_count: 0,
            }),
            extent: HeapExtent::new(),
        }
    }

    /// Allocate at least `size` bytes (rounded up to whole pages).
    /// Returns the base address, or 0 on failure.
    pub fn allocate(&self, size: usize) -> usize {
        let total = align_up(size.max(1), PAGE_SIZE);

        self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        if !inner.regions.ensure_init(REGION_TABLE_CAPACITY) {
            self.lock.unlock();
            return 0;
        }

        if let Some(cached) = Self::pop_cached(inner, total) {
            if inner.regions.insert(cached.base, cached.size) {
                self.lock.unlock();
                self.extent.note(cached.base, cached.size);
                return cached.base;
            }
            self.lock.unlock();
            unsafe { platform::unmap_pages(cached.base, cached.size) };
            return 0;
        }
        self.lock.unlock();

        let Some(base) = platform::map_heap_pages(total) else {
            return 0;
        };

        self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        let stored = inner.regions.insert(base, total);
        self.lock.unlock();

        if !stored {
            unsafe { platform::unmap_pages(base, total) };
            return 0;
        }
        self.extent.note(base, total);
        base
    }

    /// Release a region back to the cache (or the kernel if the cache is
    /// full). Returns false if this heap does not own `base`.
    pub fn free(&self, base: usize) -> bool {
        self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        let Some(size) = inner.regions.remove(base) else {
            self.lock.unlock();
            return false;
        };
        unsafe { Self::push_cached(inner, CachedRegion { base, size }) };
        self.lock.unlock();
        true
    }

    pub fn allocation_size(&self, base: usize) -> Option<usize> {
        self.lock.lock();
        let inner = unsafe { &*self.inner.get() };
        let result = inner.regions.lookup(base);
        self.lock.unlock();
        result
    }

    /// True if this heap currently owns an allocation starting at `base`.
    pub fn owns(&self, base: usize) -> bool {
        self.allocation_size(base).is_some()
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.lock.lock();
        let count = unsafe { &*self.inner.get() }.regions.len();
        self.lock.unlock();
        count
    }

    /// Visit live allocations as `(base, size)`, under the heap lock.
    pub fn for_each_allocation<F: FnMut(usize, usize)>(&self, f: F) {
        self.lock.lock();
        unsafe { &*self.inner.get() }.regions.for_each(f);
        self.lock.unlock();
    }

    /// Unmap everything this heap still holds. Called on heap destruction
    /// after live blocks have been drained.
    pub fn release_all(&self) {
        loop {
            self.lock.lock();
            let inner = unsafe { &mut *self.inner.get() };
            let mut batch = [CachedRegion { base: 0, size: 0 }; REGION_CACHE_SIZE];
            let mut batch_count = 0;
            inner.regions.for_each(|base, size| {
                if batch_count < batch.len() {
                    batch[batch_count] = CachedRegion { base, size };
                    batch_count += 1;
                }
            });
            for region in &batch[..batch_count] {
                inner.regions.remove(region.base);
            }
            let cache_count = inner.cache_count;
            let cache = inner.cache;
            inner.cache_count = 0;
            self.lock.unlock();

            unsafe {
                for region in &batch[..batch_count] {
                    platform::unmap_pages(region.base, region.size);
                }
                for region in &cache[..cache_count] {
                    platform::unmap_pages(region.base, region.size);
                }
            }
            if batch_count < REGION_CACHE_SIZE {
                return;
            }
        }
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

    /// Pop the best-fitting cached region of at least `needed` bytes.
    fn pop_cached(inner: &mut SimpleInner, needed: usize) -> Option<CachedRegion> {
        let mut best: Option<usize> = None;
        let mut best_size = usize::MAX;
        for i in 0..inner.cache_count {
            let size = inner.cache[i].size;
            if size >= needed && size < best_size {
                best = Some(i);
                best_size = size;
                if size == needed {
                    break;
                }
            }
        }
        let idx = best?;
        let region = inner.cache[idx];
        inner.cache_count -= 1;
        if idx < inner.cache_count {
            inner.cache[idx] = inner.cache[inner.cache_count];
        }
        Some(region)
    }

    /// Cache a released region, evicting the smallest when full. The data
    /// pages are returned to the kernel so reuse never leaks stale bytes.
    unsafe fn push_cached(inner: &mut SimpleInner, region: CachedRegion) {
        platform::release_pages(region.base, region.size);

        if inner.cache_count < REGION_CACHE_SIZE {
            inner.cache[inner.cache_count] = region;
            inner.cache_count += 1;
            return;
        }
        let mut smallest = 0;
        for i in 1..REGION_CACHE_SIZE {
            if inner.cache[i].size < inner.cache[smallest].size {
                smallest = i;
            }
        }
        if region.size >= inner.cache[smallest].size {
            let evicted = inner.cache[smallest];
            inner.cache[smallest] = region;
            platform::unmap_pages(evicted.base, evicted.size);
        } else {
            platform::unmap_pages(region.base, region.size);
        }
    }
}

//! The specialized heaps multiplexed by the heap manager.
//!
//! Every heap hands out raw page-backed memory below the shadow's address
//! bound; the manager wraps that memory in guarded blocks. The heaps vary
//! in placement policy, but share a narrow capability set, modeled as a
//! sum type resolved when the manager routes an allocation.

pub mod internal;
pub mod large;
pub mod region_map;
pub mod simple;
pub mod zebra;

pub use large::LargeBlockHeap;
pub use simple::SimpleBlockHeap;
pub use zebra::ZebraBlockHeap;

/// A resolved reference to one of the manager's heaps.
#[derive(Clone, Copy)]
pub enum BlockHeapRef<'a> {
    Simple(&'a SimpleBlockHeap),
    Large(&'a LargeBlockHeap),
    Zebra(&'a ZebraBlockHeap),
}

impl<'a> BlockHeapRef<'a> {
    /// Allocate `size` bytes. Returns the base address or 0 on failure.
    pub fn allocate(self, size: usize) -> usize {
        match self {
            BlockHeapRef::Simple(h) => h.allocate(size),
            BlockHeapRef::Large(h) => h.allocate(size),
            BlockHeapRef::Zebra(h) => h.allocate(size),
        }
    }

    /// Release an allocation previously returned by `allocate`.
    pub fn free(self, base: usize) -> bool {
        match self {
            BlockHeapRef::Simple(h) => h.free(base),
            BlockHeapRef::Large(h) => h.free(base),
            BlockHeapRef::Zebra(h) => h.free(base),
        }
    }

    /// Size of the allocation starting at `base`, if this heap owns it.
    pub fn allocation_size(self, base: usize) -> Option<usize> {
        match self {
            BlockHeapRef::Simple(h) => h.allocation_size(base),
            BlockHeapRef::Large(h) => h.allocation_size(base),
            BlockHeapRef::Zebra(h) => h.allocation_size(base),
        }
    }

    pub fn try_lock(self) -> bool {
        match self {
            BlockHeapRef::Simple(h) => h.try_lock(),
            BlockHeapRef::Large(h) => h.try_lock(),
            BlockHeapRef::Zebra(h) => h.try_lock(),
        }
    }

    pub fn unlock(self) {
        match self {
            BlockHeapRef::Simple(h) => h.unlock(),
            BlockHeapRef::Large(h) => h.unlock(),
            BlockHeapRef::Zebra(h) => h.unlock(),
        }
    }

    /// The address range this heap has ever handed out, for shadow walks.
    pub fn extent(self) -> Option<(usize, usize)> {
        match self {
            BlockHeapRef::Simple(h) => h.extent(),
            BlockHeapRef::Large(h) => h.extent(),
            BlockHeapRef::Zebra(h) => h.extent(),
        }
    }
}

use core::sync::atomic::{AtomicUsize, Ordering};

/// Lock-free lo/hi watermarks of the memory a heap has handed out. The
/// heap checker walks the shadow across this range; gaps inside it are
/// simply skipped by the walker.
pub struct HeapExtent {
    lo: AtomicUsize,
    hi: AtomicUsize,
}

impl HeapExtent {
    pub const fn new() -> Self {
        HeapExtent {
            lo: AtomicUsize::new(usize::MAX),
            hi: AtomicUsize::new(0),
        }
    }

    pub fn note(&self, base: usize, size: usize) {
        self.lo.fetch_min(base, Ordering::Relaxed);
        self.hi.fetch_max(base + size, Ordering::Relaxed);
    }

    pub fn range(&self) -> Option<(usize, usize)> {
        let lo = self.lo.load(Ordering::Relaxed);
        let hi = self.hi.load(Ordering::Relaxed);
        if lo < hi {
            Some((lo, hi))
        } else {
            None
        }
    }
}

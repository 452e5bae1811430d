//! The block heap manager.
//!
//! Owns the specialized heaps, routes allocations between them, maintains
//! the shared quarantine of freed blocks, keeps the shadow in sync with
//! every block state change, and reports corruption through the error
//! callback.
//!
//! Lock order: the manager mutex (heap-table mutations) is always taken
//! before any sub-heap lock, never after. Quarantine shard locks nest
//! freely below either. `best_effort_lock_all` only ever try-acquires
//! sub-heap locks so the heap checker cannot deadlock against user code.

use crate::block::{
    self, block_header_from_body, block_info_from_memory, initialize_block, plan_layout,
    BlockInfo, BlockState, CompactBlockInfo,
};
use crate::config::RuntimeParams;
use crate::error::{self, BadAccessKind, ErrorCallback, ErrorInfo};
use crate::heaps::{BlockHeapRef, LargeBlockHeap, SimpleBlockHeap, ZebraBlockHeap};
use crate::quarantine::ShardedQuarantine;
use crate::report::log;
use crate::shadow::Shadow;
use crate::stack_cache::StackCaptureCache;
use crate::sync::RawMutex;
use crate::util::{LARGE_BLOCK_THRESHOLD, PAGE_SIZE, SHADOW_RATIO, ZEBRA_HEAP_SIZE};
use crate::platform;
use core::cell::{Cell, UnsafeCell};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Opaque heap identifier: index + 1 into the manager's heap table.
/// Zero is never a valid heap.
pub type HeapId = u32;

pub const MAX_HEAPS: usize = 64;

/// Trailer tags for the singleton heaps.
const LARGE_HEAP_TAG: u32 = u32::MAX - 1;
const ZEBRA_HEAP_TAG: u32 = u32::MAX - 2;

struct HeapEntry {
    heap: SimpleBlockHeap,
    in_use: AtomicBool,
}

thread_local! {
    /// Per-thread allocation-filter flag gating the zebra heap.
    static ALLOCATION_FILTER_FLAG: Cell<bool> = const { Cell::new(false) };
}

pub struct BlockHeapManager {
    shadow: &'static Shadow,
    stack_cache: &'static StackCaptureCache,

    /// Protects heap-table mutations (create/destroy).
    lock: RawMutex,
    heaps: [HeapEntry; MAX_HEAPS],

    large_heap: LargeBlockHeap,
    zebra_heap: UnsafeCell<Option<ZebraBlockHeap>>,

    quarantine: ShardedQuarantine,

    params: UnsafeCell<RuntimeParams>,
    /// Precomputed Bernoulli threshold for the guard-rate sampling.
    guard_threshold: AtomicU64,

    error_callback: UnsafeCell<Option<ErrorCallback>>,

    /// Serializes lock-all sections and guards the locked-heap set.
    lock_all_mutex: RawMutex,
    locked_heaps: UnsafeCell<[i32; MAX_HEAPS + 2]>,
    locked_heap_count: UnsafeCell<usize>,

    process_heap_id: HeapId,
}

unsafe impl Send for BlockHeapManager {}
unsafe impl Sync for BlockHeapManager {}

impl BlockHeapManager {
    pub fn new(shadow: &'static Shadow, stack_cache: &'static StackCaptureCache) -> Self {
        const ENTRY: HeapEntry = HeapEntry {
            heap: SimpleBlockHeap::new(),
            in_use: AtomicBool::new(false),
        };
        BlockHeapManager {
            shadow,
            stack_cache,
            lock: RawMutex::new(),
            heaps: [ENTRY; MAX_HEAPS],
            large_heap: LargeBlockHeap::new(),
            zebra_heap: UnsafeCell::new(None),
            quarantine: ShardedQuarantine::new(),
            params: UnsafeCell::new(RuntimeParams::default_params()),
            guard_threshold: AtomicU64::new(u64::MAX),
            error_callback: UnsafeCell::new(None),
            lock_all_mutex: RawMutex::new(),
            locked_heaps: UnsafeCell::new([0; MAX_HEAPS + 2]),
            locked_heap_count: UnsafeCell::new(0),
            process_heap_id: 1,
        }
    }

    /// Finish construction: claim the process heap and build the zebra
    /// heap if the parameters ask for it. Parameters may be set before
    /// this runs.
    ///
    /// # Safety
    /// Single-threaded init context.
    pub unsafe fn init(&self) {
        // Slot 0 is the process heap.
        self.heaps[0].in_use.store(true, Ordering::Release);
        self.propagate_parameters();
    }

    /// The heap used by the redirected standard allocator entry points.
    pub fn process_heap(&self) -> HeapId {
        self.process_heap_id
    }

    pub fn set_error_callback(&self, callback: ErrorCallback) {
        unsafe { *self.error_callback.get() = Some(callback) };
    }

    /// Install a new parameter set and push it to the modules it affects.
    pub fn set_parameters(&self, params: &RuntimeParams) {
        unsafe { *self.params.get() = *params };
        self.propagate_parameters();
    }

    pub fn parameters(&self) -> RuntimeParams {
        unsafe { *self.params.get() }
    }

    fn propagate_parameters(&self) {
        let params = self.parameters();
        self.quarantine.set_max_block_size(params.quarantine_block_size);
        self.stack_cache.set_max_frames(params.max_num_frames);
        self.stack_cache
            .set_bottom_frames_to_skip(params.bottom_frames_to_skip);

        let threshold = if params.allocation_guard_rate >= 1.0 {
            u64::MAX
        } else if params.allocation_guard_rate <= 0.0 {
            0
        } else {
            (params.allocation_guard_rate * u64::MAX as f64) as u64
        };
        self.guard_threshold.store(threshold, Ordering::Relaxed);

        if params.enable_zebra_block_heap {
            unsafe {
                let zebra = &mut *self.zebra_heap.get();
                if zebra.is_none() {
                    *zebra = ZebraBlockHeap::new(ZEBRA_HEAP_SIZE);
                    if zebra.is_none() {
                        log!("zebra heap reservation failed, feature disabled");
                    }
                }
            }
        }
    }

    pub fn allocation_filter_flag(&self) -> bool {
        ALLOCATION_FILTER_FLAG.with(|flag| flag.get())
    }

    pub fn set_allocation_filter_flag(&self, value: bool) {
        ALLOCATION_FILTER_FLAG.with(|flag| flag.set(value));
    }

    // -----------------------------------------------------------------------
    // Heap lifecycle.
    // -----------------------------------------------------------------------

    pub fn create_heap(&self) -> HeapId {
        self.lock.lock();
        for (index, entry) in self.heaps.iter().enumerate() {
            if !entry.in_use.load(Ordering::Relaxed) {
                entry.in_use.store(true, Ordering::Release);
                self.lock.unlock();
                return (index + 1) as HeapId;
            }
        }
        self.lock.unlock();
        log!("heap table exhausted");
        0
    }

    /// Destroy a heap: drain its quarantined blocks, release its live
    /// allocations (clearing their shadow), then retire the slot.
    pub fn destroy_heap(&self, heap_id: HeapId) -> bool {
        if heap_id == self.process_heap_id || !self.is_valid_heap(heap_id) {
            return false;
        }
        let entry = &self.heaps[(heap_id - 1) as usize];

        // Drain quarantine entries owned by this heap.
        self.quarantine.remove_matching(
            |compact| {
                let info = compact.expand();
                unsafe {
                    block::block_protect_none(&info, self.shadow);
                    (*info.trailer()).heap_id == heap_id
                }
            },
            |compact| {
                self.free_evicted_block(compact);
            },
        );

        // Anything still live is released wholesale; the shadow forgets it.
        entry.heap.for_each_allocation(|base, size| {
            self.shadow.unpoison(base, size);
        });
        entry.heap.release_all();

        self.lock.lock();
        entry.in_use.store(false, Ordering::Release);
        self.lock.unlock();
        true
    }

    pub fn is_valid_heap(&self, heap_id: HeapId) -> bool {
        let index = heap_id.wrapping_sub(1) as usize;
        index < MAX_HEAPS && self.heaps[index].in_use.load(Ordering::Acquire)
    }

    fn heap_by_id(&self, heap_id: HeapId) -> Option<&SimpleBlockHeap> {
        if self.is_valid_heap(heap_id) {
            Some(&self.heaps[(heap_id - 1) as usize].heap)
        } else {
            None
        }
    }

    fn zebra(&self) -> Option<&ZebraBlockHeap> {
        unsafe { (*self.zebra_heap.get()).as_ref() }
    }

    /// Resolve a trailer tag to the owning heap.
    fn heap_by_tag(&self, tag: u32) -> Option<BlockHeapRef<'_>> {
        match tag {
            LARGE_HEAP_TAG => Some(BlockHeapRef::Large(&self.large_heap)),
            ZEBRA_HEAP_TAG => self.zebra().map(BlockHeapRef::Zebra),
            id => self.heap_by_id(id).map(BlockHeapRef::Simple),
        }
    }

    /// Ownership query across every heap, for blocks whose trailer can no
    /// longer be trusted.
    fn resolve_owner(&self, base: usize) -> Option<BlockHeapRef<'_>> {
        if let Some(zebra) = self.zebra() {
            if zebra.owns(base) {
                return Some(BlockHeapRef::Zebra(zebra));
            }
        }
        if self.large_heap.owns(base) {
            return Some(BlockHeapRef::Large(&self.large_heap));
        }
        for entry in &self.heaps {
            if entry.in_use.load(Ordering::Acquire) && entry.heap.owns(base) {
                return Some(BlockHeapRef::Simple(&entry.heap));
            }
        }
        None
    }

    /// Visit every live heap (user heaps plus the singletons).
    pub fn for_each_heap<F: FnMut(BlockHeapRef<'_>)>(&self, mut f: F) {
        for entry in &self.heaps {
            if entry.in_use.load(Ordering::Acquire) {
                f(BlockHeapRef::Simple(&entry.heap));
            }
        }
        f(BlockHeapRef::Large(&self.large_heap));
        if let Some(zebra) = self.zebra() {
            f(BlockHeapRef::Zebra(zebra));
        }
    }

    // -----------------------------------------------------------------------
    // Allocation.
    // -----------------------------------------------------------------------

    /// Allocate `bytes` for the user of `heap_id`, returning the body
    /// address (0 on failure). Routing: zebra when enabled, eligible and
    /// the thread passes the allocation filter; the large-block heap above
    /// the size threshold; otherwise the heap named by `heap_id`.
    pub fn allocate(&self, heap_id: HeapId, bytes: usize) -> usize {
        if !self.sample_guarded() {
            return self.allocate_unguarded(heap_id, bytes);
        }

        let params = self.parameters();
        let Some(layout) = plan_layout(SHADOW_RATIO, SHADOW_RATIO, bytes, 0, 0) else {
            return 0;
        };

        if params.enable_zebra_block_heap
            && (!params.enable_allocation_filter || self.allocation_filter_flag())
        {
            if let Some(zebra) = self.zebra() {
                if ZebraBlockHeap::fits(layout.block_size) {
                    let base = zebra.allocate(layout.block_size);
                    if base != 0 {
                        return self.commit_block(&layout, base, ZEBRA_HEAP_TAG).body;
                    }
                    // Slot exhaustion falls through to the other heaps.
                }
            }
        }

        if !params.disable_large_block_heap && bytes >= LARGE_BLOCK_THRESHOLD {
            if let Some(layout) = large_block_layout(bytes) {
                let base = self.large_heap.allocate(layout.block_size);
                if base != 0 {
                    let info = self.commit_block(&layout, base, LARGE_HEAP_TAG);
                    unsafe { block::block_protect_redzones(&info, self.shadow) };
                    return info.body;
                }
            }
            return 0;
        }

        let Some(heap) = self.heap_by_id(heap_id) else {
            return 0;
        };
        let base = heap.allocate(layout.block_size);
        if base == 0 {
            return 0;
        }
        self.commit_block(&layout, base, heap_id).body
    }

    /// Stamp a block into freshly allocated heap memory and poison its
    /// shadow.
    fn commit_block(&self, layout: &block::BlockLayout, base: usize, owner_tag: u32) -> BlockInfo {
        unsafe {
            let info = initialize_block(layout, base as *mut u8, false);
            (*info.header()).alloc_stack_id = self.stack_cache.capture();
            (*info.trailer()).alloc_tid = platform::thread_id();
            (*info.trailer()).heap_id = owner_tag;
            self.shadow.poison_allocated_block(&info);
            block::set_checksum(&info);
            info
        }
    }

    /// Bernoulli draw against the configured guard rate.
    fn sample_guarded(&self) -> bool {
        let threshold = self.guard_threshold.load(Ordering::Relaxed);
        if threshold == u64::MAX {
            return true;
        }
        platform::random_u64() < threshold
    }

    /// Sampled-out allocations bypass block wrapping entirely.
    fn allocate_unguarded(&self, heap_id: HeapId, bytes: usize) -> usize {
        let Some(heap) = self.heap_by_id(heap_id) else {
            return 0;
        };
        heap.allocate(bytes)
    }

    // -----------------------------------------------------------------------
    // Free.
    // -----------------------------------------------------------------------

    /// Free `ptr` for the user of `heap_id`. Guarded blocks are verified
    /// and quarantined; unguarded allocations go straight back to their
    /// heap; anything else is reported as a corrupt block.
    pub fn free(&self, heap_id: HeapId, ptr: usize) -> bool {
        if ptr == 0 {
            return false;
        }

        if self.shadow.is_beginning_of_block_body(ptr) {
            return self.free_guarded_block(ptr);
        }
        self.free_unguarded(heap_id, ptr)
    }

    fn free_guarded_block(&self, body: usize) -> bool {
        // Extent comes from the shadow alone; protections are lifted before
        // anything reads block memory.
        let Some(compact) = self.shadow.block_info_from_shadow(body) else {
            self.report_heap_error(body, BadAccessKind::CorruptBlock);
            return false;
        };
        let info = compact.expand();
        unsafe {
            block::block_protect_none(&info, self.shadow);

            let memory_consistent = block_header_from_body(body)
                .and_then(|header| block_info_from_memory(header))
                .map(|m| m.block == info.block && m.body_size == info.body_size)
                .unwrap_or(false);
            if !memory_consistent || !block::verify_checksum(&info) {
                return self.free_corrupt_block(&info);
            }

            match BlockState::from_u8((*info.header()).state) {
                Some(BlockState::Allocated) => {}
                Some(BlockState::Quarantined) | Some(BlockState::Freed) => {
                    self.report_block_error(&info, BadAccessKind::DoubleFree);
                    return false;
                }
                None => return self.free_corrupt_block(&info),
            }

            // ALLOCATED -> QUARANTINED.
            let trailer = info.trailer();
            (*trailer).free_tid = platform::thread_id();
            (*trailer).free_ticks = platform::tick_count();
            (*trailer).free_stack_id = self.stack_cache.capture();
            (*info.header()).state = BlockState::Quarantined as u8;
            self.shadow.mark_as_freed(info.block, info.block_size);
            block::set_checksum(&info);

            match (*trailer).heap_id {
                ZEBRA_HEAP_TAG => {
                    if let Some(zebra) = self.zebra() {
                        zebra.protect_slot(info.block, self.shadow);
                    }
                }
                LARGE_HEAP_TAG => block::block_protect_all(&info, self.shadow),
                _ => {}
            }
        }

        if !self
            .quarantine
            .push(compact, |evicted| self.free_evicted_block(evicted))
        {
            // Over the per-block cap: release immediately. The protections
            // applied above must come off before the trailer is read.
            return unsafe {
                block::block_protect_none(&info, self.shadow);
                self.free_pristine_block(&info)
            };
        }
        self.trim_quarantine();
        true
    }

    /// Trim the quarantine down to its byte budget. A zero budget flushes;
    /// an unlimited quarantine is never trimmed.
    fn trim_quarantine(&self) {
        let params = self.parameters();
        if params.unlimited_quarantine {
            return;
        }
        self.quarantine
            .trim(params.quarantine_size, |evicted| {
                self.free_evicted_block(evicted);
            });
    }

    /// Drain the quarantine completely, verifying and releasing every
    /// entry. Used at teardown.
    pub fn flush_quarantine(&self) {
        self.quarantine
            .trim(0, |evicted| self.free_evicted_block(evicted));
    }

    /// Verification performed on every block leaving the quarantine.
    fn free_evicted_block(&self, compact: CompactBlockInfo) {
        let info = compact.expand();
        unsafe {
            block::block_protect_none(&info, self.shadow);
            let state = BlockState::from_u8((*info.header()).state);
            if !block::verify_checksum(&info) || state != Some(BlockState::Quarantined) {
                self.free_corrupt_block(&info);
            } else {
                self.free_pristine_block(&info);
            }
        }
    }

    /// QUARANTINED -> FREED: wipe the block identity from memory and the
    /// shadow, then hand the memory back to the owning heap.
    unsafe fn free_pristine_block(&self, info: &BlockInfo) -> bool {
        let owner_tag = (*info.trailer()).heap_id;
        (*info.header()).state = BlockState::Freed as u8;
        (*info.header()).magic = 0;
        self.shadow.unpoison(info.block, info.block_size);

        let owner = self
            .heap_by_tag(owner_tag)
            .or_else(|| self.resolve_owner(info.block));
        match owner {
            Some(heap) => heap.free(info.block),
            None => {
                log!("orphaned block at 0x{:08x} dropped", info.block);
                false
            }
        }
    }

    /// A block that failed verification: report it, restore just enough
    /// metadata for the underlying heap to release the memory, and free
    /// it. The body is left as found for the reporter.
    unsafe fn free_corrupt_block(&self, info: &BlockInfo) -> bool {
        self.report_block_error(info, BadAccessKind::CorruptBlock);
        block::clear_corrupt_metadata(info);
        self.shadow.unpoison(info.block, info.block_size);

        let owner = self
            .resolve_owner(info.block)
            .or_else(|| self.heap_by_tag((*info.trailer()).heap_id));
        match owner {
            Some(heap) => heap.free(info.block),
            None => false,
        }
    }

    /// Free of a pointer with no block shadow: either a sampled-out
    /// (unguarded) allocation, or garbage.
    fn free_unguarded(&self, heap_id: HeapId, ptr: usize) -> bool {
        if let Some(heap) = self.heap_by_id(heap_id) {
            if heap.free(ptr) {
                return true;
            }
        }
        for entry in &self.heaps {
            if entry.in_use.load(Ordering::Acquire) && entry.heap.free(ptr) {
                return true;
            }
        }
        self.report_heap_error(ptr, BadAccessKind::CorruptBlock);
        false
    }

    // -----------------------------------------------------------------------
    // Queries.
    // -----------------------------------------------------------------------

    /// User-visible size of the allocation at `ptr` (its body size for
    /// guarded blocks).
    pub fn allocation_size(&self, heap_id: HeapId, ptr: usize) -> usize {
        if self.shadow.is_beginning_of_block_body(ptr) {
            if let Some(compact) = self.shadow.block_info_from_shadow(ptr) {
                return compact.expand().body_size;
            }
        }
        if let Some(heap) = self.heap_by_id(heap_id) {
            if let Some(size) = heap.allocation_size(ptr) {
                return size;
            }
        }
        for entry in &self.heaps {
            if entry.in_use.load(Ordering::Acquire) {
                if let Some(size) = entry.heap.allocation_size(ptr) {
                    return size;
                }
            }
        }
        0
    }

    pub fn quarantine(&self) -> &ShardedQuarantine {
        &self.quarantine
    }

    pub fn shadow(&self) -> &'static Shadow {
        self.shadow
    }

    // -----------------------------------------------------------------------
    // Locking.
    // -----------------------------------------------------------------------

    pub fn lock_heap(&self, heap_id: HeapId) {
        if let Some(heap) = self.heap_by_id(heap_id) {
            heap.lock();
        }
    }

    pub fn unlock_heap(&self, heap_id: HeapId) {
        if let Some(heap) = self.heap_by_id(heap_id) {
            heap.unlock();
        }
    }

    /// Try-acquire every heap lock, remembering exactly which were
    /// obtained. Never blocks on a lock user code might hold; heaps whose
    /// locks cannot be taken are simply skipped by the caller's scan.
    pub fn best_effort_lock_all(&self) {
        self.lock_all_mutex.lock();
        unsafe {
            let locked = &mut *self.locked_heaps.get();
            let count = &mut *self.locked_heap_count.get();
            *count = 0;

            for (index, entry) in self.heaps.iter().enumerate() {
                if entry.in_use.load(Ordering::Acquire) && entry.heap.try_lock() {
                    locked[*count] = index as i32;
                    *count += 1;
                }
            }
            if self.large_heap.try_lock() {
                locked[*count] = -1;
                *count += 1;
            }
            if let Some(zebra) = self.zebra() {
                if zebra.try_lock() {
                    locked[*count] = -2;
                    *count += 1;
                }
            }
        }
    }

    /// Release exactly the set acquired by `best_effort_lock_all`.
    pub fn unlock_all(&self) {
        unsafe {
            let locked = &*self.locked_heaps.get();
            let count = *self.locked_heap_count.get();
            for &slot in locked[..count].iter().rev() {
                match slot {
                    -1 => self.large_heap.unlock(),
                    -2 => {
                        if let Some(zebra) = self.zebra() {
                            zebra.unlock();
                        }
                    }
                    index => self.heaps[index as usize].heap.unlock(),
                }
            }
            *self.locked_heap_count.get() = 0;
        }
        self.lock_all_mutex.unlock();
    }

    // -----------------------------------------------------------------------
    // Error reporting.
    // -----------------------------------------------------------------------

    fn callback(&self) -> Option<ErrorCallback> {
        unsafe { *self.error_callback.get() }
    }

    /// Report an error originating from heap metadata itself (no faulting
    /// access to blame).
    fn report_heap_error(&self, address: usize, kind: BadAccessKind) {
        let mut error = ErrorInfo::new(kind, address);
        error::append_shadow_text(self.shadow, &mut error);
        if let Some(callback) = self.callback() {
            callback(&mut error);
        }
    }

    fn report_block_error(&self, info: &BlockInfo, kind: BadAccessKind) {
        let mut error = ErrorInfo::new(kind, info.body);
        error.block_is_corrupt = kind == BadAccessKind::CorruptBlock;
        error::populate_block_forensics(info, &mut error);
        error::append_shadow_text(self.shadow, &mut error);
        if let Some(callback) = self.callback() {
            callback(&mut error);
        }
    }
}

/// Layout for the large-block heap: page-aligned body, and enough trailer
/// padding that the right redzone always covers at least one whole page.
/// Both redzones can then carry hardware protection.
fn large_block_layout(body_size: usize) -> Option<block::BlockLayout> {
    if body_size > u32::MAX as usize {
        return None;
    }
    let header_size = PAGE_SIZE; // BLOCK_HEADER_SIZE rounded up to the body alignment.
    let body_end = header_size.checked_add(body_size)?;
    let mut block_size = crate::util::align_up(
        body_end.checked_add(block::BLOCK_TRAILER_SIZE)?,
        PAGE_SIZE,
    );
    if block_size < crate::util::align_up(body_end, PAGE_SIZE) + PAGE_SIZE {
        block_size += PAGE_SIZE;
    }
    let min_trailer_padding = block_size - body_end - block::BLOCK_TRAILER_SIZE;
    plan_layout(PAGE_SIZE, PAGE_SIZE, body_size, 0, min_trailer_padding)
}

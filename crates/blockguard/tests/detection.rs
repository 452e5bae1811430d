//! Detection tests for the runtime's boundary scenarios: overflow,
//! underflow, use-after-free, double-free, corrupt blocks, guarded
//! sampling, and the heap checker.
//!
//! Each test builds an isolated shadow + manager (+ façade) stack and
//! registers a recording error callback. The callback machinery is
//! process-global, so tests that read the record log serialize on a mutex.

use blockguard::block;
use blockguard::checker;
use blockguard::config::RuntimeParams;
use blockguard::error::{AccessMode, BadAccessKind, ErrorInfo, MAX_CORRUPT_RANGES};
use blockguard::heap_manager::BlockHeapManager;
use blockguard::runtime::Runtime;
use blockguard::shadow::Shadow;
use blockguard::stack_cache::StackCaptureCache;
use blockguard::util::PAGE_SIZE;

use std::sync::{Mutex, MutexGuard};

// ---------------------------------------------------------------------------
// Test fixture
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Recorded {
    kind: BadAccessKind,
    mode: AccessMode,
    size: usize,
    address: usize,
    alloc_stack: u32,
    free_stack: u32,
    free_tid: u32,
    shadow_text: String,
}

static RECORDS: Mutex<Vec<Recorded>> = Mutex::new(Vec::new());
static TEST_MUTEX: Mutex<()> = Mutex::new(());

fn recorder(error: &mut ErrorInfo) {
    RECORDS.lock().unwrap().push(Recorded {
        kind: error.kind,
        mode: error.access_mode,
        size: error.access_size,
        address: error.address,
        alloc_stack: error.alloc_stack_id,
        free_stack: error.free_stack_id,
        free_tid: error.free_tid,
        shadow_text: error.shadow_text().to_string(),
    });
}

struct Fixture {
    manager: &'static BlockHeapManager,
    runtime: &'static Runtime,
    _serial: MutexGuard<'static, ()>,
}

fn fixture() -> Fixture {
    fixture_with(RuntimeParams::default_params())
}

fn fixture_with(params: RuntimeParams) -> Fixture {
    let serial = TEST_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    RECORDS.lock().unwrap().clear();

    let mut shadow = Box::new(Shadow::new());
    assert!(unsafe { shadow.init() }, "shadow mapping failed");
    let shadow: &'static Shadow = Box::leak(shadow);

    let stack_cache: &'static StackCaptureCache = Box::leak(Box::new(StackCaptureCache::new()));
    assert!(unsafe { stack_cache.init() });

    let manager: &'static BlockHeapManager =
        Box::leak(Box::new(BlockHeapManager::new(shadow, stack_cache)));
    manager.set_parameters(&params);
    manager.set_error_callback(recorder);
    unsafe { manager.init() };

    let runtime: &'static Runtime = Box::leak(Box::new(Runtime::new(shadow, stack_cache, manager)));
    runtime.set_error_callback(recorder);

    Fixture {
        manager,
        runtime,
        _serial: serial,
    }
}

fn records() -> Vec<Recorded> {
    RECORDS.lock().unwrap().clone()
}

fn last_record() -> Recorded {
    records().last().expect("expected an error report").clone()
}

// ---------------------------------------------------------------------------
// Scenario: single-byte overflow on read
// ---------------------------------------------------------------------------

#[test]
fn single_byte_overflow_on_read() {
    let f = fixture();
    let heap = f.manager.process_heap();

    let p = f.manager.allocate(heap, 1);
    assert_ne!(p, 0);

    assert!(f.runtime.check_access(p, AccessMode::Read, 1));
    assert!(!f.runtime.check_access(p + 1, AccessMode::Read, 1));

    let r = last_record();
    assert_eq!(r.kind, BadAccessKind::HeapBufferOverflow);
    assert_eq!(r.mode, AccessMode::Read);
    assert_eq!(r.size, 1);
    assert_eq!(r.address, p + 1);
    assert_ne!(r.alloc_stack, 0, "allocation stack must be captured");
    assert!(r.shadow_text.contains("Shadow bytes around the buggy address:"));

    assert!(f.manager.free(heap, p));
}

// ---------------------------------------------------------------------------
// Scenario: 4-byte underflow on write
// ---------------------------------------------------------------------------

#[test]
fn four_byte_underflow_on_write() {
    let f = fixture();
    let heap = f.manager.process_heap();

    let p = f.manager.allocate(heap, 8);
    assert_ne!(p, 0);
    assert_eq!(p % 8, 0);

    assert!(!f.runtime.check_access(p - 4, AccessMode::Write, 4));

    let r = last_record();
    assert_eq!(r.kind, BadAccessKind::HeapBufferUnderflow);
    assert_eq!(r.mode, AccessMode::Write);
    assert_eq!(r.size, 4);
    assert_ne!(r.alloc_stack, 0);

    assert!(f.manager.free(heap, p));
}

// ---------------------------------------------------------------------------
// Scenario: use-after-free
// ---------------------------------------------------------------------------

#[test]
fn use_after_free_read() {
    let f = fixture();
    let heap = f.manager.process_heap();

    let p = f.manager.allocate(heap, 16);
    assert_ne!(p, 0);
    unsafe { core::ptr::write_bytes(p as *mut u8, 0x2A, 16) };
    assert!(f.manager.free(heap, p));

    assert!(!f.runtime.check_access(p, AccessMode::Read, 1));

    let r = last_record();
    assert_eq!(r.kind, BadAccessKind::UseAfterFree);
    assert_ne!(r.alloc_stack, 0, "allocation stack must survive the free");
    assert_ne!(r.free_stack, 0, "free stack must be recorded");
    assert_ne!(r.free_tid, 0, "freeing thread must be recorded");
}

// ---------------------------------------------------------------------------
// Scenario: double free
// ---------------------------------------------------------------------------

#[test]
fn double_free_detected() {
    let f = fixture();
    let heap = f.manager.process_heap();

    let p = f.manager.allocate(heap, 32);
    assert_ne!(p, 0);
    assert!(f.manager.free(heap, p));
    assert!(!f.manager.free(heap, p), "second free must be refused");

    let r = last_record();
    assert_eq!(r.kind, BadAccessKind::DoubleFree);
    assert_ne!(r.free_stack, 0);
}

// ---------------------------------------------------------------------------
// Scenario: corrupt header, then free
// ---------------------------------------------------------------------------

#[test]
fn corrupt_header_reported_on_free() {
    let f = fixture();
    let heap = f.manager.process_heap();

    let p = f.manager.allocate(heap, 64);
    assert_ne!(p, 0);

    // Stomp the first four bytes of the header.
    unsafe {
        let header = (p - block::BLOCK_HEADER_SIZE) as *mut u32;
        *header = 0xDEAD_BEEF;
    }

    // The free reports the corruption and still releases the memory.
    assert!(f.manager.free(heap, p));

    let r = last_record();
    assert_eq!(r.kind, BadAccessKind::CorruptBlock);
    assert_eq!(
        f.manager.allocation_size(heap, p),
        0,
        "corrupt block must not leak"
    );
}

// ---------------------------------------------------------------------------
// Scenario: guarded-allocation sampling at 50%
// ---------------------------------------------------------------------------

#[test]
fn sampled_allocations_at_half_rate() {
    let mut params = RuntimeParams::default_params();
    params.allocation_guard_rate = 0.5;
    let f = fixture_with(params);
    let heap = f.manager.process_heap();
    let shadow = f.manager.shadow();

    let mut guarded = 0usize;
    let mut pointers = Vec::new();
    for _ in 0..1000 {
        let p = f.manager.allocate(heap, 16);
        assert_ne!(p, 0);
        if shadow.is_beginning_of_block_body(p) {
            guarded += 1;
        }
        pointers.push(p);
    }

    assert!(
        (400..=600).contains(&guarded),
        "expected ~500 guarded allocations, got {}",
        guarded
    );

    // Both guarded and unguarded pointers free cleanly.
    for p in pointers {
        assert!(f.manager.free(heap, p));
    }
    assert!(records().is_empty(), "sampling must not report errors");
}

// ---------------------------------------------------------------------------
// Quarantine invariants
// ---------------------------------------------------------------------------

#[test]
fn quarantine_respects_byte_budget() {
    let mut params = RuntimeParams::default_params();
    params.quarantine_size = 8 * 1024;
    let f = fixture_with(params);
    let heap = f.manager.process_heap();

    for _ in 0..64 {
        let p = f.manager.allocate(heap, 256);
        assert_ne!(p, 0);
        assert!(f.manager.free(heap, p));
        assert!(
            f.manager.quarantine().size() <= 8 * 1024,
            "quarantine exceeded its byte budget"
        );
    }
    assert!(records().is_empty());
}

#[test]
fn oversized_blocks_skip_the_quarantine() {
    let mut params = RuntimeParams::default_params();
    params.quarantine_block_size = 512;
    // Stay below the large-block threshold so the simple heap serves it.
    let f = fixture_with(params);
    let heap = f.manager.process_heap();

    let p = f.manager.allocate(heap, 4096);
    assert_ne!(p, 0);
    assert!(f.manager.free(heap, p));
    assert_eq!(
        f.manager.quarantine().block_count(),
        0,
        "oversized block must be released immediately"
    );
    assert!(records().is_empty());
}

#[test]
fn zero_quarantine_budget_flushes() {
    let mut params = RuntimeParams::default_params();
    params.quarantine_size = 0;
    let f = fixture_with(params);
    let heap = f.manager.process_heap();

    let p = f.manager.allocate(heap, 128);
    assert!(f.manager.free(heap, p));
    assert_eq!(f.manager.quarantine().size(), 0);
    assert!(records().is_empty());
}

// ---------------------------------------------------------------------------
// Heap checker
// ---------------------------------------------------------------------------

#[test]
fn checker_reports_clean_heap() {
    let f = fixture();
    let heap = f.manager.process_heap();

    let mut pointers = Vec::new();
    for i in 0..16 {
        pointers.push(f.manager.allocate(heap, 32 + i * 8));
    }

    let mut ranges = [new_empty_range(); MAX_CORRUPT_RANGES];
    assert_eq!(checker::is_heap_corrupt(f.manager, &mut ranges), 0);

    for p in pointers {
        assert!(f.manager.free(heap, p));
    }
}

#[test]
fn checker_finds_corrupt_quarantined_block() {
    let f = fixture();
    let heap = f.manager.process_heap();

    let p = f.manager.allocate(heap, 64);
    assert!(f.manager.free(heap, p));

    // Write-after-free into the quarantined body. The pages are still
    // mapped for blocks on the simple heap.
    unsafe { *(p as *mut u8) = 0x5A };

    let mut ranges = [new_empty_range(); MAX_CORRUPT_RANGES];
    let count = checker::is_heap_corrupt(f.manager, &mut ranges);
    assert_eq!(count, 1, "expected exactly one corrupt range");
    assert_eq!(ranges[0].block_count, 1);
    let rep = ranges[0].representative;
    assert!(rep.block <= p && p < rep.block + rep.block_size);
}

fn new_empty_range() -> blockguard::error::CorruptRange {
    blockguard::error::CorruptRange {
        address: 0,
        length: 0,
        block_count: 0,
        representative: blockguard::block::CompactBlockInfo {
            block: 0,
            block_size: 0,
            header_size: 0,
            trailer_size: 0,
            is_nested: false,
        },
    }
}

// ---------------------------------------------------------------------------
// Exception filtering
// ---------------------------------------------------------------------------

#[test]
fn unclaimed_fault_reports_corrupt_heap() {
    use blockguard::runtime::{ExceptionRecord, ACCESS_VIOLATION_CODE};

    let f = fixture();
    let heap = f.manager.process_heap();

    // Corrupt a quarantined block, then hand the filter a fault that is
    // not in any redzone. The exception passes through, but the sweep
    // finds the corruption and reports it as corrupt-heap.
    let p = f.manager.allocate(heap, 64);
    assert!(f.manager.free(heap, p));
    unsafe { *(p as *mut u8) = 0x77 };

    let mut record = ExceptionRecord {
        code: ACCESS_VIOLATION_CODE,
        address: 0x4000_0000, // plain addressable memory, no block
        is_write: false,
        inner_code: 0,
    };
    assert!(!f.runtime.exception_filter(&mut record, Default::default()));
    assert_eq!(record.code, ACCESS_VIOLATION_CODE, "record must pass through unchanged");

    let r = last_record();
    assert_eq!(r.kind, BadAccessKind::CorruptHeap);
}

#[test]
fn sentinel_records_are_unwrapped_not_reprocessed() {
    use blockguard::runtime::{ExceptionRecord, ACCESS_VIOLATION_CODE, SENTINEL_EXCEPTION_CODE};

    let f = fixture();
    let heap = f.manager.process_heap();
    let p = f.manager.allocate(heap, 16);

    // A fault in the block's right redzone is claimed and wrapped.
    let mut record = ExceptionRecord {
        code: ACCESS_VIOLATION_CODE,
        address: p + 16,
        is_write: true,
        inner_code: 0,
    };
    assert!(f.runtime.exception_filter(&mut record, Default::default()));
    assert_eq!(record.code, SENTINEL_EXCEPTION_CODE);
    assert_eq!(record.inner_code, ACCESS_VIOLATION_CODE);
    assert_eq!(records().len(), 1);
    assert_eq!(last_record().kind, BadAccessKind::HeapBufferOverflow);

    // Running the wrapped record through the filter again unwraps it and
    // produces no second report.
    assert!(!f.runtime.exception_filter(&mut record, Default::default()));
    assert_eq!(record.code, ACCESS_VIOLATION_CODE);
    assert_eq!(records().len(), 1, "sentinel records must not be reprocessed");

    assert!(f.manager.free(heap, p));
}

// ---------------------------------------------------------------------------
// Large-block heap
// ---------------------------------------------------------------------------

#[test]
fn large_blocks_get_page_protected_redzones() {
    let f = fixture();
    let heap = f.manager.process_heap();
    let shadow = f.manager.shadow();

    let body_size = 2 * PAGE_SIZE;
    let p = f.manager.allocate(heap, body_size);
    assert_ne!(p, 0);
    assert_eq!(p % PAGE_SIZE, 0, "large-block bodies are page-aligned");

    // The header page carries hardware protection; the body does not.
    assert!(shadow.page_is_protected(p - PAGE_SIZE));
    assert!(!shadow.page_is_protected(p));
    // The trailer page after the body is protected too.
    assert!(shadow.page_is_protected(p + body_size));

    unsafe { core::ptr::write_bytes(p as *mut u8, 0x11, body_size) };
    assert!(f.manager.free(heap, p));
    assert!(records().is_empty());
}

#[test]
fn oversized_large_block_releases_despite_protections() {
    let mut params = RuntimeParams::default_params();
    params.quarantine_block_size = PAGE_SIZE;
    let f = fixture_with(params);
    let heap = f.manager.process_heap();

    // A large block over the per-block quarantine cap: protected on free,
    // then released immediately instead of being parked.
    let p = f.manager.allocate(heap, 2 * PAGE_SIZE);
    assert_ne!(p, 0);
    assert!(f.manager.free(heap, p));
    assert_eq!(f.manager.quarantine().block_count(), 0);
    assert!(records().is_empty());
}

// ---------------------------------------------------------------------------
// Zebra heap
// ---------------------------------------------------------------------------

#[test]
fn zebra_quarantined_slots_are_page_protected() {
    let mut params = RuntimeParams::default_params();
    params.enable_zebra_block_heap = true;
    let f = fixture_with(params);
    let heap = f.manager.process_heap();
    let shadow = f.manager.shadow();

    let p = f.manager.allocate(heap, 64);
    assert_ne!(p, 0);
    assert!(!shadow.page_is_protected(p));

    assert!(f.manager.free(heap, p));
    assert!(
        shadow.page_is_protected(p),
        "freed zebra slot must be hardware protected"
    );

    // The stale pointer still classifies via the shadow alone.
    assert!(!f.runtime.check_access(p, AccessMode::Read, 1));
    assert_eq!(last_record().kind, BadAccessKind::UseAfterFree);
}

#[test]
fn allocation_filter_gates_zebra_routing() {
    let mut params = RuntimeParams::default_params();
    params.enable_zebra_block_heap = true;
    params.enable_allocation_filter = true;
    let f = fixture_with(params);
    let heap = f.manager.process_heap();
    let shadow = f.manager.shadow();

    // Filter flag clear: the zebra heap is bypassed, so the freed slot is
    // not page protected.
    f.manager.set_allocation_filter_flag(false);
    let p = f.manager.allocate(heap, 64);
    assert!(f.manager.free(heap, p));
    assert!(!shadow.page_is_protected(p));

    // Filter flag set: the allocation lands on the zebra heap.
    f.manager.set_allocation_filter_flag(true);
    let q = f.manager.allocate(heap, 64);
    assert!(f.manager.free(heap, q));
    assert!(shadow.page_is_protected(q));

    f.manager.set_allocation_filter_flag(false);
    assert!(records().is_empty());
}

// ---------------------------------------------------------------------------
// Heap lifecycle
// ---------------------------------------------------------------------------

#[test]
fn heap_create_destroy_lifecycle() {
    let f = fixture();

    let heap = f.manager.create_heap();
    assert_ne!(heap, 0);
    assert!(f.manager.is_valid_heap(heap));

    let p = f.manager.allocate(heap, 48);
    let q = f.manager.allocate(heap, 1024);
    assert_ne!(p, 0);
    assert_ne!(q, 0);
    assert!(f.manager.free(heap, p));

    // Destroy drains the quarantined block and releases the live one.
    assert!(f.manager.destroy_heap(heap));
    assert!(!f.manager.is_valid_heap(heap));

    // The process heap refuses destruction.
    assert!(!f.manager.destroy_heap(f.manager.process_heap()));
}

#[test]
fn allocation_size_reports_body_size() {
    let f = fixture();
    let heap = f.manager.process_heap();

    for &size in &[1usize, 7, 8, 100, 4000] {
        let p = f.manager.allocate(heap, size);
        assert_eq!(f.manager.allocation_size(heap, p), size, "size {}", size);
        assert!(f.manager.free(heap, p));
    }
}

// ---------------------------------------------------------------------------
// Shadow invariants across the allocation lifecycle
// ---------------------------------------------------------------------------

#[test]
fn body_exactly_addressable_while_live() {
    let f = fixture();
    let heap = f.manager.process_heap();
    let shadow = f.manager.shadow();

    let size = 23;
    let p = f.manager.allocate(heap, size);
    let compact = shadow.block_info_from_shadow(p).unwrap();
    let info = compact.expand();

    for addr in info.block..info.block + info.block_size {
        let expected = addr >= p && addr < p + size;
        assert_eq!(
            shadow.is_accessible(addr),
            expected,
            "accessibility mismatch at offset {}",
            addr - info.block
        );
    }

    assert!(f.manager.free(heap, p));
    // After the free nothing in the block is accessible.
    for addr in (info.block..info.block + info.block_size).step_by(8) {
        assert!(!shadow.is_accessible(addr));
    }
}

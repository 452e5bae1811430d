//! The C ABI consumed by instrumented binaries.
//!
//! Heap management entry points fan into the block heap manager; the
//! per-size, per-mode check entry points are the targets of the
//! instrumentation tool's register-preserving trampolines. Every entry
//! point lazily initializes the runtime, mirroring a library constructor.

use crate::error::{AccessMode, ErrorInfo};
use crate::heap_manager::HeapId;
use crate::init;
use crate::runtime::{ExceptionRecord, SENTINEL_EXCEPTION_CODE};
use core::ffi::c_void;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Initialize the runtime with an optional NUL-terminated option string.
/// Returns false if initialization failed (the runtime is then inert).
///
/// # Safety
/// `options` must be null or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn blockguard_initialize(options: *const libc::c_char) -> bool {
    let options = if options.is_null() {
        None
    } else {
        let len = libc::strlen(options);
        Some(core::slice::from_raw_parts(options as *const u8, len))
    };
    init::initialize(options)
}

/// Tear the runtime down (flushes the quarantine).
///
/// # Safety
/// No other runtime calls may be in flight.
#[no_mangle]
pub unsafe extern "C" fn blockguard_teardown() {
    init::tear_down();
}

// ============================================================================
// Heap management
// ============================================================================

#[no_mangle]
pub extern "C" fn blockguard_heap_create() -> HeapId {
    init::ensure_initialized();
    if !init::is_ready() {
        return 0;
    }
    init::manager().create_heap()
}

#[no_mangle]
pub extern "C" fn blockguard_heap_destroy(heap_id: HeapId) -> bool {
    init::ensure_initialized();
    if !init::is_ready() {
        return false;
    }
    init::manager().destroy_heap(heap_id)
}

#[no_mangle]
pub extern "C" fn blockguard_heap_alloc(heap_id: HeapId, _flags: u32, size: usize) -> *mut c_void {
    init::ensure_initialized();
    if !init::is_ready() {
        return core::ptr::null_mut();
    }
    init::manager().allocate(heap_id, size) as *mut c_void
}

#[no_mangle]
pub extern "C" fn blockguard_heap_free(heap_id: HeapId, _flags: u32, ptr: *mut c_void) -> bool {
    init::ensure_initialized();
    if !init::is_ready() {
        return false;
    }
    init::manager().free(heap_id, ptr as usize)
}

#[no_mangle]
pub extern "C" fn blockguard_heap_size(heap_id: HeapId, _flags: u32, ptr: *const c_void) -> usize {
    init::ensure_initialized();
    if !init::is_ready() {
        return 0;
    }
    init::manager().allocation_size(heap_id, ptr as usize)
}

#[no_mangle]
pub extern "C" fn blockguard_heap_lock(heap_id: HeapId) {
    init::ensure_initialized();
    if init::is_ready() {
        init::manager().lock_heap(heap_id);
    }
}

#[no_mangle]
pub extern "C" fn blockguard_heap_unlock(heap_id: HeapId) {
    init::ensure_initialized();
    if init::is_ready() {
        init::manager().unlock_heap(heap_id);
    }
}

/// The heap behind the redirected standard allocator entry points.
#[no_mangle]
pub extern "C" fn blockguard_process_heap() -> HeapId {
    init::ensure_initialized();
    if !init::is_ready() {
        return 0;
    }
    init::manager().process_heap()
}

// ============================================================================
// Filter flag and error callback
// ============================================================================

#[no_mangle]
pub extern "C" fn blockguard_set_allocation_filter_flag(value: bool) {
    init::ensure_initialized();
    if init::is_ready() {
        init::manager().set_allocation_filter_flag(value);
    }
}

#[no_mangle]
pub extern "C" fn blockguard_get_allocation_filter_flag() -> bool {
    init::ensure_initialized();
    init::is_ready() && init::manager().allocation_filter_flag()
}

/// C error callback. The record pointer is opaque to C consumers; Rust
/// embedders use `runtime().set_error_callback` directly.
pub type CErrorCallback = unsafe extern "C" fn(*mut ErrorInfo);

static C_ERROR_CALLBACK: AtomicUsize = AtomicUsize::new(0);

fn c_callback_trampoline(error: &mut ErrorInfo) {
    let raw = C_ERROR_CALLBACK.load(Ordering::Acquire);
    if raw != 0 {
        let callback: CErrorCallback = unsafe { core::mem::transmute(raw) };
        unsafe { callback(error as *mut ErrorInfo) };
    }
}

#[no_mangle]
pub extern "C" fn blockguard_set_error_callback(callback: Option<CErrorCallback>) {
    init::ensure_initialized();
    if !init::is_ready() {
        return;
    }
    match callback {
        Some(callback) => {
            C_ERROR_CALLBACK.store(callback as usize, Ordering::Release);
            init::runtime().set_error_callback(c_callback_trampoline);
        }
        None => C_ERROR_CALLBACK.store(0, Ordering::Release),
    }
}

// ============================================================================
// Access checks
// ============================================================================

macro_rules! define_access_checks {
    ($(($read_name:ident, $write_name:ident, $size:expr)),* $(,)?) => {
        $(
            #[no_mangle]
            pub extern "C" fn $read_name(addr: *const c_void) {
                init::ensure_initialized();
                if init::is_ready() {
                    init::runtime().check_access(addr as usize, AccessMode::Read, $size);
                }
            }

            #[no_mangle]
            pub extern "C" fn $write_name(addr: *const c_void) {
                init::ensure_initialized();
                if init::is_ready() {
                    init::runtime().check_access(addr as usize, AccessMode::Write, $size);
                }
            }
        )*
    };
}

define_access_checks!(
    (blockguard_check_1_byte_read, blockguard_check_1_byte_write, 1),
    (blockguard_check_2_byte_read, blockguard_check_2_byte_write, 2),
    (blockguard_check_4_byte_read, blockguard_check_4_byte_write, 4),
    (blockguard_check_8_byte_read, blockguard_check_8_byte_write, 8),
    (blockguard_check_16_byte_read, blockguard_check_16_byte_write, 16),
    (blockguard_check_32_byte_read, blockguard_check_32_byte_write, 32),
);

/// Run an exception record through the runtime's filter, for embedders
/// that install their own unhandled-exception handling. Returns true when
/// the runtime claimed (and sentinel-wrapped) the record.
///
/// # Safety
/// `record` must point to a valid `ExceptionRecord`.
#[no_mangle]
pub unsafe extern "C" fn blockguard_filter_exception(record: *mut ExceptionRecord) -> bool {
    init::ensure_initialized();
    if !init::is_ready() || record.is_null() {
        return false;
    }
    init::runtime().exception_filter(&mut *record, Default::default())
}

/// The sentinel code used to wrap runtime-raised exceptions.
#[no_mangle]
pub extern "C" fn blockguard_sentinel_exception_code() -> u32 {
    SENTINEL_EXCEPTION_CODE
}

// ============================================================================
// Redirected standard allocator entry points
// ============================================================================

#[cfg(feature = "redirect-malloc")]
mod redirects {
    use super::*;

    #[no_mangle]
    pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
        blockguard_heap_alloc(blockguard_process_heap(), 0, size.max(1))
    }

    #[no_mangle]
    pub unsafe extern "C" fn free(ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        blockguard_heap_free(blockguard_process_heap(), 0, ptr);
    }

    #[no_mangle]
    pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
        let Some(total) = nmemb.checked_mul(size) else {
            *libc::__errno_location() = libc::ENOMEM;
            return core::ptr::null_mut();
        };
        let ptr = malloc(total.max(1));
        if !ptr.is_null() {
            core::ptr::write_bytes(ptr as *mut u8, 0, total);
        }
        ptr
    }

    #[no_mangle]
    pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
        if ptr.is_null() {
            return malloc(size.max(1));
        }
        if size == 0 {
            free(ptr);
            return core::ptr::null_mut();
        }
        let heap = blockguard_process_heap();
        let old_size = blockguard_heap_size(heap, 0, ptr);
        let new_ptr = blockguard_heap_alloc(heap, 0, size);
        if new_ptr.is_null() {
            return core::ptr::null_mut();
        }
        core::ptr::copy_nonoverlapping(
            ptr as *const u8,
            new_ptr as *mut u8,
            old_size.min(size),
        );
        blockguard_heap_free(heap, 0, ptr);
        new_ptr
    }

    #[no_mangle]
    pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
        if ptr.is_null() {
            return 0;
        }
        blockguard_heap_size(blockguard_process_heap(), 0, ptr)
    }
}

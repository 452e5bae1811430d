//! Global runtime state and initialization ordering.
//!
//! Setup order is fixed: shadow, then stack cache, then heap manager,
//! then the façade; teardown runs in reverse. Everything outside this
//! module reaches the singletons through the accessors below.

use crate::config::{self, RuntimeParams};
use crate::error::ErrorInfo;
use crate::heap_manager::BlockHeapManager;
use crate::report;
use crate::runtime::{self, Runtime};
use crate::shadow::Shadow;
use crate::stack_cache::StackCaptureCache;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;
const FAILED: u8 = 3;

static INIT_STATE: AtomicU8 = AtomicU8::new(UNINIT);

struct Holder<T>(UnsafeCell<Option<T>>);
unsafe impl<T> Sync for Holder<T> {}

static SHADOW: Holder<Shadow> = Holder(UnsafeCell::new(None));
static STACK_CACHE: Holder<StackCaptureCache> = Holder(UnsafeCell::new(None));
static MANAGER: Holder<BlockHeapManager> = Holder(UnsafeCell::new(None));
static RUNTIME: Holder<Runtime> = Holder(UnsafeCell::new(None));

fn get<T>(holder: &'static Holder<T>) -> &'static T {
    unsafe {
        match (*holder.0.get()).as_ref() {
            Some(value) => value,
            None => report::abort_with_message("blockguard: runtime accessed before init\n"),
        }
    }
}

pub fn shadow() -> &'static Shadow {
    get(&SHADOW)
}

pub fn stack_cache() -> &'static StackCaptureCache {
    get(&STACK_CACHE)
}

pub fn manager() -> &'static BlockHeapManager {
    get(&MANAGER)
}

pub fn runtime() -> &'static Runtime {
    get(&RUNTIME)
}

pub fn is_ready() -> bool {
    INIT_STATE.load(Ordering::Acquire) == READY
}

/// The heap manager funnels its internally detected errors here.
fn manager_error_trampoline(error: &mut ErrorInfo) {
    if is_ready() {
        runtime().on_error(error);
    }
}

/// Initialize the runtime, optionally with an options string (the
/// `BLOCKGUARD_OPTIONS` environment variable is applied on top).
/// Subsequent calls are no-ops; concurrent callers wait for the winner.
///
/// # Safety
/// Reads the environment; standard process-startup caveats apply.
pub unsafe fn initialize(options: Option<&[u8]>) -> bool {
    match INIT_STATE.compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {}
        Err(INITIALIZING) => {
            while INIT_STATE.load(Ordering::Acquire) == INITIALIZING {
                core::hint::spin_loop();
            }
            return is_ready();
        }
        Err(state) => return state == READY,
    }

    // Parameters first: the heap manager consults them during setup.
    let mut params = RuntimeParams::default_params();
    if let Some(options) = options {
        config::parse_options(options, &mut params);
    }
    config::apply_env_options(&mut params);

    let mut shadow = Shadow::new();
    if !shadow.init() {
        INIT_STATE.store(FAILED, Ordering::Release);
        return false;
    }
    *SHADOW.0.get() = Some(shadow);

    let stack_cache = StackCaptureCache::new();
    if !stack_cache.init() {
        INIT_STATE.store(FAILED, Ordering::Release);
        return false;
    }
    *STACK_CACHE.0.get() = Some(stack_cache);

    *MANAGER.0.get() = Some(BlockHeapManager::new(get(&SHADOW), get(&STACK_CACHE)));
    let manager = get(&MANAGER);
    manager.set_parameters(&params);
    manager.set_error_callback(manager_error_trampoline);
    manager.init();

    *RUNTIME.0.get() = Some(Runtime::new(get(&SHADOW), get(&STACK_CACHE), manager));
    runtime::install_exception_handler();

    INIT_STATE.store(READY, Ordering::Release);
    true
}

#[cold]
#[inline(never)]
pub fn ensure_initialized() {
    if !is_ready() {
        unsafe {
            initialize(None);
        }
    }
}

/// Tear the runtime down in reverse setup order: flush the quarantine,
/// then clear the shadow's static markings. Mappings stay in place; this
/// exists for orderly shutdown, not for reclaiming memory mid-process.
pub unsafe fn tear_down() {
    if !is_ready() {
        return;
    }
    manager().flush_quarantine();
    shadow().tear_down();
    INIT_STATE.store(UNINIT, Ordering::Release);
}

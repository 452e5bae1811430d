//! The runtime façade.
//!
//! Funnels every detected error through one place: classification against
//! the shadow, optional heap-wide corruption sweep, standardized log
//! lines, the minidump hook, and finally the registered error callback.
//! Also owns the access-violation handler that turns redzone page faults
//! into classified reports.

use crate::checker;
use crate::error::{
    self, AccessMode, BadAccessKind, CpuContext, ErrorCallback, ErrorInfo,
};
use crate::heap_manager::BlockHeapManager;
use crate::config::MAX_STACK_FRAMES;
use crate::report::{self, log};
use crate::shadow::{marker, Shadow};
use crate::stack_cache::StackCaptureCache;
use crate::util::ADDRESS_SPACE_SIZE;
use crate::block;
use core::cell::{Cell, UnsafeCell};
use core::fmt::Write;

/// Exception code wrapped around runtime-synthesized reports, so an outer
/// unhandled-exception filter recognizes them and never processes the
/// same error twice. Customer-defined severity/facility/status bits keep
/// it clear of every real exception code.
pub const SENTINEL_EXCEPTION_CODE: u32 = (3 << 30) | (1 << 29) | (0x6B0 << 16) | 0x5AD0;

/// Exception code classifying hardware access violations.
pub const ACCESS_VIOLATION_CODE: u32 = libc::SIGSEGV as u32;

/// A portable view of an exception: its code, the faulting address, the
/// access direction, and (for sentinel-wrapped records) the original code.
#[derive(Clone, Copy, Debug)]
pub struct ExceptionRecord {
    pub code: u32,
    pub address: usize,
    pub is_write: bool,
    pub inner_code: u32,
}

thread_local! {
    /// Guards against recursive reporting from inside the error path.
    static REPORT_IN_PROGRESS: Cell<bool> = const { Cell::new(false) };
}

pub struct Runtime {
    shadow: &'static Shadow,
    stack_cache: &'static StackCaptureCache,
    manager: &'static BlockHeapManager,
    callback: UnsafeCell<Option<ErrorCallback>>,
    minidump_hook: UnsafeCell<Option<fn(&ErrorInfo)>>,
}

unsafe impl Send for Runtime {}
unsafe impl Sync for Runtime {}

impl Runtime {
    pub fn new(
        shadow: &'static Shadow,
        stack_cache: &'static StackCaptureCache,
        manager: &'static BlockHeapManager,
    ) -> Runtime {
        Runtime {
            shadow,
            stack_cache,
            manager,
            callback: UnsafeCell::new(None),
            minidump_hook: UnsafeCell::new(None),
        }
    }

    pub fn manager(&self) -> &'static BlockHeapManager {
        self.manager
    }

    /// Register the callback invoked after an error is logged.
    pub fn set_error_callback(&self, callback: ErrorCallback) {
        unsafe { *self.callback.get() = Some(callback) };
    }

    /// Register the hook used when `minidump_on_failure` is set. Actual
    /// minidump writing lives with the external logger.
    pub fn set_minidump_hook(&self, hook: fn(&ErrorInfo)) {
        unsafe { *self.minidump_hook.get() = Some(hook) };
    }

    // -----------------------------------------------------------------------
    // Access checks (the instrumented slow path).
    // -----------------------------------------------------------------------

    /// Check an access of `size` bytes at `addr`. Returns true when the
    /// access is allowed; otherwise the error is reported and false comes
    /// back so the caller can decide whether to continue.
    #[inline]
    pub fn check_access(&self, addr: usize, mode: AccessMode, size: usize) -> bool {
        debug_assert!(size > 0);
        if self.shadow.is_accessible(addr) && self.shadow.is_accessible(addr.wrapping_add(size - 1))
        {
            return true;
        }
        self.report_bad_access(addr, mode, size);
        false
    }

    /// Slow path: classify and report a failed access check.
    #[cold]
    pub fn report_bad_access(&self, addr: usize, mode: AccessMode, size: usize) {
        let mut error = ErrorInfo::new(BadAccessKind::UnknownBadAccess, addr);
        error.access_mode = mode;
        error.access_size = size;
        self.classify_bad_access(&mut error);
        self.on_error(&mut error);
    }

    /// Classify a faulting address: wild/invalid ranges first, then block
    /// context from the shadow.
    fn classify_bad_access(&self, error: &mut ErrorInfo) {
        let addr = error.address;
        let m = self.shadow.marker_at(addr);
        if addr >= ADDRESS_SPACE_SIZE || m == marker::RUNTIME_MEMORY {
            error.kind = BadAccessKind::WildAccess;
            error::append_shadow_text(self.shadow, error);
            return;
        }
        if m == marker::INVALID_ADDRESS {
            error.kind = BadAccessKind::InvalidAddress;
            error::append_shadow_text(self.shadow, error);
            return;
        }
        // The surrounding block's metadata is about to be read; make sure
        // its pages are readable first.
        if let Some(compact) = self.shadow.block_info_from_shadow(addr) {
            unsafe { block::block_protect_none(&compact.expand(), self.shadow) };
        }
        error::fill_bad_access_info(self.shadow, error);
    }

    // -----------------------------------------------------------------------
    // Exception filtering.
    // -----------------------------------------------------------------------

    /// Process an exception record. Sentinel-wrapped records are unwrapped
    /// to their original code and never re-processed. An access violation
    /// whose address lies in an active block's redzone is claimed: the
    /// runtime synthesizes a full error report and wraps the record in the
    /// sentinel. Anything else passes through untouched.
    pub fn exception_filter(&self, record: &mut ExceptionRecord, context: CpuContext) -> bool {
        if record.code == SENTINEL_EXCEPTION_CODE {
            record.code = record.inner_code;
            return false;
        }
        if record.code != ACCESS_VIOLATION_CODE && record.code != libc::SIGBUS as u32 {
            return false;
        }

        let m = self.shadow.marker_at(record.address);
        if !marker::is_redzone(m) || !marker::is_active_block(m) {
            // Not a redzone fault: the exception passes through unchanged,
            // but a corrupt heap is still worth reporting alongside it --
            // the fault may well be a side effect of the corruption.
            if self.manager.parameters().check_heap_on_failure {
                let mut error = ErrorInfo::new(BadAccessKind::CorruptHeap, record.address);
                error.context = context;
                let count = checker::is_heap_corrupt(self.manager, &mut error.corrupt_ranges);
                if count > 0 {
                    error.corrupt_range_count = count;
                    error.heap_is_corrupt = true;
                    error::append_shadow_text(self.shadow, &mut error);
                    self.on_error(&mut error);
                }
            }
            return false;
        }

        log!("caught an invalid access via an access violation exception");

        let mut error = ErrorInfo::new(BadAccessKind::UnknownBadAccess, record.address);
        // The hardware does not report the width; one byte is the lower
        // bound.
        error.access_size = 1;
        error.access_mode = if record.is_write {
            AccessMode::Write
        } else {
            AccessMode::Read
        };
        error.context = context;

        if let Some(compact) = self.shadow.block_info_from_shadow(record.address) {
            unsafe { block::block_protect_none(&compact.expand(), self.shadow) };
        }
        error::fill_bad_access_info(self.shadow, &mut error);
        self.on_error(&mut error);

        record.inner_code = record.code;
        record.code = SENTINEL_EXCEPTION_CODE;
        true
    }

    // -----------------------------------------------------------------------
    // The error funnel.
    // -----------------------------------------------------------------------

    /// Report an error: optional heap sweep, standardized log output,
    /// minidump hook, exit-on-failure, then the registered callback.
    pub fn on_error(&self, error: &mut ErrorInfo) {
        let reentered = REPORT_IN_PROGRESS.with(|flag| flag.replace(true));
        if reentered {
            return;
        }

        let params = self.manager.parameters();
        if error.alloc_stack_id != 0 && params.stack_id_is_ignored(error.alloc_stack_id) {
            REPORT_IN_PROGRESS.with(|flag| flag.set(false));
            return;
        }

        if params.check_heap_on_failure {
            let count = checker::is_heap_corrupt(self.manager, &mut error.corrupt_ranges);
            error.corrupt_range_count = count;
            error.heap_is_corrupt = count > 0;
        }

        self.log_error(error);

        if params.minidump_on_failure {
            if let Some(hook) = unsafe { *self.minidump_hook.get() } {
                hook(error);
            }
        }
        if params.exit_on_failure {
            unsafe { libc::exit(libc::EXIT_FAILURE) };
        }

        if let Some(callback) = unsafe { *self.callback.get() } {
            callback(error);
        }

        REPORT_IN_PROGRESS.with(|flag| flag.set(false));
    }

    /// The standardized report. The first line per error kind is stable
    /// and documented (see `error::kind_to_str`); external harnesses match
    /// on it.
    fn log_error(&self, error: &ErrorInfo) {
        let crash_stack_id = self.stack_cache.capture();
        log!(
            "error: {} on address 0x{:08x} (stack_id=0x{:08x})",
            error::kind_to_str(error.kind),
            error.address,
            crash_stack_id
        );
        if error.access_mode != AccessMode::Unknown {
            log!(
                "{} of size {} at 0x{:08x}",
                error::access_mode_to_str(error.access_mode),
                error.access_size,
                error.address
            );
        }
        if error.shadow_text_len > 0 {
            report::write_stderr(&error.shadow_text[..error.shadow_text_len]);
        }
        if error.free_stack_id != 0 {
            log!("freed here (tid={}):", error.free_tid);
            self.log_stack(error.free_stack_id);
        }
        if error.alloc_stack_id != 0 {
            log!("previously allocated here (tid={}):", error.alloc_tid);
            self.log_stack(error.alloc_stack_id);
        }
        if error.heap_is_corrupt {
            log!(
                "heap corruption detected: {} corrupt range(s)",
                error.corrupt_range_count
            );
        }
    }

    fn log_stack(&self, stack_id: u32) {
        let mut frames = [0usize; MAX_STACK_FRAMES];
        let count = self.stack_cache.copy_frames(stack_id, &mut frames);
        let mut buf = [0u8; 512];
        let mut writer = report::BufWriter::new(&mut buf);
        for (i, frame) in frames[..count].iter().enumerate() {
            let _ = writeln!(writer, "    #{} 0x{:016x}", i, frame);
        }
        report::write_stderr(writer.written());
    }
}

// ---------------------------------------------------------------------------
// Unhandled access-violation handler.
// ---------------------------------------------------------------------------

struct StoredAction(UnsafeCell<core::mem::MaybeUninit<libc::sigaction>>);
unsafe impl Sync for StoredAction {}

static OLD_SEGV_ACTION: StoredAction =
    StoredAction(UnsafeCell::new(core::mem::MaybeUninit::uninit()));
static OLD_BUS_ACTION: StoredAction =
    StoredAction(UnsafeCell::new(core::mem::MaybeUninit::uninit()));

/// Install the SIGSEGV/SIGBUS handler that classifies redzone page
/// faults. The previous dispositions are preserved and re-raised for
/// faults the runtime does not claim.
///
/// # Safety
/// Single-threaded init context; must run once.
pub unsafe fn install_exception_handler() {
    let mut action: libc::sigaction = core::mem::zeroed();
    action.sa_sigaction = access_violation_handler as usize;
    action.sa_flags = libc::SA_SIGINFO;
    libc::sigemptyset(&mut action.sa_mask);

    libc::sigaction(
        libc::SIGSEGV,
        &action,
        (*OLD_SEGV_ACTION.0.get()).as_mut_ptr(),
    );
    libc::sigaction(
        libc::SIGBUS,
        &action,
        (*OLD_BUS_ACTION.0.get()).as_mut_ptr(),
    );
}

unsafe fn restore_previous_action(signal: libc::c_int) {
    let stored = match signal {
        libc::SIGSEGV => (*OLD_SEGV_ACTION.0.get()).as_ptr(),
        libc::SIGBUS => (*OLD_BUS_ACTION.0.get()).as_ptr(),
        _ => return,
    };
    libc::sigaction(signal, stored, core::ptr::null_mut());
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn context_from_ucontext(ctx: *mut libc::c_void) -> (CpuContext, bool) {
    let uc = ctx as *const libc::ucontext_t;
    if uc.is_null() {
        return (CpuContext::default(), false);
    }
    let gregs = &(*uc).uc_mcontext.gregs;
    let context = CpuContext {
        ip: gregs[libc::REG_RIP as usize] as usize,
        sp: gregs[libc::REG_RSP as usize] as usize,
        bp: gregs[libc::REG_RBP as usize] as usize,
    };
    // Page-fault error code bit 1: set for writes.
    let is_write = gregs[libc::REG_ERR as usize] & 2 != 0;
    (context, is_write)
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
unsafe fn context_from_ucontext(_ctx: *mut libc::c_void) -> (CpuContext, bool) {
    (CpuContext::default(), false)
}

unsafe extern "C" fn access_violation_handler(
    signal: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    // A fault raised while reporting a fault cannot be reasoned about.
    let reentered = REPORT_IN_PROGRESS
        .try_with(|flag| flag.get())
        .unwrap_or(true);
    let mut claimed = false;
    if !reentered && crate::init::is_ready() && !info.is_null() {
        let address = (*info).si_addr() as usize;
        let (context, is_write) = context_from_ucontext(ctx);
        let mut record = ExceptionRecord {
            code: signal as u32,
            address,
            is_write,
            inner_code: 0,
        };
        claimed = crate::init::runtime().exception_filter(&mut record, context);
    }

    if claimed {
        // Classification lifted the page protections to read the block's
        // metadata, so the faulting instruction would succeed if simply
        // restarted. The report is out; terminate under the default
        // disposition instead. The re-raised signal is pending until this
        // handler returns.
        let mut action: libc::sigaction = core::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signal, &action, core::ptr::null_mut());
        libc::raise(signal);
    } else {
        // An unclaimed fault restarts the instruction under the previous
        // disposition.
        restore_previous_action(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_code_is_customer_defined() {
        // Severity = error, customer bit set, and clear of the reserved
        // bits, per the platform exception-code layout.
        assert_eq!(SENTINEL_EXCEPTION_CODE >> 30, 3);
        assert_eq!((SENTINEL_EXCEPTION_CODE >> 29) & 1, 1);
        assert_ne!(SENTINEL_EXCEPTION_CODE, ACCESS_VIOLATION_CODE);
    }
}

//! Platform layer: the opaque page-granularity memory primitive behind
//! every heap, plus thread identity, tick counts, and the sampling RNG.
//!
//! Two mapping entry points exist on purpose. Runtime tables (shadow,
//! stack cache, quarantine rings) may live anywhere in the address space;
//! heap backing memory must land below the 2 GiB bound the shadow
//! mirrors, or its blocks would be invisible to every accessibility
//! query. Lengths are rounded up to whole pages here, so callers deal in
//! the sizes they actually need.

use crate::util::{align_up, ADDRESS_SPACE_SIZE, PAGE_SIZE};
use core::cell::Cell;

/// Hardware protection states a page range can be moved between.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PageAccess {
    /// Any access faults. Guard pages, protected redzones, quarantined
    /// zebra slots.
    Inaccessible,
    ReadWrite,
}

impl PageAccess {
    fn as_prot(self) -> libc::c_int {
        match self {
            PageAccess::Inaccessible => libc::PROT_NONE,
            PageAccess::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// Map zeroed read-write pages for a runtime-internal table. Placement is
/// unconstrained; these pages are never themselves tracked by the shadow.
pub fn map_runtime_pages(len: usize) -> Option<*mut u8> {
    let len = align_up(len.max(1), PAGE_SIZE);
    let mapped = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        return None;
    }
    Some(mapped as *mut u8)
}

/// Map zeroed read-write pages for heap backing memory, below the 2 GiB
/// address bound. A mapping the kernel cannot place under the bound is
/// released and reported as failure: a block the shadow cannot mirror
/// must never exist.
pub fn map_heap_pages(len: usize) -> Option<usize> {
    let len = align_up(len.max(1), PAGE_SIZE);

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_32BIT;
    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    let mapped = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            -1,
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        return None;
    }
    let base = mapped as usize;
    match base.checked_add(len) {
        Some(end) if end <= ADDRESS_SPACE_SIZE => Some(base),
        _ => {
            unsafe { libc::munmap(mapped, len) };
            None
        }
    }
}

/// Return a mapping to the kernel.
///
/// # Safety
/// `addr` must have come from one of the map functions above, with the
/// same `len`, and nothing may reference the range afterwards.
pub unsafe fn unmap_pages(addr: usize, len: usize) {
    libc::munmap(addr as *mut libc::c_void, align_up(len, PAGE_SIZE));
}

/// Change the hardware protection of a page range.
///
/// # Safety
/// The range must be mapped and owned by the caller; flipping someone
/// else's pages to `Inaccessible` turns their next access into a fault.
pub unsafe fn protect_pages(addr: usize, len: usize, access: PageAccess) {
    debug_assert!(addr % PAGE_SIZE == 0);
    libc::mprotect(
        addr as *mut libc::c_void,
        align_up(len, PAGE_SIZE),
        access.as_prot(),
    );
}

/// Tell the kernel the range's contents are dead. The pages stay mapped
/// and read back zero-filled, so a cached region can be reused without
/// leaking its previous occupant's bytes.
///
/// # Safety
/// The range must be mapped, owned by the caller, and hold no live data.
pub unsafe fn release_pages(addr: usize, len: usize) {
    debug_assert!(addr % PAGE_SIZE == 0);
    let ret = libc::madvise(
        addr as *mut libc::c_void,
        align_up(len, PAGE_SIZE),
        libc::MADV_DONTNEED,
    );
    debug_assert!(ret == 0, "madvise(MADV_DONTNEED) failed");
}

/// The current thread's kernel id, as stamped into block trailers. Cached
/// per thread; the syscall happens once.
pub fn thread_id() -> u32 {
    thread_local! {
        static CACHED_TID: Cell<u32> = const { Cell::new(0) };
    }

    CACHED_TID
        .try_with(|cached| match cached.get() {
            0 => {
                let tid = current_tid();
                cached.set(tid);
                tid
            }
            tid => tid,
        })
        // TLS can be gone during thread teardown; the id itself is not.
        .unwrap_or_else(|_| current_tid())
}

#[cfg(target_os = "linux")]
fn current_tid() -> u32 {
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

/// Monotonic milliseconds since an arbitrary origin, stamped into block
/// trailers at free time so reports can order frees.
pub fn tick_count() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1000 + (ts.tv_nsec as u64) / 1_000_000
}

/// Fast non-cryptographic randomness for the allocation guard-rate draw:
/// splitmix64 over a per-thread Weyl sequence. Each thread's stream is
/// seeded from its id, the clock, and a stack address, so streams differ
/// across threads and runs.
pub fn random_u64() -> u64 {
    thread_local! {
        static WEYL_STATE: Cell<u64> = const { Cell::new(0) };
    }

    WEYL_STATE
        .try_with(|state| {
            let mut x = state.get();
            if x == 0 {
                let stack_probe = &x as *const _ as u64;
                x = (thread_id() as u64) << 32 ^ tick_count() ^ stack_probe | 1;
            }
            x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
            state.set(x);
            crate::util::splitmix64(x)
        })
        .unwrap_or_else(|_| crate::util::splitmix64(tick_count() | 1))
}

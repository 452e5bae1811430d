//! The lock used by the runtime's own structures: quarantine shards, the
//! page-protection bitmap, heap region tables, the stack cache.
//!
//! Two constraints rule out `std::sync::Mutex`. Locks here sit on
//! allocation paths, so acquiring one must never allocate (that would
//! re-enter the runtime). And the heap checker walks heaps with a
//! try-only acquire, skipping any lock user code holds rather than ever
//! waiting on it.
//!
//! The critical sections guarded here are tiny (a ring push, a bitmap
//! flip, a table probe), so contention is ridden out with a short spin
//! before falling back to a futex sleep.

use core::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const HELD: u32 = 1;
/// Held, with at least one sleeper to wake on release.
const CONTENDED: u32 = 2;

/// Spins attempted before sleeping in the kernel.
const SPIN_LIMIT: u32 = 64;

pub struct RawMutex {
    state: AtomicU32,
}

impl RawMutex {
    pub const fn new() -> Self {
        RawMutex {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    #[inline]
    pub fn lock(&self) {
        if self
            .state
            .compare_exchange_weak(UNLOCKED, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended();
        }
    }

    /// Acquire without ever blocking. The heap checker's lock-all is built
    /// on this: a refusal means the heap is skipped, not waited for.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex_wake_one(&self.state);
        }
    }

    #[cold]
    fn lock_contended(&self) {
        let mut spins = 0;
        while spins < SPIN_LIMIT {
            if self.state.load(Ordering::Relaxed) == UNLOCKED
                && self
                    .state
                    .compare_exchange_weak(UNLOCKED, HELD, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            core::hint::spin_loop();
            spins += 1;
        }

        // Announce a sleeper by pinning the state to CONTENDED. Whoever
        // acquires through this path also holds it as CONTENDED, so a
        // release during the handoff still wakes the next sleeper.
        while self.state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            futex_wait(&self.state, CONTENDED);
        }
    }
}

#[cfg(target_os = "linux")]
fn futex_wait(state: &AtomicU32, expected: u32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            state as *const AtomicU32,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            core::ptr::null::<libc::timespec>(),
        );
    }
}

#[cfg(target_os = "linux")]
fn futex_wake_one(state: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            state as *const AtomicU32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            1u32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wait(_state: &AtomicU32, _expected: u32) {
    core::hint::spin_loop();
}

#[cfg(not(target_os = "linux"))]
fn futex_wake_one(_state: &AtomicU32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::UnsafeCell;
    use std::sync::Arc;

    #[test]
    fn try_lock_refuses_a_held_lock() {
        let mutex = RawMutex::new();
        mutex.lock();
        assert!(!mutex.try_lock());
        mutex.unlock();
        assert!(mutex.try_lock());
        assert!(!mutex.try_lock());
        mutex.unlock();
    }

    struct Shared {
        mutex: RawMutex,
        value: UnsafeCell<usize>,
    }
    unsafe impl Sync for Shared {}

    #[test]
    fn serializes_writers_under_contention() {
        const THREADS: usize = 8;
        const INCREMENTS: usize = 10_000;

        let shared = Arc::new(Shared {
            mutex: RawMutex::new(),
            value: UnsafeCell::new(0),
        });

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for _ in 0..INCREMENTS {
                        shared.mutex.lock();
                        unsafe { *shared.value.get() += 1 };
                        shared.mutex.unlock();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        shared.mutex.lock();
        let total = unsafe { *shared.value.get() };
        shared.mutex.unlock();
        assert_eq!(total, THREADS * INCREMENTS);
    }
}

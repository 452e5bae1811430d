//! Stack-capture cache.
//!
//! Every guarded allocation and free records the capturing call site as a
//! stable 32-bit stack ID. Frames are walked through `backtrace`'s
//! callback API (no allocation on the capture path) and interned into an
//! open-addressing table backed by mapped pages, so identical stacks map
//! to identical IDs for the lifetime of the process.

use crate::config::MAX_STACK_FRAMES;
use crate::sync::RawMutex;
use crate::util::splitmix64;
use crate::{platform, report::log};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

pub type StackId = u32;

/// Interned stack table capacity. Must be a power of two.
const TABLE_CAPACITY: usize = 8192;

/// Bump region for frame storage.
const FRAME_REGION_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone, Copy)]
#[repr(C)]
struct StackEntry {
    /// Stack ID (0 = empty slot).
    id: StackId,
    frame_count: u32,
    /// Offset into the frame region, in frames.
    frame_offset: usize,
}

struct CacheInner {
    entries: *mut StackEntry,
    frames: *mut usize,
    frames_used: usize,
    count: usize,
}

pub struct StackCaptureCache {
    lock: RawMutex,
    inner: UnsafeCell<CacheInner>,
    max_frames: AtomicUsize,
    bottom_frames_to_skip: AtomicUsize,
}

unsafe impl Send for StackCaptureCache {}
unsafe impl Sync for StackCaptureCache {}

impl StackCaptureCache {
    pub const fn new() -> Self {
        StackCaptureCache {
            lock: RawMutex::new(),
            inner: UnsafeCell::new(CacheInner {
                entries: core::ptr::null_mut(),
                frames: core::ptr::null_mut(),
                frames_used: 0,
                count: 0,
            }),
            max_frames: AtomicUsize::new(32),
            bottom_frames_to_skip: AtomicUsize::new(0),
        }
    }

    /// Map the intern table and frame region.
    ///
    /// # Safety
    /// Must be called once, before any capture, from a single-threaded
    /// context.
    pub unsafe fn init(&self) -> bool {
        let inner = &mut *self.inner.get();
        let table_bytes = TABLE_CAPACITY * core::mem::size_of::<StackEntry>();
        let Some(entries) = platform::map_runtime_pages(table_bytes) else {
            return false;
        };
        let Some(frames) = platform::map_runtime_pages(FRAME_REGION_BYTES) else {
            platform::unmap_pages(entries as usize, table_bytes);
            return false;
        };
        inner.entries = entries as *mut StackEntry;
        inner.frames = frames as *mut usize;
        true
    }

    pub fn set_max_frames(&self, max: usize) {
        self.max_frames
            .store(max.min(MAX_STACK_FRAMES), Ordering::Relaxed);
    }

    pub fn set_bottom_frames_to_skip(&self, skip: usize) {
        self.bottom_frames_to_skip.store(skip, Ordering::Relaxed);
    }

    /// Capture the current call stack and return its stable ID.
    pub fn capture(&self) -> StackId {
        let mut frames = [0usize; MAX_STACK_FRAMES];
        let mut collected = 0usize;

        backtrace::trace(|frame| {
            if collected < MAX_STACK_FRAMES {
                frames[collected] = frame.ip() as usize;
                collected += 1;
                true
            } else {
                false
            }
        });

        // Bottom frames (the main() side) are trimmed first, then the
        // capture is truncated to the configured depth.
        let skip = self.bottom_frames_to_skip.load(Ordering::Relaxed);
        let kept = collected.saturating_sub(skip);
        let kept = kept.min(self.max_frames.load(Ordering::Relaxed));
        let frames = &frames[..kept];

        let id = hash_frames(frames);
        self.intern(id, frames);
        id
    }

    fn intern(&self, id: StackId, frames: &[usize]) {
        self.lock.lock();
        unsafe {
            let inner = &mut *self.inner.get();
            if !inner.entries.is_null() {
                Self::intern_inner(inner, id, frames);
            }
        }
        self.lock.unlock();
    }

    unsafe fn intern_inner(inner: &mut CacheInner, id: StackId, frames: &[usize]) {
        let mask = TABLE_CAPACITY - 1;
        let mut idx = splitmix64(id as u64) as usize & mask;
        loop {
            let entry = &mut *inner.entries.add(idx);
            if entry.id == id {
                return; // Already interned.
            }
            if entry.id == 0 {
                // Refuse inserts past 75% load; the ID stays valid, the
                // frames are just not retrievable.
                if inner.count * 4 >= TABLE_CAPACITY * 3 {
                    return;
                }
                let frame_capacity = FRAME_REGION_BYTES / core::mem::size_of::<usize>();
                if inner.frames_used + frames.len() > frame_capacity {
                    log!("stack cache frame region exhausted");
                    return;
                }
                core::ptr::copy_nonoverlapping(
                    frames.as_ptr(),
                    inner.frames.add(inner.frames_used),
                    frames.len(),
                );
                entry.id = id;
                entry.frame_count = frames.len() as u32;
                entry.frame_offset = inner.frames_used;
                inner.frames_used += frames.len();
                inner.count += 1;
                return;
            }
            idx = (idx + 1) & mask;
        }
    }

    /// Copy the frames of an interned stack into `out`, returning how many
    /// were written. Unknown IDs yield zero.
    pub fn copy_frames(&self, id: StackId, out: &mut [usize]) -> usize {
        if id == 0 {
            return 0;
        }
        self.lock.lock();
        let copied = unsafe {
            let inner = &*self.inner.get();
            if inner.entries.is_null() {
                0
            } else {
                Self::lookup_and_copy(inner, id, out)
            }
        };
        self.lock.unlock();
        copied
    }

    unsafe fn lookup_and_copy(inner: &CacheInner, id: StackId, out: &mut [usize]) -> usize {
        let mask = TABLE_CAPACITY - 1;
        let mut idx = splitmix64(id as u64) as usize & mask;
        loop {
            let entry = &*inner.entries.add(idx);
            if entry.id == id {
                let n = (entry.frame_count as usize).min(out.len());
                core::ptr::copy_nonoverlapping(inner.frames.add(entry.frame_offset), out.as_mut_ptr(), n);
                return n;
            }
            if entry.id == 0 {
                return 0;
            }
            idx = (idx + 1) & mask;
        }
    }
}

/// Hash a frame list to a non-zero stack ID.
fn hash_frames(frames: &[usize]) -> StackId {
    let mut acc: u64 = 0x57AC_CAFE;
    for &f in frames {
        acc = splitmix64(acc ^ f as u64);
    }
    let id = (acc ^ (acc >> 32)) as u32;
    if id == 0 {
        1
    } else {
        id
    }
}

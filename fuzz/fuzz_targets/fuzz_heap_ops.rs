#![no_main]

use blockguard::error::{AccessMode, ErrorInfo};
use blockguard::heap_manager::BlockHeapManager;
use blockguard::runtime::Runtime;
use blockguard::shadow::Shadow;
use blockguard::stack_cache::StackCaptureCache;
use libfuzzer_sys::fuzz_target;
use std::sync::OnceLock;

/// Fuzz target that interprets a byte slice as a sequence of heap
/// operations against the block heap manager.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=alloc, 1=free, 2=size, 3=access check)
///   byte 1-2: size / offset (little-endian u16)
///   byte 3: slot index (which tracked pointer to operate on)
///
/// We track up to 64 live pointers. Error reports are swallowed by a
/// no-op callback; the properties under test are "no crash" and "no
/// abort from a malformed shadow".
const MAX_SLOTS: usize = 64;

fn swallow_errors(_error: &mut ErrorInfo) {}

struct Fixture {
    manager: &'static BlockHeapManager,
    runtime: &'static Runtime,
}

static FIXTURE: OnceLock<Fixture> = OnceLock::new();

fn fixture() -> &'static Fixture {
    FIXTURE.get_or_init(|| {
        let mut shadow = Box::new(Shadow::new());
        assert!(unsafe { shadow.init() });
        let shadow: &'static Shadow = Box::leak(shadow);
        let stack_cache: &'static StackCaptureCache = Box::leak(Box::new(StackCaptureCache::new()));
        assert!(unsafe { stack_cache.init() });
        let manager: &'static BlockHeapManager =
            Box::leak(Box::new(BlockHeapManager::new(shadow, stack_cache)));
        manager.set_error_callback(swallow_errors);
        unsafe { manager.init() };
        let runtime: &'static Runtime =
            Box::leak(Box::new(Runtime::new(shadow, stack_cache, manager)));
        runtime.set_error_callback(swallow_errors);
        Fixture { manager, runtime }
    })
}

fuzz_target!(|data: &[u8]| {
    let f = fixture();
    let heap = f.manager.process_heap();
    let mut slots: [usize; MAX_SLOTS] = [0; MAX_SLOTS];
    let mut sizes: [usize; MAX_SLOTS] = [0; MAX_SLOTS];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] & 0x03;
        let value = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        i += 4;

        match opcode {
            0 => {
                // alloc
                if slots[slot] != 0 {
                    f.manager.free(heap, slots[slot]);
                }
                slots[slot] = f.manager.allocate(heap, value);
                sizes[slot] = value;
                if slots[slot] != 0 && value > 0 {
                    unsafe {
                        core::ptr::write_bytes(
                            slots[slot] as *mut u8,
                            0xAA,
                            value.min(256),
                        );
                    }
                }
            }
            1 => {
                // free
                if slots[slot] != 0 {
                    assert!(f.manager.free(heap, slots[slot]));
                    slots[slot] = 0;
                }
            }
            2 => {
                // size: live allocations must report at least what was asked
                if slots[slot] != 0 {
                    let reported = f.manager.allocation_size(heap, slots[slot]);
                    assert!(
                        reported >= sizes[slot],
                        "live allocation shrank: asked {}, reported {}",
                        sizes[slot],
                        reported
                    );
                }
            }
            3 => {
                // access check at an arbitrary offset into/near the slot;
                // bad offsets produce reports, never crashes
                if slots[slot] != 0 {
                    let addr = slots[slot].wrapping_add(value % 512).wrapping_sub(64);
                    f.runtime.check_access(addr, AccessMode::Read, 1);
                }
            }
            _ => unreachable!(),
        }
    }

    // Cleanup
    for slot in &mut slots {
        if *slot != 0 {
            f.manager.free(heap, *slot);
            *slot = 0;
        }
    }
});

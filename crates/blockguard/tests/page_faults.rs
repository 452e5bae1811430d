//! Hardware-fault detection tests.
//!
//! Faults on protected redzone/quarantine pages kill the process after
//! the runtime has logged its classification, so these scenarios run as
//! subprocesses: we spawn the test binary with a scenario name in the
//! environment and check that the child dies by signal after printing the
//! expected standardized report line.

use std::os::unix::process::ExitStatusExt;

const SCENARIO_VAR: &str = "BLOCKGUARD_FAULT_SCENARIO";

fn expect_fault_subprocess(scenario_name: &str, expected_msg: &str) {
    let exe = std::env::current_exe().expect("cannot determine test binary path");

    let output = std::process::Command::new(&exe)
        .env(SCENARIO_VAR, scenario_name)
        .arg("--exact")
        .arg("scenario_driver")
        .arg("--nocapture")
        .env("RUST_TEST_THREADS", "1")
        .output()
        .expect("failed to spawn subprocess");

    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(
        !output.status.success(),
        "subprocess for scenario '{}' should have died, but exited cleanly. stderr:\n{}",
        scenario_name,
        stderr
    );
    assert!(
        output.status.signal().is_some(),
        "subprocess for scenario '{}' should have been killed by a signal. stderr:\n{}",
        scenario_name,
        stderr
    );
    assert!(
        stderr.contains(expected_msg),
        "subprocess stderr for scenario '{}' does not contain '{}'. Full stderr:\n{}",
        scenario_name,
        expected_msg,
        stderr
    );
}

// ---------------------------------------------------------------------------
// Scenario driver: runs inside the subprocess.
// ---------------------------------------------------------------------------

#[test]
fn scenario_driver() {
    let scenario = match std::env::var(SCENARIO_VAR) {
        Ok(s) => s,
        Err(_) => return, // Not a subprocess invocation; skip.
    };

    match scenario.as_str() {
        "large_overflow" => scenario_large_overflow(),
        "large_underflow" => scenario_large_underflow(),
        "zebra_use_after_free" => scenario_zebra_use_after_free(),
        "zebra_overflow" => scenario_zebra_overflow(),
        other => panic!("unknown scenario: {}", other),
    }
}

/// Overflow off the end of a large block's body into its protected
/// right-redzone page.
fn scenario_large_overflow() {
    assert!(unsafe { blockguard::init::initialize(None) });
    let manager = blockguard::init::manager();
    let heap = manager.process_heap();

    let body_size = 2 * blockguard::util::PAGE_SIZE;
    let p = manager.allocate(heap, body_size);
    assert_ne!(p, 0);

    unsafe { core::ptr::write_volatile((p + body_size) as *mut u8, 0xFF) };
    unreachable!("overflow into the protected redzone was not caught");
}

/// Underflow into a large block's protected header page.
fn scenario_large_underflow() {
    assert!(unsafe { blockguard::init::initialize(None) });
    let manager = blockguard::init::manager();
    let heap = manager.process_heap();

    let body_size = 2 * blockguard::util::PAGE_SIZE;
    let p = manager.allocate(heap, body_size);
    assert_ne!(p, 0);

    let _ = unsafe { core::ptr::read_volatile((p - blockguard::util::PAGE_SIZE + 8) as *const u8) };
    unreachable!("underflow into the protected header page was not caught");
}

/// Read through a stale pointer into a quarantined zebra slot.
fn scenario_zebra_use_after_free() {
    assert!(unsafe { blockguard::init::initialize(Some(b"enable_zebra_block_heap")) });
    let manager = blockguard::init::manager();
    let heap = manager.process_heap();

    let p = manager.allocate(heap, 64);
    assert_ne!(p, 0);
    assert!(manager.free(heap, p));

    let _ = unsafe { core::ptr::read_volatile(p as *const u8) };
    unreachable!("use-after-free on the protected zebra slot was not caught");
}

/// Overflow off the end of a zebra block into its guard page.
fn scenario_zebra_overflow() {
    assert!(unsafe { blockguard::init::initialize(Some(b"enable_zebra_block_heap")) });
    let manager = blockguard::init::manager();
    let heap = manager.process_heap();

    let p = manager.allocate(heap, 64);
    assert_ne!(p, 0);
    let compact = manager
        .shadow()
        .block_info_from_shadow(p)
        .expect("zebra block must be discoverable from the shadow");

    // One byte past the whole block: the first byte of the guard page.
    let guard = compact.block + compact.block_size;
    unsafe { core::ptr::write_volatile(guard as *mut u8, 0xFF) };
    unreachable!("overflow into the zebra guard page was not caught");
}

// ---------------------------------------------------------------------------
// The actual tests.
// ---------------------------------------------------------------------------

#[test]
fn large_block_overflow_faults_as_overflow() {
    expect_fault_subprocess("large_overflow", "heap-buffer-overflow");
}

#[test]
fn large_block_underflow_faults_as_underflow() {
    expect_fault_subprocess("large_underflow", "heap-buffer-underflow");
}

#[test]
fn zebra_use_after_free_faults() {
    expect_fault_subprocess("zebra_use_after_free", "heap-use-after-free");
}

#[test]
fn zebra_overflow_dies_by_guard_page() {
    // The guard page is outside any block, so the runtime does not claim
    // the fault; the process still dies on it instead of corrupting the
    // neighbour slot.
    let exe = std::env::current_exe().expect("cannot determine test binary path");
    let output = std::process::Command::new(&exe)
        .env(SCENARIO_VAR, "zebra_overflow")
        .arg("--exact")
        .arg("scenario_driver")
        .arg("--nocapture")
        .env("RUST_TEST_THREADS", "1")
        .output()
        .expect("failed to spawn subprocess");
    assert!(!output.status.success());
    assert!(output.status.signal().is_some());
}

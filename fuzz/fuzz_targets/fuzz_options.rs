#![no_main]

use blockguard::config::{parse_options, RuntimeParams};
use libfuzzer_sys::fuzz_target;

/// Fuzz the option-string parser: arbitrary bytes must never panic, and
/// the resulting parameters must stay within their documented ranges.
fuzz_target!(|data: &[u8]| {
    let mut params = RuntimeParams::default_params();
    let _ = parse_options(data, &mut params);

    assert!((0.0..=1.0).contains(&params.allocation_guard_rate));
    assert!(params.max_num_frames <= blockguard::config::MAX_STACK_FRAMES);
    assert!(params.ignored_stack_id_count <= params.ignored_stack_ids.len());
});

//! Runtime parameters and their parser.
//!
//! Options arrive as a whitespace-separated string handed to the runtime at
//! startup, and can be overridden through the `BLOCKGUARD_OPTIONS`
//! environment variable. Parsing never allocates: it walks the raw bytes so
//! it is safe to run before the heap manager exists.

use crate::report::log;

/// Name of the environment variable carrying option overrides.
pub const OPTIONS_ENV_VAR: &[u8] = b"BLOCKGUARD_OPTIONS\0";

/// Maximum number of allocation-site stack IDs that can be suppressed.
pub const MAX_IGNORED_STACK_IDS: usize = 16;

/// Upper bound on captured stack depth.
pub const MAX_STACK_FRAMES: usize = 64;

/// The full parameter set of the runtime. Every field has the documented
/// default; `parse_options` mutates a copy in place.
#[derive(Clone, Copy)]
pub struct RuntimeParams {
    /// Global quarantine byte budget.
    pub quarantine_size: usize,
    /// Per-block quarantine cap.
    pub quarantine_block_size: usize,
    /// When set, the quarantine is never trimmed.
    pub unlimited_quarantine: bool,
    /// Stack-trace depth.
    pub max_num_frames: usize,
    /// Trim N frames off the bottom of each capture.
    pub bottom_frames_to_skip: usize,
    /// Probability that an allocation is wrapped in a guarded block.
    pub allocation_guard_rate: f64,
    /// Run the heap checker when an error is detected.
    pub check_heap_on_failure: bool,
    /// Activate the zebra sub-heap.
    pub enable_zebra_block_heap: bool,
    /// Gate the zebra heap on the thread-local allocation-filter flag.
    pub enable_allocation_filter: bool,
    pub disable_large_block_heap: bool,
    /// Accepted for command-line compatibility; no alternative small-block
    /// allocator is built in.
    pub disable_ctmalloc: bool,
    /// Terminate the process after the first error.
    pub exit_on_failure: bool,
    /// Emit a minidump through the registered hook on failure.
    pub minidump_on_failure: bool,
    /// Allocation-site stack IDs whose reports are suppressed.
    pub ignored_stack_ids: [u32; MAX_IGNORED_STACK_IDS],
    pub ignored_stack_id_count: usize,
}

impl RuntimeParams {
    pub const fn default_params() -> Self {
        RuntimeParams {
            quarantine_size: 16 * 1024 * 1024,
            quarantine_block_size: 4 * 1024 * 1024,
            unlimited_quarantine: false,
            max_num_frames: 32,
            bottom_frames_to_skip: 0,
            allocation_guard_rate: 1.0,
            check_heap_on_failure: true,
            enable_zebra_block_heap: false,
            enable_allocation_filter: false,
            disable_large_block_heap: false,
            disable_ctmalloc: false,
            exit_on_failure: false,
            minidump_on_failure: true,
            ignored_stack_ids: [0; MAX_IGNORED_STACK_IDS],
            ignored_stack_id_count: 0,
        }
    }

    /// True if reports for this allocation-site stack ID are suppressed.
    pub fn stack_id_is_ignored(&self, stack_id: u32) -> bool {
        self.ignored_stack_ids[..self.ignored_stack_id_count].contains(&stack_id)
    }
}

impl Default for RuntimeParams {
    fn default() -> Self {
        Self::default_params()
    }
}

/// Parse a whitespace-separated option string into `params`.
///
/// Unknown options reject the whole parse (already-applied options are
/// kept, matching the original runtime's early-return). Malformed values
/// fall back to the current value of the field, clamped where applicable,
/// with a logged warning.
pub fn parse_options(input: &[u8], params: &mut RuntimeParams) -> bool {
    for token in input.split(|&b| b.is_ascii_whitespace()) {
        if token.is_empty() {
            continue;
        }
        if !parse_token(token, params) {
            return false;
        }
    }
    true
}

/// Apply overrides from `BLOCKGUARD_OPTIONS`, if set.
///
/// # Safety
/// Calls `libc::getenv`, which is not thread-safe; must run during
/// single-threaded init.
pub unsafe fn apply_env_options(params: &mut RuntimeParams) -> bool {
    let val = libc::getenv(OPTIONS_ENV_VAR.as_ptr() as *const libc::c_char);
    if val.is_null() {
        return true;
    }
    let len = libc::strlen(val);
    let bytes = core::slice::from_raw_parts(val as *const u8, len);
    parse_options(bytes, params)
}

fn parse_token(token: &[u8], params: &mut RuntimeParams) -> bool {
    let (key, value) = match token.iter().position(|&b| b == b'=') {
        Some(i) => (&token[..i], Some(&token[i + 1..])),
        None => (token, None),
    };

    match key {
        b"quarantine_size" => {
            params.quarantine_size =
                parse_usize_or(value, params.quarantine_size, "quarantine_size")
        }
        b"quarantine_block_size" => {
            params.quarantine_block_size =
                parse_usize_or(value, params.quarantine_block_size, "quarantine_block_size")
        }
        b"unlimited_quarantine" => {
            params.unlimited_quarantine =
                parse_bool_or(value, true, "unlimited_quarantine")
        }
        b"max_num_frames" => {
            let frames = parse_usize_or(value, params.max_num_frames, "max_num_frames");
            params.max_num_frames = if frames > MAX_STACK_FRAMES {
                log!("max_num_frames clamped to {}", MAX_STACK_FRAMES);
                MAX_STACK_FRAMES
            } else {
                frames
            };
        }
        b"bottom_frames_to_skip" => {
            params.bottom_frames_to_skip =
                parse_usize_or(value, params.bottom_frames_to_skip, "bottom_frames_to_skip")
        }
        b"allocation_guard_rate" => {
            let rate = parse_f64_or(value, params.allocation_guard_rate, "allocation_guard_rate");
            params.allocation_guard_rate = if !(0.0..=1.0).contains(&rate) {
                log!("allocation_guard_rate clamped to [0, 1]");
                rate.clamp(0.0, 1.0)
            } else {
                rate
            };
        }
        b"check_heap_on_failure" => {
            params.check_heap_on_failure = parse_bool_or(value, true, "check_heap_on_failure")
        }
        b"enable_zebra_block_heap" => {
            params.enable_zebra_block_heap = parse_bool_or(value, true, "enable_zebra_block_heap")
        }
        b"enable_allocation_filter" => {
            params.enable_allocation_filter =
                parse_bool_or(value, true, "enable_allocation_filter")
        }
        b"disable_large_block_heap" => {
            params.disable_large_block_heap =
                parse_bool_or(value, true, "disable_large_block_heap")
        }
        b"disable_ctmalloc" => {
            params.disable_ctmalloc = parse_bool_or(value, true, "disable_ctmalloc")
        }
        b"exit_on_failure" => {
            params.exit_on_failure = parse_bool_or(value, true, "exit_on_failure")
        }
        b"minidump_on_failure" => {
            params.minidump_on_failure = parse_bool_or(value, true, "minidump_on_failure")
        }
        b"ignored_stack_ids" => parse_stack_ids(value, params),
        _ => {
            log!("unknown option rejected");
            return false;
        }
    }
    true
}

fn parse_usize(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }
    let mut result: usize = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            return None;
        }
        result = result
            .checked_mul(10)?
            .checked_add((b - b'0') as usize)?;
    }
    Some(result)
}

fn parse_usize_or(value: Option<&[u8]>, fallback: usize, name: &str) -> usize {
    match value.and_then(parse_usize) {
        Some(v) => v,
        None => {
            log!("malformed value for {}, keeping {}", name, fallback);
            fallback
        }
    }
}

fn parse_bool(bytes: &[u8]) -> Option<bool> {
    match bytes {
        b"1" | b"true" => Some(true),
        b"0" | b"false" => Some(false),
        _ => None,
    }
}

fn parse_bool_or(value: Option<&[u8]>, bare: bool, name: &str) -> bool {
    match value {
        // A bare flag means "enable".
        None => bare,
        Some(v) => match parse_bool(v) {
            Some(b) => b,
            None => {
                log!("malformed value for {}, keeping {}", name, bare);
                bare
            }
        },
    }
}

/// Parse a non-negative decimal float of the form `int[.frac]`.
fn parse_f64(bytes: &[u8]) -> Option<f64> {
    let (int_part, frac_part) = match bytes.iter().position(|&b| b == b'.') {
        Some(i) => (&bytes[..i], Some(&bytes[i + 1..])),
        None => (bytes, None),
    };
    let mut value = parse_usize(int_part)? as f64;
    if let Some(frac) = frac_part {
        if frac.is_empty() {
            return None;
        }
        let digits = parse_usize(frac)? as f64;
        value += digits / 10f64.powi(frac.len() as i32);
    }
    Some(value)
}

fn parse_f64_or(value: Option<&[u8]>, fallback: f64, name: &str) -> f64 {
    match value.and_then(parse_f64) {
        Some(v) => v,
        None => {
            log!("malformed value for {}, keeping {}", name, fallback);
            fallback
        }
    }
}

/// Parse a comma-separated list of hex stack IDs (with or without `0x`).
fn parse_stack_ids(value: Option<&[u8]>, params: &mut RuntimeParams) {
    let Some(list) = value else {
        log!("malformed value for ignored_stack_ids, keeping current list");
        return;
    };
    for id_bytes in list.split(|&b| b == b',') {
        let id_bytes = id_bytes.strip_prefix(b"0x").unwrap_or(id_bytes);
        let Some(id) = parse_hex_u32(id_bytes) else {
            log!("malformed stack id in ignored_stack_ids, skipping entry");
            continue;
        };
        if params.ignored_stack_id_count >= MAX_IGNORED_STACK_IDS {
            log!("too many ignored_stack_ids, dropping the rest");
            return;
        }
        params.ignored_stack_ids[params.ignored_stack_id_count] = id;
        params.ignored_stack_id_count += 1;
    }
}

fn parse_hex_u32(bytes: &[u8]) -> Option<u32> {
    if bytes.is_empty() || bytes.len() > 8 {
        return None;
    }
    let mut result: u32 = 0;
    for &b in bytes {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return None,
        };
        result = (result << 4) | digit as u32;
    }
    Some(result)
}

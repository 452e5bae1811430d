//! Shadow-byte marker values and predicates.
//!
//! One shadow byte summarizes 8 application bytes. Values 0..=7 encode
//! partial accessibility (0 = all 8 bytes addressable, N = first N bytes
//! addressable); everything above is a redzone marker of some flavor.
//! Block-start markers carry the body size modulo the shadow ratio in
//! their low three bits and a nesting bit, so block extents and exact body
//! sizes can be reconstructed from the shadow alone.

/// All 8 application bytes are addressable.
pub const ADDRESSABLE: u8 = 0x00;

/// Highest partial-accessibility value: first 7 bytes addressable.
pub const PARTIALLY_ADDRESSABLE_MAX: u8 = 0x07;

/// First shadow byte of a top-level block header. Low 3 bits carry
/// `body_size % 8`; covers 0xE0..=0xE7.
pub const BLOCK_START_0: u8 = 0xE0;

/// First shadow byte of a nested block header; covers 0xE8..=0xEF.
pub const NESTED_BLOCK_START_0: u8 = 0xE8;

/// Memory internal to the runtime itself.
pub const RUNTIME_MEMORY: u8 = 0xF1;

/// Statically invalid addresses (the low 64 KiB, non-canonical ranges).
pub const INVALID_ADDRESS: u8 = 0xF2;

/// Memory poisoned explicitly by the user.
pub const USER_REDZONE: u8 = 0xF3;

/// Last shadow byte of a top-level block trailer.
pub const BLOCK_END: u8 = 0xF4;

/// Last shadow byte of a nested block trailer.
pub const NESTED_BLOCK_END: u8 = 0xF5;

/// Header padding / left redzone of a block.
pub const LEFT_REDZONE: u8 = 0xFA;

/// Trailer padding / right redzone of a block.
pub const RIGHT_REDZONE: u8 = 0xFB;

/// Reserved for future use.
pub const RESERVED: u8 = 0xFC;

/// Body of a freed (quarantined) block.
pub const FREED: u8 = 0xFD;

const NESTED_BIT: u8 = 0x08;
const BLOCK_START_MASK: u8 = 0xF0;

/// Any marker that denies full access to its granule.
#[inline(always)]
pub fn is_redzone(marker: u8) -> bool {
    marker > PARTIALLY_ADDRESSABLE_MAX
}

#[inline(always)]
pub fn is_block_start(marker: u8) -> bool {
    marker & BLOCK_START_MASK == BLOCK_START_0
}

#[inline(always)]
pub fn is_nested_block_start(marker: u8) -> bool {
    marker & !0x07 == NESTED_BLOCK_START_0
}

/// The `body_size % 8` bits stored in a block-start marker.
#[inline(always)]
pub fn block_start_data(marker: u8) -> u8 {
    debug_assert!(is_block_start(marker));
    marker & 0x07
}

#[inline(always)]
pub fn build_block_start(is_nested: bool, body_size_mod: u8) -> u8 {
    debug_assert!(body_size_mod < 8);
    let nested = if is_nested { NESTED_BIT } else { 0 };
    BLOCK_START_0 | nested | body_size_mod
}

#[inline(always)]
pub fn is_block_end(marker: u8) -> bool {
    marker == BLOCK_END || marker == NESTED_BLOCK_END
}

#[inline(always)]
pub fn is_nested_block_end(marker: u8) -> bool {
    marker == NESTED_BLOCK_END
}

#[inline(always)]
pub fn build_block_end(is_nested: bool) -> u8 {
    if is_nested {
        NESTED_BLOCK_END
    } else {
        BLOCK_END
    }
}

/// Left redzone of a live block: its start marker or header padding.
#[inline(always)]
pub fn is_active_left_redzone(marker: u8) -> bool {
    is_block_start(marker) || marker == LEFT_REDZONE
}

/// Right redzone of a live block: its end marker or trailer padding.
#[inline(always)]
pub fn is_active_right_redzone(marker: u8) -> bool {
    is_block_end(marker) || marker == RIGHT_REDZONE
}

/// Any marker belonging to a block the heaps still know about. These are
/// the markers the exception filter is willing to claim a fault for.
#[inline(always)]
pub fn is_active_block(marker: u8) -> bool {
    is_active_left_redzone(marker) || is_active_right_redzone(marker) || marker == FREED
}

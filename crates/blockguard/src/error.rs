//! Error taxonomy and the record handed to the error callback.

use crate::block::{self, CompactBlockInfo};
use crate::shadow::{marker, Shadow};
use crate::report::BufWriter;

/// The kinds of memory errors the runtime reports.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BadAccessKind {
    UnknownBadAccess,
    /// Access outside the valid user address range.
    WildAccess,
    /// Access into the low 64 KiB or another statically-invalid range.
    InvalidAddress,
    UseAfterFree,
    HeapBufferOverflow,
    HeapBufferUnderflow,
    DoubleFree,
    /// Checksum or magic mismatch on a specific block.
    CorruptBlock,
    /// A heap-checker sweep found corruption not tied to a specific access.
    CorruptHeap,
}

/// Stable, documented report strings. External harnesses match on these
/// exact values, so they are part of the runtime's interface:
///
/// | kind | string |
/// |---|---|
/// | `UnknownBadAccess` | `unknown-bad-access` |
/// | `WildAccess` | `wild-access` |
/// | `InvalidAddress` | `invalid-address` |
/// | `UseAfterFree` | `heap-use-after-free` |
/// | `HeapBufferOverflow` | `heap-buffer-overflow` |
/// | `HeapBufferUnderflow` | `heap-buffer-underflow` |
/// | `DoubleFree` | `attempting double-free` |
/// | `CorruptBlock` | `corrupt-block` |
/// | `CorruptHeap` | `corrupt-heap` |
pub fn kind_to_str(kind: BadAccessKind) -> &'static str {
    match kind {
        BadAccessKind::UnknownBadAccess => "unknown-bad-access",
        BadAccessKind::WildAccess => "wild-access",
        BadAccessKind::InvalidAddress => "invalid-address",
        BadAccessKind::UseAfterFree => "heap-use-after-free",
        BadAccessKind::HeapBufferOverflow => "heap-buffer-overflow",
        BadAccessKind::HeapBufferUnderflow => "heap-buffer-underflow",
        BadAccessKind::DoubleFree => "attempting double-free",
        BadAccessKind::CorruptBlock => "corrupt-block",
        BadAccessKind::CorruptHeap => "corrupt-heap",
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessMode {
    Read,
    Write,
    Unknown,
}

pub fn access_mode_to_str(mode: AccessMode) -> &'static str {
    match mode {
        AccessMode::Read => "READ",
        AccessMode::Write => "WRITE",
        AccessMode::Unknown => "UNKNOWN",
    }
}

/// Snapshot of the faulting CPU state. Filled from the signal context on
/// hardware faults; explicit check entry points record their caller.
#[derive(Clone, Copy, Default, Debug)]
pub struct CpuContext {
    pub ip: usize,
    pub sp: usize,
    pub bp: usize,
}

/// A contiguous run of corrupt blocks, reported as a unit.
#[derive(Clone, Copy)]
pub struct CorruptRange {
    pub address: usize,
    pub length: usize,
    pub block_count: usize,
    /// The first corrupt block of the range.
    pub representative: CompactBlockInfo,
}

pub const MAX_CORRUPT_RANGES: usize = 32;
pub const SHADOW_TEXT_CAPACITY: usize = 2048;

/// Everything known about one reported error. Built on the stack of the
/// reporting thread and handed to the error callback by reference.
pub struct ErrorInfo {
    pub kind: BadAccessKind,
    pub access_mode: AccessMode,
    pub access_size: usize,
    pub address: usize,
    pub context: CpuContext,

    /// The block surrounding the faulting address, when one exists.
    pub block_info: Option<CompactBlockInfo>,
    pub block_is_corrupt: bool,
    pub alloc_stack_id: u32,
    pub alloc_tid: u32,
    pub free_stack_id: u32,
    pub free_tid: u32,
    pub free_ticks: u64,

    pub heap_is_corrupt: bool,
    pub corrupt_ranges: [CorruptRange; MAX_CORRUPT_RANGES],
    pub corrupt_range_count: usize,

    /// Rendered shadow excerpt around the faulting address.
    pub shadow_text: [u8; SHADOW_TEXT_CAPACITY],
    pub shadow_text_len: usize,
}

impl ErrorInfo {
    pub fn new(kind: BadAccessKind, address: usize) -> ErrorInfo {
        const EMPTY_RANGE: CorruptRange = CorruptRange {
            address: 0,
            length: 0,
            block_count: 0,
            representative: CompactBlockInfo {
                block: 0,
                block_size: 0,
                header_size: 0,
                trailer_size: 0,
                is_nested: false,
            },
        };
        ErrorInfo {
            kind,
            access_mode: AccessMode::Unknown,
            access_size: 0,
            address,
            context: CpuContext::default(),
            block_info: None,
            block_is_corrupt: false,
            alloc_stack_id: 0,
            alloc_tid: 0,
            free_stack_id: 0,
            free_tid: 0,
            free_ticks: 0,
            heap_is_corrupt: false,
            corrupt_ranges: [EMPTY_RANGE; MAX_CORRUPT_RANGES],
            corrupt_range_count: 0,
            shadow_text: [0; SHADOW_TEXT_CAPACITY],
            shadow_text_len: 0,
        }
    }

    pub fn shadow_text(&self) -> &str {
        core::str::from_utf8(&self.shadow_text[..self.shadow_text_len]).unwrap_or("")
    }
}

/// The callback invoked for every detected error.
pub type ErrorCallback = fn(&mut ErrorInfo);

/// Classify a bad access against the shadow and the surrounding block, and
/// pull the block's forensic metadata into the record.
///
/// Page protections on the block must have been lifted by the caller: this
/// reads the block's header and trailer.
pub fn fill_bad_access_info(shadow: &Shadow, error: &mut ErrorInfo) {
    let addr = error.address;
    let shadow_marker = shadow.marker_at(addr);

    if let Some(compact) = shadow.block_info_from_shadow(addr) {
        error.block_info = Some(compact);
        let info = compact.expand();

        unsafe {
            let header_ok = block::block_info_from_memory(info.header())
                .map(|m| m.body == info.body && m.body_size == info.body_size)
                .unwrap_or(false);

            if !header_ok || !block::verify_checksum(&info) {
                error.kind = BadAccessKind::CorruptBlock;
                error.block_is_corrupt = true;
            } else {
                let header = &*info.header();
                let state = crate::block::BlockState::from_u8(header.state);
                error.kind = if shadow_marker == marker::FREED
                    || matches!(
                        state,
                        Some(crate::block::BlockState::Quarantined)
                            | Some(crate::block::BlockState::Freed)
                    ) {
                    BadAccessKind::UseAfterFree
                } else if addr < info.body {
                    BadAccessKind::HeapBufferUnderflow
                } else if addr >= info.body_end() {
                    BadAccessKind::HeapBufferOverflow
                } else {
                    BadAccessKind::UnknownBadAccess
                };
            }

            // Forensics are worth reporting even off a corrupt block; a
            // stale stack id is better than none.
            populate_block_forensics(&info, error);
        }
    } else {
        error.kind = BadAccessKind::UnknownBadAccess;
    }

    append_shadow_text(shadow, error);
}

/// Copy the stack/thread forensics out of a block's header and trailer.
///
/// # Safety contract
/// The caller must have lifted any page protections on the block.
pub fn populate_block_forensics(info: &block::BlockInfo, error: &mut ErrorInfo) {
    unsafe {
        let header = &*info.header();
        let trailer = &*info.trailer();
        error.block_info = Some(info.to_compact());
        error.alloc_stack_id = header.alloc_stack_id;
        error.alloc_tid = trailer.alloc_tid;
        error.free_stack_id = trailer.free_stack_id;
        error.free_tid = trailer.free_tid;
        error.free_ticks = trailer.free_ticks;
    }
}

/// Render the shadow excerpt into the record.
pub fn append_shadow_text(shadow: &Shadow, error: &mut ErrorInfo) {
    let mut buf = [0u8; SHADOW_TEXT_CAPACITY];
    let mut writer = BufWriter::new(&mut buf);
    shadow.append_shadow_memory_text(error.address, &mut writer);
    let len = writer.len();
    error.shadow_text[..len].copy_from_slice(&buf[..len]);
    error.shadow_text_len = len;
}

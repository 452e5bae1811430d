//! Sharded quarantine of freed blocks.
//!
//! Freed blocks are parked here instead of being returned to their heap,
//! so that use-after-free has a detection window proportional to the
//! allocation pressure in the block's shard. Shards are picked by hashing
//! the block address; within a shard the order is FIFO, across shards
//! there is no ordering guarantee.
//!
//! The quarantine stores only block descriptions, never dereferences
//! them; eviction work (checksum verification, releasing memory) is done
//! by the calling thread through the eviction callback.

use crate::block::CompactBlockInfo;
use crate::sync::RawMutex;
use crate::util::splitmix64;
use crate::platform;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Number of shards. Must be a power of two.
pub const SHARDING_FACTOR: usize = 8;

/// Ring capacity per shard. A full ring evicts its oldest entry on push.
const SHARD_CAPACITY: usize = 2048;

struct ShardInner {
    entries: *mut CompactBlockInfo,
    head: usize,
    count: usize,
    bytes: usize,
}

struct Shard {
    lock: RawMutex,
    inner: UnsafeCell<ShardInner>,
}

unsafe impl Send for Shard {}
unsafe impl Sync for Shard {}

impl Shard {
    const fn new() -> Self {
        Shard {
            lock: RawMutex::new(),
            inner: UnsafeCell::new(ShardInner {
                entries: core::ptr::null_mut(),
                head: 0,
                count: 0,
                bytes: 0,
            }),
        }
    }
}

pub struct ShardedQuarantine {
    shards: [Shard; SHARDING_FACTOR],
    /// Per-block size cap; larger blocks are rejected outright.
    max_block_size: AtomicUsize,
    /// Global byte count across shards, maintained lazily after each
    /// push/pop.
    size: AtomicUsize,
    count: AtomicUsize,
    /// Round-robin position for trimming.
    trim_cursor: AtomicUsize,
}

impl ShardedQuarantine {
    pub const fn new() -> Self {
        const SHARD: Shard = Shard::new();
        ShardedQuarantine {
            shards: [SHARD; SHARDING_FACTOR],
            max_block_size: AtomicUsize::new(usize::MAX),
            size: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            trim_cursor: AtomicUsize::new(0),
        }
    }

    pub fn set_max_block_size(&self, max: usize) {
        self.max_block_size.store(max, Ordering::Relaxed);
    }

    /// Current byte total across all shards.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Current entry count across all shards.
    pub fn block_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    #[inline]
    fn shard_for(&self, block: usize) -> &Shard {
        let index = splitmix64(block as u64) as usize & (SHARDING_FACTOR - 1);
        &self.shards[index]
    }

    /// Push a freed block. Returns false if the block exceeds the
    /// per-block cap (the caller then releases it immediately). If the
    /// shard ring is full its oldest entry is handed to `evict`.
    pub fn push<F: FnMut(CompactBlockInfo)>(&self, info: CompactBlockInfo, mut evict: F) -> bool {
        if info.block_size > self.max_block_size.load(Ordering::Relaxed) {
            return false;
        }

        let shard = self.shard_for(info.block);
        shard.lock.lock();
        let displaced = unsafe {
            let inner = &mut *shard.inner.get();
            if !Self::ensure_init(inner) {
                shard.lock.unlock();
                return false;
            }
            let displaced = if inner.count == SHARD_CAPACITY {
                Some(Self::pop_locked(inner).unwrap())
            } else {
                None
            };
            let tail = (inner.head + inner.count) & (SHARD_CAPACITY - 1);
            *inner.entries.add(tail) = info;
            inner.count += 1;
            inner.bytes += info.block_size;
            displaced
        };
        shard.lock.unlock();

        self.size.fetch_add(info.block_size, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = displaced {
            self.size.fetch_sub(old.block_size, Ordering::Relaxed);
            self.count.fetch_sub(1, Ordering::Relaxed);
            evict(old);
        }
        true
    }

    /// Evict oldest entries round-robin across shards until the global
    /// byte total is at or below `max_size`. A zero budget flushes the
    /// quarantine completely.
    pub fn trim<F: FnMut(CompactBlockInfo)>(&self, max_size: usize, mut evict: F) {
        while self.size.load(Ordering::Relaxed) > max_size {
            let start = self.trim_cursor.fetch_add(1, Ordering::Relaxed);
            let mut popped = None;
            for i in 0..SHARDING_FACTOR {
                let shard = &self.shards[(start + i) & (SHARDING_FACTOR - 1)];
                shard.lock.lock();
                popped = unsafe { Self::pop_locked(&mut *shard.inner.get()) };
                shard.lock.unlock();
                if popped.is_some() {
                    break;
                }
            }
            let Some(entry) = popped else {
                // All shards empty; the counters will catch up.
                break;
            };
            self.size.fetch_sub(entry.block_size, Ordering::Relaxed);
            self.count.fetch_sub(1, Ordering::Relaxed);
            evict(entry);
        }
    }

    /// Remove every entry matching `pred`, handing each to `evict`. Used
    /// when a heap is destroyed and its quarantined blocks must drain.
    pub fn remove_matching<P, F>(&self, mut pred: P, mut evict: F)
    where
        P: FnMut(&CompactBlockInfo) -> bool,
        F: FnMut(CompactBlockInfo),
    {
        for shard in &self.shards {
            shard.lock.lock();
            unsafe {
                let inner = &mut *shard.inner.get();
                let mut kept = 0usize;
                let count = inner.count;
                for i in 0..count {
                    let idx = (inner.head + i) & (SHARD_CAPACITY - 1);
                    let entry = *inner.entries.add(idx);
                    if pred(&entry) {
                        inner.bytes -= entry.block_size;
                        self.size.fetch_sub(entry.block_size, Ordering::Relaxed);
                        self.count.fetch_sub(1, Ordering::Relaxed);
                        evict(entry);
                    } else {
                        let dst = (inner.head + kept) & (SHARD_CAPACITY - 1);
                        *inner.entries.add(dst) = entry;
                        kept += 1;
                    }
                }
                inner.count = kept;
            }
            shard.lock.unlock();
        }
    }

    /// Lazily map the ring storage.
    unsafe fn ensure_init(inner: &mut ShardInner) -> bool {
        if !inner.entries.is_null() {
            return true;
        }
        let bytes = SHARD_CAPACITY * core::mem::size_of::<CompactBlockInfo>();
        let Some(mem) = platform::map_runtime_pages(bytes) else {
            return false;
        };
        inner.entries = mem as *mut CompactBlockInfo;
        true
    }

    unsafe fn pop_locked(inner: &mut ShardInner) -> Option<CompactBlockInfo> {
        if inner.count == 0 {
            return None;
        }
        let entry = *inner.entries.add(inner.head);
        inner.head = (inner.head + 1) & (SHARD_CAPACITY - 1);
        inner.count -= 1;
        inner.bytes -= entry.block_size;
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(block: usize, block_size: usize) -> CompactBlockInfo {
        CompactBlockInfo {
            block,
            block_size,
            header_size: 24,
            trailer_size: 24,
            is_nested: false,
        }
    }

    #[test]
    fn push_accounts_size_and_count() {
        let q = ShardedQuarantine::new();
        assert!(q.push(entry(0x1000, 64), |_| panic!("no eviction expected")));
        assert!(q.push(entry(0x2000, 128), |_| panic!("no eviction expected")));
        assert_eq!(q.size(), 192);
        assert_eq!(q.block_count(), 2);
    }

    #[test]
    fn oversized_blocks_are_rejected() {
        let q = ShardedQuarantine::new();
        q.set_max_block_size(100);
        assert!(!q.push(entry(0x1000, 101), |_| ()));
        assert!(q.push(entry(0x2000, 100), |_| ()));
        assert_eq!(q.block_count(), 1);
    }

    #[test]
    fn trim_evicts_down_to_budget() {
        let q = ShardedQuarantine::new();
        for i in 0..100 {
            assert!(q.push(entry(0x1000 + i * 0x40, 64), |_| ()));
        }
        assert_eq!(q.size(), 6400);

        let mut evicted = Vec::new();
        q.trim(1000, |e| evicted.push(e));
        assert!(q.size() <= 1000);
        assert_eq!(evicted.len(), 100 - q.block_count());
    }

    #[test]
    fn trim_zero_flushes() {
        let q = ShardedQuarantine::new();
        for i in 0..50 {
            assert!(q.push(entry(0x9000 + i * 0x80, 128), |_| ()));
        }
        let mut evicted = 0;
        q.trim(0, |_| evicted += 1);
        assert_eq!(evicted, 50);
        assert_eq!(q.size(), 0);
        assert_eq!(q.block_count(), 0);
    }

    #[test]
    fn shard_fifo_order() {
        let q = ShardedQuarantine::new();
        // Same shard: keep the hashed index equal by reusing one address
        // family; FIFO must hold within the shard.
        let blocks: Vec<usize> = (0..10).map(|i| 0x5000 + i * 0x10000).collect();
        let same_shard: Vec<usize> = blocks
            .iter()
            .copied()
            .filter(|&b| {
                splitmix64(b as u64) as usize & (SHARDING_FACTOR - 1)
                    == splitmix64(blocks[0] as u64) as usize & (SHARDING_FACTOR - 1)
            })
            .collect();
        for &b in &same_shard {
            assert!(q.push(entry(b, 32), |_| ()));
        }
        let mut evicted = Vec::new();
        q.trim(0, |e| evicted.push(e.block));
        let order: Vec<usize> = evicted
            .into_iter()
            .filter(|b| same_shard.contains(b))
            .collect();
        assert_eq!(order, same_shard);
    }

    #[test]
    fn remove_matching_drains_selected_entries() {
        let q = ShardedQuarantine::new();
        for i in 0..20 {
            assert!(q.push(entry(0xA000 + i * 0x100, 64), |_| ()));
        }
        let mut removed = 0;
        q.remove_matching(|e| e.block % 0x200 == 0, |_| removed += 1);
        assert_eq!(removed, 10);
        assert_eq!(q.block_count(), 10);
        assert_eq!(q.size(), 64 * 10);

        let mut rest = 0;
        q.trim(0, |_| rest += 1);
        assert_eq!(rest, 10);
    }

    #[test]
    fn shard_distribution_is_roughly_balanced() {
        // With uniformly random addresses the shard counts should be
        // within a few standard deviations of each other.
        let mut counts = [0usize; SHARDING_FACTOR];
        let mut x: u64 = 0x12345678;
        for _ in 0..8000 {
            x = splitmix64(x);
            let addr = (x as usize) & 0x7FFF_FFF8;
            counts[splitmix64(addr as u64) as usize & (SHARDING_FACTOR - 1)] += 1;
        }
        let expected = 8000 / SHARDING_FACTOR;
        for &c in &counts {
            let deviation = c.abs_diff(expected);
            assert!(
                deviation < 4 * (expected as f64).sqrt() as usize,
                "shard count {} too far from {}",
                c,
                expected
            );
        }
    }
}

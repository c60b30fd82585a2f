//! Counters the store increments for an external reporter.

use crate::write::WriteStrategy;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StoreStats {
    read_calls: AtomicU64,
    read_bytes: AtomicU64,
    cow_write_calls: AtomicU64,
    cow_write_bytes: AtomicU64,
    cow_write_breaks: AtomicU64,
    inplace_write_calls: AtomicU64,
    inplace_write_bytes: AtomicU64,
    inplace_write_breaks: AtomicU64,
    corruption_detected: AtomicU64,
    fault_allocations: AtomicU64,
    mmap_cow_pages: AtomicU64,
    inode_persists: AtomicU64,
    freed_blocks: AtomicU64,
    dead_entries: AtomicU64,
}

/// Point-in-time copy of [`StoreStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub read_calls: u64,
    pub read_bytes: u64,
    pub cow_write_calls: u64,
    pub cow_write_bytes: u64,
    /// Chunk iterations across all copy-on-write calls.
    pub cow_write_breaks: u64,
    pub inplace_write_calls: u64,
    pub inplace_write_bytes: u64,
    pub inplace_write_breaks: u64,
    pub corruption_detected: u64,
    pub fault_allocations: u64,
    pub mmap_cow_pages: u64,
    pub inode_persists: u64,
    pub freed_blocks: u64,
    pub dead_entries: u64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl StoreStats {
    pub(crate) fn record_read(&self, bytes: u64) {
        bump(&self.read_calls, 1);
        bump(&self.read_bytes, bytes);
    }

    pub(crate) fn record_write(&self, strategy: WriteStrategy, bytes: u64, breaks: u64) {
        let (calls, total, chunks) = match strategy {
            WriteStrategy::CopyOnWrite => (
                &self.cow_write_calls,
                &self.cow_write_bytes,
                &self.cow_write_breaks,
            ),
            WriteStrategy::InPlace => (
                &self.inplace_write_calls,
                &self.inplace_write_bytes,
                &self.inplace_write_breaks,
            ),
        };
        bump(calls, 1);
        bump(total, bytes);
        bump(chunks, breaks);
    }

    pub(crate) fn record_corruption(&self) {
        bump(&self.corruption_detected, 1);
    }

    pub(crate) fn record_fault_allocation(&self) {
        bump(&self.fault_allocations, 1);
    }

    pub(crate) fn record_mmap_cow_page(&self) {
        bump(&self.mmap_cow_pages, 1);
    }

    pub(crate) fn record_inode_persist(&self) {
        bump(&self.inode_persists, 1);
    }

    pub(crate) fn record_reclaim(&self, freed_blocks: u64, dead_entries: u64) {
        bump(&self.freed_blocks, freed_blocks);
        bump(&self.dead_entries, dead_entries);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            read_calls: load(&self.read_calls),
            read_bytes: load(&self.read_bytes),
            cow_write_calls: load(&self.cow_write_calls),
            cow_write_bytes: load(&self.cow_write_bytes),
            cow_write_breaks: load(&self.cow_write_breaks),
            inplace_write_calls: load(&self.inplace_write_calls),
            inplace_write_bytes: load(&self.inplace_write_bytes),
            inplace_write_breaks: load(&self.inplace_write_breaks),
            corruption_detected: load(&self.corruption_detected),
            fault_allocations: load(&self.fault_allocations),
            mmap_cow_pages: load(&self.mmap_cow_pages),
            inode_persists: load(&self.inode_persists),
            freed_blocks: load(&self.freed_blocks),
            dead_entries: load(&self.dead_entries),
        }
    }
}

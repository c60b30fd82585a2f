#![forbid(unsafe_code)]
//! Extent allocation.
//!
//! The write engine consumes allocation only through [`ExtentAllocator`]: ask
//! for a run of contiguous blocks, accept that fewer may be granted, and free
//! runs back on rollback or when a superseded page is reclaimed.
//!
//! ## Design
//!
//! [`BitmapAllocator`] is layered:
//!
//! 1. **Bitmap** — raw bit manipulation on per-partition bitmaps.
//! 2. **Partition** — one bitmap plus a cached free count and a next-fit
//!    cursor, behind its own lock.
//! 3. **BitmapAllocator** — picks a partition by affinity, falls back to the
//!    others, and grants the longest run it finds up to the requested length.
//!
//! Each partition is locked independently, so concurrent writers on
//! different inodes rarely contend.

use efs_block::PmemDevice;
use efs_error::{EfsError, Result};
use efs_types::{BlockNumber, PageIndex};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Find the first free (zero) bit in the first `count` bits of `bitmap`,
/// starting from `start` and wrapping around.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    for idx in start..count {
        if !bitmap_get(bitmap, idx) {
            return Some(idx);
        }
    }
    (0..start.min(count)).find(|&idx| !bitmap_get(bitmap, idx))
}

/// Length of the free run starting at `start`, capped at `max`.
#[must_use]
pub fn bitmap_free_run(bitmap: &[u8], count: u32, start: u32, max: u32) -> u32 {
    let mut len = 0_u32;
    while len < max && start + len < count && !bitmap_get(bitmap, start + len) {
        len += 1;
    }
    len
}

// ── Allocation request / result ─────────────────────────────────────────────

/// Hint for the allocator to guide placement decisions.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocHint {
    /// Logical page the blocks will back (used to spread unrelated files).
    pub logical: Option<PageIndex>,
    /// Preferred physical block (e.g., right after the previous extent).
    pub goal_block: Option<BlockNumber>,
}

impl AllocHint {
    #[must_use]
    pub fn for_page(page: PageIndex) -> Self {
        Self {
            logical: Some(page),
            goal_block: None,
        }
    }
}

/// Which partition to try first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Affinity {
    /// Let the allocator rotate across partitions.
    #[default]
    Any,
    /// Prefer partition `n` (taken modulo the partition count).
    Partition(usize),
}

/// Result of a block allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAlloc {
    /// First allocated block.
    pub start: BlockNumber,
    /// Number of contiguous blocks allocated (1..=wanted).
    pub count: u64,
}

/// Allocation interface consumed by the write engine and the log appender.
pub trait ExtentAllocator: Send + Sync {
    /// Allocate up to `wanted` contiguous blocks.
    ///
    /// May grant fewer blocks than requested; callers loop. Fails with
    /// `NoSpace` only when not a single block is free.
    fn allocate(
        &self,
        hint: AllocHint,
        wanted: u64,
        zero: bool,
        affinity: Affinity,
    ) -> Result<BlockAlloc>;

    /// Return `count` blocks starting at `start` to the free pool.
    ///
    /// Each block must be freed exactly once; a block that is already free is
    /// reported as `Corruption` and nothing in the range is released.
    fn free(&self, start: BlockNumber, count: u64) -> Result<()>;

    /// Number of currently free blocks.
    fn free_blocks(&self) -> u64;
}

// ── Bitmap allocator ────────────────────────────────────────────────────────

#[derive(Debug)]
struct Partition {
    first: u64,
    len: u32,
    bitmap: Vec<u8>,
    free: u32,
    cursor: u32,
}

impl Partition {
    fn new(first: u64, len: u32) -> Self {
        Self {
            first,
            len,
            bitmap: vec![0_u8; len.div_ceil(8) as usize],
            free: len,
            cursor: 0,
        }
    }

    fn contains(&self, block: u64) -> bool {
        block >= self.first && block < self.first + u64::from(self.len)
    }

    /// Grant the free run at the goal (if any) or the next free run after the
    /// cursor, at most `max` blocks long.
    fn take_run(&mut self, goal: Option<u64>, max: u32) -> Option<(u64, u32)> {
        if self.free == 0 || max == 0 {
            return None;
        }
        let goal_rel = goal
            .filter(|g| self.contains(*g))
            .and_then(|g| u32::try_from(g - self.first).ok())
            .filter(|rel| !bitmap_get(&self.bitmap, *rel));
        let start = match goal_rel {
            Some(rel) => rel,
            None => bitmap_find_free(&self.bitmap, self.len, self.cursor)?,
        };
        let run = bitmap_free_run(&self.bitmap, self.len, start, max);
        for idx in start..start + run {
            bitmap_set(&mut self.bitmap, idx);
        }
        self.free -= run;
        self.cursor = if start + run >= self.len { 0 } else { start + run };
        Some((self.first + u64::from(start), run))
    }
}

/// Partitioned bitmap allocator over a contiguous range of device blocks.
pub struct BitmapAllocator {
    device: Arc<dyn PmemDevice>,
    partitions: Vec<Mutex<Partition>>,
    first: u64,
    total: u64,
    rotor: AtomicUsize,
    max_grant: Option<u64>,
}

impl std::fmt::Debug for BitmapAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitmapAllocator")
            .field("first", &self.first)
            .field("total", &self.total)
            .field("partitions", &self.partitions.len())
            .field("free", &self.free_blocks())
            .finish_non_exhaustive()
    }
}

impl BitmapAllocator {
    /// Manage blocks `[first, first + count)` of `device`, split into
    /// `partitions` roughly equal partitions.
    pub fn new(
        device: Arc<dyn PmemDevice>,
        first: BlockNumber,
        count: u64,
        partitions: usize,
    ) -> Result<Self> {
        if count == 0 {
            return Err(EfsError::Format("allocator range is empty".to_owned()));
        }
        let end = first
            .0
            .checked_add(count)
            .ok_or_else(|| EfsError::Format("allocator range overflows".to_owned()))?;
        if end > device.block_count() {
            return Err(EfsError::Format(format!(
                "allocator range past end of device: end={end} block_count={}",
                device.block_count()
            )));
        }
        let partition_count = u64::try_from(partitions.max(1))
            .map_err(|_| EfsError::Format("partition count overflows".to_owned()))?
            .min(count);
        let per = count.div_ceil(partition_count);
        let mut parts = Vec::new();
        let mut next = first.0;
        while next < end {
            let len = per.min(end - next);
            let len32 = u32::try_from(len)
                .map_err(|_| EfsError::Format(format!("partition too large: {len} blocks")))?;
            parts.push(Mutex::new(Partition::new(next, len32)));
            next += len;
        }
        tracing::info!(
            target: "efs::alloc",
            first = first.0,
            count,
            partitions = parts.len(),
            "bitmap_allocator_init"
        );
        Ok(Self {
            device,
            partitions: parts,
            first: first.0,
            total: count,
            rotor: AtomicUsize::new(0),
            max_grant: None,
        })
    }

    /// Cap every grant at `max` blocks (models a fragmented free space).
    #[must_use]
    pub fn with_max_grant(mut self, max: u64) -> Self {
        self.max_grant = Some(max.max(1));
        self
    }

    /// Whether `block` is currently allocated.
    #[must_use]
    pub fn is_allocated(&self, block: BlockNumber) -> bool {
        self.partition_of(block.0).is_ok_and(|part| {
            let guard = self.partitions[part].lock();
            u32::try_from(block.0 - guard.first).is_ok_and(|rel| bitmap_get(&guard.bitmap, rel))
        })
    }

    fn partition_of(&self, block: u64) -> Result<usize> {
        self.partitions
            .iter()
            .position(|p| p.lock().contains(block))
            .ok_or_else(|| EfsError::Corruption {
                block,
                detail: "block outside allocator range".to_owned(),
            })
    }

    fn start_partition(&self, hint: AllocHint, affinity: Affinity) -> usize {
        let n = self.partitions.len();
        if let Some(goal) = hint.goal_block {
            if let Ok(part) = self.partition_of(goal.0) {
                return part;
            }
        }
        match affinity {
            Affinity::Partition(p) => p % n,
            Affinity::Any => self.rotor.fetch_add(1, Ordering::Relaxed) % n,
        }
    }
}

impl ExtentAllocator for BitmapAllocator {
    fn allocate(
        &self,
        hint: AllocHint,
        wanted: u64,
        zero: bool,
        affinity: Affinity,
    ) -> Result<BlockAlloc> {
        if wanted == 0 {
            return Err(EfsError::InvalidArgument(
                "allocation of zero blocks".to_owned(),
            ));
        }
        let capped = self.max_grant.map_or(wanted, |max| wanted.min(max));
        let max = u32::try_from(capped).unwrap_or(u32::MAX);
        let n = self.partitions.len();
        let first = self.start_partition(hint, affinity);

        for step in 0..n {
            let part = (first + step) % n;
            let granted = self.partitions[part]
                .lock()
                .take_run(hint.goal_block.map(|b| b.0), max);
            if let Some((start, count)) = granted {
                let alloc = BlockAlloc {
                    start: BlockNumber(start),
                    count: u64::from(count),
                };
                if zero {
                    if let Err(err) = self.device.zero_blocks(alloc.start, alloc.count) {
                        self.free(alloc.start, alloc.count)?;
                        return Err(err);
                    }
                }
                tracing::trace!(
                    target: "efs::alloc",
                    partition = part,
                    start,
                    count,
                    wanted,
                    zero,
                    "blocks_allocated"
                );
                return Ok(alloc);
            }
        }

        tracing::debug!(target: "efs::alloc", wanted, "allocator_exhausted");
        Err(EfsError::NoSpace)
    }

    fn free(&self, start: BlockNumber, count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let end = start
            .0
            .checked_add(count)
            .ok_or_else(|| EfsError::Format("free range overflows".to_owned()))?;
        if start.0 < self.first || end > self.first + self.total {
            return Err(EfsError::Corruption {
                block: start.0,
                detail: format!("free of {count} blocks outside allocator range"),
            });
        }

        // Validate the whole range before releasing anything.
        let mut block = start.0;
        while block < end {
            let part = self.partition_of(block)?;
            let guard = self.partitions[part].lock();
            let part_end = (guard.first + u64::from(guard.len)).min(end);
            for b in block..part_end {
                let rel = u32::try_from(b - guard.first)
                    .map_err(|_| EfsError::Format("relative block overflows".to_owned()))?;
                if !bitmap_get(&guard.bitmap, rel) {
                    return Err(EfsError::Corruption {
                        block: b,
                        detail: "double free".to_owned(),
                    });
                }
            }
            block = part_end;
        }

        let mut block = start.0;
        while block < end {
            let part = self.partition_of(block)?;
            let mut guard = self.partitions[part].lock();
            let part_end = (guard.first + u64::from(guard.len)).min(end);
            for b in block..part_end {
                let rel = u32::try_from(b - guard.first)
                    .map_err(|_| EfsError::Format("relative block overflows".to_owned()))?;
                bitmap_clear(&mut guard.bitmap, rel);
                guard.free += 1;
            }
            block = part_end;
        }

        tracing::trace!(target: "efs::alloc", start = start.0, count, "blocks_freed");
        Ok(())
    }

    fn free_blocks(&self) -> u64 {
        self.partitions
            .iter()
            .map(|p| u64::from(p.lock().free))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use efs_block::MemPmemDevice;
    use efs_types::BlockSize;

    fn make_alloc(blocks: u64, partitions: usize) -> (Arc<MemPmemDevice>, BitmapAllocator) {
        let dev = Arc::new(MemPmemDevice::new(BlockSize::new(4096).unwrap(), blocks + 4));
        let alloc = BitmapAllocator::new(dev.clone(), BlockNumber(4), blocks, partitions).unwrap();
        (dev, alloc)
    }

    #[test]
    fn bitmap_helpers() {
        let mut bm = vec![0_u8; 2];
        bitmap_set(&mut bm, 3);
        bitmap_set(&mut bm, 4);
        assert!(bitmap_get(&bm, 3));
        assert_eq!(bitmap_find_free(&bm, 16, 3), Some(5));
        assert_eq!(bitmap_free_run(&bm, 16, 0, 10), 3);
        assert_eq!(bitmap_free_run(&bm, 16, 5, 100), 11);
        bitmap_clear(&mut bm, 3);
        assert!(!bitmap_get(&bm, 3));
        assert!(!bitmap_get(&bm, 1000));
    }

    #[test]
    fn allocates_contiguous_run() {
        let (_dev, alloc) = make_alloc(64, 1);
        let got = alloc
            .allocate(AllocHint::default(), 8, false, Affinity::Any)
            .unwrap();
        assert_eq!(got.count, 8);
        assert_eq!(got.start, BlockNumber(4));
        assert_eq!(alloc.free_blocks(), 56);
        assert!(alloc.is_allocated(BlockNumber(11)));
        assert!(!alloc.is_allocated(BlockNumber(12)));
    }

    #[test]
    fn grants_fewer_blocks_when_fragmented() {
        let (_dev, alloc) = make_alloc(16, 1);
        let a = alloc
            .allocate(AllocHint::default(), 4, false, Affinity::Any)
            .unwrap();
        let _b = alloc
            .allocate(AllocHint::default(), 4, false, Affinity::Any)
            .unwrap();
        alloc.free(a.start, a.count).unwrap();

        // Only a 4-block hole at the goal; ask for 6 there.
        let got = alloc
            .allocate(
                AllocHint {
                    logical: None,
                    goal_block: Some(a.start),
                },
                6,
                false,
                Affinity::Any,
            )
            .unwrap();
        assert_eq!(got.start, a.start);
        assert_eq!(got.count, 4);
    }

    #[test]
    fn max_grant_caps_requests() {
        let (_dev, alloc) = make_alloc(32, 1);
        let alloc = alloc.with_max_grant(2);
        let got = alloc
            .allocate(AllocHint::default(), 10, false, Affinity::Any)
            .unwrap();
        assert_eq!(got.count, 2);
    }

    #[test]
    fn exhaustion_is_no_space() {
        let (_dev, alloc) = make_alloc(4, 2);
        let mut granted = 0;
        while granted < 4 {
            granted += alloc
                .allocate(AllocHint::default(), 4, false, Affinity::Any)
                .unwrap()
                .count;
        }
        assert!(matches!(
            alloc.allocate(AllocHint::default(), 1, false, Affinity::Any),
            Err(EfsError::NoSpace)
        ));
    }

    #[test]
    fn double_free_is_detected_and_nothing_released() {
        let (_dev, alloc) = make_alloc(16, 1);
        let got = alloc
            .allocate(AllocHint::default(), 2, false, Affinity::Any)
            .unwrap();
        alloc.free(got.start, 1).unwrap();
        let free_before = alloc.free_blocks();
        let err = alloc.free(got.start, 2).unwrap_err();
        assert!(matches!(err, EfsError::Corruption { .. }));
        assert_eq!(alloc.free_blocks(), free_before);
    }

    #[test]
    fn zero_on_alloc_clears_stale_bytes() {
        let (dev, alloc) = make_alloc(8, 1);
        dev.write_block(BlockNumber(4), &[0xEE_u8; 4096]).unwrap();
        let got = alloc
            .allocate(AllocHint::default(), 1, true, Affinity::Any)
            .unwrap();
        assert_eq!(got.start, BlockNumber(4));
        assert!(dev
            .read_block(got.start)
            .unwrap()
            .as_slice()
            .iter()
            .all(|b| *b == 0));
    }

    #[test]
    fn partition_affinity_and_fallback() {
        let (_dev, alloc) = make_alloc(8, 2);
        let p1 = alloc
            .allocate(AllocHint::default(), 4, false, Affinity::Partition(1))
            .unwrap();
        assert_eq!(p1.start, BlockNumber(8));
        // Partition 1 is full now; the request falls back to partition 0.
        let fallback = alloc
            .allocate(AllocHint::default(), 2, false, Affinity::Partition(1))
            .unwrap();
        assert_eq!(fallback.start, BlockNumber(4));
    }
}

#![forbid(unsafe_code)]
//! The EpochFS store.
//!
//! A [`Store`] owns one persistent-memory device laid out as described by
//! [`StoreGeometry`]. Every file has an append-only write log; its in-memory
//! extent index maps logical pages to the log entries that currently back
//! them. Writes either copy into fresh blocks or, within one epoch, update
//! the blocks of an earlier entry in place.

mod config;
mod inode;
mod mmap;
mod read;
mod reassign;
mod resolve;
mod stats;
mod stitch;
mod write;

pub use config::{StoreConfig, StoreGeometry, INODE_SLOT_SIZE};
pub use inode::{FileHandle, InodeRecord, OpenFlags, INODE_RECORD_SIZE};
pub use mmap::{Mapping, MmapRegistry};
pub use resolve::{MappedRun, Resolved};
pub use stats::{StatsSnapshot, StoreStats};
pub use write::WriteStrategy;

use efs_alloc::{BitmapAllocator, ExtentAllocator};
use efs_block::PmemDevice;
use efs_error::{EfsError, Result};
use efs_extent::ExtentIndex;
use efs_journal::{EpochCounter, LogChain, LogRecord, WriteEntry};
use efs_repair::ProtectionUnit;
use efs_types::{BlockNumber, BlockSize, EpochId, InodeNumber, LogPosition, PageIndex};
use inode::{Inode, InodeState};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Result of re-deriving an extent index from the committed log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexCheck {
    /// Pages mapped by the rebuilt index.
    pub pages: u64,
    /// File write entries replayed.
    pub entries: usize,
    /// Size recorded in the persisted inode record.
    pub size: u64,
    pub matches_live: bool,
}

pub struct Store {
    config: StoreConfig,
    geometry: StoreGeometry,
    device: Arc<dyn PmemDevice>,
    alloc: Arc<dyn ExtentAllocator>,
    log: LogChain,
    protection: ProtectionUnit,
    epoch: EpochCounter,
    stats: StoreStats,
    registry: MmapRegistry,
    inodes: RwLock<HashMap<InodeNumber, Arc<Inode>>>,
    /// Last inode number handed out, held across creation I/O.
    last_ino: Mutex<u64>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.config)
            .field("geometry", &self.geometry)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Lay out a fresh store on `device` with a bitmap allocator over the
    /// data region.
    pub fn format(device: Arc<dyn PmemDevice>, config: StoreConfig) -> Result<Self> {
        let geometry = StoreGeometry::compute(device.block_size(), device.block_count(), &config)?;
        let alloc = BitmapAllocator::new(
            Arc::clone(&device),
            geometry.data_start,
            geometry.data_blocks,
            config.alloc_partitions,
        )?;
        Self::with_allocator(device, config, Arc::new(alloc))
    }

    /// Lay out a fresh store that draws data and log blocks from `alloc`.
    ///
    /// `alloc` must only hand out blocks inside the geometry's data region.
    pub fn with_allocator(
        device: Arc<dyn PmemDevice>,
        config: StoreConfig,
        alloc: Arc<dyn ExtentAllocator>,
    ) -> Result<Self> {
        let geometry = StoreGeometry::compute(device.block_size(), device.block_count(), &config)?;
        device.zero_blocks(geometry.inode_table_start, geometry.inode_table_blocks)?;
        let protection = ProtectionUnit::new(
            Arc::clone(&device),
            geometry.protection_layout(),
            config.data_checksum,
            config.data_parity,
        )?;
        let log = LogChain::new(Arc::clone(&device), config.metadata_replica);
        tracing::info!(
            target: "efs::store",
            block_size = geometry.block_size.get(),
            total_blocks = geometry.total_blocks,
            data_start = geometry.data_start.0,
            data_blocks = geometry.data_blocks,
            inode_slots = geometry.inode_slots,
            strategy = ?config.write_strategy(),
            checksum = config.data_checksum,
            parity = config.data_parity,
            "store_formatted"
        );
        Ok(Self {
            config,
            geometry,
            device,
            alloc,
            log,
            protection,
            epoch: EpochCounter::default(),
            stats: StoreStats::default(),
            registry: MmapRegistry::default(),
            inodes: RwLock::new(HashMap::new()),
            last_ino: Mutex::new(0),
        })
    }

    /// Create an empty file with a fresh write log.
    pub fn create_file(&self) -> Result<InodeNumber> {
        let mut last = self.last_ino.lock();
        let ino = InodeNumber(*last + 1);
        if ino.0 > self.geometry.inode_slots {
            return Err(EfsError::NoSpace);
        }
        let log = self.log.create(self.alloc.as_ref())?;
        let record = InodeRecord {
            ino,
            size: 0,
            blocks: 0,
            log,
        };
        if let Err(err) = self.persist_inode(&record) {
            self.release_log_pages(&record);
            return Err(err);
        }
        self.inodes.write().insert(ino, Arc::new(Inode::new(ino, log)));
        *last = ino.0;
        drop(last);
        tracing::debug!(target: "efs::store", ino = ino.0, head = log.head.0, "file_created");
        Ok(ino)
    }

    fn release_log_pages(&self, record: &InodeRecord) {
        let bs = self.block_size().as_u64();
        for pos in [record.log.head, record.log.alter_head] {
            if pos.is_null() {
                continue;
            }
            if let Err(err) = self.alloc.free(BlockNumber(pos.0 / bs), 1) {
                tracing::warn!(
                    target: "efs::store",
                    ino = record.ino.0,
                    pos = pos.0,
                    error = %err,
                    "log_page_not_freed"
                );
            }
        }
    }

    pub fn open(&self, ino: InodeNumber, flags: OpenFlags) -> Result<FileHandle> {
        self.inode(ino)?;
        Ok(FileHandle::new(ino, flags))
    }

    /// Write `data` at `pos`, or at end of file for an append handle.
    ///
    /// Returns the number of bytes written. A failure after at least one
    /// chunk committed is reported as a short write.
    pub fn write(&self, fh: &FileHandle, data: &[u8], pos: u64) -> Result<usize> {
        let inode = self.inode(fh.ino())?;
        let mut st = inode.state.write();
        let pos = if fh.flags().append { st.size } else { pos };
        self.write_locked(fh.ino(), &mut st, data, pos, self.config.write_strategy())
    }

    /// Start a new epoch. Entries written before this point are no longer
    /// eligible for in-place reuse.
    pub fn advance_epoch(&self) -> EpochId {
        let epoch = self.epoch.advance();
        tracing::info!(target: "efs::store", epoch = epoch.0, "epoch_advanced");
        epoch
    }

    #[must_use]
    pub fn current_epoch(&self) -> EpochId {
        self.epoch.current()
    }

    pub fn file_size(&self, ino: InodeNumber) -> Result<u64> {
        Ok(self.inode(ino)?.state.read().size)
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Decoded records of the committed log, oldest first.
    pub fn entries(&self, ino: InodeNumber) -> Result<Vec<(LogPosition, LogRecord)>> {
        let inode = self.inode(ino)?;
        let st = inode.state.read();
        self.log.walk(st.log.head, st.log.tail)
    }

    /// Replay the log named by the persisted inode record into a new extent
    /// index and compare it with the live one.
    pub fn rebuild_index(&self, ino: InodeNumber) -> Result<IndexCheck> {
        let inode = self.inode(ino)?;
        let st = inode.state.read();
        let record = self.load_inode(inode.ino)?;

        let mut rebuilt = ExtentIndex::new();
        let entries = self.log.write_entries(record.log.head, record.log.tail)?;
        for (pos, entry) in &entries {
            rebuilt.assign(entry.pgoff, u64::from(entry.num_pages), *pos);
        }
        let check = IndexCheck {
            pages: rebuilt.len() as u64,
            entries: entries.len(),
            size: record.size,
            matches_live: rebuilt == st.index && record.size == st.size,
        };
        if !check.matches_live {
            tracing::error!(
                target: "efs::store",
                ino = ino.0,
                rebuilt = check.pages,
                live = st.index.len(),
                "index_mismatch"
            );
        }
        Ok(check)
    }

    /// Rebuild one bad strip of `block` from parity.
    ///
    /// Returns the repaired strip, or `None` when the block verified clean.
    pub fn repair_block(&self, block: BlockNumber) -> Result<Option<usize>> {
        let repaired = self.protection.reconstruct(block)?;
        if let Some(strip) = repaired {
            tracing::info!(target: "efs::store", block = block.0, strip, "block_repaired");
        }
        Ok(repaired)
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.alloc.free_blocks()
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub fn geometry(&self) -> &StoreGeometry {
        &self.geometry
    }

    pub(crate) fn inode(&self, ino: InodeNumber) -> Result<Arc<Inode>> {
        self.inodes
            .read()
            .get(&ino)
            .cloned()
            .ok_or_else(|| EfsError::NotFound(format!("inode {ino}")))
    }

    pub(crate) fn block_size(&self) -> BlockSize {
        self.geometry.block_size
    }

    /// Whether reading `page` through `entry` should check its checksums.
    ///
    /// A page under a live shared writable mapping is exempt for every
    /// reader, not only the mapping's own copy path: stores through the
    /// mapping change the bytes without refreshing protection, so its
    /// checksums are stale until unmap or a refresh pass. An entry with
    /// `updating` set is mid-rewrite and exempt for the same reason.
    pub(crate) fn should_verify(&self, st: &InodeState, page: PageIndex, entry: &WriteEntry) -> bool {
        self.protection.checksum_enabled()
            && !entry.updating
            && !st.page_in_writable_mapping(page)
    }

    pub(crate) fn note_error(&self, err: &EfsError) {
        if matches!(err, EfsError::DataCorrupt { .. }) {
            self.stats.record_corruption();
        }
    }

    pub(crate) fn persist_inode(&self, record: &InodeRecord) -> Result<()> {
        let offset = self.geometry.inode_slot_offset(record.ino)?;
        self.device.write_all_at(offset, &record.encode())?;
        self.device.persist(offset, INODE_SLOT_SIZE)?;
        self.stats.record_inode_persist();
        Ok(())
    }

    fn load_inode(&self, ino: InodeNumber) -> Result<InodeRecord> {
        let offset = self.geometry.inode_slot_offset(ino)?;
        let mut buf = [0_u8; INODE_RECORD_SIZE];
        self.device.read_exact_at(offset, &mut buf)?;
        InodeRecord::decode(&buf).map_err(|err| EfsError::Corruption {
            block: offset / self.block_size().as_u64(),
            detail: format!("inode {ino} record: {err}"),
        })
    }
}

pub(crate) fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use efs_block::MemPmemDevice;

    fn store(blocks: u64, config: StoreConfig) -> (Arc<MemPmemDevice>, Store) {
        let dev = Arc::new(MemPmemDevice::new(BlockSize::default(), blocks));
        let store = Store::format(Arc::clone(&dev) as Arc<dyn PmemDevice>, config).unwrap();
        (dev, store)
    }

    #[test]
    fn create_file_persists_empty_record() {
        let (_dev, store) = store(64, StoreConfig::default());
        let ino = store.create_file().unwrap();
        assert_eq!(ino, InodeNumber(1));
        assert_eq!(store.file_size(ino).unwrap(), 0);
        let record = store.load_inode(ino).unwrap();
        assert_eq!(record.size, 0);
        assert_eq!(record.log.head, record.log.tail);
        assert!(!record.log.alter_head.is_null());
        assert_eq!(store.stats().inode_persists, 1);
        assert!(store.entries(ino).unwrap().is_empty());
    }

    #[test]
    fn inode_slots_run_out() {
        let dev = Arc::new(MemPmemDevice::new(BlockSize::new(1024).unwrap(), 64));
        let config = StoreConfig {
            metadata_replica: false,
            ..StoreConfig::default()
        };
        let store = Store::format(dev as Arc<dyn PmemDevice>, config).unwrap();
        assert_eq!(store.geometry().inode_slots, 16);
        for expected in 1..=16 {
            assert_eq!(store.create_file().unwrap(), InodeNumber(expected));
        }
        assert!(matches!(store.create_file(), Err(EfsError::NoSpace)));
    }

    #[test]
    fn lookups_do_not_wait_for_file_creation() {
        let (_dev, store) = store(64, StoreConfig::default());
        let ino = store.create_file().unwrap();
        let creating = store.last_ino.lock();
        assert_eq!(store.file_size(ino).unwrap(), 0);
        assert!(store.open(ino, OpenFlags::default()).is_ok());
        drop(creating);
    }

    #[test]
    fn concurrent_creates_get_dense_numbers() {
        let (_dev, store) = store(256, StoreConfig::default());
        let mut created: Vec<u64> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8).map(|_| s.spawn(|| store.create_file())).collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap().unwrap().0)
                .collect()
        });
        created.sort_unstable();
        assert_eq!(created, (1..=8).collect::<Vec<_>>());
        for ino in created {
            assert_eq!(store.load_inode(InodeNumber(ino)).unwrap().size, 0);
        }
    }

    #[test]
    fn unknown_inode_is_not_found() {
        let (_dev, store) = store(64, StoreConfig::default());
        assert!(matches!(
            store.open(InodeNumber(9), OpenFlags::default()),
            Err(EfsError::NotFound(_))
        ));
        assert!(matches!(
            store.file_size(InodeNumber(9)),
            Err(EfsError::NotFound(_))
        ));
    }

    #[test]
    fn epoch_advances() {
        let (_dev, store) = store(64, StoreConfig::default());
        let before = store.current_epoch();
        assert_eq!(store.advance_epoch(), EpochId(before.0 + 1));
        assert_eq!(store.current_epoch(), EpochId(before.0 + 1));
    }

    #[test]
    fn write_records_one_persist_per_call() {
        let (dev, store) = store(64, StoreConfig::default());
        let ino = store.create_file().unwrap();
        let fh = store.open(ino, OpenFlags::default()).unwrap();
        let persists = dev.persist_calls();
        assert_eq!(store.write(&fh, &[7_u8; 100], 0).unwrap(), 100);
        assert!(dev.persist_calls() > persists);
        assert_eq!(store.stats().inode_persists, 2);
        assert_eq!(store.load_inode(ino).unwrap().size, 100);
    }

    #[test]
    fn now_secs_is_nonzero() {
        assert!(now_secs() > 0);
    }
}

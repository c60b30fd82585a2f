#![forbid(unsafe_code)]
//! Per-inode append-only write logs.
//!
//! A log is a chain of device blocks ("log pages"). Each page holds
//! `block_size / 64 - 1` fixed-size records; the last 64-byte slot is the
//! page tail, which links to the next page and to the matching page of the
//! alternate chain. A log position is the device byte address of a record.
//!
//! Appends go through a [`TailUpdate`] owned by the caller. The inode's
//! committed tails only move when the caller persists its inode record, so an
//! append that is never committed is simply forgotten: the log pages it
//! linked stay in the chain and are reused by the next append.

mod epoch;
mod record;

pub use epoch::EpochCounter;
pub use record::{
    decode_record, encode_record, LogRecord, MmapEntry, WriteEntry, KIND_FILE_WRITE,
    KIND_MMAP_WRITE, RECORD_SIZE,
};

use efs_alloc::{Affinity, AllocHint, ExtentAllocator};
use efs_block::PmemDevice;
use efs_error::{EfsError, Result};
use efs_types::{read_le_u64, write_le_u64, BlockNumber, BlockSize, LogPosition};
use std::sync::Arc;

const RECORD_BYTES: u64 = RECORD_SIZE as u64;

/// Committed log pointers of one inode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogHead {
    pub head: LogPosition,
    pub tail: LogPosition,
    pub alter_head: LogPosition,
    pub alter_tail: LogPosition,
}

/// Working tail threaded through one mutating call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TailUpdate {
    pub tail: LogPosition,
    pub alter_tail: LogPosition,
    /// Position of the most recently appended record.
    pub curr_entry: LogPosition,
}

impl TailUpdate {
    #[must_use]
    pub fn from_head(log: &LogHead) -> Self {
        Self {
            tail: log.tail,
            alter_tail: log.alter_tail,
            curr_entry: LogPosition::NULL,
        }
    }
}

/// Reads, appends and patches log records on a device.
pub struct LogChain {
    device: Arc<dyn PmemDevice>,
    block_size: BlockSize,
    replica: bool,
}

impl std::fmt::Debug for LogChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogChain")
            .field("block_size", &self.block_size)
            .field("replica", &self.replica)
            .finish_non_exhaustive()
    }
}

impl LogChain {
    /// `replica` maintains the alternate chain alongside the primary one.
    #[must_use]
    pub fn new(device: Arc<dyn PmemDevice>, replica: bool) -> Self {
        let block_size = device.block_size();
        Self {
            device,
            block_size,
            replica,
        }
    }

    /// Records per log page (the last slot is the page tail).
    #[must_use]
    pub fn records_per_page(&self) -> u64 {
        self.block_size.as_u64() / RECORD_BYTES - 1
    }

    fn page_of(&self, pos: LogPosition) -> BlockNumber {
        BlockNumber(pos.0 >> self.block_size.shift())
    }

    fn slot_of(&self, pos: LogPosition) -> u64 {
        (pos.0 & (self.block_size.as_u64() - 1)) / RECORD_BYTES
    }

    fn page_start(&self, page: BlockNumber) -> LogPosition {
        LogPosition(page.0 << self.block_size.shift())
    }

    fn tail_slot(&self, page: BlockNumber) -> u64 {
        self.page_start(page).0 + self.records_per_page() * RECORD_BYTES
    }

    fn read_page_tail(&self, page: BlockNumber) -> Result<(u64, u64)> {
        let mut buf = [0_u8; 16];
        self.device.read_exact_at(self.tail_slot(page), &mut buf)?;
        let next = read_le_u64(&buf, 0).map_err(|e| EfsError::LogCorrupt {
            position: self.tail_slot(page),
            detail: e.to_string(),
        })?;
        let alter = read_le_u64(&buf, 8).map_err(|e| EfsError::LogCorrupt {
            position: self.tail_slot(page),
            detail: e.to_string(),
        })?;
        Ok((next, alter))
    }

    fn write_page_tail(&self, page: BlockNumber, next: u64, alter: u64) -> Result<()> {
        let mut buf = [0_u8; 16];
        write_le_u64(&mut buf, 0, next);
        write_le_u64(&mut buf, 8, alter);
        let offset = self.tail_slot(page);
        self.device.write_all_at(offset, &buf)?;
        self.device.persist(offset, 16)
    }

    fn alloc_page(alloc: &dyn ExtentAllocator) -> Result<BlockNumber> {
        match alloc.allocate(AllocHint::default(), 1, true, Affinity::Any) {
            Ok(granted) => Ok(granted.start),
            Err(EfsError::NoSpace) => Err(EfsError::NoLogSpace),
            Err(err) => Err(err),
        }
    }

    /// Allocate the first page (and its alternate) of a new log.
    pub fn create(&self, alloc: &dyn ExtentAllocator) -> Result<LogHead> {
        let primary = Self::alloc_page(alloc)?;
        let alternate = if self.replica {
            match Self::alloc_page(alloc) {
                Ok(page) => Some(page),
                Err(err) => {
                    alloc.free(primary, 1)?;
                    return Err(err);
                }
            }
        } else {
            None
        };

        self.write_page_tail(primary, 0, alternate.map_or(0, |b| b.0))?;
        if let Some(alt) = alternate {
            self.write_page_tail(alt, 0, primary.0)?;
        }

        let head = self.page_start(primary);
        let alter_head = alternate.map_or(LogPosition::NULL, |b| self.page_start(b));
        tracing::debug!(
            target: "efs::log",
            head = head.0,
            alter_head = alter_head.0,
            "log_created"
        );
        Ok(LogHead {
            head,
            tail: head,
            alter_head,
            alter_tail: alter_head,
        })
    }

    /// Position of the replica of `pos`, or null without an alternate chain.
    pub fn alternate_of(&self, pos: LogPosition) -> Result<LogPosition> {
        if !self.replica || pos.is_null() {
            return Ok(LogPosition::NULL);
        }
        let (_, alter) = self.read_page_tail(self.page_of(pos))?;
        if alter == 0 {
            return Ok(LogPosition::NULL);
        }
        let in_page = pos.0 & (self.block_size.as_u64() - 1);
        Ok(LogPosition(self.page_start(BlockNumber(alter)).0 + in_page))
    }

    /// Move to the page after the full page containing `full`, linking a new
    /// page if none is linked yet.
    fn extend(&self, alloc: &dyn ExtentAllocator, full: LogPosition) -> Result<LogPosition> {
        let page = self.page_of(full);
        let (next, alter) = self.read_page_tail(page)?;
        if next != 0 {
            // Linked by an append that was never committed.
            return Ok(self.page_start(BlockNumber(next)));
        }

        let new_page = Self::alloc_page(alloc)?;
        let new_alter = if self.replica && alter != 0 {
            match Self::alloc_page(alloc) {
                Ok(alt) => Some(alt),
                Err(err) => {
                    alloc.free(new_page, 1)?;
                    return Err(err);
                }
            }
        } else {
            None
        };

        self.write_page_tail(new_page, 0, new_alter.map_or(0, |b| b.0))?;
        if let Some(alt) = new_alter {
            self.write_page_tail(alt, 0, new_page.0)?;
        }
        self.write_page_tail(page, new_page.0, alter)?;
        if let Some(alt) = new_alter {
            self.write_page_tail(BlockNumber(alter), alt.0, page.0)?;
        }

        tracing::debug!(
            target: "efs::log",
            from_page = page.0,
            new_page = new_page.0,
            "log_page_linked"
        );
        Ok(self.page_start(new_page))
    }

    fn write_slot(&self, pos: LogPosition, bytes: &[u8; RECORD_SIZE]) -> Result<LogPosition> {
        self.device.write_all_at(pos.0, bytes)?;
        self.device.persist(pos.0, RECORD_BYTES)?;
        let alt = self.alternate_of(pos)?;
        if !alt.is_null() {
            self.device.write_all_at(alt.0, bytes)?;
            self.device.persist(alt.0, RECORD_BYTES)?;
        }
        Ok(alt)
    }

    /// Serialize `record` at the working tail and advance it.
    pub fn append(
        &self,
        alloc: &dyn ExtentAllocator,
        update: &mut TailUpdate,
        record: &LogRecord,
    ) -> Result<LogPosition> {
        let mut pos = update.tail;
        if pos.is_null() {
            return Err(EfsError::LogCorrupt {
                position: 0,
                detail: "append to a log that was never created".to_owned(),
            });
        }
        if self.slot_of(pos) >= self.records_per_page() {
            pos = self.extend(alloc, pos)?;
        }

        let alt = self.write_slot(pos, &encode_record(record))?;
        update.curr_entry = pos;
        update.tail = LogPosition(pos.0 + RECORD_BYTES);
        update.alter_tail = if alt.is_null() {
            LogPosition::NULL
        } else {
            LogPosition(alt.0 + RECORD_BYTES)
        };
        tracing::trace!(
            target: "efs::log",
            pos = pos.0,
            kind = record.kind(),
            "log_record_appended"
        );
        Ok(pos)
    }

    /// Read the record at `pos`, falling back to the alternate chain when the
    /// primary copy fails its checksum.
    pub fn read(&self, pos: LogPosition) -> Result<LogRecord> {
        if pos.is_null() || self.slot_of(pos) >= self.records_per_page() {
            return Err(EfsError::LogCorrupt {
                position: pos.0,
                detail: "position does not address a record slot".to_owned(),
            });
        }
        let mut buf = [0_u8; RECORD_SIZE];
        self.device.read_exact_at(pos.0, &mut buf)?;
        let primary_err = match decode_record(&buf) {
            Ok(record) => return Ok(record),
            Err(err) => err,
        };

        let alt = self.alternate_of(pos)?;
        if alt.is_null() {
            tracing::error!(target: "efs::log", pos = pos.0, error = %primary_err, "log_record_corrupt");
            return Err(EfsError::LogCorrupt {
                position: pos.0,
                detail: primary_err.to_string(),
            });
        }
        self.device.read_exact_at(alt.0, &mut buf)?;
        match decode_record(&buf) {
            Ok(record) => {
                tracing::warn!(
                    target: "efs::log",
                    pos = pos.0,
                    alt = alt.0,
                    error = %primary_err,
                    "log_record_replica_fallback"
                );
                Ok(record)
            }
            Err(alt_err) => {
                tracing::error!(target: "efs::log", pos = pos.0, "log_record_corrupt_both_copies");
                Err(EfsError::LogCorrupt {
                    position: pos.0,
                    detail: format!("primary: {primary_err}; replica: {alt_err}"),
                })
            }
        }
    }

    pub fn read_write_entry(&self, pos: LogPosition) -> Result<WriteEntry> {
        match self.read(pos)? {
            LogRecord::FileWrite(entry) => Ok(entry),
            LogRecord::MmapWrite(_) => Err(EfsError::LogCorrupt {
                position: pos.0,
                detail: "expected a file write entry".to_owned(),
            }),
        }
    }

    fn modify_write_entry(
        &self,
        pos: LogPosition,
        f: impl FnOnce(&mut WriteEntry),
    ) -> Result<WriteEntry> {
        let mut entry = self.read_write_entry(pos)?;
        f(&mut entry);
        self.store_write_entry(pos, &entry)?;
        Ok(entry)
    }

    /// Overwrite the entry at `pos` (and its replica) with `entry`.
    pub fn store_write_entry(&self, pos: LogPosition, entry: &WriteEntry) -> Result<()> {
        self.write_slot(pos, &encode_record(&LogRecord::FileWrite(*entry)))?;
        Ok(())
    }

    /// Set or clear the transient `updating` flag.
    pub fn set_updating(&self, pos: LogPosition, updating: bool) -> Result<WriteEntry> {
        self.modify_write_entry(pos, |e| e.updating = updating)
    }

    /// Refresh the metadata of a committed entry after an in-place data
    /// update, clearing `updating`.
    pub fn update_entry_in_place(
        &self,
        pos: LogPosition,
        size: u64,
        mtime: u32,
    ) -> Result<WriteEntry> {
        let entry = self.modify_write_entry(pos, |e| {
            e.size = size;
            e.mtime = mtime;
            e.updating = false;
        })?;
        tracing::trace!(target: "efs::log", pos = pos.0, size, "log_entry_updated_in_place");
        Ok(entry)
    }

    /// Record that `count` pages of the entry at `pos` were superseded.
    pub fn invalidate_pages(&self, pos: LogPosition, count: u32) -> Result<WriteEntry> {
        self.modify_write_entry(pos, |e| e.mark_superseded(count))
    }

    /// Mark an mmap record as no longer describing a live mapping.
    pub fn invalidate_mmap_entry(&self, pos: LogPosition) -> Result<()> {
        match self.read(pos)? {
            LogRecord::MmapWrite(mut entry) => {
                entry.invalid = true;
                self.write_slot(pos, &encode_record(&LogRecord::MmapWrite(entry)))?;
                Ok(())
            }
            LogRecord::FileWrite(_) => Err(EfsError::LogCorrupt {
                position: pos.0,
                detail: "expected an mmap write entry".to_owned(),
            }),
        }
    }

    /// Every record in `[from, to)`, following page links.
    ///
    /// A null position or a null page link before `to` is reached means the
    /// chain is broken.
    pub fn walk(&self, from: LogPosition, to: LogPosition) -> Result<Vec<(LogPosition, LogRecord)>> {
        let max_steps = self
            .device
            .block_count()
            .saturating_mul(self.records_per_page() + 1);
        let mut records = Vec::new();
        let mut pos = from;
        let mut steps = 0_u64;

        while pos != to {
            steps += 1;
            if pos.is_null() || steps > max_steps {
                tracing::error!(target: "efs::log", from = from.0, to = to.0, "log_chain_broken");
                return Err(EfsError::LogCorrupt {
                    position: pos.0,
                    detail: "chain does not reach the tail".to_owned(),
                });
            }
            if self.slot_of(pos) >= self.records_per_page() {
                let (next, _) = self.read_page_tail(self.page_of(pos))?;
                if next == 0 {
                    tracing::error!(target: "efs::log", pos = pos.0, to = to.0, "log_null_page_link");
                    return Err(EfsError::LogCorrupt {
                        position: pos.0,
                        detail: "null next-page link before reaching the tail".to_owned(),
                    });
                }
                pos = self.page_start(BlockNumber(next));
                continue;
            }
            records.push((pos, self.read(pos)?));
            pos = LogPosition(pos.0 + RECORD_BYTES);
        }
        Ok(records)
    }

    /// The file write entries in `[from, to)`.
    pub fn write_entries(
        &self,
        from: LogPosition,
        to: LogPosition,
    ) -> Result<Vec<(LogPosition, WriteEntry)>> {
        Ok(self
            .walk(from, to)?
            .into_iter()
            .filter_map(|(pos, record)| record.as_write().map(|e| (pos, *e)))
            .collect())
    }
}

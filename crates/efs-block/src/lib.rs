#![forbid(unsafe_code)]
//! Persistent-memory device layer.
//!
//! Provides the `PmemDevice` trait: byte-addressed loads and stores over a
//! fixed-size region, plus an explicit `persist` barrier. Nothing written is
//! considered durable until the covering range has been persisted, and the
//! write engine orders its barriers (data, then protection, then log, then
//! inode) on top of this contract.

use efs_error::{EfsError, Result};
use efs_types::{BlockNumber, BlockSize};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn zeroed(block_size: BlockSize) -> Self {
        Self {
            bytes: vec![0_u8; block_size.as_usize()],
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed persistent-memory region.
pub trait PmemDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Block size the store lays its structures out in.
    fn block_size(&self) -> BlockSize;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Make `[offset, offset + len)` durable.
    fn persist(&self, offset: u64, len: u64) -> Result<()>;

    /// Total number of blocks.
    fn block_count(&self) -> u64 {
        self.len_bytes() / self.block_size().as_u64()
    }

    /// Byte offset of `block`, validating that the block exists.
    fn block_offset(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count() {
            return Err(EfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0,
                self.block_count()
            )));
        }
        self.block_size()
            .block_to_byte(block)
            .ok_or_else(|| EfsError::Format("block offset overflow".to_owned()))
    }

    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.block_offset(block)?;
        let mut buf = BlockBuf::zeroed(self.block_size());
        self.read_exact_at(offset, buf.as_mut_slice())?;
        Ok(buf)
    }

    /// Write a whole block. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = self.block_size().as_usize();
        if data.len() != expected {
            return Err(EfsError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        let offset = self.block_offset(block)?;
        self.write_all_at(offset, data)
    }

    /// Read `buf.len()` bytes starting `offset` bytes into `block`.
    fn read_in_block(&self, block: BlockNumber, offset: usize, buf: &mut [u8]) -> Result<()> {
        check_in_block(self.block_size(), offset, buf.len())?;
        let base = self.block_offset(block)?;
        self.read_exact_at(base + offset as u64, buf)
    }

    /// Write `data` starting `offset` bytes into `block`.
    fn write_in_block(&self, block: BlockNumber, offset: usize, data: &[u8]) -> Result<()> {
        check_in_block(self.block_size(), offset, data.len())?;
        let base = self.block_offset(block)?;
        self.write_all_at(base + offset as u64, data)
    }

    /// Persist `count` whole blocks starting at `block`.
    fn persist_blocks(&self, block: BlockNumber, count: u64) -> Result<()> {
        let offset = self.block_offset(block)?;
        self.persist(offset, count.saturating_mul(self.block_size().as_u64()))
    }

    /// Zero `count` blocks starting at `block` and persist them.
    fn zero_blocks(&self, block: BlockNumber, count: u64) -> Result<()> {
        let zero = vec![0_u8; self.block_size().as_usize()];
        for i in 0..count {
            let target = block
                .checked_add(i)
                .ok_or_else(|| EfsError::Format("block number overflow".to_owned()))?;
            self.write_block(target, &zero)?;
        }
        self.persist_blocks(block, count)
    }
}

fn check_in_block(block_size: BlockSize, offset: usize, len: usize) -> Result<()> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| EfsError::Format("in-block range overflow".to_owned()))?;
    if end > block_size.as_usize() {
        return Err(EfsError::Format(format!(
            "in-block range out of bounds: offset={offset} len={len} block_size={block_size}"
        )));
    }
    Ok(())
}

fn check_range(offset: u64, len: usize, total: u64) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| EfsError::Format("access length overflows u64".to_owned()))?,
        )
        .ok_or_else(|| EfsError::Format("access range overflows u64".to_owned()))?;
    if end > total {
        return Err(EfsError::Format(format!(
            "access out of bounds: offset={offset} len={len} device_len={total}"
        )));
    }
    Ok(())
}

/// DRAM-backed device for tests and volatile stores.
///
/// `persist` is a counted no-op so tests can assert how many barriers a call
/// issued.
#[derive(Debug)]
pub struct MemPmemDevice {
    bytes: RwLock<Vec<u8>>,
    block_size: BlockSize,
    persist_calls: AtomicU64,
}

impl MemPmemDevice {
    #[must_use]
    pub fn new(block_size: BlockSize, block_count: u64) -> Self {
        let len = usize::try_from(block_count.saturating_mul(block_size.as_u64()))
            .unwrap_or(usize::MAX);
        Self {
            bytes: RwLock::new(vec![0_u8; len]),
            block_size,
            persist_calls: AtomicU64::new(0),
        }
    }

    /// Number of persist barriers issued so far.
    #[must_use]
    pub fn persist_calls(&self) -> u64 {
        self.persist_calls.load(Ordering::Relaxed)
    }
}

impl PmemDevice for MemPmemDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.read().len() as u64
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        check_range(offset, buf.len(), bytes.len() as u64)?;
        let start = usize::try_from(offset)
            .map_err(|_| EfsError::Format("offset overflows usize".to_owned()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        check_range(offset, buf.len(), bytes.len() as u64)?;
        let start = usize::try_from(offset)
            .map_err(|_| EfsError::Format("offset overflows usize".to_owned()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn persist(&self, _offset: u64, _len: u64) -> Result<()> {
        self.persist_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// File-backed device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not need a shared
/// seek position. `persist` maps to `sync_data`.
#[derive(Debug, Clone)]
pub struct FilePmemDevice {
    file: Arc<File>,
    len: u64,
    block_size: BlockSize,
}

impl FilePmemDevice {
    /// Open an existing image file read-write.
    pub fn open(path: impl AsRef<Path>, block_size: BlockSize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len % block_size.as_u64() != 0 {
            return Err(EfsError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size}"
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            len,
            block_size,
        })
    }

    /// Create (or truncate) an image file of `block_count` zeroed blocks.
    pub fn create(path: impl AsRef<Path>, block_size: BlockSize, block_count: u64) -> Result<Self> {
        let len = block_count
            .checked_mul(block_size.as_u64())
            .ok_or_else(|| EfsError::Format("image length overflows u64".to_owned()))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        tracing::debug!(
            target: "efs::block",
            path = %path.as_ref().display(),
            block_count,
            block_size = block_size.get(),
            "file_pmem_created"
        );
        Ok(Self {
            file: Arc::new(file),
            len,
            block_size,
        })
    }
}

impl PmemDevice for FilePmemDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn persist(&self, _offset: u64, _len: u64) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

impl<D: PmemDevice + ?Sized> PmemDevice for Arc<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn block_size(&self) -> BlockSize {
        (**self).block_size()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn persist(&self, offset: u64, len: u64) -> Result<()> {
        (**self).persist(offset, len)
    }
}

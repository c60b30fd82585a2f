//! Store configuration and device geometry.

use crate::write::WriteStrategy;
use efs_error::{EfsError, Result};
use efs_repair::ProtectionLayout;
use efs_types::{BlockNumber, BlockSize, InodeNumber};
use serde::{Deserialize, Serialize};

/// Size of one inode table slot.
pub const INODE_SLOT_SIZE: u64 = 64;

/// Switches fixed when the store is formatted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Reuse same-epoch extents instead of always copying.
    pub in_place_writes: bool,
    /// Per-strip CRC32C over file data.
    pub data_checksum: bool,
    /// Per-block XOR parity strip over file data.
    pub data_parity: bool,
    /// Shared writable mappings are copied on restore instead of mapped in place.
    pub mmap_cow: bool,
    /// Maintain the alternate log chain.
    pub metadata_replica: bool,
    /// Protection strip size in bytes.
    pub strip_size: usize,
    pub alloc_partitions: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            in_place_writes: false,
            data_checksum: false,
            data_parity: false,
            mmap_cow: false,
            metadata_replica: true,
            strip_size: 512,
            alloc_partitions: 4,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self, block_size: BlockSize) -> Result<()> {
        if self.strip_size < 64
            || !self.strip_size.is_power_of_two()
            || self.strip_size > block_size.as_usize()
        {
            return Err(EfsError::Format(format!(
                "strip_size {} must be a power of two in 64..={block_size}",
                self.strip_size
            )));
        }
        if self.alloc_partitions == 0 {
            return Err(EfsError::Format(
                "alloc_partitions must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn write_strategy(&self) -> WriteStrategy {
        if self.in_place_writes {
            WriteStrategy::InPlace
        } else {
            WriteStrategy::CopyOnWrite
        }
    }

    /// Whether data blocks carry any protection.
    #[must_use]
    pub fn protects_data(&self) -> bool {
        self.data_checksum || self.data_parity
    }

    /// Whether shared writable mappings need tracking at all.
    #[must_use]
    pub fn tracks_mappings(&self) -> bool {
        self.mmap_cow || self.protects_data()
    }
}

/// Device regions, in block order:
///
/// ```text
/// | 0: reserved | inode table | checksum table | parity table | data + log |
/// ```
///
/// Block 0 is never allocated, so a zero log position is always null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreGeometry {
    pub block_size: BlockSize,
    pub total_blocks: u64,
    pub inode_table_start: BlockNumber,
    pub inode_table_blocks: u64,
    pub inode_slots: u64,
    pub csum_start: BlockNumber,
    pub csum_blocks: u64,
    pub parity_start: BlockNumber,
    pub parity_blocks: u64,
    pub data_start: BlockNumber,
    pub data_blocks: u64,
    pub strip_size: usize,
}

impl StoreGeometry {
    pub fn compute(block_size: BlockSize, total_blocks: u64, config: &StoreConfig) -> Result<Self> {
        config.validate(block_size)?;
        let inode_table_blocks = (total_blocks / 1024).max(1);
        let reserved = 1 + inode_table_blocks;
        if total_blocks < reserved + 2 {
            return Err(EfsError::Format(format!(
                "device too small: {total_blocks} blocks"
            )));
        }
        let avail = total_blocks - reserved;
        let strip = config.strip_size;

        let tables = |data: u64| {
            let csum = if config.data_checksum {
                ProtectionLayout::csum_table_blocks(block_size, strip, data)
            } else {
                0
            };
            let parity = if config.data_parity {
                ProtectionLayout::parity_table_blocks(block_size, strip, data)
            } else {
                0
            };
            (csum, parity)
        };

        let per_block_overhead = {
            let mut bytes = 0_u64;
            if config.data_checksum {
                bytes += (ProtectionLayout::strips_per_block(block_size, strip) * 4) as u64;
            }
            if config.data_parity {
                bytes += strip as u64;
            }
            bytes
        };
        let bs = u128::from(block_size.as_u64());
        let estimate = u128::from(avail) * bs / (bs + u128::from(per_block_overhead));
        let mut data_blocks = u64::try_from(estimate).unwrap_or(avail);
        let (mut csum_blocks, mut parity_blocks) = tables(data_blocks);
        while data_blocks > 0 && data_blocks + csum_blocks + parity_blocks > avail {
            data_blocks -= 1;
            (csum_blocks, parity_blocks) = tables(data_blocks);
        }
        if data_blocks < 2 {
            return Err(EfsError::Format(format!(
                "device too small for its protection tables: {total_blocks} blocks"
            )));
        }

        let inode_table_start = BlockNumber(1);
        let csum_start = BlockNumber(1 + inode_table_blocks);
        let parity_start = BlockNumber(csum_start.0 + csum_blocks);
        let data_start = BlockNumber(parity_start.0 + parity_blocks);
        Ok(Self {
            block_size,
            total_blocks,
            inode_table_start,
            inode_table_blocks,
            inode_slots: inode_table_blocks * block_size.as_u64() / INODE_SLOT_SIZE,
            csum_start,
            csum_blocks,
            parity_start,
            parity_blocks,
            data_start,
            data_blocks,
            strip_size: strip,
        })
    }

    #[must_use]
    pub fn protection_layout(&self) -> ProtectionLayout {
        ProtectionLayout {
            data_start: self.data_start,
            data_blocks: self.data_blocks,
            csum_start: self.csum_start,
            parity_start: self.parity_start,
            strip_size: self.strip_size,
        }
    }

    /// Device byte offset of the inode table slot for `ino` (numbered from 1).
    pub fn inode_slot_offset(&self, ino: InodeNumber) -> Result<u64> {
        if ino.0 == 0 || ino.0 > self.inode_slots {
            return Err(EfsError::NotFound(format!("inode {ino}")));
        }
        Ok(self.inode_table_start.0 * self.block_size.as_u64() + (ino.0 - 1) * INODE_SLOT_SIZE)
    }
}

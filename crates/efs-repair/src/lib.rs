#![forbid(unsafe_code)]
//! Data protection for file blocks.
//!
//! Every data block is divided into strips of `strip_size` bytes. Two tables
//! live in reserved device regions, both indexed by the block's position in
//! the data region:
//!
//! - **Checksum table**: one CRC32C per strip.
//! - **Parity table**: one `strip_size` strip per block, the XOR of all the
//!   block's strips.
//!
//! Protection is always computed over whole, fully assembled blocks. Range
//! verification only checks the strips a read touches. Reconstruction is an
//! explicit operation: it finds the single strip whose checksum no longer
//! matches and rebuilds it from parity and the surviving strips.

use efs_block::PmemDevice;
use efs_error::{EfsError, Result};
use efs_types::{read_le_u32, BlockNumber, BlockSize};
use std::sync::Arc;

const CSUM_BYTES: usize = 4;

/// Where the protection tables live and which blocks they cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionLayout {
    pub data_start: BlockNumber,
    pub data_blocks: u64,
    pub csum_start: BlockNumber,
    pub parity_start: BlockNumber,
    pub strip_size: usize,
}

impl ProtectionLayout {
    #[must_use]
    pub fn strips_per_block(block_size: BlockSize, strip_size: usize) -> usize {
        block_size.as_usize() / strip_size
    }

    /// Blocks needed for the checksum table of `data_blocks` blocks.
    #[must_use]
    pub fn csum_table_blocks(block_size: BlockSize, strip_size: usize, data_blocks: u64) -> u64 {
        let per_block = (Self::strips_per_block(block_size, strip_size) * CSUM_BYTES) as u64;
        (data_blocks * per_block).div_ceil(block_size.as_u64())
    }

    /// Blocks needed for the parity table of `data_blocks` blocks.
    #[must_use]
    pub fn parity_table_blocks(block_size: BlockSize, strip_size: usize, data_blocks: u64) -> u64 {
        (data_blocks * strip_size as u64).div_ceil(block_size.as_u64())
    }
}

/// Computes, stores, verifies and repairs per-strip protection.
pub struct ProtectionUnit {
    device: Arc<dyn PmemDevice>,
    layout: ProtectionLayout,
    block_size: BlockSize,
    checksum: bool,
    parity: bool,
}

impl std::fmt::Debug for ProtectionUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectionUnit")
            .field("layout", &self.layout)
            .field("checksum", &self.checksum)
            .field("parity", &self.parity)
            .finish_non_exhaustive()
    }
}

impl ProtectionUnit {
    pub fn new(
        device: Arc<dyn PmemDevice>,
        layout: ProtectionLayout,
        checksum: bool,
        parity: bool,
    ) -> Result<Self> {
        let block_size = device.block_size();
        if layout.strip_size == 0
            || !layout.strip_size.is_power_of_two()
            || layout.strip_size > block_size.as_usize()
        {
            return Err(EfsError::Format(format!(
                "strip size {} does not divide block size {block_size}",
                layout.strip_size
            )));
        }
        Ok(Self {
            device,
            layout,
            block_size,
            checksum,
            parity,
        })
    }

    #[must_use]
    pub fn checksum_enabled(&self) -> bool {
        self.checksum
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.checksum || self.parity
    }

    fn strips(&self) -> usize {
        ProtectionLayout::strips_per_block(self.block_size, self.layout.strip_size)
    }

    fn data_index(&self, block: BlockNumber) -> Result<u64> {
        let start = self.layout.data_start.0;
        if block.0 < start || block.0 >= start + self.layout.data_blocks {
            return Err(EfsError::InvalidArgument(format!(
                "block {block} is outside the protected data region"
            )));
        }
        Ok(block.0 - start)
    }

    fn csum_offset(&self, index: u64) -> u64 {
        self.layout.csum_start.0 * self.block_size.as_u64()
            + index * (self.strips() * CSUM_BYTES) as u64
    }

    fn parity_offset(&self, index: u64) -> u64 {
        self.layout.parity_start.0 * self.block_size.as_u64()
            + index * self.layout.strip_size as u64
    }

    fn check_len(&self, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size.as_usize() {
            return Err(EfsError::InvalidArgument(format!(
                "protection needs a whole block: got {} bytes",
                data.len()
            )));
        }
        Ok(())
    }

    fn strip_crcs(&self, data: &[u8]) -> Vec<u32> {
        data.chunks(self.layout.strip_size)
            .map(crc32c::crc32c)
            .collect()
    }

    fn parity_of(&self, data: &[u8]) -> Vec<u8> {
        let mut parity = vec![0_u8; self.layout.strip_size];
        for strip in data.chunks(self.layout.strip_size) {
            for (p, b) in parity.iter_mut().zip(strip) {
                *p ^= *b;
            }
        }
        parity
    }

    fn stored_crcs(&self, index: u64) -> Result<Vec<u32>> {
        let mut raw = vec![0_u8; self.strips() * CSUM_BYTES];
        self.device.read_exact_at(self.csum_offset(index), &mut raw)?;
        (0..self.strips())
            .map(|i| {
                read_le_u32(&raw, i * CSUM_BYTES).map_err(|e| EfsError::Format(e.to_string()))
            })
            .collect()
    }

    /// Compute and persist checksums and parity for a fully assembled block.
    pub fn protect(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.check_len(data)?;
        let index = self.data_index(block)?;

        if self.checksum {
            let raw: Vec<u8> = self
                .strip_crcs(data)
                .iter()
                .flat_map(|crc| crc.to_le_bytes())
                .collect();
            let offset = self.csum_offset(index);
            self.device.write_all_at(offset, &raw)?;
            self.device.persist(offset, raw.len() as u64)?;
        }
        if self.parity {
            let parity = self.parity_of(data);
            let offset = self.parity_offset(index);
            self.device.write_all_at(offset, &parity)?;
            self.device.persist(offset, parity.len() as u64)?;
        }
        tracing::trace!(target: "efs::protect", block = block.0, "block_protected");
        Ok(())
    }

    /// Verify the strips of `data` (the whole content of `block`) that
    /// intersect `[offset, offset + len)`.
    pub fn verify(&self, block: BlockNumber, data: &[u8], offset: usize, len: usize) -> Result<()> {
        if !self.checksum || len == 0 {
            return Ok(());
        }
        self.check_len(data)?;
        let index = self.data_index(block)?;
        let strip = self.layout.strip_size;
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| {
                EfsError::InvalidArgument(format!("verify range {offset}+{len} exceeds block"))
            })?;

        let stored = self.stored_crcs(index)?;
        for i in offset / strip..=(end - 1) / strip {
            let computed = crc32c::crc32c(&data[i * strip..(i + 1) * strip]);
            if stored[i] != computed {
                tracing::error!(
                    target: "efs::protect",
                    block = block.0,
                    strip = i,
                    stored = stored[i],
                    computed,
                    "data_checksum_mismatch"
                );
                return Err(EfsError::DataCorrupt {
                    block: block.0,
                    detail: format!(
                        "strip {i}: stored {:#010x}, computed {computed:#010x}",
                        stored[i]
                    ),
                });
            }
        }
        Ok(())
    }

    /// Read `block` from the device and verify `[offset, offset + len)`.
    pub fn verify_range(&self, block: BlockNumber, offset: usize, len: usize) -> Result<()> {
        if !self.checksum || len == 0 {
            return Ok(());
        }
        let data = self.device.read_block(block)?;
        self.verify(block, data.as_slice(), offset, len)
    }

    /// Rebuild the single bad strip of `block` from parity.
    ///
    /// Returns the repaired strip, or `None` if every strip verified.
    pub fn reconstruct(&self, block: BlockNumber) -> Result<Option<usize>> {
        if !(self.checksum && self.parity) {
            return Err(EfsError::InvalidArgument(
                "reconstruction needs both checksums and parity".to_owned(),
            ));
        }
        let index = self.data_index(block)?;
        let mut data = self.device.read_block(block)?.into_inner();
        let stored = self.stored_crcs(index)?;
        let strip = self.layout.strip_size;

        let bad: Vec<usize> = self
            .strip_crcs(&data)
            .iter()
            .zip(&stored)
            .enumerate()
            .filter(|(_, (computed, stored))| computed != stored)
            .map(|(i, _)| i)
            .collect();
        let bad_strip = match bad.as_slice() {
            [] => return Ok(None),
            [one] => *one,
            many => {
                return Err(EfsError::DataCorrupt {
                    block: block.0,
                    detail: format!("{} bad strips, parity repairs one", many.len()),
                })
            }
        };

        let mut parity = vec![0_u8; strip];
        self.device
            .read_exact_at(self.parity_offset(index), &mut parity)?;
        for (i, chunk) in data.chunks(strip).enumerate() {
            if i == bad_strip {
                continue;
            }
            for (p, b) in parity.iter_mut().zip(chunk) {
                *p ^= *b;
            }
        }
        if crc32c::crc32c(&parity) != stored[bad_strip] {
            return Err(EfsError::DataCorrupt {
                block: block.0,
                detail: format!("strip {bad_strip}: parity does not reproduce the checksum"),
            });
        }

        data[bad_strip * strip..(bad_strip + 1) * strip].copy_from_slice(&parity);
        let offset = self.device.block_offset(block)? + (bad_strip * strip) as u64;
        self.device
            .write_all_at(offset, &data[bad_strip * strip..(bad_strip + 1) * strip])?;
        self.device.persist(offset, strip as u64)?;
        tracing::info!(
            target: "efs::protect",
            block = block.0,
            strip = bad_strip,
            "strip_reconstructed"
        );
        Ok(Some(bad_strip))
    }
}

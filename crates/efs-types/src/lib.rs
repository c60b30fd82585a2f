#![forbid(unsafe_code)]
//! Unit-carrying newtypes shared by every EpochFS crate.
//!
//! Physical block numbers, logical page indices, log positions and epochs are
//! all `u64` underneath. Keeping them as distinct types stops a logical page
//! from being handed to the allocator or a log byte address from being read as
//! a block.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default block (and logical page) size.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Physical block number on the persistent-memory device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    /// Block `n` positions after this one, `None` on overflow.
    #[must_use]
    pub fn checked_add(self, n: u64) -> Option<Self> {
        self.0.checked_add(n).map(Self)
    }
}

/// Logical page index within a file (byte offset divided by block size).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageIndex(pub u64);

impl PageIndex {
    #[must_use]
    pub fn checked_add(self, n: u64) -> Option<Self> {
        self.0.checked_add(n).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Store-wide generation counter.
///
/// Two writes to the same logical range in the same epoch may be coalesced
/// in place; a write in a later epoch always forks a new extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EpochId(pub u64);

/// Byte address of a record inside a write log.
///
/// Zero is the null position: no log page is ever placed at device block 0,
/// so a zero link inside a chain always means the chain is broken.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogPosition(pub u64);

impl LogPosition {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// External identity of a memory mapping, supplied by the mapping subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MappingId(pub u64);

/// Validated block size (must be a power of two in 1024..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [1024, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(1024..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 1024..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        u64::from(self.0)
    }

    /// Block size as a `usize` (always fits: at most 64 KiB).
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Logical page containing `byte_offset`.
    #[must_use]
    pub fn page_of(self, byte_offset: u64) -> PageIndex {
        PageIndex(byte_offset >> self.shift())
    }

    /// Offset of `byte_offset` inside its page.
    #[must_use]
    pub fn offset_in_page(self, byte_offset: u64) -> usize {
        // Masked by the block size, so it always fits.
        #[expect(clippy::cast_possible_truncation)]
        let offset = (byte_offset & (self.as_u64() - 1)) as usize;
        offset
    }

    /// Number of pages touched by `count` bytes starting at in-page `offset`.
    #[must_use]
    pub fn pages_spanned(self, offset: usize, count: usize) -> u64 {
        if count == 0 {
            return 0;
        }
        let last = offset + count - 1;
        (last as u64 >> self.shift()) + 1
    }

    /// Byte offset of the first byte of `block`, `None` on overflow.
    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> Option<u64> {
        block.0.checked_mul(self.as_u64())
    }

    /// Byte offset of the first byte of logical `page`, `None` on overflow.
    #[must_use]
    pub fn page_to_byte(self, page: PageIndex) -> Option<u64> {
        page.0.checked_mul(self.as_u64())
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self(DEFAULT_BLOCK_SIZE)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EpochId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for MappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_helpers() {
        let mut bytes = [0_u8; 12];
        write_le_u32(&mut bytes, 0, 0x5678_1234);
        write_le_u64(&mut bytes, 4, 0x90AB_CDEF_0011_2233);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u64(&bytes, 4).expect("u64"), 0x90AB_CDEF_0011_2233);
        assert!(matches!(
            read_le_u64(&bytes, 8),
            Err(ParseError::InsufficientData { needed: 8, .. })
        ));
    }

    #[test]
    fn test_block_size_validation() {
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(1024).is_ok());
        assert!(BlockSize::new(65536).is_ok());
        assert_eq!(BlockSize::new(4096).unwrap().shift(), 12);

        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(512).is_err());
        assert!(BlockSize::new(131_072).is_err());
        assert!(BlockSize::new(0).is_err());
    }

    #[test]
    fn test_page_math() {
        let bs = BlockSize::new(4096).unwrap();
        assert_eq!(bs.page_of(0), PageIndex(0));
        assert_eq!(bs.page_of(4095), PageIndex(0));
        assert_eq!(bs.page_of(4096), PageIndex(1));
        assert_eq!(bs.offset_in_page(4090), 4090);
        assert_eq!(bs.offset_in_page(8193), 1);

        assert_eq!(bs.pages_spanned(0, 0), 0);
        assert_eq!(bs.pages_spanned(0, 1), 1);
        assert_eq!(bs.pages_spanned(0, 4096), 1);
        assert_eq!(bs.pages_spanned(0, 4097), 2);
        assert_eq!(bs.pages_spanned(4090, 10), 2);
        assert_eq!(bs.pages_spanned(0, 10_000), 3);

        assert_eq!(bs.block_to_byte(BlockNumber(3)), Some(12_288));
        assert_eq!(bs.page_to_byte(PageIndex(u64::MAX)), None);
    }

    #[test]
    fn null_log_position() {
        assert!(LogPosition::NULL.is_null());
        assert!(!LogPosition(64).is_null());
        assert_eq!(LogPosition::default(), LogPosition::NULL);
    }
}

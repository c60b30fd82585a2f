#![forbid(unsafe_code)]
//! EpochFS public API facade.
//!
//! Re-exports the store from `efs-core` together with the device, allocator,
//! error and unit types a caller needs to drive it. The CLI depends on this
//! crate only.

pub use efs_alloc::{BitmapAllocator, ExtentAllocator};
pub use efs_block::{FilePmemDevice, MemPmemDevice, PmemDevice};
pub use efs_core::*;
pub use efs_error::{EfsError, Result};
pub use efs_types::{BlockNumber, BlockSize, EpochId, InodeNumber, LogPosition, MappingId, PageIndex};

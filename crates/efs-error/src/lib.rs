#![forbid(unsafe_code)]
//! Error types for EpochFS.
//!
//! # Error Taxonomy
//!
//! | Variant | Raised by | errno |
//! |---------|-----------|-------|
//! | `InvalidArgument` | bad buffer, length, position, or mapping request | `EINVAL` |
//! | `NoSpace` | extent allocator exhausted | `ENOSPC` |
//! | `NoLogSpace` | no block left for a new log page | `ENOSPC` |
//! | `LogCorrupt` | broken log chain or unparseable record | `EIO` |
//! | `DataCorrupt` | checksum mismatch on file data | `EIO` |
//! | `WriteBlockedByMapping` | copy-on-write write against a live in-place mapping | `EACCES` |
//! | `Corruption` | allocator or inode-table inconsistency (double free, bad slot) | `EIO` |
//! | `Format` | geometry or configuration that cannot be used | `EINVAL` |
//! | `NotFound` | unknown inode or mapping | `ENOENT` |
//! | `Io` | device I/O failure | raw OS error, else `EIO` |
//!
//! ## Propagation Policy
//!
//! - `LogCorrupt` is always fatal to the call that observed it. The log chain
//!   can no longer be trusted, so callers surface it rather than retrying.
//! - `DataCorrupt` is surfaced as an I/O error on the triggering operation.
//!   The write and read paths never repair data on their own; reconstruction
//!   from parity is a separate, explicit operation.
//! - Allocation and append failures inside a write loop are rolled back by the
//!   write engine before they reach the caller. If an earlier chunk already
//!   committed, the caller sees a short write instead of the error.

use thiserror::Error;

/// Unified error type for all EpochFS operations.
#[derive(Debug, Error)]
pub enum EfsError {
    /// Device I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller passed an unusable buffer, length, offset or handle.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The extent allocator has no free blocks left.
    #[error("no space left on device")]
    NoSpace,

    /// A log record could not be appended because no log page was available.
    #[error("no space left for log entries")]
    NoLogSpace,

    /// The write log is not a connected chain of valid records.
    ///
    /// `position` is the log byte address where the walk stopped.
    #[error("corrupt write log at {position:#x}: {detail}")]
    LogCorrupt { position: u64, detail: String },

    /// File data failed checksum verification.
    #[error("data checksum mismatch at block {block}: {detail}")]
    DataCorrupt { block: u64, detail: String },

    /// Copy-on-write writers and direct in-place mappings are mutually
    /// exclusive on the same inode.
    #[error("write blocked by an active shared writable mapping")]
    WriteBlockedByMapping,

    /// Metadata inconsistency detected outside the log (allocator bitmap,
    /// inode table).
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Geometry or configuration that the store cannot operate with.
    #[error("invalid format: {0}")]
    Format(String),

    /// Unknown inode, mapping or other named object.
    #[error("not found: {0}")]
    NotFound(String),
}

impl EfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; adding a variant without assigning an errno
    /// is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidArgument(_) | Self::Format(_) => libc::EINVAL,
            Self::NoSpace | Self::NoLogSpace => libc::ENOSPC,
            Self::LogCorrupt { .. } | Self::DataCorrupt { .. } | Self::Corruption { .. } => {
                libc::EIO
            }
            Self::WriteBlockedByMapping => libc::EACCES,
            Self::NotFound(_) => libc::ENOENT,
        }
    }

    /// True for errors that mean stored bytes can no longer be trusted.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::LogCorrupt { .. } | Self::DataCorrupt { .. } | Self::Corruption { .. }
        )
    }
}

/// Result alias using `EfsError`.
pub type Result<T> = std::result::Result<T, EfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(EfsError, libc::c_int)> = vec![
            (EfsError::Io(std::io::Error::other("test")), libc::EIO),
            (EfsError::InvalidArgument("len".into()), libc::EINVAL),
            (EfsError::NoSpace, libc::ENOSPC),
            (EfsError::NoLogSpace, libc::ENOSPC),
            (
                EfsError::LogCorrupt {
                    position: 64,
                    detail: "null link".into(),
                },
                libc::EIO,
            ),
            (
                EfsError::DataCorrupt {
                    block: 7,
                    detail: "strip 0".into(),
                },
                libc::EIO,
            ),
            (EfsError::WriteBlockedByMapping, libc::EACCES),
            (
                EfsError::Corruption {
                    block: 3,
                    detail: "double free".into(),
                },
                libc::EIO,
            ),
            (EfsError::Format("strip".into()), libc::EINVAL),
            (EfsError::NotFound("inode 9".into()), libc::ENOENT),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(EfsError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = EfsError::LogCorrupt {
            position: 0x2000,
            detail: "null next-page link".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt write log at 0x2000: null next-page link"
        );

        let data = EfsError::DataCorrupt {
            block: 42,
            detail: "strip 3".into(),
        };
        assert_eq!(data.to_string(), "data checksum mismatch at block 42: strip 3");
        assert_eq!(
            EfsError::WriteBlockedByMapping.to_string(),
            "write blocked by an active shared writable mapping"
        );
    }

    #[test]
    fn corruption_classification() {
        assert!(EfsError::DataCorrupt {
            block: 1,
            detail: String::new()
        }
        .is_corruption());
        assert!(!EfsError::NoSpace.is_corruption());
        assert!(!EfsError::WriteBlockedByMapping.is_corruption());
    }
}

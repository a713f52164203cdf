#![forbid(unsafe_code)]
//! Error types for the partial parity log.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `ppl-types` | Byte-level header/entry format violations |
//! | Runtime | `PplError` | `ppl-error` (this crate) | Errors returned to the array layer and CLI |
//!
//! Only configuration and recovery paths return `PplError` to callers. The
//! steady-state write path never fails outward: pool exhaustion parks the
//! stripe on the retry queue, and log write failures are reported by marking
//! the member faulty through the stripe cache.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` / `Parse` | `EINVAL` |
//! | `InvalidConfig` | `EINVAL` |
//! | `UnsupportedBlockSize` | `EINVAL` |
//! | `LogTooSmall` | `ENOSPC` |
//! | `LogOverlap` | `EINVAL` |
//! | `IncompatiblePolicy` | `EINVAL` |
//! | `TooManyDisks` | `EINVAL` |
//! | `RecoveryMismatch` | `EINVAL` |
//! | `MemberFaulty` | `EIO` |
//! | `Cancelled` | `EINTR` |

use ppl_types::ParseError;
use thiserror::Error;

/// Unified error type for partial parity log operations.
#[derive(Debug, Error)]
pub enum PplError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Log contents on a member failed validation at a known sector.
    #[error("corrupt log on disk {disk} at sector {sector}: {detail}")]
    Corruption {
        disk: u32,
        sector: u64,
        detail: String,
    },

    /// Structurally invalid request or on-disk layout.
    #[error("invalid format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the caller.
    #[error("parse error: {0}")]
    Parse(String),

    /// Array configuration rejected at initialization.
    #[error("invalid array configuration: {0}")]
    InvalidConfig(String),

    /// Log or array sector size that this build cannot express.
    #[error("unsupported block size: {0}")]
    UnsupportedBlockSize(String),

    /// Reserved log region cannot hold a header plus one stripe of partial parity.
    #[error("log space too small on disk {disk}: need {needed} bytes, have {available}")]
    LogTooSmall {
        disk: u32,
        needed: u64,
        available: u64,
    },

    /// Log region overlaps data or metadata on a member.
    #[error("log space overlaps on disk {disk}: {detail}")]
    LogOverlap { disk: u32, detail: String },

    /// Another logging policy (journal, bitmap) is already active on the array.
    #[error("incompatible with active policy: {0}")]
    IncompatiblePolicy(String),

    /// Array wider than the member flush mask.
    #[error("array has {disks} disks, at most {max} supported")]
    TooManyDisks { disks: u32, max: u32 },

    /// Enabling the log on a running array found inconsistent log contents.
    #[error("log recovery found {mismatches} mismatched entries")]
    RecoveryMismatch { mismatches: u64 },

    /// The member holding the log is missing or has been failed.
    #[error("member disk {0} is faulty")]
    MemberFaulty(u32),

    /// Operation interrupted before completion.
    #[error("operation cancelled")]
    Cancelled,
}

impl PplError {
    /// Convert this error into a POSIX errno for the array layer.
    ///
    /// The mapping is exhaustive; adding a variant is a compile error until
    /// its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::MemberFaulty(_) => libc::EIO,
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidConfig(_)
            | Self::UnsupportedBlockSize(_)
            | Self::LogOverlap { .. }
            | Self::IncompatiblePolicy(_)
            | Self::TooManyDisks { .. }
            | Self::RecoveryMismatch { .. } => libc::EINVAL,
            Self::LogTooSmall { .. } => libc::ENOSPC,
            Self::Cancelled => libc::EINTR,
        }
    }
}

impl From<ParseError> for PplError {
    fn from(err: ParseError) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Result alias using `PplError`.
pub type Result<T> = std::result::Result<T, PplError>;

#![forbid(unsafe_code)]
//! Shared newtypes and on-disk constants for the partial parity log.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Memory page size; one partial-parity page per stripe.
pub const PAGE_SIZE: usize = 4096;
/// Canonical sector size (512 bytes).
pub const SECTOR_SIZE: u32 = 512;

/// Size of one PPL header on disk.
pub const PPL_HEADER_SIZE: usize = 4096;
/// Bytes at the start of the header reserved for external metadata (filled with 0xff).
pub const PPL_HDR_RESERVED: usize = 512;
/// Size of one encoded header entry.
pub const PPL_ENTRY_SIZE: usize = 24;
/// Offset of the first entry inside the header.
pub const PPL_ENTRIES_OFFSET: usize = PPL_HDR_RESERVED + 4 + 4 + 8 + 4 + 4;
/// Number of entries that fit into one header.
pub const PPL_HDR_MAX_ENTRIES: usize = (PPL_HEADER_SIZE - PPL_ENTRIES_OFFSET) / PPL_ENTRY_SIZE;
/// Slot size used when a log region holds more than one record.
pub const PPL_SPACE_SIZE: usize = 128 * 1024;

/// Widest array supported; bounded by the width of [`DiskMask`].
pub const MAX_MEMBER_DISKS: u32 = 64;

/// Index of a member disk within the array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DiskIndex(pub u32);

impl DiskIndex {
    #[must_use]
    pub fn as_usize(self) -> usize {
        // u32 always fits usize on supported targets.
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

/// Array-logical or member sector, in units of the array's sector size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sector(pub u64);

impl Sector {
    #[must_use]
    pub fn checked_add(self, sectors: u64) -> Option<Self> {
        self.0.checked_add(sectors).map(Self)
    }
}

/// Stripe identifier assigned by the stripe cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StripeId(pub u64);

/// Set of member disks, one bit per [`DiskIndex`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiskMask(u64);

impl DiskMask {
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Mask with one bit set; disks beyond the mask width are ignored.
    #[must_use]
    pub fn single(disk: DiskIndex) -> Self {
        Self(1_u64.checked_shl(disk.0).unwrap_or(0))
    }

    #[must_use]
    pub fn with(self, disk: DiskIndex) -> Self {
        Self(self.0 | Self::single(disk).0)
    }

    #[must_use]
    pub fn without(self, disk: DiskIndex) -> Self {
        Self(self.0 & !Self::single(disk).0)
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn contains(self, disk: DiskIndex) -> bool {
        disk.0 < MAX_MEMBER_DISKS && self.0 & Self::single(disk).0 != 0
    }

    #[must_use]
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate members in ascending index order.
    pub fn iter(self) -> impl Iterator<Item = DiskIndex> {
        (0..MAX_MEMBER_DISKS)
            .map(DiskIndex)
            .filter(move |disk| self.contains(*disk))
    }
}

impl FromIterator<DiskIndex> for DiskMask {
    fn from_iter<I: IntoIterator<Item = DiskIndex>>(iter: I) -> Self {
        iter.into_iter().fold(Self::EMPTY, Self::with)
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
    #[error("invalid signature: expected {expected:#010x}, got {actual:#010x}")]
    InvalidSignature { expected: u32, actual: u32 },
    #[error("checksum mismatch in {structure}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        structure: &'static str,
        stored: u32,
        computed: u32,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
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

/// Write `value` little-endian at `offset`; the caller guarantees the range is in bounds.
#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

impl fmt::Display for DiskIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for StripeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

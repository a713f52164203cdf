//! CRC-32C (Castagnoli) helpers.
//!
//! Three checksums appear in a log region:
//!
//! - the per-entry partial parity checksum, kept as a *raw* running CRC while
//!   the entry grows and complemented once when the header is written;
//! - the header checksum, a standard CRC-32C over the whole header with the
//!   checksum field zeroed;
//! - the signature, a standard CRC-32C of the array UUID.
//!
//! `crc32c::crc32c_append(c, data)` complements its input and output, so a raw
//! update from state `s` is `!crc32c_append(!s, data)`. Starting from
//! `0xffff_ffff` and complementing at the end yields `crc32c::crc32c` of the
//! concatenated input, which is what a recovery scan recomputes.

use ppl_types::{PPL_HEADER_SIZE, ensure_slice};

/// Byte offset of the header checksum field.
pub const HEADER_CHECKSUM_OFFSET: usize = 532;

/// Running checksum over the partial parity pages of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpChecksum {
    raw: u32,
}

impl PpChecksum {
    /// Initial raw state (`~0`).
    pub const INIT: u32 = 0xffff_ffff;

    #[must_use]
    pub fn new() -> Self {
        Self { raw: Self::INIT }
    }

    /// Resume from a raw (not yet complemented) state.
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self { raw }
    }

    /// Fold `page` into the running value without recomputing earlier pages.
    pub fn update(&mut self, page: &[u8]) {
        self.raw = !crc32c::crc32c_append(!self.raw, page);
    }

    #[must_use]
    pub fn raw(self) -> u32 {
        self.raw
    }

    /// One's-complement of the raw state; the value stored on disk.
    #[must_use]
    pub fn finalize(self) -> u32 {
        !self.raw
    }
}

impl Default for PpChecksum {
    fn default() -> Self {
        Self::new()
    }
}

/// Standard CRC-32C of a header with its checksum field treated as zero.
///
/// `header` must hold at least [`PPL_HEADER_SIZE`] bytes; only the first
/// `PPL_HEADER_SIZE` are covered.
pub fn header_checksum(header: &[u8]) -> Result<u32, ppl_types::ParseError> {
    let header = ensure_slice(header, 0, PPL_HEADER_SIZE)?;
    let crc = crc32c::crc32c(&header[..HEADER_CHECKSUM_OFFSET]);
    let crc = crc32c::crc32c_append(crc, &[0_u8; 4]);
    Ok(crc32c::crc32c_append(
        crc,
        &header[HEADER_CHECKSUM_OFFSET + 4..],
    ))
}

/// Log signature for arrays with native metadata.
#[must_use]
pub fn signature_from_uuid(uuid: &[u8; 16]) -> u32 {
    crc32c::crc32c(uuid)
}

//! Log header and entry table.
//!
//! ```text
//! Header (4096 bytes, little-endian):
//! +--------------------+---------+
//! | reserved (0xff)    | 512     |
//! | signature          | 4       |
//! | padding            | 4       |
//! | generation         | 8       |
//! | entries_count      | 4       |
//! | checksum           | 4       |
//! | entries[148]       | 24 each |
//! +--------------------+---------+
//!
//! Entry (24 bytes):
//! +--------------------+---------+
//! | data_sector        | 8       |  log block units
//! | pp_size            | 4       |  bytes of partial parity
//! | data_size          | 4       |  bytes of data covered
//! | parity_disk        | 4       |
//! | checksum           | 4       |  CRC-32C of the pp bytes
//! +--------------------+---------+
//! ```
//!
//! The partial parity pages of every entry follow the header in entry order.

use crate::checksum::{HEADER_CHECKSUM_OFFSET, header_checksum};
use ppl_types::{
    PPL_ENTRIES_OFFSET, PPL_ENTRY_SIZE, PPL_HDR_MAX_ENTRIES, PPL_HDR_RESERVED, PPL_HEADER_SIZE,
    ParseError, ensure_slice, read_le_u32, read_le_u64, write_le_u32, write_le_u64,
};
use serde::Serialize;

const SIGNATURE_OFFSET: usize = PPL_HDR_RESERVED;
const GENERATION_OFFSET: usize = PPL_HDR_RESERVED + 8;
const ENTRIES_COUNT_OFFSET: usize = PPL_HDR_RESERVED + 16;

/// One entry as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PplHeaderEntry {
    pub data_sector: u64,
    pub pp_size: u32,
    pub data_size: u32,
    pub parity_disk: u32,
    pub checksum: u32,
}

impl PplHeaderEntry {
    fn encode(&self, out: &mut [u8]) {
        write_le_u64(out, 0, self.data_sector);
        write_le_u32(out, 8, self.pp_size);
        write_le_u32(out, 12, self.data_size);
        write_le_u32(out, 16, self.parity_disk);
        write_le_u32(out, 20, self.checksum);
    }

    fn parse(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            data_sector: read_le_u64(bytes, offset)?,
            pp_size: read_le_u32(bytes, offset + 8)?,
            data_size: read_le_u32(bytes, offset + 12)?,
            parity_disk: read_le_u32(bytes, offset + 16)?,
            checksum: read_le_u32(bytes, offset + 20)?,
        })
    }
}

/// Parsed log header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PplHeader {
    pub signature: u32,
    pub generation: u64,
    pub checksum: u32,
    pub entries: Vec<PplHeaderEntry>,
}

impl PplHeader {
    /// Total partial parity bytes that follow this header.
    #[must_use]
    pub fn pp_bytes(&self) -> u64 {
        self.entries.iter().map(|e| u64::from(e.pp_size)).sum()
    }
}

/// Serialize a header into `buf`, returning the header checksum.
///
/// The first [`PPL_HEADER_SIZE`] bytes of `buf` are overwritten; the reserved
/// area is filled with `0xff` and unused entry slots are zeroed.
pub fn encode_header_into(
    buf: &mut [u8],
    signature: u32,
    generation: u64,
    entries: &[PplHeaderEntry],
) -> Result<u32, ParseError> {
    ensure_slice(buf, 0, PPL_HEADER_SIZE)?;
    if entries.len() > PPL_HDR_MAX_ENTRIES {
        return Err(ParseError::InvalidField {
            field: "entries_count",
            reason: "exceeds header capacity",
        });
    }
    let count = u32::try_from(entries.len()).map_err(|_| ParseError::IntegerConversion {
        field: "entries_count",
    })?;

    let header = &mut buf[..PPL_HEADER_SIZE];
    header[..PPL_HDR_RESERVED].fill(0xff);
    header[PPL_HDR_RESERVED..].fill(0);
    write_le_u32(header, SIGNATURE_OFFSET, signature);
    write_le_u64(header, GENERATION_OFFSET, generation);
    write_le_u32(header, ENTRIES_COUNT_OFFSET, count);
    for (idx, entry) in entries.iter().enumerate() {
        let start = PPL_ENTRIES_OFFSET + idx * PPL_ENTRY_SIZE;
        entry.encode(&mut header[start..start + PPL_ENTRY_SIZE]);
    }

    let crc = header_checksum(header)?;
    write_le_u32(header, HEADER_CHECKSUM_OFFSET, crc);
    Ok(crc)
}

/// Header with no entries and generation zero, written after a log is loaded.
pub fn encode_empty_header(signature: u32) -> Result<Vec<u8>, ParseError> {
    let mut buf = vec![0_u8; PPL_HEADER_SIZE];
    encode_header_into(&mut buf, signature, 0, &[])?;
    Ok(buf)
}

/// Parse header fields without checking the checksum or signature.
pub fn parse_header(bytes: &[u8]) -> Result<PplHeader, ParseError> {
    let header = ensure_slice(bytes, 0, PPL_HEADER_SIZE)?;
    let count = read_le_u32(header, ENTRIES_COUNT_OFFSET)?;
    let count = usize::try_from(count).map_err(|_| ParseError::IntegerConversion {
        field: "entries_count",
    })?;
    if count > PPL_HDR_MAX_ENTRIES {
        return Err(ParseError::InvalidField {
            field: "entries_count",
            reason: "exceeds header capacity",
        });
    }

    let entries = (0..count)
        .map(|idx| PplHeaderEntry::parse(header, PPL_ENTRIES_OFFSET + idx * PPL_ENTRY_SIZE))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PplHeader {
        signature: read_le_u32(header, SIGNATURE_OFFSET)?,
        generation: read_le_u64(header, GENERATION_OFFSET)?,
        checksum: read_le_u32(header, HEADER_CHECKSUM_OFFSET)?,
        entries,
    })
}

/// Parse a header and verify its checksum and, when given, its signature.
pub fn validate_header(
    bytes: &[u8],
    expected_signature: Option<u32>,
) -> Result<PplHeader, ParseError> {
    let header = parse_header(bytes)?;
    let computed = header_checksum(bytes)?;
    if computed != header.checksum {
        return Err(ParseError::ChecksumMismatch {
            structure: "ppl_header",
            stored: header.checksum,
            computed,
        });
    }
    if let Some(expected) = expected_signature {
        if header.signature != expected {
            return Err(ParseError::InvalidSignature {
                expected,
                actual: header.signature,
            });
        }
    }
    Ok(header)
}

#![forbid(unsafe_code)]
//! On-disk format for partial parity log regions.
//!
//! Pure codec crate with no I/O. Encodes and parses the 4 KiB log header and
//! its entry table, and provides the CRC-32C helpers shared by the writer and
//! the recovery scan.

pub mod checksum;
pub mod header;

pub use checksum::{PpChecksum, header_checksum, signature_from_uuid};
pub use header::{
    PplHeader, PplHeaderEntry, encode_empty_header, encode_header_into, parse_header,
    validate_header,
};

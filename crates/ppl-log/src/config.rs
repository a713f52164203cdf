//! Array and log configuration with validation.
//!
//! All member offsets and sizes are expressed in array sectors
//! (`sector_size` bytes each), relative to the start of the member device.

use ppl_error::{PplError, Result};
use ppl_types::{
    DiskIndex, MAX_MEMBER_DISKS, PAGE_SIZE, PPL_HEADER_SIZE, PPL_SPACE_SIZE, SECTOR_SIZE,
};
use serde::{Deserialize, Serialize};

/// Default number of chained pages per physical log request.
pub const DEFAULT_MAX_REQUEST_PAGES: usize = 256;

/// How array metadata is stored, which decides the log signature and block size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetadataKind {
    /// Metadata owned by the array; the signature derives from the array UUID.
    Native { uuid: [u8; 16] },
    /// Metadata owned by an external manager; the signature is adopted from disk.
    External { logical_block_size: u32 },
}

/// Lifecycle point at which the log is being enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayState {
    /// Array is being assembled; `dirty` means it was not shut down cleanly.
    Assemble { dirty: bool },
    /// Log policy is being switched on for an array that is already running.
    Running,
}

/// Per-member placement and state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub log_offset: u64,
    pub log_size: u64,
    pub data_offset: u64,
    pub data_sectors: u64,
    /// Sectors at the member start holding the array superblock.
    #[serde(default)]
    pub superblock_sectors: u64,
    #[serde(default = "default_true")]
    pub present: bool,
    #[serde(default = "default_true")]
    pub in_sync: bool,
    #[serde(default)]
    pub write_back_cache: bool,
}

fn default_true() -> bool {
    true
}

/// Tunables that do not affect the on-disk format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTuning {
    /// Records that may be allocated at once across all disks.
    /// `None` means four per member disk.
    #[serde(default)]
    pub max_inflight_records: Option<usize>,
    #[serde(default = "default_max_request_pages")]
    pub max_request_pages: usize,
}

fn default_max_request_pages() -> usize {
    DEFAULT_MAX_REQUEST_PAGES
}

impl Default for LogTuning {
    fn default() -> Self {
        Self {
            max_inflight_records: None,
            max_request_pages: DEFAULT_MAX_REQUEST_PAGES,
        }
    }
}

/// Everything the log needs to know about the array it protects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayConfig {
    pub raid_level: u32,
    pub raid_disks: u32,
    pub chunk_sectors: u64,
    #[serde(default = "default_sector_size")]
    pub sector_size: u32,
    pub metadata: MetadataKind,
    #[serde(default)]
    pub has_bitmap: bool,
    #[serde(default)]
    pub has_journal: bool,
    pub state: ArrayState,
    pub members: Vec<MemberConfig>,
    #[serde(default)]
    pub tuning: LogTuning,
}

fn default_sector_size() -> u32 {
    SECTOR_SIZE
}

/// Placement of one member's log region in bytes, after rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LogRegion {
    pub offset: u64,
    pub size: u64,
    /// Region holds successive records instead of rewriting one slot.
    pub multi_slot: bool,
    /// Partial parity bytes one record may carry.
    pub entry_space: u64,
}

impl LogRegion {
    /// Round the raw region down to whole pages after the header and pick the slot layout.
    ///
    /// Returns `None` when less than a header plus one page remains.
    #[must_use]
    pub fn from_bytes(offset: u64, raw_size: u64) -> Option<Self> {
        let header = PPL_HEADER_SIZE as u64;
        let page = PAGE_SIZE as u64;
        let body = raw_size.checked_sub(header)?;
        let body = body - body % page;
        if body < page {
            return None;
        }
        let size = header + body;
        let multi_slot = size >= 2 * (PPL_SPACE_SIZE as u64 + header);
        let entry_space = if multi_slot {
            PPL_SPACE_SIZE as u64
        } else {
            body
        };
        Some(Self {
            offset,
            size,
            multi_slot,
            entry_space,
        })
    }
}

fn is_pow2_in(value: u32, min: u32, max: u32) -> bool {
    value.is_power_of_two() && (min..=max).contains(&value)
}

fn overlaps(a_start: u64, a_len: u64, b_start: u64, b_len: u64) -> bool {
    a_len > 0
        && b_len > 0
        && a_start < b_start.saturating_add(b_len)
        && b_start < a_start.saturating_add(a_len)
}

impl ArrayConfig {
    /// Log block size in bytes: the array sector size for native metadata,
    /// the device logical block size for external metadata.
    #[must_use]
    pub fn block_size(&self) -> u32 {
        match self.metadata {
            MetadataKind::Native { .. } => self.sector_size,
            MetadataKind::External { logical_block_size } => logical_block_size,
        }
    }

    #[must_use]
    pub fn data_disks(&self) -> u32 {
        self.raid_disks.saturating_sub(1)
    }

    #[must_use]
    pub fn max_inflight_records(&self) -> usize {
        self.tuning.max_inflight_records.unwrap_or_else(|| {
            usize::try_from(self.raid_disks)
                .unwrap_or(usize::MAX)
                .saturating_mul(4)
        })
    }

    /// Byte geometry of a member's log region.
    pub fn log_region(&self, disk: DiskIndex) -> Result<LogRegion> {
        let member = self.members.get(disk.as_usize()).ok_or_else(|| {
            PplError::InvalidConfig(format!("no member descriptor for disk {disk}"))
        })?;
        let sector = u64::from(self.sector_size);
        let offset = member
            .log_offset
            .checked_mul(sector)
            .ok_or_else(|| PplError::InvalidConfig("log offset overflows".to_owned()))?;
        let raw = member
            .log_size
            .checked_mul(sector)
            .ok_or_else(|| PplError::InvalidConfig("log size overflows".to_owned()))?;
        LogRegion::from_bytes(offset, raw).ok_or(PplError::LogTooSmall {
            disk: disk.0,
            needed: (PPL_HEADER_SIZE + PAGE_SIZE) as u64,
            available: raw,
        })
    }

    /// Check every rule the log relies on. Errors are fatal to initialization.
    pub fn validate(&self) -> Result<()> {
        if self.raid_level != 5 {
            return Err(PplError::InvalidConfig(format!(
                "raid_level={} (partial parity log requires raid5)",
                self.raid_level
            )));
        }
        if self.has_bitmap {
            return Err(PplError::IncompatiblePolicy(
                "write-intent bitmap is active".to_owned(),
            ));
        }
        if self.has_journal {
            return Err(PplError::IncompatiblePolicy("journal is active".to_owned()));
        }
        if self.raid_disks > MAX_MEMBER_DISKS {
            return Err(PplError::TooManyDisks {
                disks: self.raid_disks,
                max: MAX_MEMBER_DISKS,
            });
        }
        if self.raid_disks < 3 {
            return Err(PplError::InvalidConfig(format!(
                "raid_disks={} (need at least 3)",
                self.raid_disks
            )));
        }
        if self.members.len() != self.raid_disks as usize {
            return Err(PplError::InvalidConfig(format!(
                "{} member descriptors for raid_disks={}",
                self.members.len(),
                self.raid_disks
            )));
        }
        if !is_pow2_in(self.sector_size, SECTOR_SIZE, PAGE_SIZE as u32) {
            return Err(PplError::UnsupportedBlockSize(format!(
                "sector_size={}",
                self.sector_size
            )));
        }
        let block_size = self.block_size();
        if !is_pow2_in(block_size, SECTOR_SIZE, PAGE_SIZE as u32) || block_size < self.sector_size
        {
            return Err(PplError::UnsupportedBlockSize(format!(
                "block_size={block_size} sector_size={}",
                self.sector_size
            )));
        }
        let chunk_bytes = self.chunk_sectors.saturating_mul(u64::from(self.sector_size));
        if !self.chunk_sectors.is_power_of_two() || chunk_bytes < PAGE_SIZE as u64 {
            return Err(PplError::InvalidConfig(format!(
                "chunk_sectors={} (must be a power of two of at least one page)",
                self.chunk_sectors
            )));
        }
        if self.tuning.max_request_pages == 0 || self.max_inflight_records() == 0 {
            return Err(PplError::InvalidConfig(
                "tuning limits must be non-zero".to_owned(),
            ));
        }

        for (idx, member) in self.members.iter().enumerate() {
            if !member.present {
                continue;
            }
            let disk = DiskIndex(u32::try_from(idx).unwrap_or(u32::MAX));
            self.validate_member(disk, member)?;
        }
        Ok(())
    }

    fn validate_member(&self, disk: DiskIndex, member: &MemberConfig) -> Result<()> {
        self.log_region(disk)?;
        if overlaps(
            member.log_offset,
            member.log_size,
            member.data_offset,
            member.data_sectors,
        ) {
            return Err(PplError::LogOverlap {
                disk: disk.0,
                detail: format!(
                    "log [{}, +{}) intersects data [{}, +{})",
                    member.log_offset, member.log_size, member.data_offset, member.data_sectors
                ),
            });
        }
        if matches!(self.metadata, MetadataKind::Native { .. })
            && overlaps(member.log_offset, member.log_size, 0, member.superblock_sectors)
        {
            return Err(PplError::LogOverlap {
                disk: disk.0,
                detail: format!(
                    "log [{}, +{}) intersects superblock [0, +{})",
                    member.log_offset, member.log_size, member.superblock_sectors
                ),
            });
        }
        Ok(())
    }
}

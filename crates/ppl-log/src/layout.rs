//! Array sector to member address mapping.
//!
//! Recovery has to find, for a logged array range, which members hold the
//! data and which member holds parity. The log itself never writes data, so
//! this is the only piece of array geometry it consumes.

use ppl_types::DiskIndex;

/// Location of one array sector on the members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorMapping {
    /// Member holding the data.
    pub data_disk: DiskIndex,
    /// Member holding parity for the same stripe row.
    pub parity_disk: DiskIndex,
    /// Sector on the member, relative to its data area.
    pub member_sector: u64,
}

pub trait ArrayLayout: Send + Sync {
    fn raid_disks(&self) -> u32;

    fn chunk_sectors(&self) -> u64;

    /// Map an array-logical sector to its member address.
    fn map(&self, array_sector: u64) -> SectorMapping;

    #[must_use]
    fn data_disks(&self) -> u32 {
        self.raid_disks().saturating_sub(1)
    }
}

/// Default RAID5 layout: parity rotates from the last member backwards and
/// data continues on the member after parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeftSymmetric {
    raid_disks: u32,
    chunk_sectors: u64,
}

impl LeftSymmetric {
    /// `raid_disks` must be at least 2 and `chunk_sectors` non-zero; both are
    /// checked by array configuration validation.
    #[must_use]
    pub fn new(raid_disks: u32, chunk_sectors: u64) -> Self {
        Self {
            raid_disks: raid_disks.max(2),
            chunk_sectors: chunk_sectors.max(1),
        }
    }
}

impl ArrayLayout for LeftSymmetric {
    fn raid_disks(&self) -> u32 {
        self.raid_disks
    }

    fn chunk_sectors(&self) -> u64 {
        self.chunk_sectors
    }

    fn map(&self, array_sector: u64) -> SectorMapping {
        let raid_disks = u64::from(self.raid_disks);
        let data_disks = raid_disks - 1;
        let chunk_offset = array_sector % self.chunk_sectors;
        let chunk_number = array_sector / self.chunk_sectors;
        let row = chunk_number / data_disks;
        let data_index = chunk_number % data_disks;

        let parity = data_disks - row % raid_disks;
        let data = (parity + 1 + data_index) % raid_disks;

        SectorMapping {
            // Both values are below raid_disks, which is a u32.
            data_disk: DiskIndex(u32::try_from(data).unwrap_or(u32::MAX)),
            parity_disk: DiskIndex(u32::try_from(parity).unwrap_or(u32::MAX)),
            member_sector: row * self.chunk_sectors + chunk_offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_rows_of_four_disk_array() {
        let layout = LeftSymmetric::new(4, 8);
        let expected = [
            // (array chunk, data disk, parity disk)
            (0, 0, 3),
            (1, 1, 3),
            (2, 2, 3),
            (3, 3, 2),
            (4, 0, 2),
            (5, 1, 2),
            (6, 2, 1),
            (7, 3, 1),
            (8, 0, 1),
            (9, 1, 0),
            (10, 2, 0),
            (11, 3, 0),
            (12, 0, 3),
        ];
        for (chunk, data, parity) in expected {
            let mapping = layout.map(chunk * 8 + 5);
            assert_eq!(mapping.data_disk, DiskIndex(data), "chunk {chunk}");
            assert_eq!(mapping.parity_disk, DiskIndex(parity), "chunk {chunk}");
            assert_eq!(mapping.member_sector, (chunk / 3) * 8 + 5);
        }
    }

    #[test]
    fn data_never_lands_on_parity() {
        let layout = LeftSymmetric::new(5, 16);
        for sector in (0..5 * 16 * 20).step_by(3) {
            let mapping = layout.map(sector);
            assert_ne!(mapping.data_disk, mapping.parity_disk);
            assert!(mapping.data_disk.0 < 5);
        }
        assert_eq!(layout.data_disks(), 4);
    }
}

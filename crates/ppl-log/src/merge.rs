//! Entry merging.
//!
//! Consecutive stripe writes in the same chunk with the same shape fold into
//! one entry, so a record covers a long sequential write with a handful of
//! entries instead of one per stripe.

use crate::record::LogEntry;
use crate::stripe::StripeHead;
use ppl_types::{DiskIndex, PAGE_SIZE, Sector};
use tracing::trace;

const PAGE_BYTES: u32 = PAGE_SIZE as u32;

/// The parts of a stripe write that decide merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeWrite {
    pub sector: Sector,
    pub parity_disk: DiskIndex,
    pub data_disks: u32,
    pub full_stripe: bool,
}

impl StripeWrite {
    #[must_use]
    pub fn from_stripe(stripe: &StripeHead) -> Self {
        Self {
            sector: stripe.sector,
            parity_disk: stripe.parity_disk,
            data_disks: stripe.data_disks(),
            full_stripe: stripe.full_stripe_write,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeGeometry {
    pub chunk_sectors: u64,
    pub sector_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// Grow the last entry.
    Extend,
    /// Start a new entry.
    NewEntry,
}

/// Whether `write` continues `prev` exactly.
#[must_use]
pub fn can_merge(prev: &LogEntry, write: &StripeWrite, geometry: MergeGeometry) -> bool {
    if write.data_disks == 0 || geometry.chunk_sectors == 0 {
        return false;
    }
    if prev.parity_disk != write.parity_disk {
        return false;
    }
    if prev.data_sector.0 / geometry.chunk_sectors != write.sector.0 / geometry.chunk_sectors {
        return false;
    }
    let per_disk = u64::from(write.data_disks) * u64::from(geometry.sector_size);
    let covered = u64::from(prev.data_size) / per_disk;
    if prev.data_sector.checked_add(covered) != Some(write.sector) {
        return false;
    }

    let prev_full = prev.pp_size == 0;
    let same_ratio =
        u64::from(prev.pp_size) * u64::from(write.data_disks) == u64::from(prev.data_size);
    (prev_full && write.full_stripe) || (!write.full_stripe && same_ratio)
}

#[must_use]
pub fn decide(
    last: Option<&LogEntry>,
    write: &StripeWrite,
    geometry: MergeGeometry,
) -> MergeDecision {
    match last {
        Some(prev) if can_merge(prev, write, geometry) => MergeDecision::Extend,
        _ => MergeDecision::NewEntry,
    }
}

/// Add `write` to `entries`, extending the last entry when it merges.
///
/// `pp_page` is folded into the running checksum for partial writes; it is
/// ignored for full-stripe writes.
pub fn apply(
    entries: &mut Vec<LogEntry>,
    write: &StripeWrite,
    pp_page: Option<&[u8]>,
    geometry: MergeGeometry,
) -> MergeDecision {
    let decision = decide(entries.last(), write, geometry);
    if decision == MergeDecision::NewEntry {
        entries.push(LogEntry::new(write.sector, write.parity_disk));
    }
    let Some(entry) = entries.last_mut() else {
        return decision;
    };

    entry.data_size = entry
        .data_size
        .saturating_add(write.data_disks.saturating_mul(PAGE_BYTES));
    if !write.full_stripe {
        entry.pp_size = entry.pp_size.saturating_add(PAGE_BYTES);
        if let Some(page) = pp_page {
            entry.checksum.update(page);
        }
    }

    trace!(
        target: "ppl::merge",
        sector = write.sector.0,
        parity_disk = write.parity_disk.0,
        data_disks = write.data_disks,
        full_stripe = write.full_stripe,
        ?decision,
        data_size = entry.data_size,
        pp_size = entry.pp_size,
        "stripe_merged"
    );
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use ppl_ondisk::PpChecksum;
    use proptest::prelude::*;

    const GEO_4K: MergeGeometry = MergeGeometry {
        chunk_sectors: 16,
        sector_size: 4096,
    };

    fn write(sector: u64, parity: u32, data_disks: u32, full: bool) -> StripeWrite {
        StripeWrite {
            sector: Sector(sector),
            parity_disk: DiskIndex(parity),
            data_disks,
            full_stripe: full,
        }
    }

    #[test]
    fn sequential_partial_write_extends_entry() {
        let mut entries = vec![LogEntry {
            data_sector: Sector(100),
            parity_disk: DiskIndex(3),
            data_size: 16384,
            pp_size: 4096,
            checksum: PpChecksum::new(),
        }];
        let geometry = MergeGeometry {
            chunk_sectors: 128,
            sector_size: 4096,
        };
        let decision = apply(&mut entries, &write(101, 3, 4, false), Some(&[0_u8; 4096]), geometry);
        assert_eq!(decision, MergeDecision::Extend);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].pp_size, 8192);
        assert_eq!(entries[0].data_size, 32768);
    }

    #[test]
    fn full_stripe_writes_never_gain_partial_parity() {
        let mut entries = Vec::new();
        for i in 0..4 {
            apply(&mut entries, &write(i, 0, 3, true), Some(&[1_u8; 4096]), GEO_4K);
        }
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].pp_size, 0);
        assert_eq!(entries[0].data_size, 4 * 3 * 4096);
        assert_eq!(entries[0].checksum.finalize(), 0);
    }

    #[test]
    fn full_stripe_gap_in_same_chunk_starts_new_entry() {
        let mut entries = Vec::new();
        apply(&mut entries, &write(0, 0, 3, true), None, GEO_4K);
        let decision = apply(&mut entries, &write(5, 0, 3, true), None, GEO_4K);
        assert_eq!(decision, MergeDecision::NewEntry);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].data_sector, Sector(0));
        assert_eq!(entries[0].data_size, 3 * 4096);
        assert_eq!(entries[1].data_sector, Sector(5));

        // The next stripe after sector 5 still joins the second entry.
        let decision = apply(&mut entries, &write(6, 0, 3, true), None, GEO_4K);
        assert_eq!(decision, MergeDecision::Extend);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].data_size, 2 * 3 * 4096);
        assert_eq!(entries[1].pp_size, 0);
    }

    #[test]
    fn different_parity_disk_never_merges() {
        let mut entries = Vec::new();
        apply(&mut entries, &write(0, 1, 2, false), Some(&[0_u8; 4096]), GEO_4K);
        let decision = apply(&mut entries, &write(1, 2, 2, false), Some(&[0_u8; 4096]), GEO_4K);
        assert_eq!(decision, MergeDecision::NewEntry);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn chunk_boundary_starts_new_entry() {
        let mut entries = Vec::new();
        apply(&mut entries, &write(15, 0, 2, false), Some(&[0_u8; 4096]), GEO_4K);
        let decision = apply(&mut entries, &write(16, 0, 2, false), Some(&[0_u8; 4096]), GEO_4K);
        assert_eq!(decision, MergeDecision::NewEntry);
    }

    #[test]
    fn gap_or_shape_change_starts_new_entry() {
        let mut entries = Vec::new();
        apply(&mut entries, &write(0, 0, 2, false), Some(&[0_u8; 4096]), GEO_4K);
        assert_eq!(
            decide(entries.last(), &write(2, 0, 2, false), GEO_4K),
            MergeDecision::NewEntry
        );
        // Same start but a different data-disk count breaks the pp ratio.
        assert_eq!(
            decide(entries.last(), &write(1, 0, 1, false), GEO_4K),
            MergeDecision::NewEntry
        );
        // Partial entry followed by a full-stripe write.
        assert_eq!(
            decide(entries.last(), &write(1, 0, 2, true), GEO_4K),
            MergeDecision::NewEntry
        );
    }

    #[test]
    fn full_entry_followed_by_partial_write_starts_new_entry() {
        let mut entries = Vec::new();
        apply(&mut entries, &write(0, 0, 3, true), None, GEO_4K);
        assert_eq!(
            decide(entries.last(), &write(1, 0, 3, false), GEO_4K),
            MergeDecision::NewEntry
        );
    }

    #[test]
    fn sector_units_follow_sector_size() {
        let geometry = MergeGeometry {
            chunk_sectors: 128,
            sector_size: 512,
        };
        let mut entries = Vec::new();
        apply(&mut entries, &write(0, 0, 3, false), Some(&[0_u8; 4096]), geometry);
        // One page per member is eight 512-byte sectors.
        assert_eq!(
            decide(entries.last(), &write(8, 0, 3, false), geometry),
            MergeDecision::Extend
        );
        assert_eq!(
            decide(entries.last(), &write(1, 0, 3, false), geometry),
            MergeDecision::NewEntry
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn merged_checksum_equals_single_pass(
            pages in proptest::collection::vec(any::<u8>(), 1..16),
        ) {
            let mut entries = Vec::new();
            let mut concatenated = Vec::new();
            for (i, fill) in pages.iter().enumerate() {
                let page = vec![*fill; PAGE_SIZE];
                apply(&mut entries, &write(i as u64, 2, 3, false), Some(&page), MergeGeometry {
                    chunk_sectors: 64,
                    sector_size: 4096,
                });
                concatenated.extend_from_slice(&page);
            }
            prop_assert_eq!(entries.len(), 1);
            prop_assert_eq!(entries[0].pp_size as usize, pages.len() * PAGE_SIZE);
            prop_assert_eq!(entries[0].checksum.finalize(), crc32c::crc32c(&concatenated));
        }
    }
}

//! Log loading and write-hole recovery.
//!
//! At assembly every member's region is scanned for the newest valid header.
//! If the array was not shut down cleanly, each logged entry whose partial
//! parity still checks out is replayed: the partial parity is XORed with the
//! data now on the written members, and the result is written as parity. The
//! region is then cleared and a fresh empty header written.
//!
//! Submission is sequential per disk, so at most one record per disk can be
//! unreleased at a crash and only the newest header needs replaying.

use crate::config::{ArrayConfig, ArrayState, LogRegion, MetadataKind};
use crate::layout::ArrayLayout;
use ppl_block::MemberDevice;
use ppl_error::{PplError, Result};
use ppl_ondisk::{
    PplHeader, PplHeaderEntry, encode_empty_header, signature_from_uuid, validate_header,
};
use ppl_types::{DiskIndex, DiskMask, PAGE_SIZE, PPL_HEADER_SIZE};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

const ZERO_CHUNK: usize = 64 * 1024;

/// A valid header found in a region, at a byte offset relative to the region start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderLocation {
    pub offset: u64,
    pub header: PplHeader,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegionScan {
    /// Valid headers in ascending generation order.
    pub headers: Vec<HeaderLocation>,
    /// Why the walk stopped before the end of the region, if it did.
    pub stop_reason: Option<String>,
}

impl RegionScan {
    #[must_use]
    pub fn newest(&self) -> Option<&HeaderLocation> {
        self.headers.last()
    }
}

/// Walk a region from its start, collecting consecutive valid headers.
///
/// The walk stops at the first header that fails its checksum or signature,
/// or whose generation is lower than the one before it. With no expected
/// signature, the first valid header's signature is adopted for the rest.
pub fn scan_region(
    dev: &dyn MemberDevice,
    region: &LogRegion,
    expected_signature: Option<u32>,
) -> Result<RegionScan> {
    let mut scan = RegionScan::default();
    let mut signature = expected_signature;
    let mut offset = 0_u64;
    let mut buf = vec![0_u8; PPL_HEADER_SIZE];

    while offset + PPL_HEADER_SIZE as u64 <= region.size {
        dev.read_exact_at(region.offset + offset, &mut buf)?;
        let header = match validate_header(&buf, signature) {
            Ok(header) => header,
            Err(err) => {
                scan.stop_reason = Some(format!("offset {offset}: {err}"));
                break;
            }
        };
        let prev_generation = scan.newest().map(|loc| loc.header.generation);
        if let Some(prev) = prev_generation {
            if header.generation < prev {
                scan.stop_reason = Some(format!(
                    "offset {offset}: generation {} follows {prev}",
                    header.generation
                ));
                break;
            }
        }
        signature.get_or_insert(header.signature);
        let next = offset
            .saturating_add(PPL_HEADER_SIZE as u64)
            .saturating_add(header.pp_bytes());
        scan.headers.push(HeaderLocation { offset, header });
        if !region.multi_slot {
            break;
        }
        offset = next;
    }
    Ok(scan)
}

/// Result of checking one entry's partial parity against its checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryCheck {
    pub index: usize,
    pub entry: PplHeaderEntry,
    /// Byte offset of the entry's partial parity on the member.
    pub pp_byte: u64,
    pub computed: u32,
    pub valid: bool,
}

impl EntryCheck {
    /// The corruption error for an entry that failed its check.
    #[must_use]
    pub fn corruption(&self, disk: DiskIndex, sector_size: u32) -> Option<PplError> {
        (!self.valid).then(|| {
            pp_corruption(disk, sector_size, self.pp_byte, &self.entry, self.computed)
        })
    }
}

fn pp_corruption(
    disk: DiskIndex,
    sector_size: u32,
    pp_byte: u64,
    entry: &PplHeaderEntry,
    computed: u32,
) -> PplError {
    PplError::Corruption {
        disk: disk.0,
        sector: pp_byte / u64::from(sector_size.max(1)),
        detail: format!(
            "partial parity checksum {computed:#010x}, header records {:#010x}",
            entry.checksum
        ),
    }
}

/// Partial parity read for one entry, or `None` when it runs past the region.
struct EntryPp {
    pp_byte: u64,
    bytes: Option<Vec<u8>>,
}

/// Read the partial parity of every entry under `location`.
fn read_entry_pp(
    dev: &dyn MemberDevice,
    region: &LogRegion,
    location: &HeaderLocation,
) -> Result<Vec<EntryPp>> {
    let mut pp_offset = location.offset + PPL_HEADER_SIZE as u64;
    let mut out = Vec::with_capacity(location.header.entries.len());
    for entry in &location.header.entries {
        let len = u64::from(entry.pp_size);
        let pp_byte = region.offset + pp_offset;
        if pp_offset.saturating_add(len) > region.size {
            // Entry claims more partial parity than the region holds.
            out.push(EntryPp {
                pp_byte,
                bytes: None,
            });
            continue;
        }
        let mut pp = vec![0_u8; entry.pp_size as usize];
        dev.read_exact_at(pp_byte, &mut pp)?;
        pp_offset += len;
        out.push(EntryPp {
            pp_byte,
            bytes: Some(pp),
        });
    }
    Ok(out)
}

/// Verify each entry's partial parity checksum under `location`.
pub fn check_entries(
    dev: &dyn MemberDevice,
    region: &LogRegion,
    location: &HeaderLocation,
) -> Result<Vec<EntryCheck>> {
    let pps = read_entry_pp(dev, region, location)?;
    Ok(location
        .header
        .entries
        .iter()
        .zip(pps)
        .enumerate()
        .map(|(index, (entry, pp))| {
            let computed = pp.bytes.as_deref().map_or(!entry.checksum, crc32c::crc32c);
            EntryCheck {
                index,
                entry: *entry,
                pp_byte: pp.pp_byte,
                computed,
                valid: pp.bytes.is_some() && computed == entry.checksum,
            }
        })
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskLoadReport {
    pub disk: u32,
    pub headers_found: usize,
    pub newest_generation: Option<u64>,
    pub recovered_entries: u64,
    pub mismatches: u64,
    pub reinitialized: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub signature: u32,
    pub disks: Vec<DiskLoadReport>,
    pub recovered_entries: u64,
    pub mismatches: u64,
    pub max_generation: u64,
}

enum EntryOutcome {
    Recovered,
    Skipped(&'static str),
    Corrupt(PplError),
}

struct Recoverer<'a> {
    config: &'a ArrayConfig,
    members: &'a [Option<Arc<dyn MemberDevice>>],
    layout: &'a dyn ArrayLayout,
    block_shift: u32,
    array_sectors: u64,
    touched: DiskMask,
}

impl Recoverer<'_> {
    fn member(&self, disk: DiskIndex) -> Option<&Arc<dyn MemberDevice>> {
        self.members.get(disk.as_usize()).and_then(Option::as_ref)
    }

    fn member_byte(&self, disk: DiskIndex, member_sector: u64) -> Result<u64> {
        let data_offset = self
            .config
            .members
            .get(disk.as_usize())
            .map(|m| m.data_offset)
            .ok_or(PplError::MemberFaulty(disk.0))?;
        data_offset
            .checked_add(member_sector)
            .and_then(|s| s.checked_mul(u64::from(self.config.sector_size)))
            .ok_or_else(|| PplError::Format("member offset overflows".to_owned()))
    }

    /// Rebuild parity for one entry from its partial parity and the data on disk.
    fn recover_entry(&mut self, entry: &PplHeaderEntry, pp: &[u8]) -> Result<EntryOutcome> {
        let total_data_disks = u64::from(self.layout.data_disks());
        let data_size = u64::from(entry.data_size);
        let pp_size = u64::from(entry.pp_size);
        let data_disks = if pp_size > 0 {
            if data_size % pp_size != 0 {
                return Ok(EntryOutcome::Skipped("data size not a multiple of pp size"));
            }
            data_size / pp_size
        } else {
            total_data_disks
        };
        if data_disks == 0 || data_disks > total_data_disks || data_size % data_disks != 0 {
            return Ok(EntryOutcome::Skipped("data disk count out of range"));
        }
        let strip_bytes = data_size / data_disks;
        let page = PAGE_SIZE as u64;
        if strip_bytes % page != 0 {
            return Ok(EntryOutcome::Skipped("strip not page aligned"));
        }

        let page_sectors = page / u64::from(self.config.sector_size);
        let start = entry.data_sector << self.block_shift;
        let chunk = self.layout.chunk_sectors();
        let mut parity = vec![0_u8; PAGE_SIZE];
        let mut data = vec![0_u8; PAGE_SIZE];

        for page_idx in 0..strip_bytes / page {
            let page_start = usize::try_from(page_idx * page)
                .map_err(|_| PplError::Format("pp offset does not fit usize".to_owned()))?;
            if pp_size > 0 {
                parity.copy_from_slice(&pp[page_start..page_start + PAGE_SIZE]);
            } else {
                parity.fill(0);
            }

            let mut target = None;
            for indent in 0..data_disks {
                let sector = start + page_idx * page_sectors + indent * chunk;
                if sector >= self.array_sectors {
                    continue;
                }
                let mapping = self.layout.map(sector);
                if mapping.parity_disk.0 != entry.parity_disk {
                    return Ok(EntryOutcome::Skipped("parity disk does not match layout"));
                }
                let dev = self
                    .member(mapping.data_disk)
                    .ok_or(PplError::MemberFaulty(mapping.data_disk.0))?;
                let at = self.member_byte(mapping.data_disk, mapping.member_sector)?;
                dev.read_exact_at(at, &mut data)?;
                for (p, d) in parity.iter_mut().zip(&data) {
                    *p ^= *d;
                }
                target = Some(mapping);
            }

            let Some(mapping) = target else {
                continue;
            };
            let Some(dev) = self.member(mapping.parity_disk) else {
                debug!(
                    target: "ppl::recovery",
                    parity_disk = mapping.parity_disk.0,
                    "parity_member_missing"
                );
                return Ok(EntryOutcome::Skipped("parity member missing"));
            };
            dev.write_all_at(
                self.member_byte(mapping.parity_disk, mapping.member_sector)?,
                &parity,
            )?;
            self.touched = self.touched.with(mapping.parity_disk);
        }
        Ok(EntryOutcome::Recovered)
    }
}

fn zero_region(dev: &dyn MemberDevice, region: &LogRegion) -> Result<()> {
    let zeros = vec![0_u8; ZERO_CHUNK];
    let mut offset = 0_u64;
    while offset < region.size {
        let len = usize::try_from((region.size - offset).min(ZERO_CHUNK as u64))
            .unwrap_or(ZERO_CHUNK);
        dev.write_all_at(region.offset + offset, &zeros[..len])?;
        offset += len as u64;
    }
    Ok(())
}

/// Clear a region and write an empty header at its start.
pub fn write_empty_log(dev: &dyn MemberDevice, region: &LogRegion, signature: u32) -> Result<()> {
    zero_region(dev, region)?;
    dev.write_all_at(region.offset, &encode_empty_header(signature)?)?;
    dev.flush()
}

/// Scan every present member, replay the newest record of a dirty array,
/// and reinitialize the regions when assembling.
pub(crate) fn load_logs(
    config: &ArrayConfig,
    members: &[Option<Arc<dyn MemberDevice>>],
    layout: &dyn ArrayLayout,
) -> Result<LoadReport> {
    let mut signature = match &config.metadata {
        MetadataKind::Native { uuid } => Some(signature_from_uuid(uuid)),
        MetadataKind::External { .. } => None,
    };
    let dirty = matches!(config.state, ArrayState::Assemble { dirty: true });
    let assembling = matches!(config.state, ArrayState::Assemble { .. });
    let block_shift = config.block_size().trailing_zeros() - config.sector_size.trailing_zeros();

    let array_sectors = config
        .members
        .iter()
        .filter(|m| m.present)
        .map(|m| m.data_sectors)
        .min()
        .unwrap_or(0)
        .saturating_mul(u64::from(layout.data_disks()));
    let mut recoverer = Recoverer {
        config,
        members,
        layout,
        block_shift,
        array_sectors,
        touched: DiskMask::EMPTY,
    };

    let mut report = LoadReport::default();
    let mut regions = Vec::new();
    for (idx, dev) in members.iter().enumerate() {
        let disk = DiskIndex(u32::try_from(idx).unwrap_or(u32::MAX));
        let Some(dev) = dev else {
            continue;
        };
        let region = config.log_region(disk)?;
        regions.push((disk, Arc::clone(dev), region));

        let scan = scan_region(dev.as_ref(), &region, signature)?;
        let mut disk_report = DiskLoadReport {
            disk: disk.0,
            headers_found: scan.headers.len(),
            newest_generation: scan.newest().map(|loc| loc.header.generation),
            ..DiskLoadReport::default()
        };

        let Some(newest) = scan.newest() else {
            warn!(
                target: "ppl::recovery",
                disk = disk.0,
                reason = scan.stop_reason.as_deref().unwrap_or("empty region"),
                "no_valid_header"
            );
            disk_report.mismatches += 1;
            report.disks.push(disk_report);
            continue;
        };
        signature.get_or_insert(newest.header.signature);
        report.max_generation = report.max_generation.max(newest.header.generation);

        if dirty {
            let pps = read_entry_pp(dev.as_ref(), &region, newest)?;
            for (entry, pp) in newest.header.entries.iter().zip(pps) {
                let outcome = match pp.bytes {
                    Some(bytes) => {
                        let computed = crc32c::crc32c(&bytes);
                        if computed == entry.checksum {
                            recoverer.recover_entry(entry, &bytes)?
                        } else {
                            EntryOutcome::Corrupt(pp_corruption(
                                disk,
                                config.sector_size,
                                pp.pp_byte,
                                entry,
                                computed,
                            ))
                        }
                    }
                    None => EntryOutcome::Skipped("partial parity beyond region"),
                };
                match outcome {
                    EntryOutcome::Recovered => disk_report.recovered_entries += 1,
                    EntryOutcome::Skipped(reason) => {
                        warn!(
                            target: "ppl::recovery",
                            disk = disk.0,
                            data_sector = entry.data_sector,
                            reason,
                            "entry_skipped"
                        );
                        disk_report.mismatches += 1;
                    }
                    EntryOutcome::Corrupt(err) => {
                        warn!(
                            target: "ppl::recovery",
                            disk = disk.0,
                            data_sector = entry.data_sector,
                            error = %err,
                            "entry_corrupt"
                        );
                        disk_report.mismatches += 1;
                    }
                }
            }
        }
        report.disks.push(disk_report);
    }

    for disk in recoverer.touched.iter() {
        if let Some(dev) = recoverer.member(disk) {
            dev.flush()?;
        }
    }

    let signature = signature.unwrap_or(0);
    if assembling {
        for (disk, dev, region) in &regions {
            write_empty_log(dev.as_ref(), region, signature)?;
            if let Some(disk_report) = report.disks.iter_mut().find(|r| r.disk == disk.0) {
                disk_report.reinitialized = true;
            }
        }
    }

    report.signature = signature;
    report.recovered_entries = report.disks.iter().map(|d| d.recovered_entries).sum();
    report.mismatches = report.disks.iter().map(|d| d.mismatches).sum();
    info!(
        target: "ppl::recovery",
        signature = format_args!("{signature:#010x}"),
        disks = report.disks.len(),
        recovered = report.recovered_entries,
        mismatches = report.mismatches,
        dirty,
        "log_loaded"
    );
    Ok(report)
}

//! Write, crash between the data and parity writes, then reassemble.

use parking_lot::Mutex;
use ppl_block::{InlineLogSink, MemberDevice, MemoryMemberDevice};
use ppl_error::{PplError, Result};
use ppl_log::{
    ArrayConfig, ArrayState, InitReport, LogRegistry, LogToken, LogTuning, MemberConfig,
    MetadataKind, StripeCache, StripeHead, WriteOutcome,
};
use ppl_ondisk::validate_header;
use ppl_types::{DiskIndex, DiskMask, PAGE_SIZE, PPL_HEADER_SIZE, Sector, StripeId};
use std::sync::Arc;

const DISKS: u32 = 4;
const SECTOR_BYTES: u64 = 4096;
const DATA_OFFSET: u64 = 8;
const DATA_SECTORS: u64 = 1024;
const LOG_OFFSET: u64 = DATA_OFFSET + DATA_SECTORS;
const LOG_SECTORS: u64 = 256;

#[derive(Default)]
struct TokenCache {
    durable: Mutex<Vec<LogToken>>,
}

impl StripeCache for TokenCache {
    fn log_durable(&self, _stripe: StripeHead, token: LogToken) {
        self.durable.lock().push(token);
    }

    fn write_unprotected(&self, _stripe: StripeHead) {}

    fn member_failed(&self, disk: DiskIndex) {
        panic!("member {disk} failed");
    }
}

fn config(state: ArrayState) -> ArrayConfig {
    let member = MemberConfig {
        log_offset: LOG_OFFSET,
        log_size: LOG_SECTORS,
        data_offset: DATA_OFFSET,
        data_sectors: DATA_SECTORS,
        superblock_sectors: DATA_OFFSET,
        present: true,
        in_sync: true,
        write_back_cache: false,
    };
    ArrayConfig {
        raid_level: 5,
        raid_disks: DISKS,
        chunk_sectors: 16,
        sector_size: 4096,
        metadata: MetadataKind::Native { uuid: [0x5a; 16] },
        has_bitmap: false,
        has_journal: false,
        state,
        members: vec![member; DISKS as usize],
        tuning: LogTuning::default(),
    }
}

fn blank_array() -> Vec<Arc<MemoryMemberDevice>> {
    let bytes = usize::try_from((LOG_OFFSET + LOG_SECTORS) * SECTOR_BYTES).expect("size");
    (0..DISKS)
        .map(|_| Arc::new(MemoryMemberDevice::new(bytes)))
        .collect()
}

/// Copy device contents, as the disks look after power loss.
fn crash(devices: &[Arc<MemoryMemberDevice>]) -> Vec<Arc<MemoryMemberDevice>> {
    devices
        .iter()
        .map(|dev| Arc::new(MemoryMemberDevice::from_bytes(dev.snapshot())))
        .collect()
}

fn assemble(
    devices: &[Arc<MemoryMemberDevice>],
    config: ArrayConfig,
) -> Result<(LogRegistry, InitReport, Arc<TokenCache>)> {
    let members: Vec<Option<Arc<dyn MemberDevice>>> = devices
        .iter()
        .zip(&config.members)
        .map(|(dev, member)| member.present.then(|| Arc::clone(dev) as Arc<dyn MemberDevice>))
        .collect();
    let sink = Arc::new(InlineLogSink::new(members.clone()));
    let cache = Arc::new(TokenCache::default());
    let (registry, report) = LogRegistry::init(
        config,
        members,
        sink,
        Arc::clone(&cache) as Arc<dyn StripeCache>,
    )?;
    Ok((registry, report, cache))
}

fn page(seed: u8) -> Vec<u8> {
    (0..PAGE_SIZE)
        .map(|i| seed.wrapping_mul(31).wrapping_add((i % 251) as u8))
        .collect()
}

fn xor(pages: &[&[u8]]) -> Vec<u8> {
    let mut out = vec![0_u8; PAGE_SIZE];
    for page in pages {
        for (o, b) in out.iter_mut().zip(page.iter()) {
            *o ^= *b;
        }
    }
    out
}

fn member_byte(member_sector: u64) -> u64 {
    (DATA_OFFSET + member_sector) * SECTOR_BYTES
}

fn read_page(dev: &MemoryMemberDevice, member_sector: u64) -> Vec<u8> {
    let mut buf = vec![0_u8; PAGE_SIZE];
    dev.read_exact_at(member_byte(member_sector), &mut buf)
        .expect("read");
    buf
}

fn write_page(dev: &MemoryMemberDevice, member_sector: u64, bytes: &[u8]) {
    dev.write_all_at(member_byte(member_sector), bytes)
        .expect("write");
}

/// Row 0 of a four-disk left-symmetric array: data on 0, 1, 2 and parity on 3.
/// Returns the old data pages of the three data members.
fn seed_row0(devices: &[Arc<MemoryMemberDevice>], member_sector: u64) -> [Vec<u8>; 3] {
    let old = [page(1), page(2), page(3)];
    for (disk, data) in old.iter().enumerate() {
        write_page(&devices[disk], member_sector, data);
    }
    write_page(&devices[3], member_sector, &xor(&[&old[0], &old[1], &old[2]]));
    old
}

fn partial_stripe(id: u64, sector: u64, data_disk: u32, pp: Vec<u8>) -> StripeHead {
    StripeHead {
        id: StripeId(id),
        sector: Sector(sector),
        parity_disk: DiskIndex(3),
        write_mask: DiskMask::single(DiskIndex(data_disk)).with(DiskIndex(3)),
        parity_in_sync: true,
        full_stripe_write: false,
        pp_page: Some(Arc::from(pp)),
        syncing: false,
    }
}

fn log_durably(registry: &LogRegistry, cache: &TokenCache, stripe: StripeHead) -> LogToken {
    let WriteOutcome::Logged(token) = registry.write_stripe(stripe) else {
        panic!("stripe not logged");
    };
    registry.write_stripe_run();
    registry.process_completions();
    assert!(cache.durable.lock().contains(&token));
    token
}

#[test]
fn dirty_assembly_rebuilds_parity_from_partial_parity() {
    let devices = blank_array();
    let old = seed_row0(&devices, 2);
    let (registry, _, cache) =
        assemble(&devices, config(ArrayState::Assemble { dirty: false })).expect("first assemble");

    // Disk 0 gets new data; partial parity is the XOR of the untouched members.
    let new_data = page(9);
    log_durably(&registry, &cache, partial_stripe(1, 2, 0, xor(&[&old[1], &old[2]])));
    write_page(&devices[0], 2, &new_data);
    let crashed = crash(&devices);
    drop(registry);

    let stale_parity = read_page(&crashed[3], 2);
    assert_eq!(stale_parity, xor(&[&old[0], &old[1], &old[2]]));

    let (registry, report, _) =
        assemble(&crashed, config(ArrayState::Assemble { dirty: true })).expect("recover");
    assert_eq!(report.recovered_entries, 1);
    assert_eq!(report.mismatches, 0);
    assert!(report.array_clean);
    assert_eq!(read_page(&crashed[3], 2), xor(&[&new_data, &old[1], &old[2]]));

    // Regions are reset and generations continue after the replayed record.
    for dev in &crashed {
        let bytes = dev.snapshot();
        let start = usize::try_from(LOG_OFFSET * SECTOR_BYTES).expect("offset");
        let header = validate_header(&bytes[start..start + PPL_HEADER_SIZE], Some(report.signature))
            .expect("empty header");
        assert_eq!(header.generation, 0);
        assert!(header.entries.is_empty());
        assert!(bytes[start + PPL_HEADER_SIZE..start + 2 * PPL_HEADER_SIZE]
            .iter()
            .all(|&b| b == 0));
    }
    let token = match registry.write_stripe(partial_stripe(2, 3, 0, page(4))) {
        WriteOutcome::Logged(token) => token,
        other => panic!("expected Logged, got {other:?}"),
    };
    assert_eq!(token.seq, 2);
    assert_eq!(registry.log(DiskIndex(3)).expect("log").next_offset(), 0);
}

#[test]
fn corrupt_partial_parity_is_skipped_and_counted() {
    let devices = blank_array();
    let old = seed_row0(&devices, 2);
    let (registry, _, cache) =
        assemble(&devices, config(ArrayState::Assemble { dirty: false })).expect("first assemble");
    log_durably(&registry, &cache, partial_stripe(1, 2, 0, xor(&[&old[1], &old[2]])));
    write_page(&devices[0], 2, &page(9));
    drop(registry);

    let crashed = crash(&devices);
    let pp_byte = LOG_OFFSET * SECTOR_BYTES + PPL_HEADER_SIZE as u64 + 17;
    let mut flipped = [0_u8; 1];
    crashed[3].read_exact_at(pp_byte, &mut flipped).expect("read");
    flipped[0] ^= 0x80;
    crashed[3].write_all_at(pp_byte, &flipped).expect("write");

    let (_, report, _) =
        assemble(&crashed, config(ArrayState::Assemble { dirty: true })).expect("recover");
    assert_eq!(report.recovered_entries, 0);
    assert_eq!(report.mismatches, 1);
    assert!(!report.array_clean);
    assert_eq!(read_page(&crashed[3], 2), xor(&[&old[0], &old[1], &old[2]]));
}

#[test]
fn full_stripe_record_recomputes_parity_from_data() {
    let devices = blank_array();
    seed_row0(&devices, 5);
    let (registry, _, cache) =
        assemble(&devices, config(ArrayState::Assemble { dirty: false })).expect("first assemble");

    let stripe = StripeHead {
        id: StripeId(1),
        sector: Sector(5),
        parity_disk: DiskIndex(3),
        write_mask: (0..DISKS).map(DiskIndex).collect(),
        parity_in_sync: true,
        full_stripe_write: true,
        pp_page: Some(Arc::from(vec![0_u8; PAGE_SIZE])),
        syncing: false,
    };
    log_durably(&registry, &cache, stripe);
    let fresh = [page(20), page(21), page(22)];
    for (disk, data) in fresh.iter().enumerate() {
        write_page(&devices[disk], 5, data);
    }
    let crashed = crash(&devices);
    drop(registry);

    let (_, report, _) =
        assemble(&crashed, config(ArrayState::Assemble { dirty: true })).expect("recover");
    assert_eq!(report.recovered_entries, 1);
    assert_eq!(read_page(&crashed[3], 5), xor(&[&fresh[0], &fresh[1], &fresh[2]]));
}

#[test]
fn only_newest_record_is_replayed() {
    let devices = blank_array();
    let old = seed_row0(&devices, 2);
    seed_row0(&devices, 3);
    let (registry, _, cache) =
        assemble(&devices, config(ArrayState::Assemble { dirty: false })).expect("first assemble");

    // First record completes normally: data and parity both land.
    let first = log_durably(&registry, &cache, partial_stripe(1, 2, 0, xor(&[&old[1], &old[2]])));
    let first_data = page(11);
    write_page(&devices[0], 2, &first_data);
    write_page(&devices[3], 2, &xor(&[&first_data, &old[1], &old[2]]));
    registry.stripe_write_finished(first);

    // Second record is durable but its parity never lands.
    let second = log_durably(&registry, &cache, partial_stripe(2, 3, 0, xor(&[&old[1], &old[2]])));
    assert_eq!(second.seq, first.seq + 1);
    let second_data = page(12);
    write_page(&devices[0], 3, &second_data);
    let crashed = crash(&devices);
    drop(registry);

    let (_, report, _) =
        assemble(&crashed, config(ArrayState::Assemble { dirty: true })).expect("recover");
    let disk3 = &report.disks[3];
    assert_eq!(disk3.headers_found, 2);
    assert_eq!(disk3.newest_generation, Some(second.seq));
    assert_eq!(report.recovered_entries, 1);
    assert_eq!(read_page(&crashed[3], 3), xor(&[&second_data, &old[1], &old[2]]));
    assert_eq!(read_page(&crashed[3], 2), xor(&[&first_data, &old[1], &old[2]]));
}

#[test]
fn missing_data_member_fails_dirty_recovery() {
    let devices = blank_array();
    let old = seed_row0(&devices, 2);
    let (registry, _, cache) =
        assemble(&devices, config(ArrayState::Assemble { dirty: false })).expect("first assemble");
    log_durably(&registry, &cache, partial_stripe(1, 2, 0, xor(&[&old[1], &old[2]])));
    drop(registry);

    let crashed = crash(&devices);
    let mut degraded = config(ArrayState::Assemble { dirty: true });
    degraded.members[0].present = false;
    let err = assemble(&crashed, degraded).map(|_| ()).expect_err("data member missing");
    assert!(matches!(err, PplError::MemberFaulty(0)));
}

#[test]
fn clean_assembly_discards_log_contents() {
    let devices = blank_array();
    let old = seed_row0(&devices, 2);
    let (registry, _, cache) =
        assemble(&devices, config(ArrayState::Assemble { dirty: false })).expect("first assemble");
    log_durably(&registry, &cache, partial_stripe(1, 2, 0, xor(&[&old[1], &old[2]])));
    write_page(&devices[0], 2, &page(9));
    drop(registry);

    let crashed = crash(&devices);
    let (_, report, _) =
        assemble(&crashed, config(ArrayState::Assemble { dirty: false })).expect("assemble");
    assert_eq!(report.recovered_entries, 0);
    assert!(!report.array_clean);
    assert_eq!(read_page(&crashed[3], 2), xor(&[&old[0], &old[1], &old[2]]));
    assert!(report.disks.iter().all(|disk| disk.reinitialized));
}

// ── 512-byte sectors with a 4 KiB external log block ──

const SMALL_SECTOR_BYTES: u64 = 512;
const SMALL_DATA_OFFSET: u64 = 64;
const SMALL_DATA_SECTORS: u64 = 8192;
const SMALL_LOG_OFFSET: u64 = SMALL_DATA_OFFSET + SMALL_DATA_SECTORS;
const SMALL_LOG_SECTORS: u64 = 2048;

fn small_sector_config(state: ArrayState) -> ArrayConfig {
    let member = MemberConfig {
        log_offset: SMALL_LOG_OFFSET,
        log_size: SMALL_LOG_SECTORS,
        data_offset: SMALL_DATA_OFFSET,
        data_sectors: SMALL_DATA_SECTORS,
        superblock_sectors: 0,
        present: true,
        in_sync: true,
        write_back_cache: false,
    };
    ArrayConfig {
        raid_level: 5,
        raid_disks: DISKS,
        chunk_sectors: 128,
        sector_size: 512,
        metadata: MetadataKind::External {
            logical_block_size: 4096,
        },
        has_bitmap: false,
        has_journal: false,
        state,
        members: vec![member; DISKS as usize],
        tuning: LogTuning {
            max_request_pages: 1,
            ..LogTuning::default()
        },
    }
}

fn small_member_byte(member_sector: u64) -> u64 {
    (SMALL_DATA_OFFSET + member_sector) * SMALL_SECTOR_BYTES
}

fn small_read_page(dev: &MemoryMemberDevice, member_sector: u64) -> Vec<u8> {
    let mut buf = vec![0_u8; PAGE_SIZE];
    dev.read_exact_at(small_member_byte(member_sector), &mut buf)
        .expect("read");
    buf
}

fn small_write_page(dev: &MemoryMemberDevice, member_sector: u64, bytes: &[u8]) {
    dev.write_all_at(small_member_byte(member_sector), bytes)
        .expect("write");
}

#[test]
fn small_sectors_log_in_block_units_and_recover() {
    let bytes = usize::try_from((SMALL_LOG_OFFSET + SMALL_LOG_SECTORS) * SMALL_SECTOR_BYTES)
        .expect("size");
    let devices: Vec<Arc<MemoryMemberDevice>> = (0..DISKS)
        .map(|_| Arc::new(MemoryMemberDevice::new(bytes)))
        .collect();

    // Two consecutive pages of row 0: array sectors 16 and 24 live on disk 0
    // at the same member sectors, with parity on disk 3.
    let rows = [16_u64, 24];
    let old: Vec<[Vec<u8>; 3]> = rows
        .iter()
        .enumerate()
        .map(|(i, &sector)| {
            let seed = 40 + 3 * i as u8;
            let row = [page(seed), page(seed + 1), page(seed + 2)];
            for (disk, data) in row.iter().enumerate() {
                small_write_page(&devices[disk], sector, data);
            }
            small_write_page(&devices[3], sector, &xor(&[&row[0], &row[1], &row[2]]));
            row
        })
        .collect();

    let (registry, _, cache) = assemble(
        &devices,
        small_sector_config(ArrayState::Assemble { dirty: false }),
    )
    .expect("first assemble");
    let pps: Vec<Vec<u8>> = old.iter().map(|row| xor(&[&row[1], &row[2]])).collect();
    let tokens: Vec<LogToken> = rows
        .iter()
        .zip(&pps)
        .enumerate()
        .map(|(i, (&sector, pp))| {
            match registry.write_stripe(partial_stripe(i as u64 + 1, sector, 0, pp.clone())) {
                WriteOutcome::Logged(token) => token,
                other => panic!("expected Logged, got {other:?}"),
            }
        })
        .collect();
    assert_eq!(tokens[0].seq, tokens[1].seq);
    registry.write_stripe_run();
    registry.process_completions();
    assert_eq!(cache.durable.lock().len(), 2);

    // One merged entry, addressed in 4 KiB blocks: sector 16 is block 2.
    let image = devices[3].snapshot();
    let start = usize::try_from(SMALL_LOG_OFFSET * SMALL_SECTOR_BYTES).expect("offset");
    let header = validate_header(&image[start..start + PPL_HEADER_SIZE], None).expect("header");
    assert_eq!(header.entries.len(), 1);
    let entry = header.entries[0];
    assert_eq!(entry.data_sector, 2);
    assert_eq!(entry.pp_size, 2 * PAGE_SIZE as u32);
    assert_eq!(entry.data_size, 2 * PAGE_SIZE as u32);
    assert_eq!(entry.parity_disk, 3);

    // Header and both pp pages went out as separate one-page requests but
    // land back to back.
    let pp_start = start + PPL_HEADER_SIZE;
    let logged_pp = &image[pp_start..pp_start + 2 * PAGE_SIZE];
    assert_eq!(&logged_pp[..PAGE_SIZE], &pps[0][..]);
    assert_eq!(&logged_pp[PAGE_SIZE..], &pps[1][..]);
    assert_eq!(entry.checksum, crc32c::crc32c(logged_pp));

    let fresh = [page(70), page(71)];
    for (&sector, data) in rows.iter().zip(&fresh) {
        small_write_page(&devices[0], sector, data);
    }
    let crashed = crash(&devices);
    drop(registry);

    let (_, report, _) = assemble(
        &crashed,
        small_sector_config(ArrayState::Assemble { dirty: true }),
    )
    .expect("recover");
    assert_eq!(report.recovered_entries, 1);
    assert_eq!(report.mismatches, 0);
    assert!(report.array_clean);
    for ((&sector, data), row) in rows.iter().zip(&fresh).zip(&old) {
        assert_eq!(
            small_read_page(&crashed[3], sector),
            xor(&[data, &row[1], &row[2]])
        );
    }
}

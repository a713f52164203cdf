//! Log records ("IO units") and their entries.
//!
//! A record is one header plus the partial parity pages of the stripes it
//! covers. It moves strictly forward through
//! `Open -> Submitting -> Submitted -> Released`.

use crate::stripe::StripeHead;
use parking_lot::Mutex;
use ppl_ondisk::{PpChecksum, PplHeaderEntry};
use ppl_types::{DiskIndex, DiskMask, PPL_HDR_MAX_ENTRIES, Sector};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordState {
    /// Accepting merges.
    Open,
    /// Handed to the sink; entries are frozen.
    Submitting,
    /// Durable on disk; waiting for the protected writes to finish.
    Submitted,
    /// Terminal.
    Released,
}

impl RecordState {
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::Submitting)
                | (Self::Submitting, Self::Submitted)
                | (Self::Submitted, Self::Released)
        )
    }
}

/// One contiguous run of protected writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// First array sector covered, in array sectors.
    pub data_sector: Sector,
    pub parity_disk: DiskIndex,
    pub data_size: u32,
    pub pp_size: u32,
    /// Raw running checksum; complemented only when encoded.
    pub checksum: PpChecksum,
}

impl LogEntry {
    #[must_use]
    pub fn new(data_sector: Sector, parity_disk: DiskIndex) -> Self {
        Self {
            data_sector,
            parity_disk,
            data_size: 0,
            pp_size: 0,
            checksum: PpChecksum::new(),
        }
    }

    /// On-disk form: sector in log block units and the finalized checksum.
    ///
    /// `block_shift` is `log2(block_size / sector_size)`.
    #[must_use]
    pub fn to_ondisk(&self, block_shift: u32) -> PplHeaderEntry {
        PplHeaderEntry {
            data_sector: self.data_sector.0 >> block_shift,
            pp_size: self.pp_size,
            data_size: self.data_size,
            parity_disk: self.parity_disk.0,
            checksum: self.checksum.finalize(),
        }
    }
}

/// Mutable part of a record, guarded by the record body lock.
#[derive(Debug)]
pub(crate) struct RecordBody {
    pub(crate) state: RecordState,
    pub(crate) entries: Vec<LogEntry>,
    /// Stripes awaiting the durable callback; emptied when they are handed out.
    pub(crate) stripes: Vec<StripeHead>,
    pub(crate) pp_bytes: u64,
    /// Header buffer, lent to the sink while the record is Submitting.
    pub(crate) header: Option<Box<[u8]>>,
    /// Write-back-cache members written by this record's stripes.
    pub(crate) flush_mask: DiskMask,
}

#[derive(Debug)]
pub struct LogRecord {
    seq: u64,
    disk: DiskIndex,
    pub(crate) body: Mutex<RecordBody>,
    pending_stripes: AtomicUsize,
    pending_flushes: AtomicUsize,
}

impl LogRecord {
    pub(crate) fn new(seq: u64, disk: DiskIndex, header: Box<[u8]>) -> Self {
        Self {
            seq,
            disk,
            body: Mutex::new(RecordBody {
                state: RecordState::Open,
                entries: Vec::new(),
                stripes: Vec::new(),
                pp_bytes: 0,
                header: Some(header),
                flush_mask: DiskMask::EMPTY,
            }),
            pending_stripes: AtomicUsize::new(0),
            pending_flushes: AtomicUsize::new(0),
        }
    }

    /// Sequence number, written as the header generation.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub fn disk(&self) -> DiskIndex {
        self.disk
    }

    #[must_use]
    pub fn state(&self) -> RecordState {
        self.body.lock().state
    }

    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.body.lock().entries.clone()
    }

    #[must_use]
    pub fn pending_stripes(&self) -> usize {
        self.pending_stripes.load(Ordering::Acquire)
    }

    pub(crate) fn add_pending_stripe(&self) {
        self.pending_stripes.fetch_add(1, Ordering::AcqRel);
    }

    /// Count one finished stripe write. Returns `true` for the last one.
    pub(crate) fn finish_stripe(&self) -> bool {
        let result = self
            .pending_stripes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match result {
            Ok(previous) => previous == 1,
            Err(_) => {
                error!(
                    target: "ppl::record",
                    disk = self.disk.0,
                    seq = self.seq,
                    "stripe_completion_underflow"
                );
                false
            }
        }
    }

    pub(crate) fn set_pending_flushes(&self, count: usize) {
        self.pending_flushes.store(count, Ordering::Release);
    }

    /// Count one finished cache flush. Returns `true` for the last one.
    pub(crate) fn finish_flush(&self) -> bool {
        self.pending_flushes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok_and(|previous| previous == 1)
    }

    /// Move to `next`, refusing and logging any out-of-order transition.
    pub(crate) fn advance(&self, body: &mut RecordBody, next: RecordState) -> bool {
        if body.state.can_advance_to(next) {
            body.state = next;
            true
        } else {
            error!(
                target: "ppl::record",
                disk = self.disk.0,
                seq = self.seq,
                from = ?body.state,
                to = ?next,
                "illegal_record_transition"
            );
            false
        }
    }
}

impl RecordBody {
    /// No further stripe can be added without exceeding the header or entry space.
    pub(crate) fn is_full(&self, entry_space: u64) -> bool {
        self.pp_bytes >= entry_space || self.entries.len() >= PPL_HDR_MAX_ENTRIES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ppl_types::PPL_HEADER_SIZE;

    fn record() -> LogRecord {
        LogRecord::new(7, DiskIndex(1), vec![0_u8; PPL_HEADER_SIZE].into_boxed_slice())
    }

    #[test]
    fn transitions_only_move_forward() {
        let rec = record();
        let mut body = rec.body.lock();
        assert!(!rec.advance(&mut body, RecordState::Submitted));
        assert_eq!(body.state, RecordState::Open);
        assert!(rec.advance(&mut body, RecordState::Submitting));
        assert!(!rec.advance(&mut body, RecordState::Open));
        assert!(rec.advance(&mut body, RecordState::Submitted));
        assert!(rec.advance(&mut body, RecordState::Released));
        assert!(!rec.advance(&mut body, RecordState::Released));
    }

    #[test]
    fn pending_counter_reports_last_completion() {
        let rec = record();
        rec.add_pending_stripe();
        rec.add_pending_stripe();
        assert!(!rec.finish_stripe());
        assert!(rec.finish_stripe());
        assert!(!rec.finish_stripe(), "underflow is refused");
        assert_eq!(rec.pending_stripes(), 0);
    }

    #[test]
    fn flush_counter_reports_last_completion() {
        let rec = record();
        rec.set_pending_flushes(2);
        assert!(!rec.finish_flush());
        assert!(rec.finish_flush());
        assert!(!rec.finish_flush());
    }

    #[test]
    fn entry_encodes_block_units_and_final_checksum() {
        let mut entry = LogEntry::new(Sector(64), DiskIndex(2));
        entry.data_size = 8192;
        entry.pp_size = 4096;
        entry.checksum.update(&[9_u8; 4096]);

        let disk = entry.to_ondisk(3);
        assert_eq!(disk.data_sector, 8);
        assert_eq!(disk.parity_disk, 2);
        assert_eq!(disk.checksum, crc32c::crc32c(&[9_u8; 4096]));
    }

    #[test]
    fn fullness_by_entries_and_space() {
        let rec = record();
        let mut body = rec.body.lock();
        assert!(!body.is_full(4096));
        body.pp_bytes = 4096;
        assert!(body.is_full(4096));
        body.pp_bytes = 0;
        body.entries = vec![LogEntry::new(Sector(0), DiskIndex(0)); PPL_HDR_MAX_ENTRIES];
        assert!(body.is_full(1 << 20));
    }
}

//! Per-member log state.
//!
//! Each member disk owns one log region. Its append lock guards the open
//! record, the append cursor, and the set of attached stripes; the running
//! queue has its own short lock so completions can look records up without
//! contending with appends.

use crate::config::LogRegion;
use crate::record::{LogRecord, RecordState};
use parking_lot::{Mutex, MutexGuard};
use ppl_types::{DiskIndex, StripeId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// State guarded by the append lock.
#[derive(Debug, Default)]
pub(crate) struct AppendState {
    /// Record currently accepting merges.
    pub(crate) current: Option<Arc<LogRecord>>,
    /// Byte offset of the next record within the region (multi-slot only).
    pub(crate) next_offset: u64,
    /// Stripes attached to a record on this disk, by record sequence.
    pub(crate) attached: HashMap<StripeId, u64>,
    /// A flush was requested while an earlier record blocked submission.
    pub(crate) run_requested: bool,
}

#[derive(Debug)]
pub struct PerDiskLog {
    disk: DiskIndex,
    region: Option<LogRegion>,
    write_back_cache: bool,
    faulty: AtomicBool,
    append: Mutex<AppendState>,
    /// Records not yet released, oldest first.
    running: Mutex<VecDeque<Arc<LogRecord>>>,
}

impl PerDiskLog {
    /// `region` is `None` for a member that is missing.
    pub(crate) fn new(disk: DiskIndex, region: Option<LogRegion>, write_back_cache: bool) -> Self {
        Self {
            disk,
            region,
            write_back_cache,
            faulty: AtomicBool::new(false),
            append: Mutex::new(AppendState::default()),
            running: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn disk(&self) -> DiskIndex {
        self.disk
    }

    #[must_use]
    pub fn region(&self) -> Option<LogRegion> {
        self.region
    }

    #[must_use]
    pub fn is_present(&self) -> bool {
        self.region.is_some()
    }

    #[must_use]
    pub fn is_faulty(&self) -> bool {
        self.faulty.load(Ordering::Acquire)
    }

    /// Log member can accept records.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.is_present() && !self.is_faulty()
    }

    #[must_use]
    pub fn write_back_cache(&self) -> bool {
        self.write_back_cache
    }

    /// Mark faulty; returns `true` if this call made the transition.
    pub(crate) fn mark_faulty(&self) -> bool {
        !self.faulty.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn lock_append(&self) -> MutexGuard<'_, AppendState> {
        self.append.lock()
    }

    pub(crate) fn lock_running(&self) -> MutexGuard<'_, VecDeque<Arc<LogRecord>>> {
        self.running.lock()
    }

    /// Look up an unreleased record by sequence number.
    pub(crate) fn find(&self, seq: u64) -> Option<Arc<LogRecord>> {
        self.running
            .lock()
            .iter()
            .find(|record| record.seq() == seq)
            .cloned()
    }

    /// Remove a record from the running queue.
    pub(crate) fn remove(&self, seq: u64) -> Option<Arc<LogRecord>> {
        let mut running = self.running.lock();
        let idx = running.iter().position(|record| record.seq() == seq)?;
        running.remove(idx)
    }

    #[must_use]
    pub fn running_len(&self) -> usize {
        self.running.lock().len()
    }

    /// States of unreleased records, oldest first.
    #[must_use]
    pub fn record_states(&self) -> Vec<(u64, RecordState)> {
        self.running
            .lock()
            .iter()
            .map(|record| (record.seq(), record.state()))
            .collect()
    }

    #[must_use]
    pub fn next_offset(&self) -> u64 {
        self.append.lock().next_offset
    }
}

/// Choose where a record of `record_bytes` starts and advance the cursor.
///
/// Single-slot regions always write at the start. Multi-slot regions append
/// and rewind to the start when the record would run past the end.
pub(crate) fn place_record(region: &LogRegion, cursor: &mut u64, record_bytes: u64) -> u64 {
    if !region.multi_slot {
        return 0;
    }
    if cursor.saturating_add(record_bytes) > region.size {
        *cursor = 0;
    }
    let offset = *cursor;
    *cursor = offset + record_bytes;
    offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use ppl_types::{PPL_HEADER_SIZE, PPL_SPACE_SIZE};

    #[test]
    fn single_slot_always_writes_at_start() {
        let region = LogRegion::from_bytes(0, 64 * 1024).expect("region");
        let mut cursor = 0;
        assert_eq!(place_record(&region, &mut cursor, 8192), 0);
        assert_eq!(place_record(&region, &mut cursor, 8192), 0);
        assert_eq!(cursor, 0);
    }

    #[test]
    fn multi_slot_advances_and_rewinds() {
        let size = 2 * (PPL_SPACE_SIZE + PPL_HEADER_SIZE) as u64;
        let region = LogRegion::from_bytes(4096, size).expect("region");
        assert!(region.multi_slot);

        let mut cursor = 0;
        let first = PPL_HEADER_SIZE as u64 + 3 * 4096;
        assert_eq!(place_record(&region, &mut cursor, first), 0);
        assert_eq!(cursor, first);

        let big = PPL_HEADER_SIZE as u64 + PPL_SPACE_SIZE as u64;
        assert_eq!(place_record(&region, &mut cursor, big), first);
        assert_eq!(cursor, first + big);

        // Remaining space cannot hold another full record.
        assert_eq!(place_record(&region, &mut cursor, big), 0);
        assert_eq!(cursor, big);
    }

    #[test]
    fn faulty_transition_reported_once() {
        let log = PerDiskLog::new(DiskIndex(0), LogRegion::from_bytes(0, 8192), false);
        assert!(log.is_usable());
        assert!(log.mark_faulty());
        assert!(!log.mark_faulty());
        assert!(!log.is_usable());

        let missing = PerDiskLog::new(DiskIndex(1), None, false);
        assert!(!missing.is_usable());
    }
}

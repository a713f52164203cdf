//! Log counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct LogStats {
    stripes_logged: AtomicU64,
    stripes_not_applicable: AtomicU64,
    stripes_parked: AtomicU64,
    entries_created: AtomicU64,
    entries_merged: AtomicU64,
    records_opened: AtomicU64,
    records_submitted: AtomicU64,
    records_released: AtomicU64,
    log_write_failures: AtomicU64,
    flushes_issued: AtomicU64,
}

/// Point-in-time copy of [`LogStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogStatsSnapshot {
    pub stripes_logged: u64,
    pub stripes_not_applicable: u64,
    pub stripes_parked: u64,
    pub entries_created: u64,
    pub entries_merged: u64,
    pub records_opened: u64,
    pub records_submitted: u64,
    pub records_released: u64,
    pub log_write_failures: u64,
    pub flushes_issued: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl LogStats {
    pub(crate) fn stripe_logged(&self, merged: bool) {
        bump(&self.stripes_logged);
        if merged {
            bump(&self.entries_merged);
        } else {
            bump(&self.entries_created);
        }
    }

    pub(crate) fn stripe_not_applicable(&self) {
        bump(&self.stripes_not_applicable);
    }

    pub(crate) fn stripe_parked(&self) {
        bump(&self.stripes_parked);
    }

    pub(crate) fn record_opened(&self) {
        bump(&self.records_opened);
    }

    pub(crate) fn record_submitted(&self) {
        bump(&self.records_submitted);
    }

    pub(crate) fn record_released(&self) {
        bump(&self.records_released);
    }

    pub(crate) fn log_write_failed(&self) {
        bump(&self.log_write_failures);
    }

    pub(crate) fn flush_issued(&self) {
        bump(&self.flushes_issued);
    }

    #[must_use]
    pub fn snapshot(&self) -> LogStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        LogStatsSnapshot {
            stripes_logged: load(&self.stripes_logged),
            stripes_not_applicable: load(&self.stripes_not_applicable),
            stripes_parked: load(&self.stripes_parked),
            entries_created: load(&self.entries_created),
            entries_merged: load(&self.entries_merged),
            records_opened: load(&self.records_opened),
            records_submitted: load(&self.records_submitted),
            records_released: load(&self.records_released),
            log_write_failures: load(&self.log_write_failures),
            flushes_issued: load(&self.flushes_issued),
        }
    }
}

//! Log registry: the policy interface the stripe cache drives.
//!
//! Routes each stripe to the log of its parity disk, owns the shared record
//! pool and retry queue, and drains I/O completions.

use crate::config::{ArrayConfig, ArrayState};
use crate::disk_log::PerDiskLog;
use crate::layout::{ArrayLayout, LeftSymmetric};
use crate::merge::{self, MergeDecision, MergeGeometry, StripeWrite};
use crate::pool::RecordPool;
use crate::record::LogRecord;
use crate::recovery::{DiskLoadReport, load_logs};
use crate::stats::{LogStats, LogStatsSnapshot};
use crate::stripe::{LogToken, StripeCache, StripeHead, WriteOutcome};
use crate::submit::{SubmitParams, prepare_front};
use parking_lot::Mutex;
use ppl_block::{CompletionQueue, LogSink, MemberDevice};
use ppl_error::{PplError, Result};
use ppl_types::{DiskIndex, DiskMask, PAGE_SIZE};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// How long `quiesce` waits for completions between drain passes.
const QUIESCE_POLL: Duration = Duration::from_millis(10);

/// Outcome of bringing the log up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitReport {
    pub signature: u32,
    pub recovered_entries: u64,
    pub mismatches: u64,
    /// A dirty array whose log replayed cleanly may be treated as clean.
    pub array_clean: bool,
    pub disks: Vec<DiskLoadReport>,
}

/// Final counters when the log is shut down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitReport {
    pub stats: LogStatsSnapshot,
    /// Parked stripes handed back to be written unprotected.
    pub unprotected_stripes: usize,
}

pub struct LogRegistry {
    pub(crate) config: ArrayConfig,
    pub(crate) logs: Vec<PerDiskLog>,
    pub(crate) pool: RecordPool,
    pub(crate) sink: Arc<dyn LogSink>,
    pub(crate) cache: Arc<dyn StripeCache>,
    pub(crate) completions: Arc<CompletionQueue>,
    pub(crate) retry: Mutex<VecDeque<StripeHead>>,
    pub(crate) stats: LogStats,
    quiesced: AtomicBool,
    seq: AtomicU64,
    geometry: MergeGeometry,
    pub(crate) params: SubmitParams,
}

impl LogRegistry {
    /// Validate `config`, load and recover every member log, and build the
    /// registry using the default left-symmetric layout.
    ///
    /// `members` is indexed by disk; `None` marks a missing member. The sink
    /// must write to the same members.
    pub fn init(
        config: ArrayConfig,
        members: Vec<Option<Arc<dyn MemberDevice>>>,
        sink: Arc<dyn LogSink>,
        cache: Arc<dyn StripeCache>,
    ) -> Result<(Self, InitReport)> {
        let layout = LeftSymmetric::new(config.raid_disks, config.chunk_sectors);
        Self::init_with_layout(config, members, sink, cache, &layout)
    }

    pub fn init_with_layout(
        config: ArrayConfig,
        mut members: Vec<Option<Arc<dyn MemberDevice>>>,
        sink: Arc<dyn LogSink>,
        cache: Arc<dyn StripeCache>,
        layout: &dyn ArrayLayout,
    ) -> Result<(Self, InitReport)> {
        config.validate()?;
        if members.len() != config.members.len() {
            return Err(PplError::InvalidConfig(format!(
                "{} member devices for {} member descriptors",
                members.len(),
                config.members.len()
            )));
        }

        // A member is usable only if it is both configured present and supplied.
        for (idx, (slot, member)) in members.iter_mut().zip(&config.members).enumerate() {
            let disk = DiskIndex(u32::try_from(idx).unwrap_or(u32::MAX));
            if !member.present {
                *slot = None;
            }
            let Some(dev) = slot else {
                continue;
            };
            let region = config.log_region(disk)?;
            let end = region.offset.saturating_add(region.size);
            if end > dev.len_bytes() {
                return Err(PplError::LogTooSmall {
                    disk: disk.0,
                    needed: end,
                    available: dev.len_bytes(),
                });
            }
        }

        let load = load_logs(&config, &members, layout)?;
        if config.state == ArrayState::Running && load.mismatches > 0 {
            return Err(PplError::RecoveryMismatch {
                mismatches: load.mismatches,
            });
        }

        let mut logs = Vec::with_capacity(members.len());
        let mut write_back_members = DiskMask::EMPTY;
        for (idx, (slot, member)) in members.iter().zip(&config.members).enumerate() {
            let disk = DiskIndex(u32::try_from(idx).unwrap_or(u32::MAX));
            let region = match slot {
                Some(_) => Some(config.log_region(disk)?),
                None => None,
            };
            if slot.is_some() && member.write_back_cache {
                write_back_members = write_back_members.with(disk);
            }
            logs.push(PerDiskLog::new(disk, region, member.write_back_cache));
        }

        let dirty = matches!(config.state, ArrayState::Assemble { dirty: true });
        let report = InitReport {
            signature: load.signature,
            recovered_entries: load.recovered_entries,
            mismatches: load.mismatches,
            array_clean: dirty && load.recovered_entries > 0 && load.mismatches == 0,
            disks: load.disks,
        };

        let block_shift = config.block_size().trailing_zeros() - config.sector_size.trailing_zeros();
        let registry = Self {
            pool: RecordPool::new(config.max_inflight_records()),
            params: SubmitParams {
                signature: load.signature,
                block_shift,
                max_request_pages: config.tuning.max_request_pages,
                write_back_members,
            },
            geometry: MergeGeometry {
                chunk_sectors: config.chunk_sectors,
                sector_size: config.sector_size,
            },
            seq: AtomicU64::new(load.max_generation),
            logs,
            sink,
            cache,
            completions: Arc::new(CompletionQueue::new()),
            retry: Mutex::new(VecDeque::new()),
            stats: LogStats::default(),
            quiesced: AtomicBool::new(false),
            config,
        };
        info!(
            target: "ppl::registry",
            raid_disks = registry.config.raid_disks,
            signature = format_args!("{:#010x}", report.signature),
            pool = registry.pool.capacity(),
            recovered = report.recovered_entries,
            mismatches = report.mismatches,
            "log_enabled"
        );
        Ok((registry, report))
    }

    /// Drain all records and hand parked stripes back for unprotected writes.
    pub fn exit(self) -> ExitReport {
        self.quiesce(true);
        let parked: Vec<_> = self.retry.lock().drain(..).collect();
        let unprotected_stripes = parked.len();
        for stripe in parked {
            self.cache.write_unprotected(stripe);
        }
        let stats = self.stats.snapshot();
        info!(
            target: "ppl::registry",
            records = stats.records_released,
            stripes = stats.stripes_logged,
            unprotected_stripes,
            "log_disabled"
        );
        ExitReport {
            stats,
            unprotected_stripes,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ArrayConfig {
        &self.config
    }

    #[must_use]
    pub fn log(&self, disk: DiskIndex) -> Option<&PerDiskLog> {
        self.logs.get(disk.as_usize())
    }

    #[must_use]
    pub fn stats(&self) -> LogStatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn signature(&self) -> u32 {
        self.params.signature
    }

    #[must_use]
    pub fn pool_in_use(&self) -> usize {
        self.pool.in_use()
    }

    #[must_use]
    pub fn parked_stripes(&self) -> usize {
        self.retry.lock().len()
    }

    #[must_use]
    pub fn completion_queue(&self) -> &Arc<CompletionQueue> {
        &self.completions
    }

    fn not_applicable_reason(stripe: &StripeHead, log: &PerDiskLog) -> Option<&'static str> {
        if stripe.syncing {
            Some("syncing")
        } else if stripe.pp_page.is_none() {
            Some("no_pp_page")
        } else if stripe.pp_page.as_ref().is_some_and(|p| p.len() != PAGE_SIZE) {
            Some("pp_page_size")
        } else if !stripe.parity_wants_write() {
            Some("parity_not_written")
        } else if !stripe.parity_in_sync {
            Some("parity_not_in_sync")
        } else if !log.is_usable() {
            Some("log_member_unusable")
        } else if stripe.data_disks() == 0 {
            Some("no_data_written")
        } else {
            None
        }
    }

    /// Offer a stripe for protection.
    ///
    /// On `Logged` the stripe's real write must wait for
    /// [`StripeCache::log_durable`]; on `NotApplicable` it may be written
    /// at once; on `Retry` the log keeps it and logs it once a record slot
    /// frees up.
    pub fn write_stripe(&self, stripe: StripeHead) -> WriteOutcome {
        if self.quiesced.load(Ordering::Acquire) {
            self.park(stripe, "quiesced");
            return WriteOutcome::Retry;
        }
        let Some(log) = self.logs.get(stripe.parity_disk.as_usize()) else {
            self.stats.stripe_not_applicable();
            return WriteOutcome::NotApplicable(stripe);
        };
        if let Some(reason) = Self::not_applicable_reason(&stripe, log) {
            trace!(
                target: "ppl::registry",
                stripe = stripe.id.0,
                parity_disk = stripe.parity_disk.0,
                reason,
                "stripe_not_applicable"
            );
            self.stats.stripe_not_applicable();
            return WriteOutcome::NotApplicable(stripe);
        }
        self.append_stripe(log, stripe)
    }

    fn append_stripe(&self, log: &PerDiskLog, stripe: StripeHead) -> WriteOutcome {
        let entry_space = log.region().map_or(0, |region| region.entry_space);
        let mut append = log.lock_append();
        if append.attached.contains_key(&stripe.id) {
            drop(append);
            trace!(target: "ppl::registry", stripe = stripe.id.0, "stripe_already_attached");
            self.stats.stripe_not_applicable();
            return WriteOutcome::NotApplicable(stripe);
        }

        let record = if let Some(current) = &append.current {
            Arc::clone(current)
        } else {
            let Some(header) = self.pool.try_acquire() else {
                drop(append);
                self.park(stripe, "pool_exhausted");
                return WriteOutcome::Retry;
            };
            let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
            let record = Arc::new(LogRecord::new(seq, log.disk(), header));
            log.lock_running().push_back(Arc::clone(&record));
            append.current = Some(Arc::clone(&record));
            self.stats.record_opened();
            debug!(target: "ppl::registry", disk = log.disk().0, seq, "record_opened");
            record
        };

        let token = LogToken {
            disk: log.disk(),
            seq: record.seq(),
            stripe: stripe.id,
        };
        let write = StripeWrite::from_stripe(&stripe);
        let full = {
            let mut body = record.body.lock();
            let decision =
                merge::apply(&mut body.entries, &write, stripe.pp_page.as_deref(), self.geometry);
            if !write.full_stripe {
                body.pp_bytes += PAGE_SIZE as u64;
            }
            body.stripes.push(stripe);
            self.stats.stripe_logged(decision == MergeDecision::Extend);
            body.is_full(entry_space)
        };
        record.add_pending_stripe();
        append.attached.insert(token.stripe, token.seq);

        let prepared = if full {
            debug!(target: "ppl::registry", disk = log.disk().0, seq = token.seq, "record_full");
            append.current = None;
            prepare_front(log, &mut append, self.params, false)
        } else {
            None
        };
        drop(append);
        if let Some(prepared) = prepared {
            self.issue(log, prepared);
        }
        WriteOutcome::Logged(token)
    }

    pub(crate) fn park(&self, stripe: StripeHead, reason: &'static str) {
        warn!(
            target: "ppl::registry",
            stripe = stripe.id.0,
            parity_disk = stripe.parity_disk.0,
            reason,
            "stripe_parked"
        );
        self.retry.lock().push_back(stripe);
        self.stats.stripe_parked();
    }

    /// Submit, without waiting, the oldest unsubmitted record of every disk.
    ///
    /// A disk whose previous record is still unreleased remembers the request
    /// and submits as soon as that record is released.
    pub fn write_stripe_run(&self) {
        for log in &self.logs {
            if !log.is_present() {
                continue;
            }
            let mut append = log.lock_append();
            let prepared = prepare_front(log, &mut append, self.params, true);
            if prepared.is_none() && log.running_len() > 0 {
                append.run_requested = true;
            }
            drop(append);
            if let Some(prepared) = prepared {
                self.issue(log, prepared);
            }
        }
    }

    /// Nothing to do: protected writes go straight to the array once durable.
    pub fn flush_to_array(&self) {
        trace!(target: "ppl::registry", "flush_to_array");
    }

    /// `true` blocks new appends and waits until every record is released;
    /// `false` resumes appends and re-drives parked stripes.
    ///
    /// While quiescing, the stripe cache must keep reporting finished writes
    /// through [`Self::stripe_write_finished`].
    pub fn quiesce(&self, state: bool) {
        if !state {
            self.quiesced.store(false, Ordering::Release);
            info!(target: "ppl::registry", "log_resumed");
            self.redrive_retry();
            return;
        }

        self.quiesced.store(true, Ordering::Release);
        info!(target: "ppl::registry", "log_quiescing");
        loop {
            self.write_stripe_run();
            self.process_completions();
            if self.logs.iter().all(|log| log.running_len() == 0) {
                break;
            }
            self.completions.wait_for_events(QUIESCE_POLL);
        }
        info!(target: "ppl::registry", "log_quiesced");
    }

    #[must_use]
    pub fn is_quiesced(&self) -> bool {
        self.quiesced.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for LogRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRegistry")
            .field("raid_disks", &self.config.raid_disks)
            .field("signature", &self.params.signature)
            .field("quiesced", &self.is_quiesced())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

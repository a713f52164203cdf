//! Completion and release.
//!
//! Runs in the registry's processing step, never in the sink's completion
//! context. A durable record hands its stripes to the stripe cache; once the
//! cache reports every real write finished (and any write-back cache flushes
//! complete) the record is released, its pool slot freed, the next record on
//! the disk submitted, and parked stripes re-driven.

use crate::disk_log::PerDiskLog;
use crate::record::{LogRecord, RecordState};
use crate::registry::LogRegistry;
use crate::stripe::{LogToken, WriteOutcome};
use crate::submit::prepare_front;
use ppl_block::{CompletionHandle, IoEvent};
use ppl_types::DiskIndex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

impl LogRegistry {
    /// Drain the completion queue and run the release work it triggers.
    ///
    /// Returns the number of events handled.
    pub fn process_completions(&self) -> usize {
        let mut handled = 0;
        loop {
            let events = self.completions.drain();
            if events.is_empty() {
                return handled;
            }
            handled += events.len();
            for event in events {
                match event {
                    IoEvent::LogWritten {
                        disk,
                        tag,
                        header,
                        result,
                    } => {
                        self.pool.recycle_header(header);
                        self.on_log_written(disk, tag, result);
                    }
                    IoEvent::Flushed {
                        disk,
                        tag,
                        member,
                        result,
                    } => self.on_flush_done(disk, tag, member, result),
                }
            }
        }
    }

    fn lookup(&self, disk: DiskIndex, seq: u64) -> Option<(&PerDiskLog, Arc<LogRecord>)> {
        let Some(log) = self.logs.get(disk.as_usize()) else {
            warn!(target: "ppl::release", disk = disk.0, seq, "completion_for_unknown_disk");
            return None;
        };
        let Some(record) = log.find(seq) else {
            warn!(target: "ppl::release", disk = disk.0, seq, "completion_for_unknown_record");
            return None;
        };
        Some((log, record))
    }

    fn on_log_written(&self, disk: DiskIndex, seq: u64, result: ppl_error::Result<()>) {
        let Some((_, record)) = self.lookup(disk, seq) else {
            return;
        };
        if let Err(err) = result {
            self.stats.log_write_failed();
            error!(target: "ppl::release", disk = disk.0, seq, error = %err, "log_write_failed");
            self.fail_member(disk);
        }

        let stripes = {
            let mut body = record.body.lock();
            if !record.advance(&mut body, RecordState::Submitted) {
                return;
            }
            std::mem::take(&mut body.stripes)
        };
        debug!(target: "ppl::release", disk = disk.0, seq, stripes = stripes.len(), "record_durable");

        // The real writes of these stripes may start only from here.
        for stripe in stripes {
            let token = LogToken {
                disk,
                seq,
                stripe: stripe.id,
            };
            self.cache.log_durable(stripe, token);
        }
    }

    /// The stripe cache finished the real data and parity write of a logged
    /// stripe.
    pub fn stripe_write_finished(&self, token: LogToken) {
        let Some(log) = self.logs.get(token.disk.as_usize()) else {
            warn!(target: "ppl::release", disk = token.disk.0, "completion_for_unknown_disk");
            return;
        };
        {
            let mut append = log.lock_append();
            if append.attached.get(&token.stripe) == Some(&token.seq) {
                append.attached.remove(&token.stripe);
            }
        }
        let Some((log, record)) = self.lookup(token.disk, token.seq) else {
            return;
        };
        trace!(
            target: "ppl::release",
            disk = token.disk.0,
            seq = token.seq,
            stripe = token.stripe.0,
            "stripe_write_finished"
        );
        if record.finish_stripe() {
            self.complete_stripes(log, &record);
        }
    }

    /// Every stripe of `record` is on disk: flush write-back caches if any
    /// were written, then release.
    fn complete_stripes(&self, log: &PerDiskLog, record: &Arc<LogRecord>) {
        let flush_mask = record.body.lock().flush_mask;
        let members: Vec<DiskIndex> = flush_mask
            .iter()
            .filter(|member| {
                self.logs
                    .get(member.as_usize())
                    .is_some_and(PerDiskLog::is_usable)
            })
            .collect();
        if members.is_empty() {
            self.finish_record(log, record);
            return;
        }

        debug!(
            target: "ppl::release",
            disk = log.disk().0,
            seq = record.seq(),
            flushes = members.len(),
            "record_flushing"
        );
        record.set_pending_flushes(members.len());
        for member in members {
            self.stats.flush_issued();
            let done =
                CompletionHandle::new(Arc::clone(&self.completions), log.disk(), record.seq());
            self.sink.submit_flush(member, done);
        }
    }

    fn on_flush_done(
        &self,
        disk: DiskIndex,
        seq: u64,
        member: DiskIndex,
        result: ppl_error::Result<()>,
    ) {
        if let Err(err) = result {
            error!(
                target: "ppl::release",
                disk = disk.0,
                seq,
                member = member.0,
                error = %err,
                "cache_flush_failed"
            );
            self.fail_member(member);
        }
        let Some((log, record)) = self.lookup(disk, seq) else {
            return;
        };
        if record.finish_flush() {
            self.finish_record(log, &record);
        }
    }

    fn finish_record(&self, log: &PerDiskLog, record: &Arc<LogRecord>) {
        {
            let mut body = record.body.lock();
            if !record.advance(&mut body, RecordState::Released) {
                return;
            }
        }
        log.remove(record.seq());
        self.pool.release_slot();
        self.stats.record_released();
        debug!(target: "ppl::release", disk = log.disk().0, seq = record.seq(), "record_released");

        let prepared = {
            let mut append = log.lock_append();
            let force = append.run_requested;
            prepare_front(log, &mut append, self.params, force)
        };
        if let Some(prepared) = prepared {
            self.issue(log, prepared);
        }

        self.redrive_retry();
    }

    /// Mark a member faulty and tell the stripe cache, once per member.
    pub(crate) fn fail_member(&self, disk: DiskIndex) {
        let newly_faulty = self
            .logs
            .get(disk.as_usize())
            .is_some_and(PerDiskLog::mark_faulty);
        if newly_faulty {
            error!(target: "ppl::release", disk = disk.0, "member_faulty");
            self.cache.member_failed(disk);
        }
    }

    /// Offer parked stripes to the log again.
    ///
    /// Stops at the first stripe that still cannot get a record. Stripes that
    /// are no longer loggable are handed back for an unprotected write.
    pub(crate) fn redrive_retry(&self) {
        if self.is_quiesced() {
            return;
        }
        let mut parked: VecDeque<_> = self.retry.lock().drain(..).collect();
        if parked.is_empty() {
            return;
        }
        debug!(target: "ppl::release", parked = parked.len(), "retry_redrive");

        let mut logged = 0_usize;
        while let Some(stripe) = parked.pop_front() {
            match self.write_stripe(stripe) {
                WriteOutcome::Logged(_) => logged += 1,
                WriteOutcome::NotApplicable(stripe) => self.cache.write_unprotected(stripe),
                WriteOutcome::Retry => {
                    self.retry.lock().extend(parked.drain(..));
                    break;
                }
            }
        }
        if logged > 0 {
            self.write_stripe_run();
        }
    }
}

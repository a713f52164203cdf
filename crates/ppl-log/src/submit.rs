//! Submission pipeline.
//!
//! Turns the oldest record of a disk into a [`LogWriteBatch`]: the header page
//! followed by the partial parity pages of every partial-stripe write, split
//! into chained requests of at most `max_request_pages` pages. Preparation
//! runs under the append lock; the batch is handed to the sink after the lock
//! is dropped.

use crate::disk_log::{AppendState, PerDiskLog, place_record};
use crate::record::RecordState;
use crate::registry::LogRegistry;
use ppl_block::{CompletionHandle, LogPage, LogRequest, LogWriteBatch};
use ppl_error::PplError;
use ppl_ondisk::encode_header_into;
use ppl_types::{DiskMask, PAGE_SIZE, PPL_HEADER_SIZE};
use std::sync::Arc;
use tracing::{debug, error};

/// Fixed inputs of header encoding and request chaining.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SubmitParams {
    pub(crate) signature: u32,
    /// `log2(block_size / sector_size)`.
    pub(crate) block_shift: u32,
    pub(crate) max_request_pages: usize,
    /// Members with a volatile write cache.
    pub(crate) write_back_members: DiskMask,
}

/// A record ready to go to the sink.
#[derive(Debug)]
pub(crate) struct PreparedWrite {
    pub(crate) seq: u64,
    pub(crate) batch: LogWriteBatch,
    /// Set when the batch could not be built; the record completes as failed.
    pub(crate) error: Option<PplError>,
}

/// Split `pages` into requests at consecutive offsets starting at `base`.
pub(crate) fn chain_requests(base: u64, pages: Vec<LogPage>, max_pages: usize) -> Vec<LogRequest> {
    let max_pages = max_pages.max(1);
    let stride = (max_pages * PAGE_SIZE) as u64;
    pages
        .chunks(max_pages)
        .enumerate()
        .map(|(idx, chunk)| LogRequest {
            offset: base + idx as u64 * stride,
            pages: chunk.to_vec(),
        })
        .collect()
}

/// Move the oldest record of `log` to Submitting and build its batch.
///
/// Returns `None` when there is nothing to submit: the queue is empty, the
/// oldest record is already in flight (submission is sequential per disk), or
/// the oldest record is still the current one and `force_current` is unset.
pub(crate) fn prepare_front(
    log: &PerDiskLog,
    append: &mut AppendState,
    params: SubmitParams,
    force_current: bool,
) -> Option<PreparedWrite> {
    let region = log.region()?;
    let running = log.lock_running();
    let record = Arc::clone(running.front()?);
    let mut body = record.body.lock();
    if body.state != RecordState::Open || body.entries.is_empty() {
        return None;
    }
    let is_current = append
        .current
        .as_ref()
        .is_some_and(|current| Arc::ptr_eq(current, &record));
    if is_current && !force_current {
        return None;
    }
    if !record.advance(&mut body, RecordState::Submitting) {
        return None;
    }
    if is_current {
        append.current = None;
    }
    append.run_requested = false;

    let record_bytes = PPL_HEADER_SIZE as u64 + body.pp_bytes;
    let slot = place_record(&region, &mut append.next_offset, record_bytes);

    let entries: Vec<_> = body
        .entries
        .iter()
        .map(|entry| entry.to_ondisk(params.block_shift))
        .collect();
    let mut header = body
        .header
        .take()
        .unwrap_or_else(|| vec![0_u8; PPL_HEADER_SIZE].into_boxed_slice());
    let error = encode_header_into(&mut header, params.signature, record.seq(), &entries)
        .err()
        .map(|err| {
            error!(
                target: "ppl::submit",
                disk = log.disk().0,
                seq = record.seq(),
                error = %err,
                "header_encode_failed"
            );
            PplError::from(err)
        });

    let mut pages = vec![LogPage::Header];
    let mut flush_mask = DiskMask::EMPTY;
    for stripe in &body.stripes {
        if !stripe.full_stripe_write {
            if let Some(page) = &stripe.pp_page {
                pages.push(LogPage::Data(Arc::clone(page)));
            }
        }
        flush_mask = flush_mask.union(DiskMask::from_bits(
            stripe.write_mask.bits() & params.write_back_members.bits(),
        ));
    }
    body.flush_mask = flush_mask;

    let page_count = pages.len();
    let requests = chain_requests(region.offset + slot, pages, params.max_request_pages);
    debug!(
        target: "ppl::submit",
        disk = log.disk().0,
        seq = record.seq(),
        entries = entries.len(),
        stripes = body.stripes.len(),
        pages = page_count,
        requests = requests.len(),
        slot,
        "record_submitting"
    );

    Some(PreparedWrite {
        seq: record.seq(),
        batch: LogWriteBatch {
            disk: log.disk(),
            header,
            requests,
            fua: true,
        },
        error,
    })
}

impl LogRegistry {
    /// Hand a prepared record to the sink, or fail it at once when the log
    /// member cannot take writes.
    pub(crate) fn issue(&self, log: &PerDiskLog, prepared: PreparedWrite) {
        let done = CompletionHandle::new(Arc::clone(&self.completions), log.disk(), prepared.seq);
        self.stats.record_submitted();
        if let Some(err) = prepared.error {
            done.complete_log(prepared.batch.header, Err(err));
            return;
        }
        if !log.is_usable() {
            done.complete_log(
                prepared.batch.header,
                Err(PplError::MemberFaulty(log.disk().0)),
            );
            return;
        }
        self.sink.submit_log(prepared.batch, done);
    }
}

//! Asynchronous log write submission.
//!
//! A [`LogWriteBatch`] is everything one log record puts on disk: the header
//! page followed by partial parity pages, split into chained requests at
//! consecutive offsets. Sinks execute batches out of line and report through
//! the [`CompletionHandle`] supplied with the submission.

use crate::MemberDevice;
use crate::completion::CompletionHandle;
use parking_lot::{Condvar, Mutex};
use ppl_error::{PplError, Result};
use ppl_types::{DiskIndex, PPL_HEADER_SIZE};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace, warn};

/// One page in a log request.
#[derive(Debug, Clone)]
pub enum LogPage {
    /// The batch's header buffer.
    Header,
    /// A shared partial parity page.
    Data(Arc<[u8]>),
}

/// One physical write: contiguous pages starting at `offset` bytes into the member.
#[derive(Debug, Clone)]
pub struct LogRequest {
    pub offset: u64,
    pub pages: Vec<LogPage>,
}

/// All requests for one log record on one member.
#[derive(Debug)]
pub struct LogWriteBatch {
    pub disk: DiskIndex,
    pub header: Box<[u8]>,
    pub requests: Vec<LogRequest>,
    /// Force unit access: the batch is not complete until it is stable.
    pub fua: bool,
}

impl LogWriteBatch {
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.requests.iter().map(|r| r.pages.len()).sum()
    }

    fn page_bytes<'a>(&'a self, page: &'a LogPage) -> &'a [u8] {
        match page {
            LogPage::Header => &self.header[..PPL_HEADER_SIZE.min(self.header.len())],
            LogPage::Data(bytes) => &bytes[..],
        }
    }

    /// Write every request through `device` in order.
    ///
    /// With `fua` set the device cache is flushed before returning, so a
    /// successful return means the batch is stable.
    pub fn write_to(&self, device: &dyn MemberDevice) -> Result<()> {
        for request in &self.requests {
            let len = request
                .pages
                .iter()
                .map(|page| self.page_bytes(page).len())
                .sum();
            let mut buf = Vec::with_capacity(len);
            for page in &request.pages {
                buf.extend_from_slice(self.page_bytes(page));
            }
            trace!(
                target: "ppl::sink",
                disk = self.disk.0,
                offset = request.offset,
                bytes = buf.len(),
                "log_request"
            );
            device.write_all_at(request.offset, &buf)?;
        }
        if self.fua {
            device.flush()?;
        }
        Ok(())
    }
}

/// Member devices indexed by disk; `None` marks a missing member.
pub type MemberSet = Vec<Option<Arc<dyn MemberDevice>>>;

fn member(devices: &MemberSet, disk: DiskIndex) -> Result<&Arc<dyn MemberDevice>> {
    devices
        .get(disk.as_usize())
        .and_then(Option::as_ref)
        .ok_or(PplError::MemberFaulty(disk.0))
}

/// Asynchronous writer for log records and cache flushes.
///
/// Implementations must eventually consume every handle they are given,
/// including on failure.
pub trait LogSink: Send + Sync {
    fn submit_log(&self, batch: LogWriteBatch, done: CompletionHandle);

    /// Flush the write-back cache of member `disk`.
    fn submit_flush(&self, disk: DiskIndex, done: CompletionHandle);
}

fn run_log(devices: &MemberSet, batch: LogWriteBatch, done: CompletionHandle) {
    let result = member(devices, batch.disk).and_then(|dev| batch.write_to(dev.as_ref()));
    if let Err(err) = &result {
        warn!(
            target: "ppl::sink",
            disk = batch.disk.0,
            tag = done.tag(),
            error = %err,
            "log_write_failed"
        );
    }
    done.complete_log(batch.header, result);
}

fn run_flush(devices: &MemberSet, disk: DiskIndex, done: CompletionHandle) {
    let result = member(devices, disk).and_then(|dev| dev.flush());
    if let Err(err) = &result {
        warn!(target: "ppl::sink", disk = disk.0, error = %err, "cache_flush_failed");
    }
    done.complete_flush(disk, result);
}

/// Sink that performs I/O on the submitting thread.
///
/// Completion is still reported through the queue, so release work happens
/// in the registry's processing step as with any other sink.
pub struct InlineLogSink {
    devices: MemberSet,
}

impl InlineLogSink {
    #[must_use]
    pub fn new(devices: MemberSet) -> Self {
        Self { devices }
    }
}

impl LogSink for InlineLogSink {
    fn submit_log(&self, batch: LogWriteBatch, done: CompletionHandle) {
        run_log(&self.devices, batch, done);
    }

    fn submit_flush(&self, disk: DiskIndex, done: CompletionHandle) {
        run_flush(&self.devices, disk, done);
    }
}

// ── Threaded sink ─────────────────────────────────────────────────────────

enum Job {
    Log(LogWriteBatch, CompletionHandle),
    Flush(DiskIndex, CompletionHandle),
}

#[derive(Default)]
struct JobQueue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

#[derive(Default)]
struct SinkShared {
    queue: Mutex<JobQueue>,
    ready: Condvar,
}

impl SinkShared {
    fn push(&self, job: Job) {
        let mut queue = self.queue.lock();
        if queue.shutdown {
            drop(queue);
            // Late submissions still owe a completion.
            match job {
                Job::Log(batch, done) => done.complete_log(batch.header, Err(PplError::Cancelled)),
                Job::Flush(disk, done) => done.complete_flush(disk, Err(PplError::Cancelled)),
            }
            return;
        }
        queue.jobs.push_back(job);
        drop(queue);
        self.ready.notify_one();
    }

    fn next(&self) -> Option<Job> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(job) = queue.jobs.pop_front() {
                return Some(job);
            }
            if queue.shutdown {
                return None;
            }
            self.ready.wait(&mut queue);
        }
    }
}

/// Sink backed by one worker thread that writes to the member devices.
pub struct ThreadedLogSink {
    shared: Arc<SinkShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadedLogSink {
    pub fn spawn(devices: MemberSet) -> Result<Self> {
        let shared = Arc::new(SinkShared::default());
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("ppl-sink".to_owned())
            .spawn(move || {
                while let Some(job) = worker_shared.next() {
                    match job {
                        Job::Log(batch, done) => run_log(&devices, batch, done),
                        Job::Flush(disk, done) => run_flush(&devices, disk, done),
                    }
                }
                debug!(target: "ppl::sink", "worker_exit");
            })?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Finish queued jobs and stop the worker.
    pub fn shutdown(&self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.ready.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!(target: "ppl::sink", "worker_panicked");
            }
        }
    }
}

impl LogSink for ThreadedLogSink {
    fn submit_log(&self, batch: LogWriteBatch, done: CompletionHandle) {
        self.shared.push(Job::Log(batch, done));
    }

    fn submit_flush(&self, disk: DiskIndex, done: CompletionHandle) {
        self.shared.push(Job::Flush(disk, done));
    }
}

impl Drop for ThreadedLogSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadedLogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedLogSink")
            .field("queued", &self.shared.queue.lock().jobs.len())
            .finish_non_exhaustive()
    }
}

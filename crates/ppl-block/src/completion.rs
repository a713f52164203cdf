//! Completion channel between the I/O layer and the log registry.
//!
//! The sink never runs release work itself. It posts an [`IoEvent`] through
//! the [`CompletionHandle`] it was given at submission, and the registry
//! drains the queue from its own processing step.

use parking_lot::{Condvar, Mutex};
use ppl_error::Result;
use ppl_types::DiskIndex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Finished I/O reported by a sink.
#[derive(Debug)]
pub enum IoEvent {
    /// Every request of a log record write has completed.
    LogWritten {
        /// Disk whose log region was written.
        disk: DiskIndex,
        /// Record sequence the write belongs to.
        tag: u64,
        /// Header buffer handed back for reuse.
        header: Box<[u8]>,
        result: Result<()>,
    },
    /// A write-back cache flush issued on behalf of a record has completed.
    Flushed {
        /// Disk owning the record that requested the flush.
        disk: DiskIndex,
        tag: u64,
        /// Member whose cache was flushed.
        member: DiskIndex,
        result: Result<()>,
    },
}

/// Multi-producer queue of [`IoEvent`]s with blocking wait.
#[derive(Debug, Default)]
pub struct CompletionQueue {
    events: Mutex<VecDeque<IoEvent>>,
    posted: Condvar,
}

impl CompletionQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, event: IoEvent) {
        self.events.lock().push_back(event);
        self.posted.notify_all();
    }

    /// Remove and return every queued event in arrival order.
    pub fn drain(&self) -> Vec<IoEvent> {
        self.events.lock().drain(..).collect()
    }

    /// Block until an event is queued or `timeout` elapses.
    ///
    /// Returns `true` when at least one event is queued.
    pub fn wait_for_events(&self, timeout: Duration) -> bool {
        let mut events = self.events.lock();
        if events.is_empty() {
            let _ = self.posted.wait_for(&mut events, timeout);
        }
        !events.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

/// Continuation passed to a sink with each submission.
///
/// Consuming it posts exactly one event, so a submission cannot be completed
/// twice.
#[derive(Debug)]
pub struct CompletionHandle {
    queue: Arc<CompletionQueue>,
    disk: DiskIndex,
    tag: u64,
}

impl CompletionHandle {
    #[must_use]
    pub fn new(queue: Arc<CompletionQueue>, disk: DiskIndex, tag: u64) -> Self {
        Self { queue, disk, tag }
    }

    #[must_use]
    pub fn disk(&self) -> DiskIndex {
        self.disk
    }

    #[must_use]
    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn complete_log(self, header: Box<[u8]>, result: Result<()>) {
        self.queue.post(IoEvent::LogWritten {
            disk: self.disk,
            tag: self.tag,
            header,
            result,
        });
    }

    pub fn complete_flush(self, member: DiskIndex, result: Result<()>) {
        self.queue.post(IoEvent::Flushed {
            disk: self.disk,
            tag: self.tag,
            member,
            result,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ppl_error::PplError;

    #[test]
    fn handle_posts_tagged_events_in_order() {
        let queue = Arc::new(CompletionQueue::new());
        CompletionHandle::new(Arc::clone(&queue), DiskIndex(2), 7)
            .complete_log(vec![0_u8; 8].into_boxed_slice(), Ok(()));
        CompletionHandle::new(Arc::clone(&queue), DiskIndex(2), 7)
            .complete_flush(DiskIndex(0), Err(PplError::MemberFaulty(0)));
        assert_eq!(queue.len(), 2);

        let events = queue.drain();
        assert!(queue.is_empty());
        assert!(matches!(
            events[0],
            IoEvent::LogWritten {
                disk: DiskIndex(2),
                tag: 7,
                result: Ok(()),
                ..
            }
        ));
        assert!(matches!(
            events[1],
            IoEvent::Flushed {
                member: DiskIndex(0),
                result: Err(PplError::MemberFaulty(0)),
                ..
            }
        ));
    }

    #[test]
    fn wait_wakes_on_post_from_other_thread() {
        let queue = Arc::new(CompletionQueue::new());
        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            CompletionHandle::new(producer, DiskIndex(0), 1)
                .complete_flush(DiskIndex(1), Ok(()));
        });
        assert!(queue.wait_for_events(Duration::from_secs(5)));
        handle.join().expect("producer");
    }

    #[test]
    fn wait_times_out_when_idle() {
        let queue = CompletionQueue::new();
        assert!(!queue.wait_for_events(Duration::from_millis(10)));
    }
}

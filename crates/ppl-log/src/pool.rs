//! Bounded pool of log records and their header buffers.
//!
//! A slot is held from the moment a record opens until it is released. The
//! header buffer comes back earlier, as soon as the log write is durable, and
//! is reused by the next record instead of being reallocated.

use parking_lot::Mutex;
use ppl_types::PPL_HEADER_SIZE;

#[derive(Debug)]
struct PoolState {
    in_use: usize,
    free_headers: Vec<Box<[u8]>>,
}

#[derive(Debug)]
pub struct RecordPool {
    capacity: usize,
    state: Mutex<PoolState>,
}

impl RecordPool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(PoolState {
                in_use: 0,
                free_headers: Vec::new(),
            }),
        }
    }

    /// Reserve a record slot and a header buffer; `None` when exhausted.
    pub fn try_acquire(&self) -> Option<Box<[u8]>> {
        let mut state = self.state.lock();
        if state.in_use >= self.capacity {
            return None;
        }
        state.in_use += 1;
        Some(
            state
                .free_headers
                .pop()
                .unwrap_or_else(|| vec![0_u8; PPL_HEADER_SIZE].into_boxed_slice()),
        )
    }

    /// Hand back a header buffer once its log write has completed.
    pub fn recycle_header(&self, header: Box<[u8]>) {
        if header.len() != PPL_HEADER_SIZE {
            return;
        }
        let mut state = self.state.lock();
        if state.free_headers.len() < self.capacity {
            state.free_headers.push(header);
        }
    }

    /// Free the slot of a released record.
    pub fn release_slot(&self) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }
}

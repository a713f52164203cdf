//! Stripe descriptors exchanged with the stripe cache.

use ppl_types::{DiskIndex, DiskMask, Sector, StripeId};
use serde::Serialize;
use std::sync::Arc;

/// A stripe update the stripe cache wants written.
///
/// The log owns the descriptor between `write_stripe` and the durable
/// callback; the partial parity page is shared with the cache.
#[derive(Debug, Clone)]
pub struct StripeHead {
    pub id: StripeId,
    /// Lowest array sector among the data members being written.
    pub sector: Sector,
    pub parity_disk: DiskIndex,
    /// Members that intend to write, parity included.
    pub write_mask: DiskMask,
    pub parity_in_sync: bool,
    /// Every data member is overwritten, so no partial parity is needed.
    pub full_stripe_write: bool,
    /// Partial parity for this stripe: the XOR of the data members left unchanged.
    pub pp_page: Option<Arc<[u8]>>,
    /// Stripe is being resynchronized.
    pub syncing: bool,
}

impl StripeHead {
    /// Number of data members contributing to this write.
    #[must_use]
    pub fn data_disks(&self) -> u32 {
        self.write_mask.without(self.parity_disk).count()
    }

    #[must_use]
    pub fn parity_wants_write(&self) -> bool {
        self.write_mask.contains(self.parity_disk)
    }
}

/// Back-reference from a logged stripe to its record, resolved by lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LogToken {
    pub disk: DiskIndex,
    pub seq: u64,
    pub stripe: StripeId,
}

/// Result of offering a stripe to the log.
#[derive(Debug)]
pub enum WriteOutcome {
    /// Attached to a record; the real write must wait for the durable callback.
    Logged(LogToken),
    /// The log does not protect this stripe; write it unprotected.
    NotApplicable(StripeHead),
    /// Parked until a record slot frees up; the log keeps the descriptor.
    Retry,
}

/// Callbacks into the stripe cache.
///
/// Called from `process_completions` and from retry re-drives, never while a
/// log lock is held, so implementations may call back into the registry.
pub trait StripeCache: Send + Sync {
    /// The record holding `stripe` is durable; its data and parity writes may start.
    fn log_durable(&self, stripe: StripeHead, token: LogToken);

    /// A parked stripe can no longer be logged and must be written unprotected.
    fn write_unprotected(&self, stripe: StripeHead);

    /// Member `disk` failed an I/O and must be treated as faulty.
    fn member_failed(&self, disk: DiskIndex);
}

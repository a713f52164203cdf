#![forbid(unsafe_code)]
//! Partial parity log for RAID5 write-hole protection.
//!
//! Every member disk reserves a log region. Before the stripe cache writes
//! new data and parity for a stripe, the partial parity of the members left
//! untouched is appended to the log of the stripe's parity disk and made
//! durable. After a crash the newest record of each log is replayed by
//! XOR-ing the logged partial parity with the data now on disk, which
//! rebuilds parity for exactly the stripes that were in flight.
//!
//! The stripe cache drives [`LogRegistry`]:
//!
//! - [`LogRegistry::write_stripe`] attaches a stripe to the open record of
//!   its parity disk, merging it into the last entry when it continues it;
//! - [`LogRegistry::write_stripe_run`] submits open records;
//! - [`LogRegistry::process_completions`] hands durable stripes back through
//!   [`StripeCache::log_durable`];
//! - [`LogRegistry::stripe_write_finished`] releases records once every
//!   protected write is on disk.

pub mod config;
pub mod disk_log;
pub mod layout;
pub mod merge;
pub mod pool;
pub mod record;
pub mod recovery;
pub mod registry;
mod release;
pub mod stats;
pub mod stripe;
mod submit;

pub use config::{
    ArrayConfig, ArrayState, DEFAULT_MAX_REQUEST_PAGES, LogRegion, LogTuning, MemberConfig,
    MetadataKind,
};
pub use disk_log::PerDiskLog;
pub use layout::{ArrayLayout, LeftSymmetric, SectorMapping};
pub use merge::{MergeDecision, MergeGeometry, StripeWrite};
pub use record::{LogEntry, LogRecord, RecordState};
pub use recovery::{
    DiskLoadReport, EntryCheck, HeaderLocation, LoadReport, RegionScan, check_entries,
    scan_region, write_empty_log,
};
pub use registry::{ExitReport, InitReport, LogRegistry};
pub use stats::{LogStats, LogStatsSnapshot};
pub use stripe::{LogToken, StripeCache, StripeHead, WriteOutcome};

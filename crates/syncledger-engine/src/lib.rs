//! Record bookkeeping and checkpoint reconciliation for a replication sync.
//!
//! [`MessageTracker`] is the entry point: connector output is fed through
//! it from a source-draining thread and a destination-draining thread.
//! Per-stream counting lives in [`bookkeeping`], three-way count
//! reconciliation of checkpoints in [`checksum`].

pub mod bookkeeping;
pub mod builder;
pub mod checkpoint_id;
pub mod checksum;
pub mod clock;
pub mod config;
pub mod errors;
pub mod failure;
pub mod flags;
pub mod metrics;
pub mod tracker;

#[cfg(test)]
pub(crate) mod test_support;

pub use bookkeeping::{StreamStatsTracker, StreamStatsView, SyncStatsCoordinator};
pub use builder::MessageTrackerBuilder;
pub use checksum::{ChecksumErrorReporter, ChecksumValidator, TelemetryEventPublisher};
pub use errors::{BookkeepingError, InvalidChecksumError};
pub use tracker::MessageTracker;

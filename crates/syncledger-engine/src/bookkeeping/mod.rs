//! Per-stream record accounting and its sync-wide aggregation.

pub mod coordinator;
pub mod stream_tracker;
pub(crate) mod timing;
pub mod view;

pub use coordinator::SyncStatsCoordinator;
pub use stream_tracker::{EmittedStatsCounters, StreamStatsTracker};
pub use view::StreamStatsView;

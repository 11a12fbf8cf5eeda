//! Point-in-time snapshot of a [`StreamStatsTracker`].

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use syncledger_types::stats::SyncStats;
use syncledger_types::StreamKey;

use crate::bookkeeping::stream_tracker::StreamStatsTracker;

/// Plain copy of one stream's counters.
///
/// Fields are read one at a time, so a snapshot taken while messages are
/// still flowing is not a consistent cut. Final statistics are taken after
/// both connectors stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStatsView {
    pub stream: StreamKey,
    pub emitted_records: u64,
    pub emitted_bytes: u64,
    pub filtered_out_records: u64,
    pub filtered_out_bytes: u64,
    pub committed_records: u64,
    pub committed_bytes: u64,
    pub rejected_records: u64,
    pub estimated_records: Option<u64>,
    pub estimated_bytes: Option<u64>,
    pub source_state_count: u64,
    pub destination_state_count: u64,
    pub max_seconds_between_source_checkpoints: u64,
    pub mean_seconds_between_source_checkpoints: f64,
    pub source_checkpoint_intervals: u64,
    pub max_seconds_to_commit: u64,
    pub mean_seconds_to_commit: f64,
    pub commit_samples: u64,
    pub additional_stats: BTreeMap<String, f64>,
    pub reliable: bool,
}

impl StreamStatsView {
    pub(crate) fn capture(tracker: &StreamStatsTracker) -> Self {
        let c = &tracker.counters;
        let estimated = c.estimate_reported.load(Ordering::Acquire);
        Self {
            stream: tracker.key().clone(),
            emitted_records: c.emitted_records.load(Ordering::Acquire),
            emitted_bytes: c.emitted_bytes.load(Ordering::Acquire),
            filtered_out_records: c.filtered_out_records.load(Ordering::Acquire),
            filtered_out_bytes: c.filtered_out_bytes.load(Ordering::Acquire),
            committed_records: c.committed_records.load(Ordering::Acquire),
            committed_bytes: c.committed_bytes.load(Ordering::Acquire),
            rejected_records: c.rejected_records.load(Ordering::Acquire),
            estimated_records: estimated.then(|| c.estimated_records.load(Ordering::Acquire)),
            estimated_bytes: estimated.then(|| c.estimated_bytes.load(Ordering::Acquire)),
            source_state_count: c.source_state_count.load(Ordering::Acquire),
            destination_state_count: c.destination_state_count.load(Ordering::Acquire),
            max_seconds_between_source_checkpoints: c.source_state_interval.max_secs(),
            mean_seconds_between_source_checkpoints: c.source_state_interval.mean_secs(),
            source_checkpoint_intervals: c.source_state_interval.samples(),
            max_seconds_to_commit: c.commit_latency.max_secs(),
            mean_seconds_to_commit: c.commit_latency.mean_secs(),
            commit_samples: c.commit_latency.samples(),
            additional_stats: c
                .additional_stats
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
            reliable: tracker.are_stream_stats_reliable(),
        }
    }

    /// Per-stream [`SyncStats`].
    ///
    /// A successfully completed sync committed everything it did not filter
    /// out, whatever the acknowledgments said.
    #[must_use]
    pub fn to_sync_stats(&self, completed: bool) -> SyncStats {
        let (records_committed, bytes_committed) = if completed {
            (
                self.emitted_records.saturating_sub(self.filtered_out_records),
                self.emitted_bytes.saturating_sub(self.filtered_out_bytes),
            )
        } else {
            (self.committed_records, self.committed_bytes)
        };

        SyncStats {
            records_emitted: self.emitted_records,
            bytes_emitted: self.emitted_bytes,
            records_filtered_out: self.filtered_out_records,
            bytes_filtered_out: self.filtered_out_bytes,
            records_committed,
            bytes_committed,
            estimated_records: self.estimated_records,
            estimated_bytes: self.estimated_bytes,
            records_rejected: (self.rejected_records > 0).then_some(self.rejected_records),
            source_state_messages_emitted: self.source_state_count,
            destination_state_messages_emitted: self.destination_state_count,
            max_seconds_before_source_state_message_emitted: self
                .max_seconds_between_source_checkpoints,
            mean_seconds_before_source_state_message_emitted: self
                .mean_seconds_between_source_checkpoints
                as u64,
            max_seconds_between_state_message_emitted_and_committed: self
                .reliable
                .then_some(self.max_seconds_to_commit),
            mean_seconds_between_state_message_emitted_and_committed: self
                .reliable
                .then_some(self.mean_seconds_to_commit as u64),
            additional_stats: self.additional_stats.clone(),
        }
    }
}

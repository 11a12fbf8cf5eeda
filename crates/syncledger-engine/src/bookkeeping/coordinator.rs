//! Sync-wide routing and aggregation over per-stream trackers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use syncledger_types::checksum::MessageOrigin;
use syncledger_types::message::{EstimateTrace, EstimateType, RecordMessage, StateMessage, StateType};
use syncledger_types::stats::{AttemptStats, StreamSyncStats, SyncStats};
use syncledger_types::StreamKey;

use crate::bookkeeping::stream_tracker::StreamStatsTracker;
use crate::bookkeeping::timing::weighted_mean;
use crate::bookkeeping::view::StreamStatsView;
use crate::checksum::validator::{ChecksumCheck, ChecksumValidator};
use crate::clock::Clock;
use crate::config::types::PlatformMode;
use crate::errors::InvalidChecksumError;
use crate::flags::{FeatureFlag, FeatureFlagReader, FlagContext};
use crate::metrics::MetricClient;

const SCOPE_UNSET: u8 = 0;
const SCOPE_STREAM: u8 = 1;
const SCOPE_SYNC: u8 = 2;

/// Owns every [`StreamStatsTracker`] of one sync attempt.
///
/// Trackers are created on first touch and never removed. Checkpoints are
/// routed to the trackers they cover and then handed to the
/// [`ChecksumValidator`].
pub struct SyncStatsCoordinator {
    mode: PlatformMode,
    validator: ChecksumValidator,
    flags: Arc<dyn FeatureFlagReader>,
    flag_context: FlagContext,
    metrics: Arc<dyn MetricClient>,
    clock: Arc<dyn Clock>,
    log_stream_names: bool,

    streams: DashMap<StreamKey, Arc<StreamStatsTracker>>,
    estimate_scope: AtomicU8,
    has_estimate_errors: AtomicBool,
    sync_estimated_records: AtomicU64,
    sync_estimated_bytes: AtomicU64,
    checksum_validation_enabled: AtomicBool,
}

impl SyncStatsCoordinator {
    #[must_use]
    pub fn new(
        mode: PlatformMode,
        validator: ChecksumValidator,
        flags: Arc<dyn FeatureFlagReader>,
        flag_context: FlagContext,
        metrics: Arc<dyn MetricClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let log_stream_names =
            flags.enabled(FeatureFlag::LogStreamNamesInStateMessage, &flag_context);
        Self {
            mode,
            validator,
            flags,
            flag_context,
            metrics,
            clock,
            log_stream_names,
            streams: DashMap::new(),
            estimate_scope: AtomicU8::new(SCOPE_UNSET),
            has_estimate_errors: AtomicBool::new(false),
            sync_estimated_records: AtomicU64::new(0),
            sync_estimated_bytes: AtomicU64::new(0),
            checksum_validation_enabled: AtomicBool::new(true),
        }
    }

    // -- trackers ------------------------------------------------------------

    /// Tracker for `key`, created if this is the stream's first message.
    pub fn get_or_create_stream_tracker(&self, key: &StreamKey) -> Arc<StreamStatsTracker> {
        if let Some(tracker) = self.streams.get(key) {
            return Arc::clone(tracker.value());
        }
        let tracker = self.streams.entry(key.clone()).or_insert_with(|| {
            tracing::debug!(stream = %key, "Tracking new stream");
            Arc::new(StreamStatsTracker::new(
                key.clone(),
                self.mode,
                Arc::clone(&self.metrics),
                Arc::clone(&self.clock),
            ))
        });
        Arc::clone(tracker.value())
    }

    #[must_use]
    pub fn stream_tracker(&self, key: &StreamKey) -> Option<Arc<StreamStatsTracker>> {
        self.streams.get(key).map(|t| Arc::clone(t.value()))
    }

    fn trackers(&self) -> Vec<Arc<StreamStatsTracker>> {
        self.streams.iter().map(|t| Arc::clone(t.value())).collect()
    }

    // -- records and estimates -------------------------------------------------

    pub fn update_stats(&self, record: &RecordMessage) {
        self.get_or_create_stream_tracker(&record.stream_key())
            .track_record(record);
    }

    pub fn update_stats_from_destination(&self, record: &RecordMessage) {
        self.get_or_create_stream_tracker(&record.stream_key())
            .track_record_count_from_destination(record);
    }

    pub fn update_filtered_out_records_stats(&self, record: &RecordMessage) {
        self.get_or_create_stream_tracker(&record.stream_key())
            .update_filtered_out_records_stats(record);
    }

    /// Record a size estimate.
    ///
    /// The first estimate fixes the scope for the sync. An estimate of the
    /// other scope disables estimates for good.
    pub fn update_estimates(&self, estimate: &EstimateTrace) {
        if self.has_estimate_errors.load(Ordering::Acquire) {
            return;
        }
        let scope = match estimate.estimate_type {
            EstimateType::Stream => SCOPE_STREAM,
            EstimateType::Sync => SCOPE_SYNC,
        };
        match self.estimate_scope.compare_exchange(
            SCOPE_UNSET,
            scope,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(existing) if existing == scope => {}
            Err(_) => {
                self.has_estimate_errors.store(true, Ordering::Release);
                tracing::warn!(
                    estimate_type = ?estimate.estimate_type,
                    "Stream and sync estimates were mixed; estimates disabled for this sync"
                );
                return;
            }
        }

        match estimate.estimate_type {
            EstimateType::Stream => self
                .get_or_create_stream_tracker(&estimate.stream_key())
                .track_estimates(estimate),
            EstimateType::Sync => {
                if let Some(rows) = estimate.row_estimate {
                    self.sync_estimated_records.store(rows, Ordering::Release);
                }
                if let Some(bytes) = estimate.byte_estimate {
                    self.sync_estimated_bytes.store(bytes, Ordering::Release);
                }
            }
        }
    }

    // -- checkpoints -----------------------------------------------------------

    /// Stage a source checkpoint and validate the source's count.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidChecksumError`] when the counts disagree and the
    /// sync is configured to fail on invalid checksums.
    pub fn update_source_states_stats(
        &self,
        checkpoint: &StateMessage,
    ) -> Result<(), InvalidChecksumError> {
        match checkpoint.state_type {
            StateType::Stream => {
                let Some(key) = checkpoint.stream_key() else {
                    tracing::warn!("Source STREAM checkpoint without a stream descriptor; skipping");
                    return Ok(());
                };
                let tracker = self.get_or_create_stream_tracker(key);
                tracker.track_state_from_source(checkpoint);
                self.refresh_validation_status(&tracker);

                self.validate(
                    checkpoint,
                    MessageOrigin::Source,
                    tracker.emitted_records_since_last_checkpoint(),
                    0,
                    true,
                )
            }
            StateType::Global => {
                self.log_global_streams(checkpoint, MessageOrigin::Source);
                for stream_state in checkpoint.global_stream_states() {
                    let tracker = self.get_or_create_stream_tracker(&stream_state.stream_descriptor);
                    tracker.track_state_from_source(checkpoint);
                    self.refresh_validation_status(&tracker);
                }

                let platform_count: u64 = self
                    .trackers()
                    .iter()
                    .map(|t| t.emitted_records_since_last_checkpoint())
                    .sum();
                self.validate(checkpoint, MessageOrigin::Source, platform_count, 0, false)
            }
            StateType::Legacy => {
                tracing::warn!("Legacy checkpoints are not tracked; skipping source checkpoint");
                Ok(())
            }
        }
    }

    /// Settle staged counts for an acknowledged checkpoint and validate the
    /// destination's count.
    ///
    /// Committed counts are updated before validation runs, so bookkeeping
    /// is complete even when validation fails.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidChecksumError`] when the counts disagree and the
    /// sync is configured to fail on invalid checksums.
    pub fn update_destination_state_stats(
        &self,
        checkpoint: &StateMessage,
    ) -> Result<(), InvalidChecksumError> {
        match checkpoint.state_type {
            StateType::Stream => {
                let Some(key) = checkpoint.stream_key() else {
                    tracing::warn!(
                        "Destination STREAM checkpoint without a stream descriptor; skipping"
                    );
                    return Ok(());
                };
                let tracker = self.get_or_create_stream_tracker(key);
                let platform_count = tracker.emitted_records_for_checkpoint(checkpoint);
                let filtered_out = tracker.filtered_out_records_for_checkpoint(checkpoint);
                tracker.track_state_from_destination(checkpoint);

                self.validate(
                    checkpoint,
                    MessageOrigin::Destination,
                    platform_count,
                    filtered_out,
                    true,
                )
            }
            StateType::Global => {
                self.log_global_streams(checkpoint, MessageOrigin::Destination);
                let mut platform_count = 0_u64;
                let mut filtered_out = 0_u64;
                for stream_state in checkpoint.global_stream_states() {
                    let tracker = self.get_or_create_stream_tracker(&stream_state.stream_descriptor);
                    platform_count += tracker.emitted_records_for_checkpoint(checkpoint);
                    filtered_out += tracker.filtered_out_records_for_checkpoint(checkpoint);
                    tracker.track_state_from_destination(checkpoint);
                }

                self.validate(
                    checkpoint,
                    MessageOrigin::Destination,
                    platform_count,
                    filtered_out,
                    false,
                )
            }
            StateType::Legacy => {
                tracing::warn!(
                    "Legacy checkpoints are not tracked; skipping destination checkpoint"
                );
                Ok(())
            }
        }
    }

    /// Validate one checkpoint against the platform's count.
    ///
    /// Source checkpoints are diagnosed with per-stream emitted counts,
    /// destination checkpoints with per-stream committed counts.
    fn validate(
        &self,
        checkpoint: &StateMessage,
        origin: MessageOrigin,
        platform_count: u64,
        filtered_out: u64,
        include_stream_detail: bool,
    ) -> Result<(), InvalidChecksumError> {
        let counts = || match origin {
            MessageOrigin::Destination => self.committed_by_stream(),
            _ => self.emitted_by_stream(),
        };
        let check = ChecksumCheck {
            checkpoint,
            platform_count,
            origin,
            fail_on_invalid_checksum: self
                .flags
                .enabled(FeatureFlag::FailSyncOnInvalidChecksum, &self.flag_context),
            validation_enabled: self.is_checksum_validation_enabled(),
            include_stream_detail,
            filtered_out,
            stream_counts: &counts,
        };
        self.validator.validate(&check).map(|_| ())
    }

    fn refresh_validation_status(&self, tracker: &StreamStatsTracker) {
        if !tracker.are_stream_stats_reliable()
            && self
                .checksum_validation_enabled
                .swap(false, Ordering::AcqRel)
        {
            tracing::warn!(
                stream = %tracker.key(),
                "Checkpoint ids collided; checksum failures will be logged but not acted on"
            );
        }
    }

    fn log_global_streams(&self, checkpoint: &StateMessage, origin: MessageOrigin) {
        if !self.log_stream_names {
            return;
        }
        let names: Vec<String> = checkpoint
            .global_stream_states()
            .iter()
            .map(|s| s.stream_descriptor.to_string())
            .collect();
        tracing::info!(origin = %origin, streams = ?names, "GLOBAL checkpoint received");
    }

    /// False once any stream's checkpoint ids collided.
    #[must_use]
    pub fn is_checksum_validation_enabled(&self) -> bool {
        self.checksum_validation_enabled.load(Ordering::Acquire)
    }

    /// True if any checkpoint failed checksum validation so far.
    #[must_use]
    pub fn checksum_error_observed(&self) -> bool {
        self.validator.checksum_error_observed()
    }

    fn emitted_by_stream(&self) -> BTreeMap<StreamKey, u64> {
        self.stream_views()
            .into_iter()
            .map(|v| (v.stream, v.emitted_records))
            .collect()
    }

    fn committed_by_stream(&self) -> BTreeMap<StreamKey, u64> {
        self.stream_views()
            .into_iter()
            .map(|v| (v.stream, v.committed_records))
            .collect()
    }

    // -- aggregation -----------------------------------------------------------

    /// Snapshot of every tracked stream, ordered by stream key.
    #[must_use]
    pub fn stream_views(&self) -> Vec<StreamStatsView> {
        let mut views: Vec<_> = self.trackers().iter().map(|t| t.view()).collect();
        views.sort_by(|a, b| a.stream.cmp(&b.stream));
        views
    }

    #[must_use]
    pub fn max_seconds_to_receive_source_state_message(&self) -> u64 {
        self.stream_views()
            .iter()
            .map(|v| v.max_seconds_between_source_checkpoints)
            .max()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn mean_seconds_to_receive_source_state_message(&self) -> u64 {
        weighted_mean(self.stream_views().iter().map(|v| {
            (
                v.mean_seconds_between_source_checkpoints,
                v.source_checkpoint_intervals,
            )
        }))
    }

    /// `None` when no stream is tracked or any stream became unreliable.
    #[must_use]
    pub fn max_seconds_between_state_message_emitted_and_committed(&self) -> Option<u64> {
        let views = self.stream_views();
        commit_timing_available(&views)
            .then(|| views.iter().map(|v| v.max_seconds_to_commit).max().unwrap_or(0))
    }

    /// `None` when no stream is tracked or any stream became unreliable.
    #[must_use]
    pub fn mean_seconds_between_state_message_emitted_and_committed(&self) -> Option<u64> {
        let views = self.stream_views();
        commit_timing_available(&views).then(|| {
            weighted_mean(
                views
                    .iter()
                    .map(|v| (v.mean_seconds_to_commit, v.commit_samples)),
            )
        })
    }

    /// Sync-wide totals.
    ///
    /// With `replication_completed`, every emitted record that was not
    /// filtered out counts as committed.
    #[must_use]
    pub fn total_stats(&self, replication_completed: bool) -> SyncStats {
        let views = self.stream_views();
        let mut total = SyncStats::default();
        let mut rejected = 0;

        for view in &views {
            let stats = view.to_sync_stats(replication_completed);
            total.records_emitted += stats.records_emitted;
            total.bytes_emitted += stats.bytes_emitted;
            total.records_filtered_out += stats.records_filtered_out;
            total.bytes_filtered_out += stats.bytes_filtered_out;
            total.records_committed += stats.records_committed;
            total.bytes_committed += stats.bytes_committed;
            rejected += stats.records_rejected.unwrap_or(0);
            total.source_state_messages_emitted += stats.source_state_messages_emitted;
            total.destination_state_messages_emitted += stats.destination_state_messages_emitted;
            for (name, value) in stats.additional_stats {
                *total.additional_stats.entry(name).or_insert(0.0) += value;
            }
        }
        total.records_rejected = (rejected > 0).then_some(rejected);

        let (estimated_records, estimated_bytes) = self.total_estimates(&views);
        total.estimated_records = estimated_records;
        total.estimated_bytes = estimated_bytes;

        total.max_seconds_before_source_state_message_emitted = views
            .iter()
            .map(|v| v.max_seconds_between_source_checkpoints)
            .max()
            .unwrap_or(0);
        total.mean_seconds_before_source_state_message_emitted = weighted_mean(views.iter().map(
            |v| {
                (
                    v.mean_seconds_between_source_checkpoints,
                    v.source_checkpoint_intervals,
                )
            },
        ));
        if commit_timing_available(&views) {
            total.max_seconds_between_state_message_emitted_and_committed =
                views.iter().map(|v| v.max_seconds_to_commit).max();
            total.mean_seconds_between_state_message_emitted_and_committed = Some(weighted_mean(
                views
                    .iter()
                    .map(|v| (v.mean_seconds_to_commit, v.commit_samples)),
            ));
        }
        total
    }

    fn total_estimates(&self, views: &[StreamStatsView]) -> (Option<u64>, Option<u64>) {
        if self.has_estimate_errors.load(Ordering::Acquire) {
            return (None, None);
        }
        if self.estimate_scope.load(Ordering::Acquire) == SCOPE_SYNC {
            return (
                Some(self.sync_estimated_records.load(Ordering::Acquire)),
                Some(self.sync_estimated_bytes.load(Ordering::Acquire)),
            );
        }
        (
            sum_reported(views.iter().map(|v| v.estimated_records)),
            sum_reported(views.iter().map(|v| v.estimated_bytes)),
        )
    }

    /// Per-stream stats, ordered by stream key.
    #[must_use]
    pub fn stream_stats(&self, replication_completed: bool) -> Vec<StreamSyncStats> {
        let estimates_valid = !self.has_estimate_errors.load(Ordering::Acquire);
        self.stream_views()
            .into_iter()
            .map(|view| {
                let mut stats = view.to_sync_stats(replication_completed);
                if !estimates_valid {
                    stats.estimated_records = None;
                    stats.estimated_bytes = None;
                }
                StreamSyncStats {
                    stream: view.stream,
                    stats,
                }
            })
            .collect()
    }

    #[must_use]
    pub fn attempt_stats(&self, replication_completed: bool) -> AttemptStats {
        AttemptStats {
            total: self.total_stats(replication_completed),
            streams: self.stream_stats(replication_completed),
        }
    }

    /// Finalize checksum validation for the attempt.
    pub fn end_of_replication(&self, completed_successfully: bool) {
        self.validator.close(completed_successfully);
    }
}

fn commit_timing_available(views: &[StreamStatsView]) -> bool {
    !views.is_empty() && views.iter().all(|v| v.reliable)
}

/// Sum of the reported values, or `None` if nothing was reported.
fn sum_reported(values: impl Iterator<Item = Option<u64>>) -> Option<u64> {
    values.fold(None, |acc, value| match (acc, value) {
        (acc, None) => acc,
        (None, Some(v)) => Some(v),
        (Some(a), Some(v)) => Some(a + v),
    })
}

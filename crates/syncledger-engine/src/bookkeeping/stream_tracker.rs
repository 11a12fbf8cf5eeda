//! Per-stream counters and checkpoint staging.
//!
//! Records are counted twice: into the cumulative counters and into the
//! current [`EmittedStatsCounters`] bucket. A source checkpoint closes the
//! bucket and stages it; the destination's acknowledgment of that
//! checkpoint moves the staged amounts into the committed counters.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde_json::{Map, Value};
use syncledger_types::message::{EstimateTrace, RecordMessage, StateMessage, StateType};
use syncledger_types::StreamKey;

use crate::bookkeeping::timing::TimingStat;
use crate::bookkeeping::view::StreamStatsView;
use crate::checkpoint_id::CheckpointId;
use crate::clock::Clock;
use crate::config::types::PlatformMode;
use crate::metrics::{MetricAttribute, MetricClient, TrackerMetric};

/// Cumulative counts a self-counting destination attaches to its records.
pub const EMITTED_RECORDS_COUNT_KEY: &str = "emittedRecordsCount";
pub const EMITTED_BYTES_COUNT_KEY: &str = "emittedBytesCount";
/// Committed totals a self-counting destination attaches to its checkpoints.
pub const COMMITTED_RECORDS_COUNT_KEY: &str = "committedRecordsCount";
pub const COMMITTED_BYTES_COUNT_KEY: &str = "committedBytesCount";
pub const REJECTED_RECORDS_COUNT_KEY: &str = "rejectedRecordsCount";

// ---------------------------------------------------------------------------
// Buckets
// ---------------------------------------------------------------------------

/// Counts accumulated since the last source checkpoint.
#[derive(Debug, Default)]
pub struct EmittedStatsCounters {
    records: AtomicU64,
    bytes: AtomicU64,
    filtered_out_records: AtomicU64,
    filtered_out_bytes: AtomicU64,
}

impl EmittedStatsCounters {
    #[must_use]
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn filtered_out_records(&self) -> u64 {
        self.filtered_out_records.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn filtered_out_bytes(&self) -> u64 {
        self.filtered_out_bytes.load(Ordering::Acquire)
    }

    /// Records and bytes that reach the destination.
    fn committable(&self) -> (u64, u64) {
        (
            self.records().saturating_sub(self.filtered_out_records()),
            self.bytes().saturating_sub(self.filtered_out_bytes()),
        )
    }
}

/// A closed bucket waiting for the destination to acknowledge its checkpoint.
#[derive(Debug)]
struct StagedStats {
    checkpoint_id: CheckpointId,
    emitted: Arc<EmittedStatsCounters>,
    received_at: i64,
}

#[derive(Debug, Default)]
struct Staging {
    /// Ids currently in `queue`.
    pending_ids: HashSet<CheckpointId>,
    /// Oldest checkpoint first.
    queue: VecDeque<StagedStats>,
    last_source_checkpoint_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// Cumulative counters
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct StreamStatsCounters {
    pub(crate) emitted_records: AtomicU64,
    pub(crate) emitted_bytes: AtomicU64,
    pub(crate) filtered_out_records: AtomicU64,
    pub(crate) filtered_out_bytes: AtomicU64,
    pub(crate) committed_records: AtomicU64,
    pub(crate) committed_bytes: AtomicU64,
    pub(crate) estimated_records: AtomicU64,
    pub(crate) estimated_bytes: AtomicU64,
    pub(crate) estimate_reported: AtomicBool,
    pub(crate) rejected_records: AtomicU64,
    pub(crate) source_state_count: AtomicU64,
    pub(crate) destination_state_count: AtomicU64,
    pub(crate) source_state_interval: TimingStat,
    pub(crate) commit_latency: TimingStat,
    pub(crate) additional_stats: DashMap<String, f64>,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Accounting for one stream of one sync attempt.
///
/// Safe to drive from one source-draining and one destination-draining
/// thread at the same time. Counter updates are plain atomics; only the
/// staged queue sits behind a per-stream mutex.
pub struct StreamStatsTracker {
    key: StreamKey,
    mode: PlatformMode,
    metrics: Arc<dyn MetricClient>,
    clock: Arc<dyn Clock>,
    pub(crate) counters: StreamStatsCounters,
    current: ArcSwap<EmittedStatsCounters>,
    previous: ArcSwap<EmittedStatsCounters>,
    staging: Mutex<Staging>,
    unreliable: AtomicBool,
}

impl StreamStatsTracker {
    #[must_use]
    pub fn new(
        key: StreamKey,
        mode: PlatformMode,
        metrics: Arc<dyn MetricClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            key,
            mode,
            metrics,
            clock,
            counters: StreamStatsCounters::default(),
            current: ArcSwap::from_pointee(EmittedStatsCounters::default()),
            previous: ArcSwap::from_pointee(EmittedStatsCounters::default()),
            staging: Mutex::new(Staging::default()),
            unreliable: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    fn lock_staging(&self) -> MutexGuard<'_, Staging> {
        self.staging.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stream_attributes(&self) -> Vec<MetricAttribute> {
        let mut attributes = vec![MetricAttribute::new("stream", self.key.name.clone())];
        if let Some(namespace) = &self.key.namespace {
            attributes.push(MetricAttribute::new("namespace", namespace.clone()));
        }
        attributes
    }

    // -- records -------------------------------------------------------------

    /// Count a record emitted by the source.
    pub fn track_record(&self, record: &RecordMessage) {
        let bytes = record.size_bytes();
        // One bucket reference for both increments, so a concurrent rollover
        // cannot split a record's count from its bytes.
        let bucket = self.current.load();
        bucket.records.fetch_add(1, Ordering::AcqRel);
        bucket.bytes.fetch_add(bytes, Ordering::AcqRel);

        self.counters.emitted_records.fetch_add(1, Ordering::AcqRel);
        self.counters.emitted_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Count a source record that a mapper dropped before the destination.
    pub fn update_filtered_out_records_stats(&self, record: &RecordMessage) {
        let bytes = record.size_bytes();
        let bucket = self.current.load();
        bucket.filtered_out_records.fetch_add(1, Ordering::AcqRel);
        bucket.filtered_out_bytes.fetch_add(bytes, Ordering::AcqRel);

        self.counters
            .filtered_out_records
            .fetch_add(1, Ordering::AcqRel);
        self.counters
            .filtered_out_bytes
            .fetch_add(bytes, Ordering::AcqRel);
    }

    /// Take over the cumulative counts a self-counting destination reports.
    ///
    /// Counts only move forward: a stale report never lowers them.
    pub fn track_record_count_from_destination(&self, record: &RecordMessage) {
        if !self.mode.destination_self_reports() {
            return;
        }
        let bucket = self.current.load();
        if let Some(records) = record.additional_count(EMITTED_RECORDS_COUNT_KEY) {
            bucket.records.fetch_max(records, Ordering::AcqRel);
            self.counters
                .emitted_records
                .fetch_max(records, Ordering::AcqRel);
        }
        if let Some(bytes) = record.additional_count(EMITTED_BYTES_COUNT_KEY) {
            bucket.bytes.fetch_max(bytes, Ordering::AcqRel);
            self.counters
                .emitted_bytes
                .fetch_max(bytes, Ordering::AcqRel);
        }
    }

    // -- checkpoints ---------------------------------------------------------

    /// Close the current bucket at a source checkpoint and stage it.
    ///
    /// A checkpoint id that is already staged marks the stream unreliable:
    /// every staged bucket is discarded and nothing is staged afterwards.
    pub fn track_state_from_source(&self, checkpoint: &StateMessage) {
        let now = self.clock.now_millis();
        self.counters
            .source_state_count
            .fetch_add(1, Ordering::AcqRel);
        let checkpoint_id = CheckpointId::of(checkpoint);

        let mut staging = self.lock_staging();

        if self.unreliable.load(Ordering::Acquire) {
            let rolled = self
                .current
                .swap(Arc::new(EmittedStatsCounters::default()));
            self.previous.store(rolled);
            return;
        }

        if !staging.pending_ids.insert(checkpoint_id) {
            self.unreliable.store(true, Ordering::Release);
            staging.queue.clear();
            staging.pending_ids.clear();
            drop(staging);

            tracing::warn!(
                stream = %self.key,
                checkpoint_id = %checkpoint_id,
                "Source emitted a checkpoint that is already staged; commit accounting disabled for this stream"
            );
            self.metrics.count(
                TrackerMetric::StateCollisionFromSource,
                1,
                &self.stream_attributes(),
            );
            return;
        }

        let rolled = self
            .current
            .swap(Arc::new(EmittedStatsCounters::default()));
        self.previous.store(Arc::clone(&rolled));
        staging.queue.push_back(StagedStats {
            checkpoint_id,
            emitted: rolled,
            received_at: now,
        });

        if let Some(previous) = staging.last_source_checkpoint_at.replace(now) {
            self.counters
                .source_state_interval
                .record(now - previous);
        }
    }

    /// Settle staged buckets up to and including the acknowledged checkpoint.
    ///
    /// Unknown or already-settled acknowledgments only emit a diagnostic;
    /// they never touch committed counts.
    pub fn track_state_from_destination(&self, checkpoint: &StateMessage) {
        let now = self.clock.now_millis();
        self.counters
            .destination_state_count
            .fetch_add(1, Ordering::AcqRel);

        if self.unreliable.load(Ordering::Acquire) {
            return;
        }

        let checkpoint_id = CheckpointId::of(checkpoint);
        let mut staging = self.lock_staging();

        if staging.queue.is_empty() || !staging.pending_ids.contains(&checkpoint_id) {
            let nothing_staged = staging.queue.is_empty();
            drop(staging);
            tracing::warn!(
                stream = %self.key,
                checkpoint_id = %checkpoint_id,
                nothing_staged,
                "Destination acknowledged a checkpoint that is not staged; ignoring"
            );
            self.metrics.count(
                TrackerMetric::UnknownStateFromDestination,
                1,
                &self.stream_attributes(),
            );
            return;
        }

        let passthrough = self.mode.destination_self_reports();
        let destination_stats = checkpoint.destination_stats.as_ref();
        let rejected = destination_stats
            .and_then(|stats| stats.rejected_record_count)
            .map_or(0, count_from_f64);

        while let Some(entry) = staging.queue.pop_front() {
            staging.pending_ids.remove(&entry.checkpoint_id);
            let matched = entry.checkpoint_id == checkpoint_id;

            if !passthrough {
                let (records, bytes) = entry.emitted.committable();
                let rejected = if matched { rejected.min(records) } else { 0 };
                self.counters
                    .committed_records
                    .fetch_add(records - rejected, Ordering::AcqRel);
                self.counters
                    .committed_bytes
                    .fetch_add(bytes, Ordering::AcqRel);
                if rejected > 0 {
                    self.counters
                        .rejected_records
                        .fetch_add(rejected, Ordering::AcqRel);
                }
            }

            if matched {
                self.counters
                    .commit_latency
                    .record(now - entry.received_at);
                if let Some(stats) = destination_stats {
                    for (name, value) in &stats.additional_stats {
                        *self
                            .counters
                            .additional_stats
                            .entry(name.clone())
                            .or_insert(0.0) += value;
                    }
                }
                break;
            }
        }
        drop(staging);

        if passthrough {
            self.apply_destination_reported_counts(checkpoint);
        }
    }

    /// Counter passthrough for destinations that report committed totals.
    fn apply_destination_reported_counts(&self, checkpoint: &StateMessage) {
        let Some(properties) = self.reported_properties(checkpoint) else {
            return;
        };
        if let Some(committed) = property_count(properties, COMMITTED_RECORDS_COUNT_KEY) {
            self.counters
                .emitted_records
                .fetch_max(committed, Ordering::AcqRel);
            self.counters
                .committed_records
                .store(committed, Ordering::Release);
        }
        if let Some(committed) = property_count(properties, COMMITTED_BYTES_COUNT_KEY) {
            self.counters
                .emitted_bytes
                .fetch_max(committed, Ordering::AcqRel);
            self.counters
                .committed_bytes
                .store(committed, Ordering::Release);
        }
        if let Some(rejected) = property_count(properties, REJECTED_RECORDS_COUNT_KEY) {
            self.counters
                .rejected_records
                .store(rejected, Ordering::Release);
        }
    }

    /// Properties carrying this stream's reported totals.
    fn reported_properties<'a>(&self, checkpoint: &'a StateMessage) -> Option<&'a Map<String, Value>> {
        match checkpoint.state_type {
            StateType::Global => checkpoint
                .global_stream_states()
                .iter()
                .find(|s| s.stream_descriptor == self.key)
                .map(|s| &s.additional_properties),
            StateType::Stream | StateType::Legacy => Some(&checkpoint.additional_properties),
        }
    }

    // -- estimates -----------------------------------------------------------

    /// Replace the stream's size estimate.
    pub fn track_estimates(&self, estimate: &EstimateTrace) {
        if let Some(rows) = estimate.row_estimate {
            self.counters
                .estimated_records
                .store(rows, Ordering::Release);
        }
        if let Some(bytes) = estimate.byte_estimate {
            self.counters
                .estimated_bytes
                .store(bytes, Ordering::Release);
        }
        self.counters
            .estimate_reported
            .store(true, Ordering::Release);
    }

    // -- queries -------------------------------------------------------------

    /// Records in the bucket closed by the most recent source checkpoint.
    #[must_use]
    pub fn emitted_records_since_last_checkpoint(&self) -> u64 {
        self.previous.load().records()
    }

    /// Records staged for `checkpoint`, or 0 if it is not staged.
    #[must_use]
    pub fn emitted_records_for_checkpoint(&self, checkpoint: &StateMessage) -> u64 {
        self.staged_bucket(checkpoint)
            .map_or(0, |bucket| bucket.records())
    }

    /// Filtered-out records staged for `checkpoint`, or 0 if it is not staged.
    #[must_use]
    pub fn filtered_out_records_for_checkpoint(&self, checkpoint: &StateMessage) -> u64 {
        self.staged_bucket(checkpoint)
            .map_or(0, |bucket| bucket.filtered_out_records())
    }

    fn staged_bucket(&self, checkpoint: &StateMessage) -> Option<Arc<EmittedStatsCounters>> {
        let checkpoint_id = CheckpointId::of(checkpoint);
        let found = self
            .lock_staging()
            .queue
            .iter()
            .find(|entry| entry.checkpoint_id == checkpoint_id)
            .map(|entry| Arc::clone(&entry.emitted));
        if found.is_none() && !self.unreliable.load(Ordering::Acquire) {
            tracing::warn!(
                stream = %self.key,
                checkpoint_id = %checkpoint_id,
                "No staged stats for checkpoint; counting it as 0 records"
            );
        }
        found
    }

    /// False once a duplicate checkpoint id was seen from the source.
    #[must_use]
    pub fn are_stream_stats_reliable(&self) -> bool {
        !self.unreliable.load(Ordering::Acquire)
    }

    /// Number of checkpoints waiting for an acknowledgment.
    #[must_use]
    pub fn staged_checkpoints(&self) -> usize {
        self.lock_staging().queue.len()
    }

    #[must_use]
    pub fn view(&self) -> StreamStatsView {
        StreamStatsView::capture(self)
    }
}

fn count_from_f64(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value as u64
    } else {
        0
    }
}

fn property_count(properties: &Map<String, Value>, key: &str) -> Option<u64> {
    let value = properties.get(key)?;
    value
        .as_u64()
        .or_else(|| value.as_f64().map(count_from_f64))
}

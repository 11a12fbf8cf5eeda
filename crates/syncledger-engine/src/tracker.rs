//! Message dispatch for one sync attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use syncledger_state::StatePersistence;
use syncledger_types::checksum::MessageOrigin;
use syncledger_types::failure::{FailureOrigin, FailureReason};
use syncledger_types::message::{Message, RecordMessage, StateMessage, TraceKind, TraceMessage};
use syncledger_types::stats::{AttemptStats, StreamSyncStats, SyncStats};

use crate::bookkeeping::SyncStatsCoordinator;
use crate::config::types::{PlatformMode, SyncContext};
use crate::errors::BookkeepingError;
use crate::failure::failure_from_trace;

/// Routes connector output into the bookkeeping core.
///
/// One thread feeds [`accept_from_source`](Self::accept_from_source), another
/// feeds [`accept_from_destination`](Self::accept_from_destination). Messages
/// of a single stream must arrive in order on each side.
pub struct MessageTracker {
    sync: SyncContext,
    mode: PlatformMode,
    coordinator: SyncStatsCoordinator,
    persistence: Arc<dyn StatePersistence>,
    source_errors: Mutex<Vec<TraceMessage>>,
    destination_errors: Mutex<Vec<TraceMessage>>,
    finished: AtomicBool,
}

impl MessageTracker {
    #[must_use]
    pub fn new(
        sync: SyncContext,
        mode: PlatformMode,
        coordinator: SyncStatsCoordinator,
        persistence: Arc<dyn StatePersistence>,
    ) -> Self {
        Self {
            sync,
            mode,
            coordinator,
            persistence,
            source_errors: Mutex::new(Vec::new()),
            destination_errors: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn coordinator(&self) -> &SyncStatsCoordinator {
        &self.coordinator
    }

    #[must_use]
    pub fn sync(&self) -> &SyncContext {
        &self.sync
    }

    // -- intake --------------------------------------------------------------

    /// Account for a message read from the source.
    ///
    /// # Errors
    ///
    /// Returns [`BookkeepingError::InvalidChecksum`] when a source checkpoint
    /// fails validation and the sync is configured to fail on it.
    pub fn accept_from_source(&self, message: &Message) -> Result<(), BookkeepingError> {
        if self.rejects_late(message, MessageOrigin::Source) {
            return Ok(());
        }
        match message {
            Message::Record { record } => self.coordinator.update_stats(record),
            Message::State { state } => self.coordinator.update_source_states_stats(state)?,
            Message::Trace { trace } => self.handle_trace(trace, MessageOrigin::Source),
            Message::Control { control } => {
                tracing::debug!(control_type = %control.control_type, "Ignoring source control message");
            }
        }
        Ok(())
    }

    /// Account for a message read from the destination.
    ///
    /// Acknowledged checkpoints are persisted before they are validated, so
    /// a failed validation never loses a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`BookkeepingError::Persistence`] when the checkpoint cannot
    /// be stored, or [`BookkeepingError::InvalidChecksum`] when it fails
    /// validation and the sync is configured to fail on it.
    pub fn accept_from_destination(&self, message: &Message) -> Result<(), BookkeepingError> {
        if self.rejects_late(message, MessageOrigin::Destination) {
            return Ok(());
        }
        match message {
            Message::Record { record } => {
                if self.mode.destination_self_reports() {
                    self.coordinator.update_stats_from_destination(record);
                }
            }
            Message::State { state } => self.accept_destination_state(state)?,
            Message::Trace { trace } => self.handle_trace(trace, MessageOrigin::Destination),
            Message::Control { control } => {
                tracing::debug!(control_type = %control.control_type, "Ignoring destination control message");
            }
        }
        Ok(())
    }

    /// Account for a source record dropped before reaching the destination.
    pub fn accept_filtered_out_from_source(&self, record: &RecordMessage) {
        if self.finished.load(Ordering::Acquire) {
            tracing::warn!(stream = %record.stream_key(), "Filtered record after end of replication; ignoring");
            return;
        }
        self.coordinator.update_filtered_out_records_stats(record);
    }

    fn accept_destination_state(&self, state: &StateMessage) -> Result<(), BookkeepingError> {
        self.persistence.persist(self.sync.connection_id, state)?;
        self.coordinator.update_destination_state_stats(state)?;
        Ok(())
    }

    fn rejects_late(&self, message: &Message, origin: MessageOrigin) -> bool {
        if !self.finished.load(Ordering::Acquire) {
            return false;
        }
        tracing::warn!(
            origin = %origin,
            kind = message.kind(),
            "Message after end of replication; ignoring"
        );
        true
    }

    fn handle_trace(&self, trace: &TraceMessage, origin: MessageOrigin) {
        match &trace.kind {
            TraceKind::Error { error } => {
                tracing::warn!(origin = %origin, message = %error.message, "Connector reported an error");
                self.errors_of(origin)
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(trace.clone());
            }
            TraceKind::Estimate { estimate } => self.coordinator.update_estimates(estimate),
            TraceKind::Analytics { analytics } => {
                tracing::info!(
                    origin = %origin,
                    analytics_type = %analytics.analytics_type,
                    value = analytics.value.as_deref().unwrap_or_default(),
                    "Connector analytics"
                );
            }
            TraceKind::StreamStatus { stream_status } => {
                tracing::debug!(origin = %origin, status = %stream_status, "Stream status");
            }
        }
    }

    fn errors_of(&self, origin: MessageOrigin) -> &Mutex<Vec<TraceMessage>> {
        match origin {
            MessageOrigin::Destination => &self.destination_errors,
            MessageOrigin::Source | MessageOrigin::Internal => &self.source_errors,
        }
    }

    // -- results -------------------------------------------------------------

    /// Failure reasons of every error trace seen so far, oldest first.
    #[must_use]
    pub fn error_trace_message_failures(&self, job_id: i64, attempt_number: u32) -> Vec<FailureReason> {
        let mut failures: Vec<FailureReason> = [
            (MessageOrigin::Source, FailureOrigin::Source),
            (MessageOrigin::Destination, FailureOrigin::Destination),
        ]
        .into_iter()
        .flat_map(|(origin, failure_origin)| {
            let traces = self
                .errors_of(origin)
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            traces.into_iter().filter_map(move |trace| {
                failure_from_trace(&trace, failure_origin, job_id, attempt_number)
            })
        })
        .collect();
        failures.sort_by_key(|failure| failure.timestamp);
        failures
    }

    #[must_use]
    pub fn total_stats(&self, replication_completed: bool) -> SyncStats {
        self.coordinator.total_stats(replication_completed)
    }

    #[must_use]
    pub fn stream_stats(&self, replication_completed: bool) -> Vec<StreamSyncStats> {
        self.coordinator.stream_stats(replication_completed)
    }

    /// Finalize the attempt: close checksum validation and store the final
    /// statistics.
    ///
    /// Only the first call has side effects; later calls return the stats
    /// without storing them again.
    ///
    /// # Errors
    ///
    /// Returns [`BookkeepingError::Persistence`] when the statistics cannot
    /// be stored.
    pub fn end_of_replication(
        &self,
        completed_successfully: bool,
    ) -> Result<AttemptStats, BookkeepingError> {
        if self.finished.swap(true, Ordering::AcqRel) {
            tracing::warn!("End of replication signalled twice; ignoring");
            return Ok(self.coordinator.attempt_stats(completed_successfully));
        }

        self.coordinator.end_of_replication(completed_successfully);
        let stats = self.coordinator.attempt_stats(completed_successfully);

        let attempt = self.sync.attempt_key();
        self.persistence.save_stats(&attempt, &stats)?;
        self.persistence
            .end_of_replication(&attempt, completed_successfully)?;

        tracing::info!(
            connection_id = %self.sync.connection_id,
            job_id = self.sync.job_id,
            attempt = self.sync.attempt_number,
            completed = completed_successfully,
            records_emitted = stats.total.records_emitted,
            records_committed = stats.total.records_committed,
            streams = stats.streams.len(),
            "Replication finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ReplicationConfig;
    use crate::metrics::TrackerMetric;
    use crate::test_support::{record_of_size, replication_config, tracker_with, Recorders};
    use serde_json::json;
    use syncledger_state::InMemoryStatePersistence;
    use syncledger_types::failure::FailureType;
    use syncledger_types::message::{
        AnalyticsTrace, ControlMessage, ErrorTrace, EstimateTrace, EstimateType, StateStats,
    };
    use syncledger_types::StreamKey;

    fn tracker(config: &ReplicationConfig) -> (MessageTracker, Recorders, Arc<InMemoryStatePersistence>) {
        let recorders = Recorders::default();
        let (tracker, persistence) = tracker_with(config, &recorders);
        (tracker, recorders, persistence)
    }

    fn record(stream: &str) -> Message {
        Message::Record {
            record: record_of_size(stream, 100),
        }
    }

    fn state(stream: &str, cursor: i64) -> StateMessage {
        StateMessage::for_stream(StreamKey::named(stream), json!({"cursor": cursor}))
    }

    fn error_trace(message: &str, emitted_at: f64) -> Message {
        Message::Trace {
            trace: TraceMessage {
                emitted_at,
                kind: TraceKind::Error {
                    error: ErrorTrace {
                        message: message.into(),
                        failure_type: Some("config_error".into()),
                        ..ErrorTrace::default()
                    },
                },
            },
        }
    }

    // ---------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------

    #[test]
    fn test_records_and_checkpoints_flow_to_committed() {
        let (tracker, recorders, persistence) = tracker(&replication_config());
        for _ in 0..5 {
            tracker.accept_from_source(&record("orders")).unwrap();
        }
        let checkpoint = state("orders", 1);
        tracker
            .accept_from_source(&Message::State {
                state: checkpoint.clone().with_source_stats(StateStats::with_record_count(5.0)),
            })
            .unwrap();
        tracker
            .accept_from_destination(&Message::State {
                state: checkpoint
                    .clone()
                    .with_destination_stats(StateStats::with_record_count(5.0)),
            })
            .unwrap();

        let total = tracker.total_stats(false);
        assert_eq!(total.records_emitted, 5);
        assert_eq!(total.bytes_emitted, 500);
        assert_eq!(total.records_committed, 5);
        assert_eq!(total.bytes_committed, 500);
        assert_eq!(total.source_state_messages_emitted, 1);
        assert_eq!(total.destination_state_messages_emitted, 1);

        let stored = persistence.latest_states(tracker.sync().connection_id).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].destination_stats.is_some());
        assert!(recorders.sink.reports().is_empty());
    }

    #[test]
    fn test_destination_records_ignored_unless_self_reporting() {
        let (tracker, _recorders, _persistence) = tracker(&replication_config());
        tracker.accept_from_destination(&record("orders")).unwrap();
        assert_eq!(tracker.total_stats(false).records_emitted, 0);
        assert!(tracker.stream_stats(false).is_empty());
    }

    #[test]
    fn test_fatal_checksum_still_persists_checkpoint() {
        let mut config = replication_config();
        config.feature_flags.fail_sync_on_invalid_checksum = true;
        let (tracker, recorders, persistence) = tracker(&config);

        tracker.accept_from_source(&record("orders")).unwrap();
        let checkpoint = state("orders", 1);
        tracker
            .accept_from_source(&Message::State {
                state: checkpoint.clone(),
            })
            .unwrap();
        let err = tracker
            .accept_from_destination(&Message::State {
                state: checkpoint.with_destination_stats(StateStats::with_record_count(3.0)),
            })
            .unwrap_err();

        assert!(matches!(err, BookkeepingError::InvalidChecksum(_)));
        assert_eq!(err.failure_origin(), FailureOrigin::Destination);
        assert_eq!(
            persistence
                .latest_states(tracker.sync().connection_id)
                .unwrap()
                .len(),
            1
        );
        assert!(recorders.sink.reports().is_empty());
        assert_eq!(recorders.metrics.count_of(TrackerMetric::ChecksumCountError), 0);
        assert_eq!(tracker.total_stats(false).records_committed, 1);
    }

    #[test]
    fn test_estimates_control_and_analytics_are_absorbed() {
        let (tracker, _recorders, _persistence) = tracker(&replication_config());
        tracker
            .accept_from_source(&Message::Trace {
                trace: TraceMessage {
                    emitted_at: 1.0,
                    kind: TraceKind::Estimate {
                        estimate: EstimateTrace {
                            estimate_type: EstimateType::Stream,
                            name: "orders".into(),
                            namespace: None,
                            row_estimate: Some(100),
                            byte_estimate: Some(1_000),
                        },
                    },
                },
            })
            .unwrap();
        tracker
            .accept_from_source(&Message::Trace {
                trace: TraceMessage {
                    emitted_at: 2.0,
                    kind: TraceKind::Analytics {
                        analytics: AnalyticsTrace {
                            analytics_type: "cdc_lag".into(),
                            value: Some("3".into()),
                        },
                    },
                },
            })
            .unwrap();
        tracker
            .accept_from_destination(&Message::Control {
                control: ControlMessage {
                    control_type: "CONNECTOR_CONFIG".into(),
                    emitted_at: 3.0,
                    additional_properties: serde_json::Map::new(),
                },
            })
            .unwrap();

        let total = tracker.total_stats(false);
        assert_eq!(total.estimated_records, Some(100));
        assert_eq!(total.estimated_bytes, Some(1_000));
        assert!(tracker.error_trace_message_failures(42, 1).is_empty());
    }

    // ---------------------------------------------------------------------
    // Error traces
    // ---------------------------------------------------------------------

    #[test]
    fn test_error_traces_sorted_by_emission_across_origins() {
        let (tracker, _recorders, _persistence) = tracker(&replication_config());
        tracker
            .accept_from_destination(&error_trace("dest late", 300.0))
            .unwrap();
        tracker
            .accept_from_source(&error_trace("source middle", 200.0))
            .unwrap();
        tracker
            .accept_from_destination(&error_trace("dest first", 100.0))
            .unwrap();

        let failures = tracker.error_trace_message_failures(42, 1);
        let order: Vec<_> = failures
            .iter()
            .map(|f| (f.failure_origin, f.external_message.clone().unwrap()))
            .collect();
        assert_eq!(
            order,
            vec![
                (FailureOrigin::Destination, "dest first".to_string()),
                (FailureOrigin::Source, "source middle".to_string()),
                (FailureOrigin::Destination, "dest late".to_string()),
            ]
        );
        assert!(failures.iter().all(|f| f.failure_type == FailureType::ConfigError));
        assert_eq!(failures[1].metadata["connector_command"], json!("read"));
        assert_eq!(failures[0].metadata["connector_command"], json!("write"));
    }

    // ---------------------------------------------------------------------
    // End of replication
    // ---------------------------------------------------------------------

    #[test]
    fn test_end_of_replication_stores_stats_once() {
        let (tracker, recorders, persistence) = tracker(&replication_config());
        tracker.accept_from_source(&record("orders")).unwrap();

        let stats = tracker.end_of_replication(true).unwrap();
        assert_eq!(stats.total.records_emitted, 1);
        assert_eq!(stats.total.records_committed, 1);
        assert_eq!(stats.streams.len(), 1);

        let stored = persistence
            .attempt_stats(&tracker.sync().attempt_key())
            .unwrap()
            .unwrap();
        assert_eq!(stored.stats, stats);
        assert_eq!(stored.completed_successfully, Some(true));
        assert_eq!(recorders.publisher.closes(), 1);

        let again = tracker.end_of_replication(true).unwrap();
        assert_eq!(again, stats);
        assert_eq!(recorders.publisher.closes(), 1);
    }

    #[test]
    fn test_messages_after_end_are_ignored() {
        let (tracker, _recorders, _persistence) = tracker(&replication_config());
        tracker.end_of_replication(false).unwrap();

        tracker.accept_from_source(&record("orders")).unwrap();
        tracker.accept_filtered_out_from_source(&record_of_size("orders", 10));
        tracker
            .accept_from_destination(&error_trace("late", 1.0))
            .unwrap();

        assert_eq!(tracker.total_stats(false).records_emitted, 0);
        assert!(tracker.error_trace_message_failures(42, 1).is_empty());
    }

    #[test]
    fn test_filtered_records_are_not_committed() {
        let (tracker, _recorders, _persistence) = tracker(&replication_config());
        tracker.accept_from_source(&record("orders")).unwrap();
        tracker.accept_from_source(&record("orders")).unwrap();
        tracker.accept_filtered_out_from_source(&record_of_size("orders", 100));

        let total = tracker.total_stats(true);
        assert_eq!(total.records_filtered_out, 1);
        assert_eq!(total.records_committed, 1);
    }
}

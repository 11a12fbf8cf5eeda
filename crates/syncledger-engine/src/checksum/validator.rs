//! Three-way reconciliation of checkpoint record counts.
//!
//! Every STREAM or GLOBAL checkpoint is checked twice: once when the source
//! emits it, against the platform's own count of the records preceding it,
//! and once when the destination acknowledges it, against the source's
//! count and the platform's count for that same checkpoint.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use syncledger_types::checksum::{ChecksumCountEvent, ChecksumOutcomeKind, MessageOrigin};
use syncledger_types::message::{StateMessage, StateType};
use syncledger_types::StreamKey;
use uuid::Uuid;

use crate::checkpoint_id::{fingerprint, Fingerprint};
use crate::checksum::publisher::TelemetryEventPublisher;
use crate::checksum::reporter::ChecksumErrorReporter;
use crate::clock::Clock;
use crate::config::types::{DeploymentConfig, PlatformMode, ReplicationConfig, SyncContext};
use crate::errors::{failure_origin, InvalidChecksumError};
use crate::flags::{FeatureFlag, FeatureFlagReader};
use crate::metrics::{MetricAttribute, MetricClient, TrackerMetric};

const MAX_MISSING_EVENTS: u64 = 25;
const MAX_MISMATCH_EVENTS: u64 = 25;
const MAX_SUCCESS_EVENTS: u64 = 3;

/// Inputs of one validation.
pub struct ChecksumCheck<'a> {
    pub checkpoint: &'a StateMessage,
    /// Records the platform counted for this checkpoint.
    pub platform_count: u64,
    /// Side that emitted `checkpoint`.
    pub origin: MessageOrigin,
    pub fail_on_invalid_checksum: bool,
    /// False once any stream's checkpoint ids collided.
    pub validation_enabled: bool,
    /// Name the stream and list per-stream counts in diagnostics.
    pub include_stream_detail: bool,
    /// Records counted by the platform that never reach the destination.
    pub filtered_out: u64,
    /// Per-stream platform counts, only evaluated for diagnostics.
    pub stream_counts: &'a dyn Fn() -> BTreeMap<StreamKey, u64>,
}

/// Classification of one checkpoint and the counts that led to it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChecksumOutcome {
    pub kind: ChecksumOutcomeKind,
    pub counts: Vec<(MessageOrigin, f64)>,
}

impl ChecksumOutcome {
    fn new(kind: ChecksumOutcomeKind, counts: Vec<(MessageOrigin, f64)>) -> Self {
        Self { kind, counts }
    }
}

/// Per-attempt checksum validation state.
pub struct ChecksumValidator {
    sync: SyncContext,
    deployment: DeploymentConfig,
    mode: PlatformMode,
    metrics: Arc<dyn MetricClient>,
    reporter: ChecksumErrorReporter,
    publisher: Option<Arc<dyn TelemetryEventPublisher>>,
    clock: Arc<dyn Clock>,
    emit_events: bool,
    log_state_messages: bool,

    source_seen: AtomicBool,
    destination_seen: AtomicBool,
    checksum_error_observed: AtomicBool,
    error_reported: AtomicBool,
    success_emitted: AtomicBool,
    success_events: AtomicU64,
    missing_events: AtomicU64,
    mismatch_events: AtomicU64,
}

impl ChecksumValidator {
    #[must_use]
    pub fn new(
        config: &ReplicationConfig,
        flags: &dyn FeatureFlagReader,
        metrics: Arc<dyn MetricClient>,
        reporter: ChecksumErrorReporter,
        publisher: Option<Arc<dyn TelemetryEventPublisher>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let context = config.sync.flag_context();
        let emit_events =
            publisher.is_some() && flags.enabled(FeatureFlag::EmitChecksumEvents, &context);
        Self {
            sync: config.sync.clone(),
            deployment: config.deployment.clone(),
            mode: config.platform_mode,
            metrics,
            reporter,
            publisher,
            clock,
            emit_events,
            log_state_messages: flags.enabled(FeatureFlag::LogStateMessages, &context),
            source_seen: AtomicBool::new(false),
            destination_seen: AtomicBool::new(false),
            checksum_error_observed: AtomicBool::new(false),
            error_reported: AtomicBool::new(false),
            success_emitted: AtomicBool::new(false),
            success_events: AtomicU64::new(0),
            missing_events: AtomicU64::new(0),
            mismatch_events: AtomicU64::new(0),
        }
    }

    /// Classify `check` and act on the outcome.
    ///
    /// Returns `Ok(None)` when the checkpoint is not validated at all.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidChecksumError`] for the first MISMATCH or MISSING
    /// outcome when failing on invalid checksums is enabled and validation
    /// is still trusted.
    pub fn validate(
        &self,
        check: &ChecksumCheck<'_>,
    ) -> Result<Option<ChecksumOutcome>, InvalidChecksumError> {
        if self.mode.destination_self_reports()
            || !matches!(
                check.checkpoint.state_type,
                StateType::Stream | StateType::Global
            )
        {
            return Ok(None);
        }

        let outcome = match check.origin {
            MessageOrigin::Source => {
                self.source_seen.store(true, Ordering::Release);
                classify_source(check)
            }
            MessageOrigin::Destination => {
                self.destination_seen.store(true, Ordering::Release);
                Some(classify_destination(check))
            }
            MessageOrigin::Internal => None,
        };
        let Some(outcome) = outcome else {
            return Ok(None);
        };

        let fp = fingerprint(check.checkpoint);
        self.publish_outcome(check, &fp, &outcome);

        if outcome.kind == ChecksumOutcomeKind::Success {
            self.log_success(check);
        } else {
            self.checksum_error_observed.store(true, Ordering::Release);
            self.fail_or_report(check, describe_failure(check, &outcome))?;
        }
        Ok(Some(outcome))
    }

    /// Finish the attempt: acknowledge a clean sync once, then close the
    /// publisher.
    pub fn close(&self, completed_successfully: bool) {
        if completed_successfully
            && !self.checksum_error_observed.load(Ordering::Acquire)
            && self.source_seen.load(Ordering::Acquire)
            && self.destination_seen.load(Ordering::Acquire)
            && !self.success_emitted.swap(true, Ordering::AcqRel)
        {
            tracing::info!("No checksum errors were observed during the sync");
            if self.emit_events {
                let event = self.event(
                    ChecksumOutcomeKind::Success,
                    MessageOrigin::Internal,
                    0.0,
                    None,
                    None,
                    true,
                );
                self.send(vec![event]);
            }
        }
        if let Some(publisher) = &self.publisher {
            publisher.close();
        }
    }

    /// True once any checkpoint failed validation.
    #[must_use]
    pub fn checksum_error_observed(&self) -> bool {
        self.checksum_error_observed.load(Ordering::Acquire)
    }

    // -- consequences --------------------------------------------------------

    fn fail_or_report(
        &self,
        check: &ChecksumCheck<'_>,
        message: String,
    ) -> Result<(), InvalidChecksumError> {
        let payload = serde_json::to_string(check.checkpoint).unwrap_or_default();
        tracing::error!(origin = %check.origin, checkpoint = %payload, "{message}");

        if !check.validation_enabled {
            return Ok(());
        }
        if self.error_reported.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if check.fail_on_invalid_checksum {
            return Err(InvalidChecksumError {
                origin: check.origin,
                message,
            });
        }

        self.reporter
            .report_error(check.origin, &message, check.checkpoint);
        let failure_origin = failure_origin(check.origin);
        self.metrics.count(
            TrackerMetric::ChecksumCountError,
            1,
            &[
                MetricAttribute::new("attempt_number", self.sync.attempt_number.to_string()),
                MetricAttribute::new("connection_id", self.sync.connection_id.to_string()),
                MetricAttribute::new("destination_image", self.sync.destination_image.clone()),
                MetricAttribute::new("failure_origin", format!("{failure_origin:?}").to_lowercase()),
                MetricAttribute::new("job_id", self.sync.job_id.to_string()),
                MetricAttribute::new("source_image", self.sync.source_image.clone()),
                MetricAttribute::new("workspace_id", self.sync.workspace_id.to_string()),
            ],
        );
        Ok(())
    }

    fn log_success(&self, check: &ChecksumCheck<'_>) {
        let with_stream = check.include_stream_detail || self.log_state_messages;
        let mut line = format!("{} checkpoint checksum is valid", side(check.origin));
        line.push_str(&stream_suffix(check.checkpoint, with_stream));
        line.push_str(collision_note(check.validation_enabled));
        if self.log_state_messages {
            let payload = serde_json::to_string(check.checkpoint).unwrap_or_default();
            tracing::debug!(checkpoint = %payload, "{line}");
        } else {
            tracing::debug!("{line}");
        }
    }

    // -- telemetry -----------------------------------------------------------

    fn publish_outcome(&self, check: &ChecksumCheck<'_>, fp: &Fingerprint, outcome: &ChecksumOutcome) {
        if !self.emit_events {
            return;
        }
        let (counter, cap) = match outcome.kind {
            ChecksumOutcomeKind::Success => (&self.success_events, MAX_SUCCESS_EVENTS),
            ChecksumOutcomeKind::Missing => (&self.missing_events, MAX_MISSING_EVENTS),
            ChecksumOutcomeKind::Mismatch => (&self.mismatch_events, MAX_MISMATCH_EVENTS),
        };
        let events: Vec<_> = outcome
            .counts
            .iter()
            .map(|(origin, count)| {
                self.event(
                    outcome.kind,
                    *origin,
                    *count,
                    Some(check.checkpoint),
                    Some(fp),
                    check.validation_enabled,
                )
            })
            .collect();

        let previous = counter.fetch_add(events.len() as u64, Ordering::AcqRel);
        if previous <= cap {
            self.send(events);
        }
    }

    fn send(&self, events: Vec<ChecksumCountEvent>) {
        if let Some(publisher) = &self.publisher {
            if let Err(e) = publisher.publish(events) {
                tracing::warn!(error = %e, "Failed to publish checksum events");
            }
        }
    }

    fn event(
        &self,
        outcome: ChecksumOutcomeKind,
        origin: MessageOrigin,
        record_count: f64,
        checkpoint: Option<&StateMessage>,
        fp: Option<&Fingerprint>,
        valid_data: bool,
    ) -> ChecksumCountEvent {
        let stream = checkpoint
            .filter(|c| c.state_type == StateType::Stream)
            .and_then(StateMessage::stream_key);
        ChecksumCountEvent {
            deployment_version: self.deployment.version.clone(),
            deployment_id: self.deployment.id.clone(),
            deployment_mode: self.deployment.mode.clone(),
            attempt_number: self.sync.attempt_number,
            connection_id: self.sync.connection_id,
            event_id: Uuid::new_v4(),
            job_id: self.sync.job_id,
            outcome,
            record_count: count_to_u64(record_count),
            state_hash: fp.map(|f| f.hash.clone()).unwrap_or_default(),
            state_id: fp.map_or(0, |f| f.id.as_u64()),
            state_origin: origin,
            state_type: checkpoint.map(|c| c.state_type),
            stream_name: stream.map(|s| s.name.clone()),
            stream_namespace: stream.and_then(|s| s.namespace.clone()),
            timestamp: self.clock.now_millis() * 1000,
            valid_data,
        }
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

fn classify_source(check: &ChecksumCheck<'_>) -> Option<ChecksumOutcome> {
    let reported = check.checkpoint.source_stats.as_ref()?.record_count?;
    let platform = check.platform_count as f64;
    let kind = if reported == platform {
        ChecksumOutcomeKind::Success
    } else {
        ChecksumOutcomeKind::Mismatch
    };
    Some(ChecksumOutcome::new(
        kind,
        vec![
            (MessageOrigin::Source, reported),
            (MessageOrigin::Internal, platform),
        ],
    ))
}

fn classify_destination(check: &ChecksumCheck<'_>) -> ChecksumOutcome {
    let platform = check.platform_count as f64;
    let filtered = check.filtered_out as f64;
    let source = check
        .checkpoint
        .source_stats
        .as_ref()
        .and_then(|s| s.record_count);
    let destination = check.checkpoint.destination_stats.as_ref().and_then(|s| {
        s.record_count
            .map(|count| count + s.rejected_record_count.unwrap_or(0.0))
    });

    match (destination, source) {
        (Some(destination), Some(source)) => {
            let agree = source - filtered == destination && platform - filtered == destination;
            ChecksumOutcome::new(
                if agree {
                    ChecksumOutcomeKind::Success
                } else {
                    ChecksumOutcomeKind::Mismatch
                },
                vec![
                    (MessageOrigin::Source, source),
                    (MessageOrigin::Internal, platform),
                    (MessageOrigin::Destination, destination),
                ],
            )
        }
        (Some(destination), None) => ChecksumOutcome::new(
            if platform - filtered == destination {
                ChecksumOutcomeKind::Success
            } else {
                ChecksumOutcomeKind::Mismatch
            },
            vec![
                (MessageOrigin::Internal, platform),
                (MessageOrigin::Destination, destination),
            ],
        ),
        (None, Some(source)) => ChecksumOutcome::new(
            ChecksumOutcomeKind::Missing,
            vec![
                (MessageOrigin::Source, source),
                (MessageOrigin::Internal, platform),
            ],
        ),
        (None, None) => ChecksumOutcome::new(
            ChecksumOutcomeKind::Missing,
            vec![(MessageOrigin::Internal, platform)],
        ),
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

fn describe_failure(check: &ChecksumCheck<'_>, outcome: &ChecksumOutcome) -> String {
    let count_of = |origin: MessageOrigin| {
        outcome
            .counts
            .iter()
            .find(|(o, _)| *o == origin)
            .map(|(_, c)| *c)
    };
    let platform = count_of(MessageOrigin::Internal).unwrap_or_default();

    let mut message = format!("{} checkpoint checksum is invalid: ", side(check.origin));
    match (
        outcome.kind,
        count_of(MessageOrigin::Source),
        count_of(MessageOrigin::Destination),
    ) {
        (ChecksumOutcomeKind::Missing, Some(source), _) => {
            let _ = write!(
                message,
                "destination reported no record count while source reported {source} and platform tracked {platform}"
            );
        }
        (ChecksumOutcomeKind::Missing, None, _) => {
            let _ = write!(
                message,
                "neither source nor destination reported a record count, platform tracked {platform}"
            );
        }
        (_, Some(source), Some(destination)) => {
            let _ = write!(
                message,
                "source record count {source}, destination record count {destination} and platform record count {platform} are not equal"
            );
        }
        (_, reported_by_source, reported_by_destination) => {
            let reported = reported_by_source
                .or(reported_by_destination)
                .unwrap_or_default();
            let _ = write!(
                message,
                "checkpoint record count {reported} does not equal platform tracked record count {platform}"
            );
        }
    }
    if check.filtered_out > 0 {
        let _ = write!(message, " ({} records filtered out)", check.filtered_out);
    }
    message.push_str(&stream_suffix(check.checkpoint, check.include_stream_detail));
    message.push_str(collision_note(check.validation_enabled));

    if check.include_stream_detail {
        let counts = (check.stream_counts)();
        if !counts.is_empty() {
            message.push_str(" Observed the following record counts per stream:");
            for (stream, count) in counts {
                let _ = write!(message, "\n {stream}: {count}");
            }
        }
    }
    message
}

fn side(origin: MessageOrigin) -> &'static str {
    match origin {
        MessageOrigin::Source => "Source",
        MessageOrigin::Destination => "Destination",
        MessageOrigin::Internal => "Platform",
    }
}

fn stream_suffix(checkpoint: &StateMessage, with_stream: bool) -> String {
    match checkpoint.stream_key() {
        Some(stream) if with_stream => format!(" for stream {stream}."),
        _ => ".".to_string(),
    }
}

fn collision_note(validation_enabled: bool) -> &'static str {
    if validation_enabled {
        " No checkpoint id collisions were observed."
    } else {
        " Checkpoint id collisions were observed so the comparison may be wrong."
    }
}

fn count_to_u64(count: f64) -> u64 {
    if count.is_finite() && count > 0.0 {
        count as u64
    } else {
        0
    }
}

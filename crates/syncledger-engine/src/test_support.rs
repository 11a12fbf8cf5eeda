//! Recording collaborators and fixtures shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use serde_json::Value;
use syncledger_state::InMemoryStatePersistence;
use syncledger_types::checksum::ChecksumCountEvent;
use syncledger_types::message::RecordMessage;
use uuid::Uuid;

use crate::bookkeeping::SyncStatsCoordinator;
use crate::checksum::reporter::{
    ChecksumErrorReport, ChecksumErrorReporter, ConnectorMetadata, ConnectorMetadataClient,
    ErrorReportSink, StaticMetadataClient,
};
use crate::checksum::{ChecksumValidator, TelemetryEventPublisher};
use crate::clock::ManualClock;
use crate::config::types::{ReplicationConfig, SyncContext};
use crate::config::parser::parse_config_str;
use crate::flags::StaticFeatureFlags;
use crate::metrics::{MetricAttribute, MetricClient, TrackerMetric};
use crate::tracker::MessageTracker;

pub(crate) const REPLICATION_YAML: &str = r#"
version: "1.0"
sync:
  connection_id: 6f1c1b8e-5d0a-4c3e-9a5b-2f7d8e9a0b1c
  workspace_id: 0b6f3a52-1c2d-4e5f-8a9b-0c1d2e3f4a5b
  job_id: 42
  attempt_number: 1
  source_id: 11111111-2222-3333-4444-555555555555
  destination_id: 66666666-7777-8888-9999-000000000000
  source_image: airbyte/source-postgres:3.6.0
  destination_image: airbyte/destination-snowflake:3.11.0
deployment:
  id: test-deployment
  version: "1.0.0"
reporter:
  max_retries: 0
  backoff_ms: 0
"#;

pub(crate) fn replication_config() -> ReplicationConfig {
    parse_config_str(REPLICATION_YAML).unwrap()
}

pub(crate) fn sync_context() -> SyncContext {
    replication_config().sync
}

/// Record whose `data` serializes to exactly `bytes` bytes (minimum 2).
pub(crate) fn record_of_size(stream: &str, bytes: usize) -> RecordMessage {
    let payload = Value::String("x".repeat(bytes.saturating_sub(2)));
    RecordMessage::new(stream, None, payload)
}

// ---------------------------------------------------------------------------
// Recorders
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct RecordingMetrics {
    calls: Mutex<Vec<(TrackerMetric, u64, Vec<MetricAttribute>)>>,
}

impl RecordingMetrics {
    pub(crate) fn count_of(&self, metric: TrackerMetric) -> u64 {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _, _)| *m == metric)
            .map(|(_, value, _)| value)
            .sum()
    }

    pub(crate) fn attributes_of(&self, metric: TrackerMetric) -> Vec<MetricAttribute> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|(m, _, _)| *m == metric)
            .map(|(_, _, attributes)| attributes.clone())
            .unwrap_or_default()
    }
}

impl MetricClient for RecordingMetrics {
    fn count(&self, metric: TrackerMetric, value: u64, attributes: &[MetricAttribute]) {
        self.calls
            .lock()
            .unwrap()
            .push((metric, value, attributes.to_vec()));
    }
}

/// Sink that fails its first `fail_first` deliveries.
#[derive(Default)]
pub(crate) struct RecordingSink {
    reports: Mutex<Vec<ChecksumErrorReport>>,
    attempts: AtomicUsize,
    fail_first: usize,
}

impl RecordingSink {
    pub(crate) fn failing(fail_first: usize) -> Self {
        Self {
            fail_first,
            ..Self::default()
        }
    }

    pub(crate) fn reports(&self) -> Vec<ChecksumErrorReport> {
        self.reports.lock().unwrap().clone()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl ErrorReportSink for RecordingSink {
    fn report(&self, report: &ChecksumErrorReport) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(anyhow!("sink unavailable"));
        }
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

pub(crate) struct FailingMetadataClient;

impl ConnectorMetadataClient for FailingMetadataClient {
    fn source_metadata(&self, _source_id: Uuid) -> anyhow::Result<ConnectorMetadata> {
        Err(anyhow!("metadata service unavailable"))
    }

    fn destination_metadata(&self, _destination_id: Uuid) -> anyhow::Result<ConnectorMetadata> {
        Err(anyhow!("metadata service unavailable"))
    }
}

#[derive(Default)]
pub(crate) struct RecordingPublisher {
    events: Mutex<Vec<ChecksumCountEvent>>,
    closes: AtomicUsize,
}

impl RecordingPublisher {
    pub(crate) fn events(&self) -> Vec<ChecksumCountEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl TelemetryEventPublisher for RecordingPublisher {
    fn publish(&self, events: Vec<ChecksumCountEvent>) -> anyhow::Result<()> {
        self.events.lock().unwrap().extend(events);
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Every recording collaborator of one attempt.
pub(crate) struct Recorders {
    pub(crate) sink: Arc<RecordingSink>,
    pub(crate) metrics: Arc<RecordingMetrics>,
    pub(crate) publisher: Arc<RecordingPublisher>,
    pub(crate) clock: Arc<ManualClock>,
}

impl Default for Recorders {
    fn default() -> Self {
        Self {
            sink: Arc::new(RecordingSink::default()),
            metrics: Arc::new(RecordingMetrics::default()),
            publisher: Arc::new(RecordingPublisher::default()),
            clock: Arc::new(ManualClock::new(1_700_000_000_000)),
        }
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub(crate) fn validator_with(config: &ReplicationConfig, recorders: &Recorders) -> ChecksumValidator {
    let reporter = ChecksumErrorReporter::new(
        config.sync.clone(),
        config.deployment.version.clone(),
        config.reporter,
        Arc::new(StaticMetadataClient::from_context(&config.sync)),
        recorders.sink.clone(),
        recorders.clock.clone(),
    );
    ChecksumValidator::new(
        config,
        &StaticFeatureFlags::new(config.feature_flags),
        recorders.metrics.clone(),
        reporter,
        Some(recorders.publisher.clone() as Arc<dyn TelemetryEventPublisher>),
        recorders.clock.clone(),
    )
}

pub(crate) fn coordinator_with(
    config: &ReplicationConfig,
    recorders: &Recorders,
) -> SyncStatsCoordinator {
    SyncStatsCoordinator::new(
        config.platform_mode,
        validator_with(config, recorders),
        Arc::new(StaticFeatureFlags::new(config.feature_flags)),
        config.sync.flag_context(),
        recorders.metrics.clone(),
        recorders.clock.clone(),
    )
}

pub(crate) fn tracker_with(
    config: &ReplicationConfig,
    recorders: &Recorders,
) -> (MessageTracker, Arc<InMemoryStatePersistence>) {
    let persistence = Arc::new(InMemoryStatePersistence::new());
    let tracker = MessageTracker::new(
        config.sync.clone(),
        config.platform_mode,
        coordinator_with(config, recorders),
        persistence.clone(),
    );
    (tracker, persistence)
}

//! Wiring of a [`MessageTracker`] from a replication config.

use std::sync::Arc;

use syncledger_state::{InMemoryStatePersistence, SqliteStatePersistence, StateError, StatePersistence};

use crate::bookkeeping::SyncStatsCoordinator;
use crate::checksum::{
    ChecksumErrorReporter, ChecksumValidator, ConnectorMetadataClient, ErrorReportSink,
    StaticMetadataClient, TelemetryEventPublisher, TracingReportSink,
};
use crate::clock::{Clock, SystemClock};
use crate::config::types::{ReplicationConfig, StateBackendKind};
use crate::flags::{FeatureFlagReader, StaticFeatureFlags};
use crate::metrics::{FacadeMetricClient, MetricClient};
use crate::tracker::MessageTracker;

/// Builds a [`MessageTracker`], defaulting every collaborator that is not
/// supplied.
///
/// Defaults: flags from the config, the `metrics` facade, connector
/// metadata parsed from the configured images, a log-only report sink, no
/// telemetry publisher, the system clock, and the state backend named in
/// the config.
pub struct MessageTrackerBuilder {
    config: ReplicationConfig,
    flags: Option<Arc<dyn FeatureFlagReader>>,
    metrics: Option<Arc<dyn MetricClient>>,
    metadata: Option<Arc<dyn ConnectorMetadataClient>>,
    sink: Option<Arc<dyn ErrorReportSink>>,
    publisher: Option<Arc<dyn TelemetryEventPublisher>>,
    persistence: Option<Arc<dyn StatePersistence>>,
    clock: Option<Arc<dyn Clock>>,
}

impl MessageTrackerBuilder {
    #[must_use]
    pub fn new(config: ReplicationConfig) -> Self {
        Self {
            config,
            flags: None,
            metrics: None,
            metadata: None,
            sink: None,
            publisher: None,
            persistence: None,
            clock: None,
        }
    }

    #[must_use]
    pub fn flags(mut self, flags: Arc<dyn FeatureFlagReader>) -> Self {
        self.flags = Some(flags);
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricClient>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: Arc<dyn ConnectorMetadataClient>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn ErrorReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn publisher(mut self, publisher: Arc<dyn TelemetryEventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    #[must_use]
    pub fn persistence(mut self, persistence: Arc<dyn StatePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Assemble the tracker.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the configured state backend cannot be
    /// opened.
    pub fn build(self) -> Result<MessageTracker, StateError> {
        let config = self.config;
        let persistence = match self.persistence {
            Some(persistence) => persistence,
            None => open_backend(&config)?,
        };
        let flags = self
            .flags
            .unwrap_or_else(|| Arc::new(StaticFeatureFlags::new(config.feature_flags)));
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(FacadeMetricClient));
        let metadata = self
            .metadata
            .unwrap_or_else(|| Arc::new(StaticMetadataClient::from_context(&config.sync)));
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingReportSink));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let reporter = ChecksumErrorReporter::new(
            config.sync.clone(),
            config.deployment.version.clone(),
            config.reporter,
            metadata,
            sink,
            clock.clone(),
        );
        let validator = ChecksumValidator::new(
            &config,
            flags.as_ref(),
            metrics.clone(),
            reporter,
            self.publisher,
            clock.clone(),
        );
        let coordinator = SyncStatsCoordinator::new(
            config.platform_mode,
            validator,
            flags,
            config.sync.flag_context(),
            metrics,
            clock,
        );

        tracing::info!(
            connection_id = %config.sync.connection_id,
            job_id = config.sync.job_id,
            attempt = config.sync.attempt_number,
            mode = ?config.platform_mode,
            "Message tracker ready"
        );
        Ok(MessageTracker::new(
            config.sync,
            config.platform_mode,
            coordinator,
            persistence,
        ))
    }
}

fn open_backend(config: &ReplicationConfig) -> Result<Arc<dyn StatePersistence>, StateError> {
    match config.state.backend {
        StateBackendKind::Memory => Ok(Arc::new(InMemoryStatePersistence::new())),
        StateBackendKind::Sqlite => {
            let path = config.state.path.as_deref().ok_or_else(|| {
                StateError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "sqlite state backend requires state.path",
                ))
            })?;
            tracing::debug!(path = %path.display(), "Opening sqlite state backend");
            Ok(Arc::new(SqliteStatePersistence::open(path)?))
        }
    }
}

//! At-most-once, best-effort reporting of checksum failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use serde::Serialize;
use syncledger_types::checksum::MessageOrigin;
use syncledger_types::failure::FailureReason;
use syncledger_types::message::StateMessage;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::types::{parse_image, ReporterConfig, SyncContext};
use crate::failure::checksum_failure;

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Connector definition and image of a source or destination actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectorMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition_id: Option<Uuid>,
    pub docker_repository: String,
    pub docker_image_tag: String,
}

/// Resolves connector metadata for error enrichment.
pub trait ConnectorMetadataClient: Send + Sync {
    fn source_metadata(&self, source_id: Uuid) -> anyhow::Result<ConnectorMetadata>;

    fn destination_metadata(&self, destination_id: Uuid) -> anyhow::Result<ConnectorMetadata>;
}

/// Serves metadata parsed from the configured connector images.
#[derive(Debug, Clone)]
pub struct StaticMetadataClient {
    source_image: String,
    destination_image: String,
}

impl StaticMetadataClient {
    #[must_use]
    pub fn from_context(sync: &SyncContext) -> Self {
        Self {
            source_image: sync.source_image.clone(),
            destination_image: sync.destination_image.clone(),
        }
    }

    fn metadata(image: &str) -> anyhow::Result<ConnectorMetadata> {
        let parsed = parse_image(image)
            .ok_or_else(|| anyhow!("connector image '{image}' is not repository:tag"))?;
        Ok(ConnectorMetadata {
            definition_id: None,
            docker_repository: parsed.repository.to_string(),
            docker_image_tag: parsed.tag.to_string(),
        })
    }
}

impl ConnectorMetadataClient for StaticMetadataClient {
    fn source_metadata(&self, _source_id: Uuid) -> anyhow::Result<ConnectorMetadata> {
        Self::metadata(&self.source_image)
    }

    fn destination_metadata(&self, _destination_id: Uuid) -> anyhow::Result<ConnectorMetadata> {
        Self::metadata(&self.destination_image)
    }
}

/// Everything an external error tracker receives about one checksum failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChecksumErrorReport {
    pub workspace_id: Uuid,
    pub connection_id: Uuid,
    pub job_id: i64,
    pub attempt_number: u32,
    pub deployment_version: String,
    pub failure: FailureReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector: Option<ConnectorMetadata>,
    pub state: StateMessage,
}

/// External error tracker.
pub trait ErrorReportSink: Send + Sync {
    fn report(&self, report: &ChecksumErrorReport) -> anyhow::Result<()>;
}

/// Writes reports to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReportSink;

impl ErrorReportSink for TracingReportSink {
    fn report(&self, report: &ChecksumErrorReport) -> anyhow::Result<()> {
        let payload = serde_json::to_string(report)?;
        tracing::error!(
            connection_id = %report.connection_id,
            job_id = report.job_id,
            attempt = report.attempt_number,
            origin = ?report.failure.failure_origin,
            report = %payload,
            "Checksum failure report"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

/// Sends at most one checksum failure report per sync attempt.
///
/// Lookup and delivery are retried with a fixed backoff; whatever still
/// fails is logged and dropped.
pub struct ChecksumErrorReporter {
    sync: SyncContext,
    deployment_version: String,
    config: ReporterConfig,
    metadata: Arc<dyn ConnectorMetadataClient>,
    sink: Arc<dyn ErrorReportSink>,
    clock: Arc<dyn Clock>,
    reported: AtomicBool,
}

impl ChecksumErrorReporter {
    #[must_use]
    pub fn new(
        sync: SyncContext,
        deployment_version: String,
        config: ReporterConfig,
        metadata: Arc<dyn ConnectorMetadataClient>,
        sink: Arc<dyn ErrorReportSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sync,
            deployment_version,
            config,
            metadata,
            sink,
            clock,
            reported: AtomicBool::new(false),
        }
    }

    /// Report a checksum failure. Only the first call does anything.
    pub fn report_error(&self, origin: MessageOrigin, internal_message: &str, state: &StateMessage) {
        if self.reported.swap(true, Ordering::AcqRel) {
            tracing::debug!(origin = %origin, "Checksum failure already reported for this attempt");
            return;
        }

        let connector = match self.lookup_metadata(origin) {
            Ok(connector) => connector,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    origin = %origin,
                    "Connector metadata lookup failed; reporting without it"
                );
                None
            }
        };

        let stacktrace = std::backtrace::Backtrace::force_capture().to_string();
        let report = ChecksumErrorReport {
            workspace_id: self.sync.workspace_id,
            connection_id: self.sync.connection_id,
            job_id: self.sync.job_id,
            attempt_number: self.sync.attempt_number,
            deployment_version: self.deployment_version.clone(),
            failure: checksum_failure(
                origin,
                internal_message,
                &stacktrace,
                self.sync.job_id,
                self.sync.attempt_number,
                self.clock.now_millis(),
            ),
            connector,
            state: state.clone(),
        };

        if let Err(e) = self.with_retry("report", || self.sink.report(&report)) {
            tracing::warn!(error = %e, origin = %origin, "Failed to report checksum failure");
        }
    }

    fn lookup_metadata(&self, origin: MessageOrigin) -> anyhow::Result<Option<ConnectorMetadata>> {
        match origin {
            MessageOrigin::Source => self
                .with_retry("source metadata", || {
                    self.metadata.source_metadata(self.sync.source_id)
                })
                .map(Some),
            MessageOrigin::Destination => self
                .with_retry("destination metadata", || {
                    self.metadata.destination_metadata(self.sync.destination_id)
                })
                .map(Some),
            MessageOrigin::Internal => Ok(None),
        }
    }

    fn with_retry<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut retries = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if retries < self.config.max_retries => {
                    retries += 1;
                    tracing::debug!(error = %e, what, retry = retries, "Retrying");
                    std::thread::sleep(self.config.backoff());
                }
                Err(e) => return Err(e),
            }
        }
    }
}

//! Replication config model.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use syncledger_types::stats::AttemptKey;
use uuid::Uuid;

use crate::flags::FlagContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub version: String,
    pub sync: SyncContext,
    #[serde(default)]
    pub platform_mode: PlatformMode,
    #[serde(default)]
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub feature_flags: FeatureFlagsConfig,
    #[serde(default)]
    pub reporter: ReporterConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub state: StateConfig,
}

// ---------------------------------------------------------------------------
// Sync identity
// ---------------------------------------------------------------------------

/// Identity of the sync attempt being tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncContext {
    pub connection_id: Uuid,
    pub workspace_id: Uuid,
    pub job_id: i64,
    #[serde(default)]
    pub attempt_number: u32,
    pub source_id: Uuid,
    pub destination_id: Uuid,
    pub source_image: String,
    pub destination_image: String,
}

impl SyncContext {
    #[must_use]
    pub fn attempt_key(&self) -> AttemptKey {
        AttemptKey {
            connection_id: self.connection_id,
            job_id: self.job_id,
            attempt_number: self.attempt_number,
        }
    }

    #[must_use]
    pub fn flag_context(&self) -> FlagContext {
        FlagContext {
            connection_id: self.connection_id,
            workspace_id: self.workspace_id,
        }
    }
}

/// A `repository:tag` connector image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef<'a> {
    pub repository: &'a str,
    pub tag: &'a str,
}

/// Split `repository:tag`. The tag is what follows the last `:`, so registry
/// ports (`host:5000/repo:tag`) are kept in the repository.
#[must_use]
pub fn parse_image(image: &str) -> Option<ImageRef<'_>> {
    let (repository, tag) = image.trim().rsplit_once(':')?;
    if repository.is_empty() || tag.is_empty() || tag.contains('/') {
        return None;
    }
    Some(ImageRef { repository, tag })
}

// ---------------------------------------------------------------------------
// Modes and deployment
// ---------------------------------------------------------------------------

/// Who counts the records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformMode {
    /// The platform counts records and reconciles checkpoint counts.
    #[default]
    Orchestrator,
    /// The destination self-reports its counts; reconciliation is skipped.
    Bookkeeper,
}

impl PlatformMode {
    #[must_use]
    pub fn destination_self_reports(self) -> bool {
        self == Self::Bookkeeper
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_deployment_version")]
    pub version: String,
    #[serde(default = "default_deployment_mode")]
    pub mode: String,
}

fn default_deployment_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_deployment_mode() -> String {
    "oss".to_string()
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            version: default_deployment_version(),
            mode: default_deployment_mode(),
        }
    }
}

// ---------------------------------------------------------------------------
// Feature flags
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlagsConfig {
    #[serde(default)]
    pub fail_sync_on_invalid_checksum: bool,
    #[serde(default = "default_true")]
    pub emit_checksum_events: bool,
    #[serde(default)]
    pub log_state_messages: bool,
    #[serde(default)]
    pub log_stream_names_in_state_message: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FeatureFlagsConfig {
    fn default() -> Self {
        Self {
            fail_sync_on_invalid_checksum: false,
            emit_checksum_events: true,
            log_state_messages: false,
            log_stream_names_in_state_message: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Reporter / telemetry / state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReporterConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    10
}

impl ReporterConfig {
    #[must_use]
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackendKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

//! Checkpoint checksum telemetry model.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::StateType;

/// Which party a record count came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageOrigin {
    Source,
    Destination,
    /// Counted by the platform itself.
    Internal,
}

impl MessageOrigin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "SOURCE",
            Self::Destination => "DESTINATION",
            Self::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for MessageOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of reconciling the counts of one checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChecksumOutcomeKind {
    Missing,
    Mismatch,
    Success,
}

impl ChecksumOutcomeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "MISSING",
            Self::Mismatch => "MISMATCH",
            Self::Success => "SUCCESS",
        }
    }
}

/// One telemetry event: a single party's record count for one checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecksumCountEvent {
    pub deployment_version: String,
    pub deployment_id: String,
    pub deployment_mode: String,
    pub attempt_number: u32,
    pub connection_id: Uuid,
    pub event_id: Uuid,
    pub job_id: i64,
    pub outcome: ChecksumOutcomeKind,
    pub record_count: u64,
    /// Hex SHA-256 of the checkpoint content.
    pub state_hash: String,
    /// Tracking id used to match acknowledgments to staged checkpoints.
    pub state_id: u64,
    pub state_origin: MessageOrigin,
    /// Absent for the synthetic end-of-sync success event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_type: Option<StateType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_namespace: Option<String>,
    /// Microseconds since the Unix epoch.
    pub timestamp: i64,
    /// False when hash collisions may have compromised the comparison.
    pub valid_data: bool,
}

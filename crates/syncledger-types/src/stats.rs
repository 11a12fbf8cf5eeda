//! Aggregate sync statistics handed to the persistence layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stream::StreamKey;

/// Record, byte, checkpoint and timing totals for a sync or a single stream.
///
/// `None` estimates mean no connector reported one, which is different from
/// an estimate of zero. Commit-latency timings are `None` when any stream's
/// checkpoint bookkeeping became unreliable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub records_emitted: u64,
    pub bytes_emitted: u64,
    pub records_filtered_out: u64,
    pub bytes_filtered_out: u64,
    pub records_committed: u64,
    pub bytes_committed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_records: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_rejected: Option<u64>,
    pub source_state_messages_emitted: u64,
    pub destination_state_messages_emitted: u64,
    pub max_seconds_before_source_state_message_emitted: u64,
    pub mean_seconds_before_source_state_message_emitted: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_seconds_between_state_message_emitted_and_committed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_seconds_between_state_message_emitted_and_committed: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_stats: BTreeMap<String, f64>,
}

/// [`SyncStats`] for one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSyncStats {
    pub stream: StreamKey,
    #[serde(flatten)]
    pub stats: SyncStats,
}

/// Identity of one sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptKey {
    pub connection_id: Uuid,
    pub job_id: i64,
    pub attempt_number: u32,
}

/// Final statistics of one sync attempt: the total plus the per-stream split.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptStats {
    pub total: SyncStats,
    #[serde(default)]
    pub streams: Vec<StreamSyncStats>,
}

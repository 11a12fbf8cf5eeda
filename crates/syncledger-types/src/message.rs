//! Connector protocol messages as seen by the bookkeeping core.
//!
//! Only the structure the core needs is typed; everything else is kept in
//! `additional_properties` so that a message survives a round trip through
//! persistence untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::stream::StreamKey;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A single message emitted by a source or destination connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Record { record: RecordMessage },
    State { state: StateMessage },
    Trace { trace: TraceMessage },
    Control { control: ControlMessage },
}

impl Message {
    /// Upper-case message kind, as it appears on the wire.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Record { .. } => "RECORD",
            Self::State { .. } => "STATE",
            Self::Trace { .. } => "TRACE",
            Self::Control { .. } => "CONTROL",
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Reference to a file moved out-of-band alongside a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    pub file_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file_relative_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMessage {
    pub stream: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub emitted_at: i64,
    #[serde(default, rename = "file", skip_serializing_if = "Option::is_none")]
    pub file_reference: Option<FileReference>,
    #[serde(flatten)]
    pub additional_properties: Map<String, Value>,
}

impl RecordMessage {
    /// Record for `stream` carrying `data`.
    #[must_use]
    pub fn new(stream: impl Into<String>, namespace: Option<String>, data: Value) -> Self {
        Self {
            stream: stream.into(),
            namespace,
            data,
            emitted_at: 0,
            file_reference: None,
            additional_properties: Map::new(),
        }
    }

    #[must_use]
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(self.stream.clone(), self.namespace.clone())
    }

    /// Bytes attributed to this record.
    ///
    /// File transfers count the referenced file size; everything else counts
    /// the serialized JSON length of `data`.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        if let Some(file) = &self.file_reference {
            return file.file_size_bytes;
        }
        let mut counter = ByteCounter(0);
        match serde_json::to_writer(&mut counter, &self.data) {
            Ok(()) => counter.0,
            Err(_) => 0,
        }
    }

    /// Numeric additional property, as reported by self-counting destinations.
    #[must_use]
    pub fn additional_count(&self, key: &str) -> Option<u64> {
        self.additional_properties.get(key).and_then(as_count)
    }
}

/// `io::Write` sink that only counts bytes.
struct ByteCounter(u64);

impl std::io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0 += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn as_count(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// Checkpoint scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    Stream,
    Global,
    #[default]
    Legacy,
}

impl StateType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "STREAM",
            Self::Global => "GLOBAL",
            Self::Legacy => "LEGACY",
        }
    }
}

/// Record counts a connector attaches to a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateStats {
    #[serde(
        default,
        rename = "recordCount",
        skip_serializing_if = "Option::is_none"
    )]
    pub record_count: Option<f64>,
    #[serde(
        default,
        rename = "rejectedRecordCount",
        skip_serializing_if = "Option::is_none"
    )]
    pub rejected_record_count: Option<f64>,
    #[serde(
        default,
        rename = "additionalStats",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub additional_stats: BTreeMap<String, f64>,
}

impl StateStats {
    #[must_use]
    pub fn with_record_count(count: f64) -> Self {
        Self {
            record_count: Some(count),
            ..Self::default()
        }
    }
}

/// Per-stream portion of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    pub stream_descriptor: StreamKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_state: Option<Value>,
    #[serde(flatten)]
    pub additional_properties: Map<String, Value>,
}

impl StreamState {
    #[must_use]
    pub fn new(stream_descriptor: StreamKey, stream_state: Value) -> Self {
        Self {
            stream_descriptor,
            stream_state: Some(stream_state),
            additional_properties: Map::new(),
        }
    }
}

/// Checkpoint shared by every stream of the sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_state: Option<Value>,
    #[serde(default)]
    pub stream_states: Vec<StreamState>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    #[serde(default, rename = "type")]
    pub state_type: StateType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<GlobalState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(
        default,
        rename = "sourceStats",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_stats: Option<StateStats>,
    #[serde(
        default,
        rename = "destinationStats",
        skip_serializing_if = "Option::is_none"
    )]
    pub destination_stats: Option<StateStats>,
    #[serde(flatten)]
    pub additional_properties: Map<String, Value>,
}

impl StateMessage {
    /// Per-stream checkpoint for `stream`.
    #[must_use]
    pub fn for_stream(stream: StreamKey, state: Value) -> Self {
        Self {
            state_type: StateType::Stream,
            stream: Some(StreamState::new(stream, state)),
            ..Self::default()
        }
    }

    /// Sync-wide checkpoint covering `stream_states`.
    #[must_use]
    pub fn global(shared_state: Value, stream_states: Vec<StreamState>) -> Self {
        Self {
            state_type: StateType::Global,
            global: Some(GlobalState {
                shared_state: Some(shared_state),
                stream_states,
            }),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_source_stats(mut self, stats: StateStats) -> Self {
        self.source_stats = Some(stats);
        self
    }

    #[must_use]
    pub fn with_destination_stats(mut self, stats: StateStats) -> Self {
        self.destination_stats = Some(stats);
        self
    }

    /// Stream covered by a STREAM checkpoint.
    #[must_use]
    pub fn stream_key(&self) -> Option<&StreamKey> {
        self.stream.as_ref().map(|s| &s.stream_descriptor)
    }

    /// Per-stream entries of a GLOBAL checkpoint (empty otherwise).
    #[must_use]
    pub fn global_stream_states(&self) -> &[StreamState] {
        self.global
            .as_ref()
            .map_or(&[], |g| g.stream_states.as_slice())
    }
}

// ---------------------------------------------------------------------------
// Traces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceMessage {
    #[serde(default)]
    pub emitted_at: f64,
    #[serde(flatten)]
    pub kind: TraceKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceKind {
    Error { error: ErrorTrace },
    Estimate { estimate: EstimateTrace },
    Analytics { analytics: AnalyticsTrace },
    StreamStatus { stream_status: Value },
}

/// Failure reported by a connector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorTrace {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    /// Raw failure type (`system_error`, `config_error`, `transient_error`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_descriptor: Option<StreamKey>,
}

/// Scope of a size estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EstimateType {
    Stream,
    Sync,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateTrace {
    #[serde(rename = "type")]
    pub estimate_type: EstimateType,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_estimate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_estimate: Option<u64>,
}

impl EstimateTrace {
    #[must_use]
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(self.name.clone(), self.namespace.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsTrace {
    #[serde(rename = "type")]
    pub analytics_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub control_type: String,
    #[serde(default)]
    pub emitted_at: f64,
    #[serde(flatten)]
    pub additional_properties: Map<String, Value>,
}

//! Conversion of connector error traces and checksum failures into
//! [`FailureReason`]s.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use syncledger_types::checksum::MessageOrigin;
use syncledger_types::failure::{FailureOrigin, FailureReason, FailureType};
use syncledger_types::message::{TraceKind, TraceMessage};

use crate::errors::failure_origin;

pub const MAX_MESSAGE_LENGTH: usize = 50_000;
pub const MAX_STACK_TRACE_LENGTH: usize = 100_000;

/// User-facing text of every checksum failure.
pub const CHECKSUM_EXTERNAL_MESSAGE: &str = "The sync appears to have dropped records";

/// Cut `text` to at most `max_chars` characters, marking the cut.
#[must_use]
pub fn truncate_with_notice(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => {
            let dropped = text[cut..].chars().count();
            format!("{}... [truncated {dropped} characters]", &text[..cut])
        }
    }
}

/// Failure reason for an ERROR trace, or `None` for any other trace kind.
#[must_use]
pub fn failure_from_trace(
    trace: &TraceMessage,
    origin: FailureOrigin,
    job_id: i64,
    attempt_number: u32,
) -> Option<FailureReason> {
    let TraceKind::Error { error } = &trace.kind else {
        return None;
    };

    let connector_command = match origin {
        FailureOrigin::Destination => "write",
        FailureOrigin::Source | FailureOrigin::Platform => "read",
    };
    let mut metadata = BTreeMap::new();
    metadata.insert("job_id".to_string(), json!(job_id));
    metadata.insert("attempt_number".to_string(), json!(attempt_number));
    metadata.insert("from_trace_message".to_string(), Value::Bool(true));
    metadata.insert("connector_command".to_string(), json!(connector_command));

    Some(FailureReason {
        failure_origin: origin,
        failure_type: FailureType::from_wire(error.failure_type.as_deref()),
        internal_message: error
            .internal_message
            .as_deref()
            .map(|m| truncate_with_notice(m, MAX_MESSAGE_LENGTH)),
        external_message: Some(truncate_with_notice(&error.message, MAX_MESSAGE_LENGTH)),
        stacktrace: error
            .stack_trace
            .as_deref()
            .map(|s| truncate_with_notice(s, MAX_STACK_TRACE_LENGTH)),
        timestamp: trace.emitted_at as i64,
        stream_descriptor: error.stream_descriptor.clone(),
        metadata,
    })
}

/// Failure reason for a checkpoint whose record counts disagree.
#[must_use]
pub fn checksum_failure(
    origin: MessageOrigin,
    internal_message: &str,
    stacktrace: &str,
    job_id: i64,
    attempt_number: u32,
    timestamp: i64,
) -> FailureReason {
    let mut metadata = BTreeMap::new();
    metadata.insert("job_id".to_string(), json!(job_id));
    metadata.insert("attempt_number".to_string(), json!(attempt_number));

    FailureReason {
        failure_origin: failure_origin(origin),
        failure_type: FailureType::SystemError,
        internal_message: Some(truncate_with_notice(internal_message, MAX_MESSAGE_LENGTH)),
        external_message: Some(CHECKSUM_EXTERNAL_MESSAGE.to_string()),
        stacktrace: Some(truncate_with_notice(stacktrace, MAX_STACK_TRACE_LENGTH)),
        timestamp,
        stream_descriptor: None,
        metadata,
    }
}

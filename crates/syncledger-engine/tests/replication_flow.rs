//! End-to-end bookkeeping through the public `MessageTracker` API.
//!
//! Messages are replayed from the repository fixtures, or generated, and fed
//! through a tracker built the way the CLI builds one.

use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use serde::Deserialize;
use serde_json::json;
use syncledger_engine::checksum::{ChannelEventPublisher, ChecksumErrorReport, ErrorReportSink};
use syncledger_engine::clock::ManualClock;
use syncledger_engine::config::parser;
use syncledger_engine::config::types::ReplicationConfig;
use syncledger_engine::config::validator;
use syncledger_engine::{BookkeepingError, MessageTracker, MessageTrackerBuilder};
use syncledger_state::{InMemoryStatePersistence, StatePersistence};
use syncledger_types::checksum::{ChecksumOutcomeKind, MessageOrigin};
use syncledger_types::failure::FailureOrigin;
use syncledger_types::message::{Message, RecordMessage, StateMessage, StateStats};
use syncledger_types::StreamKey;

fn fixture(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("tests/fixtures")
        .join(relative)
}

fn fixture_config() -> ReplicationConfig {
    parser::parse_config(&fixture("configs/replication.yaml")).expect("fixture config must parse")
}

#[derive(Deserialize)]
struct ReplayLine {
    origin: String,
    message: Message,
}

fn replay(tracker: &MessageTracker, path: &Path) -> Result<(), BookkeepingError> {
    let content = std::fs::read_to_string(path).unwrap();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let line: ReplayLine = serde_json::from_str(line).unwrap();
        match line.origin.as_str() {
            "source" => tracker.accept_from_source(&line.message)?,
            "destination" => tracker.accept_from_destination(&line.message)?,
            other => panic!("unexpected origin {other}"),
        }
    }
    Ok(())
}

#[derive(Default)]
struct CollectingSink {
    reports: Mutex<Vec<ChecksumErrorReport>>,
}

impl ErrorReportSink for CollectingSink {
    fn report(&self, report: &ChecksumErrorReport) -> anyhow::Result<()> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

fn record(stream: &str, id: u64) -> Message {
    Message::Record {
        record: RecordMessage::new(stream, None, json!({ "id": id })),
    }
}

// ---------------------------------------------------------------------------
// Fixture replay
// ---------------------------------------------------------------------------

#[test]
fn test_fixture_config_is_valid() {
    let config = fixture_config();
    validator::validate_config(&config).expect("fixture config must validate");
    assert_eq!(config.sync.job_id, 42);
    assert_eq!(config.telemetry.channel_capacity, 64);
}

#[test]
fn test_invalid_fixture_lists_every_problem() {
    let config = parser::parse_config(&fixture("configs/invalid_replication.yaml")).unwrap();
    let err = validator::validate_config(&config).unwrap_err().to_string();
    assert!(err.contains("Unsupported config version"), "got: {err}");
    assert!(err.contains("sync.source_image"), "got: {err}");
    assert!(err.contains("channel_capacity"), "got: {err}");
    assert!(err.contains("state.path"), "got: {err}");
}

#[test]
fn test_replay_fixture_commits_everything() {
    let config = fixture_config();
    let (publisher, mut events) = ChannelEventPublisher::new(config.telemetry.channel_capacity);
    let sink = Arc::new(CollectingSink::default());
    let persistence = Arc::new(InMemoryStatePersistence::new());
    let tracker = MessageTrackerBuilder::new(config.clone())
        .publisher(Arc::new(publisher))
        .sink(sink.clone())
        .persistence(persistence.clone())
        .clock(Arc::new(ManualClock::new(1_700_000_000_000)))
        .build()
        .unwrap();

    replay(&tracker, &fixture("messages/orders.jsonl")).unwrap();
    let stats = tracker.end_of_replication(true).unwrap();

    assert_eq!(stats.total.records_emitted, 5);
    assert_eq!(stats.total.bytes_emitted, 40);
    assert_eq!(stats.total.records_committed, 5);
    assert_eq!(stats.total.bytes_committed, 40);
    assert_eq!(stats.total.source_state_messages_emitted, 2);
    assert_eq!(stats.total.destination_state_messages_emitted, 2);
    assert_eq!(stats.total.estimated_records, Some(3));
    assert_eq!(stats.total.estimated_bytes, Some(24));

    let streams: Vec<_> = stats.streams.iter().map(|s| s.stream.to_string()).collect();
    assert_eq!(streams, vec!["orders", "users"]);

    assert!(sink.reports.lock().unwrap().is_empty());
    assert_eq!(
        persistence
            .latest_states(config.sync.connection_id)
            .unwrap()
            .len(),
        2
    );

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert!(!received.is_empty());
    assert!(received
        .iter()
        .all(|e| e.outcome == ChecksumOutcomeKind::Success));
    let last = received.last().unwrap();
    assert_eq!(last.state_origin, MessageOrigin::Internal);
    assert_eq!(last.state_type, None);
    assert_eq!(last.record_count, 0);
}

// ---------------------------------------------------------------------------
// Checksum failures
// ---------------------------------------------------------------------------

#[test]
fn test_destination_undercount_is_reported_once() {
    let sink = Arc::new(CollectingSink::default());
    let tracker = MessageTrackerBuilder::new(fixture_config())
        .sink(sink.clone())
        .build()
        .unwrap();

    for round in 0..2_i64 {
        for id in 0..4 {
            tracker.accept_from_source(&record("orders", id)).unwrap();
        }
        let checkpoint =
            StateMessage::for_stream(StreamKey::named("orders"), json!({ "cursor": round }))
                .with_source_stats(StateStats::with_record_count(4.0));
        tracker
            .accept_from_source(&Message::State {
                state: checkpoint.clone(),
            })
            .unwrap();
        tracker
            .accept_from_destination(&Message::State {
                state: checkpoint.with_destination_stats(StateStats::with_record_count(3.0)),
            })
            .unwrap();
    }

    let reports = sink.reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].failure.failure_origin, FailureOrigin::Destination);
    assert!(tracker.coordinator().checksum_error_observed());
    assert_eq!(tracker.total_stats(false).records_committed, 8);
}

#[test]
fn test_fail_on_invalid_checksum_aborts_with_origin() {
    let mut config = fixture_config();
    config.feature_flags.fail_sync_on_invalid_checksum = true;
    let tracker = MessageTrackerBuilder::new(config).build().unwrap();

    tracker.accept_from_source(&record("orders", 1)).unwrap();
    tracker.accept_from_source(&record("orders", 2)).unwrap();
    let err = tracker
        .accept_from_source(&Message::State {
            state: StateMessage::for_stream(StreamKey::named("orders"), json!({ "cursor": 1 }))
                .with_source_stats(StateStats::with_record_count(5.0)),
        })
        .unwrap_err();

    assert_eq!(err.failure_origin(), FailureOrigin::Source);
    assert!(err.to_string().contains('5'), "got: {err}");
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn test_source_and_destination_threads_interleave() {
    const STREAMS: [&str; 3] = ["orders", "users", "payments"];
    const CHECKPOINTS: i64 = 20;
    const RECORDS_PER_CHECKPOINT: u64 = 7;

    let tracker = Arc::new(MessageTrackerBuilder::new(fixture_config()).build().unwrap());
    let (acks_tx, acks_rx) = mpsc::channel::<StateMessage>();

    let source = {
        let tracker = Arc::clone(&tracker);
        thread::spawn(move || {
            for cursor in 0..CHECKPOINTS {
                for stream in STREAMS {
                    for id in 0..RECORDS_PER_CHECKPOINT {
                        tracker.accept_from_source(&record(stream, id)).unwrap();
                    }
                    let checkpoint = StateMessage::for_stream(
                        StreamKey::named(stream),
                        json!({ "cursor": cursor }),
                    )
                    .with_source_stats(StateStats::with_record_count(
                        RECORDS_PER_CHECKPOINT as f64,
                    ));
                    tracker
                        .accept_from_source(&Message::State {
                            state: checkpoint.clone(),
                        })
                        .unwrap();
                    acks_tx.send(checkpoint).unwrap();
                }
            }
        })
    };

    let destination = {
        let tracker = Arc::clone(&tracker);
        thread::spawn(move || {
            for checkpoint in acks_rx {
                let count = checkpoint.source_stats.as_ref().and_then(|s| s.record_count);
                let ack = checkpoint.with_destination_stats(StateStats {
                    record_count: count,
                    ..StateStats::default()
                });
                tracker
                    .accept_from_destination(&Message::State { state: ack })
                    .unwrap();
                let total = tracker.total_stats(false);
                assert!(total.records_committed <= total.records_emitted);
            }
        })
    };

    source.join().unwrap();
    destination.join().unwrap();

    let expected = STREAMS.len() as u64 * CHECKPOINTS as u64 * RECORDS_PER_CHECKPOINT;
    let total = tracker.total_stats(false);
    assert_eq!(total.records_emitted, expected);
    assert_eq!(total.records_committed, expected);
    assert_eq!(total.destination_state_messages_emitted, STREAMS.len() as u64 * CHECKPOINTS as u64);
    assert!(total
        .max_seconds_between_state_message_emitted_and_committed
        .is_some());
    assert!(!tracker.coordinator().checksum_error_observed());
}

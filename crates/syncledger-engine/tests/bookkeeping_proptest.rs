use proptest::prelude::*;
use serde_json::json;
use syncledger_engine::config::parser;
use syncledger_engine::{MessageTracker, MessageTrackerBuilder};
use syncledger_types::message::{Message, RecordMessage, StateMessage};
use syncledger_types::StreamKey;

const CONFIG_YAML: &str = r#"
version: "1.0"
sync:
  connection_id: 6f1c1b8e-5d0a-4c3e-9a5b-2f7d8e9a0b1c
  workspace_id: 0b6f3a52-1c2d-4e5f-8a9b-0c1d2e3f4a5b
  job_id: 7
  source_id: 11111111-2222-3333-4444-555555555555
  destination_id: 66666666-7777-8888-9999-000000000000
  source_image: airbyte/source-postgres:3.6.0
  destination_image: airbyte/destination-snowflake:3.11.0
feature_flags:
  emit_checksum_events: false
reporter:
  max_retries: 0
  backoff_ms: 0
"#;

#[derive(Debug, Clone)]
enum Op {
    /// Emit this many records of the given payload length.
    Emit(u8, u8),
    Checkpoint,
    /// Acknowledge the n-th checkpoint created so far (modulo their count).
    Ack(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1_u8..6, 0_u8..40).prop_map(|(n, len)| Op::Emit(n, len)),
        2 => Just(Op::Checkpoint),
        2 => any::<usize>().prop_map(Op::Ack),
    ]
}

fn tracker() -> MessageTracker {
    let config = parser::parse_config_str(CONFIG_YAML).expect("config must parse");
    MessageTrackerBuilder::new(config).build().expect("in-memory tracker")
}

fn checkpoint(cursor: usize) -> StateMessage {
    StateMessage::for_stream(StreamKey::named("orders"), json!({ "cursor": cursor }))
}

/// Bookkeeping the tracker is expected to match: emitted records per
/// checkpoint bucket, and the highest bucket settled so far.
#[derive(Default)]
struct Model {
    buckets: Vec<u64>,
    open: u64,
    settled: Option<usize>,
    committed: u64,
}

impl Model {
    fn emit(&mut self, n: u64) {
        self.open += n;
    }

    fn checkpoint(&mut self) -> usize {
        self.buckets.push(std::mem::take(&mut self.open));
        self.buckets.len() - 1
    }

    fn ack(&mut self, index: usize) {
        let start = self.settled.map_or(0, |s| s + 1);
        if index < start {
            return;
        }
        self.committed += self.buckets[start..=index].iter().sum::<u64>();
        self.settled = Some(index);
    }
}

proptest! {
    #[test]
    fn committed_never_exceeds_emitted(ops in prop::collection::vec(op(), 1..60)) {
        let tracker = tracker();
        let mut checkpoints = 0_usize;

        for op in ops {
            match op {
                Op::Emit(n, len) => {
                    for _ in 0..n {
                        let record = RecordMessage::new("orders", None, json!("x".repeat(len.into())));
                        tracker.accept_from_source(&Message::Record { record }).unwrap();
                    }
                }
                Op::Checkpoint => {
                    tracker
                        .accept_from_source(&Message::State { state: checkpoint(checkpoints) })
                        .unwrap();
                    checkpoints += 1;
                }
                Op::Ack(n) if checkpoints > 0 => {
                    tracker
                        .accept_from_destination(&Message::State { state: checkpoint(n % checkpoints) })
                        .unwrap();
                }
                Op::Ack(_) => {}
            }

            let total = tracker.total_stats(false);
            prop_assert!(total.records_committed <= total.records_emitted);
            prop_assert!(total.bytes_committed <= total.bytes_emitted);
        }
    }

    #[test]
    fn acknowledgments_settle_in_fifo_order(ops in prop::collection::vec(op(), 1..60)) {
        let tracker = tracker();
        let mut model = Model::default();

        for op in ops {
            match op {
                Op::Emit(n, _) => {
                    for id in 0..n {
                        let record = RecordMessage::new("orders", None, json!({ "id": id }));
                        tracker.accept_from_source(&Message::Record { record }).unwrap();
                    }
                    model.emit(u64::from(n));
                }
                Op::Checkpoint => {
                    let index = model.checkpoint();
                    tracker
                        .accept_from_source(&Message::State { state: checkpoint(index) })
                        .unwrap();
                }
                Op::Ack(n) if !model.buckets.is_empty() => {
                    let index = n % model.buckets.len();
                    tracker
                        .accept_from_destination(&Message::State { state: checkpoint(index) })
                        .unwrap();
                    model.ack(index);
                }
                Op::Ack(_) => {}
            }

            prop_assert_eq!(tracker.total_stats(false).records_committed, model.committed);
        }
    }
}

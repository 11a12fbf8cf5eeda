use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use syncledger_engine::checksum::ChannelEventPublisher;
use syncledger_engine::clock::{Clock, SystemClock};
use syncledger_engine::config::parser;
use syncledger_engine::config::validator;
use syncledger_engine::failure::checksum_failure;
use syncledger_engine::{BookkeepingError, MessageTracker, MessageTrackerBuilder};
use syncledger_types::checksum::{ChecksumCountEvent, ChecksumOutcomeKind};
use syncledger_types::failure::FailureReason;
use syncledger_types::message::Message;
use syncledger_types::stats::AttemptStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Origin {
    Source,
    Destination,
}

/// One line of a replay log.
#[derive(Debug, Deserialize)]
struct ReplayLine {
    origin: Origin,
    message: Message,
}

fn parse_lines(content: &str, path: &Path) -> Result<Vec<ReplayLine>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).with_context(|| {
                format!("{}:{}: invalid replay line", path.display(), index + 1)
            })
        })
        .collect()
}

/// Feed every line through the tracker, stopping at the first fatal error.
fn feed(tracker: &MessageTracker, lines: &[ReplayLine]) -> Option<BookkeepingError> {
    for (index, line) in lines.iter().enumerate() {
        let result = match line.origin {
            Origin::Source => tracker.accept_from_source(&line.message),
            Origin::Destination => tracker.accept_from_destination(&line.message),
        };
        if let Err(e) = result {
            tracing::error!(line = index + 1, error = %e, "Replication aborted");
            return Some(e);
        }
    }
    None
}

/// Execute the `replay` command: feed a recorded message log through a
/// tracker and print the resulting statistics.
pub async fn execute(messages_path: &Path, config_path: &Path) -> Result<()> {
    let config = parser::parse_config(config_path)
        .with_context(|| format!("Failed to parse replication config: {}", config_path.display()))?;
    validator::validate_config(&config)?;

    let content = std::fs::read_to_string(messages_path)
        .with_context(|| format!("Failed to read message log: {}", messages_path.display()))?;
    let lines = parse_lines(&content, messages_path)?;

    tracing::info!(
        connection_id = %config.sync.connection_id,
        job_id = config.sync.job_id,
        messages = lines.len(),
        "Replaying message log"
    );

    let (publisher, mut events_rx) = ChannelEventPublisher::new(config.telemetry.channel_capacity);
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = events_rx.recv().await {
            events.push(event);
        }
        events
    });

    let sync = config.sync.clone();
    let tracker = Arc::new(
        MessageTrackerBuilder::new(config)
            .publisher(Arc::new(publisher))
            .build()
            .context("Failed to build message tracker")?,
    );

    // Reporting retries sleep on the calling thread.
    let worker = Arc::clone(&tracker);
    let (aborted, stats) = tokio::task::spawn_blocking(move || {
        let aborted = feed(&worker, &lines);
        let stats = worker.end_of_replication(aborted.is_none());
        (aborted, stats)
    })
    .await
    .context("Replay worker panicked")?;
    let stats = stats.context("Failed to finalize replication")?;
    let events = collector.await.context("Telemetry collector panicked")?;

    let mut failures = tracker.error_trace_message_failures(sync.job_id, sync.attempt_number);
    if let Some(BookkeepingError::InvalidChecksum(e)) = &aborted {
        failures.push(checksum_failure(
            e.origin,
            &e.message,
            "",
            sync.job_id,
            sync.attempt_number,
            SystemClock.now_millis(),
        ));
    }

    print_report(messages_path, aborted.is_none(), &stats, &failures, &events);

    match aborted {
        Some(e) => Err(e).context("Replication aborted"),
        None => Ok(()),
    }
}

fn print_report(
    messages_path: &Path,
    completed: bool,
    stats: &AttemptStats,
    failures: &[FailureReason],
    events: &[ChecksumCountEvent],
) {
    let total = &stats.total;
    let status = if completed { "completed" } else { "aborted" };
    println!("Replay of '{}' {status}.", messages_path.display());
    println!("  Records emitted:   {}", total.records_emitted);
    println!("  Records committed: {}", total.records_committed);
    if total.records_filtered_out > 0 {
        println!("  Records filtered:  {}", total.records_filtered_out);
    }
    if let Some(rejected) = total.records_rejected {
        println!("  Records rejected:  {rejected}");
    }
    println!("  Bytes emitted:     {}", format_bytes(total.bytes_emitted));
    println!("  Bytes committed:   {}", format_bytes(total.bytes_committed));
    if let Some(estimate) = total.estimated_records {
        println!("  Estimated records: {estimate}");
    }
    println!(
        "  Checkpoints:       {} from source, {} from destination",
        total.source_state_messages_emitted, total.destination_state_messages_emitted
    );
    println!(
        "  Source checkpoint interval: max {}s, mean {}s",
        total.max_seconds_before_source_state_message_emitted,
        total.mean_seconds_before_source_state_message_emitted
    );
    match (
        total.max_seconds_between_state_message_emitted_and_committed,
        total.mean_seconds_between_state_message_emitted_and_committed,
    ) {
        (Some(max), Some(mean)) => println!("  Commit latency:    max {max}s, mean {mean}s"),
        _ => println!("  Commit latency:    unavailable"),
    }

    for stream in &stats.streams {
        println!(
            "  Stream {:24} emitted {:>8}  committed {:>8}",
            stream.stream.to_string(),
            stream.stats.records_emitted,
            stream.stats.records_committed
        );
    }

    for failure in failures {
        println!(
            "  Failure ({:?}, {:?}): {}",
            failure.failure_origin,
            failure.failure_type,
            failure
                .external_message
                .as_deref()
                .or(failure.internal_message.as_deref())
                .unwrap_or_default()
        );
    }

    let count_of = |kind: ChecksumOutcomeKind| events.iter().filter(|e| e.outcome == kind).count();
    println!(
        "  Checksum events:   {} success, {} mismatch, {} missing",
        count_of(ChecksumOutcomeKind::Success),
        count_of(ChecksumOutcomeKind::Mismatch),
        count_of(ChecksumOutcomeKind::Missing)
    );

    // Machine-readable JSON for downstream tooling
    let json = serde_json::json!({
        "completed": completed,
        "stats": stats,
        "failures": failures,
        "checksum_events": events,
    });
    println!("@@SYNCLEDGER_JSON@@{json}");
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.2} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.2} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

//! Semantic validation for parsed replication config values.

use anyhow::{bail, Result};

use crate::config::types::{parse_image, ReplicationConfig, StateBackendKind};

const MAX_REPORTER_BACKOFF_MS: u64 = 60_000;

/// Validate a parsed replication config.
///
/// # Errors
///
/// Returns an error listing every validation failure found in the config.
pub fn validate_config(config: &ReplicationConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported config version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.sync.job_id < 0 {
        errors.push(format!("sync.job_id must be >= 0, got {}", config.sync.job_id));
    }

    for (field, image) in [
        ("sync.source_image", &config.sync.source_image),
        ("sync.destination_image", &config.sync.destination_image),
    ] {
        if parse_image(image).is_none() {
            errors.push(format!("{field}: '{image}' is not a 'repository:tag' image"));
        }
    }

    if config.telemetry.channel_capacity == 0 {
        errors.push("telemetry.channel_capacity must be > 0".to_string());
    }

    if config.reporter.backoff_ms > MAX_REPORTER_BACKOFF_MS {
        errors.push(format!(
            "reporter.backoff_ms must be <= {MAX_REPORTER_BACKOFF_MS}, got {}",
            config.reporter.backoff_ms
        ));
    }

    if config.state.backend == StateBackendKind::Sqlite && config.state.path.is_none() {
        errors.push("state.path is required for the sqlite backend".to_string());
    }

    if !errors.is_empty() {
        bail!(
            "Replication config validation failed:\n  - {}",
            errors.join("\n  - ")
        );
    }

    Ok(())
}

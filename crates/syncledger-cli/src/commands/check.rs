use std::path::Path;

use anyhow::{Context, Result};

use syncledger_engine::config::parser;
use syncledger_engine::config::types::{ReplicationConfig, StateBackendKind};
use syncledger_engine::config::validator;
use syncledger_engine::MessageTrackerBuilder;

/// Execute the `check` command: validate the replication config and open its
/// state backend.
pub fn execute(config_path: &Path) -> Result<()> {
    let config = parser::parse_config(config_path)
        .with_context(|| format!("Failed to parse replication config: {}", config_path.display()))?;

    validator::validate_config(&config)?;
    println!("Replication config: OK");
    print_summary(&config);

    MessageTrackerBuilder::new(config)
        .build()
        .context("Failed to open state backend")?;
    println!("State backend:      OK");

    println!("\nAll checks passed.");
    Ok(())
}

fn print_summary(config: &ReplicationConfig) {
    let backend = match config.state.backend {
        StateBackendKind::Memory => "memory".to_string(),
        StateBackendKind::Sqlite => match &config.state.path {
            Some(path) => format!("sqlite ({})", path.display()),
            None => "sqlite".to_string(),
        },
    };
    println!("  Connection:       {}", config.sync.connection_id);
    println!(
        "  Job / attempt:    {} / {}",
        config.sync.job_id, config.sync.attempt_number
    );
    println!("  Source:           {}", config.sync.source_image);
    println!("  Destination:      {}", config.sync.destination_image);
    println!("  Platform mode:    {:?}", config.platform_mode);
    println!(
        "  Fail on checksum: {}",
        config.feature_flags.fail_sync_on_invalid_checksum
    );
    println!("  State backend:    {backend}");
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
version: "1.0"
sync:
  connection_id: 6f1c1b8e-5d0a-4c3e-9a5b-2f7d8e9a0b1c
  workspace_id: 0b6f3a52-1c2d-4e5f-8a9b-0c1d2e3f4a5b
  job_id: 42
  source_id: 11111111-2222-3333-4444-555555555555
  destination_id: 66666666-7777-8888-9999-000000000000
  source_image: airbyte/source-postgres:3.6.0
  destination_image: airbyte/destination-snowflake:3.11.0
"#;

    #[test]
    fn test_valid_config_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replication.yaml");
        std::fs::write(&path, VALID).unwrap();
        execute(&path).unwrap();
    }

    #[test]
    fn test_invalid_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replication.yaml");
        std::fs::write(&path, VALID.replace("\"1.0\"", "\"0.9\"")).unwrap();
        let err = execute(&path).unwrap_err();
        assert!(err.to_string().contains("validation failed"), "got: {err}");
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = execute(Path::new("/nonexistent/replication.yaml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/replication.yaml"));
    }
}

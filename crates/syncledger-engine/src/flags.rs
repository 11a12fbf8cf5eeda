//! Feature-flag lookup.
//!
//! Flags are read through [`FeatureFlagReader`] so that a deployment can
//! plug in its own flag service; [`StaticFeatureFlags`] serves the values
//! from the replication config.

use uuid::Uuid;

use crate::config::types::FeatureFlagsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureFlag {
    /// Abort the sync when a checkpoint's record counts disagree.
    FailSyncOnInvalidChecksum,
    /// Publish checksum telemetry events.
    EmitChecksumEvents,
    /// Include raw checkpoint payloads in successful-checksum diagnostics.
    LogStateMessages,
    /// Log every stream named in an incoming GLOBAL checkpoint.
    LogStreamNamesInStateMessage,
}

impl FeatureFlag {
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Self::FailSyncOnInvalidChecksum => "fail_sync_on_invalid_checksum",
            Self::EmitChecksumEvents => "emit_checksum_events",
            Self::LogStateMessages => "log_state_messages",
            Self::LogStreamNamesInStateMessage => "log_stream_names_in_state_message",
        }
    }
}

/// Scope a flag is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlagContext {
    pub connection_id: Uuid,
    pub workspace_id: Uuid,
}

pub trait FeatureFlagReader: Send + Sync {
    fn enabled(&self, flag: FeatureFlag, context: &FlagContext) -> bool;
}

/// Same answer for every connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticFeatureFlags {
    values: FeatureFlagsConfig,
}

impl StaticFeatureFlags {
    #[must_use]
    pub fn new(values: FeatureFlagsConfig) -> Self {
        Self { values }
    }
}

impl FeatureFlagReader for StaticFeatureFlags {
    fn enabled(&self, flag: FeatureFlag, _context: &FlagContext) -> bool {
        match flag {
            FeatureFlag::FailSyncOnInvalidChecksum => self.values.fail_sync_on_invalid_checksum,
            FeatureFlag::EmitChecksumEvents => self.values.emit_checksum_events,
            FeatureFlag::LogStateMessages => self.values.log_state_messages,
            FeatureFlag::LogStreamNamesInStateMessage => {
                self.values.log_stream_names_in_state_message
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_flags_follow_config() {
        let flags = StaticFeatureFlags::new(FeatureFlagsConfig {
            fail_sync_on_invalid_checksum: true,
            emit_checksum_events: false,
            log_state_messages: false,
            log_stream_names_in_state_message: true,
        });
        let ctx = FlagContext {
            connection_id: Uuid::nil(),
            workspace_id: Uuid::nil(),
        };
        assert!(flags.enabled(FeatureFlag::FailSyncOnInvalidChecksum, &ctx));
        assert!(!flags.enabled(FeatureFlag::EmitChecksumEvents, &ctx));
        assert!(flags.enabled(FeatureFlag::LogStreamNamesInStateMessage, &ctx));
    }

    #[test]
    fn flag_keys_match_config_fields() {
        assert_eq!(
            FeatureFlag::FailSyncOnInvalidChecksum.key(),
            "fail_sync_on_invalid_checksum"
        );
    }
}

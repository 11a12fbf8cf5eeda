//! Persistence trait definition.
//!
//! [`StatePersistence`] is the storage contract for acknowledged checkpoints
//! (used for crash recovery of the next attempt) and for the final
//! statistics of an attempt. Model types live in [`syncledger_types`].

use serde::{Deserialize, Serialize};
use syncledger_types::message::{StateMessage, StateType};
use syncledger_types::stats::{AttemptKey, AttemptStats};
use uuid::Uuid;

use crate::error;

/// Stored statistics of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub stats: AttemptStats,
    /// `None` until [`StatePersistence::end_of_replication`] is called.
    pub completed_successfully: Option<bool>,
}

/// Storage slot a checkpoint replaces.
///
/// STREAM checkpoints own one slot per stream, GLOBAL and LEGACY
/// checkpoints own a single slot for the whole connection.
#[must_use]
pub fn state_scope(state: &StateMessage) -> String {
    match state.state_type {
        StateType::Stream => match state.stream_key() {
            Some(key) => format!("stream:{key}"),
            None => "stream:".to_string(),
        },
        StateType::Global => "global".to_string(),
        StateType::Legacy => "legacy".to_string(),
    }
}

/// Storage contract for checkpoints and attempt statistics.
///
/// Implementations must be `Send + Sync` for use behind
/// `Arc<dyn StatePersistence>`.
pub trait StatePersistence: Send + Sync {
    /// Store a destination-acknowledged checkpoint verbatim, replacing the
    /// previous checkpoint of the same scope.
    ///
    /// Switching between STREAM and GLOBAL checkpoints drops the slots of
    /// the other kind.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn persist(&self, connection_id: Uuid, state: &StateMessage) -> error::Result<()>;

    /// Latest checkpoint of every scope, ordered by scope.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn latest_states(&self, connection_id: Uuid) -> error::Result<Vec<StateMessage>>;

    /// Upsert the statistics of an attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn save_stats(&self, attempt: &AttemptKey, stats: &AttemptStats) -> error::Result<()>;

    /// Read back the statistics of an attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn attempt_stats(&self, attempt: &AttemptKey) -> error::Result<Option<AttemptRecord>>;

    /// Mark the attempt finished. Called exactly once per attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::StateError) on storage failure.
    fn end_of_replication(
        &self,
        attempt: &AttemptKey,
        completed_successfully: bool,
    ) -> error::Result<()>;
}

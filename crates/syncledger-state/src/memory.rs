//! In-memory implementation of [`StatePersistence`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use syncledger_types::message::StateMessage;
use syncledger_types::stats::{AttemptKey, AttemptStats};
use uuid::Uuid;

use crate::error::{self, StateError};
use crate::persistence::{state_scope, AttemptRecord, StatePersistence};

#[derive(Default)]
struct Inner {
    states: HashMap<Uuid, BTreeMap<String, StateMessage>>,
    attempts: HashMap<AttemptKey, AttemptRecord>,
}

/// Process-local persistence, lost on exit. Used by replays and tests.
#[derive(Default)]
pub struct InMemoryStatePersistence {
    inner: Mutex<Inner>,
}

impl InMemoryStatePersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> error::Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StateError::LockPoisoned)
    }
}

/// `stream`, `global` or `legacy`.
fn scope_kind(scope: &str) -> &str {
    scope.split(':').next().unwrap_or(scope)
}

impl StatePersistence for InMemoryStatePersistence {
    fn persist(&self, connection_id: Uuid, state: &StateMessage) -> error::Result<()> {
        let scope = state_scope(state);
        let mut inner = self.lock()?;
        let slots = inner.states.entry(connection_id).or_default();
        slots.retain(|existing, _| scope_kind(existing) == scope_kind(&scope));
        slots.insert(scope, state.clone());
        Ok(())
    }

    fn latest_states(&self, connection_id: Uuid) -> error::Result<Vec<StateMessage>> {
        let inner = self.lock()?;
        Ok(inner
            .states
            .get(&connection_id)
            .map(|slots| slots.values().cloned().collect())
            .unwrap_or_default())
    }

    fn save_stats(&self, attempt: &AttemptKey, stats: &AttemptStats) -> error::Result<()> {
        let mut inner = self.lock()?;
        inner
            .attempts
            .entry(*attempt)
            .and_modify(|record| record.stats = stats.clone())
            .or_insert_with(|| AttemptRecord {
                stats: stats.clone(),
                completed_successfully: None,
            });
        Ok(())
    }

    fn attempt_stats(&self, attempt: &AttemptKey) -> error::Result<Option<AttemptRecord>> {
        Ok(self.lock()?.attempts.get(attempt).cloned())
    }

    fn end_of_replication(
        &self,
        attempt: &AttemptKey,
        completed_successfully: bool,
    ) -> error::Result<()> {
        let mut inner = self.lock()?;
        inner
            .attempts
            .entry(*attempt)
            .or_insert_with(|| AttemptRecord {
                stats: AttemptStats::default(),
                completed_successfully: None,
            })
            .completed_successfully = Some(completed_successfully);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use syncledger_types::message::StreamState;
    use syncledger_types::stats::SyncStats;
    use syncledger_types::StreamKey;

    fn attempt() -> AttemptKey {
        AttemptKey {
            connection_id: Uuid::nil(),
            job_id: 1,
            attempt_number: 0,
        }
    }

    #[test]
    fn latest_stream_state_wins_per_stream() {
        let store = InMemoryStatePersistence::new();
        let conn = Uuid::new_v4();
        let orders = StreamKey::named("orders");

        store
            .persist(conn, &StateMessage::for_stream(orders.clone(), json!({"c": 1})))
            .unwrap();
        store
            .persist(conn, &StateMessage::for_stream(orders.clone(), json!({"c": 2})))
            .unwrap();
        store
            .persist(
                conn,
                &StateMessage::for_stream(StreamKey::named("users"), json!({"c": 9})),
            )
            .unwrap();

        let states = store.latest_states(conn).unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].stream.as_ref().unwrap().stream_state, Some(json!({"c": 2})));
    }

    #[test]
    fn global_state_replaces_stream_slots() {
        let store = InMemoryStatePersistence::new();
        let conn = Uuid::new_v4();
        store
            .persist(
                conn,
                &StateMessage::for_stream(StreamKey::named("orders"), json!({})),
            )
            .unwrap();
        store
            .persist(
                conn,
                &StateMessage::global(
                    json!({"lsn": 3}),
                    vec![StreamState::new(StreamKey::named("orders"), json!({}))],
                ),
            )
            .unwrap();

        let states = store.latest_states(conn).unwrap();
        assert_eq!(states.len(), 1);
        assert!(states[0].global.is_some());
    }

    #[test]
    fn stats_and_completion_are_tracked_per_attempt() {
        let store = InMemoryStatePersistence::new();
        let stats = AttemptStats {
            total: SyncStats {
                records_committed: 4,
                ..SyncStats::default()
            },
            streams: vec![],
        };

        assert!(store.attempt_stats(&attempt()).unwrap().is_none());
        store.save_stats(&attempt(), &stats).unwrap();
        store.end_of_replication(&attempt(), true).unwrap();

        let record = store.attempt_stats(&attempt()).unwrap().unwrap();
        assert_eq!(record.stats.total.records_committed, 4);
        assert_eq!(record.completed_successfully, Some(true));
    }
}

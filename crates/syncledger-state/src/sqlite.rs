//! `SQLite`-backed implementation of [`StatePersistence`].
//!
//! Uses a single `Mutex<Connection>` for thread safety.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use syncledger_types::message::{StateMessage, StateType};
use syncledger_types::stats::{AttemptKey, AttemptStats};
use uuid::Uuid;

use crate::error::{self, StateError};
use crate::persistence::{state_scope, AttemptRecord, StatePersistence};

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Idempotent DDL for persistence tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS connection_states (
    connection_id TEXT NOT NULL,
    scope TEXT NOT NULL,
    state_json TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (connection_id, scope)
);

CREATE TABLE IF NOT EXISTS attempt_stats (
    connection_id TEXT NOT NULL,
    job_id INTEGER NOT NULL,
    attempt_number INTEGER NOT NULL,
    stats_json TEXT NOT NULL,
    completed_successfully INTEGER,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (connection_id, job_id, attempt_number)
);
";

/// `SQLite`-backed checkpoint and stats storage.
///
/// Create with [`SqliteStatePersistence::open`] for file-backed persistence
/// or [`SqliteStatePersistence::in_memory`] for tests.
pub struct SqliteStatePersistence {
    conn: Mutex<Connection>,
}

impl SqliteStatePersistence {
    /// Open or create a `SQLite` database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory `SQLite` database (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the database can't be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Format current UTC time for `SQLite` storage.
    fn now_sqlite() -> String {
        Utc::now().format(SQLITE_DATETIME_FMT).to_string()
    }
}

impl StatePersistence for SqliteStatePersistence {
    fn persist(&self, connection_id: Uuid, state: &StateMessage) -> error::Result<()> {
        let scope = state_scope(state);
        let state_json = serde_json::to_string(state)?;
        let connection_id = connection_id.to_string();

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        match state.state_type {
            StateType::Stream => tx.execute(
                "DELETE FROM connection_states \
                 WHERE connection_id = ?1 AND scope NOT LIKE 'stream:%'",
                [&connection_id],
            )?,
            StateType::Global | StateType::Legacy => tx.execute(
                "DELETE FROM connection_states WHERE connection_id = ?1 AND scope <> ?2",
                [&connection_id, &scope],
            )?,
        };
        tx.execute(
            "INSERT INTO connection_states (connection_id, scope, state_json, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(connection_id, scope) \
             DO UPDATE SET state_json = ?3, updated_at = ?4",
            rusqlite::params![connection_id, scope, state_json, Self::now_sqlite()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn latest_states(&self, connection_id: Uuid) -> error::Result<Vec<StateMessage>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT state_json FROM connection_states \
             WHERE connection_id = ?1 ORDER BY scope",
        )?;
        let rows = stmt.query_map([connection_id.to_string()], |row| row.get::<_, String>(0))?;

        let mut states = Vec::new();
        for raw in rows {
            states.push(serde_json::from_str(&raw?)?);
        }
        Ok(states)
    }

    fn save_stats(&self, attempt: &AttemptKey, stats: &AttemptStats) -> error::Result<()> {
        let stats_json = serde_json::to_string(stats)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO attempt_stats \
             (connection_id, job_id, attempt_number, stats_json, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(connection_id, job_id, attempt_number) \
             DO UPDATE SET stats_json = ?4, updated_at = ?5",
            rusqlite::params![
                attempt.connection_id.to_string(),
                attempt.job_id,
                attempt.attempt_number,
                stats_json,
                Self::now_sqlite(),
            ],
        )?;
        Ok(())
    }

    fn attempt_stats(&self, attempt: &AttemptKey) -> error::Result<Option<AttemptRecord>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT stats_json, completed_successfully FROM attempt_stats \
                 WHERE connection_id = ?1 AND job_id = ?2 AND attempt_number = ?3",
                rusqlite::params![
                    attempt.connection_id.to_string(),
                    attempt.job_id,
                    attempt.attempt_number,
                ],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<bool>>(1)?)),
            )
            .optional()?;

        match row {
            Some((stats_json, completed_successfully)) => Ok(Some(AttemptRecord {
                stats: serde_json::from_str(&stats_json)?,
                completed_successfully,
            })),
            None => Ok(None),
        }
    }

    fn end_of_replication(
        &self,
        attempt: &AttemptKey,
        completed_successfully: bool,
    ) -> error::Result<()> {
        let empty_stats = serde_json::to_string(&AttemptStats::default())?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO attempt_stats \
             (connection_id, job_id, attempt_number, stats_json, completed_successfully, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(connection_id, job_id, attempt_number) \
             DO UPDATE SET completed_successfully = ?5, updated_at = ?6",
            rusqlite::params![
                attempt.connection_id.to_string(),
                attempt.job_id,
                attempt.attempt_number,
                empty_stats,
                completed_successfully,
                Self::now_sqlite(),
            ],
        )?;
        tracing::debug!(
            connection_id = %attempt.connection_id,
            job_id = attempt.job_id,
            attempt = attempt.attempt_number,
            completed_successfully,
            "Attempt marked finished"
        );
        Ok(())
    }
}

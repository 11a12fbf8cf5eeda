//! Durable checkpoint persistence for syncledger.
//!
//! Provides the [`StatePersistence`] trait that receives every checkpoint a
//! destination acknowledges, plus the final statistics of each attempt, with
//! an in-memory and a [`SqliteStatePersistence`] implementation.

#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
pub mod persistence;
pub mod sqlite;

pub use error::{Result, StateError};
pub use memory::InMemoryStatePersistence;
pub use persistence::{state_scope, AttemptRecord, StatePersistence};
pub use sqlite::SqliteStatePersistence;

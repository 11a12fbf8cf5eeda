//! Shared syncledger message, stats and failure model types.
//!
//! Pure data types consumed by the state and engine crates. Nothing in
//! here holds runtime state; the bookkeeping lives in `syncledger-engine`.

pub mod checksum;
pub mod failure;
pub mod message;
pub mod stats;
pub mod stream;

pub use stream::StreamKey;

//! Deterministic checkpoint identity.
//!
//! A destination echoes the source's checkpoint back with its own
//! `destinationStats` attached, so identity is derived from the checkpoint
//! content only: scope, stream descriptors, state blobs. Stats and unknown
//! properties never contribute.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use syncledger_types::message::{StateMessage, StreamState};

/// Tracking id of a checkpoint: the first 8 bytes of its content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointId(u64);

impl CheckpointId {
    #[must_use]
    pub fn of(state: &StateMessage) -> Self {
        fingerprint(state).id
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Tracking id together with the full hex content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub id: CheckpointId,
    pub hash: String,
}

#[must_use]
pub fn fingerprint(state: &StateMessage) -> Fingerprint {
    // `Value` objects are ordered maps, so this serialization is canonical.
    let canonical = canonical_content(state).to_string();
    let digest = Sha256::digest(canonical.as_bytes());

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    Fingerprint {
        id: CheckpointId(u64::from_be_bytes(head)),
        hash: hex::encode(digest),
    }
}

fn canonical_content(state: &StateMessage) -> Value {
    json!({
        "type": state.state_type.as_str(),
        "stream": state.stream.as_ref().map(stream_content),
        "global": state.global.as_ref().map(|global| json!({
            "shared_state": global.shared_state,
            "stream_states": global.stream_states.iter().map(stream_content).collect::<Vec<_>>(),
        })),
        "data": state.data,
    })
}

fn stream_content(stream: &StreamState) -> Value {
    json!({
        "name": stream.stream_descriptor.name,
        "namespace": stream.stream_descriptor.namespace,
        "state": stream.stream_state,
    })
}

//! Bookkeeping error model.
//!
//! Only a checksum failure with fail-on-invalid enabled, or a failure of the
//! durable state collaborator, ever reaches the caller. Everything else is
//! absorbed where it happens.

use syncledger_state::StateError;
use syncledger_types::checksum::MessageOrigin;
use syncledger_types::failure::FailureOrigin;

/// Record counts of a checkpoint disagree and the sync must abort.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct InvalidChecksumError {
    /// Side whose checkpoint failed validation.
    pub origin: MessageOrigin,
    pub message: String,
}

impl InvalidChecksumError {
    /// Party held responsible for the disagreement.
    #[must_use]
    pub fn failure_origin(&self) -> FailureOrigin {
        failure_origin(self.origin)
    }
}

/// Map the side of a checkpoint to the party blamed for its failure.
#[must_use]
pub fn failure_origin(origin: MessageOrigin) -> FailureOrigin {
    match origin {
        MessageOrigin::Source => FailureOrigin::Source,
        MessageOrigin::Destination => FailureOrigin::Destination,
        MessageOrigin::Internal => FailureOrigin::Platform,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BookkeepingError {
    #[error(transparent)]
    InvalidChecksum(#[from] InvalidChecksumError),
    #[error("state persistence failed: {0}")]
    Persistence(#[from] StateError),
}

impl BookkeepingError {
    /// Party held responsible when this error aborts the attempt.
    #[must_use]
    pub fn failure_origin(&self) -> FailureOrigin {
        match self {
            Self::InvalidChecksum(e) => e.failure_origin(),
            Self::Persistence(_) => FailureOrigin::Platform,
        }
    }
}

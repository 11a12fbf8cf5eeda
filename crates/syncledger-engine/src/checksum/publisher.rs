//! Fire-and-forget delivery of checksum telemetry events.

use std::sync::{Mutex, PoisonError};

use anyhow::anyhow;
use syncledger_types::checksum::ChecksumCountEvent;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Outbound sink for checksum telemetry.
///
/// `publish` must not block the caller. `close` may be called more than
/// once; only the first call has an effect.
pub trait TelemetryEventPublisher: Send + Sync {
    fn publish(&self, events: Vec<ChecksumCountEvent>) -> anyhow::Result<()>;

    fn close(&self);
}

/// Publishes onto a bounded channel drained by a background consumer.
pub struct ChannelEventPublisher {
    sender: Mutex<Option<mpsc::Sender<ChecksumCountEvent>>>,
}

impl ChannelEventPublisher {
    /// Create a publisher and the receiving end of its channel.
    ///
    /// The channel is closed once the publisher is closed and every event
    /// already queued has been received.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ChecksumCountEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

impl TelemetryEventPublisher for ChannelEventPublisher {
    fn publish(&self, events: Vec<ChecksumCountEvent>) -> anyhow::Result<()> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            return Err(anyhow!("telemetry publisher is closed"));
        };

        let total = events.len();
        for (sent, event) in events.into_iter().enumerate() {
            match sender.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    return Err(anyhow!(
                        "telemetry channel full, dropped {} of {total} events",
                        total - sent
                    ));
                }
                Err(TrySendError::Closed(_)) => {
                    return Err(anyhow!("telemetry consumer has gone away"));
                }
            }
        }
        Ok(())
    }

    fn close(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_some() {
            tracing::debug!("Telemetry publisher closed");
        }
    }
}

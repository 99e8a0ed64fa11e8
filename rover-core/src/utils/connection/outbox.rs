//! Outbound side of a connection.
//!
//! The command loop and the stream pump both talk to the peer. Neither writes
//! to the socket directly: they push serialized messages into a bounded
//! channel drained by a single writer task, so messages are never interleaved
//! mid-write and a slow peer applies backpressure instead of growing a queue.

use serde::Serialize;
use tokio::sync::mpsc;

use super::protocol::CommandError;

/// Messages buffered between producers and the socket writer.
pub const OUTBOX_CAPACITY: usize = 8;

/// Cloneable handle for queueing messages to the peer.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<String>,
}

impl Outbox {
    /// Create an outbox and the receiver the writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Serialize `message` and queue it, waiting while the queue is full.
    ///
    /// Fails with `ConnectionClosed` once the writer is gone.
    pub async fn send<T: Serialize>(
        &self,
        message: &T,
    ) -> Result<(), CommandError> {
        let text = serde_json::to_string(message)
            .map_err(|error| CommandError::Protocol(format!("failed to encode message: {error}")))?;
        self.send_text(text).await
    }

    pub async fn send_text(
        &self,
        text: String,
    ) -> Result<(), CommandError> {
        self.tx
            .send(text)
            .await
            .map_err(|_| CommandError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

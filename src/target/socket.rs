//! Tool-side socket handle.

// ============================================================================
// Imports
// ============================================================================

use tokio::sync::mpsc;
use tracing::trace;

// ============================================================================
// ToolSocket
// ============================================================================

/// Sending half of a tool-side connection.
///
/// The front end owns the receiver and writes every frame to the real
/// WebSocket. The socket counts as open while that receiver is alive.
#[derive(Debug, Clone)]
pub struct ToolSocket {
    tx: mpsc::UnboundedSender<String>,
}

impl ToolSocket {
    /// Wraps an existing channel sender.
    #[inline]
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    /// Creates a socket together with the receiver that drains it.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns `true` while the receiving side is alive.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queues a frame; silently dropped if the socket is closed.
    pub fn send(&self, frame: String) {
        if self.tx.send(frame).is_err() {
            trace!("Tool socket closed, frame dropped");
        }
    }

    /// Returns `true` if both handles feed the same receiver.
    #[inline]
    #[must_use]
    pub fn same_channel(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

// ============================================================================
// Tests
// ============================================================================

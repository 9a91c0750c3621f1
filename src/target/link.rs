//! Device-side WebSocket connection and event loop.
//!
//! Each [`DeviceLink`] owns two spawned tasks. The event loop:
//!
//! - Connects to the device's real `webSocketDebuggerUrl`
//! - Routes every inbound text frame through
//!   [`Target::route_target_message`], settling adapter-call replies at once
//! - Writes outbound frames queued through the command channel
//!
//! The dispatcher drains the remaining frames in arrival order and runs their
//! filter chains. The socket keeps being read while a chain is suspended, so
//! a filter may await [`Target::call_target`].
//!
//! The task reports `open` and `closed` transitions back to the owning
//! [`Target`] tagged with a generation number, so notifications from a
//! replaced link are ignored.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Weak;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, trace, warn};

use super::Target;
use super::core::Inbound;

// ============================================================================
// LinkCommand
// ============================================================================

/// Internal commands for the event loop.
enum LinkCommand {
    /// Write a raw text frame to the device.
    Send(String),
    /// Close the connection.
    Close,
}

impl std::fmt::Debug for LinkCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send(_) => f.write_str("Send"),
            Self::Close => f.write_str("Close"),
        }
    }
}

// ============================================================================
// DeviceLink
// ============================================================================

/// Handle to a running device connection task.
#[derive(Debug, Clone)]
pub(crate) struct DeviceLink {
    command_tx: mpsc::UnboundedSender<LinkCommand>,
    generation: u64,
}

impl DeviceLink {
    /// Spawns the connection task.
    pub(crate) fn spawn(url: String, target: Weak<Target>, generation: u64) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_dispatcher(inbound_rx, target.clone()));
        tokio::spawn(run_event_loop(url, command_rx, inbound_tx, target, generation));

        Self {
            command_tx,
            generation,
        }
    }

    /// Returns `true` while the task is alive.
    #[inline]
    pub(crate) fn is_open(&self) -> bool {
        !self.command_tx.is_closed()
    }

    /// Generation this link was created with.
    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Queues a frame. Returns `false` if the task has exited.
    #[inline]
    pub(crate) fn send(&self, raw: String) -> bool {
        self.command_tx.send(LinkCommand::Send(raw)).is_ok()
    }

    /// Asks the task to close the connection.
    #[inline]
    pub(crate) fn close(&self) {
        let _ = self.command_tx.send(LinkCommand::Close);
    }
}

// ============================================================================
// Event Loop
// ============================================================================

async fn run_event_loop(
    url: String,
    mut command_rx: mpsc::UnboundedReceiver<LinkCommand>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    target: Weak<Target>,
    generation: u64,
) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            error!(url = %url, error = %e, "Device connection failed");
            finish(&mut command_rx, &target, generation);
            return;
        }
    };

    debug!(url = %url, "Connection established");

    match target.upgrade() {
        Some(target) => target.on_device_open(generation),
        None => return,
    }

    let (mut ws_write, mut ws_read) = ws_stream.split();

    loop {
        tokio::select! {
            // Frames from the device
            message = ws_read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        let Some(target) = target.upgrade() else {
                            break;
                        };
                        if let Some(inbound) = target.route_target_message(text.as_str())
                            && inbound_tx.send(inbound).is_err()
                        {
                            break;
                        }
                    }

                    Some(Ok(Message::Close(_))) => {
                        debug!(url = %url, "Socket closed by device");
                        break;
                    }

                    Some(Err(e)) => {
                        error!(url = %url, error = %e, "Device socket error");
                        break;
                    }

                    None => {
                        debug!(url = %url, "Device stream ended");
                        break;
                    }

                    // Ignore Binary, Ping, Pong
                    _ => {}
                }
            }

            // Frames from the relay
            command = command_rx.recv() => {
                match command {
                    Some(LinkCommand::Send(raw)) => {
                        trace!(url = %url, "Frame sent to device");
                        if let Err(e) = ws_write.send(Message::Text(raw.into())).await {
                            warn!(url = %url, error = %e, "Failed to write to device");
                            break;
                        }
                    }

                    Some(LinkCommand::Close) => {
                        debug!(url = %url, "Close requested");
                        let _ = ws_write.close().await;
                        break;
                    }

                    None => {
                        debug!(url = %url, "Target dropped");
                        let _ = ws_write.close().await;
                        break;
                    }
                }
            }
        }
    }

    finish(&mut command_rx, &target, generation);

    debug!(url = %url, "Device event loop terminated");
}

/// Runs filter chains for device frames, one at a time.
async fn run_dispatcher(mut inbound_rx: mpsc::UnboundedReceiver<Inbound>, target: Weak<Target>) {
    while let Some(inbound) = inbound_rx.recv().await {
        let Some(target) = target.upgrade() else {
            break;
        };
        target.dispatch_to_tools(inbound).await;
    }
}

/// Marks the link closed and notifies the target.
fn finish(
    command_rx: &mut mpsc::UnboundedReceiver<LinkCommand>,
    target: &Weak<Target>,
    generation: u64,
) {
    command_rx.close();

    if let Some(target) = target.upgrade() {
        target.on_device_closed(generation);
    }
}

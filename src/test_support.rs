//! Loopback doubles for socket-level tests.
//!
//! | Double | Plays |
//! |--------|-------|
//! | [`FakeDevice`] | A WebKit inspector WebSocket endpoint |
//! | [`FakeDiscovery`] | A `/json` discovery HTTP endpoint |

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;

use crate::protocol::TargetInfo;
use crate::target::{Target, ToolSocket};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound for any single wait in tests.
pub(crate) const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// FakeDevice
// ============================================================================

enum DeviceCommand {
    Text(String),
    Close,
}

/// WebSocket server standing in for a device inspector.
///
/// Every accepted connection becomes the current one; frames written with
/// [`FakeDevice::send`] go to it and frames it receives are collected in
/// one queue.
pub(crate) struct FakeDevice {
    url: String,
    received: mpsc::UnboundedReceiver<String>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<DeviceCommand>>>>,
    connections: Arc<AtomicUsize>,
}

impl FakeDevice {
    /// Binds on a random loopback port and starts accepting.
    pub(crate) async fn start() -> Self {
        init_logging();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let (received_tx, received) = mpsc::unbounded_channel();
        let current = Arc::new(Mutex::new(None));
        let connections = Arc::new(AtomicUsize::new(0));

        let current_clone = Arc::clone(&current);
        let connections_clone = Arc::clone(&connections);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };

                let (command_tx, mut command_rx) = mpsc::unbounded_channel();
                *current_clone.lock() = Some(command_tx);
                connections_clone.fetch_add(1, Ordering::SeqCst);

                let received_tx = received_tx.clone();
                tokio::spawn(async move {
                    let (mut write, mut read) = ws.split();
                    loop {
                        tokio::select! {
                            frame = read.next() => match frame {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = received_tx.send(text.as_str().to_owned());
                                }
                                Some(Ok(_)) => {}
                                _ => break,
                            },
                            command = command_rx.recv() => match command {
                                Some(DeviceCommand::Text(text)) => {
                                    if write.send(Message::Text(text.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Some(DeviceCommand::Close) | None => {
                                    let _ = write.close().await;
                                    break;
                                }
                            },
                        }
                    }
                });
            }
        });

        Self {
            url: format!("ws://127.0.0.1:{port}/devtools/page/1"),
            received,
            current,
            connections,
        }
    }

    /// Debugger URL of the fake page.
    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    /// Number of accepted connections so far.
    pub(crate) fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Sends a frame on the current connection.
    pub(crate) fn send(&self, frame: &Value) {
        if let Some(tx) = self.current.lock().as_ref() {
            let _ = tx.send(DeviceCommand::Text(frame.to_string()));
        }
    }

    /// Closes the current connection.
    pub(crate) fn close(&self) {
        if let Some(tx) = self.current.lock().take() {
            let _ = tx.send(DeviceCommand::Close);
        }
    }

    /// Next frame received from the adapter.
    pub(crate) async fn recv(&mut self) -> Value {
        let raw = timeout(WAIT, self.received.recv())
            .await
            .expect("device frame in time")
            .expect("device queue open");
        serde_json::from_str(&raw).expect("device frame is json")
    }

    /// Returns `true` if no frame arrives within `window`.
    pub(crate) async fn is_quiet(&mut self, window: Duration) -> bool {
        !matches!(timeout(window, self.received.recv()).await, Ok(Some(_)))
    }
}

// ============================================================================
// FakeDiscovery
// ============================================================================

/// Minimal HTTP responder serving fixed JSON bodies by path.
pub(crate) struct FakeDiscovery {
    port: u16,
    routes: Arc<Mutex<FxHashMap<String, String>>>,
}

impl FakeDiscovery {
    /// Binds on a random loopback port and starts serving.
    pub(crate) async fn start() -> Self {
        init_logging();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let routes: Arc<Mutex<FxHashMap<String, String>>> = Arc::default();

        let routes_clone = Arc::clone(&routes);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let routes = Arc::clone(&routes_clone);
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&chunk[..n]),
                        }
                    }

                    let head = String::from_utf8_lossy(&request);
                    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let body = routes.lock().get(&path).cloned();

                    let response = match body {
                        Some(body) => format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        ),
                        None => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                            .to_string(),
                    };

                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self { port, routes }
    }

    /// Port the responder listens on.
    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Serves `body` for `path`.
    pub(crate) fn route(&self, path: &str, body: &Value) {
        self.routes.lock().insert(path.to_string(), body.to_string());
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Routes crate logs to the test writer; `RUST_LOG` overrides the level.
pub(crate) fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ios_webkit_adapter=warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

/// Polls `condition` until it holds or [`WAIT`] elapses.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Next frame written to a tool socket.
pub(crate) async fn next_tool_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
    let raw = timeout(WAIT, rx.recv())
        .await
        .expect("tool frame in time")
        .expect("tool queue open");
    serde_json::from_str(&raw).expect("tool frame is json")
}

/// Returns `true` if the tool socket stays silent for `window`.
pub(crate) async fn tool_is_quiet(
    rx: &mut mpsc::UnboundedReceiver<String>,
    window: Duration,
) -> bool {
    !matches!(timeout(window, rx.recv()).await, Ok(Some(_)))
}

/// Creates a target connected to `device` and waits until it is open.
pub(crate) async fn connected_target(
    device: &FakeDevice,
) -> (Arc<Target>, mpsc::UnboundedReceiver<String>) {
    let target = Target::new("page/1", TargetInfo::default());
    let (tools, rx) = ToolSocket::channel();
    target.connect_to(device.url(), tools).expect("connect");
    assert!(wait_until(|| target.is_connected()).await, "device open");
    (target, rx)
}

/// Runs a future to completion with [`WAIT`] as the limit.
pub(crate) async fn within<F: Future>(future: F) -> F::Output {
    timeout(WAIT, future).await.expect("completed in time")
}

//! Tool-facing WebSocket server.
//!
//! DevTools front ends connect to `ws://127.0.0.1:{port}/{adapter}/{target}`.
//! The path is captured during the handshake and handed to the root
//! adapter, which wires the socket to the matching [`Target`].
//!
//! # Connection Flow
//!
//! 1. `ProxyServer` binds to `localhost:{port}` and builds the root adapter
//!    around its own `ws://` URL
//! 2. Discovery records hand out `ws://127.0.0.1:{port}/{adapter}/{target}`
//! 3. A tool connects; `connect_to(path, ToolSocket)` attaches the target
//! 4. Tool frames go through `forward_to(path, frame)`; target frames come
//!    back through the [`ToolSocket`]
//!
//! [`Target`]: crate::target::Target

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, error, info, trace, warn};

use crate::adapter::{Adapter, Connectable, IosAdapter, IosProxySettings, Lifecycle, ProxyArgs};
use crate::error::Result;
use crate::identifiers::ClientId;
use crate::target::ToolSocket;

// ============================================================================
// Constants
// ============================================================================

/// Default bind address (localhost).
const DEFAULT_BIND_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Accept poll interval, bounding how long shutdown takes to notice.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Id of the root iOS adapter.
pub const IOS_ADAPTER_ID: &str = "/ios";

// ============================================================================
// ProxyServer
// ============================================================================

/// Accepts tool WebSocket connections and bridges them to targets.
///
/// # Example
///
/// ```ignore
/// use ios_webkit_adapter::adapter::{Discoverable, ProxyArgs};
/// use ios_webkit_adapter::transport::ProxyServer;
///
/// let server = ProxyServer::run_ios(9000, ProxyArgs::default()).await?;
/// let targets = server.adapter().get_targets(Default::default()).await;
/// ```
pub struct ProxyServer {
    /// Bound port.
    port: u16,

    /// Root adapter.
    adapter: Arc<dyn Adapter>,

    /// Connected tool clients and the path each asked for.
    clients: RwLock<FxHashMap<ClientId, String>>,

    /// Shutdown flag.
    shutdown: AtomicBool,
}

// ============================================================================
// ProxyServer - Constructor
// ============================================================================

impl ProxyServer {
    /// Binds to `localhost:0` and starts accepting.
    ///
    /// `make_adapter` receives the server's `ws://` URL and returns the root
    /// adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if binding fails, or whatever `make_adapter`
    /// returns.
    pub async fn new<F>(make_adapter: F) -> Result<Arc<Self>>
    where
        F: FnOnce(&str) -> Result<Arc<dyn Adapter>>,
    {
        Self::with_ip_port(DEFAULT_BIND_IP, 0, make_adapter).await
    }

    /// Binds to `ip:port` (0 for random) and starts accepting.
    ///
    /// # Errors
    ///
    /// Same as [`ProxyServer::new`].
    pub async fn with_ip_port<F>(ip: IpAddr, port: u16, make_adapter: F) -> Result<Arc<Self>>
    where
        F: FnOnce(&str) -> Result<Arc<dyn Adapter>>,
    {
        let listener = TcpListener::bind(SocketAddr::new(ip, port)).await?;
        let actual_port = listener.local_addr()?.port();

        debug!(port = actual_port, "Proxy server bound");

        let adapter = make_adapter(&ws_url_for(actual_port))?;

        let server = Arc::new(Self {
            port: actual_port,
            adapter,
            clients: RwLock::new(FxHashMap::default()),
            shutdown: AtomicBool::new(false),
        });

        let server_clone = Arc::clone(&server);
        tokio::spawn(async move {
            server_clone.accept_loop(listener).await;
        });

        info!(port = actual_port, adapter = %server.adapter.id(), "Proxy server started");

        Ok(server)
    }

    /// Binds on `port`, creates the iOS adapter and starts the device proxy.
    ///
    /// # Errors
    ///
    /// - [`Error::ExecutableNotFound`](crate::Error::ExecutableNotFound) if `ios_webkit_debug_proxy` is missing
    /// - [`Error::ProcessLaunchFailed`](crate::Error::ProcessLaunchFailed) if it does not start
    /// - [`Error::Io`](crate::Error::Io) if binding fails
    pub async fn run_ios(port: u16, args: ProxyArgs) -> Result<Arc<Self>> {
        let settings = IosProxySettings::resolve(args)?;

        let server = Self::with_ip_port(DEFAULT_BIND_IP, port, |proxy_url| {
            let adapter = IosAdapter::new(IOS_ADAPTER_ID, proxy_url, settings)?;
            Ok(Arc::new(adapter) as Arc<dyn Adapter>)
        })
        .await?;

        server.adapter.start().await?;
        Ok(server)
    }
}

// ============================================================================
// ProxyServer - Public API
// ============================================================================

impl ProxyServer {
    /// Returns the WebSocket URL for this server.
    ///
    /// Format: `ws://127.0.0.1:{port}`
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        ws_url_for(self.port)
    }

    /// Returns the port the server is bound to.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Root adapter.
    #[inline]
    #[must_use]
    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    /// Returns the number of connected tool clients.
    #[inline]
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Stops accepting and stops the adapter's helper processes.
    pub async fn shutdown(&self) {
        info!("Proxy server shutting down");

        self.shutdown.store(true, Ordering::SeqCst);
        self.adapter.stop().await;

        info!("Proxy server shutdown complete");
    }
}

fn ws_url_for(port: u16) -> String {
    format!("ws://127.0.0.1:{port}")
}

// ============================================================================
// ProxyServer - Accept Loop
// ============================================================================

impl ProxyServer {
    /// Background task that accepts new connections.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!("Accept loop started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                debug!("Accept loop shutting down");
                break;
            }

            match timeout(ACCEPT_POLL, listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr).await {
                            warn!(error = %e, ?addr, "Connection handling failed");
                        }
                    });
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                }
                Err(_) => continue,
            }
        }

        debug!("Accept loop terminated");
    }

    /// Bridges one tool connection until either side goes away.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!(?addr, "New TCP connection");

        let mut path = String::new();
        let capture_path =
            |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
                path = request.uri().path().to_string();
                Ok(response)
            };
        let ws_stream = accept_hdr_async(stream, capture_path).await?;

        info!(?addr, path = %path, "New websocket connection");

        let (mut sink, mut source) = ws_stream.split();
        let (tools, mut outbound) = ToolSocket::channel();

        if let Err(e) = self.adapter.connect_to(&path, tools) {
            warn!(path = %path, error = %e, "No target for connection");
            let _ = sink.send(Message::Close(None)).await;
            return Err(e);
        }

        let client_id = ClientId::generate();
        self.clients.write().insert(client_id, path.clone());

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!(error = %e, "Tool socket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    trace!(path = %path, "Frame from tools");
                    self.adapter.forward_to(&path, text.as_str()).await;
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Binary(_)) => debug!(path = %path, "Ignoring binary frame"),
                Ok(_) => {}
                Err(e) => {
                    debug!(path = %path, error = %e, "Tool socket read failed");
                    break;
                }
            }
        }

        writer.abort();
        self.clients.write().remove(&client_id);
        info!(?addr, path = %path, "Tool connection closed");

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::{Value, json};
    use tokio::io::AsyncWriteExt;
    use tokio_tungstenite::connect_async;

    use crate::adapter::{AdapterCollection, AdapterOptions, DeviceAdapter, Discoverable, Metadata};
    use crate::error::Error;
    use crate::test_support::{FakeDevice, FakeDiscovery, WAIT, wait_until};

    async fn server_for(discovery: &FakeDiscovery) -> Arc<ProxyServer> {
        let port = discovery.port();
        ProxyServer::new(move |proxy_url| {
            let collection = AdapterCollection::new("/test", proxy_url, AdapterOptions::new())?;
            let device = DeviceAdapter::new("/test/dev", proxy_url, AdapterOptions::new().with_port(port))?;
            collection.add(Arc::new(device));
            Ok(Arc::new(collection) as Arc<dyn Adapter>)
        })
        .await
        .expect("server")
    }

    #[tokio::test]
    async fn test_server_ws_url_format() {
        let discovery = FakeDiscovery::start().await;
        let server = server_for(&discovery).await;

        assert!(server.port() > 0);
        assert_eq!(server.ws_url(), format!("ws://127.0.0.1:{}", server.port()));
        assert_eq!(server.client_count(), 0);
        assert_eq!(server.adapter().id(), "/test");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_tool_round_trip_through_server() {
        let mut device = FakeDevice::start().await;
        let discovery = FakeDiscovery::start().await;
        discovery.route("/json", &json!([{ "id": "page/1", "webSocketDebuggerUrl": device.url() }]));

        let server = server_for(&discovery).await;
        let targets = server.adapter().get_targets(Metadata::None).await;
        let url = targets[0].web_socket_debugger_url.clone();
        assert_eq!(url, format!("{}/test/dev/page/1", server.ws_url()));

        let (mut client, _) = connect_async(url.as_str()).await.expect("client connect");
        assert!(wait_until(|| server.client_count() == 1 && device.connections() == 1).await);

        client
            .send(Message::Text(r#"{"id":1,"method":"Page.reload"}"#.into()))
            .await
            .expect("send");
        assert_eq!(device.recv().await["method"], "Page.reload");

        device.send(&json!({ "id": 1, "result": {} }));
        let reply = timeout(WAIT, client.next())
            .await
            .expect("reply in time")
            .expect("stream open")
            .expect("frame");
        let reply: Value = match reply {
            Message::Text(text) => serde_json::from_str(text.as_str()).expect("json"),
            other => panic!("unexpected frame {other:?}"),
        };
        assert_eq!(reply, json!({ "id": 1, "result": {} }));

        client.close(None).await.expect("close");
        assert!(wait_until(|| server.client_count() == 0).await);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_path_is_closed() {
        let discovery = FakeDiscovery::start().await;
        let server = server_for(&discovery).await;

        let (mut client, _) = connect_async(format!("{}/test/dev/missing", server.ws_url()).as_str())
            .await
            .expect("client connect");

        let next = timeout(WAIT, client.next()).await.expect("closed in time");
        assert!(matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
        assert_eq!(server.client_count(), 0);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_plain_http_request_fails_upgrade() {
        let discovery = FakeDiscovery::start().await;
        let server = server_for(&discovery).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let mut client = TcpStream::connect(addr).await.expect("connect");
        client
            .write_all(b"GET /json HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .expect("write");
        let (stream, peer) = listener.accept().await.expect("accept");

        let result = server.handle_connection(stream, peer).await;
        assert!(matches!(result, Err(Error::WebSocket(_))));

        server.shutdown().await;
    }
}

//! Target relay and correlation engine.
//!
//! A [`Target`] sits between one tool-side socket and one device-side
//! connection. Every frame in either direction runs through the filter
//! table; replies are routed by id through two correlation maps:
//!
//! | Map | Key | Value | Populated by |
//! |-----|-----|-------|--------------|
//! | tool requests | tool-chosen id (≥ 0) | requested method | [`Target::forward`] |
//! | adapter requests | allocated id (< 0) | pending result | [`Target::call_target`] |

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{RequestId, RequestIdAllocator};
use crate::protocol::{TargetInfo, envelope, message};

use super::filter::{FilterKey, FilterTable, Filtered, MessageFilter, filter_fn};
use super::link::DeviceLink;
use super::socket::ToolSocket;

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for adapter-initiated calls.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Types
// ============================================================================

/// Map of adapter-issued request ids to result channels.
type PendingCalls = FxHashMap<RequestId, oneshot::Sender<Result<Value>>>;

/// Callback invoked with the target id when the device side is gone.
pub type SocketClosedHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// A device frame waiting for its filter chain.
#[derive(Debug)]
pub(crate) struct Inbound {
    key: FilterKey,
    msg: Value,
    raw: String,
}

/// Connection state guarded by one lock.
#[derive(Default)]
struct TargetState {
    /// Device URL of the last `connect_to`.
    url: Option<String>,
    /// Current tool-side socket.
    tools: Option<ToolSocket>,
    /// Current device link; `None` before the first connect or after a
    /// failed send.
    device: Option<DeviceLink>,
    /// Set once the device socket is open and the buffer is drained.
    is_connected: bool,
    /// Tool frames waiting for the device socket to open.
    buffer: VecDeque<String>,
    /// Incremented per device link.
    generation: u64,
}

// ============================================================================
// Target
// ============================================================================

/// One debuggable page and its bidirectional relay state.
///
/// Created by an adapter, shared as `Arc<Target>`.
pub struct Target {
    id: String,
    data: TargetInfo,
    state: Mutex<TargetState>,
    filters: RwLock<FilterTable>,
    tool_requests: Mutex<FxHashMap<RequestId, String>>,
    adapter_requests: Mutex<PendingCalls>,
    request_ids: RequestIdAllocator,
    target_based: AtomicBool,
    inner_target_id: Mutex<Option<String>>,
    socket_closed: Mutex<Option<SocketClosedHandler>>,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.id)
            .field("target_based", &self.is_target_based())
            .field("is_connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Target - Constructor & Accessors
// ============================================================================

impl Target {
    /// Creates an unconnected target.
    #[must_use]
    pub fn new(id: impl Into<String>, data: TargetInfo) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            data,
            state: Mutex::new(TargetState::default()),
            filters: RwLock::new(FilterTable::default()),
            tool_requests: Mutex::new(FxHashMap::default()),
            adapter_requests: Mutex::new(PendingCalls::default()),
            request_ids: RequestIdAllocator::new(),
            target_based: AtomicBool::new(false),
            inner_target_id: Mutex::new(None),
            socket_closed: Mutex::new(None),
        })
    }

    /// Target id, relative to the owning adapter.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Discovery record the target was created from.
    #[inline]
    #[must_use]
    pub fn data(&self) -> &TargetInfo {
        &self.data
    }

    /// Returns `true` once the device socket is open and buffered frames
    /// have been replayed.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.lock().is_connected
    }

    /// Number of tool frames waiting for the device socket.
    #[inline]
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Number of adapter-issued calls awaiting a reply.
    #[inline]
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.adapter_requests.lock().len()
    }

    /// Switches the `Target.*` envelope on or off.
    #[inline]
    pub fn set_target_based(&self, enabled: bool) {
        self.target_based.store(enabled, Ordering::Release);
    }

    /// Returns `true` if outbound frames are enveloped.
    #[inline]
    #[must_use]
    pub fn is_target_based(&self) -> bool {
        self.target_based.load(Ordering::Acquire)
    }

    /// Sets the inspector-internal target id used by the envelope.
    #[inline]
    pub fn set_inner_target_id(&self, target_id: impl Into<String>) {
        *self.inner_target_id.lock() = Some(target_id.into());
    }

    /// Inspector-internal target id, once announced.
    #[inline]
    #[must_use]
    pub fn inner_target_id(&self) -> Option<String> {
        self.inner_target_id.lock().clone()
    }

    /// Installs the callback fired when a device send finds the socket gone.
    pub fn set_socket_closed_handler(&self, handler: SocketClosedHandler) {
        *self.socket_closed.lock() = Some(handler);
    }
}

// ============================================================================
// Target - Connection Lifecycle
// ============================================================================

impl Target {
    /// Opens the device-side connection and attaches the tool socket.
    ///
    /// Tool frames forwarded before the device socket opens are buffered and
    /// replayed in order once it does.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyConnected`] if a device link already exists.
    pub fn connect_to(self: &Arc<Self>, url: &str, tools: ToolSocket) -> Result<()> {
        let mut state = self.state.lock();

        if state.device.is_some() {
            error!(target_id = %self.id, "Already connected");
            return Err(Error::already_connected(&self.id));
        }

        state.generation += 1;
        let generation = state.generation;

        state.url = Some(url.to_string());
        state.tools = Some(tools);
        state.is_connected = false;
        state.device = Some(DeviceLink::spawn(
            url.to_string(),
            Arc::downgrade(self),
            generation,
        ));

        debug!(target_id = %self.id, url, "Connecting to device");
        Ok(())
    }

    /// Replaces the tool socket and reconnects the device side.
    ///
    /// The old device connection is closed and calls pending on it fail with
    /// [`Error::ConnectionClosed`]. Buffered frames are kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the target was never connected.
    pub fn update_client(self: &Arc<Self>, tools: ToolSocket) -> Result<()> {
        let url = {
            let mut state = self.state.lock();
            if let Some(link) = state.device.take() {
                link.close();
            }
            state.is_connected = false;
            state.url.clone()
        };

        self.fail_pending_calls();

        let url = url.ok_or_else(|| Error::connection("target has no device URL"))?;
        debug!(target_id = %self.id, "Tool client replaced");
        self.connect_to(&url, tools)
    }

    /// Relays one raw tool frame toward the device.
    ///
    /// Dropped with an error log if the target was never connected.
    pub async fn forward(self: &Arc<Self>, raw: &str) {
        {
            let mut state = self.state.lock();
            let buffering = match state.device.as_ref() {
                None => {
                    error!(target_id = %self.id, "No websocket endpoint found");
                    return;
                }
                Some(link) => !state.is_connected && link.is_open(),
            };

            if buffering {
                trace!(target_id = %self.id, "Connection not yet open, buffering message");
                state.buffer.push_back(raw.to_string());
                return;
            }
        }

        self.handle_tools_message(raw).await;
    }

    pub(crate) fn on_device_open(self: &Arc<Self>, generation: u64) {
        if self.state.lock().generation != generation {
            return;
        }

        let target = Arc::clone(self);
        tokio::spawn(async move {
            target.drain_buffer(generation).await;
        });
    }

    pub(crate) fn on_device_closed(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            let current = state.device.as_ref().map(DeviceLink::generation);
            if state.generation != generation || current != Some(generation) {
                return;
            }
            state.is_connected = false;
        }

        debug!(target_id = %self.id, "Socket is closed");
        self.fail_pending_calls();
    }

    /// Replays buffered frames, then marks the target connected.
    async fn drain_buffer(self: &Arc<Self>, generation: u64) {
        loop {
            let next = {
                let mut state = self.state.lock();
                if state.generation != generation {
                    return;
                }
                match state.buffer.pop_front() {
                    Some(raw) => raw,
                    None => {
                        state.is_connected = true;
                        debug!(target_id = %self.id, "Device connection ready");
                        return;
                    }
                }
            };

            self.handle_tools_message(&next).await;
        }
    }

    /// Fails every pending adapter call with [`Error::ConnectionClosed`].
    fn fail_pending_calls(&self) {
        let pending: Vec<_> = self.adapter_requests.lock().drain().collect();
        let count = pending.len();

        for (_, tx) in pending {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }

        if count > 0 {
            debug!(target_id = %self.id, count, "Failed pending calls");
        }
    }
}

// ============================================================================
// Target - Filters & Synthesized Traffic
// ============================================================================

impl Target {
    /// Appends an async closure to the chain for `key`.
    pub fn add_message_filter<F, Fut>(&self, key: FilterKey, filter: F)
    where
        F: Fn(Arc<Target>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Filtered>> + Send + 'static,
    {
        self.add_filter(key, filter_fn(filter));
    }

    /// Appends a filter object to the chain for `key`.
    pub fn add_filter(&self, key: FilterKey, filter: Arc<dyn MessageFilter>) {
        self.filters.write().add(key, filter);
    }

    /// Returns `true` if any filter is registered for `key`.
    #[inline]
    #[must_use]
    pub fn has_filter(&self, key: &FilterKey) -> bool {
        self.filters.read().contains(key)
    }

    /// Issues a call to the device and waits for its `result`.
    ///
    /// # Errors
    ///
    /// - [`Error::Remote`] if the device replied with an `error`
    /// - [`Error::ConnectionClosed`] if the device socket is gone or closes
    /// - [`Error::RequestTimeout`] after [`DEFAULT_CALL_TIMEOUT`]
    pub async fn call_target(&self, method: &str, params: Value) -> Result<Value> {
        self.call_target_with_timeout(method, params, DEFAULT_CALL_TIMEOUT)
            .await
    }

    /// Issues a call to the device with a custom timeout.
    ///
    /// # Errors
    ///
    /// Same as [`Target::call_target`].
    pub async fn call_target_with_timeout(
        &self,
        method: &str,
        params: Value,
        call_timeout: Duration,
    ) -> Result<Value> {
        let request_id = self.request_ids.next();
        let (tx, rx) = oneshot::channel();

        self.adapter_requests.lock().insert(request_id, tx);

        let request = message::request(request_id, method, params);
        if !self.send_to_device(request.to_string()) {
            self.adapter_requests.lock().remove(&request_id);
            return Err(Error::ConnectionClosed);
        }

        trace!(target_id = %self.id, method, %request_id, "callTarget");

        match timeout(call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.adapter_requests.lock().remove(&request_id);
                Err(Error::request_timeout(
                    request_id,
                    call_timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Sends an unsolicited event to the tools.
    pub fn fire_event_to_tools(&self, method: &str, params: Value) {
        self.send_to_tools(message::event(method, params).to_string());
    }

    /// Sends a reply to a tool request without involving the device.
    pub fn fire_result_to_tools(&self, id: RequestId, result: Value) {
        self.send_to_tools(message::result(id, result).to_string());
    }

    /// Sends a CDP error reply to a tool request.
    pub fn fire_error_to_tools(&self, id: RequestId, reason: &str) {
        self.send_to_tools(message::error_reply(id, reason).to_string());
    }

    /// Runs `work` in the background and answers tool request `id` with its
    /// outcome, or with a CDP error reply if it fails.
    pub fn reply_later<F>(self: &Arc<Self>, id: Option<RequestId>, work: F)
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        let target = Arc::clone(self);
        tokio::spawn(async move {
            match (work.await, id) {
                (Ok(result), Some(id)) => target.fire_result_to_tools(id, result),
                (Ok(_), None) => {}
                (Err(e), id) => {
                    warn!(target_id = %target.id, request_id = ?id, error = %e, "Device round trip failed");
                    if let Some(id) = id {
                        target.fire_error_to_tools(id, &e.to_string());
                    }
                }
            }
        });
    }

    /// Issues a call whose result nobody waits for.
    pub fn spawn_call(self: &Arc<Self>, method: &'static str, params: Value) {
        let target = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = target.call_target(method, params).await {
                debug!(target_id = %target.id, method, error = %e, "Background call failed");
            }
        });
    }

    /// Answers `msg` with an empty result and absorbs it.
    pub fn reply_with_empty(&self, msg: &Value) -> Filtered {
        if let Some(id) = message::request_id(msg) {
            self.fire_result_to_tools(id, json!({}));
        }
        Filtered::Drop
    }
}

// ============================================================================
// Target - Message Handling
// ============================================================================

impl Target {
    /// Tools → device.
    pub(crate) async fn handle_tools_message(self: &Arc<Self>, raw: &str) {
        let msg = match message::parse(raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(target_id = %self.id, error = %e, "Unparsable message from tools");
                return;
            }
        };

        let method = message::method(&msg).to_string();
        if let Some(id) = message::request_id(&msg) {
            self.tool_requests.lock().insert(id, method.clone());
        }

        trace!(target_id = %self.id, method = %method, "Message from tools");

        let key = FilterKey::Tools(method);
        let chain = self.filters.read().chain(&key);

        match chain {
            Some(chain) => {
                if let Some(filtered) = chain.apply(self, msg).await {
                    self.send_to_device(filtered.to_string());
                }
            }
            None => {
                self.send_to_device(raw.to_string());
            }
        }
    }

    /// Device → tools, first stage.
    ///
    /// Parses the frame, strips the `Target.*` envelope and settles replies
    /// to adapter-issued calls on the spot. Returns the frame still owed to
    /// the tools, to be passed to [`Target::dispatch_to_tools`] in arrival
    /// order.
    pub(crate) fn route_target_message(&self, raw: &str) -> Option<Inbound> {
        let mut msg = match message::parse(raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(target_id = %self.id, error = %e, "Unparsable message from target");
                return None;
            }
        };
        let mut raw = raw.to_string();

        if self.is_target_based() {
            let method = message::method(&msg);
            if !envelope::is_target_domain(method) {
                return None;
            }
            if method == envelope::DISPATCH_MESSAGE_FROM_TARGET {
                match envelope::unwrap(&msg) {
                    Ok((inner, inner_raw)) => {
                        msg = inner;
                        raw = inner_raw;
                    }
                    Err(e) => {
                        warn!(target_id = %self.id, error = %e, "Malformed envelope");
                        return None;
                    }
                }
            }
        }

        if !message::has_id(&msg) {
            let key = FilterKey::target(message::method(&msg));
            return Some(Inbound { key, msg, raw });
        }

        let request_id = message::request_id(&msg);

        let tool_method = request_id.and_then(|id| self.tool_requests.lock().remove(&id));
        if let Some(method) = tool_method {
            let key = if message::is_error(&msg) && self.has_filter(&FilterKey::TargetError) {
                FilterKey::TargetError
            } else {
                FilterKey::Target(method)
            };
            return Some(Inbound { key, msg, raw });
        }

        let pending = request_id.and_then(|id| self.adapter_requests.lock().remove(&id));
        if let Some(tx) = pending {
            let outcome = if let Some(result) = msg.get("result") {
                Ok(result.clone())
            } else if let Some(error) = msg.get("error") {
                Err(Error::remote(error.clone()))
            } else {
                error!(target_id = %self.id, raw = %raw, "Unhandled type of request message from target");
                Err(Error::protocol("reply carries neither result nor error"))
            };
            let _ = tx.send(outcome);
            return None;
        }

        error!(target_id = %self.id, raw = %raw, "Unhandled message from target");
        None
    }

    /// Device → tools, second stage: runs the chain and relays the outcome.
    pub(crate) async fn dispatch_to_tools(self: &Arc<Self>, inbound: Inbound) {
        let Inbound { key, msg, raw } = inbound;
        let chain = self.filters.read().chain(&key);

        match chain {
            Some(chain) => {
                if let Some(filtered) = chain.apply(self, msg).await {
                    self.send_to_tools(filtered.to_string());
                }
            }
            None => self.send_to_tools(raw),
        }
    }

    fn send_to_tools(&self, raw: String) {
        let tools = self.state.lock().tools.clone();

        match tools {
            Some(tools) if tools.is_open() => {
                trace!(target_id = %self.id, "sendToTools");
                tools.send(raw);
            }
            _ => trace!(target_id = %self.id, "Tool socket not open, frame dropped"),
        }
    }

    /// Writes a frame to the device, enveloping it in target-based mode.
    ///
    /// Returns `false` and raises the socket-closed notification if the
    /// device socket is gone.
    fn send_to_device(&self, raw: String) -> bool {
        let mut raw = raw;

        if self.is_target_based() {
            match message::parse(&raw) {
                Ok(msg) => {
                    let inner_target_id = self.inner_target_id();
                    if let Some(wrapped) = envelope::wrap(&msg, &raw, inner_target_id.as_deref()) {
                        raw = wrapped;
                    }
                }
                Err(e) => warn!(target_id = %self.id, error = %e, "Cannot envelope frame"),
            }
        }

        let link = self.state.lock().device.clone();
        if let Some(link) = link
            && link.is_open()
            && link.send(raw)
        {
            return true;
        }

        self.on_send_failed();
        false
    }

    fn on_send_failed(&self) {
        {
            let mut state = self.state.lock();
            state.device = None;
            state.is_connected = false;
        }

        warn!(target_id = %self.id, "Device socket closed");

        let handler = self.socket_closed.lock().clone();
        if let Some(handler) = handler {
            handler(&self.id);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use crate::test_support::{
        FakeDevice, connected_target, next_tool_frame, tool_is_quiet, wait_until, within,
    };

    const QUIET: Duration = Duration::from_millis(150);

    #[tokio::test]
    async fn test_buffered_frames_replay_in_order() {
        let mut device = FakeDevice::start().await;
        let target = Target::new("page/1", TargetInfo::default());
        let (tools, _rx) = ToolSocket::channel();

        target.connect_to(device.url(), tools).expect("connect");
        for id in 1..=5 {
            target
                .forward(&json!({ "id": id, "method": "Runtime.enable" }).to_string())
                .await;
        }

        for id in 1..=5 {
            assert_eq!(device.recv().await["id"], id);
        }
        assert!(wait_until(|| target.is_connected()).await);
        assert_eq!(target.buffered_len(), 0);
    }

    #[tokio::test]
    async fn test_forward_without_connection_is_dropped() {
        let target = Target::new("page/1", TargetInfo::default());
        target.forward(r#"{"id":1,"method":"Page.enable"}"#).await;
        assert_eq!(target.buffered_len(), 0);
        assert!(!target.is_connected());
    }

    #[tokio::test]
    async fn test_second_connect_is_rejected() {
        let device = FakeDevice::start().await;
        let (target, _rx) = connected_target(&device).await;
        let (tools, _rx2) = ToolSocket::channel();

        let err = target.connect_to(device.url(), tools).unwrap_err();
        assert!(matches!(err, Error::AlreadyConnected { .. }));
    }

    #[tokio::test]
    async fn test_passthrough_both_directions() {
        let mut device = FakeDevice::start().await;
        let (target, mut rx) = connected_target(&device).await;

        target.forward(r#"{"id":7,"method":"Page.reload","params":{}}"#).await;
        let sent = device.recv().await;
        assert_eq!(sent["method"], "Page.reload");

        device.send(&json!({ "id": 7, "result": { "ok": true } }));
        let reply = next_tool_frame(&mut rx).await;
        assert_eq!(reply["result"]["ok"], true);

        device.send(&json!({ "method": "Page.loadEventFired", "params": {} }));
        let event = next_tool_frame(&mut rx).await;
        assert_eq!(event["method"], "Page.loadEventFired");
    }

    #[tokio::test]
    async fn test_call_target_ids_decrease() {
        let mut device = FakeDevice::start().await;
        let (target, _rx) = connected_target(&device).await;

        let first = {
            let target = Arc::clone(&target);
            tokio::spawn(async move { target.call_target("DOM.getDocument", json!({})).await })
        };
        let request = device.recv().await;
        assert_eq!(request["id"], -1);
        assert_eq!(request["method"], "DOM.getDocument");

        let second = {
            let target = Arc::clone(&target);
            tokio::spawn(async move { target.call_target("CSS.enable", json!({})).await })
        };
        let request = device.recv().await;
        assert_eq!(request["id"], -2);

        device.send(&json!({ "id": -2, "error": { "message": "nope" } }));
        device.send(&json!({ "id": -1, "result": { "root": 1 } }));

        let first = within(first).await.expect("join").expect("result");
        assert_eq!(first, json!({ "root": 1 }));

        let second = within(second).await.expect("join");
        assert!(matches!(second, Err(Error::Remote { .. })));
        assert_eq!(target.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_call_target_timeout_removes_entry() {
        let mut device = FakeDevice::start().await;
        let (target, _rx) = connected_target(&device).await;

        let result = target
            .call_target_with_timeout("Page.enable", json!({}), Duration::from_millis(50))
            .await;
        let _ = device.recv().await;

        assert!(result.is_err_and(|e| e.is_timeout()));
        assert_eq!(target.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_tools_filter_drop_sends_nothing() {
        let mut device = FakeDevice::start().await;
        let (target, mut rx) = connected_target(&device).await;

        target.add_message_filter(
            FilterKey::tools("CSS.getPlatformFontsForNode"),
            |t: Arc<Target>, msg: Value| async move { Ok(t.reply_with_empty(&msg)) },
        );

        target
            .forward(r#"{"id":3,"method":"CSS.getPlatformFontsForNode","params":{}}"#)
            .await;

        let reply = next_tool_frame(&mut rx).await;
        assert_eq!(reply, json!({ "id": 3, "result": {} }));
        assert!(device.is_quiet(QUIET).await);
    }

    #[tokio::test]
    async fn test_reply_routed_by_request_method() {
        let mut device = FakeDevice::start().await;
        let (target, mut rx) = connected_target(&device).await;

        target.add_message_filter(
            FilterKey::target("DOM.getDocument"),
            |_t: Arc<Target>, mut msg: Value| async move {
                msg["result"]["seen"] = json!(true);
                Ok(Filtered::Forward(msg))
            },
        );

        target.forward(r#"{"id":1,"method":"DOM.getDocument"}"#).await;
        let _ = device.recv().await;
        device.send(&json!({ "id": 1, "result": {} }));

        let reply = next_tool_frame(&mut rx).await;
        assert_eq!(reply["result"]["seen"], true);
    }

    #[tokio::test]
    async fn test_target_filter_can_call_device() {
        let mut device = FakeDevice::start().await;
        let (target, mut rx) = connected_target(&device).await;

        target.add_message_filter(
            FilterKey::target("Page.loadEventFired"),
            |t: Arc<Target>, mut msg: Value| async move {
                let document = t
                    .call_target_with_timeout("DOM.getDocument", json!({}), Duration::from_secs(5))
                    .await?;
                msg["params"]["root"] = document["root"].clone();
                Ok(Filtered::Forward(msg))
            },
        );

        device.send(&json!({ "method": "Page.loadEventFired", "params": {} }));
        let request = device.recv().await;
        assert_eq!(request["id"], -1);
        assert_eq!(request["method"], "DOM.getDocument");

        // Queued behind the filtered event.
        device.send(&json!({ "method": "Page.frameNavigated", "params": {} }));
        device.send(&json!({ "id": -1, "result": { "root": 1 } }));

        let first = next_tool_frame(&mut rx).await;
        assert_eq!(first["method"], "Page.loadEventFired");
        assert_eq!(first["params"]["root"], 1);

        let second = next_tool_frame(&mut rx).await;
        assert_eq!(second["method"], "Page.frameNavigated");
        assert_eq!(target.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_error_reply_uses_error_filter() {
        let mut device = FakeDevice::start().await;
        let (target, mut rx) = connected_target(&device).await;

        target.add_message_filter(
            FilterKey::TargetError,
            |_t: Arc<Target>, msg: Value| async move {
                Ok(Filtered::Forward(json!({ "id": msg["id"], "result": {} })))
            },
        );

        target.forward(r#"{"id":4,"method":"Page.setShowPaintRects"}"#).await;
        let _ = device.recv().await;
        device.send(&json!({ "id": 4, "error": { "code": -32601 } }));

        assert_eq!(next_tool_frame(&mut rx).await, json!({ "id": 4, "result": {} }));
    }

    #[tokio::test]
    async fn test_unmatched_reply_not_forwarded() {
        let device = FakeDevice::start().await;
        let (_target, mut rx) = connected_target(&device).await;

        device.send(&json!({ "id": 99, "result": {} }));
        device.send(&json!({ "method": "Inspector.detached", "params": {} }));

        let next = next_tool_frame(&mut rx).await;
        assert_eq!(next["method"], "Inspector.detached");
    }

    #[tokio::test]
    async fn test_target_based_envelope() {
        let mut device = FakeDevice::start().await;
        let (target, mut rx) = connected_target(&device).await;
        target.set_target_based(true);
        target.set_inner_target_id("page-9");

        target.forward(r#"{"id":2,"method":"Runtime.enable"}"#).await;
        let outer = device.recv().await;
        assert_eq!(outer["method"], envelope::SEND_MESSAGE_TO_TARGET);
        assert_eq!(outer["params"]["targetId"], "page-9");

        // Not in the Target domain, dropped.
        device.send(&json!({ "method": "Runtime.consoleAPICalled", "params": {} }));

        let inner = json!({ "id": 2, "result": {} });
        device.send(&json!({
            "method": envelope::DISPATCH_MESSAGE_FROM_TARGET,
            "params": { "targetId": "page-9", "message": inner.to_string() }
        }));

        assert_eq!(next_tool_frame(&mut rx).await, inner);
    }

    #[tokio::test]
    async fn test_device_close_fails_pending_and_notifies() {
        let mut device = FakeDevice::start().await;
        let (target, _rx) = connected_target(&device).await;

        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        target.set_socket_closed_handler(Arc::new(move |id: &str| {
            assert_eq!(id, "page/1");
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let call = {
            let target = Arc::clone(&target);
            tokio::spawn(async move { target.call_target("Page.enable", json!({})).await })
        };
        let _ = device.recv().await;
        device.close();

        let result = within(call).await.expect("join");
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert!(wait_until(|| !target.is_connected()).await);

        target.forward(r#"{"id":1,"method":"Page.enable"}"#).await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        // The link is gone; later frames are dropped outright.
        target.forward(r#"{"id":2,"method":"Page.enable"}"#).await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_update_client_reconnects() {
        let mut device = FakeDevice::start().await;
        let (target, mut old_rx) = connected_target(&device).await;

        let (tools, mut rx) = ToolSocket::channel();
        target.update_client(tools).expect("update");
        assert!(wait_until(|| device.connections() == 2 && target.is_connected()).await);

        target.forward(r#"{"id":5,"method":"DOM.enable"}"#).await;
        assert_eq!(device.recv().await["id"], 5);

        device.send(&json!({ "id": 5, "result": {} }));
        assert_eq!(next_tool_frame(&mut rx).await["id"], 5);
        assert!(tool_is_quiet(&mut old_rx, QUIET).await);
    }
}

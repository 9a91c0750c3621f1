//! Adapter for one discovery endpoint.
//!
//! A [`DeviceAdapter`] polls `{base_url}:{port}{path}`, remembers each
//! target's real debugger URL and hands out proxy-relative URLs instead, so
//! tools always talk to this process.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error};
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::{DeviceInfo, TargetInfo};
use crate::target::{SocketClosedHandler, Target, ToolSocket};

use super::options::AdapterOptions;
use super::process::ProxyProcess;
use super::{Adapter, Connectable, Discoverable, Lifecycle, Metadata, adapter_type};

// ============================================================================
// Constants
// ============================================================================

/// Hosted DevTools front end the rewritten records point at.
pub const DEVTOOLS_FRONTEND_BASE: &str = "https://chrome-devtools-frontend.appspot.com/serve_file/@fcea73228632975e052eb90fcf6cd1752d3b42b4/inspector.html?experiments=true&remoteFrontend=screencast";

/// Limit for one discovery request.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Target kind assumed when discovery omits it.
const DEFAULT_TARGET_TYPE: &str = "page";

// ============================================================================
// Types
// ============================================================================

/// Slot shared with targets so a handler set later still receives their
/// notifications.
pub(crate) type HandlerSlot = Arc<Mutex<Option<SocketClosedHandler>>>;

/// Builds a handler that raises whatever `slot` holds when called.
pub(crate) fn forward_to_slot(slot: &HandlerSlot) -> SocketClosedHandler {
    let slot = Arc::clone(slot);
    Arc::new(move |id: &str| {
        let handler = slot.lock().clone();
        if let Some(handler) = handler {
            handler(id);
        }
    })
}

// ============================================================================
// DeviceAdapter
// ============================================================================

/// Adapter for a single discovery endpoint.
pub struct DeviceAdapter {
    id: String,
    adapter_type: String,
    /// `ws://host:port` of the tool-facing server.
    proxy_url: String,
    options: AdapterOptions,
    discovery_url: Url,
    http: reqwest::Client,
    process: AsyncMutex<Option<ProxyProcess>>,
    /// Live targets by id.
    targets: Mutex<FxHashMap<String, Arc<Target>>>,
    /// Discovery records with their real debugger URLs.
    target_data: Mutex<FxHashMap<String, TargetInfo>>,
    socket_closed: HandlerSlot,
}

impl fmt::Debug for DeviceAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAdapter")
            .field("id", &self.id)
            .field("discovery_url", &self.discovery_url.as_str())
            .field("target_count", &self.targets.lock().len())
            .finish_non_exhaustive()
    }
}

impl DeviceAdapter {
    /// Creates an adapter.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the options do not form a valid URL
    /// - [`Error::Http`] if the HTTP client cannot be built
    pub fn new(
        id: impl Into<String>,
        proxy_url: impl Into<String>,
        options: AdapterOptions,
    ) -> Result<Self> {
        let id = id.into();
        let discovery_url = options.discovery_url()?;
        let http = reqwest::Client::builder()
            .no_proxy()
            .timeout(DISCOVERY_TIMEOUT)
            .build()?;

        Ok(Self {
            adapter_type: adapter_type(&id),
            id,
            proxy_url: proxy_url.into(),
            options,
            discovery_url,
            http,
            process: AsyncMutex::new(None),
            targets: Mutex::new(FxHashMap::default()),
            target_data: Mutex::new(FxHashMap::default()),
            socket_closed: Arc::new(Mutex::new(None)),
        })
    }

    /// Discovery endpoint.
    #[inline]
    #[must_use]
    pub fn discovery_url(&self) -> &Url {
        &self.discovery_url
    }

    /// Tag stamped on discovered records.
    #[inline]
    #[must_use]
    pub fn adapter_type(&self) -> &str {
        &self.adapter_type
    }

    /// Live target for `target_id`.
    #[must_use]
    pub fn target(&self, target_id: &str) -> Option<Arc<Target>> {
        self.targets.lock().get(target_id).cloned()
    }

    /// Number of live targets.
    #[must_use]
    pub fn target_count(&self) -> usize {
        self.targets.lock().len()
    }

    /// Proxy URL handed to wrapped adapters.
    #[inline]
    pub(crate) fn proxy_url(&self) -> &str {
        &self.proxy_url
    }

    /// Fetches the raw records from the discovery endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on transport or decoding failures.
    pub(crate) async fn fetch<T>(&self) -> Result<Vec<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = self
            .http
            .get(self.discovery_url.clone())
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<Vec<T>>().await?)
    }

    /// Stamps a raw record and swaps in the proxy-relative URLs.
    fn set_target_info(&self, mut info: TargetInfo, metadata: Option<DeviceInfo>) -> TargetInfo {
        if info.id.is_empty() {
            info.id = info.web_socket_debugger_url.clone();
        }

        info.adapter_type = self.adapter_type.clone();
        if info.target_type.is_empty() {
            info.target_type = DEFAULT_TARGET_TYPE.to_string();
        }
        info.metadata = metadata;

        self.target_data.lock().insert(info.id.clone(), info.clone());

        let relative = format!("{}/{}", self.id, info.id);
        let ws = self
            .proxy_url
            .strip_prefix("ws://")
            .unwrap_or(&self.proxy_url);

        info.web_socket_debugger_url = format!("{}{relative}", self.proxy_url);
        info.devtools_frontend_url = format!("{DEVTOOLS_FRONTEND_BASE}&ws={ws}{relative}");
        info
    }
}

// ============================================================================
// DeviceAdapter - Adapter
// ============================================================================

impl Adapter for DeviceAdapter {
    fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Discoverable for DeviceAdapter {
    async fn get_targets(&self, metadata: Metadata) -> Vec<TargetInfo> {
        debug!(adapter = %self.id, url = %self.discovery_url, "getTargets");

        let records = match self.fetch::<TargetInfo>().await {
            Ok(records) => records,
            Err(e) => {
                debug!(adapter = %self.id, error = %e, "Discovery failed");
                return Vec::new();
            }
        };

        let metadata = metadata.into_single();
        records
            .into_iter()
            .map(|record| self.set_target_info(record, metadata.clone()))
            .collect()
    }
}

#[async_trait]
impl Connectable for DeviceAdapter {
    fn connect_to(&self, target_id: &str, tools: ToolSocket) -> Result<Arc<Target>> {
        debug!(adapter = %self.id, target_id, "connectTo");

        let Some(data) = self.target_data.lock().get(target_id).cloned() else {
            error!(adapter = %self.id, target_id, "No endpoint url found");
            return Err(Error::target_not_found(target_id));
        };

        let existing = self.target(target_id);
        if let Some(target) = existing {
            debug!(adapter = %self.id, target_id, "Existing target found");
            target.update_client(tools)?;
            return Ok(target);
        }

        let url = data.web_socket_debugger_url.clone();
        let target = Target::new(target_id, data);
        target.set_socket_closed_handler(forward_to_slot(&self.socket_closed));
        target.connect_to(&url, tools)?;

        self.targets
            .lock()
            .insert(target_id.to_string(), Arc::clone(&target));

        Ok(target)
    }

    async fn forward_to(&self, target_id: &str, raw: &str) {
        let Some(target) = self.target(target_id) else {
            error!(adapter = %self.id, target_id, "No target found");
            return;
        };

        target.forward(raw).await;
    }

    fn set_socket_closed_handler(&self, handler: SocketClosedHandler) {
        *self.socket_closed.lock() = Some(handler);
    }
}

#[async_trait]
impl Lifecycle for DeviceAdapter {
    async fn start(&self) -> Result<()> {
        let Some(path) = self.options.proxy_exe_path.clone() else {
            debug!(adapter = %self.id, "No proxy executable, skipping spawn");
            return Ok(());
        };

        let mut process = self.process.lock().await;
        let process = process
            .get_or_insert_with(|| ProxyProcess::new(path, self.options.proxy_exe_args.clone()));
        process.start().await
    }

    async fn stop(&self) {
        if let Some(process) = self.process.lock().await.as_mut() {
            process.stop().await;
        }
    }

    async fn force_refresh(&self) -> Result<()> {
        let mut process = self.process.lock().await;
        if let Some(process) = process.as_mut()
            && process.is_running()
        {
            return process.refresh().await;
        }
        debug!(adapter = %self.id, "No running proxy process to refresh");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Prefix-routed set of adapters.
//!
//! An [`AdapterCollection`] owns sub-adapters whose ids form a prefix
//! namespace. A composite path such as `/ios/abc123/page/1` is routed to the
//! sub-adapter `/ios/abc123` with the relative target id `page/1`.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::protocol::TargetInfo;
use crate::target::{SocketClosedHandler, Target, ToolSocket};

use super::device::{DeviceAdapter, HandlerSlot, forward_to_slot};
use super::options::AdapterOptions;
use super::{Adapter, Connectable, Discoverable, Lifecycle, Metadata};

// ============================================================================
// AdapterCollection
// ============================================================================

/// Adapter that fans out to sub-adapters.
///
/// Its own endpoint is only used for the helper process; targets come from
/// the sub-adapters, in the order they were added.
pub struct AdapterCollection {
    base: DeviceAdapter,
    adapters: RwLock<Vec<Arc<dyn Adapter>>>,
    socket_closed: HandlerSlot,
}

impl fmt::Debug for AdapterCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.adapters.read().iter().map(|a| a.id().to_string()).collect();
        f.debug_struct("AdapterCollection")
            .field("id", &self.base.id())
            .field("adapters", &ids)
            .finish_non_exhaustive()
    }
}

impl AdapterCollection {
    /// Creates an empty collection.
    ///
    /// # Errors
    ///
    /// Same as [`DeviceAdapter::new`].
    pub fn new(
        id: impl Into<String>,
        proxy_url: impl Into<String>,
        options: AdapterOptions,
    ) -> Result<Self> {
        Ok(Self {
            base: DeviceAdapter::new(id, proxy_url, options)?,
            adapters: RwLock::new(Vec::new()),
            socket_closed: Arc::new(Mutex::new(None)),
        })
    }

    /// The collection's own endpoint.
    #[inline]
    #[must_use]
    pub fn base(&self) -> &DeviceAdapter {
        &self.base
    }

    /// Adds a sub-adapter unless one with the same id exists.
    ///
    /// Returns `true` if it was added.
    pub fn add(&self, adapter: Arc<dyn Adapter>) -> bool {
        let mut adapters = self.adapters.write();
        if adapters.iter().any(|a| a.id() == adapter.id()) {
            return false;
        }

        adapter.set_socket_closed_handler(forward_to_slot(&self.socket_closed));
        debug!(collection = %self.base.id(), adapter = %adapter.id(), "Adapter added");
        adapters.push(adapter);
        true
    }

    /// Returns `true` if a sub-adapter has `adapter_id`.
    #[must_use]
    pub fn contains(&self, adapter_id: &str) -> bool {
        self.adapters.read().iter().any(|a| a.id() == adapter_id)
    }

    /// Number of sub-adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.read().len()
    }

    /// Returns `true` if there are no sub-adapters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.read().is_empty()
    }

    /// Resolves a composite path to a sub-adapter and relative target id.
    ///
    /// The longest sub-adapter id followed by `/` wins. Paths that match no
    /// id are split at the first `/` after the leading one.
    #[must_use]
    pub fn route(&self, url: &str) -> Option<(Arc<dyn Adapter>, String)> {
        let adapters = self.adapters.read();

        let by_prefix = adapters
            .iter()
            .filter_map(|adapter| {
                let rest = url.strip_prefix(adapter.id())?.strip_prefix('/')?;
                Some((adapter, rest))
            })
            .max_by_key(|(adapter, _)| adapter.id().len());

        if let Some((adapter, rest)) = by_prefix {
            return Some((Arc::clone(adapter), rest.to_string()));
        }

        let (adapter_id, target_id) = split_first_segment(url)?;
        adapters
            .iter()
            .find(|a| a.id() == adapter_id)
            .map(|a| (Arc::clone(a), target_id.to_string()))
    }

    fn snapshot(&self) -> Vec<Arc<dyn Adapter>> {
        self.adapters.read().clone()
    }
}

/// Splits `/a/b/c` into `("/a", "b/c")`.
fn split_first_segment(url: &str) -> Option<(&str, &str)> {
    let index = url.get(1..)?.find('/')? + 1;
    Some((&url[..index], &url[index + 1..]))
}

// ============================================================================
// AdapterCollection - Adapter
// ============================================================================

impl Adapter for AdapterCollection {
    fn id(&self) -> &str {
        self.base.id()
    }
}

#[async_trait]
impl Discoverable for AdapterCollection {
    async fn get_targets(&self, metadata: Metadata) -> Vec<TargetInfo> {
        let adapters = self.snapshot();

        let results = join_all(
            adapters
                .iter()
                .map(|adapter| adapter.get_targets(Metadata::from(metadata.for_adapter(adapter.id())))),
        )
        .await;

        results.into_iter().flatten().collect()
    }
}

#[async_trait]
impl Connectable for AdapterCollection {
    fn connect_to(&self, url: &str, tools: ToolSocket) -> Result<Arc<Target>> {
        debug!(collection = %self.base.id(), url, "connectTo");

        let Some((adapter, target_id)) = self.route(url) else {
            error!(collection = %self.base.id(), url, "No adapter for url");
            return Err(Error::adapter_not_found(url));
        };

        adapter.connect_to(&target_id, tools)
    }

    async fn forward_to(&self, url: &str, raw: &str) {
        match self.route(url) {
            Some((adapter, target_id)) => adapter.forward_to(&target_id, raw).await,
            None => error!(collection = %self.base.id(), url, "No adapter for url"),
        }
    }

    fn set_socket_closed_handler(&self, handler: SocketClosedHandler) {
        *self.socket_closed.lock() = Some(handler);
    }
}

#[async_trait]
impl Lifecycle for AdapterCollection {
    async fn start(&self) -> Result<()> {
        debug!(collection = %self.base.id(), "start");
        self.base.start().await?;

        let adapters = self.snapshot();
        join_all(adapters.iter().map(|a| a.start()))
            .await
            .into_iter()
            .collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    async fn stop(&self) {
        debug!(collection = %self.base.id(), "stop");
        self.base.stop().await;

        let adapters = self.snapshot();
        join_all(adapters.iter().map(|a| a.stop())).await;
    }

    async fn force_refresh(&self) -> Result<()> {
        debug!(collection = %self.base.id(), "forceRefresh");
        self.base.force_refresh().await?;

        let adapters = self.snapshot();
        for adapter in adapters {
            adapter.force_refresh().await?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use rustc_hash::FxHashMap;
    use serde_json::json;

    use crate::protocol::DeviceInfo;
    use crate::test_support::{FakeDevice, FakeDiscovery, wait_until};

    const PROXY: &str = "ws://localhost:9000";

    fn collection() -> AdapterCollection {
        AdapterCollection::new("/ios", PROXY, AdapterOptions::new()).expect("collection")
    }

    fn device_adapter(id: &str, discovery: &FakeDiscovery) -> Arc<dyn Adapter> {
        let options = AdapterOptions::new().with_port(discovery.port());
        Arc::new(DeviceAdapter::new(id, PROXY, options).expect("adapter"))
    }

    #[test]
    fn test_split_first_segment() {
        assert_eq!(split_first_segment("/ios/page/1"), Some(("/ios", "page/1")));
        assert_eq!(split_first_segment("/ios"), None);
        assert_eq!(split_first_segment(""), None);
    }

    #[tokio::test]
    async fn test_route_by_longest_prefix() {
        let discovery = FakeDiscovery::start().await;
        let collection = collection();
        assert!(collection.add(device_adapter("/ios/device123", &discovery)));
        assert!(collection.add(device_adapter("/ios/device1234", &discovery)));

        let (adapter, target_id) = collection.route("/ios/device123/page1").expect("route");
        assert_eq!(adapter.id(), "/ios/device123");
        assert_eq!(target_id, "page1");

        let (adapter, target_id) = collection.route("/ios/device1234/page/2").expect("route");
        assert_eq!(adapter.id(), "/ios/device1234");
        assert_eq!(target_id, "page/2");

        assert!(collection.route("/android/x/page1").is_none());
    }

    #[tokio::test]
    async fn test_route_first_segment_fallback() {
        let discovery = FakeDiscovery::start().await;
        let collection = collection();
        collection.add(device_adapter("/test", &discovery));

        let (adapter, target_id) = collection.route("/test/page1").expect("route");
        assert_eq!(adapter.id(), "/test");
        assert_eq!(target_id, "page1");
    }

    #[tokio::test]
    async fn test_add_is_additive() {
        let discovery = FakeDiscovery::start().await;
        let collection = collection();
        assert!(collection.add(device_adapter("/ios/a", &discovery)));
        assert!(!collection.add(device_adapter("/ios/a", &discovery)));
        assert_eq!(collection.len(), 1);
        assert!(collection.contains("/ios/a"));
    }

    #[tokio::test]
    async fn test_get_targets_concatenates_in_order() {
        let first = FakeDiscovery::start().await;
        first.route("/json", &json!([{ "id": "a1" }, { "id": "a2" }]));
        let second = FakeDiscovery::start().await;
        second.route("/json", &json!([{ "id": "b1" }]));

        let collection = collection();
        collection.add(device_adapter("/ios/a", &first));
        collection.add(device_adapter("/ios/b", &second));

        // No record for the first adapter; the second keeps its own.
        let metadata = Metadata::PerAdapter(FxHashMap::from_iter([(
            "/ios/b".to_string(),
            DeviceInfo { device_id: "b".into(), ..DeviceInfo::default() },
        )]));
        let targets = collection.get_targets(metadata).await;

        let ids: Vec<&str> = targets.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2", "b1"]);
        assert!(targets[0].metadata.is_none());
        assert_eq!(targets[2].metadata.as_ref().map(|m| m.device_id.as_str()), Some("b"));
        assert_eq!(targets[2].web_socket_debugger_url, "ws://localhost:9000/ios/b/b1");
    }

    #[tokio::test]
    async fn test_connect_routes_to_sub_adapter() {
        let device = FakeDevice::start().await;
        let discovery = FakeDiscovery::start().await;
        discovery.route("/json", &json!([{ "id": "page/1", "webSocketDebuggerUrl": device.url() }]));

        let collection = collection();
        collection.add(device_adapter("/ios/dev1", &discovery));
        collection.get_targets(Metadata::None).await;

        let (tools, _rx) = ToolSocket::channel();
        let target = collection.connect_to("/ios/dev1/page/1", tools).expect("connect");
        assert_eq!(target.id(), "page/1");
        assert!(wait_until(|| device.connections() == 1).await);

        let (tools, _rx) = ToolSocket::channel();
        let err = collection.connect_to("/nowhere/page/1", tools).unwrap_err();
        assert!(matches!(err, Error::AdapterNotFound { .. }));
    }
}

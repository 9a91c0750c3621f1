//! iOS device adapter.
//!
//! [`IosAdapter`] lists devices from `ios_webkit_debug_proxy`, creates one
//! [`DeviceAdapter`] per newly seen device and installs the matching
//! [`Dialect`] on every target it connects.
//!
//! # Discovery
//!
//! ```text
//! GET 127.0.0.1:9400/json ─▶ [{deviceId, url: "localhost:9401"}, ...]
//!        │
//!        ├── probe version (ideviceinfo -u <id> -k ProductVersion)
//!        ├── add DeviceAdapter "/ios/<id>" on port 9401 if new
//!        └── GET 127.0.0.1:9401/json ─▶ pages
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::dialect::{Dialect, IosProtocol};
use crate::error::{Error, Result};
use crate::protocol::{DeviceInfo, TargetInfo};
use crate::target::{SocketClosedHandler, Target, ToolSocket};

use super::collection::AdapterCollection;
use super::device::DeviceAdapter;
use super::options::{AdapterOptions, IosProxySettings};
use super::{Adapter, Connectable, Discoverable, Lifecycle, Metadata};

// ============================================================================
// Constants
// ============================================================================

/// Version assumed for the simulator and for devices whose probe fails.
pub const DEFAULT_DEVICE_VERSION: &str = "9.3.0";

/// Executable that reports device properties.
const DEVICE_INFO_EXECUTABLE: &str = "ideviceinfo";

const DEVICE_INFO_INSTALL_HINT: &str =
    "Please install libimobiledevice (https://github.com/libimobiledevice/libimobiledevice)";

// ============================================================================
// DeviceVersionProbe
// ============================================================================

/// Looks up the product version of a connected device.
#[async_trait]
pub trait DeviceVersionProbe: Send + Sync + fmt::Debug {
    /// Returns a version string such as `"12.4.1"`.
    ///
    /// # Errors
    ///
    /// Any error makes the caller fall back to [`DEFAULT_DEVICE_VERSION`].
    async fn product_version(&self, device_id: &str) -> Result<String>;
}

/// Probe backed by `ideviceinfo -u <id> -k ProductVersion`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdeviceInfoProbe;

#[async_trait]
impl DeviceVersionProbe for IdeviceInfoProbe {
    async fn product_version(&self, device_id: &str) -> Result<String> {
        let program = which::which(DEVICE_INFO_EXECUTABLE).map_err(|_| {
            Error::executable_not_found(DEVICE_INFO_EXECUTABLE, DEVICE_INFO_INSTALL_HINT)
        })?;

        let output = Command::new(program)
            .args(["-u", device_id, "-k", "ProductVersion"])
            .output()
            .await?;

        if !output.status.success() {
            return Err(Error::process_launch_failed(format!(
                "{DEVICE_INFO_EXECUTABLE} exited with {}",
                output.status
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

// ============================================================================
// IosAdapter
// ============================================================================

/// Root adapter for iOS devices.
pub struct IosAdapter {
    collection: AdapterCollection,
    settings: IosProxySettings,
    probe: Arc<dyn DeviceVersionProbe>,
    /// Rule sets by composite target path, chosen once per target.
    protocols: Mutex<FxHashMap<String, Arc<IosProtocol>>>,
}

impl fmt::Debug for IosAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IosAdapter")
            .field("collection", &self.collection)
            .field("proxy_path", &self.settings.proxy_path)
            .field("probe", &self.probe)
            .finish_non_exhaustive()
    }
}

impl IosAdapter {
    /// Creates an adapter that launches the proxy described by `settings`.
    ///
    /// # Errors
    ///
    /// Same as [`DeviceAdapter::new`].
    pub fn new(
        id: impl Into<String>,
        proxy_url: impl Into<String>,
        settings: IosProxySettings,
    ) -> Result<Self> {
        let collection = AdapterCollection::new(id, proxy_url, settings.adapter_options())?;

        Ok(Self {
            collection,
            settings,
            probe: Arc::new(IdeviceInfoProbe),
            protocols: Mutex::new(FxHashMap::default()),
        })
    }

    /// Replaces the device version probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn DeviceVersionProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Proxy settings in use.
    #[inline]
    #[must_use]
    pub fn settings(&self) -> &IosProxySettings {
        &self.settings
    }

    /// Device adapters created so far.
    #[inline]
    #[must_use]
    pub fn collection(&self) -> &AdapterCollection {
        &self.collection
    }

    /// Rule set governing the target at `url`, once connected.
    #[must_use]
    pub fn protocol_for(&self, url: &str) -> Option<Arc<IosProtocol>> {
        self.protocols.lock().get(url).cloned()
    }

    /// Fills in `version` for every device.
    async fn resolve_versions(&self, devices: Vec<DeviceInfo>) -> Vec<DeviceInfo> {
        join_all(devices.into_iter().map(|mut device| async move {
            device.version = if device.is_simulator() {
                DEFAULT_DEVICE_VERSION.to_string()
            } else {
                match self.probe.product_version(&device.device_id).await {
                    Ok(version) if !version.is_empty() => version,
                    Ok(_) => DEFAULT_DEVICE_VERSION.to_string(),
                    Err(e) => {
                        warn!(device_id = %device.device_id, error = %e, "Device version probe failed");
                        DEFAULT_DEVICE_VERSION.to_string()
                    }
                }
            };
            device
        }))
        .await
    }

    fn device_adapter_id(&self, device: &DeviceInfo) -> String {
        format!("{}/{}", self.id(), device.device_id)
    }

    /// Adds and starts an adapter for each device not seen before.
    async fn add_new_devices(&self, devices: &[DeviceInfo]) {
        for device in devices {
            let adapter_id = self.device_adapter_id(device);
            if self.collection.contains(&adapter_id) {
                continue;
            }

            let Some(port) = device.forwarded_port() else {
                debug!(device_id = %device.device_id, url = %device.url, "Device has no forwarded port");
                continue;
            };

            let adapter = match DeviceAdapter::new(
                adapter_id.as_str(),
                self.collection.base().proxy_url(),
                AdapterOptions::new().with_port(port),
            ) {
                Ok(adapter) => Arc::new(adapter),
                Err(e) => {
                    warn!(adapter = %adapter_id, error = %e, "Cannot create device adapter");
                    continue;
                }
            };

            if let Err(e) = adapter.start().await {
                warn!(adapter = %adapter_id, error = %e, "Device adapter failed to start");
            }

            info!(adapter = %adapter_id, device = %device.device_name, port, "Device attached");
            self.collection.add(adapter);
        }
    }
}

// ============================================================================
// IosAdapter - Adapter
// ============================================================================

impl Adapter for IosAdapter {
    fn id(&self) -> &str {
        self.collection.id()
    }
}

#[async_trait]
impl Discoverable for IosAdapter {
    /// Lists devices, then the targets of every device adapter.
    ///
    /// Each device adapter receives the record of its own device.
    async fn get_targets(&self, _metadata: Metadata) -> Vec<TargetInfo> {
        debug!(adapter = %self.id(), "getTargets");

        let devices = match self.collection.base().fetch::<DeviceInfo>().await {
            Ok(devices) => devices,
            Err(e) => {
                debug!(adapter = %self.id(), error = %e, "Device list unavailable");
                return Vec::new();
            }
        };

        let devices = self.resolve_versions(devices).await;
        self.add_new_devices(&devices).await;

        let metadata = devices
            .into_iter()
            .map(|device| (self.device_adapter_id(&device), device))
            .collect();

        self.collection
            .get_targets(Metadata::PerAdapter(metadata))
            .await
    }
}

#[async_trait]
impl Connectable for IosAdapter {
    fn connect_to(&self, url: &str, tools: ToolSocket) -> Result<Arc<Target>> {
        let target = self.collection.connect_to(url, tools)?;

        let mut protocols = self.protocols.lock();
        if !protocols.contains_key(url) {
            let dialect = Dialect::for_version(target.data().device_version());
            debug!(url, %dialect, "Installing protocol dialect");
            protocols.insert(url.to_string(), dialect.install(&target));
        }

        Ok(target)
    }

    async fn forward_to(&self, url: &str, raw: &str) {
        self.collection.forward_to(url, raw).await;
    }

    fn set_socket_closed_handler(&self, handler: SocketClosedHandler) {
        self.collection.set_socket_closed_handler(handler);
    }
}

#[async_trait]
impl Lifecycle for IosAdapter {
    async fn start(&self) -> Result<()> {
        self.collection.start().await
    }

    async fn stop(&self) {
        self.collection.stop().await;
    }

    async fn force_refresh(&self) -> Result<()> {
        self.collection.force_refresh().await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use serde_json::json;

    use crate::adapter::options::ProxyArgs;
    use crate::test_support::{FakeDevice, FakeDiscovery, wait_until};

    const PROXY: &str = "ws://127.0.0.1:9000";

    #[derive(Debug)]
    struct FixedProbe(Option<&'static str>);

    #[async_trait]
    impl DeviceVersionProbe for FixedProbe {
        async fn product_version(&self, _device_id: &str) -> Result<String> {
            self.0
                .map(str::to_string)
                .ok_or_else(|| Error::process_launch_failed("no device"))
        }
    }

    fn adapter(device_list: &FakeDiscovery, probe: FixedProbe) -> IosAdapter {
        let args = ProxyArgs {
            proxy_port: device_list.port(),
            ..ProxyArgs::default()
        };
        let settings = IosProxySettings::with_executable(PathBuf::from("/nonexistent/iwdp"), args);
        IosAdapter::new("/ios", PROXY, settings)
            .expect("adapter")
            .with_probe(Arc::new(probe))
    }

    fn device_record(id: &str, pages: &FakeDiscovery) -> serde_json::Value {
        json!({
            "deviceId": id,
            "deviceName": "iPhone",
            "deviceOSVersion": "",
            "url": format!("127.0.0.1:{}", pages.port())
        })
    }

    #[tokio::test]
    async fn test_end_to_end_discovery_and_connect() {
        let device = FakeDevice::start().await;
        let pages = FakeDiscovery::start().await;
        pages.route("/json", &json!([{ "id": "page/1", "title": "Home", "webSocketDebuggerUrl": device.url() }]));

        let device_list = FakeDiscovery::start().await;
        device_list.route("/json", &json!([device_record("dev1", &pages)]));

        let ios = adapter(&device_list, FixedProbe(Some("12.2")));
        let targets = ios.get_targets(Metadata::None).await;

        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].web_socket_debugger_url, "ws://127.0.0.1:9000/ios/dev1/page/1");
        assert_eq!(targets[0].adapter_type, "_ios");
        assert_eq!(targets[0].device_version(), "12.2");
        assert!(ios.collection().contains("/ios/dev1"));

        let (tools, _rx) = ToolSocket::channel();
        let target = ios.connect_to("/ios/dev1/page/1", tools).expect("connect");
        assert!(wait_until(|| device.connections() == 1).await);
        assert!(target.is_target_based());

        let protocol = ios.protocol_for("/ios/dev1/page/1").expect("protocol");
        assert_eq!(protocol.dialect(), Dialect::Ios12);
    }

    #[tokio::test]
    async fn test_dialect_chosen_once() {
        let device = FakeDevice::start().await;
        let pages = FakeDiscovery::start().await;
        pages.route("/json", &json!([{ "id": "page/1", "webSocketDebuggerUrl": device.url() }]));
        let device_list = FakeDiscovery::start().await;
        device_list.route("/json", &json!([device_record("dev1", &pages)]));

        let ios = adapter(&device_list, FixedProbe(Some("8.4")));
        ios.get_targets(Metadata::None).await;

        let (tools, _rx) = ToolSocket::channel();
        ios.connect_to("/ios/dev1/page/1", tools).expect("connect");
        let first = ios.protocol_for("/ios/dev1/page/1").expect("protocol");
        assert_eq!(first.dialect(), Dialect::Ios8);

        let (tools, _rx) = ToolSocket::channel();
        ios.connect_to("/ios/dev1/page/1", tools).expect("reconnect");
        let second = ios.protocol_for("/ios/dev1/page/1").expect("protocol");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_failed_probe_and_simulator_use_default_version() {
        let pages = FakeDiscovery::start().await;
        pages.route("/json", &json!([{ "id": "page/1" }]));
        let sim_pages = FakeDiscovery::start().await;
        sim_pages.route("/json", &json!([{ "id": "page/2" }]));

        let device_list = FakeDiscovery::start().await;
        device_list.route(
            "/json",
            &json!([device_record("dev1", &pages), device_record(DeviceInfo::SIMULATOR_ID, &sim_pages)]),
        );

        let ios = adapter(&device_list, FixedProbe(None));
        let targets = ios.get_targets(Metadata::None).await;

        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|t| t.device_version() == DEFAULT_DEVICE_VERSION));
    }

    #[tokio::test]
    async fn test_known_devices_are_not_recreated() {
        let pages = FakeDiscovery::start().await;
        pages.route("/json", &json!([]));
        let device_list = FakeDiscovery::start().await;
        device_list.route("/json", &json!([device_record("dev1", &pages)]));

        let ios = adapter(&device_list, FixedProbe(Some("9.3")));
        ios.get_targets(Metadata::None).await;
        ios.get_targets(Metadata::None).await;
        assert_eq!(ios.collection().len(), 1);

        device_list.route("/json", &json!([]));
        ios.get_targets(Metadata::None).await;
        assert_eq!(ios.collection().len(), 1);
    }

    #[tokio::test]
    async fn test_metadata_follows_device_after_one_leaves() {
        let first_pages = FakeDiscovery::start().await;
        first_pages.route("/json", &json!([{ "id": "page/1" }]));
        let second_pages = FakeDiscovery::start().await;
        second_pages.route("/json", &json!([{ "id": "page/2" }]));

        let device_list = FakeDiscovery::start().await;
        device_list.route(
            "/json",
            &json!([device_record("dev1", &first_pages), device_record("dev2", &second_pages)]),
        );

        let ios = adapter(&device_list, FixedProbe(Some("12.2")));
        ios.get_targets(Metadata::None).await;

        device_list.route("/json", &json!([device_record("dev2", &second_pages)]));
        let targets = ios.get_targets(Metadata::None).await;

        let owner = |id: &str| {
            targets
                .iter()
                .find(|t| t.id == id)
                .and_then(|t| t.metadata.as_ref())
                .map(|m| m.device_id.clone())
        };
        assert_eq!(owner("page/1"), None);
        assert_eq!(owner("page/2").as_deref(), Some("dev2"));
    }

    #[tokio::test]
    async fn test_unreachable_device_list() {
        let device_list = FakeDiscovery::start().await;
        let ios = adapter(&device_list, FixedProbe(Some("9.3")));
        assert!(ios.get_targets(Metadata::None).await.is_empty());
        assert!(ios.collection().is_empty());
    }

    #[tokio::test]
    async fn test_connect_unknown_url_fails() {
        let device_list = FakeDiscovery::start().await;
        let ios = adapter(&device_list, FixedProbe(Some("9.3")));
        let (tools, _rx) = ToolSocket::channel();
        assert!(ios.connect_to("/ios/dev9/page/1", tools).is_err());
    }

    #[tokio::test]
    async fn test_missing_proxy_executable_fails_start() {
        let device_list = FakeDiscovery::start().await;
        let ios = adapter(&device_list, FixedProbe(Some("9.3")));
        let err = ios.start().await.unwrap_err();
        assert!(matches!(err, Error::ProcessLaunchFailed { .. }));
    }
}

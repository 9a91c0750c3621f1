//! Target discovery and routing.
//!
//! Adapters list debuggable targets, hand out proxy-relative debugger URLs
//! and connect tool sockets to the right [`Target`].
//!
//! # Hierarchy
//!
//! ```text
//! IosAdapter "/ios"                      lists devices, owns ios_webkit_debug_proxy
//!   └── AdapterCollection
//!         ├── DeviceAdapter "/ios/<udid>" lists pages on 127.0.0.1:<port>/json
//!         └── DeviceAdapter "/ios/<udid>"
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `collection` | [`AdapterCollection`] prefix routing |
//! | `device` | [`DeviceAdapter`] for one discovery endpoint |
//! | `ios` | [`IosAdapter`] and device version probes |
//! | `options` | [`AdapterOptions`] and proxy settings |
//! | `process` | [`ProxyProcess`] helper lifecycle |

// ============================================================================
// Submodules
// ============================================================================

/// Prefix-routed adapter set.
pub mod collection;

/// Single discovery endpoint adapter.
pub mod device;

/// iOS device adapter.
pub mod ios;

/// Adapter configuration.
pub mod options;

/// Helper process lifecycle.
pub mod process;

// ============================================================================
// Re-exports
// ============================================================================

pub use collection::AdapterCollection;
pub use device::DeviceAdapter;
pub use ios::{DEFAULT_DEVICE_VERSION, DeviceVersionProbe, IdeviceInfoProbe, IosAdapter};
pub use options::{AdapterOptions, IosProxySettings, ProxyArgs};
pub use process::{ProcessState, ProxyProcess};

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::protocol::{DeviceInfo, TargetInfo};
use crate::target::{SocketClosedHandler, Target, ToolSocket};

// ============================================================================
// Metadata
// ============================================================================

/// Device metadata attached to discovered targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Metadata {
    /// No metadata.
    #[default]
    None,
    /// The same record for every adapter.
    Shared(DeviceInfo),
    /// One record per sub-adapter, keyed by adapter id.
    PerAdapter(FxHashMap<String, DeviceInfo>),
}

impl Metadata {
    /// Record for the sub-adapter `adapter_id`.
    #[must_use]
    pub fn for_adapter(&self, adapter_id: &str) -> Option<DeviceInfo> {
        match self {
            Self::None => None,
            Self::Shared(info) => Some(info.clone()),
            Self::PerAdapter(infos) => infos.get(adapter_id).cloned(),
        }
    }

    /// Record for a leaf adapter. Keyed records carry none.
    #[must_use]
    pub fn into_single(self) -> Option<DeviceInfo> {
        match self {
            Self::Shared(info) => Some(info),
            Self::None | Self::PerAdapter(_) => None,
        }
    }
}

impl From<Option<DeviceInfo>> for Metadata {
    fn from(info: Option<DeviceInfo>) -> Self {
        info.map_or(Self::None, Self::Shared)
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Lists targets.
#[async_trait]
pub trait Discoverable: Send + Sync {
    /// Fetches and rewrites the current targets.
    ///
    /// Never fails; an unreachable endpoint yields no targets.
    async fn get_targets(&self, metadata: Metadata) -> Vec<TargetInfo>;
}

/// Connects tool sockets to targets.
#[async_trait]
pub trait Connectable: Send + Sync {
    /// Connects `tools` to the target at `target_id`, reusing a live target.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::TargetNotFound`] if discovery never listed the id
    /// - [`crate::Error::AdapterNotFound`] if no sub-adapter matches
    fn connect_to(&self, target_id: &str, tools: ToolSocket) -> Result<Arc<Target>>;

    /// Forwards a tool frame to the target at `target_id`.
    async fn forward_to(&self, target_id: &str, raw: &str);

    /// Sets the callback raised with the target id when a device socket is
    /// found closed.
    fn set_socket_closed_handler(&self, handler: SocketClosedHandler);
}

/// Starts and stops helper processes.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Starts the helper process, if one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ProcessLaunchFailed`] if it cannot start.
    async fn start(&self) -> Result<()>;

    /// Stops the helper process.
    async fn stop(&self);

    /// Restarts a running helper process.
    ///
    /// # Errors
    ///
    /// Same as [`Lifecycle::start`].
    async fn force_refresh(&self) -> Result<()>;
}

/// An adapter addressable by id.
pub trait Adapter: Discoverable + Connectable + Lifecycle + fmt::Debug {
    /// Adapter id, such as `/ios` or `/ios/<udid>`.
    fn id(&self) -> &str;
}

/// `_` followed by the first segment of `adapter_id`.
#[must_use]
pub fn adapter_type(adapter_id: &str) -> String {
    let trimmed = adapter_id.strip_prefix('/').unwrap_or(adapter_id);
    let first = trimmed.split('/').next().unwrap_or_default();
    format!("_{first}")
}

// ============================================================================
// Tests
// ============================================================================

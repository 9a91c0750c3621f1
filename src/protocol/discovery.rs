//! Discovery records served by `/json` endpoints.
//!
//! A device proxy lists its debuggable pages as an array of [`TargetInfo`];
//! `ios_webkit_debug_proxy` additionally lists connected devices as an
//! array of [`DeviceInfo`] on its own port.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// TargetInfo
// ============================================================================

/// One debuggable target as reported by discovery.
///
/// Fields this crate does not interpret are kept in `extra` and written back
/// unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    /// Target id; falls back to the debugger URL when the device omits it.
    #[serde(default)]
    pub id: String,

    /// iOS application id, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,

    /// Free-form description.
    #[serde(default)]
    pub description: String,

    /// Hosted DevTools front end URL.
    #[serde(default)]
    pub devtools_frontend_url: String,

    /// Page favicon.
    #[serde(default)]
    pub favicon_url: String,

    /// Page title.
    #[serde(default)]
    pub title: String,

    /// Target kind, `page` unless the device says otherwise.
    #[serde(default, rename = "type")]
    pub target_type: String,

    /// Page URL.
    #[serde(default)]
    pub url: String,

    /// Debugger endpoint.
    #[serde(default)]
    pub web_socket_debugger_url: String,

    /// Tag of the adapter that discovered the target.
    #[serde(default)]
    pub adapter_type: String,

    /// Device the target lives on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<DeviceInfo>,

    /// Unrecognised members.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TargetInfo {
    /// Reported OS version of the owning device, or `""`.
    #[inline]
    #[must_use]
    pub fn device_version(&self) -> &str {
        self.metadata
            .as_ref()
            .map(|m| m.version.as_str())
            .unwrap_or_default()
    }
}

// ============================================================================
// DeviceInfo
// ============================================================================

/// One device (or simulator) listed by the iOS device proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Device UDID, or `SIMULATOR`.
    #[serde(default)]
    pub device_id: String,

    /// Human readable name.
    #[serde(default)]
    pub device_name: String,

    /// OS version string as reported by the proxy.
    #[serde(default, rename = "deviceOSVersion")]
    pub device_os_version: String,

    /// `host:port` the proxy forwards this device on.
    #[serde(default)]
    pub url: String,

    /// Resolved product version used for dialect selection.
    #[serde(default)]
    pub version: String,
}

impl DeviceInfo {
    /// Device id used by the iOS simulator entry.
    pub const SIMULATOR_ID: &'static str = "SIMULATOR";

    /// Returns `true` for the simulator pseudo-device.
    #[inline]
    #[must_use]
    pub fn is_simulator(&self) -> bool {
        self.device_id == Self::SIMULATOR_ID
    }

    /// Port parsed from `url` (`host:port`).
    #[must_use]
    pub fn forwarded_port(&self) -> Option<u16> {
        let mut parts = self.url.split(':');
        parts.next()?;
        parts.next()?.trim().parse().ok()
    }
}

// ============================================================================
// Tests
// ============================================================================

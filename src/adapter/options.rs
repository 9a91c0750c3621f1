//! Adapter configuration.
//!
//! # Example
//!
//! ```ignore
//! use ios_webkit_adapter::adapter::AdapterOptions;
//!
//! let options = AdapterOptions::new()
//!     .with_port(9401)
//!     .with_path("/json");
//!
//! let url = options.discovery_url()?;
//! // http://127.0.0.1:9401/json
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::path::PathBuf;

use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default discovery host.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1";

/// Default discovery path.
pub const DEFAULT_PATH: &str = "/json";

/// Default discovery port.
pub const DEFAULT_PORT: u16 = 9222;

/// Default port of the iOS device proxy's device list.
pub const DEFAULT_PROXY_PORT: u16 = 9400;

/// Executable name of the iOS device proxy.
pub const PROXY_EXECUTABLE: &str = "ios_webkit_debug_proxy";

const PROXY_INSTALL_HINT: &str =
    "Please install ios_webkit_debug_proxy (https://github.com/google/ios-webkit-debug-proxy)";

/// Devices get ports `proxy_port + 1 ..= proxy_port + DEVICE_PORT_SPAN`.
const DEVICE_PORT_SPAN: u16 = 101;

// ============================================================================
// AdapterOptions
// ============================================================================

/// Where an adapter finds its targets and which helper it launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterOptions {
    /// Scheme and host of the discovery endpoint.
    pub base_url: String,

    /// Path of the discovery endpoint.
    pub path: String,

    /// Port of the discovery endpoint.
    pub port: u16,

    /// Helper process to launch on start, if any.
    pub proxy_exe_path: Option<PathBuf>,

    /// Arguments for the helper process.
    pub proxy_exe_args: Vec<String>,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterOptions {
    /// Creates options pointing at `http://127.0.0.1:9222/json`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            path: DEFAULT_PATH.to_string(),
            port: DEFAULT_PORT,
            proxy_exe_path: None,
            proxy_exe_args: Vec::new(),
        }
    }

    /// Sets scheme and host.
    #[inline]
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Sets the discovery path.
    #[inline]
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the discovery port.
    #[inline]
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the helper process and its arguments.
    #[inline]
    #[must_use]
    pub fn with_proxy_exe(
        mut self,
        path: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.proxy_exe_path = Some(path.into());
        self.proxy_exe_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Renders `{base_url}:{port}{path}`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the result is not a valid URL.
    pub fn discovery_url(&self) -> Result<Url> {
        let raw = format!("{}:{}{}", self.base_url, self.port, self.path);
        Url::parse(&raw).map_err(|e| Error::config(format!("invalid discovery url {raw}: {e}")))
    }
}

// ============================================================================
// ProxyArgs
// ============================================================================

/// User supplied settings for the iOS device proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyArgs {
    /// Explicit proxy executable. When set, no default arguments are added.
    pub proxy_executable: Option<PathBuf>,

    /// Port of the device list.
    pub proxy_port: u16,

    /// Extra arguments appended after the defaults.
    pub proxy_args: Vec<String>,
}

impl Default for ProxyArgs {
    fn default() -> Self {
        Self {
            proxy_executable: None,
            proxy_port: DEFAULT_PROXY_PORT,
            proxy_args: Vec::new(),
        }
    }
}

// ============================================================================
// IosProxySettings
// ============================================================================

/// Resolved launch settings for `ios_webkit_debug_proxy`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IosProxySettings {
    /// Proxy executable.
    pub proxy_path: PathBuf,

    /// Port of the device list.
    pub proxy_port: u16,

    /// Full argument list.
    pub proxy_args: Vec<String>,
}

impl IosProxySettings {
    /// Resolves settings, locating the proxy on `PATH` unless an executable
    /// was given.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutableNotFound`] if no executable was given and
    /// none is on `PATH`.
    pub fn resolve(args: ProxyArgs) -> Result<Self> {
        let proxy_path = match &args.proxy_executable {
            Some(path) => path.clone(),
            None => which::which(PROXY_EXECUTABLE)
                .map_err(|_| Error::executable_not_found(PROXY_EXECUTABLE, PROXY_INSTALL_HINT))?,
        };

        let settings = Self::with_executable(proxy_path, args);
        debug!(path = %settings.proxy_path.display(), args = ?settings.proxy_args, "Resolved proxy settings");
        Ok(settings)
    }

    /// Builds settings around a known executable.
    #[must_use]
    pub fn with_executable(proxy_path: PathBuf, args: ProxyArgs) -> Self {
        let mut proxy_args = Vec::with_capacity(2 + args.proxy_args.len());

        if args.proxy_executable.is_none() {
            proxy_args.extend(default_proxy_args(args.proxy_port));
        }
        proxy_args.extend(args.proxy_args);

        Self {
            proxy_path,
            proxy_port: args.proxy_port,
            proxy_args,
        }
    }

    /// Options for the adapter that lists devices and owns the proxy process.
    #[must_use]
    pub fn adapter_options(&self) -> AdapterOptions {
        AdapterOptions::new()
            .with_port(self.proxy_port)
            .with_proxy_exe(self.proxy_path.clone(), self.proxy_args.clone())
    }
}

/// Arguments that disable the proxy's own front end and reserve device ports.
#[must_use]
pub fn default_proxy_args(port: u16) -> [String; 2] {
    let first = port.saturating_add(1);
    let last = port.saturating_add(DEVICE_PORT_SPAN);
    [
        "--no-frontend".to_string(),
        format!("--config=null:{port},:{first}-{last}"),
    ]
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_discovery_url() {
        let url = AdapterOptions::new().discovery_url().expect("url");
        assert_eq!(url.as_str(), "http://127.0.0.1:9222/json");
    }

    #[test]
    fn test_builder_chain() {
        let options = AdapterOptions::new()
            .with_base_url("http://localhost")
            .with_port(9401)
            .with_path("/json/list");

        assert_eq!(
            options.discovery_url().expect("url").as_str(),
            "http://localhost:9401/json/list"
        );
        assert!(options.proxy_exe_path.is_none());
    }

    #[test]
    fn test_invalid_discovery_url() {
        let err = AdapterOptions::new()
            .with_base_url("not a url")
            .discovery_url()
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_default_proxy_args() {
        assert_eq!(
            default_proxy_args(9400),
            ["--no-frontend".to_string(), "--config=null:9400,:9401-9501".to_string()]
        );
    }

    #[test]
    fn test_explicit_executable_skips_defaults() {
        let args = ProxyArgs {
            proxy_executable: Some(PathBuf::from("/opt/proxy")),
            proxy_args: vec!["-d".into()],
            ..ProxyArgs::default()
        };

        let settings = IosProxySettings::resolve(args).expect("resolve");
        assert_eq!(settings.proxy_path, PathBuf::from("/opt/proxy"));
        assert_eq!(settings.proxy_args, vec!["-d".to_string()]);
        assert_eq!(settings.proxy_port, DEFAULT_PROXY_PORT);
    }

    #[test]
    fn test_located_executable_gets_defaults_then_extras() {
        let args = ProxyArgs {
            proxy_port: 9500,
            proxy_args: vec!["--debug".into()],
            ..ProxyArgs::default()
        };

        let settings = IosProxySettings::with_executable(PathBuf::from("/usr/bin/iwdp"), args);
        assert_eq!(
            settings.proxy_args,
            vec![
                "--no-frontend".to_string(),
                "--config=null:9500,:9501-9601".to_string(),
                "--debug".to_string()
            ]
        );

        let options = settings.adapter_options();
        assert_eq!(options.port, 9500);
        assert_eq!(options.proxy_exe_path, Some(PathBuf::from("/usr/bin/iwdp")));
    }
}

//! iOS WebKit Adapter - Chrome DevTools Protocol bridge for iOS devices.
//!
//! This library lets Chrome DevTools front ends debug pages on iOS devices
//! and simulators by translating between CDP and the WebKit Remote
//! Inspector protocol.
//!
//! # Architecture
//!
//! The proxy sits between two WebSocket peers:
//!
//! - **Tools**: a DevTools front end speaking CDP
//! - **Device**: a WebKit inspector endpoint exposed by
//!   `ios_webkit_debug_proxy`
//!
//! Key design principles:
//!
//! - Each [`Target`] owns one tool socket and one device socket
//! - Per-method filters rewrite, answer or drop frames in either direction
//! - Adapter-issued requests use negative ids and never reach the tools
//! - The protocol dialect is chosen from the device's iOS version
//!
//! # Quick Start
//!
//! ```no_run
//! use ios_webkit_adapter::adapter::{Discoverable, Metadata, ProxyArgs};
//! use ios_webkit_adapter::{ProxyServer, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Bind the tool endpoint and launch ios_webkit_debug_proxy
//!     let server = ProxyServer::run_ios(9000, ProxyArgs::default()).await?;
//!
//!     // List pages across attached devices
//!     for target in server.adapter().get_targets(Metadata::None).await {
//!         println!("{} {}", target.id, target.web_socket_debugger_url);
//!     }
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adapter`] | Discovery, routing and helper processes |
//! | [`dialect`] | iOS 8, 9 and 12 protocol translation |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Frame accessors, envelopes, discovery records |
//! | [`target`] | Per-page relay and filter pipeline |
//! | [`transport`] | Tool-facing WebSocket server |

// ============================================================================
// Modules
// ============================================================================

/// Discovery, routing and helper processes.
///
/// - [`IosAdapter`] - Device listing and dialect selection
/// - [`AdapterCollection`] - Prefix-routed sub-adapters
/// - [`DeviceAdapter`] - One discovery endpoint
pub mod adapter;

/// iOS protocol dialects.
pub mod dialect;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Wire formats.
pub mod protocol;

/// Per-page relay between tools and device.
pub mod target;

/// Tool-facing WebSocket server.
pub mod transport;

#[cfg(test)]
mod test_support;

// ============================================================================
// Re-exports
// ============================================================================

pub use adapter::{
    Adapter, AdapterCollection, AdapterOptions, Connectable, DeviceAdapter, Discoverable,
    IosAdapter, Lifecycle, Metadata, ProxyProcess,
};
pub use dialect::{Dialect, IosProtocol, ScreencastSession};
pub use error::{Error, Result};
pub use identifiers::{ClientId, RequestId};
pub use protocol::{DeviceInfo, TargetInfo};
pub use target::{Target, ToolSocket};
pub use transport::ProxyServer;

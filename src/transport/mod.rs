//! Tool-facing WebSocket transport.
//!
//! DevTools front ends speak CDP over WebSocket to the proxy; the proxy
//! relays each connection to a device target through the adapter tree.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐                         ┌─────────────────┐            ┌──────────────┐
//! │  DevTools       │        WebSocket        │  ProxyServer    │ WebSocket  │  iOS device  │
//! │  front end      │◄───────────────────────►│  → Adapter      │◄──────────►│  inspector   │
//! │                 │  /ios/<udid>/<target>   │  → Target       │            │              │
//! └─────────────────┘                         └─────────────────┘            └──────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `server` | Tool connection acceptance and frame pumping |

// ============================================================================
// Submodules
// ============================================================================

/// Tool-facing WebSocket server.
pub mod server;

// ============================================================================
// Re-exports
// ============================================================================

pub use server::{IOS_ADAPTER_ID, ProxyServer};

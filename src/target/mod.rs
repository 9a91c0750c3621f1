//! Per-page relay between a tool socket and a device socket.
//!
//! # Message Flow
//!
//! ```text
//! tools ──forward──▶ tools::<method> filters ──▶ [envelope] ──▶ device
//! tools ◀────────── target::<method> filters ◀── [unwrap]  ◀── device
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `core` | [`Target`] relay and correlation maps |
//! | `filter` | Filter keys, chains and the [`MessageFilter`] trait |
//! | `link` | Device-side WebSocket event loop |
//! | `socket` | [`ToolSocket`] handle |

// ============================================================================
// Submodules
// ============================================================================

/// Target relay.
pub mod core;

/// Message filter pipeline.
pub mod filter;

/// Device-side connection task.
mod link;

/// Tool-side socket handle.
pub mod socket;

// ============================================================================
// Re-exports
// ============================================================================

pub use core::{DEFAULT_CALL_TIMEOUT, SocketClosedHandler, Target};
pub use filter::{FilterChain, FilterKey, FilterTable, Filtered, MessageFilter, filter_fn};
pub use socket::ToolSocket;

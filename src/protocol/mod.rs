//! Wire formats.
//!
//! # Protocol Overview
//!
//! | Peer | Protocol | Carried as |
//! |------|----------|------------|
//! | Tools | Chrome DevTools Protocol | JSON text frames |
//! | Device | WebKit Inspector Protocol | JSON text frames, optionally enveloped |
//! | Discovery | `/json` HTTP listing | JSON array |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `discovery` | Target and device discovery records |
//! | `envelope` | `Target.*` envelope used by iOS 12.2+ |
//! | `message` | Frame accessors and builders |

// ============================================================================
// Submodules
// ============================================================================

/// Target and device discovery records.
pub mod discovery;

/// Target-based message envelope.
pub mod envelope;

/// Frame accessors and builders.
pub mod message;

// ============================================================================
// Re-exports
// ============================================================================

pub use discovery::{DeviceInfo, TargetInfo};

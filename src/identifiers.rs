//! Type-safe identifiers.
//!
//! Two request-id spaces share one wire field: tools pick non-negative ids,
//! the adapter allocates strictly decreasing negative ids for its own calls.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// RequestId
// ============================================================================

/// Protocol request id as carried in the `id` member of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(i64);

impl RequestId {
    /// Wraps a raw id.
    #[inline]
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Returns `true` for ids allocated by [`RequestIdAllocator`].
    #[inline]
    #[must_use]
    pub const fn is_adapter_issued(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// RequestIdAllocator
// ============================================================================

/// Hands out `-1, -2, -3, ...` for adapter-initiated calls.
#[derive(Debug, Default)]
pub struct RequestIdAllocator {
    last: AtomicI64,
}

impl RequestIdAllocator {
    /// Creates an allocator whose first id is `-1`.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next id.
    #[inline]
    pub fn next(&self) -> RequestId {
        RequestId(self.last.fetch_sub(1, Ordering::Relaxed) - 1)
    }
}

// ============================================================================
// ClientId
// ============================================================================

/// Identifies one accepted tool-side WebSocket connection in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generates a fresh random id.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

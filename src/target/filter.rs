//! Message filter pipeline.
//!
//! Filters are registered against a [`FilterKey`] (direction + method) and
//! run as an ordered chain: each filter receives the previous filter's
//! output and either forwards a (possibly rewritten) message or drops it,
//! which stops the chain.
//!
//! # Example
//!
//! ```ignore
//! target.add_message_filter(FilterKey::tools("Log.enable"), |_target, mut msg: Value| async move {
//!     message::rename(&mut msg, "Console.enable");
//!     Ok(Filtered::Forward(msg))
//! });
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::warn;

use crate::error::Result;

use super::Target;

// ============================================================================
// FilterKey
// ============================================================================

/// Direction plus method a filter is registered for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterKey {
    /// Tool → device request with the given method.
    Tools(String),
    /// Device → tool event, or reply to a tool request with the given method.
    Target(String),
    /// Device → tool error reply, whatever request triggered it.
    TargetError,
}

impl FilterKey {
    /// Key for tool-originated messages.
    #[inline]
    #[must_use]
    pub fn tools(method: impl Into<String>) -> Self {
        Self::Tools(method.into())
    }

    /// Key for device-originated messages.
    #[inline]
    #[must_use]
    pub fn target(method: impl Into<String>) -> Self {
        Self::Target(method.into())
    }
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tools(method) => write!(f, "tools::{method}"),
            Self::Target(method) => write!(f, "target::{method}"),
            Self::TargetError => f.write_str("target::error"),
        }
    }
}

// ============================================================================
// Filtered
// ============================================================================

/// Outcome of one filter step.
#[derive(Debug, Clone, PartialEq)]
pub enum Filtered {
    /// Continue with this message.
    Forward(Value),
    /// Absorb the message; nothing reaches the opposite peer.
    Drop,
}

// ============================================================================
// MessageFilter
// ============================================================================

/// An asynchronous message transform.
///
/// A filter may await [`Target::call_target`]; later frames in the same
/// direction wait until its chain finishes.
#[async_trait]
pub trait MessageFilter: Send + Sync {
    /// Transforms one message.
    ///
    /// # Errors
    ///
    /// An error aborts the chain and the message is dropped.
    async fn apply(&self, target: &Arc<Target>, message: Value) -> Result<Filtered>;
}

#[async_trait]
impl<F, Fut> MessageFilter for F
where
    F: Fn(Arc<Target>, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Filtered>> + Send + 'static,
{
    async fn apply(&self, target: &Arc<Target>, message: Value) -> Result<Filtered> {
        (self)(Arc::clone(target), message).await
    }
}

/// Wraps an async closure as a shareable filter.
///
/// Taking the closure through an `Fn` bound lets the compiler infer the
/// error type of `async move { Ok(..) }` bodies.
pub fn filter_fn<F, Fut>(filter: F) -> Arc<dyn MessageFilter>
where
    F: Fn(Arc<Target>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Filtered>> + Send + 'static,
{
    Arc::new(filter)
}

// ============================================================================
// FilterChain
// ============================================================================

/// Ordered filters for one key.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn MessageFilter>>,
}

impl FilterChain {
    /// Number of registered filters.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Returns `true` if no filter is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs every filter in registration order.
    ///
    /// Returns `None` as soon as a filter drops the message or fails.
    pub async fn apply(&self, target: &Arc<Target>, message: Value) -> Option<Value> {
        let mut current = message;

        for filter in &self.filters {
            match filter.apply(target, current).await {
                Ok(Filtered::Forward(next)) => current = next,
                Ok(Filtered::Drop) => return None,
                Err(e) => {
                    warn!(target_id = %target.id(), error = %e, "Message filter failed");
                    return None;
                }
            }
        }

        Some(current)
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("len", &self.filters.len())
            .finish()
    }
}

// ============================================================================
// FilterTable
// ============================================================================

/// Registry of filter chains by key.
#[derive(Debug, Default)]
pub struct FilterTable {
    chains: FxHashMap<FilterKey, FilterChain>,
}

impl FilterTable {
    /// Appends a filter to the chain for `key`.
    pub fn add(&mut self, key: FilterKey, filter: Arc<dyn MessageFilter>) {
        self.chains.entry(key).or_default().filters.push(filter);
    }

    /// Returns `true` if any filter is registered for `key`.
    #[inline]
    #[must_use]
    pub fn contains(&self, key: &FilterKey) -> bool {
        self.chains.get(key).is_some_and(|c| !c.is_empty())
    }

    /// Snapshot of the chain for `key`.
    #[inline]
    #[must_use]
    pub fn chain(&self, key: &FilterKey) -> Option<FilterChain> {
        self.chains.get(key).filter(|c| !c.is_empty()).cloned()
    }

    /// Registered keys, for inspection.
    pub fn keys(&self) -> impl Iterator<Item = &FilterKey> {
        self.chains.keys()
    }
}

// ============================================================================
// Tests
// ============================================================================

//! WebKit protocol dialects.
//!
//! Each iOS version family speaks a slightly different WebKit Inspector
//! Protocol. A [`Dialect`] picks the rule set that makes a target look like
//! a Chrome DevTools page.
//!
//! # Dialects
//!
//! | Dialect | iOS versions | Differences |
//! |---------|--------------|-------------|
//! | [`Dialect::Ios8`] | ≤ 8 | Errors become empty results, selectors are bare strings |
//! | [`Dialect::Ios9`] | 9 to 12.1 | Shared rules only |
//! | [`Dialect::Ios12`] | ≥ 12.2 | Traffic travels inside `Target` envelopes |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `css` | CSS shape mapping |
//! | `ios` | [`IosProtocol`] rule set |
//! | `screencast` | [`ScreencastSession`] frame capture |

// ============================================================================
// Submodules
// ============================================================================

/// CSS shape mapping.
pub mod css;

/// IOS rule set.
pub mod ios;

/// Screencast emulation.
pub mod screencast;

// ============================================================================
// Re-exports
// ============================================================================

pub use ios::IosProtocol;
pub use screencast::{ScreencastOptions, ScreencastSession};

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use crate::target::Target;

use self::css::SelectorStyle;

// ============================================================================
// Dialect
// ============================================================================

/// WebKit protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// iOS 8 and earlier.
    Ios8,
    /// iOS 9 through 12.1.
    Ios9,
    /// iOS 12.2 and later.
    Ios12,
}

impl Dialect {
    /// Selects the dialect for a device version string such as `"12.2"`.
    ///
    /// Unparsable versions fall back to [`Dialect::Ios9`].
    #[must_use]
    pub fn for_version(version: &str) -> Self {
        let mut parts = version.trim().split('.');

        let Some(major) = parts.next().and_then(|p| p.parse::<u32>().ok()) else {
            return Self::Ios9;
        };
        let minor = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .unwrap_or(0);

        match major {
            0..=8 => Self::Ios8,
            12 if minor >= 2 => Self::Ios12,
            13.. => Self::Ios12,
            _ => Self::Ios9,
        }
    }

    /// How this dialect represents selectors.
    #[inline]
    #[must_use]
    pub fn selector_style(self) -> SelectorStyle {
        match self {
            Self::Ios8 => SelectorStyle::Boxed,
            Self::Ios9 | Self::Ios12 => SelectorStyle::Plain,
        }
    }

    /// Registers this dialect's rule set on `target`.
    pub fn install(self, target: &Arc<Target>) -> Arc<IosProtocol> {
        IosProtocol::install(self, target)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ios8 => write!(f, "ios8"),
            Self::Ios9 => write!(f, "ios9"),
            Self::Ios12 => write!(f, "ios12"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

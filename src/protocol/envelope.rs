//! Target-based message envelope (iOS 12.2 and later).
//!
//! Newer WebKit inspectors expose a single `Target` domain on the socket.
//! Every other command travels inside `Target.sendMessageToTarget` and every
//! reply or event comes back inside `Target.dispatchMessageFromTarget`:
//!
//! ```json
//! { "id": 5, "method": "Target.sendMessageToTarget",
//!   "params": { "id": 5, "message": "{\"id\":5,...}", "targetId": "page-1" } }
//!
//! { "method": "Target.dispatchMessageFromTarget",
//!   "params": { "targetId": "page-1", "message": "{\"id\":5,\"result\":{}}" } }
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde_json::{Value, json};

use crate::error::{Error, Result};

use super::message;

// ============================================================================
// Constants
// ============================================================================

/// Domain prefix of methods that are never wrapped.
pub const TARGET_DOMAIN: &str = "Target";

/// Outbound envelope method.
pub const SEND_MESSAGE_TO_TARGET: &str = "Target.sendMessageToTarget";

/// Inbound envelope method.
pub const DISPATCH_MESSAGE_FROM_TARGET: &str = "Target.dispatchMessageFromTarget";

/// Event announcing the inner target id.
pub const TARGET_CREATED: &str = "Target.targetCreated";

// ============================================================================
// Functions
// ============================================================================

/// Returns `true` if the method belongs to the `Target` domain.
#[inline]
#[must_use]
pub fn is_target_domain(method: &str) -> bool {
    method.starts_with(TARGET_DOMAIN)
}

/// Wraps an outbound message unless it already targets the `Target` domain.
///
/// `raw` must be the serialized form of `message`.
#[must_use]
pub fn wrap(message: &Value, raw: &str, target_id: Option<&str>) -> Option<String> {
    if is_target_domain(message::method(message)) {
        return None;
    }

    let id = message.get("id").cloned().unwrap_or(Value::Null);
    let wrapped = json!({
        "id": id,
        "method": SEND_MESSAGE_TO_TARGET,
        "params": {
            "id": id,
            "message": raw,
            "targetId": target_id,
        }
    });

    Some(wrapped.to_string())
}

/// Extracts the inner message carried by `Target.dispatchMessageFromTarget`.
///
/// Returns the parsed inner message together with its raw text.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if `params.message` is missing or not a
/// string, and [`Error::Json`] if it does not parse.
pub fn unwrap(message: &Value) -> Result<(Value, String)> {
    let raw = message
        .get("params")
        .and_then(|p| p.get("message"))
        .and_then(Value::as_str)
        .ok_or_else(|| Error::protocol("dispatchMessageFromTarget without params.message"))?;

    let inner = message::parse(raw)?;
    Ok((inner, raw.to_string()))
}

// ============================================================================
// Tests
// ============================================================================

//! Raw protocol message helpers.
//!
//! Both peers speak JSON-RPC-like frames:
//!
//! ```json
//! { "id": 1, "method": "Domain.command", "params": { ... } }
//! { "id": 1, "result": { ... } }
//! { "id": 1, "error": { "code": -32000, "message": "..." } }
//! { "method": "Domain.event", "params": { ... } }
//! ```
//!
//! Filters rewrite arbitrary shapes, so messages stay as [`Value`] and these
//! helpers only read and build the envelope members.

// ============================================================================
// Imports
// ============================================================================

use serde_json::{Value, json};

use crate::error::Result;
use crate::identifiers::RequestId;

// ============================================================================
// Constants
// ============================================================================

/// Error code used for locally synthesized CDP error replies.
pub const SERVER_ERROR_CODE: i64 = -32000;

// ============================================================================
// Accessors
// ============================================================================

/// Parses a raw text frame.
///
/// # Errors
///
/// Returns [`crate::Error::Json`] if the frame is not valid JSON.
#[inline]
pub fn parse(raw: &str) -> Result<Value> {
    Ok(serde_json::from_str(raw)?)
}

/// Returns the `method` member, or `""` if absent.
#[inline]
#[must_use]
pub fn method(message: &Value) -> &str {
    message
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

/// Returns the integer `id` member, if any.
#[inline]
#[must_use]
pub fn request_id(message: &Value) -> Option<RequestId> {
    message.get("id").and_then(Value::as_i64).map(RequestId::new)
}

/// Returns `true` if the message has an `id` member of any type.
#[inline]
#[must_use]
pub fn has_id(message: &Value) -> bool {
    message.get("id").is_some()
}

/// Returns `true` if the message carries an `error` member.
#[inline]
#[must_use]
pub fn is_error(message: &Value) -> bool {
    message.get("error").is_some()
}

/// Rewrites the `method` member in place.
#[inline]
pub fn rename(message: &mut Value, method: &str) {
    message["method"] = Value::String(method.to_string());
}

// ============================================================================
// Builders
// ============================================================================

/// Builds a request frame.
#[must_use]
pub fn request(id: RequestId, method: &str, params: Value) -> Value {
    json!({ "id": id, "method": method, "params": params })
}

/// Builds an unsolicited event frame.
#[must_use]
pub fn event(method: &str, params: Value) -> Value {
    json!({ "method": method, "params": params })
}

/// Builds a successful reply frame.
#[must_use]
pub fn result(id: RequestId, result: Value) -> Value {
    json!({ "id": id, "result": result })
}

/// Builds an error reply frame.
#[must_use]
pub fn error_reply(id: RequestId, message: &str) -> Value {
    json!({
        "id": id,
        "error": { "code": SERVER_ERROR_CODE, "message": message }
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_defaults_to_empty() {
        assert_eq!(method(&json!({ "id": 1 })), "");
        assert_eq!(method(&json!({ "method": "DOM.enable" })), "DOM.enable");
    }

    #[test]
    fn test_request_id_requires_integer() {
        assert_eq!(request_id(&json!({ "id": 4 })), Some(RequestId::new(4)));
        assert_eq!(request_id(&json!({ "id": "4" })), None);
        assert!(has_id(&json!({ "id": "4" })));
        assert_eq!(request_id(&json!({ "method": "x" })), None);
    }

    #[test]
    fn test_rename_keeps_params() {
        let mut msg = json!({ "id": 3, "method": "Log.enable", "params": { "a": 1 } });
        rename(&mut msg, "Console.enable");
        assert_eq!(msg["method"], "Console.enable");
        assert_eq!(msg["params"]["a"], 1);
    }

    #[test]
    fn test_builders() {
        let reply = result(RequestId::new(9), json!({ "fonts": [] }));
        assert_eq!(reply, json!({ "id": 9, "result": { "fonts": [] } }));

        let failure = error_reply(RequestId::new(9), "gone");
        assert!(is_error(&failure));
        assert_eq!(failure["error"]["code"], SERVER_ERROR_CODE);

        let ev = event("CSS.styleSheetAdded", json!({}));
        assert!(!has_id(&ev));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("{not json").is_err());
        assert!(parse(r#"{"method":"Page.enable"}"#).is_ok());
    }
}

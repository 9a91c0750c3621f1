//! Shared IOS rule set.
//!
//! [`IosProtocol`] registers every filter that turns CDP traffic into
//! WebKit Inspector Protocol traffic and back. It keeps a little per-target
//! scratch state that later messages depend on.
//!
//! # Rule Classes
//!
//! | Class | Direction | Example |
//! |-------|-----------|---------|
//! | Rename | tools | `Log.enable` → `Console.enable` |
//! | Canned reply | tools | `Emulation.canEmulate` → `{result: true}` |
//! | Round trip | tools | `CSS.setStyleTexts` → `getStyleSheet` + `setStyleText` |
//! | Side effect | tools | `DOM.getDocument` also lists stylesheets |
//! | Reshape | target | `Console.messageAdded` → `Log.entryAdded` |

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::try_join_all;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::protocol::{envelope, message};
use crate::target::{FilterKey, Filtered, Target};

use super::Dialect;
use super::css::{self, SelectorStyle};
use super::screencast::{ScreencastOptions, ScreencastSession};

// ============================================================================
// Constants
// ============================================================================

/// Tool methods forwarded under a different name.
const RENAMES: &[(&str, &str)] = &[
    ("Page.setOverlayMessage", "Debugger.setOverlayMessage"),
    ("Page.configureOverlay", "Debugger.setOverlayMessage"),
    ("DOM.setInspectedNode", "Console.addInspectedNode"),
    ("Emulation.setTouchEmulationEnabled", "Page.setTouchEmulationEnabled"),
    ("Emulation.setScriptExecutionDisabled", "Page.setScriptExecutionDisabled"),
    ("Emulation.setEmulatedMedia", "Page.setEmulatedMedia"),
    ("Rendering.setShowPaintRects", "Page.setShowPaintRects"),
    ("Log.clear", "Console.clearMessages"),
    ("Log.disable", "Console.disable"),
    ("Log.enable", "Console.enable"),
    ("Network.getCookies", "Page.getCookies"),
    ("Network.deleteCookie", "Page.deleteCookie"),
    ("Network.setMonitoringXHREnabled", "Console.setMonitoringXHREnabled"),
];

/// Object group for event listener lookups.
const EVENT_LISTENERS_GROUP: &str = "event-listeners-panel";

/// Dispatches a synthetic mouse event at a point.
const SIMULATE_MOUSE_JS: &str = "function simulate(params) { \
const element = document.elementFromPoint(params.x, params.y); \
const e = new MouseEvent(params.type, { \
screenX: params.x, screenY: params.y, clientX: 0, clientY: 0, \
ctrlKey: (params.modifiers & 2) === 2, shiftKey: (params.modifiers & 8) === 8, \
altKey: (params.modifiers & 1) === 1, metaKey: (params.modifiers & 4) === 4, \
button: params.button, bubbles: true, cancelable: false }); \
element.dispatchEvent(e); return element; }";

/// Tool methods answered locally.
fn canned_replies() -> [(&'static str, Value); 8] {
    [
        ("CSS.getPlatformFontsForNode", json!({ "fonts": [] })),
        ("CSS.getBackgroundColors", json!({ "backgroundColors": [] })),
        ("Emulation.canEmulate", json!({ "result": true })),
        ("Network.canEmulateNetworkConditions", json!({ "result": false })),
        ("Debugger.canSetScriptSource", json!({ "result": false })),
        ("Debugger.setBlackboxPatterns", json!({})),
        ("Debugger.setAsyncCallStackDepth", json!({ "result": true })),
        ("DOM.enable", json!({})),
    ]
}

fn highlight_config() -> Value {
    json!({
        "showInfo": true,
        "showRulers": false,
        "showExtensionLines": false,
        "contentColor": { "r": 111, "g": 168, "b": 220, "a": 0.66 },
        "paddingColor": { "r": 147, "g": 196, "b": 125, "a": 0.55 },
        "borderColor": { "r": 255, "g": 229, "b": 153, "a": 0.66 },
        "marginColor": { "r": 246, "g": 178, "b": 107, "a": 0.66 },
        "eventTargetColor": { "r": 255, "g": 196, "b": 196, "a": 0.66 },
        "shapeColor": { "r": 96, "g": 82, "b": 177, "a": 0.8 },
        "shapeMarginColor": { "r": 96, "g": 82, "b": 127, "a": 0.6 },
        "displayAsMaterial": true
    })
}

// ============================================================================
// DialectState
// ============================================================================

#[derive(Debug, Default)]
struct DialectState {
    /// Node of the last `getMatchedStylesForNode`, target of `addRule`.
    last_node_id: Option<Value>,
    /// Script id of the last `Debugger.scriptParsed`.
    last_script_id: Option<Value>,
    screencast: Option<ScreencastSession>,
    /// WebKit style ids keyed by `{styleSheetId}_{range}`.
    style_map: FxHashMap<String, Value>,
}

// ============================================================================
// IosProtocol
// ============================================================================

/// Rule set installed on one target.
#[derive(Debug)]
pub struct IosProtocol {
    dialect: Dialect,
    state: Mutex<DialectState>,
}

impl IosProtocol {
    /// Registers the rule set for `dialect` on `target`.
    pub(crate) fn install(dialect: Dialect, target: &Arc<Target>) -> Arc<Self> {
        let protocol = Arc::new(Self {
            dialect,
            state: Mutex::new(DialectState::default()),
        });

        protocol.register_shared(target);

        match dialect {
            Dialect::Ios8 => {
                protocol.register(target, FilterKey::TargetError, Self::on_error_reply);
            }
            Dialect::Ios9 => {}
            Dialect::Ios12 => {
                target.set_target_based(true);
                protocol.register(
                    target,
                    FilterKey::target(envelope::TARGET_CREATED),
                    Self::on_target_created,
                );
            }
        }

        protocol
    }

    /// Dialect this rule set was installed for.
    #[inline]
    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Returns `true` while a screencast runs.
    #[must_use]
    pub fn is_screencasting(&self) -> bool {
        self.state
            .lock()
            .screencast
            .as_ref()
            .is_some_and(ScreencastSession::is_running)
    }

    fn register<H, Fut>(self: &Arc<Self>, target: &Target, key: FilterKey, handler: H)
    where
        H: Fn(Arc<Self>, Arc<Target>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Filtered>> + Send + 'static,
    {
        let protocol = Arc::clone(self);
        target.add_message_filter(key, move |t, msg| handler(Arc::clone(&protocol), t, msg));
    }

    fn register_shared(self: &Arc<Self>, target: &Target) {
        for &(from, to) in RENAMES {
            target.add_message_filter(FilterKey::tools(from), move |_t, mut msg: Value| async move {
                message::rename(&mut msg, to);
                Ok(Filtered::Forward(msg))
            });
        }

        for (method, reply) in canned_replies() {
            target.add_message_filter(FilterKey::tools(method), move |t: Arc<Target>, msg: Value| {
                let reply = reply.clone();
                async move {
                    if let Some(id) = message::request_id(&msg) {
                        t.fire_result_to_tools(id, reply);
                    }
                    Ok(Filtered::Drop)
                }
            });
        }

        // CSS
        self.register(target, FilterKey::tools("CSS.setStyleTexts"), Self::on_set_style_texts);
        self.register(target, FilterKey::tools("CSS.getMatchedStylesForNode"), Self::on_get_matched_styles);
        self.register(target, FilterKey::tools("CSS.addRule"), Self::on_add_rule);
        self.register(target, FilterKey::target("CSS.getMatchedStylesForNode"), Self::on_matched_styles_result);

        // Page
        self.register(target, FilterKey::tools("Page.startScreencast"), Self::on_start_screencast);
        self.register(target, FilterKey::tools("Page.stopScreencast"), Self::on_stop_screencast);
        self.register(target, FilterKey::tools("Page.screencastFrameAck"), Self::on_screencast_frame_ack);
        self.register(target, FilterKey::tools("Page.getNavigationHistory"), Self::on_get_navigation_history);

        // DOM
        self.register(target, FilterKey::tools("DOM.getDocument"), Self::on_get_document);
        self.register(target, FilterKey::tools("DOM.setInspectMode"), Self::on_set_inspect_mode);
        self.register(target, FilterKey::tools("DOM.pushNodesByBackendIdsToFrontend"), Self::on_push_nodes_by_backend_ids);
        self.register(target, FilterKey::tools("DOM.getBoxModel"), Self::on_get_box_model);
        self.register(target, FilterKey::tools("DOM.getNodeForLocation"), Self::on_get_node_for_location);
        self.register(target, FilterKey::tools("DOMDebugger.getEventListeners"), Self::on_get_event_listeners);

        // Debugger
        self.register(target, FilterKey::tools("Debugger.enable"), Self::on_debugger_enable);
        self.register(target, FilterKey::target("Debugger.scriptParsed"), Self::on_script_parsed);

        // Input
        self.register(target, FilterKey::tools("Input.emulateTouchFromMouseEvent"), Self::on_emulate_touch);

        // Console / Log
        self.register(target, FilterKey::target("Console.messageAdded"), Self::on_console_message_added);

        // Runtime
        self.register(target, FilterKey::tools("Runtime.compileScript"), Self::on_compile_script);
        self.register(target, FilterKey::target("Runtime.executionContextCreated"), Self::on_execution_context_created);
        self.register(target, FilterKey::target("Runtime.evaluate"), Self::on_evaluate_result);
        self.register(target, FilterKey::target("Runtime.getProperties"), Self::on_get_properties_result);

        // Inspector
        self.register(target, FilterKey::target("Inspector.inspect"), Self::on_inspect);
    }
}

// ============================================================================
// IosProtocol - CSS
// ============================================================================

impl IosProtocol {
    async fn on_set_style_texts(self: Arc<Self>, target: Arc<Target>, msg: Value) -> Result<Filtered> {
        let edits = msg["params"]["edits"].as_array().cloned().unwrap_or_default();
        let caller = Arc::clone(&target);

        target.reply_later(message::request_id(&msg), async move {
            let styles = try_join_all(
                edits
                    .into_iter()
                    .map(|edit| self.apply_style_edit(&caller, edit)),
            )
            .await?;
            Ok(json!({ "styles": styles }))
        });

        Ok(Filtered::Drop)
    }

    /// Applies one CDP style edit by locating the WebKit rule ordinal with
    /// the same range.
    async fn apply_style_edit(&self, target: &Target, edit: Value) -> Result<Value> {
        let sheet_id = edit.get("styleSheetId").cloned().unwrap_or(Value::Null);
        let sheet = target
            .call_target("CSS.getStyleSheet", json!({ "styleSheetId": sheet_id }))
            .await?;

        let Some(rules) = sheet
            .get("styleSheet")
            .and_then(|s| s.get("rules"))
            .and_then(Value::as_array)
        else {
            error!(target_id = %target.id(), "iOS returned a value we were not expecting for getStyleSheet");
            return Ok(Value::Null);
        };

        let Some(ordinal) = rules
            .iter()
            .position(|rule| css::ranges_equal(rule.get("style").and_then(|s| s.get("range")), edit.get("range")))
        else {
            return Ok(Value::Null);
        };

        let params = json!({
            "styleId": { "styleSheetId": sheet_id, "ordinal": ordinal },
            "text": edit.get("text").cloned().unwrap_or(Value::Null),
        });
        let mut result = target.call_target("CSS.setStyleText", params).await?;

        let mut style = result.get_mut("style").map(Value::take).unwrap_or(Value::Null);
        css::map_style(&mut style, "", &mut self.state.lock().style_map);
        Ok(style)
    }

    async fn on_get_matched_styles(self: Arc<Self>, _target: Arc<Target>, msg: Value) -> Result<Filtered> {
        self.state.lock().last_node_id = msg["params"].get("nodeId").cloned();
        Ok(Filtered::Forward(msg))
    }

    async fn on_add_rule(self: Arc<Self>, target: Arc<Target>, msg: Value) -> Result<Filtered> {
        let selector = msg["params"]["ruleText"]
            .as_str()
            .unwrap_or_default()
            .trim()
            .replacen("{}", "", 1);
        let node_id = self.state.lock().last_node_id.clone();
        let caller = Arc::clone(&target);

        target.reply_later(message::request_id(&msg), async move {
            let params = json!({ "contextNodeId": node_id, "selector": selector });
            let mut result = caller.call_target("CSS.addRule", params).await?;
            if let Some(rule) = result.get_mut("rule") {
                css::map_rule(rule, self.dialect.selector_style(), &mut self.state.lock().style_map);
            }
            Ok(result)
        });

        Ok(Filtered::Drop)
    }

    async fn on_matched_styles_result(self: Arc<Self>, _target: Arc<Target>, mut msg: Value) -> Result<Filtered> {
        let selectors = self.dialect.selector_style();
        let mut state = self.state.lock();

        if let Some(result) = msg.get_mut("result") {
            if let Some(matched) = result.get_mut("matchedCSSRules").and_then(Value::as_array_mut) {
                map_matched_rules(matched, selectors, &mut state.style_map);
            }

            if let Some(inherited) = result.get_mut("inherited").and_then(Value::as_array_mut) {
                for entry in inherited {
                    if let Some(matched) = entry.get_mut("matchedCSSRules").and_then(Value::as_array_mut) {
                        map_matched_rules(matched, selectors, &mut state.style_map);
                    }
                }
            }
        }

        drop(state);
        Ok(Filtered::Forward(msg))
    }
}

fn map_matched_rules(
    matched: &mut [Value],
    selectors: SelectorStyle,
    style_map: &mut FxHashMap<String, Value>,
) {
    for entry in matched {
        if let Some(rule) = entry.get_mut("rule") {
            css::map_rule(rule, selectors, style_map);
        }
    }
}

// ============================================================================
// IosProtocol - Page
// ============================================================================

impl IosProtocol {
    async fn on_start_screencast(self: Arc<Self>, target: Arc<Target>, msg: Value) -> Result<Filtered> {
        let options = ScreencastOptions::from_params(msg.get("params"));
        let mut session = ScreencastSession::new(&target, options);
        session.start();

        // Replacing the session drops, and so stops, the previous one.
        self.state.lock().screencast = Some(session);

        Ok(target.reply_with_empty(&msg))
    }

    async fn on_stop_screencast(self: Arc<Self>, target: Arc<Target>, msg: Value) -> Result<Filtered> {
        if let Some(mut session) = self.state.lock().screencast.take() {
            session.stop();
        }
        Ok(target.reply_with_empty(&msg))
    }

    async fn on_screencast_frame_ack(self: Arc<Self>, target: Arc<Target>, msg: Value) -> Result<Filtered> {
        if let Some(frame) = msg["params"]["sessionId"].as_u64()
            && let Some(session) = self.state.lock().screencast.as_ref()
        {
            session.ack_frame(frame);
        }
        Ok(target.reply_with_empty(&msg))
    }

    async fn on_get_navigation_history(self: Arc<Self>, target: Arc<Target>, msg: Value) -> Result<Filtered> {
        let caller = Arc::clone(&target);

        target.reply_later(message::request_id(&msg), async move {
            let href = caller
                .call_target("Runtime.evaluate", json!({ "expression": "window.location.href" }))
                .await?;
            let title = caller
                .call_target("Runtime.evaluate", json!({ "expression": "window.title" }))
                .await?;

            Ok(json!({
                "currentIndex": 0,
                "entries": [{
                    "id": 0,
                    "url": href["result"]["value"],
                    "title": title["result"]["value"],
                }]
            }))
        });

        Ok(Filtered::Drop)
    }
}

// ============================================================================
// IosProtocol - DOM
// ============================================================================

impl IosProtocol {
    /// Forwards the request and lists stylesheets alongside.
    async fn on_get_document(self: Arc<Self>, target: Arc<Target>, msg: Value) -> Result<Filtered> {
        let caller = Arc::clone(&target);

        tokio::spawn(async move {
            match caller.call_target("CSS.getAllStyleSheets", json!({})).await {
                Ok(result) => {
                    let headers = result.get("headers").and_then(Value::as_array).cloned();
                    for mut header in headers.unwrap_or_default() {
                        header["isInline"] = json!(false);
                        header["startLine"] = json!(0);
                        header["startColumn"] = json!(0);
                        caller.fire_event_to_tools("CSS.styleSheetAdded", json!({ "header": header }));
                    }
                }
                Err(e) => warn!(target_id = %caller.id(), error = %e, "Stylesheet rundown failed"),
            }
        });

        Ok(Filtered::Forward(msg))
    }

    async fn on_set_inspect_mode(self: Arc<Self>, _target: Arc<Target>, mut msg: Value) -> Result<Filtered> {
        message::rename(&mut msg, "DOM.setInspectModeEnabled");

        if let Some(params) = msg.get_mut("params").and_then(Value::as_object_mut) {
            let enabled = params.remove("mode").and_then(|m| m.as_str().map(|m| m == "searchForNode"));
            params.insert("enabled".into(), json!(enabled.unwrap_or(false)));
        }

        Ok(Filtered::Forward(msg))
    }

    async fn on_push_nodes_by_backend_ids(self: Arc<Self>, target: Arc<Target>, msg: Value) -> Result<Filtered> {
        let backend_ids = msg["params"]["backendNodeIds"].as_array().cloned().unwrap_or_default();
        let caller = Arc::clone(&target);

        target.reply_later(message::request_id(&msg), async move {
            let node_ids = try_join_all(backend_ids.into_iter().map(|backend_id| {
                let caller = Arc::clone(&caller);
                async move {
                    let result = caller
                        .call_target(
                            "DOM.pushNodeByBackendIdToFrontend",
                            json!({ "backendNodeId": backend_id }),
                        )
                        .await?;
                    Ok::<_, Error>(result.get("nodeId").cloned().unwrap_or(Value::Null))
                }
            }))
            .await?;

            Ok(json!({ "nodeIds": node_ids }))
        });

        Ok(Filtered::Drop)
    }

    /// Highlights the node; the tools get no reply.
    async fn on_get_box_model(self: Arc<Self>, target: Arc<Target>, msg: Value) -> Result<Filtered> {
        let params = json!({
            "highlightConfig": highlight_config(),
            "nodeId": msg["params"]["nodeId"],
        });
        target.spawn_call("DOM.highlightNode", params);
        Ok(Filtered::Drop)
    }

    async fn on_get_node_for_location(self: Arc<Self>, target: Arc<Target>, msg: Value) -> Result<Filtered> {
        let expression = format!(
            "document.elementFromPoint({},{})",
            msg["params"]["x"], msg["params"]["y"]
        );
        let caller = Arc::clone(&target);

        target.reply_later(message::request_id(&msg), async move {
            let evaluated = caller
                .call_target("Runtime.evaluate", json!({ "expression": expression }))
                .await?;
            let node = caller
                .call_target(
                    "DOM.requestNode",
                    json!({ "objectId": evaluated["result"]["objectId"] }),
                )
                .await?;
            Ok(json!({ "nodeId": node["nodeId"] }))
        });

        Ok(Filtered::Drop)
    }

    async fn on_get_event_listeners(self: Arc<Self>, target: Arc<Target>, msg: Value) -> Result<Filtered> {
        let object_id = msg["params"]["objectId"].clone();
        let caller = Arc::clone(&target);

        target.reply_later(message::request_id(&msg), async move {
            let node = caller
                .call_target("DOM.requestNode", json!({ "objectId": object_id }))
                .await?;
            let result = caller
                .call_target(
                    "DOM.getEventListenersForNode",
                    json!({ "nodeId": node["nodeId"], "objectGroup": EVENT_LISTENERS_GROUP }),
                )
                .await?;

            let listeners: Vec<Value> = result["listeners"]
                .as_array()
                .map(|listeners| listeners.iter().map(map_event_listener).collect())
                .unwrap_or_default();

            Ok(json!({ "listeners": listeners }))
        });

        Ok(Filtered::Drop)
    }

    async fn on_inspect(self: Arc<Self>, _target: Arc<Target>, mut msg: Value) -> Result<Filtered> {
        message::rename(&mut msg, "DOM.inspectNodeRequested");

        if let Some(params) = msg.get_mut("params").and_then(Value::as_object_mut) {
            let object_id = params
                .remove("object")
                .and_then(|o| o.get("objectId").cloned())
                .unwrap_or(Value::Null);
            params.remove("hints");
            params.insert("backendNodeId".into(), object_id);
        }

        Ok(Filtered::Forward(msg))
    }
}

/// WebKit has no passive listeners.
fn map_event_listener(listener: &Value) -> Value {
    json!({
        "type": listener["type"],
        "useCapture": listener["useCapture"],
        "passive": false,
        "location": listener["location"],
        "handler": listener["handler"],
    })
}

// ============================================================================
// IosProtocol - Debugger & Input
// ============================================================================

impl IosProtocol {
    async fn on_debugger_enable(self: Arc<Self>, target: Arc<Target>, msg: Value) -> Result<Filtered> {
        target.spawn_call("Debugger.setBreakpointsActive", json!({ "active": true }));
        Ok(Filtered::Forward(msg))
    }

    async fn on_script_parsed(self: Arc<Self>, _target: Arc<Target>, msg: Value) -> Result<Filtered> {
        self.state.lock().last_script_id = msg["params"].get("scriptId").cloned();
        Ok(Filtered::Forward(msg))
    }

    /// Replays a mouse event as a DOM `MouseEvent`; the tools get `{}` at once.
    async fn on_emulate_touch(self: Arc<Self>, target: Arc<Target>, msg: Value) -> Result<Filtered> {
        let mut params = msg.get("params").cloned().unwrap_or_else(|| json!({}));

        let mapped = match params["type"].as_str() {
            Some("mousePressed") => Some("mousedown"),
            Some("mouseReleased") => Some("click"),
            Some("mouseMoved") => Some("mousemove"),
            other => {
                error!(target_id = %target.id(), event = ?other, "Unknown emulate mouse event name");
                None
            }
        };
        if let Some(mapped) = mapped {
            params["type"] = json!(mapped);
        }

        let caller = Arc::clone(&target);
        tokio::spawn(async move {
            let expression = format!("({SIMULATE_MOUSE_JS})({params})");
            if let Err(e) = caller
                .call_target("Runtime.evaluate", json!({ "expression": expression }))
                .await
            {
                warn!(target_id = %caller.id(), error = %e, "Mouse emulation failed");
                return;
            }

            if mapped == Some("click") {
                params["type"] = json!("mouseup");
                let expression = format!("({SIMULATE_MOUSE_JS})({params})");
                caller.spawn_call("Runtime.evaluate", json!({ "expression": expression }));
            }
        });

        Ok(target.reply_with_empty(&msg))
    }
}

// ============================================================================
// IosProtocol - Console & Runtime
// ============================================================================

impl IosProtocol {
    /// Re-emits a WebKit console message as `Log.entryAdded`.
    async fn on_console_message_added(self: Arc<Self>, target: Arc<Target>, msg: Value) -> Result<Filtered> {
        let entry = console_entry(&msg["params"]["message"]);
        target.fire_event_to_tools("Log.entryAdded", json!({ "entry": entry }));
        Ok(Filtered::Drop)
    }

    async fn on_compile_script(self: Arc<Self>, target: Arc<Target>, msg: Value) -> Result<Filtered> {
        let params = json!({
            "expression": msg["params"]["expression"],
            "contextId": msg["params"]["executionContextId"],
        });
        let caller = Arc::clone(&target);

        target.reply_later(message::request_id(&msg), async move {
            caller.call_target("Runtime.evaluate", params).await?;
            Ok(json!({ "scriptId": null, "exceptionDetails": null }))
        });

        Ok(Filtered::Drop)
    }

    async fn on_execution_context_created(self: Arc<Self>, _target: Arc<Target>, mut msg: Value) -> Result<Filtered> {
        let Some(context) = msg
            .get_mut("params")
            .and_then(|p| p.get_mut("context"))
            .and_then(Value::as_object_mut)
        else {
            return Ok(Filtered::Forward(msg));
        };

        if !context.get("origin").is_some_and(truthy) {
            let name = context.get("name").cloned().unwrap_or(Value::Null);
            context.insert("origin".into(), name);
        }

        if let Some(frame_id) = context.remove("frameId").filter(truthy) {
            context.insert("auxData".into(), json!({ "frameId": frame_id, "isDefault": true }));
        }

        Ok(Filtered::Forward(msg))
    }

    async fn on_evaluate_result(self: Arc<Self>, _target: Arc<Target>, mut msg: Value) -> Result<Filtered> {
        let script_id = self.state.lock().last_script_id.clone().unwrap_or(Value::Null);

        let Some(result) = msg.get_mut("result").and_then(Value::as_object_mut) else {
            return Ok(Filtered::Forward(msg));
        };

        if result.get("wasThrown").is_some_and(truthy) {
            let description = result
                .get("result")
                .and_then(|r| r.get("description"))
                .cloned()
                .unwrap_or(Value::Null);
            if let Some(inner) = result.get_mut("result").and_then(Value::as_object_mut) {
                inner.insert("subtype".into(), json!("error"));
            }
            result.insert(
                "exceptionDetails".into(),
                json!({
                    "text": description,
                    "url": "",
                    "scriptId": script_id,
                    "line": 1,
                    "column": 0,
                    "stack": {
                        "callFrames": [{
                            "functionName": "",
                            "scriptId": script_id,
                            "url": "",
                            "lineNumber": 1,
                            "columnNumber": 1
                        }]
                    }
                }),
            );
        } else if let Some(inner) = result.get_mut("result").and_then(Value::as_object_mut) {
            let description = inner.get("description").cloned().unwrap_or(Value::Null);
            if let Some(preview) = inner.get_mut("preview").and_then(Value::as_object_mut) {
                preview.insert("description".into(), description);
                preview.insert("type".into(), json!("object"));
            }
        }

        Ok(Filtered::Forward(msg))
    }

    /// Keeps own and native-getter properties, all marked own.
    async fn on_get_properties_result(self: Arc<Self>, _target: Arc<Target>, mut msg: Value) -> Result<Filtered> {
        if let Some(descriptors) = msg
            .get_mut("result")
            .and_then(|r| r.get_mut("result"))
            .and_then(Value::as_array_mut)
        {
            descriptors.retain(|d| d.get("isOwn").is_some_and(truthy) || d.get("nativeGetter").is_some_and(truthy));
            for descriptor in descriptors.iter_mut() {
                descriptor["isOwn"] = json!(true);
            }
        }

        Ok(Filtered::Forward(msg))
    }
}

/// Builds a CDP `LogEntry` from a WebKit console message.
fn console_entry(message: &Value) -> Value {
    let level = match message["type"].as_str() {
        Some("log") => match message["level"].as_str() {
            Some(level @ ("log" | "info" | "error")) => json!(level),
            _ => json!("log"),
        },
        _ => message["type"].clone(),
    };

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();

    let mut entry = json!({
        "source": message["source"],
        "level": level,
        "text": message["text"],
        "lineNumber": message["line"],
        "timestamp": timestamp,
        "url": message["url"],
        "networkRequestId": message["networkRequestId"],
    });

    if let Some(stack) = message.get("stackTrace").filter(|s| truthy(s)) {
        entry["stackTrace"] = json!({ "callFrames": stack });
    }

    entry
}

// ============================================================================
// IosProtocol - Dialect Specific
// ============================================================================

impl IosProtocol {
    /// Turns device errors into empty results.
    async fn on_error_reply(self: Arc<Self>, target: Arc<Target>, msg: Value) -> Result<Filtered> {
        error!(target_id = %target.id(), error = %msg["error"], "Error received (overriding)");
        Ok(Filtered::Forward(json!({ "id": msg["id"], "result": {} })))
    }

    /// Captures the inspector-internal target id for the envelope.
    async fn on_target_created(self: Arc<Self>, target: Arc<Target>, msg: Value) -> Result<Filtered> {
        if let Some(id) = msg["params"]["targetInfo"]["targetId"].as_str() {
            target.set_inner_target_id(id);
        }
        Ok(Filtered::Forward(msg))
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ============================================================================
// Tests
// ============================================================================

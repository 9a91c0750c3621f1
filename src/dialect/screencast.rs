//! Polling screencast emulation.
//!
//! WebKit has no push screencast, so frames are pulled with
//! `Page.snapshotRect` on a fixed interval and pushed to the tools as
//! `Page.screencastFrame` events. A frame is only captured once the tools
//! acknowledged the previous one.

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as Base64Standard;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::target::Target;

// ============================================================================
// Constants
// ============================================================================

/// Default capture interval.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(250);

const VIEWPORT_EXPRESSION: &str = "(window.innerWidth > 0 ? window.innerWidth : screen.width) + \",\" + (window.innerHeight > 0 ? window.innerHeight : screen.height) + \",\" + window.devicePixelRatio";

const OFFSETS_EXPRESSION: &str =
    "window.document.body.offsetTop + \",\" + window.pageXOffset + \",\" + window.pageYOffset";

const DATA_URL_MARKER: &str = "base64,";

// ============================================================================
// ScreencastOptions
// ============================================================================

/// Parameters of `Page.startScreencast`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreencastOptions {
    /// Image format, `jpg` unless requested otherwise.
    pub format: String,
    /// Compression quality.
    pub quality: u64,
    /// Maximum frame width.
    pub max_width: u64,
    /// Maximum frame height.
    pub max_height: u64,
    /// Capture interval.
    pub interval: Duration,
}

impl Default for ScreencastOptions {
    fn default() -> Self {
        Self {
            format: "jpg".to_string(),
            quality: 100,
            max_width: 1024,
            max_height: 1024,
            interval: DEFAULT_FRAME_INTERVAL,
        }
    }
}

impl ScreencastOptions {
    /// Reads options from `Page.startScreencast` params.
    #[must_use]
    pub fn from_params(params: Option<&Value>) -> Self {
        let defaults = Self::default();
        let Some(params) = params else {
            return defaults;
        };

        Self {
            format: params
                .get("format")
                .and_then(Value::as_str)
                .map_or(defaults.format, str::to_string),
            quality: params
                .get("quality")
                .and_then(Value::as_u64)
                .unwrap_or(defaults.quality),
            max_width: params
                .get("maxWidth")
                .and_then(Value::as_u64)
                .unwrap_or(defaults.max_width),
            max_height: params
                .get("maxHeight")
                .and_then(Value::as_u64)
                .unwrap_or(defaults.max_height),
            interval: defaults.interval,
        }
    }

    /// Sets the capture interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

// ============================================================================
// Types
// ============================================================================

/// Viewport reported once at session start.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Viewport {
    width: f64,
    height: f64,
    page_scale_factor: f64,
}

impl Viewport {
    /// Parses the `width,height,scale` string; every part is truncated.
    fn from_reply(reply: &Value) -> Self {
        let parts = split_numbers(reply);

        Self {
            width: parts.first().copied().unwrap_or_default().trunc(),
            height: parts.get(1).copied().unwrap_or_default().trunc(),
            page_scale_factor: parts.get(2).copied().unwrap_or(1.0).trunc(),
        }
    }
}

#[derive(Debug)]
struct FrameState {
    /// Number the next captured frame gets.
    next_frame: u64,
    acked: FxHashSet<u64>,
}

impl Default for FrameState {
    fn default() -> Self {
        Self {
            next_frame: 1,
            acked: FxHashSet::default(),
        }
    }
}

impl FrameState {
    /// Claims the next frame number unless the previous frame is unacked.
    fn claim(&mut self) -> Option<u64> {
        let current = self.next_frame;
        if current > 1 && !self.acked.contains(&(current - 1)) {
            return None;
        }
        self.next_frame += 1;
        Some(current)
    }
}

// ============================================================================
// ScreencastSession
// ============================================================================

/// One running screencast on a target.
///
/// Dropping the session stops it.
#[derive(Debug)]
pub struct ScreencastSession {
    target: Weak<Target>,
    options: ScreencastOptions,
    frames: Arc<Mutex<FrameState>>,
    task: Option<JoinHandle<()>>,
}

impl ScreencastSession {
    /// Creates a stopped session.
    #[must_use]
    pub fn new(target: &Arc<Target>, options: ScreencastOptions) -> Self {
        Self {
            target: Arc::downgrade(target),
            options,
            frames: Arc::default(),
            task: None,
        }
    }

    /// Options the session was created with.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &ScreencastOptions {
        &self.options
    }

    /// Returns `true` while the capture loop runs.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Queries the viewport and starts the capture loop.
    ///
    /// A running loop is stopped first.
    pub fn start(&mut self) {
        self.stop();
        *self.frames.lock() = FrameState::default();

        let target = self.target.clone();
        let frames = Arc::clone(&self.frames);
        let period = self.options.interval;

        self.task = Some(tokio::spawn(async move {
            run_capture_loop(target, frames, period).await;
        }));
    }

    /// Marks frame `frame` acknowledged.
    pub fn ack_frame(&self, frame: u64) {
        self.frames.lock().acked.insert(frame);
    }

    /// Stops the capture loop.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Screencast stopped");
        }
    }
}

impl Drop for ScreencastSession {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Capture Loop
// ============================================================================

async fn run_capture_loop(target: Weak<Target>, frames: Arc<Mutex<FrameState>>, period: Duration) {
    let viewport = {
        let Some(strong) = target.upgrade() else {
            return;
        };
        match query_viewport(&strong).await {
            Ok(viewport) => viewport,
            Err(e) => {
                warn!(target_id = %strong.id(), error = %e, "Screencast viewport query failed");
                return;
            }
        }
    };

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let Some(frame) = frames.lock().claim() else {
            continue;
        };
        let Some(strong) = target.upgrade() else {
            return;
        };

        if let Err(e) = capture_frame(&strong, viewport, frame).await {
            debug!(target_id = %strong.id(), frame, error = %e, "Screencast frame skipped");
        }
    }
}

async fn query_viewport(target: &Target) -> Result<Viewport> {
    let reply = target
        .call_target("Runtime.evaluate", json!({ "expression": VIEWPORT_EXPRESSION }))
        .await?;
    Ok(Viewport::from_reply(&reply))
}

async fn capture_frame(target: &Target, viewport: Viewport, frame: u64) -> Result<()> {
    let offsets = target
        .call_target("Runtime.evaluate", json!({ "expression": OFFSETS_EXPRESSION }))
        .await?;

    if offsets.get("wasThrown").and_then(Value::as_bool) == Some(true) {
        return Err(Error::protocol("offset evaluation threw"));
    }

    let parts = split_numbers(&offsets);
    let offset_top = parts.first().copied().unwrap_or_default().trunc();
    let scroll_x = parts.get(1).copied().unwrap_or_default().trunc();
    let scroll_y = parts.get(2).copied().unwrap_or_default().trunc();

    let snapshot = target
        .call_target(
            "Page.snapshotRect",
            json!({
                "x": 0,
                "y": 0,
                "width": viewport.width,
                "height": viewport.height,
                "coordinateSystem": "Viewport",
            }),
        )
        .await?;

    let data_url = snapshot
        .get("dataURL")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::protocol("snapshotRect without dataURL"))?;
    let data = data_url
        .find(DATA_URL_MARKER)
        .map_or(data_url, |index| &data_url[index + DATA_URL_MARKER.len()..]);

    if let Err(e) = Base64Standard.decode(data) {
        return Err(Error::protocol(format!("invalid frame payload: {e}")));
    }

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();

    target.fire_event_to_tools(
        "Page.screencastFrame",
        json!({
            "data": data,
            "metadata": {
                "pageScaleFactor": viewport.page_scale_factor,
                "offsetTop": offset_top,
                "deviceWidth": viewport.width,
                "deviceHeight": viewport.height,
                "scrollOffsetX": scroll_x,
                "scrollOffsetY": scroll_y,
                "timestamp": timestamp,
            },
            "sessionId": frame,
        }),
    );

    Ok(())
}

/// Parses the comma separated string value of an evaluation reply.
fn split_numbers(reply: &Value) -> Vec<f64> {
    reply
        .get("result")
        .and_then(|r| r.get("value"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .split(',')
        .map(|part| part.trim().parse::<f64>().unwrap_or_default())
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_support::{FakeDevice, connected_target, next_tool_frame};

    const PIXEL: &str = "iVBORw0KGgo=";

    #[test]
    fn test_options_from_params() {
        let options = ScreencastOptions::from_params(Some(&json!({
            "format": "png", "quality": 80, "maxWidth": 800
        })));
        assert_eq!(options.format, "png");
        assert_eq!(options.quality, 80);
        assert_eq!(options.max_width, 800);
        assert_eq!(options.max_height, 1024);
        assert_eq!(ScreencastOptions::from_params(None), ScreencastOptions::default());
    }

    #[test]
    fn test_claim_waits_for_ack() {
        let mut state = FrameState::default();
        assert_eq!(state.claim(), Some(1));
        assert_eq!(state.claim(), None);
        assert_eq!(state.claim(), None);

        state.acked.insert(1);
        assert_eq!(state.claim(), Some(2));
        assert_eq!(state.claim(), None);
    }

    #[test]
    fn test_viewport_parts_are_truncated() {
        let reply = json!({ "result": { "value": "375.6,667.2,2.75" } });
        assert_eq!(
            Viewport::from_reply(&reply),
            Viewport {
                width: 375.0,
                height: 667.0,
                page_scale_factor: 2.0,
            }
        );
    }

    #[test]
    fn test_split_numbers() {
        let reply = json!({ "result": { "type": "string", "value": "375,667,2" } });
        assert_eq!(split_numbers(&reply), vec![375.0, 667.0, 2.0]);
        assert_eq!(split_numbers(&json!({})), vec![0.0]);
    }

    /// Answers the viewport query and one frame's evaluations.
    async fn answer_frame(device: &mut FakeDevice, expect_viewport: bool) {
        if expect_viewport {
            let request = device.recv().await;
            assert_eq!(request["params"]["expression"], VIEWPORT_EXPRESSION);
            device.send(&json!({
                "id": request["id"],
                "result": { "result": { "type": "string", "value": "320,480,2" } }
            }));
        }

        let request = device.recv().await;
        assert_eq!(request["params"]["expression"], OFFSETS_EXPRESSION);
        device.send(&json!({
            "id": request["id"],
            "result": { "result": { "type": "string", "value": "0,0,10" }, "wasThrown": false }
        }));

        let request = device.recv().await;
        assert_eq!(request["method"], "Page.snapshotRect");
        assert_eq!(request["params"]["width"], 320.0);
        device.send(&json!({
            "id": request["id"],
            "result": { "dataURL": format!("data:image/png;base64,{PIXEL}") }
        }));
    }

    #[tokio::test]
    async fn test_unacked_frame_blocks_capture() {
        let mut device = FakeDevice::start().await;
        let (target, mut rx) = connected_target(&device).await;

        let options = ScreencastOptions::default().with_interval(Duration::from_millis(20));
        let mut session = ScreencastSession::new(&target, options);
        session.start();

        answer_frame(&mut device, true).await;

        let frame = next_tool_frame(&mut rx).await;
        assert_eq!(frame["method"], "Page.screencastFrame");
        assert_eq!(frame["params"]["sessionId"], 1);
        assert_eq!(frame["params"]["data"], PIXEL);
        assert_eq!(frame["params"]["metadata"]["scrollOffsetY"], 10.0);

        assert!(device.is_quiet(Duration::from_millis(200)).await);

        session.ack_frame(1);
        answer_frame(&mut device, false).await;
        let frame = next_tool_frame(&mut rx).await;
        assert_eq!(frame["params"]["sessionId"], 2);

        session.stop();
        assert!(!session.is_running());
    }
}

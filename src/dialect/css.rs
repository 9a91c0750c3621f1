//! CSS shape conversion between WebKit and CDP.
//!
//! WebKit reports commented-out declarations only inside `cssText`; CDP
//! expects them as `cssProperties` entries with `disabled: true`. WebKit
//! addresses rules by ordinal, CDP by source range.

// ============================================================================
// Imports
// ============================================================================

use std::sync::LazyLock;

use regex::Regex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

// ============================================================================
// Constants
// ============================================================================

/// Opening marker of a disabled declaration.
pub const BEGIN_COMMENT: &str = "/* ";

/// Closing marker of a disabled declaration.
pub const END_COMMENT: &str = " */";

/// Rule origin whose styles are not editable.
const USER_AGENT_ORIGIN: &str = "user-agent";

static COMMENT_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/\*\s*").expect("comment open regex"));

static COMMENT_CLOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r";\s*\*/$").expect("comment close regex"));

// ============================================================================
// Types
// ============================================================================

/// Line/column span inside a stylesheet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRange {
    pub start_line: u64,
    pub start_column: u64,
    pub end_line: u64,
    pub end_column: u64,
}

impl SourceRange {
    /// Reads a range from a JSON member, if well formed.
    #[must_use]
    pub fn from_value(value: Option<&Value>) -> Option<Self> {
        value.and_then(|v| Self::deserialize(v).ok())
    }
}

/// A `/* ... */` block found in a style's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisabledStyle {
    /// The comment including its markers.
    pub content: String,
    /// Where the comment sits in the stylesheet.
    pub range: SourceRange,
}

/// Line and column of a character offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineColumn {
    pub line: u64,
    pub column: u64,
}

/// How a dialect reshapes `selectorList.selectors`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorStyle {
    /// Selectors arrive as bare strings and are boxed into `{text}`.
    Boxed,
    /// Selectors already are objects.
    Plain,
}

// ============================================================================
// Text Scanning
// ============================================================================

/// Converts a character offset into a line/column, counting from `start`.
///
/// `\r\n`, `\r` and `\n` each end a line. Returns `None` if `index` is past
/// the end of `text`.
#[must_use]
pub fn line_column_from_index(
    text: &str,
    index: usize,
    start: Option<&SourceRange>,
) -> Option<LineColumn> {
    let chars: Vec<char> = text.chars().collect();
    line_column(&chars, index, start)
}

fn line_column(chars: &[char], index: usize, start: Option<&SourceRange>) -> Option<LineColumn> {
    if index > chars.len() {
        return None;
    }

    let mut line = start.map_or(0, |r| r.start_line);
    let mut column = start.map_or(0, |r| r.start_column);

    let mut i = 0;
    while i < chars.len() && i < index {
        match chars[i] {
            '\r' if chars.get(i + 1) == Some(&'\n') => {
                i += 1;
                line += 1;
                column = 0;
            }
            '\r' | '\n' => {
                line += 1;
                column = 0;
            }
            _ => column += 1,
        }
        i += 1;
    }

    Some(LineColumn { line, column })
}

/// Finds every `/* ... */` block in `text`.
///
/// Unbalanced markers yield an empty list.
#[must_use]
pub fn extract_disabled_styles(text: &str, range: Option<&SourceRange>) -> Vec<DisabledStyle> {
    let chars: Vec<char> = text.chars().collect();
    let begin: Vec<char> = BEGIN_COMMENT.chars().collect();
    let end: Vec<char> = END_COMMENT.chars().collect();

    let mut starts = Vec::new();
    let mut styles = Vec::new();
    let mut index = 0;

    while index < chars.len() {
        if chars[index..].starts_with(&begin) {
            starts.push(index);
            index += begin.len();
            continue;
        }

        if chars[index..].starts_with(&end) {
            let Some(start_index) = starts.pop() else {
                return Vec::new();
            };
            let end_index = index + end.len();

            let (Some(from), Some(to)) = (
                line_column(&chars, start_index, range),
                line_column(&chars, end_index, range),
            ) else {
                return Vec::new();
            };

            styles.push(DisabledStyle {
                content: chars[start_index..end_index].iter().collect(),
                range: SourceRange {
                    start_line: from.line,
                    start_column: from.column,
                    end_line: to.line,
                    end_column: to.column,
                },
            });

            index = end_index;
            continue;
        }

        index += 1;
    }

    if !starts.is_empty() {
        return Vec::new();
    }

    styles
}

/// Returns `true` if both values describe the same range.
#[must_use]
pub fn ranges_equal(left: Option<&Value>, right: Option<&Value>) -> bool {
    match (SourceRange::from_value(left), SourceRange::from_value(right)) {
        (Some(l), Some(r)) => l == r,
        _ => false,
    }
}

// ============================================================================
// Shape Mapping
// ============================================================================

/// Maps one WebKit CSS property in place.
///
/// `status` becomes the `disabled` flag and `priority` the `important` flag.
pub fn map_css_property(property: &mut Value) {
    let Some(obj) = property.as_object_mut() else {
        return;
    };

    match obj.remove("status").as_ref().and_then(Value::as_str) {
        Some("disabled") => {
            obj.insert("disabled".into(), Value::Bool(true));
        }
        Some("active") => {
            obj.insert("disabled".into(), Value::Bool(false));
        }
        _ => {}
    }

    let important = obj.remove("priority").is_some_and(|p| truthy(&p));
    obj.insert("important".into(), Value::Bool(important));
}

/// Reshapes a selector list in place.
///
/// The list-level `range` moves onto every selector.
pub fn map_selector_list(selector_list: &mut Value, style: SelectorStyle) {
    let Some(obj) = selector_list.as_object_mut() else {
        return;
    };

    let range = obj.remove("range");

    if let Some(selectors) = obj.get_mut("selectors").and_then(Value::as_array_mut) {
        for selector in selectors.iter_mut() {
            if style == SelectorStyle::Boxed {
                *selector = json!({ "text": selector.take() });
            }
            if let (Some(range), Some(entry)) = (&range, selector.as_object_mut()) {
                entry.insert("range".into(), range.clone());
            }
        }
    }
}

/// Maps a WebKit style in place.
///
/// Recovers disabled declarations from `cssText`, maps every property and,
/// unless the rule is a user-agent rule, records the WebKit style id under
/// `{styleSheetId}_{range}` in `style_map`.
pub fn map_style(style: &mut Value, origin: &str, style_map: &mut FxHashMap<String, Value>) {
    let Some(obj) = style.as_object_mut() else {
        return;
    };

    let css_text = obj
        .get("cssText")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_owned);

    if let Some(css_text) = css_text {
        let range = SourceRange::from_value(obj.get("range"));
        let disabled = extract_disabled_styles(&css_text, range.as_ref());

        if let Some(properties) = obj.get_mut("cssProperties").and_then(Value::as_array_mut) {
            for entry in disabled {
                let index = insertion_index(properties, &entry.range);
                properties.insert(index, disabled_property(&entry));
            }
        }
    }

    if let Some(properties) = obj.get_mut("cssProperties").and_then(Value::as_array_mut) {
        properties.iter_mut().for_each(map_css_property);
    }

    if origin != USER_AGENT_ORIGIN {
        let style_id = obj.get("styleId").cloned();
        let sheet_id = style_id
            .as_ref()
            .and_then(|s| s.get("styleSheetId"))
            .cloned();

        if let (Some(style_id), Some(sheet_id)) = (style_id, sheet_id) {
            let range = obj
                .get("range")
                .map_or_else(|| "undefined".to_string(), Value::to_string);
            let key = format!("{}_{}", plain(&sheet_id), range);

            obj.insert("styleSheetId".into(), sheet_id);
            style_map.insert(key, style_id);
        }
    }

    for stale in ["styleId", "sourceLine", "sourceURL", "width", "height"] {
        obj.remove(stale);
    }
}

/// Maps a WebKit rule in place.
pub fn map_rule(
    rule: &mut Value,
    selectors: SelectorStyle,
    style_map: &mut FxHashMap<String, Value>,
) {
    let Some(obj) = rule.as_object_mut() else {
        return;
    };

    if let Some(rule_id) = obj.remove("ruleId") {
        let sheet_id = rule_id.get("styleSheetId").cloned().unwrap_or(Value::Null);
        obj.insert("styleSheetId".into(), sheet_id);
    }

    if let Some(selector_list) = obj.get_mut("selectorList") {
        map_selector_list(selector_list, selectors);
    }

    let origin = obj
        .get("origin")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if let Some(style) = obj.get_mut("style") {
        map_style(style, &origin, style_map);
    }

    obj.remove("sourceLine");
}

// ============================================================================
// Helpers
// ============================================================================

/// Position of the first property starting after `range`.
fn insertion_index(properties: &[Value], range: &SourceRange) -> usize {
    properties
        .iter()
        .position(|p| {
            SourceRange::from_value(p.get("range")).is_some_and(|r| {
                r.start_line > range.start_line
                    || (r.start_line == range.start_line && r.start_column > range.start_column)
            })
        })
        .unwrap_or(properties.len())
}

/// Builds a WebKit-shaped property entry for a disabled declaration.
fn disabled_property(style: &DisabledStyle) -> Value {
    let trimmed = style.content.trim();
    let opened = COMMENT_OPEN_RE.replace(trimmed, "");
    let text = COMMENT_CLOSE_RE.replace(&opened, "");
    let mut parts = text.split(':');

    let mut property = Map::new();
    property.insert("implicit".into(), Value::Bool(false));
    property.insert("name".into(), json!(parts.next().unwrap_or_default()));
    property.insert("range".into(), json!(style.range));
    property.insert("status".into(), json!("disabled"));
    property.insert("text".into(), json!(style.content));
    if let Some(value) = parts.next() {
        property.insert("value".into(), json!(value));
    }

    Value::Object(property)
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

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================

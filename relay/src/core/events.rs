//! Decoding of the agent's newline-delimited JSON output.
//!
//! Each stdout line decodes on its own. A line that is not a JSON object is
//! reported as [`Decoded::Malformed`] and never aborts the session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse classification of an agent event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Text,
    ToolUse,
    Result,
    Other,
}

/// One structured observation from the agent's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    /// 1-indexed line number in the agent's stdout.
    pub line: usize,
    pub kind: EventKind,
    /// Assistant or result text, when the event carries any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Tool name for tool invocations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub raw: Value,
}

/// A stdout line that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedLine {
    pub line: usize,
    pub error: String,
    pub raw: String,
}

/// Outcome of decoding a single line.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(SessionEvent),
    Malformed(SkippedLine),
    /// Whitespace-only line.
    Blank,
}

/// Maximum number of raw bytes kept for a malformed line.
const SKIPPED_RAW_LIMIT: usize = 512;

/// Decode one line of agent output.
pub fn decode_line(line_no: usize, line: &str) -> Decoded {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Decoded::Blank;
    }
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(err) => return malformed(line_no, trimmed, err.to_string()),
    };
    if !value.is_object() {
        return malformed(line_no, trimmed, "expected a JSON object".to_string());
    }
    Decoded::Event(classify(line_no, value))
}

fn malformed(line_no: usize, raw: &str, error: String) -> Decoded {
    let mut end = raw.len().min(SKIPPED_RAW_LIMIT);
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    Decoded::Malformed(SkippedLine {
        line: line_no,
        error,
        raw: raw[..end].to_string(),
    })
}

fn classify(line_no: usize, raw: Value) -> SessionEvent {
    let event_type = raw.get("type").and_then(Value::as_str).unwrap_or_default();
    let (kind, text, tool) = match event_type {
        "assistant" => classify_assistant(&raw),
        "text" => (EventKind::Text, string_field(&raw, "text"), None),
        "tool_use" => (
            EventKind::ToolUse,
            None,
            string_field(&raw, "tool").or_else(|| string_field(&raw, "name")),
        ),
        "result" => (EventKind::Result, string_field(&raw, "result"), None),
        _ => (EventKind::Other, None, None),
    };
    SessionEvent {
        line: line_no,
        kind,
        text,
        tool,
        raw,
    }
}

/// Assistant messages are either a plain string or a content-block list;
/// a message whose only blocks are tool calls counts as a tool invocation.
fn classify_assistant(raw: &Value) -> (EventKind, Option<String>, Option<String>) {
    let Some(message) = raw.get("message") else {
        return (EventKind::Text, None, None);
    };
    if let Some(text) = message.as_str() {
        return (EventKind::Text, non_blank(text), None);
    }

    let blocks = message
        .get("content")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let mut texts = Vec::new();
    let mut tool = None;
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    texts.push(text.to_string());
                }
            }
            Some("tool_use") if tool.is_none() => {
                tool = string_field(block, "name");
            }
            _ => {}
        }
    }

    let text = non_blank(&texts.join("\n"));
    if text.is_none() && tool.is_some() {
        return (EventKind::ToolUse, None, tool);
    }
    (EventKind::Text, text, tool)
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).and_then(non_blank)
}

fn non_blank(text: &str) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Extract plan text from a planning session: assistant text blocks followed
/// by the final result, joined with blank lines. `None` when nothing usable.
pub fn extract_plan_text(events: &[SessionEvent]) -> Option<String> {
    let parts: Vec<&str> = events
        .iter()
        .filter(|event| matches!(event.kind, EventKind::Text | EventKind::Result))
        .filter_map(|event| event.text.as_deref())
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(line: &str) -> SessionEvent {
        match decode_line(1, line) {
            Decoded::Event(event) => event,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn decodes_assistant_content_blocks() {
        let e = event(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Step 1"},{"type":"text","text":"Step 2"}]}}"#,
        );
        assert_eq!(e.kind, EventKind::Text);
        assert_eq!(e.text.as_deref(), Some("Step 1\nStep 2"));
    }

    #[test]
    fn assistant_with_only_tool_blocks_is_tool_use() {
        let e = event(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Edit","input":{}}]}}"#,
        );
        assert_eq!(e.kind, EventKind::ToolUse);
        assert_eq!(e.tool.as_deref(), Some("Edit"));
    }

    #[test]
    fn decodes_result_and_other() {
        let e = event(r#"{"type":"result","result":"done","cost_usd":0.01}"#);
        assert_eq!(e.kind, EventKind::Result);
        assert_eq!(e.text.as_deref(), Some("done"));

        let e = event(r#"{"type":"system","subtype":"init"}"#);
        assert_eq!(e.kind, EventKind::Other);
    }

    #[test]
    fn malformed_and_non_object_lines_are_reported() {
        assert!(matches!(decode_line(3, "{not json"), Decoded::Malformed(s) if s.line == 3));
        assert!(matches!(decode_line(4, "[1,2]"), Decoded::Malformed(_)));
        assert_eq!(decode_line(5, "   "), Decoded::Blank);
    }

    #[test]
    fn plan_text_joins_text_and_result() {
        let events = vec![
            event(r#"{"type":"assistant","message":"Analyze the parser"}"#),
            event(r#"{"type":"tool_use","tool":"Read"}"#),
            event(r#"{"type":"result","result":"1. change lexer"}"#),
        ];
        assert_eq!(
            extract_plan_text(&events).as_deref(),
            Some("Analyze the parser\n\n1. change lexer")
        );
        assert_eq!(extract_plan_text(&events[1..2]), None);
    }
}

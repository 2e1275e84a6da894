//! Progress event wire type
//!
//! Events are serialized as JSON objects tagged by `"event"`:
//!
//! ```text
//! {"event":"node","node":"classify_initial","message":"...","details":{...}}
//! {"event":"complete"}
//! ```
//!
//! Consumers must tolerate event shapes they do not know. [`ProgressEvent::parse`]
//! maps any unrecognized tag to [`ProgressEvent::Unknown`] instead of failing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Progress event emitted while an evaluation runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A stage finished and its update was merged
    Node {
        /// Stage name (snake_case)
        node: String,
        /// Human-readable description of what the stage did
        message: String,
        /// Stage-specific structured details
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },

    /// Terminal sentinel; nothing follows it
    Complete,

    /// Any event shape this version does not understand
    #[serde(other)]
    Unknown,
}

impl ProgressEvent {
    /// Build a stage event
    pub fn node(node: impl Into<String>, message: impl Into<String>, details: Option<Value>) -> Self {
        Self::Node {
            node: node.into(),
            message: message.into(),
            details,
        }
    }

    /// True for the completion sentinel
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }

    /// Stage name for node events
    pub fn node_name(&self) -> Option<&str> {
        match self {
            Self::Node { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Parse one JSON event, tolerating unknown shapes
    ///
    /// Returns `None` only when the input is not a JSON object at all.
    pub fn parse(json: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(json).ok()?;
        if !value.is_object() {
            return None;
        }
        Some(serde_json::from_value(value).unwrap_or(Self::Unknown))
    }

    /// Encode as a single SSE `data:` frame (`data: <json>\n\n`)
    pub fn to_sse_frame(&self) -> String {
        // Serializing this enum cannot fail: every payload is already a JSON value.
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("data: {}\n\n", json)
    }
}

/// Extract the payload of an SSE `data:` line and parse it
///
/// Comment lines, blank lines and non-data fields yield `None`.
pub fn parse_sse_line(line: &str) -> Option<ProgressEvent> {
    let payload = line.strip_prefix("data:")?.trim();
    ProgressEvent::parse(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_complete_sentinel_shape() {
        let json = serde_json::to_string(&ProgressEvent::Complete).unwrap();
        assert_eq!(json, r#"{"event":"complete"}"#);
    }

    #[test]
    fn test_node_event_shape() {
        let event = ProgressEvent::node(
            "classify_initial",
            "Initial classification: unsure.",
            Some(json!({"candidate_id": "12"})),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "node");
        assert_eq!(value["node"], "classify_initial");
        assert_eq!(value["details"]["candidate_id"], "12");
    }

    #[test]
    fn test_unknown_event_is_tolerated() {
        let parsed = ProgressEvent::parse(r#"{"event":"heartbeat","seq":3}"#);
        assert_eq!(parsed, Some(ProgressEvent::Unknown));
    }

    #[test]
    fn test_missing_tag_is_tolerated() {
        let parsed = ProgressEvent::parse(r#"{"foo":1}"#);
        assert_eq!(parsed, Some(ProgressEvent::Unknown));
        assert_eq!(ProgressEvent::parse("not json"), None);
    }

    #[test]
    fn test_sse_frame_round_trip() {
        let frame = ProgressEvent::Complete.to_sse_frame();
        assert_eq!(frame, "data: {\"event\":\"complete\"}\n\n");
        let line = frame.lines().next().unwrap();
        assert!(parse_sse_line(line).unwrap().is_complete());
        assert_eq!(parse_sse_line(": heartbeat"), None);
    }
}

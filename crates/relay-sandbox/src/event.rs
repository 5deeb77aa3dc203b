//! Wire shapes for upstream events and tool results.
//!
//! Events arrive from the upstream workflows service in both stream modes
//! with the same shape; results are emitted as callback payloads (pull mode)
//! or NDJSON lines (push mode). Unknown fields are ignored at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An event delivered by the upstream workflows service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEvent {
    /// Event identifier, unique per stream.
    pub id: String,
    /// Upstream creation timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<DateTime<Utc>>,
    /// Callback identifier for pull-mode result delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<String>,
    /// The tool call to execute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
}

/// A tool call wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// The function to invoke.
    pub function: ToolFunction,
}

/// The function name and arguments of a tool call.
///
/// `arguments` is either a JSON object or a JSON-encoded string; the
/// dispatcher accepts both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunction {
    /// Tool name (`READ_FILE`, `UPDATE_FILE`, `RUN_COMMAND`).
    pub name: String,
    /// Arguments as an object or a JSON string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// Reference to the tool that produced a result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRef {
    /// Tool name as received.
    pub name: String,
}

/// Error body attached to a failed tool invocation.
///
/// A tool error is a result, not a transport failure: cursors advance and
/// callbacks are posted either way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolErrorBody {
    /// Stable error message (`path_escape`, `not_found`, `timeout`, ...).
    pub message: String,
}

/// The per-event result record emitted on both stream modes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultRecord {
    /// The event this result answers.
    pub event_id: String,
    /// Upstream creation timestamp, echoed when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<DateTime<Utc>>,
    /// The tool that ran.
    pub tool: ToolRef,
    /// The arguments the tool ran with.
    pub args: Value,
    /// Tool output on success, `null` on error.
    pub result: Option<Value>,
    /// Error body on failure, `null` on success.
    pub error: Option<ToolErrorBody>,
    /// When the result was produced.
    pub timestamp: DateTime<Utc>,
}

impl ToolResultRecord {
    /// Builds the callback payload for this record.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_accepts_object_arguments() {
        let event: ToolEvent = serde_json::from_value(json!({
            "id": "1",
            "create_time": "2024-06-01T00:00:00Z",
            "callback_id": "cb-1",
            "tool_call": {
                "function": {"name": "READ_FILE", "arguments": {"filepath": "a.txt"}}
            }
        }))
        .expect("deserialize");

        let call = event.tool_call.expect("tool_call");
        assert_eq!(call.function.name, "READ_FILE");
        assert!(call.function.arguments.expect("args").is_object());
    }

    #[test]
    fn event_accepts_string_arguments() {
        let event: ToolEvent = serde_json::from_value(json!({
            "id": "2",
            "tool_call": {
                "function": {"name": "RUN_COMMAND", "arguments": "{\"command\":\"ls\"}"}
            }
        }))
        .expect("deserialize");

        let call = event.tool_call.expect("tool_call");
        assert!(call.function.arguments.expect("args").is_string());
    }

    #[test]
    fn event_ignores_unknown_fields() {
        let event: ToolEvent = serde_json::from_value(json!({
            "id": "3",
            "unexpected": {"nested": true}
        }))
        .expect("deserialize");
        assert!(event.tool_call.is_none());
    }

    #[test]
    fn result_record_serializes_null_error() {
        let record = ToolResultRecord {
            event_id: "1".into(),
            create_time: None,
            tool: ToolRef {
                name: "READ_FILE".into(),
            },
            args: json!({}),
            result: Some(json!({"ok": true})),
            error: None,
            timestamp: Utc::now(),
        };

        let payload = record.to_payload();
        assert_eq!(payload["event_id"], "1");
        assert!(payload["error"].is_null());
        assert_eq!(payload["result"]["ok"], true);
    }
}

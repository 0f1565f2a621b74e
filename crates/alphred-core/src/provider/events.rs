//! Canonical provider event stream shapes and raw-event normalisation.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::failure::ProviderError;

/// Canonical event types emitted by a provider run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderEventType {
    System,
    Assistant,
    ToolUse,
    ToolResult,
    Usage,
    Result,
}

impl fmt::Display for ProviderEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::System => "system",
            Self::Assistant => "assistant",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
            Self::Usage => "usage",
            Self::Result => "result",
        };
        f.write_str(s)
    }
}

impl FromStr for ProviderEventType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "assistant" => Ok(Self::Assistant),
            "tool_use" => Ok(Self::ToolUse),
            "tool_result" => Ok(Self::ToolResult),
            "usage" => Ok(Self::Usage),
            "result" => Ok(Self::Result),
            _ => Err(()),
        }
    }
}

/// One canonical event of a provider run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEvent {
    #[serde(rename = "type")]
    pub event_type: ProviderEventType,
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

impl ProviderEvent {
    /// Build an event stamped with the current time.
    pub fn new(event_type: ProviderEventType, content: impl Into<String>) -> Self {
        Self {
            event_type,
            content: content.into(),
            timestamp: Utc::now().timestamp_millis(),
            metadata: None,
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The tool-use id carried in the metadata, for deduplication.
    pub fn tool_use_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("toolUseId"))
            .and_then(|v| v.as_str())
    }
}

/// Map one raw SDK event (a JSON object with a `type` discriminator) into
/// the canonical shape.
///
/// Unknown or missing event types fail the run with an `invalid_event`
/// error carrying the event index and offending field path; adapters do
/// not silently drop what they cannot understand.
pub fn normalize_raw_event(
    event_index: usize,
    raw: &JsonValue,
) -> Result<ProviderEvent, ProviderError> {
    let type_field = raw
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ProviderError::invalid_event(event_index, "type"))?;

    let event_type: ProviderEventType = type_field
        .parse()
        .map_err(|_| ProviderError::invalid_event(event_index, "type"))?;

    // Content lives under event-specific keys in the SDK shapes.
    let content = raw
        .get("content")
        .or_else(|| raw.get("result"))
        .or_else(|| raw.get("text"))
        .or_else(|| raw.get("message"))
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    let timestamp = raw
        .get("timestamp")
        .and_then(|t| t.as_i64())
        .unwrap_or_else(|| Utc::now().timestamp_millis());

    Ok(ProviderEvent {
        event_type,
        content,
        timestamp,
        metadata: raw.get("metadata").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_known_types() {
        for (raw_type, expected) in [
            ("system", ProviderEventType::System),
            ("assistant", ProviderEventType::Assistant),
            ("tool_use", ProviderEventType::ToolUse),
            ("tool_result", ProviderEventType::ToolResult),
            ("usage", ProviderEventType::Usage),
            ("result", ProviderEventType::Result),
        ] {
            let raw = json!({"type": raw_type, "content": "hello"});
            let event = normalize_raw_event(0, &raw).expect("should normalize");
            assert_eq!(event.event_type, expected);
            assert_eq!(event.content, "hello");
        }
    }

    #[test]
    fn normalize_result_content_key() {
        let raw = json!({"type": "result", "result": "final answer"});
        let event = normalize_raw_event(3, &raw).unwrap();
        assert_eq!(event.event_type, ProviderEventType::Result);
        assert_eq!(event.content, "final answer");
    }

    #[test]
    fn normalize_preserves_metadata() {
        let raw = json!({
            "type": "tool_use",
            "content": "",
            "metadata": {"toolUseId": "tu_1", "name": "Bash"}
        });
        let event = normalize_raw_event(0, &raw).unwrap();
        assert_eq!(event.tool_use_id(), Some("tu_1"));
    }

    #[test]
    fn normalize_unknown_type_fails() {
        let raw = json!({"type": "telemetry", "content": "x"});
        let err = normalize_raw_event(7, &raw).unwrap_err();
        assert_eq!(err.kind, super::super::failure::FailureKind::InvalidEvent);
        assert!(err.message.contains("index 7"));
        assert!(err.message.contains("type"));
        assert!(!err.retryable());
    }

    #[test]
    fn normalize_missing_type_fails() {
        let raw = json!({"content": "x"});
        let err = normalize_raw_event(0, &raw).unwrap_err();
        assert_eq!(err.kind, super::super::failure::FailureKind::InvalidEvent);
    }

    #[test]
    fn event_type_display_roundtrip() {
        let variants = [
            ProviderEventType::System,
            ProviderEventType::Assistant,
            ProviderEventType::ToolUse,
            ProviderEventType::ToolResult,
            ProviderEventType::Usage,
            ProviderEventType::Result,
        ];
        for v in &variants {
            let parsed: ProviderEventType = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }
}
